//! The diagnostic log channel: a tracing layer renders each event to one
//! text line and offers it to a bounded broadcast; websocket clients stream
//! the lines. Slow clients lag and lose lines, the producer never blocks.

use std::sync::LazyLock;

use axum::{
    extract::{
        ws::{
            Message,
            WebSocket,
            WebSocketUpgrade,
        },
        State,
    },
    response::Response,
};
use cmd_util::env::env_config;
use tokio::sync::broadcast;
use tracing::{
    field::{
        Field,
        Visit,
    },
    Event,
    Subscriber,
};
use tracing_subscriber::layer::{
    Context,
    Layer,
};

use crate::AppState;

static LOG_BACKLOG: LazyLock<usize> = LazyLock::new(|| env_config("DBC_LOG_BACKLOG", 1024));

#[derive(Clone)]
pub struct LogChannel {
    tx: broadcast::Sender<String>,
}

impl LogChannel {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(*LOG_BACKLOG);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }

    fn publish(&self, line: String) {
        // Fails only when nobody is connected, which is fine.
        let _ = self.tx.send(line);
    }
}

/// Renders events as single text lines into a [`LogChannel`].
pub struct BroadcastLayer {
    channel: LogChannel,
}

impl BroadcastLayer {
    pub fn new(channel: LogChannel) -> Self {
        Self { channel }
    }
}

impl<S: Subscriber> Layer<S> for BroadcastLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = LineVisitor::default();
        event.record(&mut visitor);
        let meta = event.metadata();
        let line = format!(
            "{} {:>5} {}: {}",
            chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ"),
            meta.level(),
            meta.target(),
            visitor.line,
        );
        self.channel.publish(line);
    }
}

#[derive(Default)]
struct LineVisitor {
    line: String,
}

impl Visit for LineVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        use std::fmt::Write as _;
        if field.name() == "message" {
            let message = format!("{value:?}");
            if self.line.is_empty() {
                self.line = message;
            } else {
                let _ = write!(self.line, " {message}");
            }
        } else {
            let _ = write!(
                self.line,
                "{}{}={value:?}",
                if self.line.is_empty() { "" } else { " " },
                field.name()
            );
        }
    }
}

pub async fn ws_logs(State(st): State<AppState>, ws: WebSocketUpgrade) -> Response {
    let rx = st.logs.subscribe();
    ws.on_upgrade(move |socket| run_log_socket(socket, rx))
}

async fn run_log_socket(mut socket: WebSocket, mut rx: broadcast::Receiver<String>) {
    loop {
        tokio::select! {
            incoming = socket.recv() => match incoming {
                None | Some(Err(_)) | Some(Ok(Message::Close(_))) => break,
                // Pings are answered by axum; anything else is ignored.
                Some(Ok(_)) => {},
            },
            line = rx.recv() => match line {
                Ok(line) => {
                    if socket.send(Message::Text(line.into())).await.is_err() {
                        break;
                    }
                },
                // This client fell behind the backlog; the missed lines are
                // gone, keep streaming from here.
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::debug!("log client lagged, dropped {missed} line(s)");
                },
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}

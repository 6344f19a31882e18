//! Runs a connection's password command and captures its output.
//!
//! The command line executes under `sh -c` with the gateway's environment,
//! no stdin, and both pipes captured. The child is fully supervised: a hard
//! time budget, an output cap, and `kill_on_drop` so an abandoned resolver
//! is signalled rather than orphaned. Results are never cached here; the
//! registry caches resolved passwords for the lifetime of the credentials.

use std::{
    process::Stdio,
    sync::LazyLock,
    time::Duration,
};

use cmd_util::env::env_config;
use errors::ErrorMetadata;
use tokio::process::Command;

static PASSWORD_TIMEOUT: LazyLock<Duration> = LazyLock::new(|| {
    Duration::from_secs(env_config("DBC_PASSWORD_TIMEOUT_SECONDS", 10))
});

/// Password commands print a secret, not a document.
const MAX_STDOUT_BYTES: usize = 64 << 10;

/// How much trailing stderr to carry into the error message.
const STDERR_TAIL_BYTES: usize = 512;

pub async fn resolve_command(command: &str) -> anyhow::Result<Vec<u8>> {
    resolve_command_with_timeout(command, *PASSWORD_TIMEOUT).await
}

pub(crate) async fn resolve_command_with_timeout(
    command: &str,
    budget: Duration,
) -> anyhow::Result<Vec<u8>> {
    let child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| {
            ErrorMetadata::auth_failure(
                "PasswordResolverFailed",
                format!("couldn't spawn password command: {e}"),
            )
        })?;

    let output = tokio::time::timeout(budget, child.wait_with_output())
        .await
        .map_err(|_| {
            ErrorMetadata::auth_failure(
                "PasswordResolverTimeout",
                format!("password command didn't finish within {budget:?}"),
            )
        })??;

    if !output.status.success() {
        let tail_start = output.stderr.len().saturating_sub(STDERR_TAIL_BYTES);
        let stderr_tail = String::from_utf8_lossy(&output.stderr[tail_start..]).into_owned();
        anyhow::bail!(ErrorMetadata::auth_failure(
            "PasswordResolverFailed",
            format!(
                "password command exited with {}: {}",
                output
                    .status
                    .code()
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "signal".to_string()),
                stderr_tail.trim_end()
            ),
        ));
    }
    if output.stdout.len() > MAX_STDOUT_BYTES {
        anyhow::bail!(ErrorMetadata::auth_failure(
            "PasswordResolverFailed",
            format!(
                "password command produced {} bytes of output (max {})",
                output.stdout.len(),
                MAX_STDOUT_BYTES
            ),
        ));
    }

    let mut password = output.stdout;
    if password.last() == Some(&b'\n') {
        password.pop();
        if password.last() == Some(&b'\r') {
            password.pop();
        }
    }
    Ok(password)
}

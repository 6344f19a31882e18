use std::time::Duration;

use axum::{
    routing::{
        get,
        post,
    },
    Router,
};
use http::Method;
use tower_http::cors::{
    AllowHeaders,
    AllowOrigin,
    CorsLayer,
};

use crate::{
    catalog,
    config_endpoints,
    logs,
    query,
    AppState,
};

pub fn router(st: AppState) -> Router {
    let db_routes = Router::new()
        .route("/databases", get(catalog::list_databases))
        .route("/schemas", get(catalog::list_schemas))
        .route("/schemas/{schema}/tables", get(catalog::list_tables))
        .route(
            "/schemas/{schema}/tables/{table}/columns",
            get(catalog::list_columns),
        )
        .route("/ddl/schemas/{schema}/{kind}/{name}", get(catalog::ddl));

    Router::new()
        .route(
            "/config",
            get(config_endpoints::get_config).put(config_endpoints::put_config),
        )
        .route("/connections/{name}", get(config_endpoints::connection_info))
        .nest("/db", db_routes)
        .route("/prepare", post(query::prepare))
        .route("/query", post(query::query))
        .route("/ws/logs", get(logs::ws_logs))
        .layer(cors())
        .with_state(st)
}

/// The editor UI runs on its own origin during development; mirror whatever
/// it sends.
fn cors() -> CorsLayer {
    CorsLayer::new()
        .allow_headers(AllowHeaders::mirror_request())
        .allow_methods(vec![Method::GET, Method::POST, Method::PUT, Method::OPTIONS])
        .allow_origin(AllowOrigin::mirror_request())
        .max_age(Duration::from_secs(86400))
}

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    Router,
    extract::{Query, State, WebSocketUpgrade},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use uuid::Uuid;

use lark_gateway::connection;
use lark_gateway::dispatcher::Dispatcher;

#[derive(Clone)]
struct ServerState {
    db: Arc<lark_db::Database>,
    dispatcher: Dispatcher,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "lark=debug,tower_http=debug".into()),
        )
        .init();

    // Config
    let db_path = std::env::var("LARK_DB_PATH").unwrap_or_else(|_| "lark.db".into());
    let host = std::env::var("LARK_HOST").unwrap_or_else(|_| "0.0.0.0".into());
    let port: u16 = std::env::var("LARK_PORT")
        .unwrap_or_else(|_| "3000".into())
        .parse()?;

    // Init database
    let db = Arc::new(lark_db::Database::open(&PathBuf::from(&db_path))?);

    // Shared state
    let state = ServerState {
        db,
        dispatcher: Dispatcher::new(),
    };

    let app = Router::new()
        .route("/ws/chat", get(ws_upgrade))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    info!("Lark chat gateway listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// The handshake carries the caller's identity as a query parameter —
/// treated as pre-authenticated transport data, rejected when absent.
#[derive(Debug, Deserialize)]
struct ConnectParams {
    id: Option<Uuid>,
}

async fn ws_upgrade(
    State(state): State<ServerState>,
    Query(params): Query<ConnectParams>,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(user_id) = params.id else {
        return (StatusCode::UNAUTHORIZED, "User ID is required").into_response();
    };

    ws.on_upgrade(move |socket| {
        connection::handle_connection(socket, state.dispatcher, state.db, user_id)
    })
    .into_response()
}

use std::{net::SocketAddr, sync::Arc};

use axum::{
    routing::{get, patch, post},
    Router,
};
use chat_api::ApiContext;
use presence::{MemoryPresence, PresenceStore};
use storage::Storage;
use tracing::{error, info};

mod config;
mod rooms;
mod routes;
mod ws;

use config::{load_settings, prepare_database_url};
use rooms::RoomRegistry;

#[derive(Clone)]
pub struct AppState {
    pub api: ApiContext,
    pub rooms: RoomRegistry,
    pub presence: Arc<dyn PresenceStore>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let settings = load_settings();
    let database_url = prepare_database_url(&settings.database_url)?;
    let storage = Storage::new(&database_url).await.map_err(|error| {
        error!(
            %database_url,
            %error,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        error
    })?;

    let state = AppState {
        api: ApiContext { storage },
        rooms: RoomRegistry::new(),
        presence: Arc::new(MemoryPresence::new()),
    };
    let app = build_router(Arc::new(state));

    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(%addr, "server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(routes::healthz))
        .route("/login", post(routes::login))
        .route("/rooms", post(routes::create_room))
        .route("/rooms/:room_id/join", post(routes::join_room))
        .route("/rooms/:room_id/members", post(routes::set_member_role))
        .route("/conversations/open", post(routes::open_conversation))
        .route(
            "/rooms/:room_id/messages",
            get(routes::list_messages).post(routes::post_message),
        )
        .route("/rooms/:room_id/unread", get(routes::unread_count))
        .route(
            "/messages/:message_id",
            patch(routes::edit_message).delete(routes::delete_message),
        )
        .route(
            "/messages/:message_id/delete-for-me",
            post(routes::delete_for_me),
        )
        .route("/messages/:message_id/forward", post(routes::forward_message))
        .route("/messages/:message_id/react", post(routes::react))
        .route("/messages/:message_id/info", get(routes::message_info))
        .route("/ws/rooms/:room_id", get(ws::room_socket))
        .with_state(state)
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;

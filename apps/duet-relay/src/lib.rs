//! WebSocket relay for duet participants.
//!
//! Each socket speaks the `transport_bus::wire` frames and maps onto one
//! session of an embedded [`LocalBroker`], so retained snapshots and last
//! wills behave the same over the network as they do in-process.

use std::net::SocketAddr;

use axum::{routing::get, Router};
use tokio::net::TcpListener;
use tracing::info;
use transport_bus::LocalBroker;

pub mod config;
pub mod telemetry;
pub mod websocket;

use websocket::{websocket_handler, RelayState};

pub fn router(state: RelayState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ws", get(websocket_handler))
        .with_state(state)
}

async fn health_check() -> &'static str {
    "ok"
}

/// Serves the relay on an already bound listener until the process ends.
pub async fn serve(listener: TcpListener, broker: LocalBroker) -> std::io::Result<()> {
    let local: SocketAddr = listener.local_addr()?;
    info!(target = "relay", %local, "relay listening");
    axum::serve(listener, router(RelayState::new(broker))).await
}

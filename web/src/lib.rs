//! Demo HTTP application serving beacon-tracked event streams.

use log::*;
use service::config::Config;
use sse::{StreamOptions, Streams};
use std::sync::Arc;
use store::Writable;

mod controller;
mod error;
pub mod router;

pub use controller::room_controller::RoomMember;
pub use error::{Error, Result};

/// Shared state handed to every route.
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub streams: Arc<Streams>,
    pub room: Writable<Vec<RoomMember>>,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            streams: Arc::new(Streams::new()),
            room: Writable::new(Vec::new()),
        }
    }

    /// Stream settings derived from configuration, used by every stream route.
    pub fn stream_options(&self) -> StreamOptions {
        StreamOptions::default()
            .timeout(self.config.sse_beacon_timeout())
            .keep_alive(self.config.sse_keep_alive())
    }
}

pub async fn init_server(app_state: AppState) -> Result<()> {
    let address = app_state.config.listen_address();
    let listener = tokio::net::TcpListener::bind(&address).await?;

    info!(
        "Server starting... listening for connections on http://{} ({})",
        address,
        app_state.config.runtime_env()
    );

    axum::serve(listener, router::define_routes(app_state)).await?;
    Ok(())
}

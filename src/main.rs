use log::*;
use service::{config::Config, logging::Logger};
use web::AppState;

#[tokio::main]
async fn main() {
    let config = Config::new();
    Logger::init_logger(&config);

    info!(
        "Starting up beacon_sse (beacon timeout {:?}, keep-alive {:?})",
        config.sse_beacon_timeout(),
        config.sse_keep_alive()
    );

    let app_state = AppState::new(config);
    if let Err(e) = web::init_server(app_state).await {
        error!("Server stopped: {e}");
        std::process::exit(1);
    }
}

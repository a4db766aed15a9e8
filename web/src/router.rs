use crate::controller::{health_check_controller, room_controller, stream_controller};
use crate::AppState;
use axum::http::header::{ACCEPT, CONTENT_TYPE};
use axum::http::{HeaderName, HeaderValue, Method};
use axum::{
    routing::{get, post},
    Router,
};
use log::*;
use sse::beacon::SSE_ID_HEADER;
use tower_http::cors::CorsLayer;

pub fn define_routes(app_state: AppState) -> Router {
    let cors = cors_layer(&app_state.config.allowed_origins);

    Router::new()
        .merge(health_routes())
        .merge(stream_routes(app_state.clone()))
        .merge(room_routes(app_state))
        .layer(cors)
}

fn health_routes() -> Router {
    Router::new().route("/health", get(health_check_controller::health_check))
}

fn stream_routes(app_state: AppState) -> Router {
    Router::new()
        .route(
            "/events",
            get(stream_controller::cat_quotes).post(stream_controller::cat_quotes),
        )
        .route(
            "/custom-event",
            get(stream_controller::custom_event).post(stream_controller::custom_event),
        )
        .with_state(app_state)
}

fn room_routes(app_state: AppState) -> Router {
    Router::new()
        .route("/room", post(room_controller::join))
        .with_state(app_state)
}

/// Browsers only let scripts read `x-sse-id` when it is exposed, and the
/// client cannot beacon without it.
fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("Ignoring invalid CORS origin: {}", origin);
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([
            ACCEPT,
            CONTENT_TYPE,
            HeaderName::from_static("last-event-id"),
        ])
        .expose_headers([HeaderName::from_static(SSE_ID_HEADER)])
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use clap::Parser;
    use service::config::Config;
    use tower::ServiceExt;

    fn app() -> Router {
        let config = Config::parse_from(["beacon_sse"]);
        define_routes(AppState::new(config))
    }

    #[tokio::test]
    async fn test_health_check() {
        let response = app()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], b"healthy");
    }

    #[tokio::test]
    async fn test_cors_exposes_stream_id_header() {
        let response = app()
            .oneshot(
                Request::get("/health")
                    .header("origin", "http://localhost:3000")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(
            response.headers()["access-control-allow-origin"],
            "http://localhost:3000"
        );
        assert_eq!(response.headers()["access-control-expose-headers"], "x-sse-id");
    }

    #[tokio::test]
    async fn test_unlisted_origin_gets_no_cors_headers() {
        let response = app()
            .oneshot(
                Request::get("/health")
                    .header("origin", "http://evil.example")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert!(response
            .headers()
            .get("access-control-allow-origin")
            .is_none());
    }
}

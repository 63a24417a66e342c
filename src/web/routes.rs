use axum::{
    http::HeaderValue,
    routing::{any, get, post},
    Router,
};
use std::path::Path;
use std::sync::Arc;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};

use super::handlers;
use super::static_files::static_file_router;
use super::ws::ws_handler;
use crate::config::WebConfig;
use crate::state::AppState;

/// Create the main application router
pub fn create_router(state: Arc<AppState>) -> Router {
    let web = state.config.get().web.clone();
    let cors = cors_layer(&web);

    let signaling_routes = Router::new()
        .route("/broadcast", post(handlers::broadcast))
        .route("/broadcast/:stream_id", post(handlers::broadcast))
        .route("/consumer", post(handlers::consumer))
        .route("/consumer/:stream_id", post(handlers::consumer))
        .route("/generate-stream-id", post(handlers::generate_stream_id))
        .route("/ice-candidate", post(handlers::ice_candidate))
        .route("/ice-candidate/:stream_id", post(handlers::ice_candidate))
        .route("/session/:session_id/close", post(handlers::close_session))
        // WebSocket push channel
        .route("/ws", any(ws_handler));

    let status_routes = Router::new()
        .route("/health", get(handlers::health_check))
        .route("/streams", get(handlers::list_streams));

    let mut router = Router::new()
        .merge(signaling_routes)
        .merge(status_routes);

    // Frontend build, if configured
    if let Some(dir) = web.static_dir.as_deref().filter(|d| !d.is_empty()) {
        router = router.merge(static_file_router::<Arc<AppState>>(Path::new(dir)));
    }

    router
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// CORS: any origin unless an allow-list is configured
fn cors_layer(web: &WebConfig) -> CorsLayer {
    let origins: Vec<HeaderValue> = web
        .allowed_origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!("Ignoring invalid CORS origin: {}", origin);
                None
            }
        })
        .collect();

    let allow_origin = if web.allowed_origins.is_empty() {
        AllowOrigin::from(Any)
    } else {
        if origins.is_empty() {
            tracing::warn!("No valid CORS origin configured, cross-origin requests are refused");
        }
        AllowOrigin::list(origins)
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods(Any)
        .allow_headers(Any)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AppConfig, ConfigStore};
    use crate::relay::testing::MockEngine;
    use crate::relay::{CoordinatorSettings, NegotiationCoordinator, StreamRegistry};
    use axum::body::Body;
    use axum::http::{header, Request};
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt;

    fn router_with_origins(origins: &[&str]) -> Router {
        let mut config = AppConfig::default();
        config.web.allowed_origins = origins.iter().map(|o| o.to_string()).collect();

        let coordinator = NegotiationCoordinator::new(
            Arc::new(MockEngine::new()),
            StreamRegistry::new(config.relay.candidate_capacity),
            CoordinatorSettings::from(&config),
        );
        create_router(AppState::new(
            ConfigStore::in_memory(config),
            coordinator,
            CancellationToken::new(),
        ))
    }

    async fn allowed_origin(router: Router, origin: &str) -> Option<HeaderValue> {
        let request = Request::get("/health")
            .header(header::ORIGIN, origin)
            .body(Body::empty())
            .unwrap();
        let response = router.oneshot(request).await.unwrap();
        response
            .headers()
            .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
            .cloned()
    }

    #[tokio::test]
    async fn test_cors_open_without_allow_list() {
        let origin = allowed_origin(router_with_origins(&[]), "http://anywhere.test").await;
        assert_eq!(origin, Some(HeaderValue::from_static("*")));
    }

    #[tokio::test]
    async fn test_cors_echoes_listed_origin() {
        let router = router_with_origins(&["http://app.test"]);
        let origin = allowed_origin(router.clone(), "http://app.test").await;
        assert_eq!(origin, Some(HeaderValue::from_static("http://app.test")));

        assert!(allowed_origin(router, "http://other.test").await.is_none());
    }

    #[tokio::test]
    async fn test_cors_refuses_all_when_every_origin_is_invalid() {
        let router = router_with_origins(&["bad\norigin"]);
        assert!(allowed_origin(router, "http://anywhere.test").await.is_none());
    }
}

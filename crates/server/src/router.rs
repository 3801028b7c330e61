//! HTTP router construction.

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;

use crate::api;
use crate::state::AppState;

/// Assemble all routes and middleware into the application router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(api::root))
        .route("/health", get(api::health))
        .route("/ingest", post(api::ingest))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use rohrpost_core::INGESTION_QUEUE;
    use rohrpost_queue::MemoryBroker;

    fn app(broker: &MemoryBroker) -> Router {
        build_router(Arc::new(AppState::new(Arc::new(broker.clone()))))
    }

    fn ingest_request(body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/ingest")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn post_ingest_returns_202_with_data_id() {
        let broker = MemoryBroker::new();
        let response = app(&broker)
            .oneshot(ingest_request(json!({
                "data": {"x": 1},
                "source": "test",
                "timestamp": "2024-01-01T00:00:00Z"
            })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["message"], "Data accepted for processing");
        assert!(body["data_id"].is_string());
        assert_eq!(broker.depth(INGESTION_QUEUE), 1);
    }

    #[tokio::test]
    async fn post_ingest_returns_503_when_broker_down() {
        let broker = MemoryBroker::new();
        broker.set_available(false);
        let response = app(&broker)
            .oneshot(ingest_request(json!({
                "data": {},
                "source": "test",
                "timestamp": "2024-01-01T00:00:00Z"
            })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(broker.depth(INGESTION_QUEUE), 0);
    }

    #[tokio::test]
    async fn post_ingest_rejects_structurally_invalid_body() {
        let broker = MemoryBroker::new();
        // `data` must be an object.
        let response = app(&broker)
            .oneshot(ingest_request(json!({
                "data": "not an object",
                "source": "test",
                "timestamp": "2024-01-01T00:00:00Z"
            })))
            .await
            .unwrap();

        assert!(response.status().is_client_error());
        assert_eq!(broker.depth(INGESTION_QUEUE), 0);
    }

    #[tokio::test]
    async fn get_root_is_alive() {
        let broker = MemoryBroker::new();
        let response = app(&broker)
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}

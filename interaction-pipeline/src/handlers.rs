use std::convert::Infallible;
use std::future::ready;

use axum::{
    body::Bytes, extract::DefaultBodyLimit, extract::State, http::StatusCode, routing, Json,
    Router,
};
use interaction_common::event::{EventProducer, InteractionRecord};
use interaction_common::health::HealthRegistry;
use interaction_common::metrics::track_metrics;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use tower::limit::ConcurrencyLimitLayer;
use tracing::{debug, warn};

pub fn app(
    producer: EventProducer,
    liveness: HealthRegistry,
    metrics: Option<PrometheusHandle>,
    max_body_size: usize,
    concurrency_limit: usize,
) -> Router {
    let router = Router::new()
        .route("/", routing::get(index))
        .route("/_readiness", routing::get(index))
        .route(
            "/_liveness",
            routing::get(move || ready(liveness.get_status())),
        )
        .route(
            "/interactions",
            routing::post(post_interaction)
                .with_state(producer)
                .layer::<_, Infallible>(ConcurrencyLimitLayer::new(concurrency_limit))
                .layer(DefaultBodyLimit::max(max_body_size)),
        );

    let router = match metrics {
        Some(recorder_handle) => router.route(
            "/metrics",
            routing::get(move || ready(recorder_handle.render())),
        ),
        None => router,
    };

    router.layer(axum::middleware::from_fn(track_metrics))
}

pub async fn index() -> &'static str {
    "interaction pipeline"
}

#[derive(Serialize, Deserialize, Debug)]
pub struct InteractionPostResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// Enqueue an interaction reported by one of the DNS or HTTP listeners.
pub async fn post_interaction(
    State(producer): State<EventProducer>,
    body: Bytes,
) -> Result<(StatusCode, Json<InteractionPostResponse>), (StatusCode, Json<InteractionPostResponse>)>
{
    let record: InteractionRecord =
        serde_json::from_slice(&body).map_err(|e| bad_request(format!("invalid json: {e}")))?;

    let callback = match &record {
        InteractionRecord::Dns(dns) => dns.callback.as_deref(),
        InteractionRecord::Http(http) => http.callback.as_deref(),
    };
    if record.user_id() <= 0 && callback.is_some_and(|url| !url.is_empty()) {
        return Err(bad_request(
            "a callback requires a positive user_id".to_owned(),
        ));
    }

    debug!(user_id = record.user_id(), kind = record.kind(), "received interaction");

    producer.send(record).await.map_err(|e| {
        warn!("rejecting interaction: {}", e);
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(InteractionPostResponse {
                error: Some(e.to_string()),
            }),
        )
    })?;

    Ok((
        StatusCode::ACCEPTED,
        Json(InteractionPostResponse { error: None }),
    ))
}

fn bad_request(error: String) -> (StatusCode, Json<InteractionPostResponse>) {
    debug!("bad request: {}", error);
    (
        StatusCode::BAD_REQUEST,
        Json(InteractionPostResponse { error: Some(error) }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::Request};
    use http_body_util::BodyExt; // for `collect`
    use interaction_common::event::{self, EventStream};
    use tower::ServiceExt; // for `oneshot`

    fn test_app() -> (Router, EventStream) {
        let (producer, stream) = event::channel(8);
        let app = app(producer, HealthRegistry::new("liveness"), None, 1_000_000, 10);
        (app, stream)
    }

    fn post(body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/interactions")
            .header("Content-Type", "application/json")
            .body(Body::from(body.to_owned()))
            .unwrap()
    }

    #[tokio::test]
    async fn index() {
        let (app, _stream) = test_app();

        let response = app
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"interaction pipeline");
    }

    #[tokio::test]
    async fn liveness_without_dispatcher_is_unhealthy() {
        let (app, _stream) = test_app();

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/_liveness")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn metrics_route_needs_a_recorder() {
        let (app, _stream) = test_app();

        let response = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn accepted_interaction_is_enqueued() {
        let (app, mut stream) = test_app();

        let response = app
            .oneshot(post(
                r#"{
                    "kind": "dns",
                    "user_id": 3,
                    "domain": "abc.oob.test",
                    "ip": "203.0.113.9",
                    "created_at": "2024-05-01T12:00:00Z",
                    "callback": "https://hooks.example.com/x"
                }"#,
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let record = stream.next().await.expect("record should be enqueued");
        assert_eq!(record.user_id(), 3);
        assert_eq!(record.callback_target(), Some("https://hooks.example.com/x"));
    }

    #[tokio::test]
    async fn invalid_json_is_rejected() {
        let (app, _stream) = test_app();

        let response = app
            .oneshot(post(r#"{"kind": "smtp", "user_id": 3}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let body: InteractionPostResponse = serde_json::from_slice(&body).unwrap();
        assert!(body.error.unwrap().starts_with("invalid json"));
    }

    #[tokio::test]
    async fn callback_without_owner_is_rejected() {
        let (app, _stream) = test_app();

        let response = app
            .oneshot(post(
                r#"{
                    "kind": "http",
                    "user_id": 0,
                    "url": "http://oob.test/abc",
                    "ip": "203.0.113.9",
                    "method": "GET",
                    "created_at": "2024-05-01T12:00:00Z",
                    "callback": "https://hooks.example.com/x"
                }"#,
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn closed_stream_is_unavailable() {
        let (app, stream) = test_app();
        drop(stream);

        let response = app
            .oneshot(post(
                r#"{
                    "kind": "dns",
                    "user_id": 3,
                    "domain": "abc.oob.test",
                    "ip": "203.0.113.9",
                    "created_at": "2024-05-01T12:00:00Z"
                }"#,
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}

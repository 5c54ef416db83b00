use axum::{extract::DefaultBodyLimit, routing, Router};
use tower::limit::ConcurrencyLimitLayer;

use attribution_common::pipeline::ConversionPipeline;

use super::{conversion, reporting, visit};

pub fn add_routes(
    router: Router,
    pipeline: ConversionPipeline,
    max_body_size: usize,
    concurrency_limit: usize,
) -> Router {
    let router = router
        .route("/", routing::get(index))
        .route("/_readiness", routing::get(index))
        .route("/_liveness", routing::get(index)); // No async loop, axum being up is enough

    let ingest = Router::new()
        .route("/visit", routing::post(visit::post_visit))
        .route("/conversion", routing::post(conversion::post_conversion))
        .layer(ConcurrencyLimitLayer::new(concurrency_limit))
        .layer(DefaultBodyLimit::max(max_body_size))
        .with_state(pipeline.clone());

    let operator = Router::new()
        .route("/orders/:order_id", routing::get(reporting::get_order))
        .route("/identities/:email_hash", routing::get(reporting::get_identity))
        .route(
            "/identities/matches/:visitor_id",
            routing::get(reporting::get_matches),
        )
        .route("/identities/merge", routing::post(reporting::post_merge))
        .route("/stats", routing::get(reporting::get_stats))
        .route("/queue/:id/cancel", routing::post(reporting::post_cancel))
        .with_state(pipeline);

    router.merge(ingest).merge(operator)
}

pub async fn index() -> &'static str {
    "attribution api"
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time;

    use attribution_common::capture::{CaptureConfig, TouchpointCapture};
    use attribution_common::cookie::{self, COOKIE_NAME};
    use attribution_common::delivery_log::{DedupConfig, DeliveryLog};
    use attribution_common::dispatcher::{Dispatcher, DispatcherConfig};
    use attribution_common::events::{EventBus, TracingEventHandler};
    use attribution_common::identity::{hash_email, IdentityResolver};
    use attribution_common::queue::RetryQueue;
    use attribution_common::retry::RetryPolicy;
    use attribution_common::store::{EventStore, MemoryStore};
    use attribution_common::touchpoint::DeviceType;
    use attribution_common::webhook::{build_http_client, WebhookDestination};
    use axum::{
        body::Body,
        http::{self, header, Request, StatusCode},
    };
    use http_body_util::BodyExt; // for `collect`
    use serde_json::{json, Value};
    use tower::ServiceExt; // for `call`, `oneshot`, and `ready`

    const MAX_BODY_SIZE: usize = 1_000_000;

    fn app(store: Arc<MemoryStore>) -> Router {
        let client = build_http_client(time::Duration::from_secs(1)).unwrap();
        let dispatcher = Dispatcher::new(
            vec![Arc::new(WebhookDestination::unconfigured("meta", client))],
            store.clone(),
            DeliveryLog::new(store.clone(), DedupConfig::default()),
            RetryQueue::new(store.clone(), RetryPolicy::default()),
            DispatcherConfig::default(),
        );
        let mut events = EventBus::new();
        events.subscribe(Arc::new(TracingEventHandler));

        let pipeline = ConversionPipeline::new(
            store.clone(),
            TouchpointCapture::new(store.clone(), CaptureConfig::default()),
            IdentityResolver::new(store),
            dispatcher,
            events,
        );

        add_routes(Router::new(), pipeline, MAX_BODY_SIZE, 10)
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method(http::Method::POST)
            .uri(uri)
            .header(http::header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn json_body(response: axum::response::Response) -> Value {
        let body = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn index() {
        let app = app(Arc::new(MemoryStore::new()));

        let response = app.oneshot(get("/")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"attribution api");
    }

    #[tokio::test]
    async fn visit_sets_touchpoint_cookie() {
        let app = app(Arc::new(MemoryStore::new()));

        let response = app
            .oneshot(post_json(
                "/visit",
                json!({
                    "visitor_id": "v1",
                    "url": "https://shop.example/?gclid=abc",
                    "user_agent": "Mozilla/5.0 (Windows NT 10.0)",
                }),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let set_cookie = response
            .headers()
            .get(header::SET_COOKIE)
            .unwrap()
            .to_str()
            .unwrap()
            .to_owned();
        assert!(set_cookie.starts_with(&format!("{COOKIE_NAME}=")));

        let body = json_body(response).await;
        assert_eq!(body["visitor_id"], "v1");
        assert_eq!(body["outcome"], "recorded");
        assert_eq!(cookie::decode(body["cookie"].as_str().unwrap()).len(), 1);
    }

    #[tokio::test]
    async fn visit_with_unreadable_body_still_succeeds() {
        let app = app(Arc::new(MemoryStore::new()));

        let response = app
            .oneshot(
                Request::builder()
                    .method(http::Method::POST)
                    .uri("/visit")
                    .body(Body::from("not json"))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert!(!body["visitor_id"].as_str().unwrap().is_empty());
    }

    #[tokio::test]
    async fn conversion_then_order_view() {
        let store = Arc::new(MemoryStore::new());
        let app = app(store.clone());

        let response = app
            .clone()
            .oneshot(post_json(
                "/visit",
                json!({
                    "visitor_id": "v1",
                    "consent": "full",
                    "url": "https://shop.example/?utm_source=newsletter&utm_medium=email",
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .clone()
            .oneshot(post_json(
                "/conversion",
                json!({
                    "order_id": 1001,
                    "visitor_id": "v1",
                    "email": "buyer@example.com",
                    "total": 99.5,
                    "currency": "EUR",
                    "consent": "full",
                }),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let report = json_body(response).await;
        assert_eq!(report["touchpoint_count"], 1);
        assert_eq!(report["outcomes"]["meta"]["outcome"], "skipped");
        assert_eq!(report["outcomes"]["meta"]["reason"], "not_configured");

        let response = app.clone().oneshot(get("/orders/1001")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let view = json_body(response).await;
        assert_eq!(view["order_id"], 1001);
        assert_eq!(view["touchpoints"].as_array().unwrap().len(), 1);

        let email_hash = hash_email("buyer@example.com");
        let response = app
            .oneshot(get(&format!("/identities/{email_hash}")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let summary = json_body(response).await;
        assert_eq!(summary["visitor_count"], 1);
        assert_eq!(summary["visitor_ids"], json!(["v1"]));
    }

    #[tokio::test]
    async fn unknown_order_is_not_found() {
        let app = app(Arc::new(MemoryStore::new()));

        let response = app.oneshot(get("/orders/404")).await.unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn conversion_with_missing_fields_is_rejected() {
        let app = app(Arc::new(MemoryStore::new()));

        let response = app
            .oneshot(post_json("/conversion", json!({"order_id": 1})))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn merge_requires_identified_primary() {
        let store = Arc::new(MemoryStore::new());
        let app = app(store.clone());

        let response = app
            .clone()
            .oneshot(post_json(
                "/identities/merge",
                json!({"primary": "v1", "secondary": "v2"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(store.edges_for_visitor("v2").await.unwrap().is_empty());

        IdentityResolver::new(store.clone())
            .link_visitor_to_email("v1", "email", DeviceType::Desktop)
            .await
            .unwrap();

        let response = app
            .oneshot(post_json(
                "/identities/merge",
                json!({"primary": "v1", "secondary": "v2"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let edge = json_body(response).await;
        assert_eq!(edge["visitor_id"], "v2");
        assert_eq!(edge["email_hash"], "email");
    }

    #[tokio::test]
    async fn matches_for_unknown_visitor_are_empty() {
        let app = app(Arc::new(MemoryStore::new()));

        let response = app.oneshot(get("/identities/matches/v9")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await, json!([]));
    }

    #[tokio::test]
    async fn cancel_and_stats() {
        let store = Arc::new(MemoryStore::new());
        let app = app(store.clone());
        let queue = RetryQueue::new(store.clone(), RetryPolicy::default());
        let item = queue
            .enqueue(5, "meta", "purchase", json!({}), "boom")
            .await
            .unwrap();

        let response = app
            .clone()
            .oneshot(post_json(&format!("/queue/{}/cancel", item.id), json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["status"], "cancelled");

        let response = app
            .clone()
            .oneshot(post_json(&format!("/queue/{}/cancel", item.id), json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let response = app
            .clone()
            .oneshot(post_json("/queue/999/cancel", json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app.oneshot(get("/stats")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let stats = json_body(response).await;
        assert_eq!(stats["queue"]["meta"]["cancelled"], 1);
    }
}

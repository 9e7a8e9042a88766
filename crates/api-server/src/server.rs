//! API server: route table, middleware and the metrics exporter.

use std::net::SocketAddr;

use axum::routing::{get, post, put};
use axum::Router;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use campaign_core::config::AppConfig;

use crate::channel_rest;
use crate::rest::{self, AppState};

/// Build the HTTP router over `state`.
pub fn router(state: AppState) -> Router {
    Router::new()
        // Campaigns
        .route(
            "/v1/campaigns",
            post(rest::create_campaign).get(rest::list_campaigns),
        )
        .route("/v1/campaigns/:id", get(rest::get_campaign))
        .route("/v1/campaigns/:id/steps", put(rest::set_steps))
        .route("/v1/campaigns/:id/start", post(rest::start_campaign))
        .route("/v1/campaigns/:id/pause", post(rest::pause_campaign))
        .route("/v1/campaigns/:id/resume", post(rest::resume_campaign))
        .route("/v1/campaigns/:id/complete", post(rest::complete_campaign))
        .route("/v1/campaigns/:id/stats", get(rest::campaign_stats))
        .route("/v1/campaigns/:id/tasks", get(rest::campaign_tasks))
        .route("/v1/campaigns/:id/ledger/export", get(rest::export_ledger))
        // Providers
        .route("/v1/providers", get(channel_rest::list_providers))
        .route("/v1/providers/:id/usage", get(channel_rest::provider_usage))
        .route(
            "/v1/providers/:id/health-check",
            post(channel_rest::check_provider_health),
        )
        .route(
            "/v1/providers/:id/reset-usage",
            post(channel_rest::reset_provider_usage),
        )
        // Vendor webhooks
        .route("/webhook/:channel", post(channel_rest::handle_webhook))
        // Operational endpoints
        .route("/health", get(rest::health_check))
        .route("/ready", get(rest::readiness))
        .route("/live", get(rest::liveness))
        // Middleware
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub struct ApiServer {
    config: AppConfig,
    state: AppState,
}

impl ApiServer {
    pub fn new(config: AppConfig, state: AppState) -> Self {
        Self { config, state }
    }

    /// Serve the HTTP API until the listener fails.
    pub async fn start_http(&self) -> anyhow::Result<()> {
        let app = router(self.state.clone());
        let addr = SocketAddr::new(self.config.api.host.parse()?, self.config.api.http_port);

        info!(addr = %addr, "Starting HTTP server");

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, app).await?;
        Ok(())
    }

    /// Start the Prometheus exporter on its own port.
    pub fn start_metrics(&self) -> anyhow::Result<()> {
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(SocketAddr::new(
                self.config.api.host.parse()?,
                self.config.metrics.port,
            ))
            .install()?;

        info!(port = self.config.metrics.port, "Metrics exporter started");
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Instant;

    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use chrono::Utc;
    use serde_json::{json, Value};
    use tower::ServiceExt;
    use uuid::Uuid;

    use campaign_channels::{
        AdapterSet, HealthChecker, MemoryUsageCounter, ProviderRegistry, SimulatedTransport,
    };
    use campaign_core::clock::ManualClock;
    use campaign_core::event_bus::noop_sink;
    use campaign_core::providers::{ProviderCredentials, ProviderSettings, Secret};
    use campaign_core::types::Recipient;
    use campaign_ledger::{MemoryLedger, WebhookReconciler};
    use campaign_orchestrator::{MemoryAudience, MemoryCampaignStore, Orchestrator};
    use campaign_scheduler::MemoryTaskStore;

    struct TestApp {
        router: Router,
        audience_id: Uuid,
        provider_id: Uuid,
    }

    fn make_app() -> TestApp {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let registry = Arc::new(ProviderRegistry::new(
            Arc::new(MemoryUsageCounter::new()),
            clock.clone(),
        ));
        let provider_id = Uuid::new_v4();
        registry
            .register(ProviderSettings {
                id: provider_id,
                name: "sendgrid".to_string(),
                credentials: ProviderCredentials::Sendgrid {
                    api_key: Secret::new("SG.very-secret"),
                    from_email: "news@example.com".to_string(),
                    from_name: None,
                    reply_to: None,
                },
                daily_limit: 10,
                monthly_limit: 100,
                priority: 1,
                is_default: true,
                is_active: true,
            })
            .unwrap();
        let adapters = AdapterSet::with_transport(Arc::new(SimulatedTransport::new()));
        let audience = Arc::new(MemoryAudience::new());
        let audience_id = Uuid::new_v4();
        audience.add_recipient(
            audience_id,
            Recipient {
                id: Uuid::new_v4(),
                name: "Ada".to_string(),
                email: Some("ada@example.com".to_string()),
                phone: None,
                attributes: HashMap::new(),
                deleted_at: None,
            },
        );
        let ledger = Arc::new(MemoryLedger::new());
        let orchestrator = Arc::new(Orchestrator::new(
            Arc::new(MemoryCampaignStore::new()),
            Arc::new(MemoryTaskStore::new()),
            ledger.clone(),
            registry.clone(),
            adapters.clone(),
            audience,
            clock.clone(),
        ));
        let state = AppState {
            orchestrator,
            reconciler: Arc::new(WebhookReconciler::new(ledger, noop_sink(), clock)),
            health: Arc::new(HealthChecker::new(registry, adapters)),
            node_id: "node-test".to_string(),
            start_time: Instant::now(),
        };
        TestApp {
            router: router(state),
            audience_id,
            provider_id,
        }
    }

    async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Vec<u8>) {
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, body.to_vec())
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn post_empty(uri: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn create(app: &TestApp) -> Uuid {
        let (status, body) = send(
            &app.router,
            post_json(
                "/v1/campaigns",
                json!({
                    "name": "welcome",
                    "audience_id": app.audience_id,
                    "steps": [{
                        "order": 1,
                        "channel": "email",
                        "template": {"name": "hello", "subject": "Hi", "body": "Hello {{name}}"}
                    }]
                }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let campaign: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(campaign["status"], "draft");
        campaign["id"].as_str().unwrap().parse().unwrap()
    }

    #[tokio::test]
    async fn test_probes() {
        let app = make_app();
        let (status, body) = send(&app.router, get("/health")).await;
        assert_eq!(status, StatusCode::OK);
        let health: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(health["node_id"], "node-test");
        assert_eq!(send(&app.router, get("/ready")).await.0, StatusCode::OK);
        assert_eq!(send(&app.router, get("/live")).await.0, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_lifecycle_routes_map_invalid_state_to_conflict() {
        let app = make_app();
        let id = create(&app).await;

        let pause = format!("/v1/campaigns/{id}/pause");
        assert_eq!(send(&app.router, post_empty(&pause)).await.0, StatusCode::CONFLICT);

        let start = format!("/v1/campaigns/{id}/start");
        assert_eq!(send(&app.router, post_empty(&start)).await.0, StatusCode::ACCEPTED);
        assert_eq!(send(&app.router, post_empty(&start)).await.0, StatusCode::CONFLICT);

        let (status, body) = send(&app.router, post_empty(&pause)).await;
        assert_eq!(status, StatusCode::OK);
        let outcome: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(outcome["campaign"]["status"], "paused");

        let complete = format!("/v1/campaigns/{id}/complete");
        assert_eq!(send(&app.router, post_empty(&complete)).await.0, StatusCode::OK);
        let resume = format!("/v1/campaigns/{id}/resume");
        assert_eq!(send(&app.router, post_empty(&resume)).await.0, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_unknown_campaign_is_not_found() {
        let app = make_app();
        let uri = format!("/v1/campaigns/{}", Uuid::new_v4());
        assert_eq!(send(&app.router, get(&uri)).await.0, StatusCode::NOT_FOUND);
        let stats = format!("/v1/campaigns/{}/stats", Uuid::new_v4());
        assert_eq!(send(&app.router, get(&stats)).await.0, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_duplicate_step_orders_rejected() {
        let app = make_app();
        let id = create(&app).await;
        let step = json!({"order": 1, "channel": "sms", "template": {"name": "a", "body": "b"}});
        let request = Request::builder()
            .method("PUT")
            .uri(format!("/v1/campaigns/{id}/steps"))
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(json!([step, step]).to_string()))
            .unwrap();
        assert_eq!(send(&app.router, request).await.0, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_ledger_export_formats() {
        let app = make_app();
        let id = create(&app).await;

        let (status, body) = send(
            &app.router,
            get(&format!("/v1/campaigns/{id}/ledger/export?format=csv")),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(String::from_utf8(body).unwrap().starts_with("task_key,campaign_id"));

        let (status, body) = send(&app.router, get(&format!("/v1/campaigns/{id}/ledger/export"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"[]");

        let xml = format!("/v1/campaigns/{id}/ledger/export?format=xml");
        assert_eq!(send(&app.router, get(&xml)).await.0, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_webhook_status_codes() {
        let app = make_app();
        let unknown = json!([{"event": "delivered", "sg_message_id": "nobody.filter"}]);
        let (status, body) = send(&app.router, post_json("/webhook/email", unknown)).await;
        assert_eq!(status, StatusCode::OK);
        let report: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(report["unmatched"], 1);

        let form = Request::builder()
            .method("POST")
            .uri("/webhook/sms")
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from("MessageSid=SM404&MessageStatus=delivered"))
            .unwrap();
        assert_eq!(send(&app.router, form).await.0, StatusCode::OK);

        let broken = Request::builder()
            .method("POST")
            .uri("/webhook/email")
            .body(Body::from("{not json"))
            .unwrap();
        assert_eq!(send(&app.router, broken).await.0, StatusCode::BAD_REQUEST);

        let fax = post_json("/webhook/fax", json!({}));
        assert_eq!(send(&app.router, fax).await.0, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_provider_routes_hide_credentials() {
        let app = make_app();
        let (status, body) = send(&app.router, get("/v1/providers")).await;
        assert_eq!(status, StatusCode::OK);
        assert!(!String::from_utf8_lossy(&body).contains("very-secret"));
        let providers: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(providers[0]["kind"], "sendgrid");

        let usage = format!("/v1/providers/{}/usage", app.provider_id);
        let (status, body) = send(&app.router, get(&usage)).await;
        assert_eq!(status, StatusCode::OK);
        let usage: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(usage["remaining_today"], 10);

        let check = format!("/v1/providers/{}/health-check", app.provider_id);
        let (status, body) = send(&app.router, post_empty(&check)).await;
        assert_eq!(status, StatusCode::OK);
        let health: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(health["health"], "healthy");

        let reset = format!("/v1/providers/{}/reset-usage", app.provider_id);
        assert_eq!(send(&app.router, post_empty(&reset)).await.0, StatusCode::NO_CONTENT);
        let missing = format!("/v1/providers/{}/usage", Uuid::new_v4());
        assert_eq!(send(&app.router, get(&missing)).await.0, StatusCode::NOT_FOUND);
    }
}

//! HTTP routes for the notification service
//!
//! - Workflow management and appointment lifecycle events
//! - SMS analytics and template management
//! - Emergency resolution
//! - Vendor webhooks (voice assistant, SMS status, inbound SMS)
//! - Health and metrics endpoints

use crate::handlers::{
    analytics_handler, appointments_handler, emergencies_handler, health_handler,
    metrics_handler, templates_handler, webhooks_handler, workflows_handler,
};
use crate::manager::NotifyManager;

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::{
    compression::CompressionLayer, cors::CorsLayer, timeout::TimeoutLayer, trace::TraceLayer,
};

/// Build the main router for the notification service
pub fn create_router(manager: Arc<NotifyManager>) -> Router {
    let timeout = Duration::from_secs(manager.config().server.timeout_seconds);

    Router::new()
        .merge(create_api_router(Arc::clone(&manager)))
        .merge(create_webhook_router(Arc::clone(&manager)))
        .merge(create_health_router(manager))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive())
                .layer(CompressionLayer::new())
                .layer(TimeoutLayer::new(timeout))
                .into_inner(),
        )
}

/// Authenticated management and analytics endpoints
fn create_api_router(manager: Arc<NotifyManager>) -> Router {
    Router::new()
        // Workflows
        .route(
            "/api/workflows/create",
            post(workflows_handler::create_workflow),
        )
        .route(
            "/api/workflows/cancel",
            post(workflows_handler::cancel_workflow),
        )
        .route(
            "/api/workflows/metrics",
            get(workflows_handler::get_workflow_metrics),
        )
        .route(
            "/api/workflows/execute-due",
            post(workflows_handler::execute_due_workflows),
        )
        .route("/api/workflows/:id", get(workflows_handler::get_workflow))
        .route(
            "/api/appointments/events",
            post(appointments_handler::appointment_event),
        )
        // SMS analytics
        .route(
            "/api/sms/statistics",
            get(analytics_handler::get_delivery_statistics),
        )
        .route(
            "/api/sms/trends",
            get(analytics_handler::get_delivery_trends),
        )
        .route(
            "/api/sms/template-performance",
            get(analytics_handler::get_template_performance),
        )
        .route(
            "/api/sms/language-performance",
            get(analytics_handler::get_language_performance),
        )
        // Templates
        .route(
            "/api/sms/templates",
            get(templates_handler::list_templates)
                .post(templates_handler::create_template)
                .put(templates_handler::update_template),
        )
        .route(
            "/api/sms/templates/preview",
            post(templates_handler::preview_template),
        )
        // Emergencies
        .route(
            "/api/emergencies/:id/resolve",
            post(emergencies_handler::resolve_emergency),
        )
        .with_state(manager)
}

/// Vendor callbacks, authenticated by signature
fn create_webhook_router(manager: Arc<NotifyManager>) -> Router {
    Router::new()
        .route("/api/webhooks/vapi", post(webhooks_handler::voice_webhook))
        .route(
            "/api/webhooks/vapi/tools/:tool",
            post(webhooks_handler::voice_tool_webhook),
        )
        .route(
            crate::channels::STATUS_CALLBACK_PATH,
            post(webhooks_handler::sms_status_webhook),
        )
        .route(
            crate::webhooks::INBOUND_SMS_PATH,
            post(webhooks_handler::inbound_sms_webhook),
        )
        .with_state(manager)
}

/// Create health and metrics routes
fn create_health_router(manager: Arc<NotifyManager>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(manager)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::issue_token;
    use crate::channels::{ProviderRegistry, SandboxProvider};
    use crate::config::NotifyConfig;
    use crate::store::MemoryStore;
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Request, StatusCode};
    use chrono::{Duration as ChronoDuration, NaiveTime, Utc};
    use serde_json::{json, Value};
    use serviceai_shared::types::{Language, Organization};
    use tower::ServiceExt;
    use uuid::Uuid;

    const SECRET: &str = "router-secret";

    struct TestApp {
        router: Router,
        store: Arc<MemoryStore>,
        org: Organization,
    }

    fn app() -> TestApp {
        let mut config = NotifyConfig::default();
        config.auth.jwt_secret = SECRET.to_string();
        config.webhooks.verify_signatures = false;

        let store = Arc::new(MemoryStore::new());
        let org = Organization {
            id: Uuid::new_v4(),
            name: "Delta Plumbing".to_string(),
            default_language: Language::En,
            utc_offset_minutes: 0,
            business_hours_start: NaiveTime::from_hms_opt(8, 0, 0).unwrap(),
            business_hours_end: NaiveTime::from_hms_opt(17, 0, 0).unwrap(),
            business_days: vec![1, 2, 3, 4, 5],
            emergency_contact_name: None,
            emergency_contact_phone: Some("+15550009999".to_string()),
            transfer_phone: None,
            sms_phone: Some("+15550001000".to_string()),
            voice_phone: None,
            preferred_sms_provider: None,
            is_active: true,
            created_at: Utc::now(),
        };
        store.insert_organization(org.clone());
        store.add_member(org.id, "member-1");

        let registry = ProviderRegistry::new(
            vec![],
            vec![Arc::new(SandboxProvider::new("+15005550006"))],
        );
        let manager = NotifyManager::with_parts(config, store.clone(), registry).unwrap();

        TestApp {
            router: create_router(Arc::new(manager)),
            store,
            org,
        }
    }

    fn bearer(user: &str) -> String {
        let token = issue_token(user, SECRET, ChronoDuration::minutes(5)).unwrap();
        format!("Bearer {}", token)
    }

    async fn json_body(response: axum::response::Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let app = app();
        let response = app
            .router
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["status"], json!("healthy"));
        assert_eq!(body["store"], json!("memory"));
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let app = app();
        let response = app
            .router
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_analytics_requires_token() {
        let app = app();
        let uri = format!("/api/sms/statistics?organizationId={}", app.org.id);
        let response = app
            .router
            .oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body = json_body(response).await;
        assert_eq!(body["success"], json!(false));
        assert_eq!(body["code"], json!("UNAUTHORIZED"));
    }

    #[tokio::test]
    async fn test_analytics_for_member() {
        let app = app();
        let uri = format!(
            "/api/sms/statistics?organizationId={}&timeRange=7d",
            app.org.id
        );
        let response = app
            .router
            .oneshot(
                Request::get(uri)
                    .header(header::AUTHORIZATION, bearer("member-1"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["success"], json!(true));
        assert_eq!(body["timeRange"], json!("7d"));
        assert_eq!(body["organizationId"], json!(app.org.id.to_string()));
        assert_eq!(body["data"]["totalSent"], json!(0));
    }

    #[tokio::test]
    async fn test_non_member_is_forbidden() {
        let app = app();
        let uri = format!("/api/workflows/metrics?organizationId={}", app.org.id);
        let response = app
            .router
            .oneshot(
                Request::get(uri)
                    .header(header::AUTHORIZATION, bearer("someone-else"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_create_workflow_with_bad_type_is_rejected() {
        let app = app();
        let payload = json!({
            "organizationId": app.org.id,
            "workflowType": "carrier_pigeon",
        });
        let response = app
            .router
            .oneshot(
                Request::post("/api/workflows/create")
                    .header(header::AUTHORIZATION, bearer("member-1"))
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(payload.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert!(response.status().is_client_error());
        assert!(app.store.messages().is_empty());
    }

    #[tokio::test]
    async fn test_sms_status_for_unknown_message_is_ok() {
        let app = app();
        let response = app
            .router
            .oneshot(
                Request::post("/api/webhooks/sms/status")
                    .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                    .body(Body::from("MessageSid=SMmissing&MessageStatus=delivered"))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await, json!({ "success": true }));
    }

    #[tokio::test]
    async fn test_voice_webhook_returns_vendor_shape() {
        let app = app();
        let payload = json!({
            "message": {
                "type": "tool-calls",
                "call": { "id": "call-1", "metadata": { "organizationId": app.org.id } },
                "toolCallList": [{
                    "id": "tc-1",
                    "function": { "name": "transferCall", "arguments": {} }
                }]
            }
        });
        let response = app
            .router
            .oneshot(
                Request::post("/api/webhooks/vapi")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(payload.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["results"][0]["toolCallId"], json!("tc-1"));
        assert_eq!(body["results"][0]["result"]["action"], json!("transfer"));
        assert_eq!(
            body["results"][0]["result"]["transferTo"],
            json!("+15550009999")
        );
    }
}

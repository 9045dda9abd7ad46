//! Request handlers for the notification service
//!
//! Management and analytics handlers authenticate the caller and check
//! organization membership before touching any data. Webhook handlers take
//! the raw body, since vendor signatures are computed over the exact bytes.

use crate::auth::{verify_scheduler_token, AuthUser};
use crate::error::{NotifyError, Result};
use crate::manager::NotifyManager;
use serviceai_shared::types::*;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

pub mod workflows_handler {
    use super::*;

    pub async fn create_workflow(
        State(manager): State<Arc<NotifyManager>>,
        user: AuthUser,
        Json(request): Json<CreateWorkflowRequest>,
    ) -> Result<impl IntoResponse> {
        user.require_member(manager.store(), request.organization_id)
            .await?;

        let workflow = manager.engine().create_workflow(request).await?;
        info!(
            workflow_id = %workflow.id,
            workflow_type = %workflow.workflow_type,
            "Workflow created via API"
        );
        Ok((StatusCode::CREATED, Json(ApiResponse::ok(workflow))))
    }

    /// Soft cancel: steps already sent stay sent
    pub async fn cancel_workflow(
        State(manager): State<Arc<NotifyManager>>,
        user: AuthUser,
        Json(request): Json<CancelWorkflowRequest>,
    ) -> Result<impl IntoResponse> {
        let workflow = manager
            .engine()
            .get_workflow(None, request.workflow_id)
            .await?;
        user.require_member(manager.store(), workflow.organization_id)
            .await?;

        let cancelled = manager
            .engine()
            .cancel_workflow(Some(workflow.organization_id), workflow.id)
            .await?;
        Ok(Json(ApiResponse::ok(cancelled)))
    }

    pub async fn get_workflow(
        State(manager): State<Arc<NotifyManager>>,
        user: AuthUser,
        Path(id): Path<Uuid>,
    ) -> Result<impl IntoResponse> {
        let workflow = manager.engine().get_workflow(None, id).await?;
        user.require_member(manager.store(), workflow.organization_id)
            .await?;
        Ok(Json(ApiResponse::ok(workflow)))
    }

    pub async fn get_workflow_metrics(
        State(manager): State<Arc<NotifyManager>>,
        user: AuthUser,
        Query(query): Query<AnalyticsQuery>,
    ) -> Result<impl IntoResponse> {
        user.require_member(manager.store(), query.organization_id)
            .await?;

        let metrics = manager
            .engine()
            .get_workflow_metrics(query.organization_id, query.time_range)
            .await?;
        Ok(Json(AnalyticsResponse {
            success: true,
            data: metrics,
            time_range: query.time_range,
            organization_id: query.organization_id,
        }))
    }

    /// Called by the external scheduler
    pub async fn execute_due_workflows(
        State(manager): State<Arc<NotifyManager>>,
        headers: HeaderMap,
    ) -> Result<impl IntoResponse> {
        verify_scheduler_token(&headers, &manager.config().auth.scheduler_token)?;

        match manager.engine().execute_due_workflows().await {
            Ok(summary) => {
                info!(
                    picked = summary.picked,
                    completed = summary.completed,
                    failed = summary.failed,
                    "Due workflows executed"
                );
                Ok(Json(ApiResponse::ok(summary)))
            }
            Err(e) => {
                error!("Failed to execute due workflows: {}", e);
                Err(e)
            }
        }
    }
}

pub mod appointments_handler {
    use super::*;

    pub async fn appointment_event(
        State(manager): State<Arc<NotifyManager>>,
        user: AuthUser,
        Json(request): Json<AppointmentEventRequest>,
    ) -> Result<impl IntoResponse> {
        user.require_member(manager.store(), request.organization_id)
            .await?;

        let workflows = manager
            .engine()
            .handle_appointment_event(request.organization_id, request.appointment_id, request.event)
            .await?;
        Ok(Json(ApiResponse::ok(workflows)))
    }
}

pub mod analytics_handler {
    use super::*;

    fn respond<T>(query: &AnalyticsQuery, data: T) -> Json<AnalyticsResponse<T>> {
        Json(AnalyticsResponse {
            success: true,
            data,
            time_range: query.time_range,
            organization_id: query.organization_id,
        })
    }

    pub async fn get_delivery_statistics(
        State(manager): State<Arc<NotifyManager>>,
        user: AuthUser,
        Query(query): Query<AnalyticsQuery>,
    ) -> Result<impl IntoResponse> {
        user.require_member(manager.store(), query.organization_id)
            .await?;
        let stats = manager
            .tracker()
            .get_delivery_statistics(query.organization_id, query.time_range)
            .await?;
        Ok(respond(&query, stats))
    }

    pub async fn get_delivery_trends(
        State(manager): State<Arc<NotifyManager>>,
        user: AuthUser,
        Query(query): Query<AnalyticsQuery>,
    ) -> Result<impl IntoResponse> {
        user.require_member(manager.store(), query.organization_id)
            .await?;
        let trends = manager
            .tracker()
            .get_delivery_trends(query.organization_id, query.time_range)
            .await?;
        Ok(respond(&query, trends))
    }

    pub async fn get_template_performance(
        State(manager): State<Arc<NotifyManager>>,
        user: AuthUser,
        Query(query): Query<AnalyticsQuery>,
    ) -> Result<impl IntoResponse> {
        user.require_member(manager.store(), query.organization_id)
            .await?;
        let performance = manager
            .tracker()
            .get_template_performance(
                query.organization_id,
                query.template_key.as_deref(),
                query.time_range,
            )
            .await?;
        Ok(respond(&query, performance))
    }

    pub async fn get_language_performance(
        State(manager): State<Arc<NotifyManager>>,
        user: AuthUser,
        Query(query): Query<AnalyticsQuery>,
    ) -> Result<impl IntoResponse> {
        user.require_member(manager.store(), query.organization_id)
            .await?;
        let performance = manager
            .tracker()
            .get_language_performance(query.organization_id, query.time_range)
            .await?;
        Ok(respond(&query, performance))
    }
}

pub mod templates_handler {
    use super::*;
    use crate::store::TemplateFilter;

    pub async fn list_templates(
        State(manager): State<Arc<NotifyManager>>,
        user: AuthUser,
        Query(query): Query<TemplateListQuery>,
    ) -> Result<impl IntoResponse> {
        user.require_member(manager.store(), query.organization_id)
            .await?;

        let filter = TemplateFilter {
            language: query.language,
            category: query.category,
            active_only: query.active_only,
        };
        let templates = manager
            .templates()
            .list_templates(query.organization_id, &filter)
            .await?;
        Ok(Json(ApiResponse::ok(templates)))
    }

    pub async fn create_template(
        State(manager): State<Arc<NotifyManager>>,
        user: AuthUser,
        Json(request): Json<SaveTemplateRequest>,
    ) -> Result<impl IntoResponse> {
        let template = save(&manager, &user, request).await?;
        Ok((StatusCode::CREATED, Json(ApiResponse::ok(template))))
    }

    pub async fn update_template(
        State(manager): State<Arc<NotifyManager>>,
        user: AuthUser,
        Json(request): Json<SaveTemplateRequest>,
    ) -> Result<impl IntoResponse> {
        let template = save(&manager, &user, request).await?;
        Ok(Json(ApiResponse::ok(template)))
    }

    async fn save(
        manager: &NotifyManager,
        user: &AuthUser,
        request: SaveTemplateRequest,
    ) -> Result<NotificationTemplate> {
        user.require_member(manager.store(), request.organization_id)
            .await?;
        let template = manager.templates().save_template(request).await?;
        info!(
            organization_id = ?template.organization_id,
            template_key = %template.template_key,
            language = %template.language,
            version = template.version,
            "Template saved"
        );
        Ok(template)
    }

    /// Render without sending
    pub async fn preview_template(
        State(manager): State<Arc<NotifyManager>>,
        user: AuthUser,
        Json(request): Json<TemplatePreviewRequest>,
    ) -> Result<impl IntoResponse> {
        user.require_member(manager.store(), request.organization_id)
            .await?;

        let organization = manager
            .store()
            .get_organization(request.organization_id)
            .await?
            .ok_or_else(|| {
                NotifyError::not_found(format!("organization {}", request.organization_id))
            })?;
        let rendered = manager
            .templates()
            .render_template(
                &organization,
                &request.template_key,
                request.language,
                &request.variables,
            )
            .await?;
        Ok(Json(ApiResponse::ok(rendered)))
    }
}

pub mod emergencies_handler {
    use super::*;

    pub async fn resolve_emergency(
        State(manager): State<Arc<NotifyManager>>,
        user: AuthUser,
        Path(id): Path<Uuid>,
        Json(request): Json<ResolveEmergencyRequest>,
    ) -> Result<impl IntoResponse> {
        user.require_member(manager.store(), request.organization_id)
            .await?;

        let resolved_by = request.resolved_by.or_else(|| Some(user.user_id.clone()));
        let resolution = manager
            .ingress()
            .resolve_emergency(request.organization_id, id, resolved_by)
            .await?;
        Ok(Json(ApiResponse::ok(resolution)))
    }
}

pub mod webhooks_handler {
    use super::*;

    /// Voice assistant server messages
    pub async fn voice_webhook(
        State(manager): State<Arc<NotifyManager>>,
        headers: HeaderMap,
        body: Bytes,
    ) -> Result<impl IntoResponse> {
        let response = manager
            .ingress()
            .handle_voice_webhook(&headers, &body)
            .await?;
        Ok(Json(response))
    }

    /// One tool per URL, for assistants configured with a server URL per tool
    pub async fn voice_tool_webhook(
        State(manager): State<Arc<NotifyManager>>,
        Path(tool): Path<String>,
        headers: HeaderMap,
        body: Bytes,
    ) -> Result<impl IntoResponse> {
        let response = manager
            .ingress()
            .handle_tool_call(&tool, &headers, &body)
            .await?;
        Ok(Json(response))
    }

    /// Always 200 once authenticated, so the vendor does not retry
    pub async fn sms_status_webhook(
        State(manager): State<Arc<NotifyManager>>,
        headers: HeaderMap,
        body: Bytes,
    ) -> Result<impl IntoResponse> {
        manager.ingress().handle_sms_status(&headers, &body).await?;
        Ok(Json(serde_json::json!({ "success": true })))
    }

    pub async fn inbound_sms_webhook(
        State(manager): State<Arc<NotifyManager>>,
        headers: HeaderMap,
        body: Bytes,
    ) -> Result<impl IntoResponse> {
        let response = manager
            .ingress()
            .handle_inbound_sms(&headers, &body)
            .await?;
        Ok(Json(response))
    }
}

/// Health check handler
pub async fn health_handler(State(manager): State<Arc<NotifyManager>>) -> impl IntoResponse {
    let health = manager.health_check().await;
    let status = if health.status == "healthy" {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(health))
}

/// Prometheus text exposition
pub async fn metrics_handler(
    State(manager): State<Arc<NotifyManager>>,
) -> Result<impl IntoResponse> {
    let body = manager.metrics().export()?;
    Ok((
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::{ProviderRegistry, SandboxProvider};
    use crate::config::NotifyConfig;
    use crate::store::MemoryStore;

    fn manager() -> Arc<NotifyManager> {
        let mut config = NotifyConfig::default();
        config.auth.scheduler_token = "cron-token".to_string();
        let registry = ProviderRegistry::new(
            vec![],
            vec![Arc::new(SandboxProvider::new("+15005550006"))],
        );
        Arc::new(
            NotifyManager::with_parts(config, Arc::new(MemoryStore::new()), registry).unwrap(),
        )
    }

    #[tokio::test]
    async fn test_health_handler() {
        let response = health_handler(State(manager())).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_metrics_handler_serves_text() {
        let response = metrics_handler(State(manager()))
            .await
            .unwrap()
            .into_response();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "text/plain; version=0.0.4"
        );
    }

    #[tokio::test]
    async fn test_execute_due_requires_scheduler_token() {
        let manager = manager();

        let denied =
            workflows_handler::execute_due_workflows(State(manager.clone()), HeaderMap::new())
                .await;
        assert!(matches!(denied, Err(NotifyError::Unauthorized { .. })));

        let mut headers = HeaderMap::new();
        headers.insert(
            crate::auth::SCHEDULER_TOKEN_HEADER,
            "cron-token".parse().unwrap(),
        );
        let allowed = workflows_handler::execute_due_workflows(State(manager), headers).await;
        assert!(allowed.is_ok());
    }

    #[tokio::test]
    async fn test_analytics_requires_membership() {
        let manager = manager();
        let user = AuthUser {
            user_id: "outsider".to_string(),
        };
        let query = AnalyticsQuery {
            organization_id: Uuid::new_v4(),
            time_range: TimeRange::LastDay,
            template_key: None,
        };

        let result =
            analytics_handler::get_delivery_statistics(State(manager), user, Query(query)).await;
        assert!(matches!(result, Err(NotifyError::Forbidden { .. })));
    }
}

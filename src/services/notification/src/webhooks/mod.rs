//! Webhook ingress
//!
//! Entry point for vendor callbacks: voice assistant tool calls, SMS delivery
//! status and inbound SMS. Every request is authenticated against the raw
//! body before it is parsed, then turned into a typed event. Replays are
//! absorbed by keyed inserts in the store, so handlers can be run any number
//! of times for the same vendor event.

use axum::http::HeaderMap;
use chrono::Utc;
use serviceai_shared::types::{EmergencyResolution, EmergencyStatus};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{SmsConfig, WebhookConfig};
use crate::dispatcher::NotificationDispatcher;
use crate::error::{NotifyError, Result};
use crate::metrics::NotifyMetrics;
use crate::store::{EmergencyUpdate, Persistence};
use crate::templates::TemplateStore;
use crate::tracker::DeliveryTracker;
use crate::workflow::WorkflowEngine;

pub mod signature;
pub mod sms;
pub mod voice;

pub use sms::{InboundAction, InboundSmsResponse};

/// Path vendors post inbound messages to
pub const INBOUND_SMS_PATH: &str = "/api/webhooks/sms/inbound";

pub struct WebhookIngress {
    store: Arc<dyn Persistence>,
    templates: Arc<TemplateStore>,
    dispatcher: Arc<NotificationDispatcher>,
    engine: Arc<WorkflowEngine>,
    tracker: DeliveryTracker,
    metrics: NotifyMetrics,
    config: WebhookConfig,
    sms_auth_token: String,
}

impl WebhookIngress {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn Persistence>,
        templates: Arc<TemplateStore>,
        dispatcher: Arc<NotificationDispatcher>,
        engine: Arc<WorkflowEngine>,
        tracker: DeliveryTracker,
        metrics: NotifyMetrics,
        webhooks: &WebhookConfig,
        sms: &SmsConfig,
    ) -> Self {
        if !webhooks.verify_signatures {
            warn!("Webhook signature verification is disabled");
        }

        Self {
            store,
            templates,
            dispatcher,
            engine,
            tracker,
            metrics,
            config: webhooks.clone(),
            sms_auth_token: sms.twilio.auth_token.clone(),
        }
    }

    /// Close an emergency once a human has taken it over. Resolving twice is
    /// a no-op that returns the original resolution.
    pub async fn resolve_emergency(
        &self,
        organization_id: Uuid,
        id: Uuid,
        resolved_by: Option<String>,
    ) -> Result<EmergencyResolution> {
        let emergency = self
            .store
            .get_emergency(organization_id, id)
            .await?
            .ok_or_else(|| NotifyError::not_found(format!("emergency {}", id)))?;

        if emergency.status == EmergencyStatus::Resolved {
            return Ok(EmergencyResolution {
                id,
                status: emergency.status,
                resolved_at: emergency.resolved_at,
            });
        }

        let update = EmergencyUpdate {
            status: EmergencyStatus::Resolved,
            sms_message_id: None,
            last_error: None,
            resolved_by,
            at: Utc::now(),
        };
        let emergency = self
            .store
            .update_emergency_status(organization_id, id, &update)
            .await?;

        info!(
            emergency_id = %id,
            organization_id = %organization_id,
            resolved_by = ?emergency.resolved_by,
            "Emergency resolved"
        );

        Ok(EmergencyResolution {
            id,
            status: emergency.status,
            resolved_at: emergency.resolved_at,
        })
    }

    fn verify_voice(&self, headers: &HeaderMap, raw_body: &[u8]) -> Result<()> {
        if !self.config.verify_signatures {
            return Ok(());
        }
        signature::verify_vapi(headers, raw_body, &self.config.vapi_secret).map_err(|e| {
            self.metrics.record_webhook("voice", "rejected");
            e
        })
    }

    fn verify_sms(
        &self,
        headers: &HeaderMap,
        path: &str,
        params: &[(String, String)],
        source: &str,
    ) -> Result<()> {
        if !self.config.verify_signatures {
            return Ok(());
        }
        let url = self.public_url(path)?;
        signature::verify_twilio(headers, &url, params, &self.sms_auth_token).map_err(|e| {
            self.metrics.record_webhook(source, "rejected");
            e
        })
    }

    /// The URL the vendor signed, which is the public one rather than
    /// whatever address the request arrived on
    fn public_url(&self, path: &str) -> Result<String> {
        let base = self.config.public_base_url.as_deref().ok_or_else(|| {
            NotifyError::signature("public base URL is required to verify SMS webhooks")
        })?;
        Ok(format!("{}{}", base.trim_end_matches('/'), path))
    }
}

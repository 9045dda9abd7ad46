//! SMS provider channels
//!
//! Each vendor implements [`SmsProvider`]. The [`ProviderRegistry`] holds the
//! enabled providers and decides the order a send tries them in:
//! - Twilio (form-encoded REST, basic auth)
//! - Telnyx (JSON REST, bearer token)
//! - Sandbox (in-process, for development and tests)

use async_trait::async_trait;
use serviceai_shared::types::{MessageStatus, ProviderChoice, SmsProviderKind};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

use crate::config::{SmsConfig, WebhookConfig};
use crate::error::{NotifyError, Result};

pub mod sandbox;
pub mod telnyx;
pub mod twilio;

pub use sandbox::{SandboxFailure, SandboxProvider};
pub use telnyx::TelnyxProvider;
pub use twilio::TwilioProvider;

/// Path vendors post delivery callbacks to
pub const STATUS_CALLBACK_PATH: &str = "/api/webhooks/sms/status";

/// A single-segment message ready for a vendor
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundSms {
    pub to: String,
    pub from: String,
    pub body: String,
}

/// What the vendor told us after accepting a message
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderReceipt {
    pub external_id: String,
    pub status: MessageStatus,
    pub cost: Option<f64>,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProviderError {
    /// The request may not have reached the vendor, or the vendor failed
    /// on its side; another provider or a later attempt may succeed
    #[error("{provider} transport error: {message}")]
    Transport {
        provider: SmsProviderKind,
        message: String,
    },

    /// The vendor refused this message; resending it will not help
    #[error("{provider} rejected message ({code}): {message}")]
    Rejected {
        provider: SmsProviderKind,
        code: String,
        message: String,
    },

    #[error("{provider} is not configured")]
    NotConfigured { provider: SmsProviderKind },
}

impl ProviderError {
    pub fn is_transport(&self) -> bool {
        matches!(self, ProviderError::Transport { .. })
    }

    /// Vendor or internal code stored on the message record
    pub fn code(&self) -> String {
        match self {
            ProviderError::Transport { .. } => "PROVIDER_UNAVAILABLE".to_string(),
            ProviderError::Rejected { code, .. } => code.clone(),
            ProviderError::NotConfigured { .. } => "PROVIDER_NOT_CONFIGURED".to_string(),
        }
    }

    /// Classify an HTTP error status: throttling and vendor-side failures
    /// are transport problems, everything else is a rejection
    pub(crate) fn from_status(
        provider: SmsProviderKind,
        status: reqwest::StatusCode,
        code: Option<String>,
        message: String,
    ) -> Self {
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            ProviderError::Transport {
                provider,
                message: format!("HTTP {}: {}", status.as_u16(), message),
            }
        } else {
            ProviderError::Rejected {
                provider,
                code: code.unwrap_or_else(|| status.as_u16().to_string()),
                message,
            }
        }
    }

    pub(crate) fn from_reqwest(provider: SmsProviderKind, err: reqwest::Error) -> Self {
        ProviderError::Transport {
            provider,
            message: err.to_string(),
        }
    }
}

/// Trait every SMS vendor integration implements
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SmsProvider: Send + Sync {
    fn kind(&self) -> SmsProviderKind;

    /// Sender number used when the organization has none
    fn default_from(&self) -> String;

    async fn send(&self, message: &OutboundSms) -> std::result::Result<ProviderReceipt, ProviderError>;
}

/// Enabled providers in configured fallback order
#[derive(Clone)]
pub struct ProviderRegistry {
    providers: HashMap<SmsProviderKind, Arc<dyn SmsProvider>>,
    order: Vec<SmsProviderKind>,
}

impl ProviderRegistry {
    pub fn from_config(sms: &SmsConfig, webhooks: &WebhookConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(sms.timeout_seconds))
            .user_agent(concat!("serviceai-notify/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| NotifyError::config(format!("Failed to create HTTP client: {}", e)))?;

        let callback_url = webhooks
            .public_base_url
            .as_ref()
            .map(|base| format!("{}{}", base.trim_end_matches('/'), STATUS_CALLBACK_PATH));

        let mut providers: Vec<Arc<dyn SmsProvider>> = Vec::new();
        if sms.twilio.enabled {
            providers.push(Arc::new(TwilioProvider::new(
                client.clone(),
                &sms.twilio,
                callback_url.clone(),
            )));
        }
        if sms.telnyx.enabled {
            providers.push(Arc::new(TelnyxProvider::new(
                client.clone(),
                &sms.telnyx,
                callback_url.clone(),
            )));
        }
        if sms.sandbox.enabled {
            providers.push(Arc::new(SandboxProvider::new(&sms.sandbox.from_phone)));
        }

        Ok(Self::new(sms.provider_order.clone(), providers))
    }

    /// Providers missing from `order` are appended in the order given
    pub fn new(order: Vec<SmsProviderKind>, providers: Vec<Arc<dyn SmsProvider>>) -> Self {
        let mut order = order;
        let mut map = HashMap::new();
        for provider in providers {
            let kind = provider.kind();
            if !order.contains(&kind) {
                order.push(kind);
            }
            map.insert(kind, provider);
        }
        order.retain(|kind| map.contains_key(kind));

        info!(providers = ?order, "SMS providers registered");

        Self {
            providers: map,
            order,
        }
    }

    pub fn enabled(&self) -> Vec<SmsProviderKind> {
        self.order.clone()
    }

    pub fn get(&self, kind: SmsProviderKind) -> Option<Arc<dyn SmsProvider>> {
        self.providers.get(&kind).cloned()
    }

    /// Providers to try for one send. An explicit choice pins the provider;
    /// otherwise the organization's preference leads, followed by the
    /// configured order.
    pub fn candidates(
        &self,
        choice: ProviderChoice,
        preferred: Option<SmsProviderKind>,
    ) -> Vec<Arc<dyn SmsProvider>> {
        if let Some(kind) = choice.specific() {
            return self.get(kind).into_iter().collect();
        }

        let mut kinds = Vec::with_capacity(self.order.len());
        if let Some(kind) = preferred.filter(|k| self.providers.contains_key(k)) {
            kinds.push(kind);
        }
        kinds.extend(self.order.iter().copied().filter(|k| Some(*k) != preferred));

        kinds.into_iter().filter_map(|k| self.get(k)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn mock(kind: SmsProviderKind) -> Arc<dyn SmsProvider> {
        let mut provider = MockSmsProvider::new();
        provider.expect_kind().return_const(kind);
        Arc::new(provider)
    }

    fn registry() -> ProviderRegistry {
        ProviderRegistry::new(
            vec![SmsProviderKind::Twilio, SmsProviderKind::Telnyx],
            vec![
                mock(SmsProviderKind::Telnyx),
                mock(SmsProviderKind::Twilio),
                mock(SmsProviderKind::Sandbox),
            ],
        )
    }

    fn kinds(providers: &[Arc<dyn SmsProvider>]) -> Vec<SmsProviderKind> {
        providers.iter().map(|p| p.kind()).collect()
    }

    #[test]
    fn test_configured_order_then_unlisted() {
        assert_eq!(
            registry().enabled(),
            vec![
                SmsProviderKind::Twilio,
                SmsProviderKind::Telnyx,
                SmsProviderKind::Sandbox
            ]
        );
    }

    #[test]
    fn test_organization_preference_leads() {
        let candidates = registry().candidates(ProviderChoice::Auto, Some(SmsProviderKind::Telnyx));
        assert_eq!(
            kinds(&candidates),
            vec![
                SmsProviderKind::Telnyx,
                SmsProviderKind::Twilio,
                SmsProviderKind::Sandbox
            ]
        );
    }

    #[test]
    fn test_explicit_choice_pins_provider() {
        let candidates = registry().candidates(ProviderChoice::Sandbox, Some(SmsProviderKind::Telnyx));
        assert_eq!(kinds(&candidates), vec![SmsProviderKind::Sandbox]);

        let only_twilio = ProviderRegistry::new(vec![], vec![mock(SmsProviderKind::Twilio)]);
        assert!(only_twilio
            .candidates(ProviderChoice::Telnyx, None)
            .is_empty());
    }

    #[test]
    fn test_http_status_classification() {
        let throttled = ProviderError::from_status(
            SmsProviderKind::Twilio,
            reqwest::StatusCode::TOO_MANY_REQUESTS,
            Some("20429".to_string()),
            "Too Many Requests".to_string(),
        );
        assert!(throttled.is_transport());

        let invalid = ProviderError::from_status(
            SmsProviderKind::Twilio,
            reqwest::StatusCode::BAD_REQUEST,
            Some("21211".to_string()),
            "Invalid 'To' Phone Number".to_string(),
        );
        assert!(!invalid.is_transport());
        assert_eq!(invalid.code(), "21211");
    }
}

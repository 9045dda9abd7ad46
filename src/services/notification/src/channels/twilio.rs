//! Twilio Programmable Messaging

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serviceai_shared::types::{MessageStatus, SmsProviderKind};
use tracing::{debug, warn};

use crate::channels::{OutboundSms, ProviderError, ProviderReceipt, SmsProvider};
use crate::config::TwilioConfig;

const KIND: SmsProviderKind = SmsProviderKind::Twilio;

#[derive(Clone)]
pub struct TwilioProvider {
    client: Client,
    config: TwilioConfig,
    status_callback: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessageResource {
    sid: String,
    status: String,
    /// Negative decimal string, often null until the message settles
    price: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorResource {
    code: Option<i64>,
    message: Option<String>,
}

impl TwilioProvider {
    pub fn new(client: Client, config: &TwilioConfig, status_callback: Option<String>) -> Self {
        Self {
            client,
            config: config.clone(),
            status_callback,
        }
    }

    fn messages_url(&self) -> String {
        format!(
            "{}/2010-04-01/Accounts/{}/Messages.json",
            self.config.base_url.trim_end_matches('/'),
            self.config.account_sid
        )
    }
}

#[async_trait]
impl SmsProvider for TwilioProvider {
    fn kind(&self) -> SmsProviderKind {
        KIND
    }

    fn default_from(&self) -> String {
        self.config.from_phone.clone()
    }

    async fn send(&self, message: &OutboundSms) -> Result<ProviderReceipt, ProviderError> {
        if self.config.account_sid.is_empty() || self.config.auth_token.is_empty() {
            return Err(ProviderError::NotConfigured { provider: KIND });
        }

        let mut form = vec![
            ("To", message.to.as_str()),
            ("From", message.from.as_str()),
            ("Body", message.body.as_str()),
        ];
        if let Some(callback) = &self.status_callback {
            form.push(("StatusCallback", callback.as_str()));
        }

        let response = self
            .client
            .post(self.messages_url())
            .basic_auth(&self.config.account_sid, Some(&self.config.auth_token))
            .form(&form)
            .send()
            .await
            .map_err(|e| ProviderError::from_reqwest(KIND, e))?;

        let status = response.status();
        if !status.is_success() {
            let error: Option<ErrorResource> = response.json().await.ok();
            let (code, text) = match error {
                Some(e) => (e.code.map(|c| c.to_string()), e.message),
                None => (None, None),
            };
            warn!(status = %status, code = ?code, "Twilio rejected send");
            return Err(ProviderError::from_status(
                KIND,
                status,
                code,
                text.unwrap_or_else(|| "request failed".to_string()),
            ));
        }

        let resource: MessageResource = response
            .json()
            .await
            .map_err(|e| ProviderError::from_reqwest(KIND, e))?;

        debug!(sid = %resource.sid, status = %resource.status, "Twilio accepted message");

        Ok(ProviderReceipt {
            status: MessageStatus::from_provider(&resource.status).unwrap_or(MessageStatus::Queued),
            cost: resource
                .price
                .and_then(|p| p.parse::<f64>().ok())
                .map(f64::abs),
            external_id: resource.sid,
        })
    }
}

//! Telnyx Messaging API v2

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use serviceai_shared::types::{MessageStatus, SmsProviderKind};
use tracing::{debug, warn};

use crate::channels::{OutboundSms, ProviderError, ProviderReceipt, SmsProvider};
use crate::config::TelnyxConfig;

const KIND: SmsProviderKind = SmsProviderKind::Telnyx;

#[derive(Clone)]
pub struct TelnyxProvider {
    client: Client,
    config: TelnyxConfig,
    webhook_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessageEnvelope {
    data: MessageData,
}

#[derive(Debug, Deserialize)]
struct MessageData {
    id: String,
    #[serde(default)]
    to: Vec<Recipient>,
    cost: Option<Cost>,
}

#[derive(Debug, Deserialize)]
struct Recipient {
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Cost {
    amount: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    #[serde(default)]
    errors: Vec<ErrorItem>,
}

#[derive(Debug, Deserialize)]
struct ErrorItem {
    code: Option<String>,
    title: Option<String>,
    detail: Option<String>,
}

impl TelnyxProvider {
    pub fn new(client: Client, config: &TelnyxConfig, webhook_url: Option<String>) -> Self {
        Self {
            client,
            config: config.clone(),
            webhook_url,
        }
    }
}

#[async_trait]
impl SmsProvider for TelnyxProvider {
    fn kind(&self) -> SmsProviderKind {
        KIND
    }

    fn default_from(&self) -> String {
        self.config.from_phone.clone()
    }

    async fn send(&self, message: &OutboundSms) -> Result<ProviderReceipt, ProviderError> {
        if self.config.api_key.is_empty() {
            return Err(ProviderError::NotConfigured { provider: KIND });
        }

        let mut payload = json!({
            "from": message.from,
            "to": message.to,
            "text": message.body,
        });
        if let Some(profile) = &self.config.messaging_profile_id {
            payload["messaging_profile_id"] = json!(profile);
        }
        if let Some(url) = &self.webhook_url {
            payload["webhook_url"] = json!(url);
        }

        let url = format!("{}/v2/messages", self.config.base_url.trim_end_matches('/'));
        let response = self
            .client
            .post(url)
            .bearer_auth(&self.config.api_key)
            .json(&payload)
            .send()
            .await
            .map_err(|e| ProviderError::from_reqwest(KIND, e))?;

        let status = response.status();
        if !status.is_success() {
            let first = response
                .json::<ErrorEnvelope>()
                .await
                .ok()
                .and_then(|e| e.errors.into_iter().next());
            let (code, text) = match first {
                Some(e) => (e.code, e.detail.or(e.title)),
                None => (None, None),
            };
            warn!(status = %status, code = ?code, "Telnyx rejected send");
            return Err(ProviderError::from_status(
                KIND,
                status,
                code,
                text.unwrap_or_else(|| "request failed".to_string()),
            ));
        }

        let envelope: MessageEnvelope = response
            .json()
            .await
            .map_err(|e| ProviderError::from_reqwest(KIND, e))?;
        let data = envelope.data;

        debug!(id = %data.id, "Telnyx accepted message");

        let status = data
            .to
            .first()
            .and_then(|r| r.status.as_deref())
            .and_then(MessageStatus::from_provider)
            .unwrap_or(MessageStatus::Queued);

        Ok(ProviderReceipt {
            external_id: data.id,
            status,
            cost: data
                .cost
                .and_then(|c| c.amount)
                .and_then(|a| a.parse::<f64>().ok()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use wiremock::matchers::{bearer_token, body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider(server: &MockServer) -> TelnyxProvider {
        let config = TelnyxConfig {
            enabled: true,
            api_key: "KEY123".to_string(),
            from_phone: "+15550000001".to_string(),
            messaging_profile_id: Some("profile-1".to_string()),
            base_url: server.uri(),
        };
        TelnyxProvider::new(Client::new(), &config, None)
    }

    fn message() -> OutboundSms {
        OutboundSms {
            to: "+15551234567".to_string(),
            from: "+15550000001".to_string(),
            body: "Recordatorio de su cita".to_string(),
        }
    }

    #[tokio::test]
    async fn test_send_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v2/messages"))
            .and(bearer_token("KEY123"))
            .and(body_partial_json(json!({
                "to": "+15551234567",
                "messaging_profile_id": "profile-1"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {
                    "id": "40317d1a-0000-0000-0000-000000000001",
                    "to": [{"phone_number": "+15551234567", "status": "queued"}],
                    "cost": {"amount": "0.0040", "currency": "USD"}
                }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let receipt = provider(&server).send(&message()).await.unwrap();
        assert_eq!(receipt.external_id, "40317d1a-0000-0000-0000-000000000001");
        assert_eq!(receipt.status, MessageStatus::Queued);
        assert_eq!(receipt.cost, Some(0.004));
    }

    #[tokio::test]
    async fn test_error_envelope_is_parsed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(422).set_body_json(json!({
                "errors": [{"code": "40310", "title": "Invalid 'to' address", "detail": "The 'to' address is invalid."}]
            })))
            .mount(&server)
            .await;

        let err = provider(&server).send(&message()).await.unwrap_err();
        assert_eq!(
            err,
            ProviderError::Rejected {
                provider: SmsProviderKind::Telnyx,
                code: "40310".to_string(),
                message: "The 'to' address is invalid.".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn test_throttling_is_transport() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        assert!(provider(&server).send(&message()).await.unwrap_err().is_transport());
    }
}

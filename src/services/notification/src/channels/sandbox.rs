//! In-process provider that records messages instead of sending them

use async_trait::async_trait;
use parking_lot::Mutex;
use serviceai_shared::types::{MessageStatus, SmsProviderKind};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::channels::{OutboundSms, ProviderError, ProviderReceipt, SmsProvider};

const KIND: SmsProviderKind = SmsProviderKind::Sandbox;

/// A scripted failure for the next send
#[derive(Debug, Clone, PartialEq)]
pub enum SandboxFailure {
    Transport,
    Rejected(String),
}

#[derive(Clone)]
pub struct SandboxProvider {
    from_phone: String,
    outbox: Arc<Mutex<Vec<(String, OutboundSms)>>>,
    /// Scripted outcomes for upcoming sends; `None` accepts normally
    script: Arc<Mutex<VecDeque<Option<SandboxFailure>>>>,
}

impl SandboxProvider {
    pub fn new(from_phone: &str) -> Self {
        Self {
            from_phone: from_phone.to_string(),
            outbox: Arc::new(Mutex::new(Vec::new())),
            script: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    /// Accepted messages with their external ids, oldest first
    pub fn outbox(&self) -> Vec<(String, OutboundSms)> {
        self.outbox.lock().clone()
    }

    /// Fail the next unscripted send; scripted outcomes are consumed in order
    pub fn fail_next(&self, failure: SandboxFailure) {
        self.script.lock().push_back(Some(failure));
    }

    /// Accept the next send, so a later failure can be scripted behind it
    pub fn pass_next(&self) {
        self.script.lock().push_back(None);
    }
}

#[async_trait]
impl SmsProvider for SandboxProvider {
    fn kind(&self) -> SmsProviderKind {
        KIND
    }

    fn default_from(&self) -> String {
        self.from_phone.clone()
    }

    async fn send(&self, message: &OutboundSms) -> Result<ProviderReceipt, ProviderError> {
        let scripted = self.script.lock().pop_front().flatten();
        if let Some(failure) = scripted {
            return Err(match failure {
                SandboxFailure::Transport => ProviderError::Transport {
                    provider: KIND,
                    message: "simulated outage".to_string(),
                },
                SandboxFailure::Rejected(code) => ProviderError::Rejected {
                    provider: KIND,
                    code,
                    message: "simulated rejection".to_string(),
                },
            });
        }

        let external_id = format!("SB{}", Uuid::new_v4().simple());
        info!(to = %message.to, external_id = %external_id, "Sandbox SMS accepted");
        self.outbox.lock().push((external_id.clone(), message.clone()));

        Ok(ProviderReceipt {
            external_id,
            status: MessageStatus::Sent,
            cost: Some(0.0),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message() -> OutboundSms {
        OutboundSms {
            to: "+15551234567".to_string(),
            from: "+15005550006".to_string(),
            body: "hello".to_string(),
        }
    }

    #[tokio::test]
    async fn test_records_and_scripts_failures() {
        let sandbox = SandboxProvider::new("+15005550006");
        sandbox.fail_next(SandboxFailure::Transport);

        assert!(sandbox.send(&message()).await.unwrap_err().is_transport());
        let receipt = sandbox.send(&message()).await.unwrap();

        let outbox = sandbox.outbox();
        assert_eq!(outbox.len(), 1);
        assert_eq!(outbox[0].0, receipt.external_id);
        assert!(receipt.external_id.starts_with("SB"));
    }

    #[tokio::test]
    async fn test_failure_can_be_scripted_behind_a_success() {
        let sandbox = SandboxProvider::new("+15005550006");
        sandbox.pass_next();
        sandbox.fail_next(SandboxFailure::Transport);

        assert!(sandbox.send(&message()).await.is_ok());
        assert!(sandbox.send(&message()).await.is_err());
        assert!(sandbox.send(&message()).await.is_ok());
        assert_eq!(sandbox.outbox().len(), 2);
    }
}

//! Inbound webhook wire types
//!
//! These mirror what the voice assistant vendor and the SMS vendor actually
//! send. They are deliberately permissive; the ingress layer turns them into
//! strongly typed events before any business logic runs.

use super::core::{EmergencySeverity, Language};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

// ============================================================================
// VOICE ASSISTANT WEBHOOKS
// ============================================================================

/// Envelope the voice vendor wraps server messages in
#[derive(Debug, Clone, Deserialize)]
pub struct VoiceEnvelope {
    pub message: VoiceServerMessage,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum VoiceServerMessage {
    ToolCalls {
        call: Option<CallInfo>,
        #[serde(rename = "toolCallList", default)]
        tool_call_list: Vec<ToolCallItem>,
    },
    StatusUpdate {
        call: Option<CallInfo>,
        status: Option<String>,
    },
    EndOfCallReport {
        call: Option<CallInfo>,
        #[serde(rename = "endedReason")]
        ended_reason: Option<String>,
    },
    #[serde(other)]
    Unsupported,
}

/// One function invocation inside a `tool-calls` message
#[derive(Debug, Clone, Deserialize)]
pub struct ToolCallItem {
    pub id: String,
    pub function: ToolFunction,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ToolFunction {
    pub name: String,
    /// Either a JSON object or a JSON-encoded string, depending on the model
    #[serde(default)]
    pub arguments: serde_json::Value,
}

/// Single tool call posted directly to a tool endpoint
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlatToolCall {
    pub tool_call_id: String,
    pub name: Option<String>,
    pub call: Option<CallInfo>,
    #[serde(default)]
    pub parameters: serde_json::Value,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallInfo {
    pub id: Option<String>,
    #[serde(default)]
    pub metadata: CallMetadata,
    pub customer: Option<PhoneRef>,
    pub phone_number: Option<PhoneRef>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallMetadata {
    pub organization_id: Option<Uuid>,
    pub language: Option<Language>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PhoneRef {
    pub number: Option<String>,
}

/// `{"results":[{toolCallId, result}]}`, the only shape the vendor reads back
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolCallResponse {
    pub results: Vec<ToolResult>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResult {
    pub tool_call_id: String,
    pub result: serde_json::Value,
}

// ============================================================================
// TOOL PARAMETERS
// ============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferCallParams {
    pub reason: Option<String>,
    pub caller_name: Option<String>,
    pub caller_phone: Option<String>,
    pub urgency: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EscalateEmergencyParams {
    #[serde(default = "default_emergency_type")]
    pub emergency_type: String,
    #[serde(default)]
    pub severity: Option<EmergencySeverity>,
    pub description: Option<String>,
    #[serde(alias = "address")]
    pub location: Option<String>,
    pub caller_name: Option<String>,
    pub caller_phone: Option<String>,
}

fn default_emergency_type() -> String {
    "general".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckAvailabilityParams {
    /// `YYYY-MM-DD`
    pub date: String,
    pub service_type: Option<String>,
    pub duration_minutes: Option<i32>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookAppointmentParams {
    pub customer_name: Option<String>,
    pub customer_phone: String,
    pub service_type: String,
    /// `YYYY-MM-DD`
    pub date: String,
    /// `HH:MM`, `HH:MM:SS` or `h:MM AM`
    pub time: String,
    pub duration_minutes: Option<i32>,
    pub address: Option<String>,
    pub language: Option<Language>,
    pub notes: Option<String>,
}

// ============================================================================
// SMS VENDOR WEBHOOKS
// ============================================================================

/// Form-encoded delivery status callback
#[derive(Debug, Clone, PartialEq)]
pub struct SmsStatusCallback {
    pub message_sid: String,
    pub message_status: String,
    pub to: Option<String>,
    pub from: Option<String>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
}

impl SmsStatusCallback {
    /// Build from decoded form pairs; `None` when `MessageSid` or
    /// `MessageStatus` is absent.
    pub fn from_form(form: &HashMap<String, String>) -> Option<Self> {
        let message_sid = non_empty(form.get("MessageSid"))?;
        let message_status = non_empty(form.get("MessageStatus"))
            .or_else(|| non_empty(form.get("SmsStatus")))?;

        Some(Self {
            message_sid,
            message_status,
            to: non_empty(form.get("To")),
            from: non_empty(form.get("From")),
            error_code: non_empty(form.get("ErrorCode")),
            error_message: non_empty(form.get("ErrorMessage")),
        })
    }
}

/// Form-encoded inbound message
#[derive(Debug, Clone, PartialEq)]
pub struct InboundSms {
    pub message_sid: String,
    pub from: String,
    pub to: String,
    pub body: String,
}

impl InboundSms {
    pub fn from_form(form: &HashMap<String, String>) -> Option<Self> {
        Some(Self {
            message_sid: non_empty(form.get("MessageSid"))
                .or_else(|| non_empty(form.get("SmsSid")))?,
            from: non_empty(form.get("From"))?,
            to: non_empty(form.get("To"))?,
            body: form.get("Body").cloned().unwrap_or_default(),
        })
    }
}

fn non_empty(value: Option<&String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_tool_calls_envelope() {
        let envelope: VoiceEnvelope = serde_json::from_value(json!({
            "message": {
                "type": "tool-calls",
                "call": {
                    "id": "call-1",
                    "metadata": {"organizationId": "5f2b6a1e-8a43-4a8e-9d55-1b1f1f0e7c11"}
                },
                "toolCallList": [
                    {"id": "tc-1", "type": "function",
                     "function": {"name": "transferCall", "arguments": {"reason": "billing"}}}
                ]
            }
        }))
        .unwrap();

        match envelope.message {
            VoiceServerMessage::ToolCalls {
                call,
                tool_call_list,
            } => {
                assert_eq!(call.unwrap().id.as_deref(), Some("call-1"));
                assert_eq!(tool_call_list.len(), 1);
                assert_eq!(tool_call_list[0].function.name, "transferCall");
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_message_type_is_unsupported() {
        let envelope: VoiceEnvelope = serde_json::from_value(json!({
            "message": {"type": "speech-update", "status": "started"}
        }))
        .unwrap();
        assert!(matches!(envelope.message, VoiceServerMessage::Unsupported));
    }

    #[test]
    fn test_emergency_params_accept_address_alias() {
        let params: EscalateEmergencyParams = serde_json::from_value(json!({
            "severity": "critical",
            "address": "12 Elm St"
        }))
        .unwrap();
        assert_eq!(params.emergency_type, "general");
        assert_eq!(params.severity, Some(EmergencySeverity::Critical));
        assert_eq!(params.location.as_deref(), Some("12 Elm St"));
    }

    #[test]
    fn test_status_callback_requires_sid_and_status() {
        let mut form = HashMap::new();
        form.insert("MessageSid".to_string(), "SM1".to_string());
        assert!(SmsStatusCallback::from_form(&form).is_none());

        form.insert("MessageStatus".to_string(), "delivered".to_string());
        form.insert("ErrorCode".to_string(), "".to_string());
        let callback = SmsStatusCallback::from_form(&form).unwrap();
        assert_eq!(callback.message_status, "delivered");
        assert_eq!(callback.error_code, None);
    }
}

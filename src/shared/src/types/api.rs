//! API request and response types
//!
//! Dashboard-facing payloads use camelCase field names.

use super::core::{
    EmergencyStatus, Language, SmsProviderKind, TemplateCategory, TimeRange, WorkflowType,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;
use validator::Validate;

// ============================================================================
// COMMON ENVELOPES
// ============================================================================

/// Envelope for management API responses
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: T,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data,
        }
    }
}

/// Envelope for analytics responses
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyticsResponse<T> {
    pub success: bool,
    pub data: T,
    pub time_range: TimeRange,
    pub organization_id: Uuid,
}

/// Query string shared by the analytics endpoints
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyticsQuery {
    pub organization_id: Uuid,
    #[serde(default)]
    pub time_range: TimeRange,
    pub template_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckResponse {
    pub status: String,
    pub service: String,
    pub version: String,
    pub store: String,
    pub providers: Vec<SmsProviderKind>,
    pub uptime_seconds: u64,
}

// ============================================================================
// DISPATCH
// ============================================================================

/// Which vendor a send should go through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderChoice {
    Auto,
    Twilio,
    Telnyx,
    Sandbox,
}

impl Default for ProviderChoice {
    fn default() -> Self {
        ProviderChoice::Auto
    }
}

impl ProviderChoice {
    pub fn specific(&self) -> Option<SmsProviderKind> {
        match self {
            ProviderChoice::Auto => None,
            ProviderChoice::Twilio => Some(SmsProviderKind::Twilio),
            ProviderChoice::Telnyx => Some(SmsProviderKind::Telnyx),
            ProviderChoice::Sandbox => Some(SmsProviderKind::Sandbox),
        }
    }
}

/// Normalized outcome of one logical send
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchResult {
    pub success: bool,
    pub recipient: String,
    /// Record id of the first part
    pub message_id: Option<Uuid>,
    pub external_message_id: Option<String>,
    pub provider: Option<SmsProviderKind>,
    pub cost: Option<f64>,
    /// Carrier segments across every SMS this send produced
    pub segments: u32,
    /// Standalone SMS accepted by a provider; a retry resumes after these
    #[serde(default)]
    pub parts_sent: u32,
    pub language: Option<Language>,
    #[serde(default)]
    pub fallback: bool,
    pub error: Option<String>,
    pub error_code: Option<String>,
    /// Whether repeating the send could succeed
    #[serde(skip)]
    pub retryable: bool,
}

impl DispatchResult {
    pub fn failed(
        recipient: &str,
        error_code: &str,
        error: impl Into<String>,
        retryable: bool,
    ) -> Self {
        Self {
            success: false,
            recipient: recipient.to_string(),
            message_id: None,
            external_message_id: None,
            provider: None,
            cost: None,
            segments: 0,
            parts_sent: 0,
            language: None,
            fallback: false,
            error: Some(error.into()),
            error_code: Some(error_code.to_string()),
            retryable,
        }
    }
}

// ============================================================================
// ANALYTICS
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryStatistics {
    pub total_sent: u64,
    pub delivered: u64,
    pub failed: u64,
    pub pending: u64,
    /// Percentage of sent messages confirmed delivered
    pub delivery_rate: f64,
    pub failure_rate: f64,
    pub total_cost: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrendBucket {
    pub bucket_start: DateTime<Utc>,
    pub sent: u64,
    pub delivered: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplatePerformance {
    pub template_key: String,
    pub total_sent: u64,
    pub delivered: u64,
    pub failed: u64,
    pub delivery_rate: f64,
    pub fallback_count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LanguagePerformance {
    pub language: Language,
    pub total_sent: u64,
    pub delivered: u64,
    pub failed: u64,
    pub delivery_rate: f64,
    /// Messages sent in this language because the requested one was missing
    pub fallback_count: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowMetrics {
    pub created: u64,
    pub scheduled: u64,
    pub in_progress: u64,
    pub completed: u64,
    pub cancelled: u64,
    pub failed: u64,
    /// Mean time from a step's first attempt to its outcome
    pub avg_step_latency_ms: Option<f64>,
    pub best_effort_failures: u64,
}

// ============================================================================
// WORKFLOW API
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateWorkflowRequest {
    pub organization_id: Uuid,
    pub customer_id: Option<Uuid>,
    pub appointment_id: Option<Uuid>,
    pub workflow_type: WorkflowType,
    /// Defaults to now, which executes immediately
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelWorkflowRequest {
    pub workflow_id: Uuid,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionSummary {
    pub picked: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// Claimed by a concurrent run before this one got to it
    pub skipped: usize,
}

/// Appointment lifecycle events that spawn workflows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppointmentEvent {
    Created,
    Rescheduled,
    Cancelled,
    Completed,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppointmentEventRequest {
    pub organization_id: Uuid,
    pub appointment_id: Uuid,
    pub event: AppointmentEvent,
}

// ============================================================================
// TEMPLATE API
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct SaveTemplateRequest {
    pub organization_id: Uuid,
    #[validate(length(min = 1, max = 100, message = "template key must be 1-100 characters"))]
    pub template_key: String,
    pub language: Language,
    #[validate(length(min = 1, max = 1600, message = "content must be 1-1600 characters"))]
    pub content: String,
    #[serde(default)]
    pub variables: Vec<String>,
    pub category: TemplateCategory,
    pub is_active: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateListQuery {
    pub organization_id: Uuid,
    pub language: Option<Language>,
    pub category: Option<TemplateCategory>,
    #[serde(default)]
    pub active_only: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplatePreviewRequest {
    pub organization_id: Uuid,
    pub template_key: String,
    pub language: Language,
    #[serde(default)]
    pub variables: HashMap<String, serde_json::Value>,
}

/// Output of a successful render
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderedTemplate {
    pub template_key: String,
    pub text: String,
    pub requested_language: Language,
    /// Language of the template actually used
    pub language: Language,
    pub fallback: bool,
    pub category: TemplateCategory,
    pub version: i32,
}

// ============================================================================
// EMERGENCY API
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveEmergencyRequest {
    pub organization_id: Uuid,
    pub resolved_by: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmergencyResolution {
    pub id: Uuid,
    pub status: EmergencyStatus,
    pub resolved_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_analytics_query_defaults_time_range() {
        let query: AnalyticsQuery = serde_json::from_value(json!({
            "organizationId": "5f2b6a1e-8a43-4a8e-9d55-1b1f1f0e7c11"
        }))
        .unwrap();
        assert_eq!(query.time_range, TimeRange::LastDay);
        assert!(query.template_key.is_none());
    }

    #[test]
    fn test_dispatch_result_wire_shape() {
        let result = DispatchResult::failed("+15551234567", "INVALID_PHONE_NUMBER", "bad", false);
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["success"], json!(false));
        assert_eq!(value["errorCode"], json!("INVALID_PHONE_NUMBER"));
        assert!(value.get("retryable").is_none());
    }

    #[test]
    fn test_save_template_validation() {
        let request = SaveTemplateRequest {
            organization_id: Uuid::new_v4(),
            template_key: String::new(),
            language: Language::Es,
            content: "Hola".to_string(),
            variables: vec![],
            category: TemplateCategory::Custom,
            is_active: None,
        };
        assert!(request.validate().is_err());
    }
}

//! Core domain types for the ServiceAI notification platform
//!
//! Every entity here is owned by exactly one organization. Enums that are
//! persisted as text columns carry `as_str`/`FromStr` pairs so the storage
//! layer and the wire format agree on spelling.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

// ============================================================================
// LANGUAGE
// ============================================================================

/// Languages the platform can message customers in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    En,
    Es,
}

impl Language {
    pub const ALL: [Language; 2] = [Language::En, Language::Es];

    pub fn as_str(&self) -> &'static str {
        match self {
            Language::En => "en",
            Language::Es => "es",
        }
    }
}

impl Default for Language {
    fn default() -> Self {
        Language::En
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Language {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "en" | "en-us" | "english" => Ok(Language::En),
            "es" | "es-us" | "es-mx" | "spanish" | "español" | "espanol" => Ok(Language::Es),
            _ => Err(format!("Invalid language: {}", s)),
        }
    }
}

// ============================================================================
// ORGANIZATIONS, CUSTOMERS AND CONTACTS
// ============================================================================

/// SMS vendors the dispatcher knows how to talk to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SmsProviderKind {
    Twilio,
    Telnyx,
    Sandbox,
}

impl SmsProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SmsProviderKind::Twilio => "twilio",
            SmsProviderKind::Telnyx => "telnyx",
            SmsProviderKind::Sandbox => "sandbox",
        }
    }
}

impl fmt::Display for SmsProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SmsProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "twilio" => Ok(SmsProviderKind::Twilio),
            "telnyx" => Ok(SmsProviderKind::Telnyx),
            "sandbox" => Ok(SmsProviderKind::Sandbox),
            _ => Err(format!("Invalid SMS provider: {}", s)),
        }
    }
}

/// Tenant boundary. Soft-disabled through `is_active`, never deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Organization {
    pub id: Uuid,
    pub name: String,
    pub default_language: Language,
    /// Offset of the organization's local time from UTC, in minutes
    pub utc_offset_minutes: i32,
    pub business_hours_start: NaiveTime,
    pub business_hours_end: NaiveTime,
    /// Days of the week the business operates, 0 = Sunday
    pub business_days: Vec<i32>,
    pub emergency_contact_name: Option<String>,
    pub emergency_contact_phone: Option<String>,
    pub transfer_phone: Option<String>,
    /// Number customers text and receive texts from
    pub sms_phone: Option<String>,
    /// Number the voice assistant answers on
    pub voice_phone: Option<String>,
    pub preferred_sms_provider: Option<SmsProviderKind>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl Organization {
    /// Convert a UTC instant into the organization's wall-clock time
    pub fn local_time(&self, at: DateTime<Utc>) -> NaiveDateTime {
        at.naive_utc() + Duration::minutes(self.utc_offset_minutes as i64)
    }

    /// Convert a local wall-clock time back into UTC
    pub fn to_utc(&self, local: NaiveDateTime) -> DateTime<Utc> {
        Utc.from_utc_datetime(&(local - Duration::minutes(self.utc_offset_minutes as i64)))
    }

    pub fn is_business_day(&self, date: NaiveDate) -> bool {
        let day = date.weekday().num_days_from_sunday() as i32;
        self.business_days.contains(&day)
    }
}

/// A contactable person belonging to one organization
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Customer {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub name: Option<String>,
    /// E.164 phone number, unique per organization
    pub phone: String,
    pub email: Option<String>,
    pub language_preference: Language,
    pub sms_opt_in: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Member of an organization's on-call rotation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmergencyContact {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub name: String,
    pub phone: String,
    /// 0 = Sunday
    pub available_days: Vec<i32>,
    pub available_hours_start: NaiveTime,
    pub available_hours_end: NaiveTime,
    /// Lower values are paged first
    pub priority: i32,
    pub is_active: bool,
}

impl EmergencyContact {
    /// Whether the contact is on call at the given organization-local time.
    /// Windows whose end precedes their start wrap past midnight and belong to
    /// the day they start on.
    pub fn is_available_at(&self, local: NaiveDateTime) -> bool {
        if !self.is_active {
            return false;
        }

        let day = local.date().weekday().num_days_from_sunday() as i32;
        let previous_day = (day + 6) % 7;
        let time = local.time();
        let start = self.available_hours_start;
        let end = self.available_hours_end;

        if start <= end {
            self.available_days.contains(&day) && time >= start && time < end
        } else {
            (self.available_days.contains(&day) && time >= start)
                || (self.available_days.contains(&previous_day) && time < end)
        }
    }
}

// ============================================================================
// APPOINTMENTS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppointmentStatus {
    Pending,
    Confirmed,
    Cancelled,
    Completed,
    NoShow,
}

impl AppointmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppointmentStatus::Pending => "pending",
            AppointmentStatus::Confirmed => "confirmed",
            AppointmentStatus::Cancelled => "cancelled",
            AppointmentStatus::Completed => "completed",
            AppointmentStatus::NoShow => "no_show",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AppointmentStatus::Cancelled | AppointmentStatus::Completed | AppointmentStatus::NoShow
        )
    }

    pub fn can_transition_to(&self, next: AppointmentStatus) -> bool {
        match (self, next) {
            (AppointmentStatus::Pending, AppointmentStatus::Pending) => false,
            (AppointmentStatus::Pending, _) => true,
            (AppointmentStatus::Confirmed, next) => next.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for AppointmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AppointmentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(AppointmentStatus::Pending),
            "confirmed" => Ok(AppointmentStatus::Confirmed),
            "cancelled" | "canceled" => Ok(AppointmentStatus::Cancelled),
            "completed" => Ok(AppointmentStatus::Completed),
            "no_show" => Ok(AppointmentStatus::NoShow),
            _ => Err(format!("Invalid appointment status: {}", s)),
        }
    }
}

/// A scheduled service visit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Appointment {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub customer_id: Option<Uuid>,
    pub service_type: String,
    /// Organization-local date and time of the visit
    pub scheduled_date: NaiveDate,
    pub scheduled_time: NaiveTime,
    pub duration_minutes: i32,
    pub status: AppointmentStatus,
    /// Overrides the customer's language preference when set
    pub language: Option<Language>,
    pub address: Option<String>,
    pub notes: Option<String>,
    /// Voice assistant tool call that booked the appointment
    pub tool_call_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Appointment {
    pub fn local_start(&self) -> NaiveDateTime {
        self.scheduled_date.and_time(self.scheduled_time)
    }

    pub fn local_end(&self) -> NaiveDateTime {
        self.local_start() + Duration::minutes(self.duration_minutes as i64)
    }

    /// Whether this appointment occupies any part of `[start, end)`
    pub fn overlaps(&self, start: NaiveDateTime, end: NaiveDateTime) -> bool {
        self.status != AppointmentStatus::Cancelled
            && self.local_start() < end
            && start < self.local_end()
    }
}

// ============================================================================
// TEMPLATES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateCategory {
    Confirmation,
    Reminder,
    Cancellation,
    Emergency,
    FollowUp,
    Survey,
    Custom,
}

impl TemplateCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            TemplateCategory::Confirmation => "confirmation",
            TemplateCategory::Reminder => "reminder",
            TemplateCategory::Cancellation => "cancellation",
            TemplateCategory::Emergency => "emergency",
            TemplateCategory::FollowUp => "follow_up",
            TemplateCategory::Survey => "survey",
            TemplateCategory::Custom => "custom",
        }
    }

    /// Emergency alerts go out as standalone `(i/n)` parts so no carrier
    /// can drop the tail; everything else is one concatenated SMS.
    pub fn splits_into_parts(&self) -> bool {
        matches!(self, TemplateCategory::Emergency)
    }

    /// Appointment traffic gets the full segment allowance; engagement and
    /// ad hoc messages a shorter one.
    pub fn is_operational(&self) -> bool {
        matches!(
            self,
            TemplateCategory::Confirmation
                | TemplateCategory::Reminder
                | TemplateCategory::Cancellation
        )
    }
}

impl fmt::Display for TemplateCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TemplateCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "confirmation" => Ok(TemplateCategory::Confirmation),
            "reminder" => Ok(TemplateCategory::Reminder),
            "cancellation" => Ok(TemplateCategory::Cancellation),
            "emergency" => Ok(TemplateCategory::Emergency),
            "follow_up" | "followup" => Ok(TemplateCategory::FollowUp),
            "survey" => Ok(TemplateCategory::Survey),
            "custom" => Ok(TemplateCategory::Custom),
            _ => Err(format!("Invalid template category: {}", s)),
        }
    }
}

/// A versioned, language-specific message pattern.
///
/// `organization_id = None` marks a system template shared by every tenant;
/// organization rows override system rows with the same key and language.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationTemplate {
    pub id: Uuid,
    pub organization_id: Option<Uuid>,
    pub template_key: String,
    pub language: Language,
    pub content: String,
    /// Placeholders that must be supplied when rendering
    pub variables: Vec<String>,
    pub category: TemplateCategory,
    pub is_active: bool,
    pub version: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ============================================================================
// WORKFLOWS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowType {
    AppointmentConfirmation,
    AppointmentReminder,
    AppointmentCancellation,
    EmergencyAlert,
    FollowUp,
    Survey,
}

impl WorkflowType {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowType::AppointmentConfirmation => "appointment_confirmation",
            WorkflowType::AppointmentReminder => "appointment_reminder",
            WorkflowType::AppointmentCancellation => "appointment_cancellation",
            WorkflowType::EmergencyAlert => "emergency_alert",
            WorkflowType::FollowUp => "follow_up",
            WorkflowType::Survey => "survey",
        }
    }

    pub fn category(&self) -> TemplateCategory {
        match self {
            WorkflowType::AppointmentConfirmation => TemplateCategory::Confirmation,
            WorkflowType::AppointmentReminder => TemplateCategory::Reminder,
            WorkflowType::AppointmentCancellation => TemplateCategory::Cancellation,
            WorkflowType::EmergencyAlert => TemplateCategory::Emergency,
            WorkflowType::FollowUp => TemplateCategory::FollowUp,
            WorkflowType::Survey => TemplateCategory::Survey,
        }
    }

    /// Whether the workflow messages a customer (as opposed to staff)
    pub fn targets_customer(&self) -> bool {
        !matches!(self, WorkflowType::EmergencyAlert)
    }
}

impl fmt::Display for WorkflowType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkflowType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "appointment_confirmation" => Ok(WorkflowType::AppointmentConfirmation),
            "appointment_reminder" => Ok(WorkflowType::AppointmentReminder),
            "appointment_cancellation" => Ok(WorkflowType::AppointmentCancellation),
            "emergency_alert" => Ok(WorkflowType::EmergencyAlert),
            "follow_up" => Ok(WorkflowType::FollowUp),
            "survey" => Ok(WorkflowType::Survey),
            _ => Err(format!("Invalid workflow type: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Scheduled,
    InProgress,
    Completed,
    Cancelled,
    Failed,
}

impl WorkflowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStatus::Scheduled => "scheduled",
            WorkflowStatus::InProgress => "in_progress",
            WorkflowStatus::Completed => "completed",
            WorkflowStatus::Cancelled => "cancelled",
            WorkflowStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowStatus::Completed | WorkflowStatus::Cancelled | WorkflowStatus::Failed
        )
    }

    pub fn can_transition_to(&self, next: WorkflowStatus) -> bool {
        match (self, next) {
            (WorkflowStatus::Scheduled, WorkflowStatus::InProgress) => true,
            (WorkflowStatus::Scheduled, WorkflowStatus::Cancelled) => true,
            (WorkflowStatus::InProgress, WorkflowStatus::Completed) => true,
            (WorkflowStatus::InProgress, WorkflowStatus::Failed) => true,
            (WorkflowStatus::InProgress, WorkflowStatus::Cancelled) => true,
            _ => false,
        }
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkflowStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "scheduled" => Ok(WorkflowStatus::Scheduled),
            "in_progress" => Ok(WorkflowStatus::InProgress),
            "completed" => Ok(WorkflowStatus::Completed),
            "cancelled" => Ok(WorkflowStatus::Cancelled),
            "failed" => Ok(WorkflowStatus::Failed),
            _ => Err(format!("Invalid workflow status: {}", s)),
        }
    }
}

/// What a workflow step sends and to whom
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    /// Templated message to the workflow's customer
    CustomerMessage,
    /// Alert to the organization's emergency contact
    EmergencyBroadcast,
    /// Page to whoever is currently on call
    ContactEscalation,
}

impl StepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::CustomerMessage => "customer_message",
            StepKind::EmergencyBroadcast => "emergency_broadcast",
            StepKind::ContactEscalation => "contact_escalation",
        }
    }
}

/// Whether a step's failure fails the workflow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepPolicy {
    Required,
    BestEffort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Sending,
    Sent,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Sending => "sending",
            StepStatus::Sent => "sent",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub index: usize,
    pub kind: StepKind,
    pub template_key: String,
    pub policy: StepPolicy,
    pub status: StepStatus,
    pub attempts: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub message_ids: Vec<Uuid>,
    pub error: Option<String>,
}

impl WorkflowStep {
    pub fn new(index: usize, kind: StepKind, template_key: &str, policy: StepPolicy) -> Self {
        Self {
            index,
            kind,
            template_key: template_key.to_string(),
            policy,
            status: StepStatus::Pending,
            attempts: 0,
            started_at: None,
            completed_at: None,
            message_ids: Vec::new(),
            error: None,
        }
    }

    /// Wall-clock time from first attempt to the final outcome
    pub fn latency(&self) -> Option<Duration> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) if end >= start => Some(end - start),
            _ => None,
        }
    }
}

/// An orchestrated sequence of notifications triggered by one business event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub customer_id: Option<Uuid>,
    pub appointment_id: Option<Uuid>,
    pub workflow_type: WorkflowType,
    pub status: WorkflowStatus,
    pub scheduled_at: DateTime<Utc>,
    pub metadata: serde_json::Value,
    pub steps: Vec<WorkflowStep>,
    pub failed_step: Option<usize>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Workflow {
    /// A step is mid-send while the dispatcher owns it
    pub fn is_sending(&self) -> bool {
        self.steps.iter().any(|s| s.status == StepStatus::Sending)
    }
}

// ============================================================================
// MESSAGES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageDirection {
    Inbound,
    Outbound,
}

impl MessageDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageDirection::Inbound => "inbound",
            MessageDirection::Outbound => "outbound",
        }
    }
}

impl FromStr for MessageDirection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "inbound" => Ok(MessageDirection::Inbound),
            "outbound" => Ok(MessageDirection::Outbound),
            _ => Err(format!("Invalid message direction: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Queued,
    Sent,
    Delivered,
    Failed,
    Undelivered,
    /// Inbound messages land here directly
    Received,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Queued => "queued",
            MessageStatus::Sent => "sent",
            MessageStatus::Delivered => "delivered",
            MessageStatus::Failed => "failed",
            MessageStatus::Undelivered => "undelivered",
            MessageStatus::Received => "received",
        }
    }

    /// Position in the delivery lifecycle; status only ever moves forward
    pub fn rank(&self) -> u8 {
        match self {
            MessageStatus::Queued => 0,
            MessageStatus::Sent => 1,
            MessageStatus::Delivered
            | MessageStatus::Failed
            | MessageStatus::Undelivered
            | MessageStatus::Received => 2,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.rank() == 2
    }

    pub fn can_advance_to(&self, next: MessageStatus) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }

    /// Map a vendor delivery status onto the lifecycle. Unknown strings
    /// return `None` so callers can flag them.
    pub fn from_provider(status: &str) -> Option<Self> {
        match status.to_lowercase().as_str() {
            "accepted" | "queued" | "scheduled" => Some(MessageStatus::Queued),
            "sending" | "sent" => Some(MessageStatus::Sent),
            "delivered" => Some(MessageStatus::Delivered),
            "failed" | "sending_failed" | "canceled" => Some(MessageStatus::Failed),
            "undelivered" | "delivery_failed" | "delivery_unconfirmed" => {
                Some(MessageStatus::Undelivered)
            }
            "received" => Some(MessageStatus::Received),
            _ => None,
        }
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "queued" => Ok(MessageStatus::Queued),
            "sent" => Ok(MessageStatus::Sent),
            "delivered" => Ok(MessageStatus::Delivered),
            "failed" => Ok(MessageStatus::Failed),
            "undelivered" => Ok(MessageStatus::Undelivered),
            "received" => Ok(MessageStatus::Received),
            _ => Err(format!("Invalid message status: {}", s)),
        }
    }
}

/// One SMS attempt, outbound or inbound (`sms_communications`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SmsRecord {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub workflow_id: Option<Uuid>,
    pub appointment_id: Option<Uuid>,
    pub customer_id: Option<Uuid>,
    pub direction: MessageDirection,
    /// Template key, or `direct`/`inbound` for untemplated traffic
    pub message_type: String,
    pub category: TemplateCategory,
    pub language: Language,
    /// The requested language had no active template
    pub language_fallback: bool,
    pub to_phone: String,
    pub from_phone: Option<String>,
    pub body: String,
    /// Part number when a long emergency alert was split, 1-based
    pub part: u32,
    pub total_parts: u32,
    /// Carrier segments billed for this SMS
    #[serde(default = "one_segment")]
    pub segments: u32,
    pub status: MessageStatus,
    pub provider: Option<SmsProviderKind>,
    /// Vendor message id; the join key for delivery-status webhooks
    pub external_message_id: Option<String>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub cost: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

fn one_segment() -> u32 {
    1
}

// ============================================================================
// EMERGENCIES AND TRANSFERS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmergencySeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl EmergencySeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            EmergencySeverity::Low => "low",
            EmergencySeverity::Medium => "medium",
            EmergencySeverity::High => "high",
            EmergencySeverity::Critical => "critical",
        }
    }
}

impl Default for EmergencySeverity {
    fn default() -> Self {
        EmergencySeverity::High
    }
}

impl FromStr for EmergencySeverity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" => Ok(EmergencySeverity::Low),
            "medium" | "moderate" => Ok(EmergencySeverity::Medium),
            "high" | "urgent" => Ok(EmergencySeverity::High),
            "critical" | "life_threatening" => Ok(EmergencySeverity::Critical),
            _ => Err(format!("Invalid emergency severity: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmergencyStatus {
    Pending,
    Sent,
    Resolved,
}

impl EmergencyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EmergencyStatus::Pending => "pending",
            EmergencyStatus::Sent => "sent",
            EmergencyStatus::Resolved => "resolved",
        }
    }

    pub fn can_transition_to(&self, next: EmergencyStatus) -> bool {
        matches!(
            (self, next),
            (EmergencyStatus::Pending, EmergencyStatus::Sent)
                | (EmergencyStatus::Pending, EmergencyStatus::Resolved)
                | (EmergencyStatus::Sent, EmergencyStatus::Resolved)
        )
    }
}

impl FromStr for EmergencyStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(EmergencyStatus::Pending),
            "sent" => Ok(EmergencyStatus::Sent),
            "resolved" => Ok(EmergencyStatus::Resolved),
            _ => Err(format!("Invalid emergency status: {}", s)),
        }
    }
}

/// A detected emergency (`emergency_notifications`), keyed by tool call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmergencyNotification {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub tool_call_id: String,
    pub call_id: Option<String>,
    /// `None` when the organization-level contact was used
    pub contact_id: Option<Uuid>,
    pub contact_name: Option<String>,
    pub contact_phone: String,
    pub emergency_type: String,
    pub severity: EmergencySeverity,
    pub description: Option<String>,
    pub location: Option<String>,
    pub caller_phone: Option<String>,
    pub status: EmergencyStatus,
    pub sms_message_id: Option<Uuid>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferPriority {
    Normal,
    High,
    Urgent,
}

impl TransferPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferPriority::Normal => "normal",
            TransferPriority::High => "high",
            TransferPriority::Urgent => "urgent",
        }
    }
}

impl From<EmergencySeverity> for TransferPriority {
    fn from(severity: EmergencySeverity) -> Self {
        match severity {
            EmergencySeverity::Low | EmergencySeverity::Medium => TransferPriority::High,
            EmergencySeverity::High | EmergencySeverity::Critical => TransferPriority::Urgent,
        }
    }
}

impl FromStr for TransferPriority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "normal" | "low" => Ok(TransferPriority::Normal),
            "high" => Ok(TransferPriority::High),
            "urgent" | "emergency" => Ok(TransferPriority::Urgent),
            _ => Err(format!("Invalid transfer priority: {}", s)),
        }
    }
}

/// A request to hand a live call to a human (`call_transfers`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallTransfer {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub tool_call_id: String,
    pub call_id: Option<String>,
    pub transfer_to: String,
    pub reason: Option<String>,
    pub caller_phone: Option<String>,
    pub priority: TransferPriority,
    pub emergency_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// ANALYTICS WINDOWS
// ============================================================================

/// Fixed analytics windows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TimeRange {
    #[serde(rename = "1h")]
    LastHour,
    #[serde(rename = "24h")]
    LastDay,
    #[serde(rename = "7d")]
    LastWeek,
    #[serde(rename = "30d")]
    LastMonth,
}

impl TimeRange {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeRange::LastHour => "1h",
            TimeRange::LastDay => "24h",
            TimeRange::LastWeek => "7d",
            TimeRange::LastMonth => "30d",
        }
    }

    pub fn bucket_width(&self) -> Duration {
        match self {
            TimeRange::LastHour => Duration::minutes(5),
            TimeRange::LastDay => Duration::hours(1),
            TimeRange::LastWeek | TimeRange::LastMonth => Duration::days(1),
        }
    }

    pub fn bucket_count(&self) -> usize {
        match self {
            TimeRange::LastHour => 12,
            TimeRange::LastDay => 24,
            TimeRange::LastWeek => 7,
            TimeRange::LastMonth => 30,
        }
    }

    /// Start of the bucket containing `at`, aligned to the Unix epoch
    pub fn bucket_floor(&self, at: DateTime<Utc>) -> DateTime<Utc> {
        let width = self.bucket_width().num_seconds();
        let secs = at.timestamp();
        let floored = secs - secs.rem_euclid(width);
        Utc.timestamp_opt(floored, 0).single().unwrap_or(at)
    }

    /// Inclusive start of the window ending at `now`; the first bucket starts here
    pub fn window_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        self.bucket_floor(now) - self.bucket_width() * (self.bucket_count() as i32 - 1)
    }
}

impl Default for TimeRange {
    fn default() -> Self {
        TimeRange::LastDay
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TimeRange {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1h" => Ok(TimeRange::LastHour),
            "24h" => Ok(TimeRange::LastDay),
            "7d" => Ok(TimeRange::LastWeek),
            "30d" => Ok(TimeRange::LastMonth),
            _ => Err(format!("Invalid time range: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn contact(days: Vec<i32>, start: (u32, u32), end: (u32, u32)) -> EmergencyContact {
        EmergencyContact {
            id: Uuid::new_v4(),
            organization_id: Uuid::new_v4(),
            name: "On Call".to_string(),
            phone: "+15550001111".to_string(),
            available_days: days,
            available_hours_start: NaiveTime::from_hms_opt(start.0, start.1, 0).unwrap(),
            available_hours_end: NaiveTime::from_hms_opt(end.0, end.1, 0).unwrap(),
            priority: 1,
            is_active: true,
        }
    }

    fn local(y: i32, m: u32, d: u32, h: u32, min: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, min, 0)
            .unwrap()
    }

    #[test]
    fn test_language_parsing() {
        assert_eq!("ES".parse::<Language>(), Ok(Language::Es));
        assert_eq!("english".parse::<Language>(), Ok(Language::En));
        assert!("fr".parse::<Language>().is_err());
    }

    #[test]
    fn test_workflow_terminal_states_never_transition() {
        let all = [
            WorkflowStatus::Scheduled,
            WorkflowStatus::InProgress,
            WorkflowStatus::Completed,
            WorkflowStatus::Cancelled,
            WorkflowStatus::Failed,
        ];
        for from in all.iter().filter(|s| s.is_terminal()) {
            for to in all {
                assert!(!from.can_transition_to(to), "{} -> {}", from, to);
            }
        }
        assert!(WorkflowStatus::Scheduled.can_transition_to(WorkflowStatus::Cancelled));
        assert!(WorkflowStatus::InProgress.can_transition_to(WorkflowStatus::Cancelled));
        assert!(!WorkflowStatus::Scheduled.can_transition_to(WorkflowStatus::Completed));
    }

    #[test]
    fn test_message_status_is_monotonic() {
        assert!(MessageStatus::Queued.can_advance_to(MessageStatus::Sent));
        assert!(MessageStatus::Sent.can_advance_to(MessageStatus::Delivered));
        assert!(MessageStatus::Queued.can_advance_to(MessageStatus::Failed));
        assert!(!MessageStatus::Sent.can_advance_to(MessageStatus::Sent));
        assert!(!MessageStatus::Delivered.can_advance_to(MessageStatus::Failed));
        assert!(!MessageStatus::Delivered.can_advance_to(MessageStatus::Sent));
    }

    #[test]
    fn test_provider_status_mapping() {
        assert_eq!(MessageStatus::from_provider("sending"), Some(MessageStatus::Sent));
        assert_eq!(
            MessageStatus::from_provider("UNDELIVERED"),
            Some(MessageStatus::Undelivered)
        );
        assert_eq!(MessageStatus::from_provider("exploded"), None);
    }

    #[test]
    fn test_contact_availability_daytime_window() {
        // 2024-03-04 is a Monday
        let c = contact(vec![1, 2, 3, 4, 5], (8, 0), (17, 0));
        assert!(c.is_available_at(local(2024, 3, 4, 9, 30)));
        assert!(!c.is_available_at(local(2024, 3, 4, 17, 0)));
        assert!(!c.is_available_at(local(2024, 3, 3, 9, 30)));
    }

    #[test]
    fn test_contact_availability_overnight_window() {
        // Friday night shift running into Saturday morning
        let c = contact(vec![5], (22, 0), (6, 0));
        assert!(c.is_available_at(local(2024, 3, 8, 23, 0)));
        assert!(c.is_available_at(local(2024, 3, 9, 5, 59)));
        assert!(!c.is_available_at(local(2024, 3, 9, 6, 0)));
        assert!(!c.is_available_at(local(2024, 3, 7, 23, 0)));
    }

    #[test]
    fn test_time_range_buckets_are_aligned() {
        let now = Utc.with_ymd_and_hms(2024, 3, 4, 15, 42, 10).unwrap();

        let day = TimeRange::LastDay;
        assert_eq!(
            day.window_start(now),
            Utc.with_ymd_and_hms(2024, 3, 3, 16, 0, 0).unwrap()
        );

        let hour = TimeRange::LastHour;
        assert_eq!(
            hour.window_start(now),
            Utc.with_ymd_and_hms(2024, 3, 4, 14, 45, 0).unwrap()
        );

        let week = TimeRange::LastWeek;
        assert_eq!(
            week.window_start(now),
            Utc.with_ymd_and_hms(2024, 2, 27, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_time_range_serde_names() {
        let json = serde_json::to_string(&TimeRange::LastMonth).unwrap();
        assert_eq!(json, "\"30d\"");
        let parsed: TimeRange = serde_json::from_str("\"1h\"").unwrap();
        assert_eq!(parsed, TimeRange::LastHour);
    }

    #[test]
    fn test_appointment_overlap_ignores_cancelled() {
        let now = Utc::now();
        let mut appt = Appointment {
            id: Uuid::new_v4(),
            organization_id: Uuid::new_v4(),
            customer_id: None,
            service_type: "hvac_repair".to_string(),
            scheduled_date: NaiveDate::from_ymd_opt(2024, 3, 4).unwrap(),
            scheduled_time: NaiveTime::from_hms_opt(10, 0, 0).unwrap(),
            duration_minutes: 60,
            status: AppointmentStatus::Confirmed,
            language: None,
            address: None,
            notes: None,
            tool_call_id: None,
            created_at: now,
            updated_at: now,
        };
        let slot_start = local(2024, 3, 4, 10, 30);
        let slot_end = local(2024, 3, 4, 11, 30);
        assert!(appt.overlaps(slot_start, slot_end));
        assert!(!appt.overlaps(local(2024, 3, 4, 11, 0), local(2024, 3, 4, 12, 0)));

        appt.status = AppointmentStatus::Cancelled;
        assert!(!appt.overlaps(slot_start, slot_end));
    }
}

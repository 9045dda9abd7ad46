//! Persistence capability
//!
//! The relational store is reached only through [`Persistence`]. Every method
//! is a single keyed write or read so concurrent webhook replays race to the
//! same end state. Reads that take an organization id never return rows owned
//! by another organization.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serviceai_shared::types::{
    Appointment, AppointmentStatus, CallTransfer, Customer, EmergencyContact,
    EmergencyNotification, EmergencyStatus, Language, MessageStatus, NotificationTemplate,
    Organization, SmsProviderKind, SmsRecord, TemplateCategory, Workflow, WorkflowStatus,
    WorkflowStep,
};
use thiserror::Error;
use uuid::Uuid;

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{entity} not found")]
    NotFound { entity: String },

    #[error("Conflict: {message}")]
    Conflict { message: String },

    #[error("Store backend error: {message}")]
    Backend { message: String },
}

impl StoreError {
    pub fn not_found<S: Into<String>>(entity: S) -> Self {
        Self::NotFound {
            entity: entity.into(),
        }
    }

    pub fn conflict<S: Into<String>>(message: S) -> Self {
        Self::Conflict {
            message: message.into(),
        }
    }

    pub fn backend<S: Into<String>>(message: S) -> Self {
        Self::Backend {
            message: message.into(),
        }
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => StoreError::not_found("row"),
            sqlx::Error::Database(db) if db.code().as_deref() == Some("23505") => {
                StoreError::conflict(db.message().to_string())
            }
            _ => StoreError::backend(err.to_string()),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Result of an insert keyed by an idempotency key
#[derive(Debug, Clone, PartialEq)]
pub enum InsertOutcome<T> {
    Inserted(T),
    /// A row with the same key already existed and was left untouched
    Existing(T),
}

impl<T> InsertOutcome<T> {
    pub fn into_inner(self) -> T {
        match self {
            InsertOutcome::Inserted(value) | InsertOutcome::Existing(value) => value,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, InsertOutcome::Inserted(_))
    }
}

/// Delivery status reported by the SMS vendor
#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    pub status: MessageStatus,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StatusAdvance {
    /// Status moved forward
    Applied(SmsRecord),
    /// Same or older status; the record is unchanged
    Ignored(SmsRecord),
    /// No record carries the external id
    Unknown,
}

/// Outcome of the vendor call for a record logged before sending
#[derive(Debug, Clone, PartialEq)]
pub struct SendCompletion {
    pub status: MessageStatus,
    pub provider: Option<SmsProviderKind>,
    pub external_message_id: Option<String>,
    pub cost: Option<f64>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub at: DateTime<Utc>,
}

/// Compare-and-set workflow status change
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowTransition {
    /// Statuses the workflow must currently be in
    pub from: Vec<WorkflowStatus>,
    pub to: WorkflowStatus,
    pub failure_reason: Option<String>,
    pub failed_step: Option<usize>,
    /// Reject while any step is `sending`
    pub require_idle: bool,
    pub at: DateTime<Utc>,
}

impl WorkflowTransition {
    pub fn new(from: &[WorkflowStatus], to: WorkflowStatus, at: DateTime<Utc>) -> Self {
        Self {
            from: from.to_vec(),
            to,
            failure_reason: None,
            failed_step: None,
            require_idle: false,
            at,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransitionOutcome {
    Applied(Workflow),
    Rejected {
        current: WorkflowStatus,
        busy: bool,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct EmergencyUpdate {
    pub status: EmergencyStatus,
    pub sms_message_id: Option<Uuid>,
    pub last_error: Option<String>,
    pub resolved_by: Option<String>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TemplateFilter {
    pub language: Option<Language>,
    pub category: Option<TemplateCategory>,
    pub active_only: bool,
}

impl TemplateFilter {
    pub fn matches(&self, template: &NotificationTemplate) -> bool {
        self.language.map_or(true, |l| template.language == l)
            && self.category.map_or(true, |c| template.category == c)
            && (!self.active_only || template.is_active)
    }
}

/// Storage operations the notification service depends on
#[async_trait]
pub trait Persistence: Send + Sync {
    /// Short backend name for health output
    fn backend(&self) -> &'static str;

    async fn health_check(&self) -> StoreResult<()>;

    // Organizations

    async fn get_organization(&self, id: Uuid) -> StoreResult<Option<Organization>>;

    /// Organization owning a voice or SMS number
    async fn find_organization_by_phone(&self, phone: &str) -> StoreResult<Option<Organization>>;

    async fn is_member(&self, organization_id: Uuid, user_id: &str) -> StoreResult<bool>;

    // Customers

    async fn get_customer(&self, organization_id: Uuid, id: Uuid) -> StoreResult<Option<Customer>>;

    async fn find_customer_by_phone(
        &self,
        organization_id: Uuid,
        phone: &str,
    ) -> StoreResult<Option<Customer>>;

    /// Insert or update keyed by `(organization_id, phone)`
    async fn upsert_customer(&self, customer: Customer) -> StoreResult<Customer>;

    async fn set_customer_opt_in(
        &self,
        organization_id: Uuid,
        phone: &str,
        opt_in: bool,
    ) -> StoreResult<Option<Customer>>;

    /// Highest-priority active contact whose rotation window covers `at`
    async fn find_on_call_contact(
        &self,
        organization_id: Uuid,
        at: DateTime<Utc>,
    ) -> StoreResult<Option<EmergencyContact>>;

    // Appointments

    /// Keyed by `(organization_id, tool_call_id)` when a tool call id is set
    async fn insert_appointment_if_absent(
        &self,
        appointment: Appointment,
    ) -> StoreResult<InsertOutcome<Appointment>>;

    async fn get_appointment(
        &self,
        organization_id: Uuid,
        id: Uuid,
    ) -> StoreResult<Option<Appointment>>;

    async fn list_appointments_on(
        &self,
        organization_id: Uuid,
        date: NaiveDate,
    ) -> StoreResult<Vec<Appointment>>;

    async fn update_appointment_status(
        &self,
        organization_id: Uuid,
        id: Uuid,
        status: AppointmentStatus,
    ) -> StoreResult<Appointment>;

    /// Earliest open appointment starting at or after the local time `after`
    async fn find_next_appointment_for_customer(
        &self,
        organization_id: Uuid,
        customer_id: Uuid,
        after: NaiveDateTime,
    ) -> StoreResult<Option<Appointment>>;

    // Templates

    /// Exact lookup; `organization_id = None` addresses system templates
    async fn find_template(
        &self,
        organization_id: Option<Uuid>,
        key: &str,
        language: Language,
    ) -> StoreResult<Option<NotificationTemplate>>;

    /// Insert or replace keyed by `(organization_id, key, language)`,
    /// bumping `version` on replace
    async fn upsert_template(
        &self,
        template: NotificationTemplate,
    ) -> StoreResult<NotificationTemplate>;

    /// Organization rows plus system rows
    async fn list_templates(
        &self,
        organization_id: Uuid,
        filter: &TemplateFilter,
    ) -> StoreResult<Vec<NotificationTemplate>>;

    // Workflows

    async fn insert_workflow(&self, workflow: Workflow) -> StoreResult<Workflow>;

    async fn get_workflow(&self, id: Uuid) -> StoreResult<Option<Workflow>>;

    /// Scheduled workflows with `scheduled_at <= now`, oldest first
    async fn list_due_workflows(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<Workflow>>;

    async fn transition_workflow(
        &self,
        id: Uuid,
        transition: &WorkflowTransition,
    ) -> StoreResult<TransitionOutcome>;

    /// Persist step progress; returns false once the workflow has left
    /// `in_progress`
    async fn save_workflow_steps(&self, id: Uuid, steps: &[WorkflowStep]) -> StoreResult<bool>;

    async fn list_workflows(
        &self,
        organization_id: Uuid,
        since: DateTime<Utc>,
    ) -> StoreResult<Vec<Workflow>>;

    async fn list_workflows_for_appointment(
        &self,
        organization_id: Uuid,
        appointment_id: Uuid,
    ) -> StoreResult<Vec<Workflow>>;

    // Messages

    /// Fails with `Conflict` when the external id is already used in the
    /// organization
    async fn insert_message(&self, record: SmsRecord) -> StoreResult<SmsRecord>;

    async fn find_message_by_external_id(
        &self,
        external_message_id: &str,
    ) -> StoreResult<Option<SmsRecord>>;

    /// Monotonic compare-and-set on the delivery status
    async fn advance_message_status(
        &self,
        external_message_id: &str,
        update: &StatusUpdate,
    ) -> StoreResult<StatusAdvance>;

    async fn complete_message_send(
        &self,
        id: Uuid,
        completion: &SendCompletion,
    ) -> StoreResult<SmsRecord>;

    async fn list_messages(
        &self,
        organization_id: Uuid,
        since: DateTime<Utc>,
    ) -> StoreResult<Vec<SmsRecord>>;

    // Emergencies and transfers

    /// Keyed by `(organization_id, tool_call_id)`
    async fn insert_emergency_if_absent(
        &self,
        emergency: EmergencyNotification,
    ) -> StoreResult<InsertOutcome<EmergencyNotification>>;

    /// Re-applying the current status only refreshes the detail fields
    async fn update_emergency_status(
        &self,
        organization_id: Uuid,
        id: Uuid,
        update: &EmergencyUpdate,
    ) -> StoreResult<EmergencyNotification>;

    async fn get_emergency(
        &self,
        organization_id: Uuid,
        id: Uuid,
    ) -> StoreResult<Option<EmergencyNotification>>;

    /// Keyed by `(organization_id, tool_call_id)`
    async fn insert_transfer_if_absent(
        &self,
        transfer: CallTransfer,
    ) -> StoreResult<InsertOutcome<CallTransfer>>;
}

/// Shared decision for [`Persistence::transition_workflow`] implementations
pub(crate) fn check_transition(
    workflow: &Workflow,
    transition: &WorkflowTransition,
) -> Option<TransitionOutcome> {
    let busy = transition.require_idle && workflow.is_sending();
    if !transition.from.contains(&workflow.status)
        || !workflow.status.can_transition_to(transition.to)
        || busy
    {
        return Some(TransitionOutcome::Rejected {
            current: workflow.status,
            busy,
        });
    }
    None
}

/// Apply an accepted transition to an in-memory workflow value
pub(crate) fn apply_transition(workflow: &mut Workflow, transition: &WorkflowTransition) {
    workflow.status = transition.to;
    workflow.updated_at = transition.at;
    if transition.to == WorkflowStatus::InProgress {
        workflow.started_at = Some(transition.at);
    }
    if transition.to.is_terminal() {
        workflow.completed_at = Some(transition.at);
    }
    if transition.failure_reason.is_some() {
        workflow.failure_reason = transition.failure_reason.clone();
    }
    if transition.failed_step.is_some() {
        workflow.failed_step = transition.failed_step;
    }
}

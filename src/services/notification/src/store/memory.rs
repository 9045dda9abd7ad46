//! In-process store used by tests and local development
//!
//! All state sits behind one `parking_lot` lock. Every trait method takes the
//! lock once, so each call is atomic and the lock is never held across an
//! await point.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serviceai_shared::types::{
    Appointment, AppointmentStatus, CallTransfer, Customer, EmergencyContact,
    EmergencyNotification, EmergencyStatus, Language, MessageStatus, NotificationTemplate,
    Organization, SmsRecord, Workflow, WorkflowStatus, WorkflowStep,
};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

use super::{
    apply_transition, check_transition, EmergencyUpdate, InsertOutcome, Persistence,
    SendCompletion, StatusAdvance, StatusUpdate, StoreError, StoreResult, TemplateFilter,
    TransitionOutcome, WorkflowTransition,
};

#[derive(Default)]
struct MemoryState {
    organizations: HashMap<Uuid, Organization>,
    members: HashMap<Uuid, HashSet<String>>,
    customers: HashMap<Uuid, Customer>,
    contacts: HashMap<Uuid, EmergencyContact>,
    appointments: HashMap<Uuid, Appointment>,
    templates: HashMap<Uuid, NotificationTemplate>,
    workflows: HashMap<Uuid, Workflow>,
    messages: Vec<SmsRecord>,
    emergencies: HashMap<Uuid, EmergencyNotification>,
    transfers: HashMap<Uuid, CallTransfer>,
}

#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
    /// Scripted backend failures: operation name to calls let through first
    faults: Mutex<HashMap<&'static str, usize>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_organization(&self, organization: Organization) {
        self.state
            .write()
            .organizations
            .insert(organization.id, organization);
    }

    pub fn add_member(&self, organization_id: Uuid, user_id: &str) {
        self.state
            .write()
            .members
            .entry(organization_id)
            .or_default()
            .insert(user_id.to_string());
    }

    pub fn insert_contact(&self, contact: EmergencyContact) {
        self.state.write().contacts.insert(contact.id, contact);
    }

    /// Every message row, in insertion order
    pub fn messages(&self) -> Vec<SmsRecord> {
        self.state.read().messages.clone()
    }

    pub fn emergencies(&self) -> Vec<EmergencyNotification> {
        self.state.read().emergencies.values().cloned().collect()
    }

    pub fn transfers(&self) -> Vec<CallTransfer> {
        self.state.read().transfers.values().cloned().collect()
    }

    /// Fail one call to `operation` with a backend error after letting
    /// `pass` calls through. Covers the writes whose failure callers must
    /// survive: `set_customer_opt_in`, `find_on_call_contact`,
    /// `save_workflow_steps`, `insert_emergency_if_absent` and
    /// `insert_transfer_if_absent`.
    pub fn fail_operation(&self, operation: &'static str, pass: usize) {
        self.faults.lock().insert(operation, pass);
    }

    fn check_fault(&self, operation: &'static str) -> StoreResult<()> {
        let mut faults = self.faults.lock();
        match faults.get_mut(operation) {
            Some(0) => {
                faults.remove(operation);
                Err(StoreError::backend(format!("{} unavailable", operation)))
            }
            Some(pass) => {
                *pass -= 1;
                Ok(())
            }
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Persistence for MemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn health_check(&self) -> StoreResult<()> {
        Ok(())
    }

    async fn get_organization(&self, id: Uuid) -> StoreResult<Option<Organization>> {
        Ok(self.state.read().organizations.get(&id).cloned())
    }

    async fn find_organization_by_phone(&self, phone: &str) -> StoreResult<Option<Organization>> {
        let state = self.state.read();
        Ok(state
            .organizations
            .values()
            .find(|o| {
                o.voice_phone.as_deref() == Some(phone) || o.sms_phone.as_deref() == Some(phone)
            })
            .cloned())
    }

    async fn is_member(&self, organization_id: Uuid, user_id: &str) -> StoreResult<bool> {
        Ok(self
            .state
            .read()
            .members
            .get(&organization_id)
            .map_or(false, |m| m.contains(user_id)))
    }

    async fn get_customer(&self, organization_id: Uuid, id: Uuid) -> StoreResult<Option<Customer>> {
        Ok(self
            .state
            .read()
            .customers
            .get(&id)
            .filter(|c| c.organization_id == organization_id)
            .cloned())
    }

    async fn find_customer_by_phone(
        &self,
        organization_id: Uuid,
        phone: &str,
    ) -> StoreResult<Option<Customer>> {
        Ok(self
            .state
            .read()
            .customers
            .values()
            .find(|c| c.organization_id == organization_id && c.phone == phone)
            .cloned())
    }

    async fn upsert_customer(&self, customer: Customer) -> StoreResult<Customer> {
        let mut state = self.state.write();
        let existing = state
            .customers
            .values_mut()
            .find(|c| c.organization_id == customer.organization_id && c.phone == customer.phone);

        match existing {
            Some(current) => {
                if customer.name.is_some() {
                    current.name = customer.name;
                }
                if customer.email.is_some() {
                    current.email = customer.email;
                }
                current.language_preference = customer.language_preference;
                current.updated_at = customer.updated_at;
                Ok(current.clone())
            }
            None => {
                state.customers.insert(customer.id, customer.clone());
                Ok(customer)
            }
        }
    }

    async fn set_customer_opt_in(
        &self,
        organization_id: Uuid,
        phone: &str,
        opt_in: bool,
    ) -> StoreResult<Option<Customer>> {
        self.check_fault("set_customer_opt_in")?;
        let mut state = self.state.write();
        Ok(state
            .customers
            .values_mut()
            .find(|c| c.organization_id == organization_id && c.phone == phone)
            .map(|c| {
                c.sms_opt_in = opt_in;
                c.updated_at = Utc::now();
                c.clone()
            }))
    }

    async fn find_on_call_contact(
        &self,
        organization_id: Uuid,
        at: DateTime<Utc>,
    ) -> StoreResult<Option<EmergencyContact>> {
        self.check_fault("find_on_call_contact")?;
        let state = self.state.read();
        let local = match state.organizations.get(&organization_id) {
            Some(org) => org.local_time(at),
            None => return Ok(None),
        };

        Ok(state
            .contacts
            .values()
            .filter(|c| c.organization_id == organization_id && c.is_available_at(local))
            .min_by_key(|c| c.priority)
            .cloned())
    }

    async fn insert_appointment_if_absent(
        &self,
        appointment: Appointment,
    ) -> StoreResult<InsertOutcome<Appointment>> {
        let mut state = self.state.write();
        if let Some(tool_call_id) = appointment.tool_call_id.as_deref() {
            if let Some(existing) = state.appointments.values().find(|a| {
                a.organization_id == appointment.organization_id
                    && a.tool_call_id.as_deref() == Some(tool_call_id)
            }) {
                return Ok(InsertOutcome::Existing(existing.clone()));
            }
        }
        state
            .appointments
            .insert(appointment.id, appointment.clone());
        Ok(InsertOutcome::Inserted(appointment))
    }

    async fn get_appointment(
        &self,
        organization_id: Uuid,
        id: Uuid,
    ) -> StoreResult<Option<Appointment>> {
        Ok(self
            .state
            .read()
            .appointments
            .get(&id)
            .filter(|a| a.organization_id == organization_id)
            .cloned())
    }

    async fn list_appointments_on(
        &self,
        organization_id: Uuid,
        date: NaiveDate,
    ) -> StoreResult<Vec<Appointment>> {
        let mut appointments: Vec<Appointment> = self
            .state
            .read()
            .appointments
            .values()
            .filter(|a| a.organization_id == organization_id && a.scheduled_date == date)
            .cloned()
            .collect();
        appointments.sort_by_key(|a| a.scheduled_time);
        Ok(appointments)
    }

    async fn update_appointment_status(
        &self,
        organization_id: Uuid,
        id: Uuid,
        status: AppointmentStatus,
    ) -> StoreResult<Appointment> {
        let mut state = self.state.write();
        let appointment = state
            .appointments
            .get_mut(&id)
            .filter(|a| a.organization_id == organization_id)
            .ok_or_else(|| StoreError::not_found(format!("appointment {}", id)))?;

        if appointment.status == status {
            return Ok(appointment.clone());
        }
        if !appointment.status.can_transition_to(status) {
            return Err(StoreError::conflict(format!(
                "appointment {} cannot move from {} to {}",
                id, appointment.status, status
            )));
        }
        appointment.status = status;
        appointment.updated_at = Utc::now();
        Ok(appointment.clone())
    }

    async fn find_next_appointment_for_customer(
        &self,
        organization_id: Uuid,
        customer_id: Uuid,
        after: NaiveDateTime,
    ) -> StoreResult<Option<Appointment>> {
        Ok(self
            .state
            .read()
            .appointments
            .values()
            .filter(|a| {
                a.organization_id == organization_id
                    && a.customer_id == Some(customer_id)
                    && !a.status.is_terminal()
                    && a.local_start() >= after
            })
            .min_by_key(|a| a.local_start())
            .cloned())
    }

    async fn find_template(
        &self,
        organization_id: Option<Uuid>,
        key: &str,
        language: Language,
    ) -> StoreResult<Option<NotificationTemplate>> {
        Ok(self
            .state
            .read()
            .templates
            .values()
            .find(|t| {
                t.organization_id == organization_id
                    && t.template_key == key
                    && t.language == language
            })
            .cloned())
    }

    async fn upsert_template(
        &self,
        template: NotificationTemplate,
    ) -> StoreResult<NotificationTemplate> {
        let mut state = self.state.write();
        let existing = state.templates.values_mut().find(|t| {
            t.organization_id == template.organization_id
                && t.template_key == template.template_key
                && t.language == template.language
        });

        match existing {
            Some(current) => {
                current.content = template.content;
                current.variables = template.variables;
                current.category = template.category;
                current.is_active = template.is_active;
                current.version += 1;
                current.updated_at = template.updated_at;
                Ok(current.clone())
            }
            None => {
                state.templates.insert(template.id, template.clone());
                Ok(template)
            }
        }
    }

    async fn list_templates(
        &self,
        organization_id: Uuid,
        filter: &TemplateFilter,
    ) -> StoreResult<Vec<NotificationTemplate>> {
        let mut templates: Vec<NotificationTemplate> = self
            .state
            .read()
            .templates
            .values()
            .filter(|t| {
                (t.organization_id.is_none() || t.organization_id == Some(organization_id))
                    && filter.matches(t)
            })
            .cloned()
            .collect();
        templates.sort_by(|a, b| {
            (&a.template_key, a.language.as_str(), a.organization_id.is_some()).cmp(&(
                &b.template_key,
                b.language.as_str(),
                b.organization_id.is_some(),
            ))
        });
        Ok(templates)
    }

    async fn insert_workflow(&self, workflow: Workflow) -> StoreResult<Workflow> {
        let mut state = self.state.write();
        if state.workflows.contains_key(&workflow.id) {
            return Err(StoreError::conflict(format!(
                "workflow {} already exists",
                workflow.id
            )));
        }
        state.workflows.insert(workflow.id, workflow.clone());
        Ok(workflow)
    }

    async fn get_workflow(&self, id: Uuid) -> StoreResult<Option<Workflow>> {
        Ok(self.state.read().workflows.get(&id).cloned())
    }

    async fn list_due_workflows(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<Workflow>> {
        let mut due: Vec<Workflow> = self
            .state
            .read()
            .workflows
            .values()
            .filter(|w| w.status == WorkflowStatus::Scheduled && w.scheduled_at <= now)
            .cloned()
            .collect();
        due.sort_by_key(|w| w.scheduled_at);
        due.truncate(limit);
        Ok(due)
    }

    async fn transition_workflow(
        &self,
        id: Uuid,
        transition: &WorkflowTransition,
    ) -> StoreResult<TransitionOutcome> {
        let mut state = self.state.write();
        let workflow = state
            .workflows
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found(format!("workflow {}", id)))?;

        if let Some(rejected) = check_transition(workflow, transition) {
            return Ok(rejected);
        }
        apply_transition(workflow, transition);
        Ok(TransitionOutcome::Applied(workflow.clone()))
    }

    async fn save_workflow_steps(&self, id: Uuid, steps: &[WorkflowStep]) -> StoreResult<bool> {
        self.check_fault("save_workflow_steps")?;
        let mut state = self.state.write();
        let workflow = state
            .workflows
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found(format!("workflow {}", id)))?;

        if workflow.status != WorkflowStatus::InProgress {
            return Ok(false);
        }
        workflow.steps = steps.to_vec();
        workflow.updated_at = Utc::now();
        Ok(true)
    }

    async fn list_workflows(
        &self,
        organization_id: Uuid,
        since: DateTime<Utc>,
    ) -> StoreResult<Vec<Workflow>> {
        Ok(self
            .state
            .read()
            .workflows
            .values()
            .filter(|w| w.organization_id == organization_id && w.created_at >= since)
            .cloned()
            .collect())
    }

    async fn list_workflows_for_appointment(
        &self,
        organization_id: Uuid,
        appointment_id: Uuid,
    ) -> StoreResult<Vec<Workflow>> {
        let mut workflows: Vec<Workflow> = self
            .state
            .read()
            .workflows
            .values()
            .filter(|w| {
                w.organization_id == organization_id && w.appointment_id == Some(appointment_id)
            })
            .cloned()
            .collect();
        workflows.sort_by_key(|w| w.created_at);
        Ok(workflows)
    }

    async fn insert_message(&self, record: SmsRecord) -> StoreResult<SmsRecord> {
        let mut state = self.state.write();
        if let Some(external_id) = record.external_message_id.as_deref() {
            let duplicate = state.messages.iter().any(|m| {
                m.organization_id == record.organization_id
                    && m.external_message_id.as_deref() == Some(external_id)
            });
            if duplicate {
                return Err(StoreError::conflict(format!(
                    "message {} already recorded",
                    external_id
                )));
            }
        }
        state.messages.push(record.clone());
        Ok(record)
    }

    async fn find_message_by_external_id(
        &self,
        external_message_id: &str,
    ) -> StoreResult<Option<SmsRecord>> {
        Ok(self
            .state
            .read()
            .messages
            .iter()
            .find(|m| m.external_message_id.as_deref() == Some(external_message_id))
            .cloned())
    }

    async fn advance_message_status(
        &self,
        external_message_id: &str,
        update: &StatusUpdate,
    ) -> StoreResult<StatusAdvance> {
        let mut state = self.state.write();
        let record = match state
            .messages
            .iter_mut()
            .find(|m| m.external_message_id.as_deref() == Some(external_message_id))
        {
            Some(record) => record,
            None => return Ok(StatusAdvance::Unknown),
        };

        if !record.status.can_advance_to(update.status) {
            return Ok(StatusAdvance::Ignored(record.clone()));
        }

        apply_status_update(record, update);
        Ok(StatusAdvance::Applied(record.clone()))
    }

    async fn complete_message_send(
        &self,
        id: Uuid,
        completion: &SendCompletion,
    ) -> StoreResult<SmsRecord> {
        let mut state = self.state.write();
        let record = state
            .messages
            .iter_mut()
            .find(|m| m.id == id)
            .ok_or_else(|| StoreError::not_found(format!("message {}", id)))?;

        if record.status.can_advance_to(completion.status) {
            record.status = completion.status;
            if completion.status == MessageStatus::Sent {
                record.sent_at = Some(completion.at);
            }
        }
        record.provider = completion.provider.or(record.provider);
        if completion.external_message_id.is_some() {
            record.external_message_id = completion.external_message_id.clone();
        }
        record.cost = completion.cost.or(record.cost);
        record.error_code = completion.error_code.clone();
        record.error_message = completion.error_message.clone();
        record.updated_at = completion.at;
        Ok(record.clone())
    }

    async fn list_messages(
        &self,
        organization_id: Uuid,
        since: DateTime<Utc>,
    ) -> StoreResult<Vec<SmsRecord>> {
        Ok(self
            .state
            .read()
            .messages
            .iter()
            .filter(|m| m.organization_id == organization_id && m.created_at >= since)
            .cloned()
            .collect())
    }

    async fn insert_emergency_if_absent(
        &self,
        emergency: EmergencyNotification,
    ) -> StoreResult<InsertOutcome<EmergencyNotification>> {
        self.check_fault("insert_emergency_if_absent")?;
        let mut state = self.state.write();
        if let Some(existing) = state.emergencies.values().find(|e| {
            e.organization_id == emergency.organization_id
                && e.tool_call_id == emergency.tool_call_id
        }) {
            return Ok(InsertOutcome::Existing(existing.clone()));
        }
        state.emergencies.insert(emergency.id, emergency.clone());
        Ok(InsertOutcome::Inserted(emergency))
    }

    async fn update_emergency_status(
        &self,
        organization_id: Uuid,
        id: Uuid,
        update: &EmergencyUpdate,
    ) -> StoreResult<EmergencyNotification> {
        let mut state = self.state.write();
        let emergency = state
            .emergencies
            .get_mut(&id)
            .filter(|e| e.organization_id == organization_id)
            .ok_or_else(|| StoreError::not_found(format!("emergency {}", id)))?;

        if emergency.status != update.status {
            if !emergency.status.can_transition_to(update.status) {
                return Err(StoreError::conflict(format!(
                    "emergency {} cannot move from {} to {}",
                    id,
                    emergency.status.as_str(),
                    update.status.as_str()
                )));
            }
            emergency.status = update.status;
            match update.status {
                EmergencyStatus::Sent => emergency.sent_at = Some(update.at),
                EmergencyStatus::Resolved => {
                    emergency.resolved_at = Some(update.at);
                    emergency.resolved_by = update.resolved_by.clone();
                }
                EmergencyStatus::Pending => {}
            }
        }
        if update.sms_message_id.is_some() {
            emergency.sms_message_id = update.sms_message_id;
        }
        if update.last_error.is_some() {
            emergency.last_error = update.last_error.clone();
        }
        Ok(emergency.clone())
    }

    async fn get_emergency(
        &self,
        organization_id: Uuid,
        id: Uuid,
    ) -> StoreResult<Option<EmergencyNotification>> {
        Ok(self
            .state
            .read()
            .emergencies
            .get(&id)
            .filter(|e| e.organization_id == organization_id)
            .cloned())
    }

    async fn insert_transfer_if_absent(
        &self,
        transfer: CallTransfer,
    ) -> StoreResult<InsertOutcome<CallTransfer>> {
        self.check_fault("insert_transfer_if_absent")?;
        let mut state = self.state.write();
        if let Some(existing) = state.transfers.values().find(|t| {
            t.organization_id == transfer.organization_id
                && t.tool_call_id == transfer.tool_call_id
        }) {
            return Ok(InsertOutcome::Existing(existing.clone()));
        }
        state.transfers.insert(transfer.id, transfer.clone());
        Ok(InsertOutcome::Inserted(transfer))
    }
}

fn apply_status_update(record: &mut SmsRecord, update: &StatusUpdate) {
    record.status = update.status;
    record.updated_at = update.at;
    match update.status {
        MessageStatus::Sent => {
            record.sent_at.get_or_insert(update.at);
        }
        MessageStatus::Delivered => {
            record.sent_at.get_or_insert(update.at);
            record.delivered_at = Some(update.at);
        }
        _ => {}
    }
    if update.error_code.is_some() {
        record.error_code = update.error_code.clone();
    }
    if update.error_message.is_some() {
        record.error_message = update.error_message.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, NaiveTime, TimeZone};
    use pretty_assertions::assert_eq;
    use serviceai_shared::types::{
        MessageDirection, SmsProviderKind, StepKind, StepPolicy, StepStatus, TemplateCategory,
        WorkflowType,
    };

    fn organization() -> Organization {
        Organization {
            id: Uuid::new_v4(),
            name: "Cool Air HVAC".to_string(),
            default_language: Language::En,
            utc_offset_minutes: -300,
            business_hours_start: NaiveTime::from_hms_opt(8, 0, 0).unwrap(),
            business_hours_end: NaiveTime::from_hms_opt(17, 0, 0).unwrap(),
            business_days: vec![1, 2, 3, 4, 5],
            emergency_contact_name: Some("Owner".to_string()),
            emergency_contact_phone: Some("+15550009999".to_string()),
            transfer_phone: None,
            sms_phone: Some("+15550001000".to_string()),
            voice_phone: Some("+15550002000".to_string()),
            preferred_sms_provider: None,
            is_active: true,
            created_at: Utc::now(),
        }
    }

    fn message(org: Uuid, external: &str) -> SmsRecord {
        let now = Utc::now();
        SmsRecord {
            id: Uuid::new_v4(),
            organization_id: org,
            workflow_id: None,
            appointment_id: None,
            customer_id: None,
            direction: MessageDirection::Outbound,
            message_type: "direct".to_string(),
            category: TemplateCategory::Custom,
            language: Language::En,
            language_fallback: false,
            to_phone: "+15551234567".to_string(),
            from_phone: None,
            body: "hello".to_string(),
            part: 1,
            total_parts: 1,
            segments: 1,
            status: MessageStatus::Sent,
            provider: Some(SmsProviderKind::Sandbox),
            external_message_id: Some(external.to_string()),
            error_code: None,
            error_message: None,
            cost: None,
            created_at: now,
            sent_at: Some(now),
            delivered_at: None,
            updated_at: now,
        }
    }

    fn workflow(org: Uuid) -> Workflow {
        let now = Utc::now();
        Workflow {
            id: Uuid::new_v4(),
            organization_id: org,
            customer_id: None,
            appointment_id: None,
            workflow_type: WorkflowType::FollowUp,
            status: WorkflowStatus::Scheduled,
            scheduled_at: now,
            metadata: serde_json::json!({}),
            steps: vec![WorkflowStep::new(
                0,
                StepKind::CustomerMessage,
                "follow_up",
                StepPolicy::Required,
            )],
            failed_step: None,
            failure_reason: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    #[tokio::test]
    async fn test_duplicate_external_id_is_conflict_per_organization() {
        let store = MemoryStore::new();
        let org_a = Uuid::new_v4();
        let org_b = Uuid::new_v4();

        store.insert_message(message(org_a, "SM1")).await.unwrap();
        let err = store.insert_message(message(org_a, "SM1")).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));

        // Another tenant may reuse the id
        assert!(store.insert_message(message(org_b, "SM1")).await.is_ok());
    }

    #[tokio::test]
    async fn test_status_advance_is_monotonic() {
        let store = MemoryStore::new();
        let org = Uuid::new_v4();
        store.insert_message(message(org, "SM2")).await.unwrap();

        let delivered = StatusUpdate {
            status: MessageStatus::Delivered,
            error_code: None,
            error_message: None,
            at: Utc::now(),
        };
        assert!(matches!(
            store.advance_message_status("SM2", &delivered).await.unwrap(),
            StatusAdvance::Applied(_)
        ));
        assert!(matches!(
            store.advance_message_status("SM2", &delivered).await.unwrap(),
            StatusAdvance::Ignored(_)
        ));

        let late_sent = StatusUpdate {
            status: MessageStatus::Sent,
            ..delivered.clone()
        };
        match store.advance_message_status("SM2", &late_sent).await.unwrap() {
            StatusAdvance::Ignored(record) => assert_eq!(record.status, MessageStatus::Delivered),
            other => panic!("unexpected outcome: {:?}", other),
        }

        assert_eq!(
            store.advance_message_status("nope", &delivered).await.unwrap(),
            StatusAdvance::Unknown
        );
    }

    #[tokio::test]
    async fn test_transition_requires_expected_status_and_idle() {
        let store = MemoryStore::new();
        let mut wf = workflow(Uuid::new_v4());
        let id = wf.id;
        wf.status = WorkflowStatus::InProgress;
        wf.steps[0].status = StepStatus::Sending;
        store.insert_workflow(wf).await.unwrap();

        let mut cancel = WorkflowTransition::new(
            &[WorkflowStatus::Scheduled, WorkflowStatus::InProgress],
            WorkflowStatus::Cancelled,
            Utc::now(),
        );
        cancel.require_idle = true;
        assert_eq!(
            store.transition_workflow(id, &cancel).await.unwrap(),
            TransitionOutcome::Rejected {
                current: WorkflowStatus::InProgress,
                busy: true
            }
        );

        let complete = WorkflowTransition::new(
            &[WorkflowStatus::InProgress],
            WorkflowStatus::Completed,
            Utc::now(),
        );
        assert!(matches!(
            store.transition_workflow(id, &complete).await.unwrap(),
            TransitionOutcome::Applied(_)
        ));

        cancel.require_idle = false;
        assert!(matches!(
            store.transition_workflow(id, &cancel).await.unwrap(),
            TransitionOutcome::Rejected {
                current: WorkflowStatus::Completed,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_step_saves_stop_after_cancellation() {
        let store = MemoryStore::new();
        let wf = workflow(Uuid::new_v4());
        let id = wf.id;
        let steps = wf.steps.clone();
        store.insert_workflow(wf).await.unwrap();

        assert!(!store.save_workflow_steps(id, &steps).await.unwrap());

        let start = WorkflowTransition::new(
            &[WorkflowStatus::Scheduled],
            WorkflowStatus::InProgress,
            Utc::now(),
        );
        store.transition_workflow(id, &start).await.unwrap();
        assert!(store.save_workflow_steps(id, &steps).await.unwrap());
    }

    #[tokio::test]
    async fn test_due_workflows_are_ordered_and_limited() {
        let store = MemoryStore::new();
        let org = Uuid::new_v4();
        let now = Utc::now();
        for minutes in [5, 15, 10] {
            let mut wf = workflow(org);
            wf.scheduled_at = now - Duration::minutes(minutes);
            store.insert_workflow(wf).await.unwrap();
        }
        let mut future = workflow(org);
        future.scheduled_at = now + Duration::hours(1);
        store.insert_workflow(future).await.unwrap();

        let due = store.list_due_workflows(now, 2).await.unwrap();
        assert_eq!(due.len(), 2);
        assert!(due[0].scheduled_at < due[1].scheduled_at);
        assert_eq!(due[0].scheduled_at, now - Duration::minutes(15));
    }

    #[tokio::test]
    async fn test_on_call_contact_uses_local_time_and_priority() {
        let store = MemoryStore::new();
        let org = organization();
        let org_id = org.id;
        store.insert_organization(org);

        let make = |priority: i32, start: u32, end: u32| EmergencyContact {
            id: Uuid::new_v4(),
            organization_id: org_id,
            name: format!("Tech {}", priority),
            phone: format!("+1555000{:04}", priority),
            available_days: vec![0, 1, 2, 3, 4, 5, 6],
            available_hours_start: NaiveTime::from_hms_opt(start, 0, 0).unwrap(),
            available_hours_end: NaiveTime::from_hms_opt(end, 0, 0).unwrap(),
            priority,
            is_active: true,
        };
        store.insert_contact(make(2, 8, 18));
        store.insert_contact(make(1, 8, 12));
        store.insert_contact(make(3, 18, 8));

        // 15:00 UTC is 10:00 at UTC-5
        let morning = Utc.with_ymd_and_hms(2024, 3, 4, 15, 0, 0).unwrap();
        let contact = store
            .find_on_call_contact(org_id, morning)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(contact.priority, 1);

        // 04:00 UTC is 23:00 the previous evening locally
        let night = Utc.with_ymd_and_hms(2024, 3, 5, 4, 0, 0).unwrap();
        let contact = store
            .find_on_call_contact(org_id, night)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(contact.priority, 3);
    }

    #[tokio::test]
    async fn test_template_upsert_bumps_version() {
        let store = MemoryStore::new();
        let org = Uuid::new_v4();
        let now = Utc::now();
        let template = NotificationTemplate {
            id: Uuid::new_v4(),
            organization_id: Some(org),
            template_key: "follow_up".to_string(),
            language: Language::Es,
            content: "Hola {{customer_name}}".to_string(),
            variables: vec!["customer_name".to_string()],
            category: TemplateCategory::FollowUp,
            is_active: true,
            version: 1,
            created_at: now,
            updated_at: now,
        };
        store.upsert_template(template.clone()).await.unwrap();
        let updated = store
            .upsert_template(NotificationTemplate {
                id: Uuid::new_v4(),
                content: "Buenas {{customer_name}}".to_string(),
                ..template.clone()
            })
            .await
            .unwrap();
        assert_eq!(updated.version, 2);
        assert_eq!(updated.id, template.id);

        let other_tenant = store
            .list_templates(Uuid::new_v4(), &TemplateFilter::default())
            .await
            .unwrap();
        assert!(other_tenant.is_empty());
    }

    #[tokio::test]
    async fn test_emergency_insert_is_keyed_by_tool_call() {
        let store = MemoryStore::new();
        let org = Uuid::new_v4();
        let emergency = EmergencyNotification {
            id: Uuid::new_v4(),
            organization_id: org,
            tool_call_id: "tc-9".to_string(),
            call_id: None,
            contact_id: None,
            contact_name: None,
            contact_phone: "+15550009999".to_string(),
            emergency_type: "gas_leak".to_string(),
            severity: Default::default(),
            description: None,
            location: None,
            caller_phone: None,
            status: EmergencyStatus::Pending,
            sms_message_id: None,
            last_error: None,
            created_at: Utc::now(),
            sent_at: None,
            resolved_at: None,
            resolved_by: None,
        };
        assert!(store
            .insert_emergency_if_absent(emergency.clone())
            .await
            .unwrap()
            .is_new());
        let replay = store
            .insert_emergency_if_absent(EmergencyNotification {
                id: Uuid::new_v4(),
                ..emergency.clone()
            })
            .await
            .unwrap();
        assert!(!replay.is_new());
        assert_eq!(replay.into_inner().id, emergency.id);
        assert_eq!(store.emergencies().len(), 1);
    }

    #[tokio::test]
    async fn test_scripted_fault_fires_once_after_passes() {
        let store = MemoryStore::new();
        let org = organization();
        store.insert_organization(org.clone());
        let wf = store.insert_workflow(workflow(org.id)).await.unwrap();

        store.fail_operation("save_workflow_steps", 1);
        assert!(store.save_workflow_steps(wf.id, &wf.steps).await.is_ok());
        let err = store.save_workflow_steps(wf.id, &wf.steps).await.unwrap_err();
        assert!(matches!(err, StoreError::Backend { .. }));
        assert!(store.save_workflow_steps(wf.id, &wf.steps).await.is_ok());
    }
}

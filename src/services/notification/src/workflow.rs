//! Workflow engine
//!
//! A workflow is a short, ordered list of sends triggered by one business
//! event. Execution claims the workflow with a compare-and-set to
//! `in_progress`, runs each step through the dispatcher and finishes in
//! exactly one terminal state. Cancellation is soft: it stops steps that have
//! not started and never recalls messages already handed to a provider.

use chrono::{DateTime, Duration, Utc};
use futures::stream::{self, StreamExt};
use serde_json::{json, Value};
use serviceai_shared::types::{
    Appointment, AppointmentEvent, CreateWorkflowRequest, Customer, DispatchResult,
    ExecutionSummary, Language, Organization, StepKind, StepPolicy, StepStatus, TimeRange,
    Workflow, WorkflowMetrics, WorkflowStatus, WorkflowStep, WorkflowType,
};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::config::WorkflowConfig;
use crate::dispatcher::{NotificationDispatcher, Recipient, SendOptions};
use crate::error::{NotifyError, Result};
use crate::metrics::NotifyMetrics;
use crate::retry::RetryPolicy;
use crate::store::{Persistence, TransitionOutcome, WorkflowTransition};
use crate::templates::TemplateStore;

/// Keys in workflow metadata that steer execution rather than feed templates
const RESERVED_METADATA: &[&str] = &["language", "variables", "source", "event"];

/// Result of one execution attempt
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    /// The run reached the end of its steps or was cut short by a cancel
    Finished(Workflow),
    /// Another run claimed the workflow first, or it is no longer scheduled
    Skipped,
}

/// What a single attempt at a step produced
#[derive(Debug, Clone, PartialEq)]
enum StepOutcome {
    Sent(Vec<Uuid>),
    Failed {
        reason: String,
        retryable: bool,
        message_ids: Vec<Uuid>,
        /// Split parts a provider accepted before the failure
        parts_sent: u32,
    },
    Skipped(String),
}

impl StepOutcome {
    fn from_dispatch(result: DispatchResult) -> Self {
        let message_ids = result.message_id.into_iter().collect();
        if result.success {
            StepOutcome::Sent(message_ids)
        } else {
            let reason = match (result.error_code, result.error) {
                (Some(code), Some(error)) => format!("{}: {}", code, error),
                (Some(code), None) => code,
                (None, Some(error)) => error,
                (None, None) => "send failed".to_string(),
            };
            StepOutcome::Failed {
                reason,
                retryable: result.retryable,
                message_ids,
                parts_sent: result.parts_sent,
            }
        }
    }

    fn from_error(err: NotifyError) -> Self {
        StepOutcome::Failed {
            reason: format!("{}: {}", err.error_code(), err),
            retryable: err.is_retryable(),
            message_ids: Vec::new(),
            parts_sent: 0,
        }
    }
}

/// Everything a step needs besides the step itself
struct StepContext {
    organization: Organization,
    customer: Option<Customer>,
    language: Language,
    variables: HashMap<String, Value>,
}

pub struct WorkflowEngine {
    store: Arc<dyn Persistence>,
    templates: Arc<TemplateStore>,
    dispatcher: Arc<NotificationDispatcher>,
    metrics: NotifyMetrics,
    retry: RetryPolicy,
    config: WorkflowConfig,
}

impl WorkflowEngine {
    pub fn new(
        store: Arc<dyn Persistence>,
        templates: Arc<TemplateStore>,
        dispatcher: Arc<NotificationDispatcher>,
        metrics: NotifyMetrics,
        retry: RetryPolicy,
        config: &WorkflowConfig,
    ) -> Self {
        Self {
            store,
            templates,
            dispatcher,
            metrics,
            retry,
            config: config.clone(),
        }
    }

    /// Persist a new workflow. One that is already due runs before this
    /// returns, and the returned workflow reflects the run.
    #[instrument(skip(self, request), fields(organization_id = %request.organization_id, workflow_type = %request.workflow_type))]
    pub async fn create_workflow(&self, request: CreateWorkflowRequest) -> Result<Workflow> {
        let organization = self.active_organization(request.organization_id).await?;

        if !(request.metadata.is_null() || request.metadata.is_object()) {
            return Err(NotifyError::validation(
                "metadata",
                "metadata must be a JSON object",
            ));
        }

        let appointment = match request.appointment_id {
            Some(id) => Some(
                self.store
                    .get_appointment(organization.id, id)
                    .await?
                    .ok_or_else(|| NotifyError::not_found(format!("appointment {}", id)))?,
            ),
            None => None,
        };

        let customer_id = request
            .customer_id
            .or_else(|| appointment.as_ref().and_then(|a| a.customer_id));
        if let Some(id) = customer_id {
            self.store
                .get_customer(organization.id, id)
                .await?
                .ok_or_else(|| NotifyError::not_found(format!("customer {}", id)))?;
        } else if request.workflow_type.targets_customer() {
            return Err(NotifyError::validation(
                "customerId",
                format!("{} workflows need a customer", request.workflow_type),
            ));
        }

        let now = Utc::now();
        let workflow = Workflow {
            id: Uuid::new_v4(),
            organization_id: organization.id,
            customer_id,
            appointment_id: request.appointment_id,
            workflow_type: request.workflow_type,
            status: WorkflowStatus::Scheduled,
            scheduled_at: request.scheduled_at.unwrap_or(now),
            metadata: if request.metadata.is_null() {
                json!({})
            } else {
                request.metadata
            },
            steps: steps_for(request.workflow_type),
            failed_step: None,
            failure_reason: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        };

        let workflow = self.store.insert_workflow(workflow).await?;
        self.metrics
            .record_workflow_transition(workflow.workflow_type, WorkflowStatus::Scheduled);
        info!(
            workflow_id = %workflow.id,
            scheduled_at = %workflow.scheduled_at,
            "Workflow created"
        );

        if workflow.scheduled_at > now {
            return Ok(workflow);
        }

        match self.execute_workflow(workflow.id).await? {
            ExecutionOutcome::Finished(workflow) => Ok(workflow),
            ExecutionOutcome::Skipped => self.load(workflow.id).await,
        }
    }

    /// Run every scheduled workflow that is due, up to the configured batch
    pub async fn execute_due_workflows(&self) -> Result<ExecutionSummary> {
        self.execute_due_workflows_at(Utc::now()).await
    }

    pub async fn execute_due_workflows_at(&self, now: DateTime<Utc>) -> Result<ExecutionSummary> {
        let due = self
            .store
            .list_due_workflows(now, self.config.due_batch_size)
            .await?;

        let mut summary = ExecutionSummary {
            picked: due.len(),
            ..ExecutionSummary::default()
        };
        if due.is_empty() {
            return Ok(summary);
        }

        let outcomes: Vec<(Uuid, Result<ExecutionOutcome>)> = stream::iter(due)
            .map(|workflow| async move { (workflow.id, self.execute_workflow(workflow.id).await) })
            .buffer_unordered(self.config.max_concurrency.max(1))
            .collect()
            .await;

        for (id, outcome) in outcomes {
            match outcome {
                Ok(ExecutionOutcome::Finished(workflow)) => match workflow.status {
                    WorkflowStatus::Completed => summary.completed += 1,
                    WorkflowStatus::Failed => summary.failed += 1,
                    WorkflowStatus::Cancelled => summary.cancelled += 1,
                    _ => summary.skipped += 1,
                },
                Ok(ExecutionOutcome::Skipped) => summary.skipped += 1,
                Err(e) => {
                    error!(workflow_id = %id, error = %e, "Workflow execution aborted");
                    summary.failed += 1;
                }
            }
        }

        info!(
            picked = summary.picked,
            completed = summary.completed,
            failed = summary.failed,
            cancelled = summary.cancelled,
            skipped = summary.skipped,
            "Due workflows executed"
        );
        Ok(summary)
    }

    /// Claim and run one workflow
    #[instrument(skip(self), fields(workflow_id = %id))]
    pub async fn execute_workflow(&self, id: Uuid) -> Result<ExecutionOutcome> {
        let claim = WorkflowTransition::new(
            &[WorkflowStatus::Scheduled],
            WorkflowStatus::InProgress,
            Utc::now(),
        );
        let mut workflow = match self.store.transition_workflow(id, &claim).await? {
            TransitionOutcome::Applied(workflow) => workflow,
            TransitionOutcome::Rejected { current, .. } => {
                debug!(status = %current, "Workflow not claimable, skipping");
                return Ok(ExecutionOutcome::Skipped);
            }
        };
        self.metrics
            .record_workflow_transition(workflow.workflow_type, WorkflowStatus::InProgress);

        let context = match self.step_context(&workflow).await {
            Ok(context) => context,
            Err(e) => {
                let reason = format!("could not prepare workflow: {}", e);
                return self.finish_failed(&workflow, None, reason).await;
            }
        };

        for index in 0..workflow.steps.len() {
            if workflow.steps[index].status != StepStatus::Pending {
                continue;
            }

            workflow.steps[index].status = StepStatus::Sending;
            workflow.steps[index].started_at = Some(Utc::now());
            match self.store.save_workflow_steps(id, &workflow.steps).await {
                Ok(true) => {}
                Ok(false) => {
                    info!(step = index, "Workflow left in_progress before step, stopping");
                    return self.finished(id).await;
                }
                Err(e) => {
                    let reason = format!(
                        "DATABASE_ERROR: step {} could not be started: {}",
                        index, e
                    );
                    return self.finish_failed(&workflow, Some(index), reason).await;
                }
            }

            let outcome = self
                .run_step_with_retry(&mut workflow, index, &context)
                .await;

            let step = &mut workflow.steps[index];
            step.completed_at = Some(Utc::now());
            match &outcome {
                StepOutcome::Sent(ids) => {
                    step.status = StepStatus::Sent;
                    step.message_ids.extend(ids.iter().copied());
                    step.error = None;
                }
                StepOutcome::Failed {
                    reason,
                    message_ids,
                    ..
                } => {
                    step.status = StepStatus::Failed;
                    step.message_ids.extend(message_ids.iter().copied());
                    step.error = Some(reason.clone());
                }
                StepOutcome::Skipped(reason) => {
                    step.status = StepStatus::Skipped;
                    step.error = Some(reason.clone());
                }
            }
            let step = step.clone();

            match self.store.save_workflow_steps(id, &workflow.steps).await {
                Ok(true) => {}
                Ok(false) => {
                    info!(step = index, "Workflow cancelled while step was sending");
                    return self.finished(id).await;
                }
                Err(e) => {
                    // The step may already have reached the customer
                    let reason = format!(
                        "DATABASE_ERROR: step {} ended {} but could not be saved: {}",
                        index,
                        step.status.as_str(),
                        e
                    );
                    return self.finish_failed(&workflow, Some(index), reason).await;
                }
            }

            if let StepOutcome::Failed { reason, .. } = outcome {
                match step.policy {
                    StepPolicy::Required => {
                        let reason = format!(
                            "step {} ({}) failed after {} attempt(s): {}",
                            index,
                            step.kind.as_str(),
                            step.attempts,
                            reason
                        );
                        return self.finish_failed(&workflow, Some(index), reason).await;
                    }
                    StepPolicy::BestEffort => {
                        warn!(
                            step = index,
                            kind = step.kind.as_str(),
                            reason = %reason,
                            "Best-effort step failed, continuing"
                        );
                    }
                }
            }
        }

        let done = WorkflowTransition::new(
            &[WorkflowStatus::InProgress],
            WorkflowStatus::Completed,
            Utc::now(),
        );
        match self.store.transition_workflow(id, &done).await? {
            TransitionOutcome::Applied(workflow) => {
                self.metrics
                    .record_workflow_transition(workflow.workflow_type, WorkflowStatus::Completed);
                info!("Workflow completed");
                Ok(ExecutionOutcome::Finished(workflow))
            }
            TransitionOutcome::Rejected { current, .. } => {
                info!(status = %current, "Workflow ended elsewhere before completion");
                self.finished(id).await
            }
        }
    }

    /// Cancel a scheduled or running workflow that has no step mid-send.
    /// `organization_id` scopes the lookup to one tenant.
    #[instrument(skip(self), fields(workflow_id = %id))]
    pub async fn cancel_workflow(&self, organization_id: Option<Uuid>, id: Uuid) -> Result<Workflow> {
        let workflow = self.get_workflow(organization_id, id).await?;

        let mut transition = WorkflowTransition::new(
            &[WorkflowStatus::Scheduled, WorkflowStatus::InProgress],
            WorkflowStatus::Cancelled,
            Utc::now(),
        );
        transition.require_idle = true;

        match self.store.transition_workflow(workflow.id, &transition).await? {
            TransitionOutcome::Applied(workflow) => {
                self.metrics
                    .record_workflow_transition(workflow.workflow_type, WorkflowStatus::Cancelled);
                info!("Workflow cancelled");
                Ok(workflow)
            }
            TransitionOutcome::Rejected { busy: true, .. } => Err(NotifyError::WorkflowBusy {
                workflow_id: id.to_string(),
            }),
            TransitionOutcome::Rejected { current, .. } => Err(NotifyError::invalid_transition(
                current,
                WorkflowStatus::Cancelled,
            )),
        }
    }

    /// Fetch a workflow, hiding other tenants' workflows as not found
    pub async fn get_workflow(&self, organization_id: Option<Uuid>, id: Uuid) -> Result<Workflow> {
        let workflow = self.load(id).await?;
        if organization_id.map_or(false, |org| org != workflow.organization_id) {
            return Err(NotifyError::not_found(format!("workflow {}", id)));
        }
        Ok(workflow)
    }

    pub async fn get_workflow_metrics(
        &self,
        organization_id: Uuid,
        range: TimeRange,
    ) -> Result<WorkflowMetrics> {
        self.get_workflow_metrics_at(organization_id, range, Utc::now())
            .await
    }

    pub async fn get_workflow_metrics_at(
        &self,
        organization_id: Uuid,
        range: TimeRange,
        now: DateTime<Utc>,
    ) -> Result<WorkflowMetrics> {
        let workflows = self
            .store
            .list_workflows(organization_id, range.window_start(now))
            .await?;

        let mut metrics = WorkflowMetrics {
            created: workflows.len() as u64,
            ..WorkflowMetrics::default()
        };
        let mut latency_total_ms = 0.0;
        let mut latency_samples = 0u64;

        for workflow in &workflows {
            match workflow.status {
                WorkflowStatus::Scheduled => metrics.scheduled += 1,
                WorkflowStatus::InProgress => metrics.in_progress += 1,
                WorkflowStatus::Completed => metrics.completed += 1,
                WorkflowStatus::Cancelled => metrics.cancelled += 1,
                WorkflowStatus::Failed => metrics.failed += 1,
            }
            for step in &workflow.steps {
                if let Some(latency) = step.latency() {
                    latency_total_ms += latency.num_milliseconds() as f64;
                    latency_samples += 1;
                }
                if step.policy == StepPolicy::BestEffort && step.status == StepStatus::Failed {
                    metrics.best_effort_failures += 1;
                }
            }
        }

        if latency_samples > 0 {
            metrics.avg_step_latency_ms = Some(latency_total_ms / latency_samples as f64);
        }
        Ok(metrics)
    }

    /// Spawn the workflows an appointment lifecycle event calls for. Replaying
    /// `created`, `cancelled` or `completed` does not duplicate workflows.
    #[instrument(skip(self), fields(organization_id = %organization_id, appointment_id = %appointment_id))]
    pub async fn handle_appointment_event(
        &self,
        organization_id: Uuid,
        appointment_id: Uuid,
        event: AppointmentEvent,
    ) -> Result<Vec<Workflow>> {
        let organization = self.active_organization(organization_id).await?;
        let appointment = self
            .store
            .get_appointment(organization.id, appointment_id)
            .await?
            .ok_or_else(|| NotifyError::not_found(format!("appointment {}", appointment_id)))?;
        let existing = self
            .store
            .list_workflows_for_appointment(organization.id, appointment.id)
            .await?;

        let now = Utc::now();
        let starts_at = organization.to_utc(appointment.local_start());
        let event_name = match event {
            AppointmentEvent::Created => "created",
            AppointmentEvent::Rescheduled => "rescheduled",
            AppointmentEvent::Cancelled => "cancelled",
            AppointmentEvent::Completed => "completed",
        };

        let mut planned: Vec<(WorkflowType, DateTime<Utc>)> = Vec::new();
        match event {
            AppointmentEvent::Created => {
                planned.push((WorkflowType::AppointmentConfirmation, now));
                planned.push((
                    WorkflowType::AppointmentReminder,
                    starts_at - Duration::hours(self.config.reminder_lead_hours),
                ));
                planned.retain(|(kind, _)| !has_live(&existing, *kind));
            }
            AppointmentEvent::Rescheduled => {
                self.cancel_pending(&existing, |w| {
                    matches!(
                        w.workflow_type,
                        WorkflowType::AppointmentReminder | WorkflowType::AppointmentConfirmation
                    )
                })
                .await;
                planned.push((WorkflowType::AppointmentConfirmation, now));
                planned.push((
                    WorkflowType::AppointmentReminder,
                    starts_at - Duration::hours(self.config.reminder_lead_hours),
                ));
            }
            AppointmentEvent::Cancelled => {
                self.cancel_pending(&existing, |w| {
                    w.workflow_type != WorkflowType::AppointmentCancellation
                })
                .await;
                if !has_live(&existing, WorkflowType::AppointmentCancellation) {
                    planned.push((WorkflowType::AppointmentCancellation, now));
                }
            }
            AppointmentEvent::Completed => {
                let ended_at = organization.to_utc(appointment.local_end()).max(now);
                planned.push((
                    WorkflowType::FollowUp,
                    ended_at + Duration::hours(self.config.follow_up_delay_hours),
                ));
                planned.push((
                    WorkflowType::Survey,
                    ended_at + Duration::hours(self.config.survey_delay_hours),
                ));
                planned.retain(|(kind, _)| !has_live(&existing, *kind));
            }
        }

        // A reminder whose moment already passed would only confuse
        planned.retain(|(kind, at)| *kind != WorkflowType::AppointmentReminder || *at > now);

        let mut created = Vec::with_capacity(planned.len());
        for (workflow_type, scheduled_at) in planned {
            let workflow = self
                .create_workflow(CreateWorkflowRequest {
                    organization_id: organization.id,
                    customer_id: appointment.customer_id,
                    appointment_id: Some(appointment.id),
                    workflow_type,
                    scheduled_at: Some(scheduled_at),
                    metadata: json!({ "source": "appointment_event", "event": event_name }),
                })
                .await?;
            created.push(workflow);
        }

        info!(event = event_name, workflows = created.len(), "Appointment event handled");
        Ok(created)
    }

    async fn cancel_pending<F>(&self, workflows: &[Workflow], select: F)
    where
        F: Fn(&Workflow) -> bool,
    {
        for workflow in workflows
            .iter()
            .filter(|w| w.status == WorkflowStatus::Scheduled && select(w))
        {
            if let Err(e) = self
                .cancel_workflow(Some(workflow.organization_id), workflow.id)
                .await
            {
                // Lost the race to an executor; the send goes out as planned
                warn!(workflow_id = %workflow.id, error = %e, "Could not cancel pending workflow");
            }
        }
    }

    /// Attempts are persisted as they happen so retries are visible while
    /// the step is still sending. A retry resumes after any split parts the
    /// previous attempt already delivered.
    async fn run_step_with_retry(
        &self,
        workflow: &mut Workflow,
        index: usize,
        context: &StepContext,
    ) -> StepOutcome {
        let mut message_ids = Vec::new();
        let mut resume_at = 0;
        let mut attempt = 0;
        loop {
            attempt += 1;
            workflow.steps[index].attempts = attempt;
            if let Err(e) = self
                .store
                .save_workflow_steps(workflow.id, &workflow.steps)
                .await
            {
                warn!(step = index, attempt, error = %e, "Could not record step attempt");
            }

            let step = workflow.steps[index].clone();
            match self.run_step(workflow, &step, context, resume_at).await {
                StepOutcome::Failed {
                    reason,
                    retryable,
                    message_ids: ids,
                    parts_sent,
                } => {
                    message_ids.extend(ids);
                    resume_at = resume_at.max(parts_sent);
                    if self.retry.should_retry(attempt, retryable) {
                        let delay = self.retry.delay_for(attempt);
                        warn!(
                            step = index,
                            attempt,
                            resume_at,
                            delay_ms = delay.as_millis() as u64,
                            reason = %reason,
                            "Transient step failure, retrying"
                        );
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    return StepOutcome::Failed {
                        reason,
                        retryable,
                        message_ids,
                        parts_sent: resume_at,
                    };
                }
                StepOutcome::Sent(ids) => {
                    message_ids.extend(ids);
                    return StepOutcome::Sent(message_ids);
                }
                skipped => return skipped,
            }
        }
    }

    async fn run_step(
        &self,
        workflow: &Workflow,
        step: &WorkflowStep,
        context: &StepContext,
        resume_at: u32,
    ) -> StepOutcome {
        let organization = &context.organization;
        let mut options = SendOptions::new(
            workflow.workflow_type.category(),
            &step.template_key,
            context.language,
        );
        options.skip_parts = resume_at;
        options.workflow_id = Some(workflow.id);
        options.appointment_id = workflow.appointment_id;
        options.customer_id = workflow.customer_id;

        match step.kind {
            StepKind::CustomerMessage => {
                let Some(customer) = &context.customer else {
                    return StepOutcome::Failed {
                        reason: "NOT_FOUND: workflow customer does not exist".to_string(),
                        retryable: false,
                        message_ids: Vec::new(),
                        parts_sent: 0,
                    };
                };
                let recipients = [Recipient {
                    phone: customer.phone.clone(),
                    customer_id: Some(customer.id),
                }];
                self.send_one(
                    organization,
                    &step.template_key,
                    &recipients,
                    &context.variables,
                    context.language,
                    &options,
                )
                .await
            }
            StepKind::EmergencyBroadcast => {
                let rendered = match self
                    .templates
                    .render_template(
                        organization,
                        &step.template_key,
                        context.language,
                        &context.variables,
                    )
                    .await
                {
                    Ok(rendered) => rendered,
                    Err(e) => return StepOutcome::from_error(e),
                };
                options.customer_id = None;
                options.message_type = rendered.template_key.clone();
                options.language = rendered.language;
                options.language_fallback = rendered.fallback;
                StepOutcome::from_dispatch(
                    self.dispatcher
                        .send_emergency_broadcast(organization, &rendered.text, &options)
                        .await,
                )
            }
            StepKind::ContactEscalation => {
                let contact = match self
                    .store
                    .find_on_call_contact(organization.id, Utc::now())
                    .await
                {
                    Ok(Some(contact)) => contact,
                    Ok(None) => return StepOutcome::Skipped("no contact on call".to_string()),
                    Err(e) => return StepOutcome::from_error(e.into()),
                };
                if organization.emergency_contact_phone.as_deref() == Some(contact.phone.as_str()) {
                    return StepOutcome::Skipped(
                        "on-call contact already received the alert".to_string(),
                    );
                }

                let mut variables = context.variables.clone();
                variables.insert("contact_name".to_string(), json!(contact.name));
                options.customer_id = None;
                self.send_one(
                    organization,
                    &step.template_key,
                    &[Recipient::phone(&contact.phone)],
                    &variables,
                    context.language,
                    &options,
                )
                .await
            }
        }
    }

    async fn send_one(
        &self,
        organization: &Organization,
        template_key: &str,
        recipients: &[Recipient],
        variables: &HashMap<String, Value>,
        language: Language,
        options: &SendOptions,
    ) -> StepOutcome {
        match self
            .dispatcher
            .send_templated(organization, template_key, recipients, variables, language, options)
            .await
        {
            Ok(results) => match results.into_iter().next() {
                Some(result) => StepOutcome::from_dispatch(result),
                None => StepOutcome::Skipped("no recipients".to_string()),
            },
            Err(e) => StepOutcome::from_error(e),
        }
    }

    async fn step_context(&self, workflow: &Workflow) -> Result<StepContext> {
        let organization = self.active_organization(workflow.organization_id).await?;

        let customer = match workflow.customer_id {
            Some(id) => self.store.get_customer(organization.id, id).await?,
            None => None,
        };
        let appointment = match workflow.appointment_id {
            Some(id) => self.store.get_appointment(organization.id, id).await?,
            None => None,
        };

        let language = workflow
            .metadata
            .get("language")
            .and_then(Value::as_str)
            .and_then(|s| s.parse::<Language>().ok())
            .or_else(|| appointment.as_ref().and_then(|a| a.language))
            .or_else(|| customer.as_ref().map(|c| c.language_preference))
            .unwrap_or(organization.default_language);

        let variables = build_variables(
            workflow,
            &organization,
            customer.as_ref(),
            appointment.as_ref(),
            language,
        );

        Ok(StepContext {
            organization,
            customer,
            language,
            variables,
        })
    }

    async fn finish_failed(
        &self,
        workflow: &Workflow,
        failed_step: Option<usize>,
        reason: String,
    ) -> Result<ExecutionOutcome> {
        let mut transition = WorkflowTransition::new(
            &[WorkflowStatus::InProgress],
            WorkflowStatus::Failed,
            Utc::now(),
        );
        transition.failure_reason = Some(reason.clone());
        transition.failed_step = failed_step;

        match self.store.transition_workflow(workflow.id, &transition).await? {
            TransitionOutcome::Applied(workflow) => {
                self.metrics
                    .record_workflow_transition(workflow.workflow_type, WorkflowStatus::Failed);
                error!(reason = %reason, failed_step = ?failed_step, "Workflow failed");
                Ok(ExecutionOutcome::Finished(workflow))
            }
            TransitionOutcome::Rejected { current, .. } => {
                info!(status = %current, "Workflow ended elsewhere before failure was recorded");
                self.finished(workflow.id).await
            }
        }
    }

    async fn finished(&self, id: Uuid) -> Result<ExecutionOutcome> {
        Ok(ExecutionOutcome::Finished(self.load(id).await?))
    }

    async fn load(&self, id: Uuid) -> Result<Workflow> {
        self.store
            .get_workflow(id)
            .await?
            .ok_or_else(|| NotifyError::not_found(format!("workflow {}", id)))
    }

    async fn active_organization(&self, id: Uuid) -> Result<Organization> {
        let organization = self
            .store
            .get_organization(id)
            .await?
            .ok_or_else(|| NotifyError::not_found(format!("organization {}", id)))?;
        if !organization.is_active {
            return Err(NotifyError::forbidden(format!(
                "organization {} is inactive",
                id
            )));
        }
        Ok(organization)
    }
}

/// Fixed step list per workflow type
pub fn steps_for(workflow_type: WorkflowType) -> Vec<WorkflowStep> {
    match workflow_type {
        WorkflowType::EmergencyAlert => vec![
            WorkflowStep::new(
                0,
                StepKind::EmergencyBroadcast,
                "emergency_alert",
                StepPolicy::Required,
            ),
            WorkflowStep::new(
                1,
                StepKind::ContactEscalation,
                "emergency_escalation",
                StepPolicy::BestEffort,
            ),
        ],
        other => vec![WorkflowStep::new(
            0,
            StepKind::CustomerMessage,
            other.as_str(),
            StepPolicy::Required,
        )],
    }
}

fn has_live(workflows: &[Workflow], workflow_type: WorkflowType) -> bool {
    workflows
        .iter()
        .any(|w| w.workflow_type == workflow_type && w.status != WorkflowStatus::Cancelled)
}

/// Template variables from the organization, customer and appointment, then
/// workflow metadata on top
fn build_variables(
    workflow: &Workflow,
    organization: &Organization,
    customer: Option<&Customer>,
    appointment: Option<&Appointment>,
    language: Language,
) -> HashMap<String, Value> {
    let mut variables = HashMap::new();
    variables.insert("business_name".to_string(), json!(organization.name));

    let fallback_name = match language {
        Language::En => "there",
        Language::Es => "cliente",
    };
    variables.insert(
        "customer_name".to_string(),
        json!(customer
            .and_then(|c| c.name.as_deref())
            .unwrap_or(fallback_name)),
    );

    if let Some(appointment) = appointment {
        let (date, time) = match language {
            Language::En => (
                appointment.scheduled_date.format("%m/%d/%Y").to_string(),
                appointment.scheduled_time.format("%-I:%M %p").to_string(),
            ),
            Language::Es => (
                appointment.scheduled_date.format("%d/%m/%Y").to_string(),
                appointment.scheduled_time.format("%H:%M").to_string(),
            ),
        };
        variables.insert("appointment_date".to_string(), json!(date));
        variables.insert("appointment_time".to_string(), json!(time));
        variables.insert(
            "service_type".to_string(),
            json!(appointment.service_type.replace('_', " ")),
        );
        if let Some(address) = &appointment.address {
            variables.insert("address".to_string(), json!(address));
        }
    }

    if workflow.workflow_type == WorkflowType::EmergencyAlert {
        let unknown = match language {
            Language::En => "unknown",
            Language::Es => "desconocido",
        };
        for (key, default) in [
            ("severity", "high"),
            ("emergency_type", "emergency"),
            ("location", unknown),
            ("caller_phone", unknown),
            ("description", unknown),
        ] {
            variables.insert(key.to_string(), json!(default));
        }
    }

    if let Some(metadata) = workflow.metadata.as_object() {
        for (key, value) in metadata {
            if RESERVED_METADATA.contains(&key.as_str()) || value.is_null() {
                continue;
            }
            if value.is_string() || value.is_number() || value.is_boolean() {
                variables.insert(key.clone(), value.clone());
            }
        }
        if let Some(extra) = metadata.get("variables").and_then(Value::as_object) {
            for (key, value) in extra {
                if !value.is_null() {
                    variables.insert(key.clone(), value.clone());
                }
            }
        }
    }

    variables
}

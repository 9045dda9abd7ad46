//! PostgreSQL store
//!
//! Runtime-checked sqlx queries over the tables created by
//! `migrations/0001_init.sql`. Compare-and-set operations are expressed as a
//! single conditional `UPDATE ... RETURNING`.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serviceai_shared::types::{
    Appointment, AppointmentStatus, CallTransfer, Customer, EmergencyContact,
    EmergencyNotification, Language, MessageStatus, NotificationTemplate, Organization,
    SmsRecord, Workflow, WorkflowStatus, WorkflowStep,
};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

use super::{
    EmergencyUpdate, InsertOutcome, Persistence, SendCompletion, StatusAdvance, StatusUpdate,
    StoreError, StoreResult, TemplateFilter, TransitionOutcome, WorkflowTransition,
};
use crate::config::DatabaseConfig;

const ORGANIZATION_COLUMNS: &str = "id, name, default_language, utc_offset_minutes, \
    business_hours_start, business_hours_end, business_days, emergency_contact_name, \
    emergency_contact_phone, transfer_phone, sms_phone, voice_phone, preferred_sms_provider, \
    is_active, created_at";

const CUSTOMER_COLUMNS: &str = "id, organization_id, name, phone, email, language_preference, \
    sms_opt_in, created_at, updated_at";

const CONTACT_COLUMNS: &str = "id, organization_id, name, phone, available_days, \
    available_hours_start, available_hours_end, priority, is_active";

const APPOINTMENT_COLUMNS: &str = "id, organization_id, customer_id, service_type, \
    scheduled_date, scheduled_time, duration_minutes, status, language, address, notes, \
    tool_call_id, created_at, updated_at";

const TEMPLATE_COLUMNS: &str = "id, organization_id, template_key, language, content, \
    variables, category, is_active, version, created_at, updated_at";

const WORKFLOW_COLUMNS: &str = "id, organization_id, customer_id, appointment_id, \
    workflow_type, status, scheduled_at, metadata, steps, failed_step, failure_reason, \
    created_at, updated_at, started_at, completed_at";

const MESSAGE_COLUMNS: &str = "id, organization_id, workflow_id, appointment_id, customer_id, \
    direction, message_type, category, language, language_fallback, to_phone, from_phone, \
    body, part, total_parts, segments, status, provider, external_message_id, error_code, \
    error_message, cost, created_at, sent_at, delivered_at, updated_at";

const EMERGENCY_COLUMNS: &str = "id, organization_id, tool_call_id, call_id, contact_id, \
    contact_name, contact_phone, emergency_type, severity, description, location, \
    caller_phone, status, sms_message_id, last_error, created_at, sent_at, resolved_at, \
    resolved_by";

const TRANSFER_COLUMNS: &str = "id, organization_id, tool_call_id, call_id, transfer_to, \
    reason, caller_phone, priority, emergency_id, created_at";

/// Postgres-backed [`Persistence`]
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: Arc<PgPool>,
}

impl PgStore {
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Connect a pool from configuration and apply migrations when enabled
    pub async fn connect(config: &DatabaseConfig) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_pool_size)
            .min_connections(config.min_pool_size)
            .acquire_timeout(Duration::from_secs(config.connection_timeout_seconds))
            .idle_timeout(Duration::from_secs(config.idle_timeout_seconds))
            .connect(&config.postgres_url)
            .await?;

        if config.run_migrations {
            sqlx::migrate!("./migrations")
                .run(&pool)
                .await
                .map_err(|e| StoreError::backend(format!("migration failed: {}", e)))?;
            info!("Database migrations applied");
        }

        info!("PostgreSQL connection pool created successfully");
        Ok(Self::new(Arc::new(pool)))
    }

    async fn fetch_workflow(&self, id: Uuid) -> StoreResult<Option<Workflow>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM sms_workflows WHERE id = $1",
            WORKFLOW_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&*self.pool)
        .await?;

        row.as_ref().map(workflow_from_row).transpose()
    }
}

#[async_trait]
impl Persistence for PgStore {
    fn backend(&self) -> &'static str {
        "postgres"
    }

    async fn health_check(&self) -> StoreResult<()> {
        let row = sqlx::query("SELECT 1").fetch_one(&*self.pool).await?;
        let value: i32 = row.try_get(0)?;
        if value == 1 {
            Ok(())
        } else {
            Err(StoreError::backend("unexpected health check result"))
        }
    }

    async fn get_organization(&self, id: Uuid) -> StoreResult<Option<Organization>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM organizations WHERE id = $1",
            ORGANIZATION_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&*self.pool)
        .await?;

        row.as_ref().map(organization_from_row).transpose()
    }

    async fn find_organization_by_phone(&self, phone: &str) -> StoreResult<Option<Organization>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM organizations WHERE voice_phone = $1 OR sms_phone = $1 \
             ORDER BY created_at LIMIT 1",
            ORGANIZATION_COLUMNS
        ))
        .bind(phone)
        .fetch_optional(&*self.pool)
        .await?;

        row.as_ref().map(organization_from_row).transpose()
    }

    async fn is_member(&self, organization_id: Uuid, user_id: &str) -> StoreResult<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM organization_members \
             WHERE organization_id = $1 AND user_id = $2)",
        )
        .bind(organization_id)
        .bind(user_id)
        .fetch_one(&*self.pool)
        .await?;
        Ok(exists)
    }

    async fn get_customer(&self, organization_id: Uuid, id: Uuid) -> StoreResult<Option<Customer>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM customers WHERE organization_id = $1 AND id = $2",
            CUSTOMER_COLUMNS
        ))
        .bind(organization_id)
        .bind(id)
        .fetch_optional(&*self.pool)
        .await?;

        row.as_ref().map(customer_from_row).transpose()
    }

    async fn find_customer_by_phone(
        &self,
        organization_id: Uuid,
        phone: &str,
    ) -> StoreResult<Option<Customer>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM customers WHERE organization_id = $1 AND phone = $2",
            CUSTOMER_COLUMNS
        ))
        .bind(organization_id)
        .bind(phone)
        .fetch_optional(&*self.pool)
        .await?;

        row.as_ref().map(customer_from_row).transpose()
    }

    async fn upsert_customer(&self, customer: Customer) -> StoreResult<Customer> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO customers ({cols})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (organization_id, phone) DO UPDATE SET
                name = COALESCE(EXCLUDED.name, customers.name),
                email = COALESCE(EXCLUDED.email, customers.email),
                language_preference = EXCLUDED.language_preference,
                updated_at = EXCLUDED.updated_at
            RETURNING {cols}
            "#,
            cols = CUSTOMER_COLUMNS
        ))
        .bind(customer.id)
        .bind(customer.organization_id)
        .bind(&customer.name)
        .bind(&customer.phone)
        .bind(&customer.email)
        .bind(customer.language_preference.as_str())
        .bind(customer.sms_opt_in)
        .bind(customer.created_at)
        .bind(customer.updated_at)
        .fetch_one(&*self.pool)
        .await?;

        customer_from_row(&row)
    }

    async fn set_customer_opt_in(
        &self,
        organization_id: Uuid,
        phone: &str,
        opt_in: bool,
    ) -> StoreResult<Option<Customer>> {
        let row = sqlx::query(&format!(
            "UPDATE customers SET sms_opt_in = $3, updated_at = NOW() \
             WHERE organization_id = $1 AND phone = $2 RETURNING {}",
            CUSTOMER_COLUMNS
        ))
        .bind(organization_id)
        .bind(phone)
        .bind(opt_in)
        .fetch_optional(&*self.pool)
        .await?;

        row.as_ref().map(customer_from_row).transpose()
    }

    async fn find_on_call_contact(
        &self,
        organization_id: Uuid,
        at: DateTime<Utc>,
    ) -> StoreResult<Option<EmergencyContact>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM get_on_call_contact($1, $2)",
            CONTACT_COLUMNS
        ))
        .bind(organization_id)
        .bind(at)
        .fetch_optional(&*self.pool)
        .await?;

        row.as_ref().map(contact_from_row).transpose()
    }

    async fn insert_appointment_if_absent(
        &self,
        appointment: Appointment,
    ) -> StoreResult<InsertOutcome<Appointment>> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO appointments ({cols})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT (organization_id, tool_call_id) DO NOTHING
            RETURNING {cols}
            "#,
            cols = APPOINTMENT_COLUMNS
        ))
        .bind(appointment.id)
        .bind(appointment.organization_id)
        .bind(appointment.customer_id)
        .bind(&appointment.service_type)
        .bind(appointment.scheduled_date)
        .bind(appointment.scheduled_time)
        .bind(appointment.duration_minutes)
        .bind(appointment.status.as_str())
        .bind(appointment.language.map(|l| l.as_str()))
        .bind(&appointment.address)
        .bind(&appointment.notes)
        .bind(&appointment.tool_call_id)
        .bind(appointment.created_at)
        .bind(appointment.updated_at)
        .fetch_optional(&*self.pool)
        .await?;

        if let Some(row) = row {
            return Ok(InsertOutcome::Inserted(appointment_from_row(&row)?));
        }

        let row = sqlx::query(&format!(
            "SELECT {} FROM appointments WHERE organization_id = $1 AND tool_call_id = $2",
            APPOINTMENT_COLUMNS
        ))
        .bind(appointment.organization_id)
        .bind(&appointment.tool_call_id)
        .fetch_one(&*self.pool)
        .await?;
        Ok(InsertOutcome::Existing(appointment_from_row(&row)?))
    }

    async fn get_appointment(
        &self,
        organization_id: Uuid,
        id: Uuid,
    ) -> StoreResult<Option<Appointment>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM appointments WHERE organization_id = $1 AND id = $2",
            APPOINTMENT_COLUMNS
        ))
        .bind(organization_id)
        .bind(id)
        .fetch_optional(&*self.pool)
        .await?;

        row.as_ref().map(appointment_from_row).transpose()
    }

    async fn list_appointments_on(
        &self,
        organization_id: Uuid,
        date: NaiveDate,
    ) -> StoreResult<Vec<Appointment>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM appointments WHERE organization_id = $1 AND scheduled_date = $2 \
             ORDER BY scheduled_time",
            APPOINTMENT_COLUMNS
        ))
        .bind(organization_id)
        .bind(date)
        .fetch_all(&*self.pool)
        .await?;

        rows.iter().map(appointment_from_row).collect()
    }

    async fn update_appointment_status(
        &self,
        organization_id: Uuid,
        id: Uuid,
        status: AppointmentStatus,
    ) -> StoreResult<Appointment> {
        let current = self
            .get_appointment(organization_id, id)
            .await?
            .ok_or_else(|| StoreError::not_found(format!("appointment {}", id)))?;

        if current.status == status {
            return Ok(current);
        }
        if !current.status.can_transition_to(status) {
            return Err(StoreError::conflict(format!(
                "appointment {} cannot move from {} to {}",
                id, current.status, status
            )));
        }

        let row = sqlx::query(&format!(
            "UPDATE appointments SET status = $3, updated_at = NOW() \
             WHERE organization_id = $1 AND id = $2 AND status = $4 RETURNING {}",
            APPOINTMENT_COLUMNS
        ))
        .bind(organization_id)
        .bind(id)
        .bind(status.as_str())
        .bind(current.status.as_str())
        .fetch_optional(&*self.pool)
        .await?;

        match row {
            Some(row) => appointment_from_row(&row),
            None => Err(StoreError::conflict(format!(
                "appointment {} changed concurrently",
                id
            ))),
        }
    }

    async fn find_next_appointment_for_customer(
        &self,
        organization_id: Uuid,
        customer_id: Uuid,
        after: NaiveDateTime,
    ) -> StoreResult<Option<Appointment>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM appointments \
             WHERE organization_id = $1 AND customer_id = $2 \
               AND status IN ('pending', 'confirmed') \
               AND (scheduled_date + scheduled_time) >= $3 \
             ORDER BY scheduled_date, scheduled_time LIMIT 1",
            APPOINTMENT_COLUMNS
        ))
        .bind(organization_id)
        .bind(customer_id)
        .bind(after)
        .fetch_optional(&*self.pool)
        .await?;

        row.as_ref().map(appointment_from_row).transpose()
    }

    async fn find_template(
        &self,
        organization_id: Option<Uuid>,
        key: &str,
        language: Language,
    ) -> StoreResult<Option<NotificationTemplate>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM notification_templates \
             WHERE organization_id IS NOT DISTINCT FROM $1 AND template_key = $2 AND language = $3",
            TEMPLATE_COLUMNS
        ))
        .bind(organization_id)
        .bind(key)
        .bind(language.as_str())
        .fetch_optional(&*self.pool)
        .await?;

        row.as_ref().map(template_from_row).transpose()
    }

    async fn upsert_template(
        &self,
        template: NotificationTemplate,
    ) -> StoreResult<NotificationTemplate> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO notification_templates ({cols})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (organization_id, template_key, language) DO UPDATE SET
                content = EXCLUDED.content,
                variables = EXCLUDED.variables,
                category = EXCLUDED.category,
                is_active = EXCLUDED.is_active,
                version = notification_templates.version + 1,
                updated_at = EXCLUDED.updated_at
            RETURNING {cols}
            "#,
            cols = TEMPLATE_COLUMNS
        ))
        .bind(template.id)
        .bind(template.organization_id)
        .bind(&template.template_key)
        .bind(template.language.as_str())
        .bind(&template.content)
        .bind(&template.variables)
        .bind(template.category.as_str())
        .bind(template.is_active)
        .bind(template.version)
        .bind(template.created_at)
        .bind(template.updated_at)
        .fetch_one(&*self.pool)
        .await?;

        template_from_row(&row)
    }

    async fn list_templates(
        &self,
        organization_id: Uuid,
        filter: &TemplateFilter,
    ) -> StoreResult<Vec<NotificationTemplate>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM notification_templates \
             WHERE (organization_id = $1 OR organization_id IS NULL) \
               AND ($2::TEXT IS NULL OR language = $2) \
               AND ($3::TEXT IS NULL OR category = $3) \
               AND (NOT $4 OR is_active) \
             ORDER BY template_key, language, organization_id NULLS FIRST",
            TEMPLATE_COLUMNS
        ))
        .bind(organization_id)
        .bind(filter.language.map(|l| l.as_str()))
        .bind(filter.category.map(|c| c.as_str()))
        .bind(filter.active_only)
        .fetch_all(&*self.pool)
        .await?;

        rows.iter().map(template_from_row).collect()
    }

    async fn insert_workflow(&self, workflow: Workflow) -> StoreResult<Workflow> {
        let steps = serde_json::to_value(&workflow.steps)
            .map_err(|e| StoreError::backend(e.to_string()))?;

        let row = sqlx::query(&format!(
            r#"
            INSERT INTO sms_workflows ({cols})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            RETURNING {cols}
            "#,
            cols = WORKFLOW_COLUMNS
        ))
        .bind(workflow.id)
        .bind(workflow.organization_id)
        .bind(workflow.customer_id)
        .bind(workflow.appointment_id)
        .bind(workflow.workflow_type.as_str())
        .bind(workflow.status.as_str())
        .bind(workflow.scheduled_at)
        .bind(&workflow.metadata)
        .bind(steps)
        .bind(workflow.failed_step.map(|s| s as i32))
        .bind(&workflow.failure_reason)
        .bind(workflow.created_at)
        .bind(workflow.updated_at)
        .bind(workflow.started_at)
        .bind(workflow.completed_at)
        .fetch_one(&*self.pool)
        .await?;

        workflow_from_row(&row)
    }

    async fn get_workflow(&self, id: Uuid) -> StoreResult<Option<Workflow>> {
        self.fetch_workflow(id).await
    }

    async fn list_due_workflows(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<Workflow>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM sms_workflows WHERE status = 'scheduled' AND scheduled_at <= $1 \
             ORDER BY scheduled_at LIMIT $2",
            WORKFLOW_COLUMNS
        ))
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&*self.pool)
        .await?;

        rows.iter().map(workflow_from_row).collect()
    }

    async fn transition_workflow(
        &self,
        id: Uuid,
        transition: &WorkflowTransition,
    ) -> StoreResult<TransitionOutcome> {
        let allowed_from: Vec<String> = transition
            .from
            .iter()
            .filter(|s| s.can_transition_to(transition.to))
            .map(|s| s.as_str().to_string())
            .collect();

        let row = sqlx::query(&format!(
            r#"
            UPDATE sms_workflows SET
                status = $2,
                updated_at = $3,
                started_at = CASE WHEN $2 = 'in_progress' THEN $3 ELSE started_at END,
                completed_at = CASE WHEN $2 IN ('completed', 'cancelled', 'failed')
                                    THEN $3 ELSE completed_at END,
                failure_reason = COALESCE($4, failure_reason),
                failed_step = COALESCE($5, failed_step)
            WHERE id = $1
              AND status = ANY($6)
              AND (NOT $7 OR NOT (steps @> '[{{"status": "sending"}}]'::jsonb))
            RETURNING {}
            "#,
            WORKFLOW_COLUMNS
        ))
        .bind(id)
        .bind(transition.to.as_str())
        .bind(transition.at)
        .bind(&transition.failure_reason)
        .bind(transition.failed_step.map(|s| s as i32))
        .bind(&allowed_from)
        .bind(transition.require_idle)
        .fetch_optional(&*self.pool)
        .await?;

        if let Some(row) = row {
            return Ok(TransitionOutcome::Applied(workflow_from_row(&row)?));
        }

        let current = self
            .fetch_workflow(id)
            .await?
            .ok_or_else(|| StoreError::not_found(format!("workflow {}", id)))?;
        Ok(TransitionOutcome::Rejected {
            current: current.status,
            busy: transition.require_idle && current.is_sending(),
        })
    }

    async fn save_workflow_steps(&self, id: Uuid, steps: &[WorkflowStep]) -> StoreResult<bool> {
        let steps =
            serde_json::to_value(steps).map_err(|e| StoreError::backend(e.to_string()))?;

        let result = sqlx::query(
            "UPDATE sms_workflows SET steps = $2, updated_at = NOW() \
             WHERE id = $1 AND status = 'in_progress'",
        )
        .bind(id)
        .bind(steps)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn list_workflows(
        &self,
        organization_id: Uuid,
        since: DateTime<Utc>,
    ) -> StoreResult<Vec<Workflow>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM sms_workflows WHERE organization_id = $1 AND created_at >= $2",
            WORKFLOW_COLUMNS
        ))
        .bind(organization_id)
        .bind(since)
        .fetch_all(&*self.pool)
        .await?;

        rows.iter().map(workflow_from_row).collect()
    }

    async fn list_workflows_for_appointment(
        &self,
        organization_id: Uuid,
        appointment_id: Uuid,
    ) -> StoreResult<Vec<Workflow>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM sms_workflows WHERE organization_id = $1 AND appointment_id = $2 \
             ORDER BY created_at",
            WORKFLOW_COLUMNS
        ))
        .bind(organization_id)
        .bind(appointment_id)
        .fetch_all(&*self.pool)
        .await?;

        rows.iter().map(workflow_from_row).collect()
    }

    async fn insert_message(&self, record: SmsRecord) -> StoreResult<SmsRecord> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO sms_communications ({cols})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16,
                    $17, $18, $19, $20, $21, $22, $23, $24, $25, $26)
            RETURNING {cols}
            "#,
            cols = MESSAGE_COLUMNS
        ))
        .bind(record.id)
        .bind(record.organization_id)
        .bind(record.workflow_id)
        .bind(record.appointment_id)
        .bind(record.customer_id)
        .bind(record.direction.as_str())
        .bind(&record.message_type)
        .bind(record.category.as_str())
        .bind(record.language.as_str())
        .bind(record.language_fallback)
        .bind(&record.to_phone)
        .bind(&record.from_phone)
        .bind(&record.body)
        .bind(record.part as i32)
        .bind(record.total_parts as i32)
        .bind(record.segments as i32)
        .bind(record.status.as_str())
        .bind(record.provider.map(|p| p.as_str()))
        .bind(&record.external_message_id)
        .bind(&record.error_code)
        .bind(&record.error_message)
        .bind(record.cost)
        .bind(record.created_at)
        .bind(record.sent_at)
        .bind(record.delivered_at)
        .bind(record.updated_at)
        .fetch_one(&*self.pool)
        .await?;

        message_from_row(&row)
    }

    async fn find_message_by_external_id(
        &self,
        external_message_id: &str,
    ) -> StoreResult<Option<SmsRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM sms_communications WHERE external_message_id = $1 LIMIT 1",
            MESSAGE_COLUMNS
        ))
        .bind(external_message_id)
        .fetch_optional(&*self.pool)
        .await?;

        row.as_ref().map(message_from_row).transpose()
    }

    async fn advance_message_status(
        &self,
        external_message_id: &str,
        update: &StatusUpdate,
    ) -> StoreResult<StatusAdvance> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE sms_communications SET
                status = $2,
                updated_at = $3,
                sent_at = CASE WHEN $2 IN ('sent', 'delivered') THEN COALESCE(sent_at, $3)
                               ELSE sent_at END,
                delivered_at = CASE WHEN $2 = 'delivered' THEN $3 ELSE delivered_at END,
                error_code = COALESCE($4, error_code),
                error_message = COALESCE($5, error_message)
            WHERE external_message_id = $1
              AND sms_status_rank(status) < 2
              AND sms_status_rank(status) < sms_status_rank($2)
            RETURNING {}
            "#,
            MESSAGE_COLUMNS
        ))
        .bind(external_message_id)
        .bind(update.status.as_str())
        .bind(update.at)
        .bind(&update.error_code)
        .bind(&update.error_message)
        .fetch_optional(&*self.pool)
        .await?;

        if let Some(row) = row {
            return Ok(StatusAdvance::Applied(message_from_row(&row)?));
        }

        Ok(match self.find_message_by_external_id(external_message_id).await? {
            Some(record) => StatusAdvance::Ignored(record),
            None => StatusAdvance::Unknown,
        })
    }

    async fn complete_message_send(
        &self,
        id: Uuid,
        completion: &SendCompletion,
    ) -> StoreResult<SmsRecord> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE sms_communications SET
                status = CASE WHEN sms_status_rank(status) < 2
                               AND sms_status_rank(status) < sms_status_rank($2)
                              THEN $2 ELSE status END,
                sent_at = CASE WHEN $2 = 'sent' THEN $8 ELSE sent_at END,
                provider = COALESCE($3, provider),
                external_message_id = COALESCE($4, external_message_id),
                cost = COALESCE($5, cost),
                error_code = $6,
                error_message = $7,
                updated_at = $8
            WHERE id = $1
            RETURNING {}
            "#,
            MESSAGE_COLUMNS
        ))
        .bind(id)
        .bind(completion.status.as_str())
        .bind(completion.provider.map(|p| p.as_str()))
        .bind(&completion.external_message_id)
        .bind(completion.cost)
        .bind(&completion.error_code)
        .bind(&completion.error_message)
        .bind(completion.at)
        .fetch_optional(&*self.pool)
        .await?;

        match row {
            Some(row) => message_from_row(&row),
            None => Err(StoreError::not_found(format!("message {}", id))),
        }
    }

    async fn list_messages(
        &self,
        organization_id: Uuid,
        since: DateTime<Utc>,
    ) -> StoreResult<Vec<SmsRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM sms_communications WHERE organization_id = $1 AND created_at >= $2",
            MESSAGE_COLUMNS
        ))
        .bind(organization_id)
        .bind(since)
        .fetch_all(&*self.pool)
        .await?;

        rows.iter().map(message_from_row).collect()
    }

    async fn insert_emergency_if_absent(
        &self,
        emergency: EmergencyNotification,
    ) -> StoreResult<InsertOutcome<EmergencyNotification>> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO emergency_notifications ({cols})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16,
                    $17, $18, $19)
            ON CONFLICT (organization_id, tool_call_id) DO NOTHING
            RETURNING {cols}
            "#,
            cols = EMERGENCY_COLUMNS
        ))
        .bind(emergency.id)
        .bind(emergency.organization_id)
        .bind(&emergency.tool_call_id)
        .bind(&emergency.call_id)
        .bind(emergency.contact_id)
        .bind(&emergency.contact_name)
        .bind(&emergency.contact_phone)
        .bind(&emergency.emergency_type)
        .bind(emergency.severity.as_str())
        .bind(&emergency.description)
        .bind(&emergency.location)
        .bind(&emergency.caller_phone)
        .bind(emergency.status.as_str())
        .bind(emergency.sms_message_id)
        .bind(&emergency.last_error)
        .bind(emergency.created_at)
        .bind(emergency.sent_at)
        .bind(emergency.resolved_at)
        .bind(&emergency.resolved_by)
        .fetch_optional(&*self.pool)
        .await?;

        if let Some(row) = row {
            return Ok(InsertOutcome::Inserted(emergency_from_row(&row)?));
        }

        let row = sqlx::query(&format!(
            "SELECT {} FROM emergency_notifications \
             WHERE organization_id = $1 AND tool_call_id = $2",
            EMERGENCY_COLUMNS
        ))
        .bind(emergency.organization_id)
        .bind(&emergency.tool_call_id)
        .fetch_one(&*self.pool)
        .await?;
        Ok(InsertOutcome::Existing(emergency_from_row(&row)?))
    }

    async fn update_emergency_status(
        &self,
        organization_id: Uuid,
        id: Uuid,
        update: &EmergencyUpdate,
    ) -> StoreResult<EmergencyNotification> {
        let current = self
            .get_emergency(organization_id, id)
            .await?
            .ok_or_else(|| StoreError::not_found(format!("emergency {}", id)))?;

        if current.status != update.status && !current.status.can_transition_to(update.status) {
            return Err(StoreError::conflict(format!(
                "emergency {} cannot move from {} to {}",
                id,
                current.status.as_str(),
                update.status.as_str()
            )));
        }

        let row = sqlx::query(&format!(
            r#"
            UPDATE emergency_notifications SET
                status = $3,
                sent_at = CASE WHEN $3 = 'sent' AND status <> 'sent' THEN $7 ELSE sent_at END,
                resolved_at = CASE WHEN $3 = 'resolved' AND status <> 'resolved'
                                   THEN $7 ELSE resolved_at END,
                resolved_by = CASE WHEN $3 = 'resolved' AND status <> 'resolved'
                                   THEN $6 ELSE resolved_by END,
                sms_message_id = COALESCE($4, sms_message_id),
                last_error = COALESCE($5, last_error)
            WHERE organization_id = $1 AND id = $2 AND status = $8
            RETURNING {}
            "#,
            EMERGENCY_COLUMNS
        ))
        .bind(organization_id)
        .bind(id)
        .bind(update.status.as_str())
        .bind(update.sms_message_id)
        .bind(&update.last_error)
        .bind(&update.resolved_by)
        .bind(update.at)
        .bind(current.status.as_str())
        .fetch_optional(&*self.pool)
        .await?;

        match row {
            Some(row) => emergency_from_row(&row),
            None => Err(StoreError::conflict(format!(
                "emergency {} changed concurrently",
                id
            ))),
        }
    }

    async fn get_emergency(
        &self,
        organization_id: Uuid,
        id: Uuid,
    ) -> StoreResult<Option<EmergencyNotification>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM emergency_notifications WHERE organization_id = $1 AND id = $2",
            EMERGENCY_COLUMNS
        ))
        .bind(organization_id)
        .bind(id)
        .fetch_optional(&*self.pool)
        .await?;

        row.as_ref().map(emergency_from_row).transpose()
    }

    async fn insert_transfer_if_absent(
        &self,
        transfer: CallTransfer,
    ) -> StoreResult<InsertOutcome<CallTransfer>> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO call_transfers ({cols})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (organization_id, tool_call_id) DO NOTHING
            RETURNING {cols}
            "#,
            cols = TRANSFER_COLUMNS
        ))
        .bind(transfer.id)
        .bind(transfer.organization_id)
        .bind(&transfer.tool_call_id)
        .bind(&transfer.call_id)
        .bind(&transfer.transfer_to)
        .bind(&transfer.reason)
        .bind(&transfer.caller_phone)
        .bind(transfer.priority.as_str())
        .bind(transfer.emergency_id)
        .bind(transfer.created_at)
        .fetch_optional(&*self.pool)
        .await?;

        if let Some(row) = row {
            return Ok(InsertOutcome::Inserted(transfer_from_row(&row)?));
        }

        let row = sqlx::query(&format!(
            "SELECT {} FROM call_transfers WHERE organization_id = $1 AND tool_call_id = $2",
            TRANSFER_COLUMNS
        ))
        .bind(transfer.organization_id)
        .bind(&transfer.tool_call_id)
        .fetch_one(&*self.pool)
        .await?;
        Ok(InsertOutcome::Existing(transfer_from_row(&row)?))
    }
}

// Row mapping

fn parse<T: FromStr<Err = String>>(value: &str) -> StoreResult<T> {
    value.parse().map_err(StoreError::backend)
}

fn parse_opt<T: FromStr<Err = String>>(value: Option<String>) -> StoreResult<Option<T>> {
    value.as_deref().map(parse).transpose()
}

fn organization_from_row(row: &PgRow) -> StoreResult<Organization> {
    Ok(Organization {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        default_language: parse(row.try_get("default_language")?)?,
        utc_offset_minutes: row.try_get("utc_offset_minutes")?,
        business_hours_start: row.try_get("business_hours_start")?,
        business_hours_end: row.try_get("business_hours_end")?,
        business_days: row.try_get("business_days")?,
        emergency_contact_name: row.try_get("emergency_contact_name")?,
        emergency_contact_phone: row.try_get("emergency_contact_phone")?,
        transfer_phone: row.try_get("transfer_phone")?,
        sms_phone: row.try_get("sms_phone")?,
        voice_phone: row.try_get("voice_phone")?,
        preferred_sms_provider: parse_opt(row.try_get("preferred_sms_provider")?)?,
        is_active: row.try_get("is_active")?,
        created_at: row.try_get("created_at")?,
    })
}

fn customer_from_row(row: &PgRow) -> StoreResult<Customer> {
    Ok(Customer {
        id: row.try_get("id")?,
        organization_id: row.try_get("organization_id")?,
        name: row.try_get("name")?,
        phone: row.try_get("phone")?,
        email: row.try_get("email")?,
        language_preference: parse(row.try_get("language_preference")?)?,
        sms_opt_in: row.try_get("sms_opt_in")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn contact_from_row(row: &PgRow) -> StoreResult<EmergencyContact> {
    Ok(EmergencyContact {
        id: row.try_get("id")?,
        organization_id: row.try_get("organization_id")?,
        name: row.try_get("name")?,
        phone: row.try_get("phone")?,
        available_days: row.try_get("available_days")?,
        available_hours_start: row.try_get("available_hours_start")?,
        available_hours_end: row.try_get("available_hours_end")?,
        priority: row.try_get("priority")?,
        is_active: row.try_get("is_active")?,
    })
}

fn appointment_from_row(row: &PgRow) -> StoreResult<Appointment> {
    Ok(Appointment {
        id: row.try_get("id")?,
        organization_id: row.try_get("organization_id")?,
        customer_id: row.try_get("customer_id")?,
        service_type: row.try_get("service_type")?,
        scheduled_date: row.try_get("scheduled_date")?,
        scheduled_time: row.try_get("scheduled_time")?,
        duration_minutes: row.try_get("duration_minutes")?,
        status: parse(row.try_get("status")?)?,
        language: parse_opt(row.try_get("language")?)?,
        address: row.try_get("address")?,
        notes: row.try_get("notes")?,
        tool_call_id: row.try_get("tool_call_id")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn template_from_row(row: &PgRow) -> StoreResult<NotificationTemplate> {
    Ok(NotificationTemplate {
        id: row.try_get("id")?,
        organization_id: row.try_get("organization_id")?,
        template_key: row.try_get("template_key")?,
        language: parse(row.try_get("language")?)?,
        content: row.try_get("content")?,
        variables: row.try_get("variables")?,
        category: parse(row.try_get("category")?)?,
        is_active: row.try_get("is_active")?,
        version: row.try_get("version")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn workflow_from_row(row: &PgRow) -> StoreResult<Workflow> {
    let steps: serde_json::Value = row.try_get("steps")?;
    let steps: Vec<WorkflowStep> =
        serde_json::from_value(steps).map_err(|e| StoreError::backend(e.to_string()))?;
    let status: WorkflowStatus = parse(row.try_get("status")?)?;
    let failed_step: Option<i32> = row.try_get("failed_step")?;

    Ok(Workflow {
        id: row.try_get("id")?,
        organization_id: row.try_get("organization_id")?,
        customer_id: row.try_get("customer_id")?,
        appointment_id: row.try_get("appointment_id")?,
        workflow_type: parse(row.try_get("workflow_type")?)?,
        status,
        scheduled_at: row.try_get("scheduled_at")?,
        metadata: row.try_get("metadata")?,
        steps,
        failed_step: failed_step.map(|s| s as usize),
        failure_reason: row.try_get("failure_reason")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

fn message_from_row(row: &PgRow) -> StoreResult<SmsRecord> {
    let part: i32 = row.try_get("part")?;
    let total_parts: i32 = row.try_get("total_parts")?;
    let segments: i32 = row.try_get("segments")?;
    let status: MessageStatus = parse(row.try_get("status")?)?;

    Ok(SmsRecord {
        id: row.try_get("id")?,
        organization_id: row.try_get("organization_id")?,
        workflow_id: row.try_get("workflow_id")?,
        appointment_id: row.try_get("appointment_id")?,
        customer_id: row.try_get("customer_id")?,
        direction: parse(row.try_get("direction")?)?,
        message_type: row.try_get("message_type")?,
        category: parse(row.try_get("category")?)?,
        language: parse(row.try_get("language")?)?,
        language_fallback: row.try_get("language_fallback")?,
        to_phone: row.try_get("to_phone")?,
        from_phone: row.try_get("from_phone")?,
        body: row.try_get("body")?,
        part: part.max(1) as u32,
        total_parts: total_parts.max(1) as u32,
        segments: segments.max(1) as u32,
        status,
        provider: parse_opt(row.try_get("provider")?)?,
        external_message_id: row.try_get("external_message_id")?,
        error_code: row.try_get("error_code")?,
        error_message: row.try_get("error_message")?,
        cost: row.try_get("cost")?,
        created_at: row.try_get("created_at")?,
        sent_at: row.try_get("sent_at")?,
        delivered_at: row.try_get("delivered_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn emergency_from_row(row: &PgRow) -> StoreResult<EmergencyNotification> {
    Ok(EmergencyNotification {
        id: row.try_get("id")?,
        organization_id: row.try_get("organization_id")?,
        tool_call_id: row.try_get("tool_call_id")?,
        call_id: row.try_get("call_id")?,
        contact_id: row.try_get("contact_id")?,
        contact_name: row.try_get("contact_name")?,
        contact_phone: row.try_get("contact_phone")?,
        emergency_type: row.try_get("emergency_type")?,
        severity: parse(row.try_get("severity")?)?,
        description: row.try_get("description")?,
        location: row.try_get("location")?,
        caller_phone: row.try_get("caller_phone")?,
        status: parse(row.try_get("status")?)?,
        sms_message_id: row.try_get("sms_message_id")?,
        last_error: row.try_get("last_error")?,
        created_at: row.try_get("created_at")?,
        sent_at: row.try_get("sent_at")?,
        resolved_at: row.try_get("resolved_at")?,
        resolved_by: row.try_get("resolved_by")?,
    })
}

fn transfer_from_row(row: &PgRow) -> StoreResult<CallTransfer> {
    Ok(CallTransfer {
        id: row.try_get("id")?,
        organization_id: row.try_get("organization_id")?,
        tool_call_id: row.try_get("tool_call_id")?,
        call_id: row.try_get("call_id")?,
        transfer_to: row.try_get("transfer_to")?,
        reason: row.try_get("reason")?,
        caller_phone: row.try_get("caller_phone")?,
        priority: parse(row.try_get("priority")?)?,
        emergency_id: row.try_get("emergency_id")?,
        created_at: row.try_get("created_at")?,
    })
}

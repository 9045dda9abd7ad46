//! # Workflow, dispatch and analytics scenarios
//!
//! End-to-end runs against the in-memory store with a recording provider.

mod common;

use chrono::{Duration, Utc};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use std::collections::HashMap;

use common::{appointment, customer, organization, service};
use serviceai_notify::dispatcher::{Recipient, SendOptions};
use serviceai_notify::{
    AppointmentEvent, Language, MessageStatus, NotifyError, TemplateCategory, TimeRange,
    WorkflowStatus, WorkflowType,
};
use serviceai_shared::types::CreateWorkflowRequest;

fn request(
    org: uuid::Uuid,
    customer: Option<uuid::Uuid>,
    appointment: Option<uuid::Uuid>,
    workflow_type: WorkflowType,
) -> CreateWorkflowRequest {
    CreateWorkflowRequest {
        organization_id: org,
        customer_id: customer,
        appointment_id: appointment,
        workflow_type,
        scheduled_at: None,
        metadata: Value::Null,
    }
}

#[tokio::test]
async fn test_spanish_confirmation_runs_immediately() {
    let svc = service();
    let maria = customer(&svc.store, &svc.org, "+15551234567", Language::Es).await;
    let visit = appointment(&svc.store, &svc.org, &maria, 3).await;

    let workflow = svc
        .manager
        .engine()
        .create_workflow(request(
            svc.org.id,
            Some(maria.id),
            Some(visit.id),
            WorkflowType::AppointmentConfirmation,
        ))
        .await
        .unwrap();

    assert_eq!(workflow.status, WorkflowStatus::Completed);

    let records = svc.store.messages();
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.language, Language::Es);
    assert!(!record.language_fallback);
    assert_eq!(record.message_type, "appointment_confirmation");
    assert_eq!(record.workflow_id, Some(workflow.id));
    assert_eq!(record.to_phone, "+15551234567");
    assert_eq!(record.status, MessageStatus::Sent);
    assert_eq!(record.total_parts, 1);

    let outbox = svc.sandbox.outbox();
    assert_eq!(outbox.len(), 1);
    assert!(outbox[0].1.body.starts_with("Hola Maria Garcia"));
    assert_eq!(outbox[0].1.body, record.body);
}

#[tokio::test]
async fn test_cancelling_completed_workflow_is_rejected() {
    let svc = service();
    let maria = customer(&svc.store, &svc.org, "+15551234567", Language::En).await;
    let visit = appointment(&svc.store, &svc.org, &maria, 3).await;

    let workflow = svc
        .manager
        .engine()
        .create_workflow(request(
            svc.org.id,
            Some(maria.id),
            Some(visit.id),
            WorkflowType::AppointmentConfirmation,
        ))
        .await
        .unwrap();
    assert_eq!(workflow.status, WorkflowStatus::Completed);

    let result = svc
        .manager
        .engine()
        .cancel_workflow(Some(svc.org.id), workflow.id)
        .await;
    assert!(matches!(
        result,
        Err(NotifyError::InvalidStateTransition { .. })
    ));

    let stored = svc
        .manager
        .engine()
        .get_workflow(Some(svc.org.id), workflow.id)
        .await
        .unwrap();
    assert_eq!(stored.status, WorkflowStatus::Completed);
    assert_eq!(stored.updated_at, workflow.updated_at);
}

#[tokio::test]
async fn test_missing_variable_sends_nothing() {
    let svc = service();
    let vars: HashMap<String, Value> =
        HashMap::from([("customer_name".to_string(), json!("Maria"))]);

    let result = svc
        .manager
        .dispatcher()
        .send_templated(
            &svc.org,
            "appointment_confirmation",
            &[Recipient::phone("+15551234567")],
            &vars,
            Language::En,
            &SendOptions::new(
                TemplateCategory::Confirmation,
                "appointment_confirmation",
                Language::En,
            ),
        )
        .await;

    assert!(matches!(result, Err(NotifyError::MissingVariable { .. })));
    assert!(svc.sandbox.outbox().is_empty());
    assert!(svc.store.messages().is_empty());
}

#[tokio::test]
async fn test_workflow_without_appointment_data_fails_permanently() {
    let svc = service();
    let maria = customer(&svc.store, &svc.org, "+15551234567", Language::En).await;

    let workflow = svc
        .manager
        .engine()
        .create_workflow(request(
            svc.org.id,
            Some(maria.id),
            None,
            WorkflowType::AppointmentConfirmation,
        ))
        .await
        .unwrap();

    assert_eq!(workflow.status, WorkflowStatus::Failed);
    assert_eq!(workflow.failed_step, Some(0));
    assert!(workflow
        .failure_reason
        .as_deref()
        .unwrap_or_default()
        .starts_with("MISSING_VARIABLE"));
    assert!(svc.sandbox.outbox().is_empty());
}

#[tokio::test]
async fn test_empty_trends_are_zero_filled() {
    let svc = service();

    let trends = svc
        .manager
        .tracker()
        .get_delivery_trends(svc.org.id, TimeRange::LastDay)
        .await
        .unwrap();
    assert_eq!(trends.len(), TimeRange::LastDay.bucket_count());
    assert!(trends
        .iter()
        .all(|b| b.sent == 0 && b.delivered == 0 && b.failed == 0));

    let stats = svc
        .manager
        .tracker()
        .get_delivery_statistics(svc.org.id, TimeRange::LastDay)
        .await
        .unwrap();
    assert_eq!(stats.total_sent, 0);
    assert_eq!(stats.delivery_rate, 0.0);
}

#[tokio::test]
async fn test_partial_batch_reports_every_recipient() {
    let svc = service();
    let vars: HashMap<String, Value> = HashMap::from([
        ("customer_name".to_string(), json!("friend")),
        ("business_name".to_string(), json!(svc.org.name)),
        ("service_type".to_string(), json!("tune-up")),
    ]);
    let recipients = [
        Recipient::phone("+15551230001"),
        Recipient::phone("not-a-number"),
        Recipient::phone("555-123-0002"),
        Recipient::phone("12"),
    ];

    let results = svc
        .manager
        .dispatcher()
        .send_templated(
            &svc.org,
            "follow_up",
            &recipients,
            &vars,
            Language::En,
            &SendOptions::new(TemplateCategory::FollowUp, "follow_up", Language::En),
        )
        .await
        .unwrap();

    assert_eq!(results.len(), 4);
    let invalid = results
        .iter()
        .filter(|r| !r.success && r.error_code.as_deref() == Some("INVALID_PHONE_NUMBER"))
        .count();
    assert_eq!(invalid, 2);
    assert!(results[0].success);
    assert!(results[2].success);
    assert_eq!(svc.sandbox.outbox().len(), 2);
}

#[tokio::test]
async fn test_appointment_created_schedules_reminder() {
    let svc = service();
    let maria = customer(&svc.store, &svc.org, "+15551234567", Language::En).await;
    let visit = appointment(&svc.store, &svc.org, &maria, 3).await;

    let workflows = svc
        .manager
        .engine()
        .handle_appointment_event(svc.org.id, visit.id, AppointmentEvent::Created)
        .await
        .unwrap();

    let kinds: Vec<_> = workflows.iter().map(|w| (w.workflow_type, w.status)).collect();
    assert!(kinds.contains(&(WorkflowType::AppointmentConfirmation, WorkflowStatus::Completed)));
    assert!(kinds.contains(&(WorkflowType::AppointmentReminder, WorkflowStatus::Scheduled)));
    let sent_after_confirmation = svc.sandbox.outbox().len();

    // A replayed event adds nothing
    let replay = svc
        .manager
        .engine()
        .handle_appointment_event(svc.org.id, visit.id, AppointmentEvent::Created)
        .await
        .unwrap();
    assert!(replay.is_empty());

    // Nothing is due yet
    let summary = svc.manager.engine().execute_due_workflows().await.unwrap();
    assert_eq!(summary.picked, 0);

    // The reminder goes out once its time has come
    let later = Utc::now() + Duration::days(3);
    let summary = svc
        .manager
        .engine()
        .execute_due_workflows_at(later)
        .await
        .unwrap();
    assert_eq!(summary.completed, 1);
    assert!(svc.sandbox.outbox().len() > sent_after_confirmation);
    assert!(svc
        .store
        .messages()
        .iter()
        .any(|m| m.message_type == "appointment_reminder"));
}

#[tokio::test]
async fn test_other_tenant_cannot_see_or_cancel_workflow() {
    let svc = service();
    let other = organization("Other Plumbing");
    svc.store.insert_organization(other.clone());

    let maria = customer(&svc.store, &svc.org, "+15551234567", Language::En).await;
    let visit = appointment(&svc.store, &svc.org, &maria, 3).await;
    let mut req = request(
        svc.org.id,
        Some(maria.id),
        Some(visit.id),
        WorkflowType::AppointmentReminder,
    );
    req.scheduled_at = Some(Utc::now() + Duration::days(1));
    let workflow = svc.manager.engine().create_workflow(req).await.unwrap();

    let seen = svc
        .manager
        .engine()
        .get_workflow(Some(other.id), workflow.id)
        .await;
    assert!(matches!(seen, Err(NotifyError::NotFound { .. })));

    let cancelled = svc
        .manager
        .engine()
        .cancel_workflow(Some(other.id), workflow.id)
        .await;
    assert!(matches!(cancelled, Err(NotifyError::NotFound { .. })));

    let stored = svc
        .manager
        .engine()
        .get_workflow(Some(svc.org.id), workflow.id)
        .await
        .unwrap();
    assert_eq!(stored.status, WorkflowStatus::Scheduled);

    // Customer ids from another tenant are not accepted either
    let foreign = svc
        .manager
        .engine()
        .create_workflow(request(
            other.id,
            Some(maria.id),
            None,
            WorkflowType::FollowUp,
        ))
        .await;
    assert!(matches!(foreign, Err(NotifyError::NotFound { .. })));
}

//! Shared fixtures for the integration tests: an in-memory service with a
//! recording sandbox provider and a seeded organization.

#![allow(dead_code)]

use chrono::{Duration, NaiveTime, Utc};
use std::sync::Arc;
use uuid::Uuid;

use serviceai_notify::channels::{ProviderRegistry, SandboxProvider};
use serviceai_notify::config::{NotifyConfig, RetryConfig};
use serviceai_notify::{
    Appointment, AppointmentStatus, Customer, Language, MemoryStore, NotifyManager, Organization,
    Persistence,
};

pub const JWT_SECRET: &str = "integration-secret";
pub const SMS_NUMBER: &str = "+15550001000";
pub const VOICE_NUMBER: &str = "+15550002000";

pub struct TestService {
    pub manager: Arc<NotifyManager>,
    pub store: Arc<MemoryStore>,
    pub sandbox: SandboxProvider,
    pub org: Organization,
}

pub fn test_config() -> NotifyConfig {
    let mut config = NotifyConfig::default();
    config.auth.jwt_secret = JWT_SECRET.to_string();
    config.auth.scheduler_token = "scheduler-token".to_string();
    config.webhooks.verify_signatures = false;
    config.retry = RetryConfig {
        initial_delay_ms: 1,
        max_delay_ms: 2,
        jitter: false,
        ..RetryConfig::default()
    };
    config
}

pub fn organization(name: &str) -> Organization {
    Organization {
        id: Uuid::new_v4(),
        name: name.to_string(),
        default_language: Language::En,
        utc_offset_minutes: 0,
        business_hours_start: NaiveTime::from_hms_opt(8, 0, 0).unwrap(),
        business_hours_end: NaiveTime::from_hms_opt(17, 0, 0).unwrap(),
        business_days: vec![0, 1, 2, 3, 4, 5, 6],
        emergency_contact_name: Some("Dispatch".to_string()),
        emergency_contact_phone: Some("+15550009999".to_string()),
        transfer_phone: Some("+15550008888".to_string()),
        sms_phone: Some(SMS_NUMBER.to_string()),
        voice_phone: Some(VOICE_NUMBER.to_string()),
        preferred_sms_provider: None,
        is_active: true,
        created_at: Utc::now(),
    }
}

pub fn service() -> TestService {
    service_with(test_config())
}

pub fn service_with(config: NotifyConfig) -> TestService {
    let store = Arc::new(MemoryStore::new());
    let org = organization("Cool Air HVAC");
    store.insert_organization(org.clone());
    store.add_member(org.id, "owner-a");

    let sandbox = SandboxProvider::new("+15005550006");
    let registry = ProviderRegistry::new(vec![], vec![Arc::new(sandbox.clone())]);
    let manager = NotifyManager::with_parts(config, store.clone(), registry)
        .expect("manager builds from test config");

    TestService {
        manager: Arc::new(manager),
        store,
        sandbox,
        org,
    }
}

pub async fn customer(
    store: &MemoryStore,
    org: &Organization,
    phone: &str,
    language: Language,
) -> Customer {
    let now = Utc::now();
    store
        .upsert_customer(Customer {
            id: Uuid::new_v4(),
            organization_id: org.id,
            name: Some("Maria Garcia".to_string()),
            phone: phone.to_string(),
            email: None,
            language_preference: language,
            sms_opt_in: true,
            created_at: now,
            updated_at: now,
        })
        .await
        .unwrap()
}

/// Appointment at 10:00 organization time, `days_ahead` days from today
pub async fn appointment(
    store: &MemoryStore,
    org: &Organization,
    customer: &Customer,
    days_ahead: i64,
) -> Appointment {
    let now = Utc::now();
    let date = (org.local_time(now) + Duration::days(days_ahead)).date();
    store
        .insert_appointment_if_absent(Appointment {
            id: Uuid::new_v4(),
            organization_id: org.id,
            customer_id: Some(customer.id),
            service_type: "ac_repair".to_string(),
            scheduled_date: date,
            scheduled_time: NaiveTime::from_hms_opt(10, 0, 0).unwrap(),
            duration_minutes: 60,
            status: AppointmentStatus::Pending,
            language: None,
            address: Some("12 Elm St".to_string()),
            notes: None,
            tool_call_id: None,
            created_at: now,
            updated_at: now,
        })
        .await
        .unwrap()
        .into_inner()
}

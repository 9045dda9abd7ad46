//! # ServiceAI Notification Service
//!
//! Templated, bilingual (English/Spanish) SMS notification workflows for
//! service businesses, driven by voice assistant and SMS vendor webhooks:
//! - Template resolution with organization overrides and language fallback
//! - SMS dispatch through Twilio, Telnyx or a sandbox, with provider fallback
//! - Delivery tracking fed by vendor status callbacks, plus analytics
//! - Appointment workflows (confirmation, reminder, cancellation, follow-up,
//!   survey) and emergency escalation with bounded retries
//! - Voice tool calls (transfer, emergency escalation, availability, booking)
//!   and inbound SMS keywords (STOP/START/HELP/YES and Spanish equivalents)
//!
//! ## Usage
//!
//! ```rust,no_run
//! use serviceai_notify::{routes::create_router, NotifyConfig, NotifyManager};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = NotifyConfig::from_env()?;
//!     let manager = Arc::new(NotifyManager::new(config).await?);
//!
//!     let app = create_router(manager);
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:8086").await?;
//!     axum::serve(listener, app).await?;
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod channels;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod handlers;
pub mod manager;
pub mod metrics;
pub mod phone;
pub mod retry;
pub mod routes;
pub mod segments;
pub mod store;
pub mod templates;
pub mod tracker;
pub mod webhooks;
pub mod workflow;

pub use config::NotifyConfig;
pub use dispatcher::{NotificationDispatcher, Recipient, SendOptions};
pub use error::{NotifyError, Result};
pub use manager::NotifyManager;
pub use store::{MemoryStore, Persistence, PgStore};
pub use templates::TemplateStore;
pub use tracker::DeliveryTracker;
pub use webhooks::WebhookIngress;
pub use workflow::WorkflowEngine;

// Re-export shared types for convenience
pub use serviceai_shared::types::{
    Appointment, AppointmentEvent, AppointmentStatus, Customer, DispatchResult, Language,
    MessageStatus, NotificationTemplate, Organization, SmsRecord, TemplateCategory, TimeRange,
    Workflow, WorkflowStatus, WorkflowType,
};

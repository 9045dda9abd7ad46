//! Prometheus metrics for the notification service
//!
//! The service owns its [`Registry`]; nothing is registered globally.

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
};
use serviceai_shared::types::{
    MessageStatus, SmsProviderKind, TemplateCategory, WorkflowStatus, WorkflowType,
};
use std::sync::Arc;
use tracing::info;

use crate::config::MetricsConfig;
use crate::error::{NotifyError, Result};

/// Outcome label for a status callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Applied,
    Duplicate,
    Unknown,
}

impl UpdateOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            UpdateOutcome::Applied => "applied",
            UpdateOutcome::Duplicate => "duplicate",
            UpdateOutcome::Unknown => "unknown",
        }
    }
}

#[derive(Clone)]
pub struct NotifyMetrics {
    enabled: bool,
    registry: Arc<Registry>,
    sms_dispatch_total: IntCounterVec,
    sms_dispatch_duration: HistogramVec,
    workflow_transitions_total: IntCounterVec,
    webhook_events_total: IntCounterVec,
    delivery_status_updates_total: IntCounterVec,
}

fn register<C>(registry: &Registry, collector: C, name: &str) -> Result<C>
where
    C: prometheus::core::Collector + Clone + 'static,
{
    registry
        .register(Box::new(collector.clone()))
        .map_err(|e| NotifyError::internal(format!("Failed to register {}: {}", name, e)))?;
    Ok(collector)
}

impl NotifyMetrics {
    pub fn new(config: &MetricsConfig) -> Result<Self> {
        info!("Initializing notification metrics");

        let registry = Registry::new();

        let sms_dispatch_total = IntCounterVec::new(
            Opts::new("sms_dispatch_total", "SMS parts handed to a provider")
                .namespace(&config.namespace),
            &["provider", "category", "outcome"],
        )
        .map_err(|e| NotifyError::internal(format!("Failed to create sms_dispatch_total: {}", e)))?;

        let sms_dispatch_duration = HistogramVec::new(
            HistogramOpts::new(
                "sms_dispatch_duration_seconds",
                "Time spent in provider send calls",
            )
            .namespace(&config.namespace)
            .buckets(config.histogram_buckets.clone()),
            &["provider"],
        )
        .map_err(|e| {
            NotifyError::internal(format!("Failed to create sms_dispatch_duration: {}", e))
        })?;

        let workflow_transitions_total = IntCounterVec::new(
            Opts::new("workflow_transitions_total", "Workflow status transitions")
                .namespace(&config.namespace),
            &["workflow_type", "status"],
        )
        .map_err(|e| {
            NotifyError::internal(format!("Failed to create workflow_transitions_total: {}", e))
        })?;

        let webhook_events_total = IntCounterVec::new(
            Opts::new("webhook_events_total", "Inbound webhook events by outcome")
                .namespace(&config.namespace),
            &["source", "outcome"],
        )
        .map_err(|e| {
            NotifyError::internal(format!("Failed to create webhook_events_total: {}", e))
        })?;

        let delivery_status_updates_total = IntCounterVec::new(
            Opts::new(
                "delivery_status_updates_total",
                "Provider delivery status callbacks",
            )
            .namespace(&config.namespace),
            &["status", "outcome"],
        )
        .map_err(|e| {
            NotifyError::internal(format!(
                "Failed to create delivery_status_updates_total: {}",
                e
            ))
        })?;

        let metrics = Self {
            enabled: config.enabled,
            sms_dispatch_total: register(&registry, sms_dispatch_total, "sms_dispatch_total")?,
            sms_dispatch_duration: register(
                &registry,
                sms_dispatch_duration,
                "sms_dispatch_duration_seconds",
            )?,
            workflow_transitions_total: register(
                &registry,
                workflow_transitions_total,
                "workflow_transitions_total",
            )?,
            webhook_events_total: register(&registry, webhook_events_total, "webhook_events_total")?,
            delivery_status_updates_total: register(
                &registry,
                delivery_status_updates_total,
                "delivery_status_updates_total",
            )?,
            registry: Arc::new(registry),
        };

        info!("Notification metrics initialized successfully");
        Ok(metrics)
    }

    pub fn record_dispatch(
        &self,
        provider: Option<SmsProviderKind>,
        category: TemplateCategory,
        success: bool,
        seconds: f64,
    ) {
        if !self.enabled {
            return;
        }
        let provider = provider.map(|p| p.as_str()).unwrap_or("none");
        let outcome = if success { "success" } else { "failure" };
        self.sms_dispatch_total
            .with_label_values(&[provider, category.as_str(), outcome])
            .inc();
        self.sms_dispatch_duration
            .with_label_values(&[provider])
            .observe(seconds);
    }

    pub fn record_workflow_transition(&self, workflow_type: WorkflowType, status: WorkflowStatus) {
        if !self.enabled {
            return;
        }
        self.workflow_transitions_total
            .with_label_values(&[workflow_type.as_str(), status.as_str()])
            .inc();
    }

    pub fn record_webhook(&self, source: &str, outcome: &str) {
        if !self.enabled {
            return;
        }
        self.webhook_events_total
            .with_label_values(&[source, outcome])
            .inc();
    }

    pub fn record_status_update(&self, status: Option<MessageStatus>, outcome: UpdateOutcome) {
        if !self.enabled {
            return;
        }
        let status = status.map(|s| s.as_str()).unwrap_or("unrecognized");
        self.delivery_status_updates_total
            .with_label_values(&[status, outcome.as_str()])
            .inc();
    }

    /// Text exposition format
    pub fn export(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| NotifyError::internal(format!("Failed to encode metrics: {}", e)))?;
        String::from_utf8(buffer)
            .map_err(|e| NotifyError::internal(format!("Metrics are not UTF-8: {}", e)))
    }
}

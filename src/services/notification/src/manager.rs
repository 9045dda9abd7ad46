//! Notification Manager
//!
//! Owns the store connection and wires the Template Store, Delivery Tracker,
//! Notification Dispatcher, Workflow Engine and Webhook Ingress together.
//! Handlers reach every component through it.

use crate::channels::ProviderRegistry;
use crate::config::{NotifyConfig, StoreBackend};
use crate::dispatcher::NotificationDispatcher;
use crate::error::{NotifyError, Result};
use crate::metrics::NotifyMetrics;
use crate::retry::RetryPolicy;
use crate::store::{MemoryStore, Persistence, PgStore};
use crate::templates::TemplateStore;
use crate::tracker::DeliveryTracker;
use crate::webhooks::WebhookIngress;
use crate::workflow::WorkflowEngine;

use serviceai_shared::types::HealthCheckResponse;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

pub struct NotifyManager {
    config: NotifyConfig,
    store: Arc<dyn Persistence>,
    templates: Arc<TemplateStore>,
    tracker: DeliveryTracker,
    dispatcher: Arc<NotificationDispatcher>,
    engine: Arc<WorkflowEngine>,
    ingress: WebhookIngress,
    metrics: NotifyMetrics,
    started_at: Instant,
}

impl NotifyManager {
    /// Validate the configuration, connect the configured store and register
    /// the enabled SMS providers
    pub async fn new(config: NotifyConfig) -> Result<Self> {
        info!("Initializing notification manager");

        config.validate().map_err(NotifyError::config)?;

        let store: Arc<dyn Persistence> = match config.database.backend {
            StoreBackend::Postgres => Arc::new(PgStore::connect(&config.database).await?),
            StoreBackend::Memory => {
                warn!("Using the in-memory store; nothing survives a restart");
                Arc::new(MemoryStore::new())
            }
        };
        let providers = ProviderRegistry::from_config(&config.sms, &config.webhooks)?;

        let manager = Self::with_parts(config, store, providers)?;
        info!(
            store = manager.store.backend(),
            providers = ?manager.dispatcher.providers().enabled(),
            "Notification manager initialized successfully"
        );
        Ok(manager)
    }

    /// Assemble the components around an existing store and provider set
    pub fn with_parts(
        config: NotifyConfig,
        store: Arc<dyn Persistence>,
        providers: ProviderRegistry,
    ) -> Result<Self> {
        let metrics = NotifyMetrics::new(&config.metrics)?;
        let templates = Arc::new(TemplateStore::new(store.clone(), &config.templates)?);
        let tracker = DeliveryTracker::new(store.clone(), metrics.clone());
        let dispatcher = Arc::new(NotificationDispatcher::new(
            store.clone(),
            templates.clone(),
            tracker.clone(),
            providers,
            metrics.clone(),
            &config.sms,
        ));
        let engine = Arc::new(WorkflowEngine::new(
            store.clone(),
            templates.clone(),
            dispatcher.clone(),
            metrics.clone(),
            RetryPolicy::new(&config.retry),
            &config.workflows,
        ));
        let ingress = WebhookIngress::new(
            store.clone(),
            templates.clone(),
            dispatcher.clone(),
            engine.clone(),
            tracker.clone(),
            metrics.clone(),
            &config.webhooks,
            &config.sms,
        );

        Ok(Self {
            config,
            store,
            templates,
            tracker,
            dispatcher,
            engine,
            ingress,
            metrics,
            started_at: Instant::now(),
        })
    }

    pub fn config(&self) -> &NotifyConfig {
        &self.config
    }

    pub fn store(&self) -> &dyn Persistence {
        self.store.as_ref()
    }

    pub fn templates(&self) -> &TemplateStore {
        &self.templates
    }

    pub fn tracker(&self) -> &DeliveryTracker {
        &self.tracker
    }

    pub fn dispatcher(&self) -> &NotificationDispatcher {
        &self.dispatcher
    }

    pub fn engine(&self) -> &WorkflowEngine {
        &self.engine
    }

    pub fn ingress(&self) -> &WebhookIngress {
        &self.ingress
    }

    pub fn metrics(&self) -> &NotifyMetrics {
        &self.metrics
    }

    /// Service health; `degraded` when the store does not answer
    pub async fn health_check(&self) -> HealthCheckResponse {
        let status = match self.store.health_check().await {
            Ok(()) => "healthy",
            Err(e) => {
                error!(store = self.store.backend(), error = %e, "Store health check failed");
                "degraded"
            }
        };

        HealthCheckResponse {
            status: status.to_string(),
            service: "serviceai-notify".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            store: self.store.backend().to_string(),
            providers: self.dispatcher.providers().enabled(),
            uptime_seconds: self.started_at.elapsed().as_secs(),
        }
    }
}

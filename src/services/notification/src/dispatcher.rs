//! Notification dispatcher
//!
//! Turns a logical send (direct text, templated batch, emergency broadcast)
//! into provider calls and returns one normalized [`DispatchResult`] per
//! recipient. Failures are values here, not errors: a batch never aborts
//! because one recipient failed.

use chrono::Utc;
use dashmap::DashMap;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use serde_json::Value;
use serviceai_shared::types::{
    DispatchResult, Language, MessageDirection, MessageStatus, Organization, ProviderChoice,
    SmsProviderKind, SmsRecord, TemplateCategory,
};
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::channels::{OutboundSms, ProviderError, ProviderReceipt, ProviderRegistry, SmsProvider};
use crate::config::SmsConfig;
use crate::error::{NotifyError, Result};
use crate::metrics::NotifyMetrics;
use crate::phone;
use crate::segments;
use crate::store::{Persistence, SendCompletion};
use crate::templates::TemplateStore;
use crate::tracker::DeliveryTracker;

/// Context attached to every record a send produces
#[derive(Debug, Clone)]
pub struct SendOptions {
    pub workflow_id: Option<Uuid>,
    pub appointment_id: Option<Uuid>,
    pub customer_id: Option<Uuid>,
    pub provider: ProviderChoice,
    pub category: TemplateCategory,
    /// Template key, or `direct` for untemplated text
    pub message_type: String,
    pub language: Language,
    pub language_fallback: bool,
    /// Parts an earlier attempt already handed to a provider
    pub skip_parts: u32,
}

impl SendOptions {
    pub fn new(category: TemplateCategory, message_type: &str, language: Language) -> Self {
        Self {
            workflow_id: None,
            appointment_id: None,
            customer_id: None,
            provider: ProviderChoice::Auto,
            category,
            message_type: message_type.to_string(),
            language,
            language_fallback: false,
            skip_parts: 0,
        }
    }

    pub fn direct(language: Language) -> Self {
        Self::new(TemplateCategory::Custom, "direct", language)
    }

    fn is_emergency(&self) -> bool {
        self.category == TemplateCategory::Emergency
    }
}

/// One addressee of a templated send
#[derive(Debug, Clone, PartialEq)]
pub struct Recipient {
    pub phone: String,
    pub customer_id: Option<Uuid>,
}

impl Recipient {
    pub fn phone(phone: &str) -> Self {
        Self {
            phone: phone.to_string(),
            customer_id: None,
        }
    }
}

pub struct NotificationDispatcher {
    store: Arc<dyn Persistence>,
    templates: Arc<TemplateStore>,
    tracker: DeliveryTracker,
    providers: ProviderRegistry,
    metrics: NotifyMetrics,
    limiters: DashMap<Uuid, Arc<DefaultDirectRateLimiter>>,
    quota: Quota,
    max_segments: usize,
    max_engagement_segments: usize,
    timeout: Duration,
}

/// One standalone SMS of a planned send
struct Part {
    body: String,
    segments: u32,
}

impl NotificationDispatcher {
    pub fn new(
        store: Arc<dyn Persistence>,
        templates: Arc<TemplateStore>,
        tracker: DeliveryTracker,
        providers: ProviderRegistry,
        metrics: NotifyMetrics,
        config: &SmsConfig,
    ) -> Self {
        let per_minute = NonZeroU32::new(config.rate_limit_per_minute).unwrap_or(NonZeroU32::MIN);
        Self {
            store,
            templates,
            tracker,
            providers,
            metrics,
            limiters: DashMap::new(),
            quota: Quota::per_minute(per_minute),
            max_segments: config.max_segments.max(1),
            max_engagement_segments: config.max_engagement_segments.max(1),
            timeout: Duration::from_secs(config.timeout_seconds),
        }
    }

    pub fn providers(&self) -> &ProviderRegistry {
        &self.providers
    }

    /// Send untemplated text to one number
    pub async fn send_direct(
        &self,
        organization: &Organization,
        to: &str,
        text: &str,
        options: &SendOptions,
    ) -> DispatchResult {
        self.deliver(organization, to, text, options).await
    }

    /// Render once, then send to every recipient. A render failure is an
    /// error and nothing is sent; per-recipient failures are results.
    pub async fn send_templated(
        &self,
        organization: &Organization,
        template_key: &str,
        recipients: &[Recipient],
        variables: &HashMap<String, Value>,
        language: Language,
        options: &SendOptions,
    ) -> Result<Vec<DispatchResult>> {
        let rendered = self
            .templates
            .render_template(organization, template_key, language, variables)
            .await?;

        let mut options = options.clone();
        options.message_type = rendered.template_key.clone();
        options.category = rendered.category;
        options.language = rendered.language;
        options.language_fallback = rendered.fallback;

        let mut results = Vec::with_capacity(recipients.len());
        for recipient in recipients {
            let mut per_recipient = options.clone();
            if recipient.customer_id.is_some() {
                per_recipient.customer_id = recipient.customer_id;
            }
            results.push(
                self.deliver(organization, &recipient.phone, &rendered.text, &per_recipient)
                    .await,
            );
        }

        let failed = results.iter().filter(|r| !r.success).count();
        info!(
            organization_id = %organization.id,
            template_key,
            recipients = recipients.len(),
            failed,
            "Templated send finished"
        );
        Ok(results)
    }

    /// Alert the organization's static emergency contact
    pub async fn send_emergency_broadcast(
        &self,
        organization: &Organization,
        message: &str,
        options: &SendOptions,
    ) -> DispatchResult {
        let mut options = options.clone();
        options.category = TemplateCategory::Emergency;

        match organization.emergency_contact_phone.as_deref() {
            Some(phone) => self.deliver(organization, phone, message, &options).await,
            None => {
                warn!(
                    organization_id = %organization.id,
                    "No emergency contact configured for broadcast"
                );
                DispatchResult::failed(
                    "",
                    "NO_EMERGENCY_CONTACT",
                    "organization has no emergency contact",
                    false,
                )
            }
        }
    }

    async fn deliver(
        &self,
        organization: &Organization,
        to: &str,
        text: &str,
        options: &SendOptions,
    ) -> DispatchResult {
        let to = match phone::normalize(to) {
            Ok(to) => to,
            Err(e) => return rejected(to, &e),
        };

        let text = text.trim();
        if text.is_empty() {
            return rejected(&to, &NotifyError::validation("text", "message is empty"));
        }

        if !options.is_emergency() {
            match self.store.find_customer_by_phone(organization.id, &to).await {
                Ok(Some(customer)) if !customer.sms_opt_in => {
                    return rejected(&to, &NotifyError::OptedOut { phone: to.clone() });
                }
                Ok(_) => {}
                Err(e) => return rejected(&to, &NotifyError::from(e)),
            }
        }

        let parts = match self.plan_parts(text, options.category) {
            Ok(parts) => parts,
            Err(e) => return rejected(&to, &e),
        };

        if !options.is_emergency() && self.limiter(organization.id).check().is_err() {
            warn!(organization_id = %organization.id, "Outbound SMS rate limit reached");
            return rejected(
                &to,
                &NotifyError::rate_limit("organization outbound SMS rate limit exceeded"),
            );
        }

        let candidates = self
            .providers
            .candidates(options.provider, organization.preferred_sms_provider);
        if candidates.is_empty() {
            return DispatchResult::failed(
                &to,
                "PROVIDER_NOT_CONFIGURED",
                "no SMS provider available",
                false,
            );
        }

        self.send_parts(organization, &to, &parts, candidates, options)
            .await
    }

    /// Emergency alerts become standalone parts with no cap; everything
    /// else is one concatenated SMS within its category's segment allowance
    fn plan_parts(&self, text: &str, category: TemplateCategory) -> Result<Vec<Part>> {
        if category.splits_into_parts() {
            return Ok(segments::split(text)
                .into_iter()
                .map(|body| Part { body, segments: 1 })
                .collect());
        }

        let count = segments::count(text);
        let limit = if category.is_operational() {
            self.max_segments
        } else {
            self.max_engagement_segments
        };
        if count > limit {
            return Err(NotifyError::MessageTooLong {
                segments: count,
                limit,
            });
        }
        Ok(vec![Part {
            body: text.to_string(),
            segments: count as u32,
        }])
    }

    fn limiter(&self, organization_id: Uuid) -> Arc<DefaultDirectRateLimiter> {
        self.limiters
            .entry(organization_id)
            .or_insert_with(|| Arc::new(RateLimiter::direct(self.quota)))
            .clone()
    }

    async fn send_parts(
        &self,
        organization: &Organization,
        to: &str,
        parts: &[Part],
        candidates: Vec<Arc<dyn SmsProvider>>,
        options: &SendOptions,
    ) -> DispatchResult {
        let total = parts.len() as u32;
        let resume_at = options.skip_parts.min(total);
        let mut result = DispatchResult {
            success: false,
            recipient: to.to_string(),
            message_id: None,
            external_message_id: None,
            provider: None,
            cost: None,
            segments: parts.iter().map(|p| p.segments).sum(),
            parts_sent: resume_at,
            language: Some(options.language),
            fallback: options.language_fallback,
            error: None,
            error_code: None,
            retryable: false,
        };

        // Later parts stay on whichever provider took the first one
        let mut candidates = candidates;

        if resume_at > 0 {
            info!(
                organization_id = %organization.id,
                resume_at,
                total,
                "Resuming split SMS after parts already sent"
            );
        }

        for (index, planned) in parts.iter().enumerate().skip(resume_at as usize) {
            let part = index as u32 + 1;
            let draft = self.draft_record(organization, to, planned, part, total, options);

            let logged = if options.is_emergency() {
                match self.tracker.record_attempt(draft.clone()).await {
                    Ok(record) => Some(record),
                    Err(e) => {
                        error!(error = %e, "Failed to log emergency SMS before send");
                        return failed_with(result, "DATABASE_ERROR", e.to_string(), true);
                    }
                }
            } else {
                None
            };

            let from = organization
                .sms_phone
                .clone()
                .or_else(|| candidates.first().map(|p| p.default_from()))
                .unwrap_or_default();
            let message = OutboundSms {
                to: to.to_string(),
                from: from.clone(),
                body: planned.body.clone(),
            };

            let (provider, outcome) = self.try_providers(&candidates, &message, options).await;
            if let Some(kind) = provider {
                candidates.retain(|p| p.kind() == kind);
            }

            let record = match &outcome {
                Ok(receipt) => {
                    let completion = SendCompletion {
                        status: receipt.status,
                        provider,
                        external_message_id: Some(receipt.external_id.clone()),
                        cost: receipt.cost,
                        error_code: None,
                        error_message: None,
                        at: Utc::now(),
                    };
                    self.persist(logged, draft, from, completion).await
                }
                Err(e) => {
                    let completion = SendCompletion {
                        status: MessageStatus::Failed,
                        provider,
                        external_message_id: None,
                        cost: None,
                        error_code: Some(e.code()),
                        error_message: Some(e.to_string()),
                        at: Utc::now(),
                    };
                    self.persist(logged, draft, from, completion).await
                }
            };

            let record = match record {
                Ok(record) => record,
                Err(e) => {
                    error!(error = %e, "Failed to record SMS attempt");
                    return failed_with(result, "DATABASE_ERROR", e.to_string(), true);
                }
            };

            match outcome {
                Ok(receipt) => {
                    if result.message_id.is_none() {
                        result.message_id = Some(record.id);
                        result.external_message_id = Some(receipt.external_id);
                        result.provider = provider;
                    }
                    if let Some(cost) = receipt.cost {
                        result.cost = Some(result.cost.unwrap_or(0.0) + cost);
                    }
                    result.parts_sent = part;
                }
                Err(e) => {
                    if result.message_id.is_none() {
                        result.message_id = Some(record.id);
                        result.provider = provider;
                    }
                    warn!(
                        organization_id = %organization.id,
                        part,
                        total,
                        error = %e,
                        "SMS send failed"
                    );
                    let retryable = e.is_transport();
                    return failed_with(result, "PROVIDER_ERROR", e.to_string(), retryable);
                }
            }
        }

        result.success = true;
        debug!(
            organization_id = %organization.id,
            message_id = ?result.message_id,
            parts = total,
            segments = result.segments,
            "SMS dispatched"
        );
        result
    }

    /// Walk the candidates, moving on only after a transport failure.
    /// Returns the provider that produced the final outcome.
    async fn try_providers(
        &self,
        candidates: &[Arc<dyn SmsProvider>],
        message: &OutboundSms,
        options: &SendOptions,
    ) -> (
        Option<SmsProviderKind>,
        std::result::Result<ProviderReceipt, ProviderError>,
    ) {
        let mut last = None;

        for provider in candidates {
            let kind = provider.kind();
            let started = Instant::now();
            let outcome = match tokio::time::timeout(self.timeout, provider.send(message)).await {
                Ok(outcome) => outcome,
                Err(_) => Err(ProviderError::Transport {
                    provider: kind,
                    message: format!("timed out after {:?}", self.timeout),
                }),
            };
            self.metrics.record_dispatch(
                Some(kind),
                options.category,
                outcome.is_ok(),
                started.elapsed().as_secs_f64(),
            );

            match outcome {
                Ok(receipt) => return (Some(kind), Ok(receipt)),
                Err(e) if e.is_transport() => {
                    warn!(provider = %kind, error = %e, "Provider unavailable, trying next");
                    last = Some((kind, e));
                }
                Err(e) => return (Some(kind), Err(e)),
            }
        }

        match last {
            Some((kind, e)) => (Some(kind), Err(e)),
            None => (
                None,
                Err(ProviderError::NotConfigured {
                    provider: SmsProviderKind::Sandbox,
                }),
            ),
        }
    }

    async fn persist(
        &self,
        logged: Option<SmsRecord>,
        mut draft: SmsRecord,
        from: String,
        completion: SendCompletion,
    ) -> Result<SmsRecord> {
        if let Some(logged) = logged {
            return self.tracker.complete_attempt(logged.id, completion).await;
        }

        draft.from_phone = Some(from);
        draft.status = completion.status;
        draft.provider = completion.provider;
        draft.external_message_id = completion.external_message_id;
        draft.cost = completion.cost;
        draft.error_code = completion.error_code;
        draft.error_message = completion.error_message;
        if completion.status != MessageStatus::Failed {
            draft.sent_at = Some(completion.at);
        }
        draft.updated_at = completion.at;
        self.tracker.record_attempt(draft).await
    }

    fn draft_record(
        &self,
        organization: &Organization,
        to: &str,
        planned: &Part,
        part: u32,
        total: u32,
        options: &SendOptions,
    ) -> SmsRecord {
        let now = Utc::now();
        SmsRecord {
            id: Uuid::new_v4(),
            organization_id: organization.id,
            workflow_id: options.workflow_id,
            appointment_id: options.appointment_id,
            customer_id: options.customer_id,
            direction: MessageDirection::Outbound,
            message_type: options.message_type.clone(),
            category: options.category,
            language: options.language,
            language_fallback: options.language_fallback,
            to_phone: to.to_string(),
            from_phone: organization.sms_phone.clone(),
            body: planned.body.clone(),
            part,
            total_parts: total,
            segments: planned.segments,
            status: MessageStatus::Queued,
            provider: None,
            external_message_id: None,
            error_code: None,
            error_message: None,
            cost: None,
            created_at: now,
            sent_at: None,
            delivered_at: None,
            updated_at: now,
        }
    }
}

fn rejected(to: &str, error: &NotifyError) -> DispatchResult {
    debug!(recipient = to, code = error.error_code(), "Send rejected before dispatch");
    DispatchResult::failed(to, error.error_code(), error.to_string(), error.is_retryable())
}

fn failed_with(
    mut result: DispatchResult,
    code: &str,
    error: String,
    retryable: bool,
) -> DispatchResult {
    result.success = false;
    result.error = Some(error);
    result.error_code = Some(code.to_string());
    result.retryable = retryable;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::{MockSmsProvider, SandboxProvider};
    use crate::config::{MetricsConfig, TemplateConfig};
    use crate::store::MemoryStore;
    use chrono::NaiveTime;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use serviceai_shared::types::Customer;

    fn organization() -> Organization {
        Organization {
            id: Uuid::new_v4(),
            name: "Cool Air HVAC".to_string(),
            default_language: Language::En,
            utc_offset_minutes: 0,
            business_hours_start: NaiveTime::from_hms_opt(8, 0, 0).unwrap(),
            business_hours_end: NaiveTime::from_hms_opt(17, 0, 0).unwrap(),
            business_days: vec![1, 2, 3, 4, 5],
            emergency_contact_name: Some("Dispatch".to_string()),
            emergency_contact_phone: Some("+15550009999".to_string()),
            transfer_phone: None,
            sms_phone: Some("+15550001000".to_string()),
            voice_phone: None,
            preferred_sms_provider: None,
            is_active: true,
            created_at: Utc::now(),
        }
    }

    fn dispatcher_with(
        providers: Vec<Arc<dyn SmsProvider>>,
        config: SmsConfig,
    ) -> (Arc<MemoryStore>, NotificationDispatcher) {
        let store = Arc::new(MemoryStore::new());
        let metrics = NotifyMetrics::new(&MetricsConfig::default()).unwrap();
        let templates =
            Arc::new(TemplateStore::new(store.clone(), &TemplateConfig::default()).unwrap());
        let tracker = DeliveryTracker::new(store.clone(), metrics.clone());
        let registry = ProviderRegistry::new(vec![], providers);
        let dispatcher =
            NotificationDispatcher::new(store.clone(), templates, tracker, registry, metrics, &config);
        (store, dispatcher)
    }

    fn sandbox_dispatcher() -> (Arc<MemoryStore>, SandboxProvider, NotificationDispatcher) {
        let sandbox = SandboxProvider::new("+15005550006");
        let (store, dispatcher) =
            dispatcher_with(vec![Arc::new(sandbox.clone())], SmsConfig::default());
        (store, sandbox, dispatcher)
    }

    fn receipt(id: &str) -> ProviderReceipt {
        ProviderReceipt {
            external_id: id.to_string(),
            status: MessageStatus::Queued,
            cost: Some(0.0075),
        }
    }

    fn appointment_vars() -> HashMap<String, Value> {
        [
            ("customer_name", "Ana"),
            ("business_name", "Cool Air HVAC"),
            ("appointment_date", "03/15/2024"),
            ("appointment_time", "10:00 AM"),
            ("service_type", "AC repair"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), json!(v)))
        .collect()
    }

    #[tokio::test]
    async fn test_partial_batch_returns_one_result_per_recipient() {
        let (store, sandbox, dispatcher) = sandbox_dispatcher();
        let org = organization();
        let recipients = vec![
            Recipient::phone("(555) 123-4567"),
            Recipient::phone("12345"),
            Recipient::phone("+15557654321"),
            Recipient::phone("not a phone"),
        ];

        let results = dispatcher
            .send_templated(
                &org,
                "appointment_reminder",
                &recipients,
                &appointment_vars(),
                Language::En,
                &SendOptions::new(TemplateCategory::Reminder, "appointment_reminder", Language::En),
            )
            .await
            .unwrap();

        assert_eq!(results.len(), 4);
        let invalid: Vec<_> = results
            .iter()
            .filter(|r| r.error_code.as_deref() == Some("INVALID_PHONE_NUMBER"))
            .collect();
        assert_eq!(invalid.len(), 2);
        assert!(results[0].success && results[2].success);
        assert_eq!(results[0].recipient, "+15551234567");
        assert_eq!(sandbox.outbox().len(), 2);
        assert_eq!(store.messages().len(), 2);
    }

    #[tokio::test]
    async fn test_missing_variable_sends_nothing() {
        let (store, sandbox, dispatcher) = sandbox_dispatcher();
        let mut vars = appointment_vars();
        vars.remove("customer_name");

        let err = dispatcher
            .send_templated(
                &organization(),
                "appointment_confirmation",
                &[Recipient::phone("+15551234567")],
                &vars,
                Language::Es,
                &SendOptions::new(TemplateCategory::Confirmation, "appointment_confirmation", Language::Es),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, NotifyError::MissingVariable { .. }));
        assert!(sandbox.outbox().is_empty());
        assert!(store.messages().is_empty());
    }

    #[tokio::test]
    async fn test_falls_back_only_on_transport_failure() {
        let mut primary = MockSmsProvider::new();
        primary.expect_kind().return_const(SmsProviderKind::Twilio);
        primary.expect_default_from().return_const("+15550000000".to_string());
        primary.expect_send().times(1).returning(|_| {
            Err(ProviderError::Transport {
                provider: SmsProviderKind::Twilio,
                message: "503".to_string(),
            })
        });

        let mut secondary = MockSmsProvider::new();
        secondary.expect_kind().return_const(SmsProviderKind::Telnyx);
        secondary.expect_default_from().return_const("+15550000001".to_string());
        secondary.expect_send().times(1).returning(|_| Ok(receipt("TX1")));

        let (store, dispatcher) = dispatcher_with(
            vec![Arc::new(primary), Arc::new(secondary)],
            SmsConfig::default(),
        );
        let result = dispatcher
            .send_direct(&organization(), "+15551234567", "Hello", &SendOptions::direct(Language::En))
            .await;

        assert!(result.success);
        assert_eq!(result.provider, Some(SmsProviderKind::Telnyx));
        assert_eq!(result.external_message_id.as_deref(), Some("TX1"));
        assert_eq!(store.messages()[0].provider, Some(SmsProviderKind::Telnyx));
    }

    #[tokio::test]
    async fn test_content_rejection_is_not_retried_elsewhere() {
        let mut primary = MockSmsProvider::new();
        primary.expect_kind().return_const(SmsProviderKind::Twilio);
        primary.expect_default_from().return_const("+15550000000".to_string());
        primary.expect_send().times(1).returning(|_| {
            Err(ProviderError::Rejected {
                provider: SmsProviderKind::Twilio,
                code: "21610".to_string(),
                message: "Attempt to send to unsubscribed recipient".to_string(),
            })
        });

        let mut secondary = MockSmsProvider::new();
        secondary.expect_kind().return_const(SmsProviderKind::Telnyx);
        secondary.expect_send().never();

        let (store, dispatcher) = dispatcher_with(
            vec![Arc::new(primary), Arc::new(secondary)],
            SmsConfig::default(),
        );
        let result = dispatcher
            .send_direct(&organization(), "+15551234567", "Hello", &SendOptions::direct(Language::En))
            .await;

        assert!(!result.success);
        assert!(!result.retryable);
        let records = store.messages();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, MessageStatus::Failed);
        assert_eq!(records[0].error_code.as_deref(), Some("21610"));
    }

    #[tokio::test]
    async fn test_opted_out_customer_is_refused() {
        let (store, sandbox, dispatcher) = sandbox_dispatcher();
        let org = organization();
        let now = Utc::now();
        store
            .upsert_customer(Customer {
                id: Uuid::new_v4(),
                organization_id: org.id,
                name: Some("Ana".to_string()),
                phone: "+15551234567".to_string(),
                email: None,
                language_preference: Language::En,
                sms_opt_in: false,
                created_at: now,
                updated_at: now,
            })
            .await
            .unwrap();

        let result = dispatcher
            .send_direct(&org, "+15551234567", "Promo", &SendOptions::direct(Language::En))
            .await;
        assert_eq!(result.error_code.as_deref(), Some("OPTED_OUT"));
        assert!(sandbox.outbox().is_empty());
    }

    #[tokio::test]
    async fn test_long_survey_is_rejected_but_reminder_is_concatenated() {
        let (store, sandbox, dispatcher) = sandbox_dispatcher();
        let org = organization();
        // 779 GSM-7 characters: six concatenated segments
        let long = "Please tell us about your visit today. ".repeat(20);

        let survey = dispatcher
            .send_direct(
                &org,
                "+15551234567",
                &long,
                &SendOptions::new(TemplateCategory::Survey, "survey", Language::En),
            )
            .await;
        assert_eq!(survey.error_code.as_deref(), Some("MESSAGE_TOO_LONG"));

        let reminder = dispatcher
            .send_direct(
                &org,
                "+15551234567",
                &long,
                &SendOptions::new(TemplateCategory::Reminder, "appointment_reminder", Language::En),
            )
            .await;
        assert!(reminder.success);
        assert_eq!(reminder.segments, 6);
        assert_eq!(reminder.parts_sent, 1);

        let outbox = sandbox.outbox();
        assert_eq!(outbox.len(), 1);
        assert!(!outbox[0].1.body.starts_with("(1/"));
        let records = store.messages();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].segments, 6);
        assert_eq!(records[0].total_parts, 1);
    }

    #[tokio::test]
    async fn test_spanish_confirmation_is_one_sms() {
        let (store, sandbox, dispatcher) = sandbox_dispatcher();

        let results = dispatcher
            .send_templated(
                &organization(),
                "appointment_confirmation",
                &[Recipient::phone("+15551234567")],
                &appointment_vars(),
                Language::Es,
                &SendOptions::new(
                    TemplateCategory::Confirmation,
                    "appointment_confirmation",
                    Language::Es,
                ),
            )
            .await
            .unwrap();

        assert!(results[0].success);
        assert!(results[0].segments > 1);
        assert_eq!(sandbox.outbox().len(), 1);
        let records = store.messages();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].language, Language::Es);
        assert_eq!(records[0].segments, results[0].segments);
        assert!(records[0].body.starts_with("Hola Ana"));
    }

    #[tokio::test]
    async fn test_emergency_resumes_after_sent_parts() {
        let sandbox = SandboxProvider::new("+15005550006");
        sandbox.pass_next();
        sandbox.fail_next(crate::channels::SandboxFailure::Transport);
        let (store, dispatcher) =
            dispatcher_with(vec![Arc::new(sandbox.clone())], SmsConfig::default());
        let org = organization();
        let text = "Gas leak reported, evacuate and call the caller back now. ".repeat(5);
        let mut options =
            SendOptions::new(TemplateCategory::Emergency, "emergency_alert", Language::En);

        let first = dispatcher
            .send_emergency_broadcast(&org, &text, &options)
            .await;
        assert!(!first.success);
        assert!(first.retryable);
        assert_eq!(first.parts_sent, 1);
        assert_eq!(sandbox.outbox().len(), 1);

        options.skip_parts = first.parts_sent;
        let second = dispatcher
            .send_emergency_broadcast(&org, &text, &options)
            .await;
        assert!(second.success);
        assert_eq!(second.parts_sent, second.segments);

        let bodies: Vec<String> = sandbox.outbox().into_iter().map(|(_, m)| m.body).collect();
        assert_eq!(bodies.len() as u32, second.segments);
        assert_eq!(bodies.iter().filter(|b| b.starts_with("(1/")).count(), 1);
        let sent = store
            .messages()
            .into_iter()
            .filter(|m| m.status == MessageStatus::Sent)
            .count();
        assert_eq!(sent as u32, second.segments);
    }

    #[tokio::test]
    async fn test_emergency_is_logged_before_a_failed_send() {
        let sandbox = SandboxProvider::new("+15005550006");
        sandbox.fail_next(crate::channels::SandboxFailure::Transport);
        let (store, dispatcher) =
            dispatcher_with(vec![Arc::new(sandbox.clone())], SmsConfig::default());

        let result = dispatcher
            .send_emergency_broadcast(
                &organization(),
                "CRITICAL gas leak at 12 Elm St",
                &SendOptions::new(TemplateCategory::Emergency, "emergency_alert", Language::En),
            )
            .await;

        assert!(!result.success);
        assert!(result.retryable);
        let records = store.messages();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, MessageStatus::Failed);
        assert_eq!(records[0].to_phone, "+15550009999");
        assert_eq!(result.message_id, Some(records[0].id));
    }

    #[tokio::test]
    async fn test_long_emergency_is_split_past_segment_cap() {
        let config = SmsConfig {
            max_segments: 2,
            ..SmsConfig::default()
        };
        let sandbox = SandboxProvider::new("+15005550006");
        let (store, dispatcher) = dispatcher_with(vec![Arc::new(sandbox.clone())], config);

        let text = "Gas leak reported, evacuate and call the caller back now. ".repeat(8);
        let result = dispatcher
            .send_emergency_broadcast(
                &organization(),
                &text,
                &SendOptions::new(TemplateCategory::Emergency, "emergency_alert", Language::En),
            )
            .await;

        assert!(result.success);
        assert!(result.segments > 2);
        assert_eq!(sandbox.outbox().len() as u32, result.segments);
        assert!(store
            .messages()
            .iter()
            .all(|m| m.status == MessageStatus::Sent && m.total_parts == result.segments));
    }

    #[tokio::test]
    async fn test_rate_limit_applies_per_organization() {
        let config = SmsConfig {
            rate_limit_per_minute: 1,
            ..SmsConfig::default()
        };
        let sandbox = SandboxProvider::new("+15005550006");
        let (_, dispatcher) = dispatcher_with(vec![Arc::new(sandbox)], config);
        let org = organization();
        let other = organization();
        let options = SendOptions::direct(Language::En);

        assert!(dispatcher.send_direct(&org, "+15551234567", "one", &options).await.success);
        let limited = dispatcher.send_direct(&org, "+15551234567", "two", &options).await;
        assert_eq!(limited.error_code.as_deref(), Some("RATE_LIMIT_EXCEEDED"));
        assert!(limited.retryable);
        assert!(dispatcher.send_direct(&other, "+15551234567", "one", &options).await.success);
    }
}

//! Delivery tracker
//!
//! Records every SMS attempt, applies provider status callbacks and derives
//! analytics from the persisted records at query time. Only outbound records
//! count towards statistics; a message split into parts counts once per part,
//! matching what the provider bills.

use chrono::{DateTime, Utc};
use serviceai_shared::types::{
    DeliveryStatistics, Language, LanguagePerformance, MessageDirection, MessageStatus, SmsRecord,
    TemplatePerformance, TimeRange, TrendBucket,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::metrics::{NotifyMetrics, UpdateOutcome};
use crate::store::{Persistence, SendCompletion, StatusAdvance, StatusUpdate, StoreError};

#[derive(Clone)]
pub struct DeliveryTracker {
    store: Arc<dyn Persistence>,
    metrics: NotifyMetrics,
}

#[derive(Debug, Default, Clone, Copy)]
struct Tally {
    total: u64,
    delivered: u64,
    failed: u64,
    pending: u64,
    fallback: u64,
    cost: f64,
}

impl Tally {
    fn add(&mut self, record: &SmsRecord) {
        self.total += 1;
        match record.status {
            MessageStatus::Delivered => self.delivered += 1,
            MessageStatus::Failed | MessageStatus::Undelivered => self.failed += 1,
            MessageStatus::Queued | MessageStatus::Sent => self.pending += 1,
            MessageStatus::Received => {}
        }
        if record.language_fallback {
            self.fallback += 1;
        }
        self.cost += record.cost.unwrap_or(0.0);
    }
}

/// Percentage rounded to two decimals; zero when there is nothing to divide
fn rate(part: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (part as f64 / total as f64 * 10_000.0).round() / 100.0
}

impl DeliveryTracker {
    pub fn new(store: Arc<dyn Persistence>, metrics: NotifyMetrics) -> Self {
        Self { store, metrics }
    }

    /// Persist an attempt. Re-recording an external id the organization
    /// already has returns the stored record instead of failing.
    pub async fn record_attempt(&self, record: SmsRecord) -> Result<SmsRecord> {
        match self.store.insert_message(record.clone()).await {
            Ok(saved) => {
                debug!(
                    message_id = %saved.id,
                    organization_id = %saved.organization_id,
                    status = %saved.status,
                    "Recorded SMS attempt"
                );
                Ok(saved)
            }
            Err(StoreError::Conflict { .. }) => {
                let existing = match record.external_message_id.as_deref() {
                    Some(external_id) => self
                        .store
                        .find_message_by_external_id(external_id)
                        .await?
                        .filter(|m| m.organization_id == record.organization_id),
                    None => None,
                };
                info!(
                    external_message_id = ?record.external_message_id,
                    "SMS attempt already recorded"
                );
                existing.ok_or_else(|| StoreError::conflict("message already recorded").into())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Finish a record that was logged before its send
    pub async fn complete_attempt(&self, id: Uuid, completion: SendCompletion) -> Result<SmsRecord> {
        Ok(self.store.complete_message_send(id, &completion).await?)
    }

    /// Apply a provider status callback. Replays and regressions are
    /// no-ops, and unknown ids are logged and dropped.
    pub async fn record_status_update(
        &self,
        external_message_id: &str,
        update: StatusUpdate,
    ) -> Result<UpdateOutcome> {
        let outcome = match self
            .store
            .advance_message_status(external_message_id, &update)
            .await?
        {
            StatusAdvance::Applied(record) => {
                info!(
                    message_id = %record.id,
                    external_message_id,
                    status = %record.status,
                    "Delivery status updated"
                );
                UpdateOutcome::Applied
            }
            StatusAdvance::Ignored(record) => {
                debug!(
                    external_message_id,
                    current = %record.status,
                    incoming = %update.status,
                    "Delivery status update ignored"
                );
                UpdateOutcome::Duplicate
            }
            StatusAdvance::Unknown => {
                warn!(
                    external_message_id,
                    status = %update.status,
                    "Status callback for unknown message discarded"
                );
                UpdateOutcome::Unknown
            }
        };

        self.metrics
            .record_status_update(Some(update.status), outcome);
        Ok(outcome)
    }

    async fn outbound(
        &self,
        organization_id: Uuid,
        range: TimeRange,
        now: DateTime<Utc>,
    ) -> Result<Vec<SmsRecord>> {
        let since = range.window_start(now);
        let records = self.store.list_messages(organization_id, since).await?;
        Ok(records
            .into_iter()
            .filter(|r| {
                r.organization_id == organization_id
                    && r.direction == MessageDirection::Outbound
                    && r.created_at <= now
            })
            .collect())
    }

    pub async fn get_delivery_statistics(
        &self,
        organization_id: Uuid,
        range: TimeRange,
    ) -> Result<DeliveryStatistics> {
        self.get_delivery_statistics_at(organization_id, range, Utc::now())
            .await
    }

    pub async fn get_delivery_statistics_at(
        &self,
        organization_id: Uuid,
        range: TimeRange,
        now: DateTime<Utc>,
    ) -> Result<DeliveryStatistics> {
        let mut tally = Tally::default();
        for record in self.outbound(organization_id, range, now).await? {
            tally.add(&record);
        }

        Ok(DeliveryStatistics {
            total_sent: tally.total,
            delivered: tally.delivered,
            failed: tally.failed,
            pending: tally.pending,
            delivery_rate: rate(tally.delivered, tally.total),
            failure_rate: rate(tally.failed, tally.total),
            total_cost: (tally.cost * 10_000.0).round() / 10_000.0,
        })
    }

    pub async fn get_delivery_trends(
        &self,
        organization_id: Uuid,
        range: TimeRange,
    ) -> Result<Vec<TrendBucket>> {
        self.get_delivery_trends_at(organization_id, range, Utc::now())
            .await
    }

    /// One bucket per window slot, oldest first, zero-filled
    pub async fn get_delivery_trends_at(
        &self,
        organization_id: Uuid,
        range: TimeRange,
        now: DateTime<Utc>,
    ) -> Result<Vec<TrendBucket>> {
        let start = range.window_start(now);
        let width = range.bucket_width();

        let mut buckets: Vec<TrendBucket> = (0..range.bucket_count())
            .map(|i| TrendBucket {
                bucket_start: start + width * i as i32,
                sent: 0,
                delivered: 0,
                failed: 0,
            })
            .collect();

        for record in self.outbound(organization_id, range, now).await? {
            let offset = (record.created_at - start).num_seconds() / width.num_seconds();
            let Some(bucket) = usize::try_from(offset).ok().and_then(|i| buckets.get_mut(i))
            else {
                continue;
            };
            bucket.sent += 1;
            match record.status {
                MessageStatus::Delivered => bucket.delivered += 1,
                MessageStatus::Failed | MessageStatus::Undelivered => bucket.failed += 1,
                _ => {}
            }
        }

        Ok(buckets)
    }

    pub async fn get_template_performance(
        &self,
        organization_id: Uuid,
        template_key: Option<&str>,
        range: TimeRange,
    ) -> Result<Vec<TemplatePerformance>> {
        self.get_template_performance_at(organization_id, template_key, range, Utc::now())
            .await
    }

    /// Per template key, sorted by key. A requested key with no traffic
    /// still gets a zeroed entry.
    pub async fn get_template_performance_at(
        &self,
        organization_id: Uuid,
        template_key: Option<&str>,
        range: TimeRange,
        now: DateTime<Utc>,
    ) -> Result<Vec<TemplatePerformance>> {
        let mut by_key: BTreeMap<String, Tally> = BTreeMap::new();
        if let Some(key) = template_key {
            by_key.insert(key.to_string(), Tally::default());
        }

        for record in self.outbound(organization_id, range, now).await? {
            if template_key.map_or(false, |k| k != record.message_type) {
                continue;
            }
            by_key
                .entry(record.message_type.clone())
                .or_default()
                .add(&record);
        }

        Ok(by_key
            .into_iter()
            .map(|(key, tally)| TemplatePerformance {
                template_key: key,
                total_sent: tally.total,
                delivered: tally.delivered,
                failed: tally.failed,
                delivery_rate: rate(tally.delivered, tally.total),
                fallback_count: tally.fallback,
            })
            .collect())
    }

    pub async fn get_language_performance(
        &self,
        organization_id: Uuid,
        range: TimeRange,
    ) -> Result<Vec<LanguagePerformance>> {
        self.get_language_performance_at(organization_id, range, Utc::now())
            .await
    }

    /// Every supported language is present, in declaration order
    pub async fn get_language_performance_at(
        &self,
        organization_id: Uuid,
        range: TimeRange,
        now: DateTime<Utc>,
    ) -> Result<Vec<LanguagePerformance>> {
        let mut tallies: Vec<(Language, Tally)> =
            Language::ALL.iter().map(|l| (*l, Tally::default())).collect();

        for record in self.outbound(organization_id, range, now).await? {
            if let Some((_, tally)) = tallies.iter_mut().find(|(l, _)| *l == record.language) {
                tally.add(&record);
            }
        }

        Ok(tallies
            .into_iter()
            .map(|(language, tally)| LanguagePerformance {
                language,
                total_sent: tally.total,
                delivered: tally.delivered,
                failed: tally.failed,
                delivery_rate: rate(tally.delivered, tally.total),
                fallback_count: tally.fallback,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MetricsConfig;
    use crate::store::MemoryStore;
    use chrono::{Duration, TimeZone};
    use pretty_assertions::assert_eq;
    use serviceai_shared::types::TemplateCategory;

    fn tracker() -> (Arc<MemoryStore>, DeliveryTracker) {
        let store = Arc::new(MemoryStore::new());
        let metrics = NotifyMetrics::new(&MetricsConfig::default()).unwrap();
        (store.clone(), DeliveryTracker::new(store, metrics))
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 4, 15, 42, 0).unwrap()
    }

    fn record(
        org: Uuid,
        external_id: &str,
        status: MessageStatus,
        language: Language,
        created_at: DateTime<Utc>,
    ) -> SmsRecord {
        SmsRecord {
            id: Uuid::new_v4(),
            organization_id: org,
            workflow_id: None,
            appointment_id: None,
            customer_id: None,
            direction: MessageDirection::Outbound,
            message_type: "appointment_reminder".to_string(),
            category: TemplateCategory::Reminder,
            language,
            language_fallback: false,
            to_phone: "+15551234567".to_string(),
            from_phone: Some("+15005550006".to_string()),
            body: "Reminder".to_string(),
            part: 1,
            total_parts: 1,
            segments: 1,
            status,
            provider: None,
            external_message_id: Some(external_id.to_string()),
            error_code: None,
            error_message: None,
            cost: Some(0.0075),
            created_at,
            sent_at: Some(created_at),
            delivered_at: None,
            updated_at: created_at,
        }
    }

    fn update(status: MessageStatus) -> StatusUpdate {
        StatusUpdate {
            status,
            error_code: None,
            error_message: None,
            at: now(),
        }
    }

    #[tokio::test]
    async fn test_status_update_is_idempotent() {
        let (store, tracker) = tracker();
        let org = Uuid::new_v4();
        tracker
            .record_attempt(record(org, "SM1", MessageStatus::Sent, Language::En, now()))
            .await
            .unwrap();

        let first = tracker
            .record_status_update("SM1", update(MessageStatus::Delivered))
            .await
            .unwrap();
        let after_first = store.messages();

        for _ in 0..3 {
            let again = tracker
                .record_status_update("SM1", update(MessageStatus::Delivered))
                .await
                .unwrap();
            assert_eq!(again, UpdateOutcome::Duplicate);
        }

        assert_eq!(first, UpdateOutcome::Applied);
        assert_eq!(store.messages(), after_first);
    }

    #[tokio::test]
    async fn test_late_sent_does_not_regress_delivered() {
        let (store, tracker) = tracker();
        let org = Uuid::new_v4();
        tracker
            .record_attempt(record(org, "SM2", MessageStatus::Queued, Language::En, now()))
            .await
            .unwrap();

        tracker
            .record_status_update("SM2", update(MessageStatus::Delivered))
            .await
            .unwrap();
        let outcome = tracker
            .record_status_update("SM2", update(MessageStatus::Sent))
            .await
            .unwrap();

        assert_eq!(outcome, UpdateOutcome::Duplicate);
        assert_eq!(store.messages()[0].status, MessageStatus::Delivered);
    }

    #[tokio::test]
    async fn test_unknown_message_is_discarded() {
        let (store, tracker) = tracker();
        let outcome = tracker
            .record_status_update("SM-missing", update(MessageStatus::Delivered))
            .await
            .unwrap();
        assert_eq!(outcome, UpdateOutcome::Unknown);
        assert!(store.messages().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_attempt_returns_existing() {
        let (store, tracker) = tracker();
        let org = Uuid::new_v4();
        let first = tracker
            .record_attempt(record(org, "SM3", MessageStatus::Sent, Language::En, now()))
            .await
            .unwrap();
        let second = tracker
            .record_attempt(record(org, "SM3", MessageStatus::Sent, Language::En, now()))
            .await
            .unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(store.messages().len(), 1);
    }

    #[tokio::test]
    async fn test_statistics_for_empty_organization_are_zeroed() {
        let (_, tracker) = tracker();
        let org = Uuid::new_v4();

        let stats = tracker
            .get_delivery_statistics_at(org, TimeRange::LastDay, now())
            .await
            .unwrap();
        assert_eq!(stats, DeliveryStatistics::default());

        let trends = tracker
            .get_delivery_trends_at(org, TimeRange::LastDay, now())
            .await
            .unwrap();
        assert_eq!(trends.len(), 24);
        assert!(trends.iter().all(|b| b.sent == 0 && b.delivered == 0 && b.failed == 0));
        assert!(trends.windows(2).all(|w| w[1].bucket_start - w[0].bucket_start == Duration::hours(1)));

        let languages = tracker
            .get_language_performance_at(org, TimeRange::LastWeek, now())
            .await
            .unwrap();
        assert_eq!(languages.len(), 2);
        assert!(languages.iter().all(|l| l.total_sent == 0 && l.delivery_rate == 0.0));
    }

    #[tokio::test]
    async fn test_statistics_rates_and_tenant_isolation() {
        let (_, tracker) = tracker();
        let org = Uuid::new_v4();
        let other = Uuid::new_v4();

        let statuses = [
            MessageStatus::Delivered,
            MessageStatus::Delivered,
            MessageStatus::Delivered,
            MessageStatus::Undelivered,
            MessageStatus::Sent,
        ];
        for (i, status) in statuses.iter().enumerate() {
            tracker
                .record_attempt(record(org, &format!("A{}", i), *status, Language::En, now() - Duration::minutes(10)))
                .await
                .unwrap();
        }
        tracker
            .record_attempt(record(other, "B1", MessageStatus::Failed, Language::En, now()))
            .await
            .unwrap();

        let stats = tracker
            .get_delivery_statistics_at(org, TimeRange::LastHour, now())
            .await
            .unwrap();
        assert_eq!(stats.total_sent, 5);
        assert_eq!(stats.delivered, 3);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.delivery_rate, 60.0);
        assert_eq!(stats.failure_rate, 20.0);
    }

    #[tokio::test]
    async fn test_trends_bucket_by_creation_time() {
        let (_, tracker) = tracker();
        let org = Uuid::new_v4();
        let old = now() - Duration::hours(30);
        let recent = Utc.with_ymd_and_hms(2024, 3, 4, 14, 5, 0).unwrap();

        tracker
            .record_attempt(record(org, "T1", MessageStatus::Delivered, Language::En, recent))
            .await
            .unwrap();
        tracker
            .record_attempt(record(org, "T2", MessageStatus::Failed, Language::En, recent))
            .await
            .unwrap();
        tracker
            .record_attempt(record(org, "T3", MessageStatus::Delivered, Language::En, old))
            .await
            .unwrap();

        let trends = tracker
            .get_delivery_trends_at(org, TimeRange::LastDay, now())
            .await
            .unwrap();
        let bucket = trends
            .iter()
            .find(|b| b.bucket_start == Utc.with_ymd_and_hms(2024, 3, 4, 14, 0, 0).unwrap())
            .unwrap();
        assert_eq!((bucket.sent, bucket.delivered, bucket.failed), (2, 1, 1));
        assert_eq!(trends.iter().map(|b| b.sent).sum::<u64>(), 2);
    }

    #[tokio::test]
    async fn test_language_and_template_performance() {
        let (_, tracker) = tracker();
        let org = Uuid::new_v4();

        let mut fallback = record(org, "L1", MessageStatus::Delivered, Language::En, now());
        fallback.language_fallback = true;
        tracker.record_attempt(fallback).await.unwrap();
        tracker
            .record_attempt(record(org, "L2", MessageStatus::Delivered, Language::Es, now()))
            .await
            .unwrap();
        tracker
            .record_attempt(record(org, "L3", MessageStatus::Failed, Language::Es, now()))
            .await
            .unwrap();

        let languages = tracker
            .get_language_performance_at(org, TimeRange::LastDay, now())
            .await
            .unwrap();
        assert_eq!(languages[0].language, Language::En);
        assert_eq!(languages[0].fallback_count, 1);
        assert_eq!(languages[1].total_sent, 2);
        assert_eq!(languages[1].delivery_rate, 50.0);

        let templates = tracker
            .get_template_performance_at(org, Some("survey"), TimeRange::LastDay, now())
            .await
            .unwrap();
        assert_eq!(templates.len(), 1);
        assert_eq!(templates[0].total_sent, 0);

        let all = tracker
            .get_template_performance_at(org, None, TimeRange::LastDay, now())
            .await
            .unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].template_key, "appointment_reminder");
        assert_eq!(all[0].total_sent, 3);
    }
}

//! One synchronization pass, end to end.
//!
//! FETCHING → DETECTING → RESOLVING → PERSISTING → SCHEDULING → DISPATCHING
//! → DONE, with FAILED reachable from every stage. Nothing touches the event
//! store before PERSISTING, so a pass that fails earlier leaves it as it was.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use log::{debug, error, info, warn};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::calendar::{CachedFetch, EventSource, FetchCache, GoogleCalendarTarget, IcsSource, TargetCalendar};
use crate::config::Config;
use crate::conflict::{ConflictResolver, Resolution};
use crate::database::{Database, StoreBatch};
use crate::detector::detect_changes;
use crate::dispatch::{DispatchReport, Dispatcher, HookChain, LoggingHook};
use crate::error::{ConfigError, FetchError, PassFailure, SyncError, SyncResult, TargetError};
use crate::http_config::HttpConfig;
use crate::models::{
    Coverage, DateRange, DeliveryState, Event, EventChanges, LedgerUpdate, NotificationPayload,
    PassReport, PassState, ResolutionSummary, ScheduledNotification, SyncAction, SyncLogEntry, SyncRecord,
    SyncStatus, TargetEvent,
};
use crate::scheduler::{ChannelRoutes, ConflictNotice, ExistingNotifications, NotificationScheduler};
use crate::utils::circuit_breaker::{BreakerError, CircuitBreaker, CircuitBreakerConfig};
use crate::utils::logging::{log_error_with_context, log_pass_summary};
use crate::utils::retry::{retry_with_exponential_backoff, RetryConfig};

/// Budget for the best-effort notice sent when a pass fails.
const FAILURE_NOTICE_BUDGET: Duration = Duration::from_secs(30);

struct TargetBinding {
    calendar: Arc<dyn TargetCalendar>,
    timeout: Duration,
    breaker: CircuitBreakerConfig,
}

/// Work decided during RESOLVING and carried out during PERSISTING.
#[derive(Default)]
struct Plan {
    batch: StoreBatch,
    pushes: Vec<PendingPush>,
    removals: Vec<SyncRecord>,
    conflicts: Vec<ConflictNotice>,
    summary: ResolutionSummary,
}

struct PendingPush {
    record: SyncRecord,
    content: Event,
    target_id: Option<String>,
}

pub struct SyncOrchestrator {
    store: Database,
    source: Arc<dyn EventSource>,
    target: Option<TargetBinding>,
    resolver: ConflictResolver,
    scheduler: NotificationScheduler,
    dispatcher: Dispatcher,
    cache: Option<FetchCache>,
    tz: Tz,
    lookback_days: u32,
    lookahead_days: u32,
    fetch_retry: RetryConfig,
    fetch_timeout: Duration,
    pass_timeout: Duration,
}

impl SyncOrchestrator {
    pub fn new(
        config: &Config,
        store: Database,
        source: Arc<dyn EventSource>,
        target: Option<Arc<dyn TargetCalendar>>,
        dispatcher: Dispatcher,
    ) -> Result<Self, ConfigError> {
        let tz = config.tz()?;
        let scheduler = NotificationScheduler::new(&config.schedule, tz, ChannelRoutes::from_configs(&config.channels))?;

        let (target_timeout, failure_threshold) = config
            .target
            .as_ref()
            .map(|t| (t.timeout_secs, t.breaker_failure_threshold))
            .unwrap_or((30, 3));
        let target = target.map(|calendar| TargetBinding {
            calendar,
            timeout: Duration::from_secs(target_timeout),
            breaker: CircuitBreakerConfig {
                failure_threshold: failure_threshold.max(1),
                ..CircuitBreakerConfig::default()
            },
        });

        let cache = config.source.cache_fallback.then(|| {
            FetchCache::new(
                config.cache_path(),
                Duration::from_secs(config.source.cache_max_age_hours * 3600),
            )
        });

        Ok(Self {
            store,
            source,
            target,
            resolver: ConflictResolver::new(config.conflict.strategy, config.conflict.merge.clone()),
            scheduler,
            dispatcher,
            cache,
            tz,
            lookback_days: config.source.lookback_days,
            lookahead_days: config.source.lookahead_days,
            fetch_retry: config.source.retry.to_retry_config(),
            fetch_timeout: Duration::from_secs(config.source.timeout_secs),
            pass_timeout: Duration::from_secs(config.dispatch.pass_timeout_secs),
        })
    }

    /// Wires the ICS source, the optional Google target and every enabled
    /// channel from configuration.
    pub fn from_config(config: &Config, store: Database) -> anyhow::Result<Self> {
        let tz = config.tz()?;
        let url = config
            .source
            .ics_url
            .as_deref()
            .ok_or_else(|| anyhow!("source.ics_url is not configured"))?;
        let source: Arc<dyn EventSource> = Arc::new(IcsSource::new(url, tz)?);

        let target = match &config.target {
            Some(target) => {
                let calendar =
                    GoogleCalendarTarget::new(&target.calendar_id, &target.access_token, target.api_base.clone())?;
                Some(Arc::new(calendar) as Arc<dyn TargetCalendar>)
            }
            None => None,
        };

        let client = HttpConfig::channel_webhook()
            .build_client()
            .context("building channel HTTP client")?;
        let hooks = HookChain::new().with(Arc::new(LoggingHook));
        let dispatcher = Dispatcher::from_configs(&config.channels, tz, client, hooks);
        if dispatcher.channel_ids().is_empty() {
            warn!("No notification channels enabled; notifications will queue up undelivered");
        }

        Ok(Self::new(config, store, source, target, dispatcher)?)
    }

    pub async fn run_pass(&self) -> PassReport {
        self.run_pass_at(Utc::now()).await
    }

    /// Runs one pass as if the wall clock read `now`. Always returns a
    /// report; failures are recorded in it rather than returned.
    pub async fn run_pass_at(&self, now: DateTime<Utc>) -> PassReport {
        let mut report = PassReport::new(Uuid::new_v4().to_string(), now);
        let deadline = Instant::now() + self.pass_timeout;
        info!("[Pass {}] Starting from source '{}'", report.pass_id, self.source.name());

        let prepared = tokio::time::timeout_at(deadline, self.sync_events(&mut report, now)).await;
        let outcome = match prepared {
            Ok(Ok(())) => {
                enter(&mut report, PassState::Dispatching);
                self.dispatch_due(&mut report, now, deadline).await
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(SyncError::Timeout(self.pass_timeout)),
        };

        match outcome {
            Ok(()) => enter(&mut report, PassState::Done),
            Err(e) => {
                fail(&mut report, e);
                self.notify_failure(&mut report, now).await;
            }
        }

        report.finished_at = Some(Utc::now());
        log_pass_summary(&report);
        report
    }

    async fn sync_events(&self, report: &mut PassReport, now: DateTime<Utc>) -> SyncResult<()> {
        let range = self.fetch_range(now);
        let (fetched, coverage) = self.fetch(report, range, now).await?;

        enter(report, PassState::Detecting);
        let stored = self.store.load_records().await.context("loading sync records")?;
        let known: HashMap<String, SyncRecord> = stored.iter().map(|r| (r.event_id.clone(), r.clone())).collect();
        let changes = detect_changes(stored, fetched, coverage, &range, &self.tz);
        report.changes = changes.summary();
        info!(
            "[Pass {}] {} added, {} updated, {} deleted, {} unchanged",
            report.pass_id,
            changes.added.len(),
            changes.updated.len(),
            changes.deleted.len(),
            changes.unchanged.len()
        );
        if !changes.coverage.is_complete() {
            info!("[Pass {}] Kept {} events the source did not vouch for", report.pass_id, changes.retained.len());
        }
        if !changes.out_of_range.is_empty() {
            debug!(
                "[Pass {}] {} stored events lie outside {} .. {}",
                report.pass_id,
                changes.out_of_range.len(),
                range.start,
                range.end
            );
        }

        enter(report, PassState::Resolving);
        let plan = self.resolve(&report.pass_id, &changes, &known, range, now).await;

        enter(report, PassState::Persisting);
        let conflicts = self.persist(plan, report, now).await?;

        enter(report, PassState::Scheduling);
        self.schedule(report, &changes, &conflicts, now).await
    }

    fn fetch_range(&self, now: DateTime<Utc>) -> DateRange {
        let today = now.with_timezone(&self.tz).date_naive();
        DateRange::around(today, self.lookback_days, self.lookahead_days, &self.tz)
    }

    async fn fetch(
        &self,
        report: &mut PassReport,
        range: DateRange,
        now: DateTime<Utc>,
    ) -> SyncResult<(Vec<Event>, Coverage)> {
        let source = &self.source;
        let limit = self.fetch_timeout;
        let outcome = retry_with_exponential_backoff(&self.fetch_retry, FetchError::is_transient, move || async move {
            match tokio::time::timeout(limit, source.fetch(range)).await {
                Ok(result) => result,
                Err(_) => Err(FetchError::timeout(format!("no answer within {:?}", limit))),
            }
        })
        .await;

        match outcome {
            Ok(events) => {
                info!("[Pass {}] Fetched {} events", report.pass_id, events.len());
                if let Some(cache) = &self.cache {
                    let snapshot = CachedFetch {
                        fetched_at: now,
                        range,
                        events: events.clone(),
                    };
                    if let Err(e) = cache.store(&snapshot).await {
                        warn!("[Pass {}] Could not update fetch cache: {:#}", report.pass_id, e);
                    }
                }
                Ok((events, Coverage::Complete))
            }
            Err(FetchError::PartialData { events, reason }) => {
                warn!(
                    "[Pass {}] Partial fetch ({} events): {}; deletions are suspended",
                    report.pass_id,
                    events.len(),
                    reason
                );
                report.partial_fetch = Some(reason.clone());
                Ok((events, Coverage::Partial { reason }))
            }
            Err(e) if e.is_transient() => {
                let Some(cached) = self.cached_fetch(now).await else {
                    return Err(e.into());
                };
                let reason = format!("source unavailable ({}); using data fetched at {}", e, cached.fetched_at);
                warn!("[Pass {}] {}", report.pass_id, reason);
                report.used_cache = true;
                report.partial_fetch = Some(reason.clone());
                Ok((cached.events, Coverage::Partial { reason }))
            }
            Err(e) => {
                error!("[Pass {}] Source refused the request; credentials need attention", report.pass_id);
                Err(e.into())
            }
        }
    }

    async fn cached_fetch(&self, now: DateTime<Utc>) -> Option<CachedFetch> {
        match &self.cache {
            Some(cache) => cache.load_fresh(now).await,
            None => None,
        }
    }

    fn target_label(&self) -> &'static str {
        if self.target.is_some() {
            "target"
        } else {
            "none"
        }
    }

    async fn resolve(
        &self,
        pass_id: &str,
        changes: &EventChanges,
        known: &HashMap<String, SyncRecord>,
        range: DateRange,
        now: DateTime<Utc>,
    ) -> Plan {
        let mut plan = Plan::default();
        let source = self.source.name();
        let target_label = self.target_label();
        let detected = if self.target.is_some() {
            SyncStatus::Pending
        } else {
            SyncStatus::Synced
        };

        let mut candidates = Vec::new();
        for event in &changes.added {
            plan.batch
                .log
                .push(SyncLogEntry::new(&event.id, SyncAction::Create, source, target_label, detected));
            candidates.push(SyncRecord::pending(event.clone(), now));
        }
        for update in &changes.updated {
            plan.batch
                .log
                .push(SyncLogEntry::new(&update.new.id, SyncAction::Update, source, target_label, detected));
            let record = match known.get(&update.new.id) {
                Some(previous) => previous.advance(update.new.clone(), SyncStatus::Pending, now),
                None => SyncRecord::pending(update.new.clone(), now),
            };
            candidates.push(record);
        }
        for event in &changes.unchanged {
            if let Some(record) = known.get(&event.id) {
                if record.sync_status.needs_push() {
                    candidates.push(record.clone());
                }
            }
        }

        let mut removals = Vec::new();
        for record in &changes.deleted {
            if self.target.is_some() && record.target_system_id.is_some() {
                removals.push(record.clone());
            } else {
                plan.batch.deletes.push(record.event_id.clone());
                plan.batch.log.push(SyncLogEntry::new(
                    &record.event_id,
                    SyncAction::Delete,
                    source,
                    target_label,
                    SyncStatus::Synced,
                ));
            }
        }

        let Some(target) = &self.target else {
            for mut record in candidates {
                record.sync_status = SyncStatus::Synced;
                record.updated_at = now;
                plan.batch.upserts.push(record);
            }
            return plan;
        };

        let copies = match within(target.timeout, target.calendar.list_events(range)).await {
            Ok(copies) => copies,
            Err(e) => {
                warn!(
                    "[Pass {}] Could not list target events ({}); deferring {} target writes",
                    pass_id,
                    e,
                    candidates.len() + removals.len()
                );
                plan.batch.upserts.extend(candidates);
                for mut record in removals {
                    record.sync_status = SyncStatus::Failed;
                    record.updated_at = now;
                    plan.batch.log.push(
                        SyncLogEntry::new(&record.event_id, SyncAction::Delete, source, target_label, SyncStatus::Failed)
                            .with_error(e.to_string()),
                    );
                    plan.batch.upserts.push(record);
                }
                return plan;
            }
        };

        let by_target_id: HashMap<&str, &TargetEvent> = copies.iter().map(|c| (c.target_id.as_str(), c)).collect();
        let by_source_id: HashMap<&str, &TargetEvent> = copies
            .iter()
            .filter_map(|c| c.source_event_id.as_deref().map(|id| (id, c)))
            .collect();

        for mut record in candidates {
            let copy = record
                .target_system_id
                .as_deref()
                .and_then(|id| by_target_id.get(id))
                .or_else(|| by_source_id.get(record.event_id.as_str()))
                .copied();

            match self.resolver.resolve(&record.event, copy, known.get(&record.event_id)) {
                Resolution::Push(content) => plan.pushes.push(PendingPush {
                    target_id: copy.map(|c| c.target_id.clone()),
                    record,
                    content,
                }),
                Resolution::KeepTarget => {
                    record.sync_status = SyncStatus::Synced;
                    record.target_system_id = copy.map(|c| c.target_id.clone());
                    record.target_hash = copy.and_then(|c| c.content_hash());
                    record.updated_at = now;
                    plan.batch.log.push(SyncLogEntry::new(
                        &record.event_id,
                        SyncAction::KeepTarget,
                        source,
                        target_label,
                        SyncStatus::Synced,
                    ));
                    plan.summary.kept_target += 1;
                    plan.batch.upserts.push(record);
                }
                Resolution::ManualReview { reason } => {
                    info!("[Pass {}] Event {} needs manual review: {}", pass_id, record.event_id, reason);
                    record.sync_status = SyncStatus::Conflict;
                    if let Some(copy) = copy {
                        record.target_system_id = Some(copy.target_id.clone());
                    }
                    record.updated_at = now;
                    plan.batch.log.push(
                        SyncLogEntry::new(&record.event_id, SyncAction::Conflict, source, target_label, SyncStatus::Conflict)
                            .with_error(reason.clone()),
                    );
                    plan.summary.manual_review += 1;
                    plan.conflicts.push(ConflictNotice {
                        event: record.event.clone(),
                        reason,
                    });
                    plan.batch.upserts.push(record);
                }
            }
        }
        plan.removals = removals;
        plan
    }

    /// Carries out the planned target writes behind a per-pass circuit
    /// breaker, then commits everything in one store transaction.
    async fn persist(
        &self,
        plan: Plan,
        report: &mut PassReport,
        now: DateTime<Utc>,
    ) -> SyncResult<Vec<ConflictNotice>> {
        let Plan {
            mut batch,
            pushes,
            removals,
            conflicts,
            mut summary,
        } = plan;
        let source = self.source.name();
        let target_label = self.target_label();

        if let Some(target) = &self.target {
            let breaker = CircuitBreaker::new("target-calendar", target.breaker.clone());
            let calendar = &target.calendar;
            let limit = target.timeout;

            for push in pushes {
                let PendingPush {
                    mut record,
                    content,
                    target_id,
                } = push;
                let result = breaker
                    .execute(|| within(limit, calendar.upsert_event(&content, target_id)))
                    .await
                    .map_err(target_failure);

                let entry = match result {
                    Ok(stored) => {
                        record.sync_status = SyncStatus::Synced;
                        record.target_hash = stored.content_hash();
                        record.target_system_id = Some(stored.target_id);
                        summary.pushed += 1;
                        SyncLogEntry::new(&record.event_id, SyncAction::Push, source, target_label, SyncStatus::Synced)
                    }
                    Err(e) => {
                        warn!("[Pass {}] Push of {} failed: {}", report.pass_id, record.event_id, e);
                        record.sync_status = SyncStatus::Failed;
                        summary.push_failures += 1;
                        SyncLogEntry::new(&record.event_id, SyncAction::Push, source, target_label, SyncStatus::Failed)
                            .with_error(e.to_string())
                    }
                };
                record.updated_at = now;
                batch.log.push(entry);
                batch.upserts.push(record);
            }

            for mut record in removals {
                let Some(target_id) = record.target_system_id.clone() else {
                    batch.deletes.push(record.event_id.clone());
                    continue;
                };
                let result = breaker
                    .execute(|| within(limit, calendar.delete_event(&target_id)))
                    .await
                    .map_err(target_failure);

                match result {
                    Ok(()) => {
                        summary.target_deletes += 1;
                        batch.deletes.push(record.event_id.clone());
                        batch.log.push(SyncLogEntry::new(
                            &record.event_id,
                            SyncAction::Delete,
                            source,
                            target_label,
                            SyncStatus::Synced,
                        ));
                    }
                    Err(e) => {
                        warn!("[Pass {}] Removing target copy of {} failed: {}", report.pass_id, record.event_id, e);
                        record.sync_status = SyncStatus::Failed;
                        record.updated_at = now;
                        batch.log.push(
                            SyncLogEntry::new(&record.event_id, SyncAction::Delete, source, target_label, SyncStatus::Failed)
                                .with_error(e.to_string()),
                        );
                        batch.upserts.push(record);
                    }
                }
            }
        }

        report.resolution = summary;
        if !batch.is_empty() {
            self.store.commit(&batch).await.context("committing pass results")?;
            debug!(
                "[Pass {}] Committed {} upserts, {} deletes, {} log entries",
                report.pass_id,
                batch.upserts.len(),
                batch.deletes.len(),
                batch.log.len()
            );
        }
        Ok(conflicts)
    }

    async fn schedule(
        &self,
        report: &mut PassReport,
        changes: &EventChanges,
        conflicts: &[ConflictNotice],
        now: DateTime<Utc>,
    ) -> SyncResult<()> {
        let gone: Vec<String> = changes.deleted.iter().map(|r| r.event_id.clone()).collect();
        let withdrawn = self.store.cancel_notifications_for_events(&gone).await?;
        if withdrawn > 0 {
            info!("[Pass {}] Withdrew {} notifications for deleted events", report.pass_id, withdrawn);
        }

        let existing = ExistingNotifications::from(self.store.ledger_states().await?);
        let scheduled = self.scheduler.schedule(changes, conflicts, &existing, now);
        report.notifications_scheduled = self.store.enqueue_notifications(&scheduled).await?;
        Ok(())
    }

    async fn dispatch_due(&self, report: &mut PassReport, now: DateTime<Utc>, deadline: Instant) -> SyncResult<()> {
        let due = self.store.due_notifications(now).await?;
        let (stale, ready): (Vec<_>, Vec<_>) = due.into_iter().partition(|n| self.is_stale(n, now));

        let mut ledger: Vec<LedgerUpdate> = stale
            .iter()
            .flat_map(|n| {
                n.channels.iter().map(move |channel| LedgerUpdate {
                    notification_id: n.id.clone(),
                    channel: channel.clone(),
                    state: DeliveryState::Failed,
                    attempts: 0,
                    last_error: Some("expired before delivery".to_string()),
                })
            })
            .collect();
        if !stale.is_empty() {
            info!("[Pass {}] {} reminders expired before delivery", report.pass_id, stale.len());
        }

        let mut cancelled = false;
        if !ready.is_empty() {
            let (cancel, timer) = cancel_at(deadline);
            let dispatched = self.dispatcher.dispatch(ready, cancel).await;
            timer.abort();
            cancelled = dispatched.cancelled;
            ledger.extend(dispatched.ledger.iter().cloned());
            absorb(report, dispatched);
        }

        self.store.apply_ledger_updates(&ledger).await?;
        self.store.remove_settled_notifications().await?;

        if cancelled {
            return Err(SyncError::Timeout(self.pass_timeout));
        }
        Ok(())
    }

    /// A reminder whose event has already started is no longer useful.
    fn is_stale(&self, notification: &ScheduledNotification, now: DateTime<Utc>) -> bool {
        match &notification.payload {
            NotificationPayload::Reminder { event, .. } => event.start.to_utc(&self.tz) <= now,
            _ => false,
        }
    }

    async fn notify_failure(&self, report: &mut PassReport, now: DateTime<Utc>) {
        let stage = report.failed_stage.unwrap_or(PassState::Fetching);
        let message = report.error.clone().unwrap_or_default();
        let Some(notice) = self.scheduler.pass_failure(&report.pass_id, stage, message, now) else {
            debug!("[Pass {}] No channel takes pass failures", report.pass_id);
            return;
        };

        let (cancel, timer) = cancel_at(Instant::now() + FAILURE_NOTICE_BUDGET);
        let dispatched = self.dispatcher.dispatch_best_effort(notice, cancel).await;
        timer.abort();
        if dispatched.delivered() == 0 {
            warn!("[Pass {}] No channel accepted the failure notice", report.pass_id);
        }
        absorb(report, dispatched);
    }
}

fn enter(report: &mut PassReport, state: PassState) {
    debug!("[Pass {}] {} -> {}", report.pass_id, report.state, state);
    report.state = state;
}

fn fail(report: &mut PassReport, error: SyncError) {
    let failure = PassFailure {
        stage: report.state,
        source: error,
    };
    log_error_with_context(&failure, &format!("Pass {}", report.pass_id));
    report.failed_stage = Some(failure.stage);
    report.error = Some(failure.source.to_safe_string());
    report.state = PassState::Failed;
}

fn absorb(report: &mut PassReport, dispatched: DispatchReport) {
    report.permanent_failures.extend(dispatched.permanent_failures());
    for (channel, stats) in &dispatched.stats {
        report.channel_stats.entry(channel.clone()).or_default().merge(stats);
    }
    report.deliveries.extend(dispatched.results);
}

/// A token that cancels itself at `deadline`. Abort the handle once the
/// guarded work is over.
fn cancel_at(deadline: Instant) -> (CancellationToken, JoinHandle<()>) {
    let token = CancellationToken::new();
    let timer = token.clone();
    let handle = tokio::spawn(async move {
        tokio::time::sleep_until(deadline).await;
        timer.cancel();
    });
    (token, handle)
}

async fn within<T>(limit: Duration, call: impl Future<Output = Result<T, TargetError>>) -> Result<T, TargetError> {
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(TargetError::Network(format!("no answer within {:?}", limit))),
    }
}

fn target_failure(error: BreakerError<TargetError>) -> TargetError {
    match error {
        BreakerError::Open => TargetError::CircuitOpen,
        BreakerError::Inner(e) => e,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::MockTargetCalendar;
    use crate::channels::{NotificationChannel, OutboundMessage, RenderedMessage};
    use crate::config::{ChannelConfig, ChannelKind, RateLimitConfig, RetrySettings, TargetConfig};
    use crate::conflict::ConflictStrategy;
    use crate::database::tests::create_test_database;
    use crate::dispatch::{ChannelHandle, DeliveryPolicy};
    use crate::error::DeliveryError;
    use crate::models::{ChannelId, EventLine, EventTime, NotificationType, Priority};
    use async_trait::async_trait;
    use chrono::{FixedOffset, TimeZone};
    use chrono_tz::Asia::Tokyo;
    use std::collections::{BTreeSet, VecDeque};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tempfile::tempdir;

    struct ScriptedSource {
        script: Mutex<VecDeque<Result<Vec<Event>, FetchError>>>,
        calls: AtomicUsize,
        delay: Option<Duration>,
        /// Fixed feed answered by window, the way a real ICS source filters.
        feed: Option<Vec<Event>>,
    }

    impl ScriptedSource {
        fn new(script: Vec<Result<Vec<Event>, FetchError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                calls: AtomicUsize::new(0),
                delay: None,
                feed: None,
            })
        }

        fn feed(events: Vec<Event>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(VecDeque::new()),
                calls: AtomicUsize::new(0),
                delay: None,
                feed: Some(events),
            })
        }

        fn hanging() -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(VecDeque::new()),
                calls: AtomicUsize::new(0),
                delay: Some(Duration::from_secs(30)),
                feed: None,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl EventSource for ScriptedSource {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn fetch(&self, range: DateRange) -> Result<Vec<Event>, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if let Some(feed) = &self.feed {
                return Ok(feed.iter().filter(|e| range.overlaps(e, &Tokyo)).cloned().collect());
            }
            self.script.lock().unwrap().pop_front().unwrap_or_else(|| Ok(Vec::new()))
        }
    }

    struct RecordingChannel {
        id: ChannelId,
        sent: Mutex<Vec<String>>,
    }

    impl RecordingChannel {
        fn sent(&self) -> Vec<String> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl NotificationChannel for RecordingChannel {
        fn id(&self) -> &ChannelId {
            &self.id
        }

        fn render(&self, notification: &ScheduledNotification) -> RenderedMessage {
            RenderedMessage::Text(notification.id.clone())
        }

        async fn send(&self, message: &OutboundMessage) -> Result<(), DeliveryError> {
            self.sent.lock().unwrap().push(message.notification_id.clone());
            Ok(())
        }
    }

    fn now() -> DateTime<Utc> {
        // 09:00 in Tokyo
        Utc.with_ymd_and_hms(2025, 9, 1, 0, 0, 0).unwrap()
    }

    fn at_jst(day: u32, hour: u32) -> EventTime {
        let jst = FixedOffset::east_opt(9 * 3600).unwrap();
        EventTime::DateTime(jst.with_ymd_and_hms(2025, 9, day, hour, 0, 0).unwrap())
    }

    fn standup() -> Event {
        Event::new("standup", "Standup", at_jst(1, 14)).with_end(at_jst(1, 15))
    }

    fn review() -> Event {
        Event::new("review", "Design review", at_jst(2, 10)).with_location("Room 2")
    }

    fn copy_of(event: &Event, target_id: &str) -> TargetEvent {
        TargetEvent {
            target_id: target_id.to_string(),
            source_event_id: Some(event.id.clone()),
            title: Some(event.title.clone()),
            description: event.description.clone(),
            location: event.location.clone(),
            start: Some(event.start),
            end: event.end,
        }
    }

    fn test_config() -> Config {
        let mut config = Config::default();
        config.source.retry = RetrySettings {
            max_attempts: 3,
            base_delay_ms: 1,
            max_delay_ms: 5,
            jitter: false,
            ..RetrySettings::default()
        };
        config.channels = vec![ChannelConfig {
            id: "chat".to_string(),
            kind: ChannelKind::Slack {
                webhook_url: "https://hooks.example.com/chat".to_string(),
            },
            rate_limit: None,
            retry: RetrySettings::default(),
            notify: None,
            enabled: true,
        }];
        config
    }

    fn with_target(mut config: Config, breaker_failure_threshold: u32) -> Config {
        config.target = Some(TargetConfig {
            calendar_id: "primary".to_string(),
            access_token: "token".to_string(),
            api_base: None,
            timeout_secs: 5,
            breaker_failure_threshold,
        });
        config
    }

    fn build(
        config: &Config,
        db: Database,
        source: Arc<ScriptedSource>,
        target: Option<MockTargetCalendar>,
    ) -> (SyncOrchestrator, Arc<RecordingChannel>) {
        let channel = Arc::new(RecordingChannel {
            id: ChannelId::new("chat"),
            sent: Mutex::new(Vec::new()),
        });
        let dispatcher = Dispatcher::new(
            vec![ChannelHandle {
                channel: channel.clone(),
                rate_limit: RateLimitConfig {
                    max_sends: 100,
                    per_seconds: 60,
                },
                policy: DeliveryPolicy::from_settings(&RetrySettings::default()),
            }],
            HookChain::new(),
        );
        let target = target.map(|mock| Arc::new(mock) as Arc<dyn TargetCalendar>);
        let orchestrator = SyncOrchestrator::new(config, db, source, target, dispatcher).unwrap();
        (orchestrator, channel)
    }

    async fn seed(db: &Database, records: Vec<SyncRecord>) {
        db.commit(&StoreBatch {
            upserts: records,
            ..StoreBatch::default()
        })
        .await
        .unwrap();
    }

    fn synced(event: Event, target_id: &str) -> SyncRecord {
        let mut record = SyncRecord::pending(event.clone(), now());
        record.sync_status = SyncStatus::Synced;
        record.target_system_id = Some(target_id.to_string());
        record.target_hash = Some(event.content_hash());
        record
    }

    #[tokio::test]
    async fn test_first_pass_stores_events_and_delivers_due_notifications() {
        let db = create_test_database().await;
        let source = ScriptedSource::new(vec![Ok(vec![standup(), review()])]);
        let (orchestrator, channel) = build(&test_config(), db.clone(), source, None);

        let report = orchestrator.run_pass_at(now()).await;

        assert_eq!(report.state, PassState::Done);
        assert_eq!(report.changes.added, 2);
        let records = db.load_records().await.unwrap();
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.sync_status == SyncStatus::Synced));

        let log = db.sync_log_for_event("standup").await.unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].action, SyncAction::Create);

        let sent = channel.sent();
        assert!(sent.contains(&"daily-summary:2025-09-01".to_string()));
        assert!(sent.contains(&ScheduledNotification::event_added_id(&standup())));
        assert_eq!(report.delivered_count(), sent.len());
        assert!(report.notifications_scheduled > sent.len());
    }

    #[tokio::test]
    async fn test_repeated_pass_sends_nothing_twice() {
        let db = create_test_database().await;
        let source = ScriptedSource::new(vec![Ok(vec![standup(), review()]), Ok(vec![standup(), review()])]);
        let (orchestrator, channel) = build(&test_config(), db.clone(), source, None);

        orchestrator.run_pass_at(now()).await;
        let first = channel.sent();
        let report = orchestrator.run_pass_at(now()).await;

        assert_eq!(report.state, PassState::Done);
        assert_eq!(report.changes.unchanged, 2);
        assert_eq!(channel.sent(), first);
    }

    #[tokio::test]
    async fn test_partial_fetch_never_deletes() {
        let db = create_test_database().await;
        let source = ScriptedSource::new(vec![
            Ok(vec![standup(), review()]),
            Err(FetchError::PartialData {
                events: vec![standup()],
                reason: "2 components skipped".to_string(),
            }),
        ]);
        let (orchestrator, _) = build(&test_config(), db.clone(), source, None);

        orchestrator.run_pass_at(now()).await;
        let report = orchestrator.run_pass_at(now()).await;

        assert_eq!(report.state, PassState::Done);
        assert_eq!(report.partial_fetch.as_deref(), Some("2 components skipped"));
        assert_eq!(report.changes.deleted, 0);
        assert_eq!(db.load_records().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_auth_failure_aborts_without_touching_store() {
        let db = create_test_database().await;
        let source = ScriptedSource::new(vec![Err(FetchError::auth("HTTP 403"))]);
        let (orchestrator, channel) = build(&test_config(), db.clone(), source.clone(), None);

        let report = orchestrator.run_pass_at(now()).await;

        assert_eq!(report.state, PassState::Failed);
        assert_eq!(report.failed_stage, Some(PassState::Fetching));
        assert!(report.error.as_deref().unwrap().contains("Authentication"));
        assert_eq!(source.calls(), 1);
        assert!(db.load_records().await.unwrap().is_empty());
        assert!(db.recent_sync_log(10).await.unwrap().is_empty());
        assert_eq!(channel.sent(), vec![ScheduledNotification::pass_failure_id(&report.pass_id)]);
        assert!(db.ledger_states().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_transient_fetch_errors_are_retried() {
        let db = create_test_database().await;
        let source = ScriptedSource::new(vec![
            Err(FetchError::network("connection reset")),
            Err(FetchError::timeout("slow")),
            Ok(vec![standup()]),
        ]);
        let (orchestrator, _) = build(&test_config(), db.clone(), source.clone(), None);

        let report = orchestrator.run_pass_at(now()).await;

        assert_eq!(report.state, PassState::Done);
        assert_eq!(source.calls(), 3);
        assert_eq!(report.changes.added, 1);
    }

    #[tokio::test]
    async fn test_cache_fallback_is_partial_coverage() {
        let dir = tempdir().unwrap();
        let mut config = test_config();
        config.source.cache_fallback = true;
        config.source.cache_path = Some(dir.path().join("fetch-cache.json"));

        let db = create_test_database().await;
        let source = ScriptedSource::new(vec![
            Ok(vec![standup(), review()]),
            Err(FetchError::network("down")),
            Err(FetchError::network("down")),
            Err(FetchError::network("down")),
        ]);
        let (orchestrator, _) = build(&config, db.clone(), source.clone(), None);

        orchestrator.run_pass_at(now()).await;
        let report = orchestrator.run_pass_at(now()).await;

        assert_eq!(source.calls(), 4);
        assert_eq!(report.state, PassState::Done);
        assert!(report.used_cache);
        assert!(report.partial_fetch.is_some());
        assert_eq!(report.changes.deleted, 0);
        assert_eq!(db.load_records().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_unreachable_source_without_cache_fails() {
        let db = create_test_database().await;
        let source = ScriptedSource::new(vec![
            Err(FetchError::network("down")),
            Err(FetchError::network("down")),
            Err(FetchError::network("down")),
        ]);
        let (orchestrator, _) = build(&test_config(), db.clone(), source, None);

        let report = orchestrator.run_pass_at(now()).await;

        assert_eq!(report.state, PassState::Failed);
        assert!(!report.used_cache);
        assert!(db.load_records().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_pushes_record_target_linkage() {
        let db = create_test_database().await;
        let source = ScriptedSource::new(vec![Ok(vec![standup(), review()])]);

        let mut target = MockTargetCalendar::new();
        target.expect_list_events().returning(|_| Ok(Vec::new()));
        target
            .expect_upsert_event()
            .times(2)
            .returning(|event: &Event, _target_id: Option<String>| Ok(copy_of(event, &format!("g-{}", event.id))));

        let config = with_target(test_config(), 3);
        let (orchestrator, _) = build(&config, db.clone(), source, Some(target));
        let report = orchestrator.run_pass_at(now()).await;

        assert_eq!(report.state, PassState::Done);
        assert_eq!(report.resolution.pushed, 2);
        let record = db.get_record("standup").await.unwrap().unwrap();
        assert_eq!(record.sync_status, SyncStatus::Synced);
        assert_eq!(record.target_system_id.as_deref(), Some("g-standup"));
        assert_eq!(record.target_hash, Some(standup().content_hash()));

        let actions: Vec<SyncAction> = db
            .sync_log_for_event("standup")
            .await
            .unwrap()
            .into_iter()
            .map(|entry| entry.action)
            .collect();
        assert!(actions.contains(&SyncAction::Create));
        assert!(actions.contains(&SyncAction::Push));
    }

    #[tokio::test]
    async fn test_edits_on_both_sides_go_to_manual_review() {
        let db = create_test_database().await;
        seed(&db, vec![synced(standup(), "g1")]).await;

        let moved = standup().with_location("Room 4");
        let source = ScriptedSource::new(vec![Ok(vec![moved.clone()])]);

        let mut edited = copy_of(&standup(), "g1");
        edited.title = Some("Standup (renamed)".to_string());
        let mut target = MockTargetCalendar::new();
        target.expect_list_events().returning(move |_| Ok(vec![edited.clone()]));

        let mut config = with_target(test_config(), 3);
        config.conflict.strategy = ConflictStrategy::ManualReview;
        let (orchestrator, channel) = build(&config, db.clone(), source, Some(target));
        let report = orchestrator.run_pass_at(now()).await;

        assert_eq!(report.state, PassState::Done);
        assert_eq!(report.resolution.manual_review, 1);
        assert_eq!(report.resolution.pushed, 0);
        let record = db.get_record("standup").await.unwrap().unwrap();
        assert_eq!(record.sync_status, SyncStatus::Conflict);
        assert_eq!(record.event, moved);
        assert!(channel.sent().contains(&ScheduledNotification::conflict_review_id(&moved)));
    }

    #[tokio::test]
    async fn test_target_listing_failure_defers_pushes() {
        let db = create_test_database().await;
        let source = ScriptedSource::new(vec![Ok(vec![standup()])]);
        let mut target = MockTargetCalendar::new();
        target
            .expect_list_events()
            .returning(|_| Err(TargetError::Network("503".to_string())));

        let config = with_target(test_config(), 3);
        let (orchestrator, _) = build(&config, db.clone(), source, Some(target));
        let report = orchestrator.run_pass_at(now()).await;

        assert_eq!(report.state, PassState::Done);
        let record = db.get_record("standup").await.unwrap().unwrap();
        assert_eq!(record.sync_status, SyncStatus::Pending);
        assert_eq!(record.target_system_id, None);
    }

    #[tokio::test]
    async fn test_circuit_opens_after_consecutive_push_failures() {
        let db = create_test_database().await;
        let events: Vec<Event> = (0..4)
            .map(|i| Event::new(format!("e{}", i), format!("Event {}", i), at_jst(3, 9 + i)))
            .collect();
        let source = ScriptedSource::new(vec![Ok(events)]);

        let mut target = MockTargetCalendar::new();
        target.expect_list_events().returning(|_| Ok(Vec::new()));
        target
            .expect_upsert_event()
            .times(2)
            .returning(|_, _| Err(TargetError::Network("502".to_string())));

        let config = with_target(test_config(), 2);
        let (orchestrator, _) = build(&config, db.clone(), source, Some(target));
        let report = orchestrator.run_pass_at(now()).await;

        assert_eq!(report.state, PassState::Done);
        assert_eq!(report.resolution.push_failures, 4);
        let records = db.load_records().await.unwrap();
        assert_eq!(records.len(), 4);
        assert!(records.iter().all(|r| r.sync_status == SyncStatus::Failed));
    }

    #[tokio::test]
    async fn test_deleted_event_removes_target_copy() {
        let db = create_test_database().await;
        let old = Event::new("old", "Cancelled sync", at_jst(2, 16));
        seed(&db, vec![synced(old.clone(), "g-old"), synced(standup(), "g-standup")]).await;
        let source = ScriptedSource::new(vec![Ok(vec![standup()])]);

        let mut target = MockTargetCalendar::new();
        let listing = vec![copy_of(&old, "g-old"), copy_of(&standup(), "g-standup")];
        target.expect_list_events().returning(move |_| Ok(listing.clone()));
        target
            .expect_delete_event()
            .withf(|id: &str| id == "g-old")
            .times(1)
            .returning(|_| Ok(()));

        let config = with_target(test_config(), 3);
        let (orchestrator, _) = build(&config, db.clone(), source, Some(target));
        let report = orchestrator.run_pass_at(now()).await;

        assert_eq!(report.state, PassState::Done);
        assert_eq!(report.changes.deleted, 1);
        assert_eq!(report.resolution.target_deletes, 1);
        assert!(db.get_record("old").await.unwrap().is_none());
        assert!(db.get_record("standup").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_event_leaving_the_window_keeps_its_target_copy() {
        let db = create_test_database().await;
        let source = ScriptedSource::feed(vec![standup(), review()]);

        let mut target = MockTargetCalendar::new();
        target.expect_list_events().returning(|_| Ok(Vec::new()));
        target
            .expect_upsert_event()
            .times(2)
            .returning(|event: &Event, _target_id: Option<String>| Ok(copy_of(event, &format!("g-{}", event.id))));
        target.expect_delete_event().times(0);

        let config = with_target(test_config(), 3);
        let (orchestrator, _) = build(&config, db.clone(), source.clone(), Some(target));
        let first = orchestrator.run_pass_at(now()).await;
        assert_eq!(first.changes.added, 2);

        // Three days on, with the feed unchanged, both events have aged out.
        let later = orchestrator.run_pass_at(now() + chrono::Duration::days(3)).await;

        assert_eq!(later.state, PassState::Done);
        assert_eq!(source.calls(), 2);
        assert_eq!(later.changes.deleted, 0);
        assert_eq!(later.resolution.target_deletes, 0);
        let records = db.load_records().await.unwrap();
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.target_system_id.is_some()));
        assert!(db
            .sync_log_for_event("standup")
            .await
            .unwrap()
            .iter()
            .all(|entry| entry.action != SyncAction::Delete));
    }

    #[tokio::test]
    async fn test_reminders_for_started_events_expire() {
        let db = create_test_database().await;
        let started = Event::new("early", "Early call", at_jst(1, 8));
        let reminder = ScheduledNotification {
            id: ScheduledNotification::reminder_id("early", 15),
            notification_type: NotificationType::Reminder,
            event_id: Some("early".to_string()),
            scheduled_time: now() - chrono::Duration::minutes(75),
            priority: Priority::High,
            channels: BTreeSet::from([ChannelId::new("chat")]),
            payload: NotificationPayload::Reminder {
                event: EventLine::from(&started),
                minutes_before: 15,
            },
        };
        db.enqueue_notifications(&[reminder.clone()]).await.unwrap();

        let source = ScriptedSource::new(vec![Ok(Vec::new())]);
        let (orchestrator, channel) = build(&test_config(), db.clone(), source, None);
        let report = orchestrator.run_pass_at(now()).await;

        assert_eq!(report.state, PassState::Done);
        assert!(!channel.sent().contains(&reminder.id));
        let states = db.ledger_states().await.unwrap();
        assert!(states.contains(&(reminder.id.clone(), ChannelId::new("chat"), DeliveryState::Failed)));
    }

    #[tokio::test]
    async fn test_pass_timeout_fails_the_pass() {
        let db = create_test_database().await;
        let mut config = test_config();
        config.dispatch.pass_timeout_secs = 1;
        let (orchestrator, channel) = build(&config, db.clone(), ScriptedSource::hanging(), None);

        let report = orchestrator.run_pass_at(now()).await;

        assert_eq!(report.state, PassState::Failed);
        assert_eq!(report.failed_stage, Some(PassState::Fetching));
        assert!(report.error.as_deref().unwrap().contains("budget"));
        assert!(db.load_records().await.unwrap().is_empty());
        assert_eq!(channel.sent().len(), 1);
    }
}

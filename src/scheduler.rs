//! Notification Scheduler.
//!
//! Turns a pass's change set plus the calendar as it now stands into
//! notifications with deterministic ids. Re-running it for the same state
//! yields the same ids, which the queue upserts, so nothing is duplicated.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Duration, NaiveTime, Utc};
use chrono_tz::Tz;
use log::debug;

use crate::config::{ChannelConfig, ScheduleConfig};
use crate::error::ConfigError;
use crate::models::{
    local_to_utc, Agenda, ChannelId, DeliveryState, Event, EventChanges, EventLine, NotificationPayload,
    NotificationType, PassState, ScheduledNotification,
};

/// Which channels receive which notification types.
#[derive(Debug, Clone, Default)]
pub struct ChannelRoutes {
    routes: Vec<(ChannelId, Option<BTreeSet<NotificationType>>)>,
}

impl ChannelRoutes {
    pub fn from_configs(configs: &[ChannelConfig]) -> Self {
        let routes = configs
            .iter()
            .filter(|config| config.enabled)
            .map(|config| {
                let filter = config.notify.as_ref().map(|types| types.iter().copied().collect());
                (ChannelId::new(config.id.clone()), filter)
            })
            .collect();
        Self { routes }
    }

    /// Every channel receives every type.
    pub fn everything(channels: impl IntoIterator<Item = ChannelId>) -> Self {
        Self {
            routes: channels.into_iter().map(|id| (id, None)).collect(),
        }
    }

    pub fn route(mut self, channel: ChannelId, types: &[NotificationType]) -> Self {
        self.routes.push((channel, Some(types.iter().copied().collect())));
        self
    }

    pub fn channels_for(&self, notification_type: NotificationType) -> BTreeSet<ChannelId> {
        self.routes
            .iter()
            .filter(|(_, filter)| filter.as_ref().map(|f| f.contains(&notification_type)).unwrap_or(true))
            .map(|(id, _)| id.clone())
            .collect()
    }
}

/// Delivery ledger as of the start of scheduling.
#[derive(Debug, Clone, Default)]
pub struct ExistingNotifications {
    states: HashMap<(String, ChannelId), DeliveryState>,
}

impl ExistingNotifications {
    pub fn state(&self, notification_id: &str, channel: &ChannelId) -> Option<DeliveryState> {
        self.states.get(&(notification_id.to_string(), channel.clone())).copied()
    }
}

impl From<Vec<(String, ChannelId, DeliveryState)>> for ExistingNotifications {
    fn from(rows: Vec<(String, ChannelId, DeliveryState)>) -> Self {
        Self {
            states: rows.into_iter().map(|(id, channel, state)| ((id, channel), state)).collect(),
        }
    }
}

/// An event the conflict resolver left for a human.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictNotice {
    pub event: Event,
    pub reason: String,
}

pub struct NotificationScheduler {
    tz: Tz,
    summary_time: NaiveTime,
    summary_days: u32,
    added_lookahead: Duration,
    reminder_offsets: Vec<u32>,
    reminder_horizon: Duration,
    routes: ChannelRoutes,
}

impl NotificationScheduler {
    pub fn new(config: &ScheduleConfig, tz: Tz, routes: ChannelRoutes) -> Result<Self, ConfigError> {
        let mut reminder_offsets = config.reminder_offsets_minutes.clone();
        reminder_offsets.sort_unstable();
        reminder_offsets.dedup();

        Ok(Self {
            tz,
            summary_time: config.summary_time()?,
            summary_days: config.summary_days.max(1),
            added_lookahead: Duration::hours(config.event_added_lookahead_hours as i64),
            reminder_offsets,
            reminder_horizon: Duration::hours(config.reminder_horizon_hours as i64),
            routes,
        })
    }

    pub fn schedule(
        &self,
        changes: &EventChanges,
        conflicts: &[ConflictNotice],
        existing: &ExistingNotifications,
        now: DateTime<Utc>,
    ) -> Vec<ScheduledNotification> {
        let view = changes.current_events();
        let mut candidates = Vec::new();

        self.daily_summaries(&view, now, &mut candidates);
        self.added_events(changes, now, &mut candidates);
        self.updated_events(changes, now, &mut candidates);
        self.reminders(&view, now, &mut candidates);
        for notice in conflicts {
            candidates.push(self.build(
                ScheduledNotification::conflict_review_id(&notice.event),
                NotificationType::ConflictReview,
                Some(notice.event.id.clone()),
                now,
                NotificationPayload::ConflictReview {
                    event: EventLine::from(&notice.event),
                    reason: notice.reason.clone(),
                },
            ));
        }

        let mut by_id: BTreeMap<String, ScheduledNotification> = BTreeMap::new();
        for mut notification in candidates {
            if by_id.contains_key(&notification.id) {
                continue;
            }
            notification.channels = self.open_channels(&notification, existing);
            if notification.channels.is_empty() {
                debug!("Nothing left to deliver for {}", notification.id);
                continue;
            }
            by_id.insert(notification.id.clone(), notification);
        }

        let mut scheduled: Vec<ScheduledNotification> = by_id.into_values().collect();
        scheduled.sort_by(|a, b| a.scheduled_time.cmp(&b.scheduled_time).then_with(|| a.id.cmp(&b.id)));
        scheduled
    }

    /// The notification sent when a pass aborts; `None` when no channel
    /// takes pass failures.
    pub fn pass_failure(
        &self,
        pass_id: &str,
        stage: PassState,
        message: String,
        now: DateTime<Utc>,
    ) -> Option<ScheduledNotification> {
        let mut notification = self.build(
            ScheduledNotification::pass_failure_id(pass_id),
            NotificationType::PassFailure,
            None,
            now,
            NotificationPayload::PassFailure {
                pass_id: pass_id.to_string(),
                stage,
                message,
            },
        );
        notification.channels = self.routes.channels_for(NotificationType::PassFailure);
        (!notification.channels.is_empty()).then_some(notification)
    }

    fn build(
        &self,
        id: String,
        notification_type: NotificationType,
        event_id: Option<String>,
        scheduled_time: DateTime<Utc>,
        payload: NotificationPayload,
    ) -> ScheduledNotification {
        ScheduledNotification {
            id,
            notification_type,
            event_id,
            scheduled_time,
            priority: notification_type.default_priority(),
            channels: BTreeSet::new(),
            payload,
        }
    }

    /// Routed channels minus those already settled. Failed daily summaries
    /// are offered again; any other failure is final.
    fn open_channels(
        &self,
        notification: &ScheduledNotification,
        existing: &ExistingNotifications,
    ) -> BTreeSet<ChannelId> {
        self.routes
            .channels_for(notification.notification_type)
            .into_iter()
            .filter(|channel| match existing.state(&notification.id, channel) {
                Some(DeliveryState::Delivered) => false,
                Some(DeliveryState::Failed) => notification.notification_type == NotificationType::DailySummary,
                Some(DeliveryState::Pending) | None => true,
            })
            .collect()
    }

    fn daily_summaries(&self, view: &[Event], now: DateTime<Utc>, out: &mut Vec<ScheduledNotification>) {
        let today = now.with_timezone(&self.tz).date_naive();
        for offset in 0..self.summary_days {
            let date = today + Duration::days(offset as i64);
            let agenda = Agenda::from_events(view.iter().filter(|e| e.occurs_on(date, &self.tz)), &self.tz);
            out.push(self.build(
                ScheduledNotification::daily_summary_id(date),
                NotificationType::DailySummary,
                None,
                local_to_utc(&self.tz, date, self.summary_time),
                NotificationPayload::DailySummary { date, agenda },
            ));
        }
    }

    fn added_events(&self, changes: &EventChanges, now: DateTime<Utc>, out: &mut Vec<ScheduledNotification>) {
        let today = now.with_timezone(&self.tz).date_naive();
        let window_start = local_to_utc(&self.tz, today, NaiveTime::default());
        let window_end = now + self.added_lookahead;

        for event in &changes.added {
            let start = event.starts_at(&self.tz);
            if start < window_start || start > window_end {
                continue;
            }
            out.push(self.build(
                ScheduledNotification::event_added_id(event),
                NotificationType::EventAdded,
                Some(event.id.clone()),
                now,
                NotificationPayload::EventAdded { event: EventLine::from(event) },
            ));
        }
    }

    fn updated_events(&self, changes: &EventChanges, now: DateTime<Utc>, out: &mut Vec<ScheduledNotification>) {
        for update in changes.updated.iter().filter(|u| u.is_visible()) {
            out.push(self.build(
                ScheduledNotification::event_updated_id(&update.new),
                NotificationType::EventUpdated,
                Some(update.new.id.clone()),
                now,
                NotificationPayload::EventUpdated {
                    before: EventLine::from(&update.old),
                    after: EventLine::from(&update.new),
                },
            ));
        }
    }

    /// One reminder per offset for timed events starting within the
    /// horizon, skipping offsets whose time has already passed.
    fn reminders(&self, view: &[Event], now: DateTime<Utc>, out: &mut Vec<ScheduledNotification>) {
        let horizon = now + self.reminder_horizon;
        for event in view.iter().filter(|e| !e.is_all_day()) {
            let start = event.starts_at(&self.tz);
            if start <= now || start > horizon {
                continue;
            }
            for &minutes in &self.reminder_offsets {
                let at = start - Duration::minutes(minutes as i64);
                if at < now {
                    continue;
                }
                out.push(self.build(
                    ScheduledNotification::reminder_id(&event.id, minutes),
                    NotificationType::Reminder,
                    Some(event.id.clone()),
                    at,
                    NotificationPayload::Reminder {
                        event: EventLine::from(event),
                        minutes_before: minutes,
                    },
                ));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::tests::create_test_database;
    use crate::models::{Coverage, EventTime, UpdatedEvent};
    use chrono::{NaiveDate, TimeZone};

    fn tz() -> Tz {
        "Asia/Tokyo".parse().unwrap()
    }

    /// 2025-09-01 08:00 JST.
    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 8, 31, 23, 0, 0).unwrap()
    }

    fn at(rfc3339: &str) -> EventTime {
        EventTime::DateTime(DateTime::parse_from_rfc3339(rfc3339).unwrap())
    }

    fn changes(added: Vec<Event>, unchanged: Vec<Event>) -> EventChanges {
        EventChanges {
            added,
            updated: Vec::new(),
            deleted: Vec::new(),
            unchanged,
            retained: Vec::new(),
            out_of_range: Vec::new(),
            coverage: Coverage::Complete,
        }
    }

    fn scheduler(routes: ChannelRoutes) -> NotificationScheduler {
        NotificationScheduler::new(&ScheduleConfig::default(), tz(), routes).unwrap()
    }

    fn chat_only() -> ChannelRoutes {
        ChannelRoutes::everything([ChannelId::new("chat")])
    }

    fn of_type(all: &[ScheduledNotification], t: NotificationType) -> Vec<&ScheduledNotification> {
        all.iter().filter(|n| n.notification_type == t).collect()
    }

    #[test]
    fn test_empty_day_gets_one_no_events_summary() {
        let scheduled = scheduler(chat_only()).schedule(
            &changes(vec![], vec![]),
            &[],
            &ExistingNotifications::default(),
            now(),
        );

        assert_eq!(scheduled.len(), 1);
        let summary = &scheduled[0];
        assert_eq!(summary.id, "daily-summary:2025-09-01");
        assert_eq!(summary.scheduled_time, Utc.with_ymd_and_hms(2025, 8, 31, 21, 0, 0).unwrap());
        match &summary.payload {
            NotificationPayload::DailySummary { agenda, .. } => assert_eq!(agenda, &Agenda::NoEvents),
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_summary_lists_only_that_day() {
        let today = Event::new("today", "Lunch", at("2025-09-01T12:00:00+09:00"));
        let holiday = Event::new("holiday", "Holiday", EventTime::Date(NaiveDate::from_ymd_opt(2025, 9, 1).unwrap()));
        let tomorrow = Event::new("tomorrow", "Dentist", at("2025-09-02T10:00:00+09:00"));

        let scheduled = scheduler(chat_only()).schedule(
            &changes(vec![], vec![today, holiday, tomorrow]),
            &[],
            &ExistingNotifications::default(),
            now(),
        );
        let summaries = of_type(&scheduled, NotificationType::DailySummary);
        assert_eq!(summaries.len(), 1);
        match &summaries[0].payload {
            NotificationPayload::DailySummary { agenda, .. } => {
                let ids: Vec<&str> = agenda.lines().iter().map(|l| l.event_id.as_str()).collect();
                assert_eq!(ids, vec!["holiday", "today"]);
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_added_events_respect_lookahead() {
        let soon = Event::new("soon", "Soon", at("2025-09-03T10:00:00+09:00"));
        let far = Event::new("far", "Far", at("2025-10-20T10:00:00+09:00"));
        let earlier_today = Event::new("early", "Early", at("2025-09-01T07:00:00+09:00"));
        let yesterday = Event::new("old", "Old", at("2025-08-31T10:00:00+09:00"));

        let scheduled = scheduler(chat_only()).schedule(
            &changes(vec![soon, far, earlier_today, yesterday], vec![]),
            &[],
            &ExistingNotifications::default(),
            now(),
        );
        let added: BTreeSet<&str> = of_type(&scheduled, NotificationType::EventAdded)
            .iter()
            .map(|n| n.event_id.as_deref().unwrap())
            .collect();
        assert_eq!(added, BTreeSet::from(["soon", "early"]));
    }

    #[test]
    fn test_invisible_updates_do_not_notify() {
        let old = Event::new("e1", "Review", at("2025-09-05T10:00:00+09:00"));
        let mut set = changes(vec![], vec![]);
        set.updated.push(UpdatedEvent {
            old: old.clone(),
            new: old.clone().with_description("agenda attached"),
        });
        set.updated.push(UpdatedEvent {
            old: Event::new("e2", "Sync", at("2025-09-05T11:00:00+09:00")),
            new: Event::new("e2", "Sync", at("2025-09-05T12:00:00+09:00")),
        });

        let scheduled =
            scheduler(chat_only()).schedule(&set, &[], &ExistingNotifications::default(), now());
        let updated = of_type(&scheduled, NotificationType::EventUpdated);
        assert_eq!(updated.len(), 1);
        assert_eq!(updated[0].event_id.as_deref(), Some("e2"));
        assert_eq!(updated[0].priority, crate::models::Priority::High);
    }

    #[test]
    fn test_reminders_at_each_future_offset() {
        let in_two_hours = Event::new("meeting", "Meeting", at("2025-09-01T10:00:00+09:00"));
        let in_half_hour = Event::new("call", "Call", at("2025-09-01T08:30:00+09:00"));
        let all_day = Event::new("off", "Day off", EventTime::Date(NaiveDate::from_ymd_opt(2025, 9, 1).unwrap()));
        let next_week = Event::new("later", "Later", at("2025-09-08T10:00:00+09:00"));

        let scheduled = scheduler(chat_only()).schedule(
            &changes(vec![], vec![in_two_hours, in_half_hour, all_day, next_week]),
            &[],
            &ExistingNotifications::default(),
            now(),
        );
        let ids: Vec<&str> = of_type(&scheduled, NotificationType::Reminder)
            .iter()
            .map(|n| n.id.as_str())
            .collect();
        assert_eq!(ids, vec!["reminder:call:15", "reminder:meeting:60", "reminder:meeting:15"]);

        let meeting_15 = scheduled.iter().find(|n| n.id == "reminder:meeting:15").unwrap();
        assert_eq!(meeting_15.scheduled_time, Utc.with_ymd_and_hms(2025, 9, 1, 0, 45, 0).unwrap());
    }

    #[test]
    fn test_delivered_reminder_is_not_rescheduled() {
        let meeting = Event::new("meeting", "Meeting", at("2025-09-01T10:00:00+09:00"));
        let set = changes(vec![], vec![meeting]);
        let scheduler = scheduler(chat_only());
        let chat = ChannelId::new("chat");

        let existing = ExistingNotifications::from(vec![
            ("reminder:meeting:60".to_string(), chat.clone(), DeliveryState::Delivered),
            ("reminder:meeting:15".to_string(), chat.clone(), DeliveryState::Pending),
        ]);
        let scheduled = scheduler.schedule(&set, &[], &existing, now());
        let reminders: Vec<&str> = of_type(&scheduled, NotificationType::Reminder)
            .iter()
            .map(|n| n.id.as_str())
            .collect();
        assert_eq!(reminders, vec!["reminder:meeting:15"]);
    }

    #[test]
    fn test_failed_summary_is_offered_again_but_failed_reminder_is_not() {
        let meeting = Event::new("meeting", "Meeting", at("2025-09-01T10:00:00+09:00"));
        let chat = ChannelId::new("chat");
        let existing = ExistingNotifications::from(vec![
            ("daily-summary:2025-09-01".to_string(), chat.clone(), DeliveryState::Failed),
            ("reminder:meeting:60".to_string(), chat.clone(), DeliveryState::Failed),
            ("reminder:meeting:15".to_string(), chat.clone(), DeliveryState::Failed),
        ]);

        let scheduled = scheduler(chat_only()).schedule(&changes(vec![], vec![meeting]), &[], &existing, now());
        assert_eq!(of_type(&scheduled, NotificationType::DailySummary).len(), 1);
        assert!(of_type(&scheduled, NotificationType::Reminder).is_empty());
    }

    #[test]
    fn test_routes_filter_notification_types() {
        let routes = ChannelRoutes::everything([ChannelId::new("chat")])
            .route(ChannelId::new("voice"), &[NotificationType::DailySummary, NotificationType::Reminder]);
        let added = Event::new("new", "New", at("2025-09-02T10:00:00+09:00"));

        let scheduled = scheduler(routes).schedule(
            &changes(vec![added], vec![]),
            &[],
            &ExistingNotifications::default(),
            now(),
        );
        let summary = &of_type(&scheduled, NotificationType::DailySummary)[0];
        assert_eq!(summary.channels.len(), 2);
        let added = &of_type(&scheduled, NotificationType::EventAdded)[0];
        assert_eq!(added.channels, BTreeSet::from([ChannelId::new("chat")]));
    }

    #[test]
    fn test_output_is_ordered_and_conflicts_surface() {
        let event = Event::new("e1", "Planning", at("2025-09-03T10:00:00+09:00"));
        let notices = vec![ConflictNotice {
            event: event.clone(),
            reason: "edited on both sides".to_string(),
        }];
        let scheduled = scheduler(chat_only()).schedule(
            &changes(vec![event], vec![]),
            &notices,
            &ExistingNotifications::default(),
            now(),
        );

        let review = of_type(&scheduled, NotificationType::ConflictReview);
        assert_eq!(review.len(), 1);
        assert!(review[0].id.starts_with("conflict-review:e1:"));
        for pair in scheduled.windows(2) {
            assert!((pair[0].scheduled_time, &pair[0].id) <= (pair[1].scheduled_time, &pair[1].id));
        }
    }

    #[test]
    fn test_pass_failure_needs_a_route() {
        let scheduler = scheduler(chat_only());
        let failure = scheduler
            .pass_failure("p1", PassState::Fetching, "Network error".into(), now())
            .unwrap();
        assert_eq!(failure.priority, crate::models::Priority::Urgent);
        assert_eq!(failure.id, "pass-failure:p1");

        let silent = NotificationScheduler::new(
            &ScheduleConfig::default(),
            tz(),
            ChannelRoutes::default().route(ChannelId::new("voice"), &[NotificationType::Reminder]),
        )
        .unwrap();
        assert!(silent.pass_failure("p1", PassState::Fetching, "x".into(), now()).is_none());
    }

    #[tokio::test]
    async fn test_rescheduling_twice_keeps_one_queued_reminder() {
        let db = create_test_database().await;
        let meeting = Event::new("meeting", "Meeting", at("2025-09-01T10:00:00+09:00"));
        let set = changes(vec![], vec![meeting]);
        let scheduler = scheduler(chat_only());

        for _ in 0..2 {
            let existing = ExistingNotifications::from(db.ledger_states().await.unwrap());
            let scheduled = scheduler.schedule(&set, &[], &existing, now());
            db.enqueue_notifications(&scheduled).await.unwrap();
        }

        let reminders = db
            .ledger_states()
            .await
            .unwrap()
            .into_iter()
            .filter(|(id, _, _)| id.starts_with("reminder:meeting:"))
            .count();
        assert_eq!(reminders, 2);

        let queued: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM notification_queue")
            .fetch_one(&db.pool)
            .await
            .unwrap();
        assert_eq!(queued, 3);
    }
}

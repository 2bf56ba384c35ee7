//! Channel-specific renderings of a notification payload.

use chrono_tz::Tz;
use serde_json::{json, Value};

use crate::models::{Agenda, EventLine, EventTime, NotificationPayload};
use crate::utils::{strip_urls, truncate_chars};

/// Spoken summaries stop after this many events.
const SPOKEN_EVENT_LIMIT: usize = 5;

const SLACK_TEXT_LIMIT: usize = 3000;
const DISCORD_DESCRIPTION_LIMIT: usize = 4096;
const LINE_TEXT_LIMIT: usize = 5000;

fn clock(time: &EventTime, tz: &Tz) -> String {
    match time {
        EventTime::Date(_) => "All day".to_string(),
        EventTime::DateTime(dt) => dt.with_timezone(tz).format("%H:%M").to_string(),
    }
}

fn when(line: &EventLine, tz: &Tz) -> String {
    if line.is_all_day() {
        return "All day".to_string();
    }
    match &line.end {
        Some(end @ EventTime::DateTime(_)) => format!("{}-{}", clock(&line.start, tz), clock(end, tz)),
        _ => clock(&line.start, tz),
    }
}

fn with_location(text: String, line: &EventLine) -> String {
    if line.location.is_empty() {
        text
    } else {
        format!("{} @ {}", text, line.location)
    }
}

fn date_label(line: &EventLine, tz: &Tz) -> String {
    line.start.date_in(tz).format("%m/%d").to_string()
}

/// Heading and body lines shared by the text-based renderings.
fn outline(payload: &NotificationPayload, tz: &Tz) -> (String, Vec<String>) {
    match payload {
        NotificationPayload::DailySummary { date, agenda } => {
            let heading = format!("Schedule for {}", date.format("%Y-%m-%d (%a)"));
            let body = match agenda {
                Agenda::NoEvents => vec!["No events today.".to_string()],
                Agenda::Events(lines) => lines
                    .iter()
                    .map(|l| with_location(format!("{}  {}", when(l, tz), l.title), l))
                    .collect(),
            };
            (heading, body)
        }
        NotificationPayload::EventAdded { event } => (
            "New event".to_string(),
            vec![with_location(
                format!("{} {}  {}", date_label(event, tz), when(event, tz), event.title),
                event,
            )],
        ),
        NotificationPayload::EventUpdated { before, after } => {
            let mut body = vec![with_location(
                format!("{} {}  {}", date_label(after, tz), when(after, tz), after.title),
                after,
            )];
            if before.title != after.title {
                body.push(format!("was: {}", before.title));
            }
            if before.start != after.start || before.end != after.end {
                body.push(format!("was: {} {}", date_label(before, tz), when(before, tz)));
            }
            ("Event changed".to_string(), body)
        }
        NotificationPayload::Reminder { event, minutes_before } => (
            format!("Starting in {} minutes", minutes_before),
            vec![with_location(format!("{}  {}", when(event, tz), event.title), event)],
        ),
        NotificationPayload::ConflictReview { event, reason } => (
            "Calendar conflict needs review".to_string(),
            vec![
                format!("{} {}  {}", date_label(event, tz), when(event, tz), event.title),
                reason.clone(),
            ],
        ),
        NotificationPayload::PassFailure { pass_id, stage, message } => (
            "Calendar sync failed".to_string(),
            vec![format!("Stage: {}", stage), message.clone(), format!("Pass: {}", pass_id)],
        ),
    }
}

pub fn plain_text(payload: &NotificationPayload, tz: &Tz) -> String {
    let (heading, body) = outline(payload, tz);
    let text = format!("{}\n{}", heading, body.join("\n"));
    truncate_chars(&text, LINE_TEXT_LIMIT)
}

pub fn slack_blocks(payload: &NotificationPayload, tz: &Tz) -> Value {
    let (heading, body) = outline(payload, tz);
    let fallback = format!("{}: {}", heading, body.first().cloned().unwrap_or_default());
    json!({
        "text": fallback,
        "blocks": [
            {
                "type": "header",
                "text": { "type": "plain_text", "text": truncate_chars(&heading, 150) }
            },
            {
                "type": "section",
                "text": { "type": "mrkdwn", "text": truncate_chars(&body.join("\n"), SLACK_TEXT_LIMIT) }
            }
        ]
    })
}

fn embed_color(payload: &NotificationPayload) -> u32 {
    match payload {
        NotificationPayload::PassFailure { .. } => 0xE74C3C,
        NotificationPayload::ConflictReview { .. } => 0xF1C40F,
        NotificationPayload::Reminder { .. } | NotificationPayload::EventUpdated { .. } => 0xE67E22,
        NotificationPayload::DailySummary { .. } | NotificationPayload::EventAdded { .. } => 0x3498DB,
    }
}

pub fn discord_embed(payload: &NotificationPayload, tz: &Tz) -> Value {
    let (heading, body) = outline(payload, tz);
    json!({
        "embeds": [{
            "title": truncate_chars(&heading, 256),
            "description": truncate_chars(&body.join("\n"), DISCORD_DESCRIPTION_LIMIT),
            "color": embed_color(payload)
        }]
    })
}

fn spoken_clock(time: &EventTime, tz: &Tz) -> String {
    match time {
        EventTime::Date(_) => "all day".to_string(),
        EventTime::DateTime(dt) => {
            let local = dt.with_timezone(tz);
            if local.format("%M").to_string() == "00" {
                format!("{} o'clock", local.format("%-H"))
            } else {
                local.format("%-H:%M").to_string()
            }
        }
    }
}

fn spoken_event(line: &EventLine, tz: &Tz) -> String {
    let title = strip_urls(&line.title);
    if line.is_all_day() {
        format!("all day, {}", title)
    } else {
        format!("at {}, {}", spoken_clock(&line.start, tz), title)
    }
}

/// Text for a voice assistant: no links, times read out, long agendas cut.
pub fn spoken(payload: &NotificationPayload, tz: &Tz) -> String {
    let text = match payload {
        NotificationPayload::DailySummary { agenda, .. } => match agenda {
            Agenda::NoEvents => "You have no events today.".to_string(),
            Agenda::Events(lines) => {
                let count = lines.len();
                let mut parts: Vec<String> =
                    lines.iter().take(SPOKEN_EVENT_LIMIT).map(|l| spoken_event(l, tz)).collect();
                if count > SPOKEN_EVENT_LIMIT {
                    parts.push(format!("and {} more", count - SPOKEN_EVENT_LIMIT));
                }
                let noun = if count == 1 { "event" } else { "events" };
                format!("You have {} {} today: {}.", count, noun, parts.join("; "))
            }
        },
        NotificationPayload::EventAdded { event } => {
            format!("New event on {}: {}.", event.start.date_in(tz).format("%B %-d"), spoken_event(event, tz))
        }
        NotificationPayload::EventUpdated { after, .. } => {
            format!("An event changed. It is now {}.", spoken_event(after, tz))
        }
        NotificationPayload::Reminder { event, minutes_before } => {
            format!("In {} minutes: {}.", minutes_before, strip_urls(&event.title))
        }
        NotificationPayload::ConflictReview { event, .. } => {
            format!("The event {} needs your review.", strip_urls(&event.title))
        }
        NotificationPayload::PassFailure { .. } => "Calendar sync failed. Please check the logs.".to_string(),
    };
    strip_urls(&text)
}

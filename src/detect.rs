//! Rate-limit detection for external tool output.
//!
//! The tool's limit reporting is not a stable contract, so classification is
//! an ordered list of phrases, each paired with a strategy for estimating when
//! the quota resets. The first phrase found wins.

use chrono::{DateTime, Duration, Local, NaiveDateTime, NaiveTime, TimeZone};
use regex::Regex;
use std::sync::OnceLock;

use crate::config::RateLimitConfig;
use crate::domain::RateLimitInfo;

/// How the reset time is estimated for a matched phrase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetStrategy {
    /// Read a literal epoch or ISO-8601 timestamp out of the message
    FromLimitMessage,
    /// Snap forward to the next fixed quota-window boundary
    Windowed,
}

/// Phrases in evaluation order; more specific first
pub const LIMIT_PHRASES: &[(&str, ResetStrategy)] = &[
    ("usage limit reached", ResetStrategy::FromLimitMessage),
    ("rate limit exceeded", ResetStrategy::Windowed),
    ("too many requests", ResetStrategy::Windowed),
    ("quota exceeded", ResetStrategy::Windowed),
    ("limit exceeded", ResetStrategy::Windowed),
];

static EPOCH_REGEX: OnceLock<Regex> = OnceLock::new();
static ISO_REGEX: OnceLock<Regex> = OnceLock::new();

fn epoch_regex() -> &'static Regex {
    EPOCH_REGEX.get_or_init(|| {
        Regex::new(r"(?i)usage limit reached\|(\d+)").expect("EPOCH_REGEX is valid")
    })
}

fn iso_regex() -> &'static Regex {
    ISO_REGEX.get_or_init(|| {
        Regex::new(r"\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}(?:\.\d+)?(?:Z|[+-]\d{2}:\d{2})?")
            .expect("ISO_REGEX is valid")
    })
}

#[derive(Debug, Clone)]
pub struct RateLimitDetector {
    window_hours: Vec<u32>,
    grace: Duration,
    message_limit: usize,
}

impl RateLimitDetector {
    pub fn new(config: &RateLimitConfig) -> Self {
        let mut window_hours: Vec<u32> = config
            .window_hours
            .iter()
            .copied()
            .filter(|h| *h < 24)
            .collect();
        window_hours.sort_unstable();
        window_hours.dedup();

        Self {
            window_hours,
            grace: Duration::hours(config.grace_hours),
            message_limit: config.message_limit,
        }
    }

    /// Classify output. Returns `None` when no limit phrase is present.
    pub fn detect(&self, output: &str, now: DateTime<Local>) -> Option<RateLimitInfo> {
        let lowered = output.to_lowercase();
        let (phrase, strategy) = LIMIT_PHRASES
            .iter()
            .find(|(phrase, _)| lowered.contains(phrase))?;

        let reset_time = match strategy {
            ResetStrategy::FromLimitMessage => self
                .reset_from_message(output)
                .unwrap_or_else(|| self.windowed_reset(now)),
            ResetStrategy::Windowed => self.windowed_reset(now),
        };

        log::debug!("Detected rate limit via '{}', reset at {}", phrase, reset_time);
        Some(RateLimitInfo {
            reset_time: Some(reset_time),
            matched_phrase: phrase.to_string(),
            message: truncate_chars(output.trim(), self.message_limit),
            detected_at: now,
        })
    }

    /// Reset time stated in the tool's own limit message, if any
    fn reset_from_message(&self, output: &str) -> Option<DateTime<Local>> {
        if let Some(caps) = epoch_regex().captures(output) {
            let parsed = caps[1]
                .parse::<i64>()
                .ok()
                .and_then(|secs| DateTime::from_timestamp(secs, 0));
            if let Some(at) = parsed {
                return Some(at.with_timezone(&Local));
            }
        }

        iso_regex()
            .find_iter(output)
            .filter_map(|m| parse_timestamp(m.as_str()))
            .max()
            .map(|latest| latest + self.grace)
    }

    fn windowed_reset(&self, now: DateTime<Local>) -> DateTime<Local> {
        let boundary = next_window_boundary(now.naive_local(), &self.window_hours);
        Local
            .from_local_datetime(&boundary)
            .earliest()
            .unwrap_or_else(|| now + Duration::hours(1))
    }
}

impl Default for RateLimitDetector {
    fn default() -> Self {
        Self::new(&RateLimitConfig::default())
    }
}

/// First window boundary strictly after `now`; rolls to the next day when
/// today's boundaries have all passed. `hours` must be sorted.
pub fn next_window_boundary(now: NaiveDateTime, hours: &[u32]) -> NaiveDateTime {
    let today = now.date();
    let at = |date: chrono::NaiveDate, hour: u32| {
        date.and_time(NaiveTime::from_hms_opt(hour, 0, 0).unwrap_or(NaiveTime::MIN))
    };

    if let Some(hour) = hours.iter().find(|h| at(today, **h) > now) {
        return at(today, *hour);
    }
    let tomorrow = today.succ_opt().unwrap_or(today);
    match hours.first() {
        Some(hour) => at(tomorrow, *hour),
        None => now + Duration::hours(1),
    }
}

/// RFC 3339 with offset, or a naive timestamp read as local time
fn parse_timestamp(text: &str) -> Option<DateTime<Local>> {
    if let Ok(at) = DateTime::parse_from_rfc3339(text) {
        return Some(at.with_timezone(&Local));
    }
    NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .and_then(|naive| Local.from_local_datetime(&naive).earliest())
}

fn truncate_chars(text: &str, limit: usize) -> String {
    match text.char_indices().nth(limit) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

//! Schedule time parsing
//!
//! Parses the human-readable times accepted by the queue CLI when
//! rescheduling or retrying a job.

use chrono::{DateTime, Duration, Utc};

use crate::{Result, SyndicastError};

/// Parse a schedule string into a DateTime
///
/// Supports:
/// - Relative durations: "1h", "30m", "2d"
/// - Natural language: "tomorrow", "next friday 3pm"
/// - "now" for immediate scheduling
pub fn parse_schedule(input: &str) -> Result<DateTime<Utc>> {
    let input = input.trim();
    if input.is_empty() {
        return Err(SyndicastError::InvalidInput(
            "Schedule string cannot be empty".to_string(),
        ));
    }

    if input.eq_ignore_ascii_case("now") {
        return Ok(Utc::now());
    }

    if let Ok(duration) = parse_duration(input) {
        return Ok(Utc::now() + duration);
    }

    if let Ok(dt) = parse_natural_language(input) {
        return Ok(dt);
    }

    Err(SyndicastError::InvalidInput(format!(
        "Could not parse schedule string: {}",
        input
    )))
}

/// Parse a duration string into a chrono::Duration
fn parse_duration(input: &str) -> Result<Duration> {
    let trimmed = input.strip_prefix('+').unwrap_or(input);

    if let Ok(std_duration) = humantime::parse_duration(trimmed) {
        let seconds = std_duration.as_secs() as i64;
        return Duration::try_seconds(seconds)
            .ok_or_else(|| SyndicastError::InvalidInput("Duration out of range".to_string()));
    }

    Err(SyndicastError::InvalidInput(format!(
        "Could not parse duration: {}",
        input
    )))
}

/// Parse natural language time expression
fn parse_natural_language(input: &str) -> Result<DateTime<Utc>> {
    chrono_english::parse_date_string(input, Utc::now(), chrono_english::Dialect::Us)
        .map_err(|e| SyndicastError::InvalidInput(format!("Could not parse time: {}", e)))
}

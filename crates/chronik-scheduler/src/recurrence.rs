use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::{Result, SchedulerError};

/// Shortest interval accepted by `@every`.
const MIN_INTERVAL: Duration = Duration::from_secs(1);

/// A parsed recurrence expression.
///
/// Accepted forms:
///
/// | Form                    | Example              | Notes                                  |
/// |-------------------------|----------------------|----------------------------------------|
/// | `@every <duration>`     | `@every 1h30m`       | units `ms`, `s`, `m`, `h`; total >= 1s |
/// | descriptor              | `@daily`             | `@yearly` … `@hourly`                  |
/// | standard 5-field cron   | `*/5 * * * 1-5`      | minute granularity, Sunday = 0 or 7    |
/// | 6/7-field cron          | `*/10 * * * * *`     | seconds first, optional year last      |
#[derive(Clone)]
pub enum Recurrence {
    Every {
        expression: String,
        interval: Duration,
    },
    Cron {
        expression: String,
        /// Seconds-first form actually handed to the cron parser.
        normalized: String,
        schedule: Box<cron::Schedule>,
    },
}

impl Recurrence {
    pub fn parse(expression: &str) -> Result<Self> {
        let expr = expression.trim();
        if expr.is_empty() {
            return Err(SchedulerError::invalid_schedule(expression, "empty expression"));
        }

        if let Some(rest) = expr.strip_prefix("@every") {
            let interval = parse_duration(rest.trim())
                .map_err(|reason| SchedulerError::invalid_schedule(expression, reason))?;
            if interval < MIN_INTERVAL {
                return Err(SchedulerError::invalid_schedule(
                    expression,
                    "interval must be at least 1s",
                ));
            }
            let fits = chrono::Duration::from_std(interval)
                .ok()
                .and_then(|step| Utc::now().checked_add_signed(step))
                .is_some();
            if !fits {
                return Err(SchedulerError::invalid_schedule(expression, "interval too large"));
            }
            return Ok(Recurrence::Every {
                expression: expr.to_string(),
                interval,
            });
        }

        let normalized = if expr.starts_with('@') {
            descriptor(expr)
                .ok_or_else(|| SchedulerError::invalid_schedule(expression, "unknown descriptor"))?
                .to_string()
        } else {
            let fields: Vec<&str> = expr.split_whitespace().collect();
            match fields.len() {
                // Standard crontab: prepend seconds, renumber day-of-week.
                5 => format!(
                    "0 {} {} {} {} {}",
                    fields[0],
                    fields[1],
                    fields[2],
                    fields[3],
                    standard_day_of_week(fields[4])
                        .map_err(|reason| SchedulerError::invalid_schedule(expression, reason))?
                ),
                6 | 7 => fields.join(" "),
                n => {
                    return Err(SchedulerError::invalid_schedule(
                        expression,
                        format!("expected 5, 6 or 7 fields, got {n}"),
                    ))
                }
            }
        };

        let schedule = cron::Schedule::from_str(&normalized)
            .map_err(|e| SchedulerError::invalid_schedule(expression, e.to_string()))?;

        Ok(Recurrence::Cron {
            expression: expr.to_string(),
            normalized,
            schedule: Box::new(schedule),
        })
    }

    /// Integer "every N seconds" form.
    pub fn every_secs(secs: u64) -> Result<Self> {
        Self::parse(&Self::every_secs_expression(secs))
    }

    /// Lower an integer interval to the canonical expression.
    pub fn every_secs_expression(secs: u64) -> String {
        format!("@every {secs}s")
    }

    /// The expression as the caller wrote it (trimmed). This is what is
    /// persisted.
    pub fn expression(&self) -> &str {
        match self {
            Recurrence::Every { expression, .. } | Recurrence::Cron { expression, .. } => {
                expression
            }
        }
    }

    /// Compute the next firing strictly after `from`.
    ///
    /// Returns `None` once a cron schedule is exhausted (e.g. a year field in
    /// the past).
    pub fn next_after(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Recurrence::Every { interval, .. } => {
                from.checked_add_signed(chrono::Duration::from_std(*interval).ok()?)
            }
            Recurrence::Cron { schedule, .. } => schedule.after(&from).next(),
        }
    }
}

impl PartialEq for Recurrence {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Recurrence::Every { interval: a, .. }, Recurrence::Every { interval: b, .. }) => {
                a == b
            }
            (
                Recurrence::Cron { normalized: a, .. },
                Recurrence::Cron { normalized: b, .. },
            ) => a == b,
            _ => false,
        }
    }
}

impl fmt::Debug for Recurrence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Recurrence::Every { interval, .. } => write!(f, "Every({interval:?})"),
            Recurrence::Cron { normalized, .. } => write!(f, "Cron({normalized})"),
        }
    }
}

impl fmt::Display for Recurrence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.expression())
    }
}

impl FromStr for Recurrence {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

fn descriptor(expr: &str) -> Option<&'static str> {
    Some(match expr {
        "@yearly" | "@annually" => "0 0 0 1 1 *",
        "@monthly" => "0 0 0 1 * *",
        "@weekly" => "0 0 0 * * Sun",
        "@daily" | "@midnight" => "0 0 0 * * *",
        "@hourly" => "0 0 * * * *",
        _ => return None,
    })
}

/// Parse `1h30m`, `90s`, `250ms`… into a duration.
fn parse_duration(input: &str) -> std::result::Result<Duration, String> {
    if input.is_empty() {
        return Err("missing duration after @every".to_string());
    }

    let mut total = Duration::ZERO;
    let mut rest = input;
    while !rest.is_empty() {
        let digits = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
        if digits == 0 {
            return Err(format!("expected a number in duration {input:?}"));
        }
        let value: u64 = rest[..digits]
            .parse()
            .map_err(|_| format!("number out of range in duration {input:?}"))?;
        rest = &rest[digits..];

        let unit_len = rest.find(|c: char| c.is_ascii_digit()).unwrap_or(rest.len());
        let part = match &rest[..unit_len] {
            "ms" => Duration::from_millis(value),
            "s" => Duration::from_secs(value),
            "m" => Duration::from_secs(value.saturating_mul(60)),
            "h" => Duration::from_secs(value.saturating_mul(3600)),
            "" => return Err(format!("missing unit in duration {input:?}")),
            other => return Err(format!("unknown unit {other:?} in duration {input:?}")),
        };
        rest = &rest[unit_len..];
        total = total
            .checked_add(part)
            .ok_or_else(|| format!("duration {input:?} overflows"))?;
    }
    Ok(total)
}

/// Renumber a crontab day-of-week field (Sunday = 0 or 7) into the cron
/// parser's numbering (Sunday = 1 … Saturday = 7). Names pass through.
fn standard_day_of_week(field: &str) -> std::result::Result<String, String> {
    let shift = |s: &str| -> std::result::Result<String, String> {
        if !s.chars().all(|c| c.is_ascii_digit()) {
            return Ok(s.to_string());
        }
        match s.parse::<u8>() {
            Ok(n @ 0..=6) => Ok((n + 1).to_string()),
            Ok(7) => Ok("1".to_string()),
            _ => Err(format!("day-of-week {s:?} out of range")),
        }
    };

    let mut items = Vec::new();
    for item in field.split(',') {
        let (base, step) = match item.split_once('/') {
            Some((base, step)) => (base, Some(step)),
            None => (item, None),
        };
        let suffix = step.map(|s| format!("/{s}")).unwrap_or_default();
        match base.split_once('-') {
            // `5-7` covers Friday through Sunday, which wraps in the new numbering.
            Some((lo, "7")) if step.is_none() => {
                items.push(format!("{}-7", shift(lo)?));
                items.push("1".to_string());
            }
            Some((lo, hi)) => items.push(format!("{}-{}{suffix}", shift(lo)?, shift(hi)?)),
            None => items.push(format!("{}{suffix}", shift(base)?)),
        }
    }
    Ok(items.join(","))
}

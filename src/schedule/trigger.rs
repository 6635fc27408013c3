use crate::core::{Result, SignalError};
use chrono::{NaiveDateTime, NaiveTime, TimeDelta, Timelike};
use std::fmt;

/// When a re-dispatch entry fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Every day at `hour:minute`.
    DailyAt { hour: u32, minute: u32 },
    /// Every hour at `minute` past.
    HourlyAt { minute: u32 },
    /// Every `n` seconds.
    EverySeconds(u32),
}

impl Trigger {
    /// The first firing strictly after `now`.
    pub fn next_after(&self, now: NaiveDateTime) -> NaiveDateTime {
        match *self {
            Trigger::DailyAt { hour, minute } => {
                let at = NaiveTime::from_hms_opt(hour, minute, 0).unwrap_or(NaiveTime::MIN);
                let today = now.date().and_time(at);
                if today > now {
                    today
                } else {
                    today + TimeDelta::days(1)
                }
            }
            Trigger::HourlyAt { minute } => {
                let this_hour = now
                    .date()
                    .and_hms_opt(now.hour(), minute, 0)
                    .unwrap_or(now);
                if this_hour > now {
                    this_hour
                } else {
                    this_hour + TimeDelta::hours(1)
                }
            }
            Trigger::EverySeconds(seconds) => now + TimeDelta::seconds(i64::from(seconds.max(1))),
        }
    }

    fn unit(&self) -> &'static str {
        match self {
            Trigger::DailyAt { .. } => "EveryDays",
            Trigger::HourlyAt { .. } => "EveryHours",
            Trigger::EverySeconds(_) => "EverySeconds",
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trigger::DailyAt { hour, minute } => {
                write!(f, "{} at {:02}:{:02}", self.unit(), hour, minute)
            }
            Trigger::HourlyAt { minute } => write!(f, "{} at {}", self.unit(), minute),
            Trigger::EverySeconds(seconds) => write!(f, "{} at {}", self.unit(), seconds),
        }
    }
}

/// One `(targetStatus, trigger)` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleEntry {
    pub target_status: String,
    pub trigger: Trigger,
}

/// Accepted entries plus a message for each rejected one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScheduleTable {
    pub entries: Vec<ScheduleEntry>,
    pub errors: Vec<String>,
}

impl ScheduleTable {
    /// Parses `targetStatus \t unit \t param` lines. The param is a comma
    /// list (`08:30,17:00`, `0,30` or `15`) and yields one entry per item.
    pub fn parse<S: AsRef<str>>(lines: &[S]) -> Self {
        let mut table = Self::default();
        if lines.is_empty() {
            table.errors.push("No schedule lines".to_string());
            return table;
        }

        for line in lines {
            let line = line.as_ref();
            if line.trim().is_empty() {
                table.errors.push("Empty line".to_string());
                continue;
            }
            let cols: Vec<&str> = line.split('\t').collect();
            if cols.len() < 3 {
                table.errors.push(format!("Invalid format -> {}", line));
                continue;
            }

            let target_status = cols[0].trim();
            for item in parse_param(cols[1].trim(), cols[2]) {
                match item {
                    Ok(trigger) => table.entries.push(ScheduleEntry {
                        target_status: target_status.to_string(),
                        trigger,
                    }),
                    Err(err) => table.errors.push(match err {
                        SignalError::ScheduleError(msg) => msg,
                        other => other.to_string(),
                    }),
                }
            }
        }
        table
    }

    /// One line per entry, rejected ones prefixed with `ERROR:`.
    pub fn descriptions(&self) -> Vec<String> {
        self.entries
            .iter()
            .map(|e| format!("{}: {}", e.target_status, e.trigger))
            .chain(self.errors.iter().map(|e| format!("ERROR: {}", e)))
            .collect()
    }
}

fn parse_param(unit: &str, param: &str) -> Vec<Result<Trigger>> {
    let label = match unit {
        "EveryDays" => "time",
        "EveryHours" => "minute",
        "EverySeconds" => "seconds",
        other => {
            return vec![Err(SignalError::ScheduleError(format!(
                "Unknown interval unit '{}'",
                other
            )))];
        }
    };
    if param.trim().is_empty() {
        return vec![Err(SignalError::ScheduleError(format!(
            "Empty {} list",
            label
        )))];
    }

    param
        .split(',')
        .map(|item| {
            let item = item.trim();
            let parsed = match unit {
                "EveryDays" => parse_hour_minute(item),
                "EveryHours" => item
                    .parse::<u32>()
                    .ok()
                    .filter(|m| *m < 60)
                    .map(|minute| Trigger::HourlyAt { minute }),
                _ => item
                    .parse::<u32>()
                    .ok()
                    .filter(|s| *s > 0)
                    .map(Trigger::EverySeconds),
            };
            parsed.ok_or_else(|| {
                SignalError::ScheduleError(format!("Invalid {} -> {}", label, item))
            })
        })
        .collect()
}

fn parse_hour_minute(text: &str) -> Option<Trigger> {
    let (h, m) = text.split_once(':')?;
    let hour: u32 = h.trim().parse().ok()?;
    let minute: u32 = m.trim().parse().ok()?;
    (hour < 24 && minute < 60).then_some(Trigger::DailyAt { hour, minute })
}

//! Cron scheduling for backup targets.
//!
//! Each target gets one [`Schedule`] entry holding its parsed expression and
//! the next instant it should fire. Next-fire times are always recomputed from
//! the expression relative to "now", so a daemon that was down (or a loop that
//! woke late) fires once and moves on instead of replaying missed runs.

use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use crate::core::models::BackupTarget;
use crate::error::ConfigError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FireEvent {
    pub target_id: String,
    pub fire_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UpcomingFire {
    pub target_id: String,
    pub expression: String,
    pub next_fire: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
enum Schedule {
    Active {
        cron: cron::Schedule,
        next_fire: Option<DateTime<Utc>>,
    },
    /// The expression did not parse; the target never fires.
    Ineligible { error: ConfigError },
}

#[derive(Debug, Clone)]
struct Entry {
    expression: String,
    schedule: Schedule,
}

#[derive(Debug, Default)]
pub struct Scheduler {
    entries: BTreeMap<String, Entry>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Align entries with the current target set.
    ///
    /// New targets and targets whose expression changed are computed from
    /// `now`; untouched targets keep their pending fire. Returns the targets
    /// that became ineligible during this call.
    pub fn sync(
        &mut self,
        targets: &[Arc<BackupTarget>],
        now: DateTime<Utc>,
    ) -> Vec<(String, ConfigError)> {
        let wanted: BTreeSet<&str> = targets.iter().map(|t| t.id.as_str()).collect();
        self.entries.retain(|id, _| wanted.contains(id.as_str()));

        let mut rejected = Vec::new();
        for target in targets {
            if let Some(entry) = self.entries.get(&target.id) {
                if entry.expression == target.schedule {
                    continue;
                }
            }

            let schedule = match parse_schedule(&target.schedule) {
                Ok(cron) => {
                    let next_fire = next_after(&cron, now);
                    debug!(target_id = %target.id, next_fire = ?next_fire, "Scheduled target");
                    Schedule::Active { cron, next_fire }
                }
                Err(error) => {
                    warn!(
                        target_id = %target.id,
                        error = %error,
                        "Target has an invalid schedule and will never fire"
                    );
                    rejected.push((target.id.clone(), error.clone()));
                    Schedule::Ineligible { error }
                }
            };

            self.entries.insert(
                target.id.clone(),
                Entry {
                    expression: target.schedule.clone(),
                    schedule,
                },
            );
        }
        rejected
    }

    /// All fires due at or before `now`, ordered by fire time.
    ///
    /// Every returned schedule is advanced to its first instant strictly after
    /// `now`, so several missed instants collapse into a single event.
    pub fn next_events(&mut self, now: DateTime<Utc>) -> Vec<FireEvent> {
        let mut events = Vec::new();

        for (id, entry) in self.entries.iter_mut() {
            if let Schedule::Active { cron, next_fire } = &mut entry.schedule {
                if let Some(fire_time) = *next_fire {
                    if fire_time <= now {
                        events.push(FireEvent {
                            target_id: id.clone(),
                            fire_time,
                        });
                        *next_fire = next_after(cron, now);
                    }
                }
            }
        }

        events.sort_by(|a, b| {
            a.fire_time
                .cmp(&b.fire_time)
                .then_with(|| a.target_id.cmp(&b.target_id))
        });
        events
    }

    /// Earliest pending fire across all eligible targets.
    pub fn next_wakeup(&self) -> Option<DateTime<Utc>> {
        self.entries
            .values()
            .filter_map(|e| match &e.schedule {
                Schedule::Active { next_fire, .. } => *next_fire,
                Schedule::Ineligible { .. } => None,
            })
            .min()
    }

    pub fn upcoming(&self) -> Vec<UpcomingFire> {
        self.entries
            .iter()
            .map(|(id, entry)| {
                let (next_fire, error) = match &entry.schedule {
                    Schedule::Active { next_fire, .. } => (*next_fire, None),
                    Schedule::Ineligible { error } => (None, Some(error.to_string())),
                };
                UpcomingFire {
                    target_id: id.clone(),
                    expression: entry.expression.clone(),
                    next_fire,
                    error,
                }
            })
            .collect()
    }

    pub fn ineligible(&self) -> Vec<(String, ConfigError)> {
        self.entries
            .iter()
            .filter_map(|(id, entry)| match &entry.schedule {
                Schedule::Ineligible { error } => Some((id.clone(), error.clone())),
                Schedule::Active { .. } => None,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Parse a 5-field (`min hour dom month dow`) or 6-field (leading seconds)
/// cron expression with Unix day-of-week numbering.
pub fn parse_schedule(expression: &str) -> Result<cron::Schedule, ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidSchedule {
        expression: expression.to_string(),
        reason,
    };

    let normalized = normalize_expression(expression).map_err(invalid)?;
    cron::Schedule::from_str(&normalized).map_err(|e| invalid(e.to_string()))
}

pub fn next_after(schedule: &cron::Schedule, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    schedule.after(&after).next()
}

fn normalize_expression(expression: &str) -> Result<String, String> {
    let fields: Vec<&str> = expression.split_whitespace().collect();
    let mut fields: Vec<String> = match fields.len() {
        5 => std::iter::once("0")
            .chain(fields)
            .map(str::to_string)
            .collect(),
        6 => fields.into_iter().map(str::to_string).collect(),
        n => return Err(format!("expected 5 or 6 fields, found {}", n)),
    };

    fields[5] = normalize_day_of_week(&fields[5])?;
    Ok(fields.join(" "))
}

/// Rewrite Unix day-of-week values (0-7, Sunday is 0 and 7, or day names)
/// into the 1-7 numbering used by the `cron` crate (Sunday is 1).
///
/// Names and numbers resolve the same way, so mixed ranges like `1-FRI`
/// mean Monday to Friday.
fn normalize_day_of_week(field: &str) -> Result<String, String> {
    if field == "*" || field == "?" {
        return Ok(field.to_string());
    }

    let mut days = BTreeSet::new();

    for item in field.split(',') {
        let (base, step) = match item.split_once('/') {
            Some((base, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| format!("invalid day-of-week step '{}'", item))?;
                if step == 0 {
                    return Err(format!("day-of-week step must be positive in '{}'", item));
                }
                (base, Some(step))
            }
            None => (item, None),
        };

        let (start, end) = if base == "*" {
            (0, 6)
        } else if let Some((a, b)) = base.split_once('-') {
            (parse_day(a)?, parse_day(b)?)
        } else {
            let day = parse_day(base)?;
            // `n/step` runs from n to the end of the week
            (day, if step.is_some() { 6 } else { day })
        };

        if start > end {
            return Err(format!("day-of-week range '{}' is reversed", item));
        }

        for day in (start..=end).step_by(step.unwrap_or(1) as usize) {
            days.insert(day % 7 + 1);
        }
    }

    let parts: Vec<String> = days.into_iter().map(|d| d.to_string()).collect();
    Ok(parts.join(","))
}

const DAY_NAMES: [&str; 7] = [
    "SUNDAY",
    "MONDAY",
    "TUESDAY",
    "WEDNESDAY",
    "THURSDAY",
    "FRIDAY",
    "SATURDAY",
];

fn parse_day(value: &str) -> Result<u32, String> {
    if value.chars().any(|c| c.is_ascii_alphabetic()) {
        let upper = value.to_ascii_uppercase();
        return DAY_NAMES
            .iter()
            .position(|name| upper.len() >= 3 && name.starts_with(upper.as_str()))
            .map(|day| day as u32)
            .ok_or_else(|| format!("invalid day-of-week '{}'", value));
    }

    let day: u32 = value
        .parse()
        .map_err(|_| format!("invalid day-of-week '{}'", value))?;
    if day > 7 {
        return Err(format!("day-of-week '{}' out of range 0-7", day));
    }
    Ok(day)
}

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("schedule must have five fields (minute hour day-of-month month day-of-week), got {0}")]
    WrongFieldCount(usize),

    #[error("schedule field {field} has invalid value {value}")]
    InvalidField { field: &'static str, value: String },

    #[error(
        "schedule runs every {minutes} minute(s) but source {source_name} does not support \
         continuous syncing; the minimum interval is one hour"
    )]
    TooFrequent { minutes: u64, source_name: String },
}

const FIELD_NAMES: [&str; 5] = ["minute", "hour", "day-of-month", "month", "day-of-week"];
const FIELD_RANGES: [(u32, u32); 5] = [(0, 59), (0, 23), (1, 31), (1, 12), (0, 6)];

/// A five-field cron expression, parsed just far enough to validate it and
/// to bound how often it can fire. Actual firing is the scheduler layer's
/// business.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schedule {
    fields: [CronField; 5],
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum CronField {
    Any,
    Step(u32),
    Values(Vec<u32>),
}

impl Schedule {
    pub fn parse(expr: &str) -> Result<Self, ScheduleError> {
        let raw: Vec<&str> = expr.split_whitespace().collect();
        if raw.len() != 5 {
            return Err(ScheduleError::WrongFieldCount(raw.len()));
        }

        let mut fields = Vec::with_capacity(5);
        for (index, part) in raw.iter().enumerate() {
            fields.push(parse_field(part, index)?);
        }
        Ok(Self {
            fields: fields.try_into().expect("exactly five fields parsed"),
        })
    }

    /// A lower bound on minutes between firings. `* * * * *` is one
    /// minute; `*/15 ...` is fifteen; anything with fixed minutes fires at
    /// most once per hour.
    pub fn min_interval_minutes(&self) -> u64 {
        match &self.fields[0] {
            CronField::Any => 1,
            CronField::Step(step) => *step as u64,
            CronField::Values(values) if values.len() > 1 => {
                // Conservative: the closest pair of listed minutes.
                let mut sorted = values.clone();
                sorted.sort_unstable();
                let mut min_gap = 60 - (sorted[sorted.len() - 1] - sorted[0]);
                for pair in sorted.windows(2) {
                    min_gap = min_gap.min(pair[1] - pair[0]);
                }
                min_gap as u64
            }
            CronField::Values(_) => 60,
        }
    }
}

fn parse_field(part: &str, index: usize) -> Result<CronField, ScheduleError> {
    let (low, high) = FIELD_RANGES[index];
    let invalid = || ScheduleError::InvalidField {
        field: FIELD_NAMES[index],
        value: part.to_string(),
    };

    if part == "*" {
        return Ok(CronField::Any);
    }
    if let Some(step) = part.strip_prefix("*/") {
        let step: u32 = step.parse().map_err(|_| invalid())?;
        if step == 0 || step > high - low + 1 {
            return Err(invalid());
        }
        return Ok(CronField::Step(step));
    }

    let mut values = Vec::new();
    for piece in part.split(',') {
        if let Some((start, end)) = piece.split_once('-') {
            let start: u32 = start.parse().map_err(|_| invalid())?;
            let end: u32 = end.parse().map_err(|_| invalid())?;
            if start > end || start < low || end > high {
                return Err(invalid());
            }
            values.extend(start..=end);
        } else {
            let value: u32 = piece.parse().map_err(|_| invalid())?;
            if value < low || value > high {
                return Err(invalid());
            }
            values.push(value);
        }
    }
    if values.is_empty() {
        return Err(invalid());
    }
    Ok(CronField::Values(values))
}

/// Gate sub-hourly schedules on the connector's declared support for
/// continuous syncing.
pub fn validate_schedule(
    expr: &str,
    source_kind: &str,
    supports_continuous: bool,
) -> Result<Schedule, ScheduleError> {
    let schedule = Schedule::parse(expr)?;
    let minutes = schedule.min_interval_minutes();
    if minutes < 60 && !supports_continuous {
        return Err(ScheduleError::TooFrequent {
            minutes,
            source_name: source_kind.to_string(),
        });
    }
    Ok(schedule)
}

//! ==============================================================================
//! domain.rs - payload schema and sheet rows
//! ==============================================================================
//!
//! purpose:
//!     the two payload kinds the gateway posts (raw samples and daily
//!     summaries), the cell values a sheet row is made of, and the fixed
//!     column orders both sheet kinds use.
//!
//! null policy:
//!     every sensor field is optional. an absent or null field becomes
//!     CellValue::Empty at row construction time, never a missing column,
//!     so the columns of every row line up with the template header.
//!
//! ==============================================================================

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::Deserialize;
use std::fmt;

use crate::error::IngestError;

/// header row of a RAW template, in append order
pub const RAW_COLUMNS: [&str; 12] = [
    "timestamp",
    "inside_temp_f",
    "inside_humidity_rh",
    "inside_brightness_lux",
    "outside_brightness_raw",
    "cloud_coverage_pct",
    "circulation_fan_pwm",
    "exhaust_fan_pwm",
    "grow_light_pwm",
    "intent_window",
    "control_mode",
    "control_reason",
];

/// header row of a SUMMARY template, in append order
pub const SUMMARY_COLUMNS: [&str; 10] = [
    "date",
    "season_state",
    "avg_temp_f",
    "min_temp_f",
    "max_temp_f",
    "avg_humidity_rh",
    "total_light_minutes",
    "total_exhaust_minutes",
    "total_circulation_minutes",
    "notes",
];

/// format used for sheet-name dates
pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// format used when a timestamp cell is written out
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

// ==============================================================================
// sheet kinds
// ==============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SheetKind {
    Raw,
    Summary,
}

impl SheetKind {
    pub fn suffix(self) -> &'static str {
        match self {
            SheetKind::Raw => "RAW",
            SheetKind::Summary => "SUMMARY",
        }
    }

    /// name of the per-date sheet, e.g. "2024-03-01 RAW"
    pub fn sheet_name(self, date: &str) -> String {
        format!("{} {}", date, self.suffix())
    }
}

impl fmt::Display for SheetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.suffix())
    }
}

// ==============================================================================
// cells
// ==============================================================================

/// a json scalar exactly as the gateway sent it
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Bool(bool),
    Number(serde_json::Number),
    Text(String),
    /// arrays and objects are kept as their json text
    Other(serde_json::Value),
}

/// one cell of an appended row
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    /// the empty-string sentinel for absent values
    Empty,
    Number(serde_json::Number),
    Text(String),
    Bool(bool),
    Timestamp(DateTime<Tz>),
}

impl CellValue {
    pub fn is_empty(&self) -> bool {
        matches!(self, CellValue::Empty)
    }
}

impl From<&Scalar> for CellValue {
    fn from(value: &Scalar) -> Self {
        match value {
            Scalar::Bool(b) => CellValue::Bool(*b),
            Scalar::Number(n) => CellValue::Number(n.clone()),
            Scalar::Text(s) => CellValue::Text(s.clone()),
            Scalar::Other(v) => CellValue::Text(v.to_string()),
        }
    }
}

impl fmt::Display for CellValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CellValue::Empty => Ok(()),
            CellValue::Number(n) => write!(f, "{}", n),
            CellValue::Text(s) => f.write_str(s),
            CellValue::Bool(true) => f.write_str("TRUE"),
            CellValue::Bool(false) => f.write_str("FALSE"),
            CellValue::Timestamp(ts) => write!(f, "{}", ts.format(TIMESTAMP_FORMAT)),
        }
    }
}

/// sentinel substitution: absent/null -> Empty, anything else verbatim
pub fn cell_or_empty(value: &Option<Scalar>) -> CellValue {
    value.as_ref().map(CellValue::from).unwrap_or(CellValue::Empty)
}

// ==============================================================================
// payloads
// ==============================================================================

/// one sensor sample. unknown fields are ignored.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawSample {
    pub local_time: Option<Scalar>,
    pub inside_temp_f: Option<Scalar>,
    pub inside_humidity_rh: Option<Scalar>,
    pub inside_brightness_lux: Option<Scalar>,
    pub outside_brightness_raw: Option<Scalar>,
    pub cloud_coverage_pct: Option<Scalar>,
    pub circulation_fan_pwm: Option<Scalar>,
    pub exhaust_fan_pwm: Option<Scalar>,
    pub grow_light_pwm: Option<Scalar>,
    pub intent_window: Option<Scalar>,
    pub control_mode: Option<Scalar>,
    pub control_reason: Option<Scalar>,
}

/// one aggregate row per calendar date
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DailySummary {
    pub date: Option<String>,
    pub season_state: Option<Scalar>,
    pub avg_temp_f: Option<Scalar>,
    pub min_temp_f: Option<Scalar>,
    pub max_temp_f: Option<Scalar>,
    pub avg_humidity_rh: Option<Scalar>,
    pub total_light_minutes: Option<Scalar>,
    pub total_exhaust_minutes: Option<Scalar>,
    pub total_circulation_minutes: Option<Scalar>,
    pub notes: Option<Scalar>,
}

#[derive(Debug, Clone)]
pub enum Payload {
    Summary(DailySummary),
    Sample(RawSample),
}

impl Payload {
    /// parse a request body. `type == "summary"` selects the summary
    /// schema; any other or missing `type` is a raw sample.
    pub fn from_slice(body: &[u8]) -> Result<Self, IngestError> {
        let value: serde_json::Value = serde_json::from_slice(body)?;
        if !value.is_object() {
            return Err(IngestError::NotAnObject);
        }

        let is_summary = value.get("type").and_then(|t| t.as_str()) == Some("summary");
        if is_summary {
            Ok(Payload::Summary(serde_json::from_value(value)?))
        } else {
            Ok(Payload::Sample(serde_json::from_value(value)?))
        }
    }
}

impl RawSample {
    /// the 12 RAW columns with `timestamp` in front
    pub fn to_row(&self, timestamp: CellValue) -> Vec<CellValue> {
        vec![
            timestamp,
            cell_or_empty(&self.inside_temp_f),
            cell_or_empty(&self.inside_humidity_rh),
            cell_or_empty(&self.inside_brightness_lux),
            cell_or_empty(&self.outside_brightness_raw),
            cell_or_empty(&self.cloud_coverage_pct),
            cell_or_empty(&self.circulation_fan_pwm),
            cell_or_empty(&self.exhaust_fan_pwm),
            cell_or_empty(&self.grow_light_pwm),
            cell_or_empty(&self.intent_window),
            cell_or_empty(&self.control_mode),
            cell_or_empty(&self.control_reason),
        ]
    }

    /// resolve the row timestamp.
    ///
    /// a missing or falsy `local_time` (null, "", 0, false) means "now".
    /// text is parsed in `tz`; any other number is epoch milliseconds.
    /// anything that does not parse is kept verbatim so the sample is not lost.
    pub fn timestamp_cell(&self, now: DateTime<Tz>, tz: Tz) -> CellValue {
        match &self.local_time {
            None => CellValue::Timestamp(now),
            Some(Scalar::Text(s)) if s.trim().is_empty() => CellValue::Timestamp(now),
            Some(Scalar::Bool(false)) => CellValue::Timestamp(now),
            Some(Scalar::Number(n)) if n.as_f64() == Some(0.0) => CellValue::Timestamp(now),
            Some(Scalar::Text(s)) => parse_local_time(s, tz)
                .map(CellValue::Timestamp)
                .unwrap_or_else(|| CellValue::Text(s.clone())),
            Some(Scalar::Number(n)) => n
                .as_i64()
                .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
                .map(|utc| CellValue::Timestamp(utc.with_timezone(&tz)))
                .unwrap_or_else(|| CellValue::Number(n.clone())),
            Some(other) => CellValue::from(other),
        }
    }
}

impl DailySummary {
    /// the 10 SUMMARY columns for `date`
    pub fn to_row(&self, date: &str) -> Vec<CellValue> {
        vec![
            CellValue::Text(date.to_string()),
            cell_or_empty(&self.season_state),
            cell_or_empty(&self.avg_temp_f),
            cell_or_empty(&self.min_temp_f),
            cell_or_empty(&self.max_temp_f),
            cell_or_empty(&self.avg_humidity_rh),
            cell_or_empty(&self.total_light_minutes),
            cell_or_empty(&self.total_exhaust_minutes),
            cell_or_empty(&self.total_circulation_minutes),
            cell_or_empty(&self.notes),
        ]
    }
}

/// parse the gateway's `local_time`.
///
/// accepts rfc3339 (offset honoured), naive iso date-times with `T` or a
/// space (interpreted in `tz`), and bare dates (local midnight).
pub fn parse_local_time(input: &str, tz: Tz) -> Option<DateTime<Tz>> {
    let input = input.trim();

    if let Ok(dt) = DateTime::parse_from_rfc3339(input) {
        return Some(dt.with_timezone(&tz));
    }

    const NAIVE_FORMATS: [&str; 4] = [
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M",
        "%Y-%m-%d %H:%M",
    ];
    let naive = NAIVE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(input, fmt).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(input, DATE_FORMAT)
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })?;

    // a gap at a DST transition has no local instant; take the earliest
    // valid mapping for folds
    tz.from_local_datetime(&naive).earliest()
}

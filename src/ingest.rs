//! ==============================================================================
//! ingest.rs - the POST handler logic
//! ==============================================================================
//!
//! purpose:
//!     turns one request body into at most one appended row.
//!
//! flow:
//! ```text
//!     body zero-length?      -> "ERROR: No data"
//!     parse json             -> Payload::Summary | Payload::Sample
//!     summary:  date = payload.date
//!     sample:   date = now in the spreadsheet timezone
//!     provisioner.ensure(date)
//!     resolve "<date> SUMMARY" / "<date> RAW"  (missing = fatal)
//!     summary already has a data row?  -> "OK", nothing appended
//!     append row                       -> "OK"
//!
//!     every error is caught in `handle`, logged, and returned as
//!     "ERROR: <description>". nothing escapes to the transport.
//! ```
//!
//! ==============================================================================

use std::fmt;
use std::sync::Arc;

use chrono_tz::Tz;
use tracing::{error, info};

use crate::clock::Clock;
use crate::domain::{DailySummary, Payload, RawSample, SheetKind, DATE_FORMAT};
use crate::error::IngestError;
use crate::provision::{ProvisionOutcome, SheetProvisioner};
use crate::sheets::SheetStore;

/// the plain-text reply sent back to the gateway
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestReply {
    Ok,
    NoData,
    Error(String),
}

impl fmt::Display for IngestReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IngestReply::Ok => f.write_str("OK"),
            IngestReply::NoData => f.write_str("ERROR: No data"),
            IngestReply::Error(message) => write!(f, "ERROR: {}", message),
        }
    }
}

/// what a successful call did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ingested {
    Appended { sheet: String },
    DuplicateSummary { sheet: String },
}

pub struct IngestHandler {
    provisioner: SheetProvisioner,
    sheets: Arc<dyn SheetStore>,
    clock: Arc<dyn Clock>,
    timezone: Tz,
}

impl IngestHandler {
    pub fn new(
        provisioner: SheetProvisioner,
        sheets: Arc<dyn SheetStore>,
        clock: Arc<dyn Clock>,
        timezone: Tz,
    ) -> Self {
        Self {
            provisioner,
            sheets,
            clock,
            timezone,
        }
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    /// single error boundary: never panics on bad input, never returns Err
    pub fn handle(&self, body: &[u8]) -> IngestReply {
        if body.is_empty() {
            return IngestReply::NoData;
        }

        match self.process(body) {
            Ok(_) => IngestReply::Ok,
            Err(err) => {
                error!(error = %err, details = ?err, "ingest failed");
                IngestReply::Error(err.to_string())
            }
        }
    }

    pub fn process(&self, body: &[u8]) -> Result<Ingested, IngestError> {
        match Payload::from_slice(body)? {
            Payload::Summary(summary) => self.record_summary(&summary),
            Payload::Sample(sample) => self.record_sample(&sample),
        }
    }

    fn provision(&self, date: &str) -> Result<(), IngestError> {
        match self.provisioner.ensure(date)? {
            ProvisionOutcome::Provisioned { created } if !created.is_empty() => {
                info!(date = %date, created = ?created, "daily sheets provisioned");
            }
            // a skipped setup only matters if the sheet turns out to be
            // missing, which resolve_sheet reports
            _ => {}
        }
        Ok(())
    }

    fn resolve_sheet(&self, date: &str, kind: SheetKind) -> Result<String, IngestError> {
        let name = kind.sheet_name(date);
        if !self.sheets.has_sheet(&name)? {
            return Err(IngestError::SheetMissing { kind, name });
        }
        Ok(name)
    }

    fn record_summary(&self, summary: &DailySummary) -> Result<Ingested, IngestError> {
        let date = summary
            .date
            .as_deref()
            .filter(|d| !d.is_empty())
            .ok_or(IngestError::MissingDate)?;

        self.provision(date)?;
        let sheet = self.resolve_sheet(date, SheetKind::Summary)?;

        let header_rows = self.provisioner.layout().summary_header_rows;
        if self.sheets.row_count(&sheet)? > header_rows {
            info!(date = %date, "summary already exists, not appending");
            return Ok(Ingested::DuplicateSummary { sheet });
        }

        self.sheets.append_row(&sheet, &summary.to_row(date))?;
        info!(sheet = %sheet, "summary recorded");
        Ok(Ingested::Appended { sheet })
    }

    fn record_sample(&self, sample: &RawSample) -> Result<Ingested, IngestError> {
        let now = self.clock.now().with_timezone(&self.timezone);
        let date = now.format(DATE_FORMAT).to_string();

        self.provision(&date)?;
        let sheet = self.resolve_sheet(&date, SheetKind::Raw)?;

        let timestamp = sample.timestamp_cell(now, self.timezone);
        self.sheets.append_row(&sheet, &sample.to_row(timestamp))?;
        tracing::debug!(sheet = %sheet, "sample recorded");
        Ok(Ingested::Appended { sheet })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::provision::SheetLayout;
    use crate::sheets::MemoryWorkbook;
    use crate::state::{lock_with_timeout, MemoryProperties, ProcessLock};
    use chrono::{TimeZone, Utc};
    use std::time::Duration;

    struct Fixture {
        book: Arc<MemoryWorkbook>,
        lock: Arc<ProcessLock>,
        clock: Arc<FixedClock>,
        handler: IngestHandler,
    }

    // 2024-03-01 09:30 in New York
    fn fixture() -> Fixture {
        let book = Arc::new(MemoryWorkbook::new());
        let lock = Arc::new(ProcessLock::new());
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2024, 3, 1, 14, 30, 0).unwrap(),
        ));
        let provisioner = SheetProvisioner::new(
            book.clone(),
            Arc::new(MemoryProperties::new()),
            lock.clone(),
            SheetLayout::default(),
        )
        .with_lock_wait(Duration::from_millis(20));
        provisioner.seed_templates().unwrap();

        let handler = IngestHandler::new(
            provisioner,
            book.clone(),
            clock.clone(),
            chrono_tz::America::New_York,
        );
        Fixture {
            book,
            lock,
            clock,
            handler,
        }
    }

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn raw_sample_with_missing_fields() {
        let f = fixture();
        let reply = f.handler.handle(br#"{"inside_temp_f":72.5,"control_mode":"auto"}"#);
        assert_eq!(reply.to_string(), "OK");

        let rows = f.book.rows("2024-03-01 RAW").unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(
            rows[1],
            strings(&["2024-03-01 09:30:00", "72.5", "", "", "", "", "", "", "", "", "auto", ""])
        );
    }

    #[test]
    fn raw_sample_uses_local_time_when_present() {
        let f = fixture();
        let reply = f
            .handler
            .handle(br#"{"local_time":"2024-03-01T09:00:05.250","inside_humidity_rh":41}"#);
        assert_eq!(reply, IngestReply::Ok);

        let rows = f.book.rows("2024-03-01 RAW").unwrap();
        assert_eq!(rows[1][0], "2024-03-01 09:00:05");
        assert_eq!(rows[1][2], "41");
    }

    #[test]
    fn raw_date_follows_spreadsheet_timezone() {
        let f = fixture();
        // 02:00 UTC on the 2nd is still the 1st in New York
        f.clock.set(Utc.with_ymd_and_hms(2024, 3, 2, 2, 0, 0).unwrap());
        assert_eq!(f.handler.handle(b"{}"), IngestReply::Ok);
        assert!(f.book.has_sheet("2024-03-01 RAW").unwrap());
        assert!(!f.book.has_sheet("2024-03-02 RAW").unwrap());
    }

    #[test]
    fn summary_then_duplicate() {
        let f = fixture();
        let body = br#"{"type":"summary","date":"2024-03-01","avg_temp_f":70.2,"notes":"clear"}"#;

        assert_eq!(f.handler.handle(body).to_string(), "OK");
        let rows = f.book.rows("2024-03-01 SUMMARY").unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(
            rows[1],
            strings(&["2024-03-01", "", "70.2", "", "", "", "", "", "", "clear"])
        );

        assert_eq!(
            f.handler.process(body).unwrap(),
            Ingested::DuplicateSummary {
                sheet: "2024-03-01 SUMMARY".into()
            }
        );
        assert_eq!(f.handler.handle(body).to_string(), "OK");
        assert_eq!(f.book.row_count("2024-03-01 SUMMARY").unwrap(), 2);
    }

    #[test]
    fn summary_for_past_date_provisions_that_date() {
        let f = fixture();
        let body = br#"{"type":"summary","date":"2024-02-28","season_state":"winter"}"#;
        assert_eq!(f.handler.handle(body), IngestReply::Ok);
        assert!(f.book.has_sheet("2024-02-28 RAW").unwrap());
        assert_eq!(f.book.row_count("2024-02-28 SUMMARY").unwrap(), 2);
    }

    #[test]
    fn summary_without_date_is_an_error() {
        let f = fixture();
        let reply = f.handler.handle(br#"{"type":"summary","avg_temp_f":70}"#);
        assert_eq!(reply.to_string(), "ERROR: summary payload missing date");
        assert_eq!(f.book.sheet_names().unwrap().len(), 2);
    }

    #[test]
    fn empty_body_touches_nothing() {
        let f = fixture();
        assert_eq!(f.handler.handle(b"").to_string(), "ERROR: No data");
        assert_eq!(f.book.sheet_names().unwrap().len(), 2);
    }

    #[test]
    fn whitespace_body_is_malformed_not_empty() {
        let f = fixture();
        let reply = f.handler.handle(b"  \n").to_string();
        assert!(reply.starts_with("ERROR: invalid JSON payload"), "{reply}");
        assert_eq!(f.book.sheet_names().unwrap().len(), 2);
    }

    #[test]
    fn summary_dated_like_the_template_leaves_templates_intact() {
        let f = fixture();
        let reply = f
            .handler
            .handle(br#"{"type":"summary","date":"YYYY-MM-DD","avg_temp_f":70}"#);
        assert_eq!(
            reply.to_string(),
            "ERROR: sheet name 'YYYY-MM-DD RAW' is reserved for a template"
        );
        assert_eq!(f.book.row_count("YYYY-MM-DD SUMMARY").unwrap(), 1);
        assert_eq!(f.book.sheet_names().unwrap().len(), 2);

        // provisioning still works afterwards
        assert_eq!(f.handler.handle(br#"{"inside_temp_f":70}"#), IngestReply::Ok);
        assert_eq!(f.book.row_count("2024-03-01 RAW").unwrap(), 2);
    }

    #[test]
    fn malformed_json_is_reported() {
        let f = fixture();
        let reply = f.handler.handle(b"{\"inside_temp_f\":");
        assert!(reply.to_string().starts_with("ERROR: invalid JSON payload"));
        assert_eq!(f.book.sheet_names().unwrap().len(), 2);
    }

    #[test]
    fn lock_contention_surfaces_as_missing_sheet() {
        let f = fixture();
        let _held = lock_with_timeout(f.lock.as_ref(), Duration::ZERO).unwrap();

        let reply = f.handler.handle(br#"{"inside_temp_f":70}"#);
        assert_eq!(reply.to_string(), "ERROR: RAW sheet missing: 2024-03-01 RAW");
    }

    #[test]
    fn missing_templates_are_reported() {
        let book = Arc::new(MemoryWorkbook::new());
        let provisioner = SheetProvisioner::new(
            book.clone(),
            Arc::new(MemoryProperties::new()),
            Arc::new(ProcessLock::new()),
            SheetLayout::default(),
        );
        let handler = IngestHandler::new(
            provisioner,
            book.clone(),
            Arc::new(FixedClock::new(Utc::now())),
            chrono_tz::UTC,
        );

        let reply = handler.handle(b"{}");
        assert_eq!(reply.to_string(), "ERROR: Missing RAW or SUMMARY template sheets");
        assert!(book.sheet_names().unwrap().is_empty());
    }

    #[test]
    fn samples_accumulate_without_reprovisioning() {
        let f = fixture();
        for _ in 0..3 {
            assert_eq!(f.handler.handle(br#"{"exhaust_fan_pwm":128}"#), IngestReply::Ok);
            f.clock.advance(chrono::Duration::minutes(5));
        }
        let rows = f.book.rows("2024-03-01 RAW").unwrap();
        assert_eq!(rows.len(), 4);
        assert_eq!(rows[3][0], "2024-03-01 09:40:00");
        assert_eq!(rows[3][7], "128");
    }
}

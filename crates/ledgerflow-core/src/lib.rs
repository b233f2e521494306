//! Core domain model for the ledger ETL pipeline: windows, targets, tables, job log entries.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "ledgerflow-core";

/// One record as it travels between the query API, enrichment and the warehouse.
pub type Row = Map<String, Value>;

pub const NANOS_PER_SECOND: u64 = 1_000_000_000;

/// Column holding the ledger consensus time (ns, decimal string) in every data table.
pub const CONSENSUS_TIMESTAMP: &str = "consensus_timestamp";

pub fn ns_to_datetime(ns: u64) -> DateTime<Utc> {
    let secs = (ns / NANOS_PER_SECOND) as i64;
    let nanos = (ns % NANOS_PER_SECOND) as u32;
    DateTime::from_timestamp(secs, nanos).unwrap_or_default()
}

pub fn datetime_to_ns(at: DateTime<Utc>) -> u64 {
    at.timestamp_nanos_opt()
        .map(|ns| ns.max(0) as u64)
        .unwrap_or(0)
}

/// ISO-8601 rendering with millisecond precision and a `Z` suffix.
pub fn ns_to_iso8601(ns: u64) -> String {
    ns_to_datetime(ns).to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Reads a nanosecond timestamp that the API may deliver as a JSON string or number.
pub fn ns_from_value(value: &Value) -> Option<u64> {
    match value {
        Value::String(s) => s.trim().parse().ok(),
        Value::Number(n) => n.as_u64(),
        _ => None,
    }
}

/// The `[start_ns, end_ns)` interval a single run is responsible for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeWindow {
    start_ns: u64,
    end_ns: u64,
}

impl TimeWindow {
    /// Returns `None` when `start_ns > end_ns`.
    pub fn new(start_ns: u64, end_ns: u64) -> Option<Self> {
        (start_ns <= end_ns).then_some(Self { start_ns, end_ns })
    }

    /// Like [`TimeWindow::new`] but raises `end_ns` to `start_ns` instead of failing.
    pub fn clamped(start_ns: u64, end_ns: u64) -> Self {
        Self {
            start_ns,
            end_ns: end_ns.max(start_ns),
        }
    }

    pub fn start_ns(&self) -> u64 {
        self.start_ns
    }

    pub fn end_ns(&self) -> u64 {
        self.end_ns
    }

    pub fn start_string(&self) -> String {
        self.start_ns.to_string()
    }

    pub fn end_string(&self) -> String {
        self.end_ns.to_string()
    }

    pub fn is_empty(&self) -> bool {
        self.start_ns == self.end_ns
    }

    pub fn contains(&self, ns: u64) -> bool {
        ns >= self.start_ns && ns < self.end_ns
    }
}

impl fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{} ({}) -> {} ({}))",
            self.start_ns,
            ns_to_iso8601(self.start_ns),
            self.end_ns,
            ns_to_iso8601(self.end_ns)
        )
    }
}

/// Fixed sinks the pipeline addresses by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TableName {
    NewAccounts,
    TransactionHistory,
    JobLog,
}

impl TableName {
    pub const ALL: [TableName; 3] = [
        TableName::NewAccounts,
        TableName::TransactionHistory,
        TableName::JobLog,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TableName::NewAccounts => "new_accounts",
            TableName::TransactionHistory => "transaction_history",
            TableName::JobLog => "job_log",
        }
    }

    pub fn schema(&self) -> TableSchema {
        match self {
            TableName::NewAccounts => new_accounts_schema(),
            TableName::TransactionHistory => transaction_history_schema(),
            TableName::JobLog => job_log_schema(),
        }
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which logical dataset a run ingests. Selected once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineTarget {
    Accounts,
    Transactions,
}

impl PipelineTarget {
    pub const ALL: [PipelineTarget; 2] = [PipelineTarget::Accounts, PipelineTarget::Transactions];

    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineTarget::Accounts => "ACCOUNTS",
            PipelineTarget::Transactions => "TRANSACTIONS",
        }
    }

    /// Data tables written by this target; the job log is never part of the set.
    pub fn data_tables(&self) -> &'static [TableName] {
        match self {
            PipelineTarget::Accounts => &[TableName::NewAccounts],
            PipelineTarget::Transactions => &[TableName::TransactionHistory],
        }
    }

    /// Job log column carrying the rows-added count for this target.
    pub fn count_column(&self) -> &'static str {
        match self {
            PipelineTarget::Accounts => "count_accounts_added",
            PipelineTarget::Transactions => "count_txs_added",
        }
    }
}

impl fmt::Display for PipelineTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown pipeline target {0:?}; expected ACCOUNTS or TRANSACTIONS")]
pub struct UnknownTarget(pub String);

impl FromStr for PipelineTarget {
    type Err = UnknownTarget;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ACCOUNTS" => Ok(PipelineTarget::Accounts),
            "TRANSACTIONS" | "TXS" => Ok(PipelineTarget::Transactions),
            _ => Err(UnknownTarget(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ColumnType {
    String,
    Integer,
    Timestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ColumnMode {
    Required,
    Nullable,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    pub kind: ColumnType,
    pub mode: ColumnMode,
}

impl ColumnSpec {
    pub fn required(name: &str, kind: ColumnType) -> Self {
        Self {
            name: name.to_string(),
            kind,
            mode: ColumnMode::Required,
        }
    }

    pub fn nullable(name: &str, kind: ColumnType) -> Self {
        Self {
            name: name.to_string(),
            kind,
            mode: ColumnMode::Nullable,
        }
    }

    pub fn is_required(&self) -> bool {
        self.mode == ColumnMode::Required
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub columns: Vec<ColumnSpec>,
}

impl TableSchema {
    pub fn new(columns: Vec<ColumnSpec>) -> Self {
        Self { columns }
    }
}

pub fn new_accounts_schema() -> TableSchema {
    use ColumnType as T;
    TableSchema::new(vec![
        ColumnSpec::required("consensus_timestamp", T::String),
        ColumnSpec::required("consensus_timestamp_iso8601", T::Timestamp),
        ColumnSpec::required("id", T::String),
        ColumnSpec::required("entity_id", T::Integer),
        ColumnSpec::required("initial_transfer_amount", T::Integer),
        ColumnSpec::nullable("creation_method", T::String),
        ColumnSpec::nullable("created_at", T::Timestamp),
    ])
}

pub fn transaction_history_schema() -> TableSchema {
    use ColumnType as T;
    TableSchema::new(vec![
        ColumnSpec::required("consensus_timestamp", T::String),
        ColumnSpec::required("consensus_timestamp_iso8601", T::Timestamp),
        ColumnSpec::required("id", T::String),
        ColumnSpec::required("payer_account_id", T::Integer),
        ColumnSpec::required("type", T::Integer),
        ColumnSpec::required("result", T::Integer),
        ColumnSpec::nullable("transaction_type_name", T::String),
        ColumnSpec::nullable("hedera_service", T::String),
        ColumnSpec::nullable("inserted_at", T::Timestamp),
    ])
}

pub fn job_log_schema() -> TableSchema {
    use ColumnType as T;
    TableSchema::new(vec![
        ColumnSpec::required("job_id", T::String),
        ColumnSpec::nullable("pipeline_target", T::String),
        ColumnSpec::required("start_time_ns", T::String),
        ColumnSpec::required("end_time_ns", T::String),
        ColumnSpec::nullable("start_time_iso", T::Timestamp),
        ColumnSpec::nullable("end_time_iso", T::Timestamp),
        ColumnSpec::required("status", T::String),
        ColumnSpec::nullable("message", T::String),
        ColumnSpec::nullable("count_accounts_added", T::Integer),
        ColumnSpec::nullable("count_txs_added", T::Integer),
        ColumnSpec::nullable("logged_at", T::Timestamp),
    ])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Success,
    Error,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Success => "success",
            JobStatus::Error => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RowDecodeError {
    #[error("missing column {0}")]
    MissingColumn(&'static str),
    #[error("column {column} has invalid value {value}")]
    InvalidValue { column: &'static str, value: String },
}

/// Outcome of one run. Append-only: written once, never updated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobLogEntry {
    pub job_id: Uuid,
    pub pipeline_target: Option<PipelineTarget>,
    pub window: TimeWindow,
    pub status: JobStatus,
    pub message: Option<String>,
    pub counts_added: BTreeMap<PipelineTarget, u64>,
    pub logged_at: DateTime<Utc>,
}

impl JobLogEntry {
    pub fn success(
        target: PipelineTarget,
        window: TimeWindow,
        counts_added: BTreeMap<PipelineTarget, u64>,
    ) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            pipeline_target: Some(target),
            window,
            status: JobStatus::Success,
            message: None,
            counts_added,
            logged_at: Utc::now(),
        }
    }

    pub fn error(target: PipelineTarget, window: TimeWindow, message: impl Into<String>) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            pipeline_target: Some(target),
            window,
            status: JobStatus::Error,
            message: Some(message.into()),
            counts_added: BTreeMap::new(),
            logged_at: Utc::now(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == JobStatus::Success
    }

    /// Entries written without a target predate per-target logs and apply to every target.
    pub fn applies_to(&self, target: PipelineTarget) -> bool {
        self.pipeline_target.map_or(true, |t| t == target)
    }

    pub fn to_row(&self) -> Row {
        let mut row = Row::new();
        row.insert("job_id".into(), Value::String(self.job_id.to_string()));
        row.insert(
            "pipeline_target".into(),
            self.pipeline_target
                .map(|t| Value::String(t.as_str().to_string()))
                .unwrap_or(Value::Null),
        );
        row.insert("start_time_ns".into(), Value::String(self.window.start_string()));
        row.insert("end_time_ns".into(), Value::String(self.window.end_string()));
        row.insert(
            "start_time_iso".into(),
            Value::String(ns_to_iso8601(self.window.start_ns())),
        );
        row.insert(
            "end_time_iso".into(),
            Value::String(ns_to_iso8601(self.window.end_ns())),
        );
        row.insert("status".into(), Value::String(self.status.as_str().to_string()));
        row.insert(
            "message".into(),
            self.message.clone().map(Value::String).unwrap_or(Value::Null),
        );
        for target in PipelineTarget::ALL {
            row.insert(
                target.count_column().into(),
                self.counts_added
                    .get(&target)
                    .map(|c| Value::from(*c))
                    .unwrap_or(Value::Null),
            );
        }
        row.insert(
            "logged_at".into(),
            Value::String(self.logged_at.to_rfc3339_opts(SecondsFormat::Millis, true)),
        );
        row
    }

    pub fn from_row(row: &Row) -> Result<Self, RowDecodeError> {
        let job_id_raw = required_str(row, "job_id")?;
        let job_id = Uuid::parse_str(job_id_raw).map_err(|_| RowDecodeError::InvalidValue {
            column: "job_id",
            value: job_id_raw.to_string(),
        })?;

        let pipeline_target = match row.get("pipeline_target") {
            Some(Value::String(s)) => Some(s.parse().map_err(|_| RowDecodeError::InvalidValue {
                column: "pipeline_target",
                value: s.clone(),
            })?),
            _ => None,
        };

        let start_ns = required_ns(row, "start_time_ns")?;
        let end_ns = required_ns(row, "end_time_ns")?;
        let window = TimeWindow::new(start_ns, end_ns).ok_or_else(|| RowDecodeError::InvalidValue {
            column: "end_time_ns",
            value: format!("{end_ns} < start {start_ns}"),
        })?;

        let status = match required_str(row, "status")? {
            "success" => JobStatus::Success,
            "error" => JobStatus::Error,
            other => {
                return Err(RowDecodeError::InvalidValue {
                    column: "status",
                    value: other.to_string(),
                })
            }
        };

        let message = row
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string);

        let mut counts_added = BTreeMap::new();
        for target in PipelineTarget::ALL {
            if let Some(count) = row.get(target.count_column()).and_then(ns_from_value) {
                counts_added.insert(target, count);
            }
        }

        let logged_at = row
            .get("logged_at")
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|| ns_to_datetime(end_ns));

        Ok(Self {
            job_id,
            pipeline_target,
            window,
            status,
            message,
            counts_added,
            logged_at,
        })
    }
}

fn required_str<'a>(row: &'a Row, column: &'static str) -> Result<&'a str, RowDecodeError> {
    row.get(column)
        .and_then(Value::as_str)
        .ok_or(RowDecodeError::MissingColumn(column))
}

fn required_ns(row: &Row, column: &'static str) -> Result<u64, RowDecodeError> {
    let value = row.get(column).ok_or(RowDecodeError::MissingColumn(column))?;
    ns_from_value(value).ok_or_else(|| RowDecodeError::InvalidValue {
        column,
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_rejects_inverted_bounds() {
        assert!(TimeWindow::new(10, 5).is_none());
        let window = TimeWindow::new(5, 5).unwrap();
        assert!(window.is_empty());
        assert!(!window.contains(5));
        assert_eq!(TimeWindow::clamped(10, 5), TimeWindow::new(10, 10).unwrap());
    }

    #[test]
    fn window_is_half_open() {
        let window = TimeWindow::new(100, 200).unwrap();
        assert!(window.contains(100));
        assert!(window.contains(199));
        assert!(!window.contains(200));
    }

    #[test]
    fn nanosecond_timestamps_render_as_iso8601() {
        assert_eq!(ns_to_iso8601(1706745600000000000), "2024-02-01T00:00:00.000Z");
        assert_eq!(
            datetime_to_ns(ns_to_datetime(1706812890529120002)),
            1706812890529120002
        );
    }

    #[test]
    fn ns_values_accept_strings_and_numbers() {
        assert_eq!(ns_from_value(&Value::from("1706812890529120002")), Some(1706812890529120002));
        assert_eq!(ns_from_value(&Value::from(42u64)), Some(42));
        assert_eq!(ns_from_value(&Value::from("abc")), None);
        assert_eq!(ns_from_value(&Value::Null), None);
    }

    #[test]
    fn targets_parse_case_insensitively() {
        assert_eq!("accounts".parse::<PipelineTarget>(), Ok(PipelineTarget::Accounts));
        assert_eq!("TRANSACTIONS".parse::<PipelineTarget>(), Ok(PipelineTarget::Transactions));
        assert!("ledger".parse::<PipelineTarget>().is_err());
    }

    #[test]
    fn job_log_never_appears_in_data_tables() {
        for target in PipelineTarget::ALL {
            assert!(!target.data_tables().contains(&TableName::JobLog));
        }
    }

    #[test]
    fn job_log_entry_survives_row_encoding() {
        let window = TimeWindow::new(1706745600000000000, 1706832000000000000).unwrap();
        let mut counts = BTreeMap::new();
        counts.insert(PipelineTarget::Accounts, 4);
        let entry = JobLogEntry::success(PipelineTarget::Accounts, window, counts);

        let row = entry.to_row();
        assert_eq!(row["start_time_ns"], Value::from("1706745600000000000"));
        assert_eq!(row["count_accounts_added"], Value::from(4u64));
        assert_eq!(row["count_txs_added"], Value::Null);
        for column in job_log_schema().columns {
            assert!(row.contains_key(&column.name), "missing {}", column.name);
        }

        let decoded = JobLogEntry::from_row(&row).unwrap();
        assert_eq!(decoded.job_id, entry.job_id);
        assert_eq!(decoded.window, window);
        assert_eq!(decoded.counts_added.get(&PipelineTarget::Accounts), Some(&4));
        assert!(decoded.is_success());
    }

    #[test]
    fn untargeted_entries_apply_everywhere() {
        let window = TimeWindow::new(1, 2).unwrap();
        let mut row = JobLogEntry::error(PipelineTarget::Accounts, window, "boom").to_row();
        row.insert("pipeline_target".into(), Value::Null);
        let entry = JobLogEntry::from_row(&row).unwrap();
        assert!(entry.applies_to(PipelineTarget::Transactions));
        assert_eq!(entry.message.as_deref(), Some("boom"));
    }

    #[test]
    fn malformed_status_is_rejected() {
        let window = TimeWindow::new(1, 2).unwrap();
        let mut row = JobLogEntry::error(PipelineTarget::Accounts, window, "x").to_row();
        row.insert("status".into(), Value::from("pending"));
        assert!(matches!(
            JobLogEntry::from_row(&row),
            Err(RowDecodeError::InvalidValue { column: "status", .. })
        ));
    }
}

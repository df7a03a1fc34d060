//! Domain model and risk computation for monthly account risk alerts.
//!
//! This crate is pure: it owns the record/alert/outcome types, the
//! [`AlertConfig`] value object, the month arithmetic and the
//! [`RiskEngine`]. Persistence and delivery live in sibling crates and plug
//! in through [`AlertStore`].

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::{Date, Month, OffsetDateTime, UtcOffset};
use ulid::Ulid;

mod compute;
mod config;

pub use compute::{compute_alerts, AlertComputation, ComputeStats, RiskEngine};
pub use config::{AlertConfig, RetryPolicy};

time::serde::format_description!(iso_date, Date, "[year]-[month]-[day]");

/// Status value marking an account as at risk in the monthly snapshot.
pub const AT_RISK_STATUS: &str = "At Risk";

/// The only alert type produced today; part of the outcome idempotency key.
pub const ALERT_TYPE_AT_RISK: &str = "at_risk";

pub const DEFAULT_LOOKBACK_MONTHS: u32 = 24;

/// Error message recorded on outcomes whose region has no channel mapping.
pub const UNKNOWN_REGION_ERROR: &str = "unknown_region";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum AlertError {
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("computation error: {0}")]
    Computation(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct RunId(pub Ulid);

impl RunId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for RunId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RunId {
    type Err = AlertError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ulid::from_string(value)
            .map(Self)
            .map_err(|err| AlertError::Validation(format!("invalid run_id ULID '{value}': {err}")))
    }
}

/// One row of the monthly account status snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AccountStatusRecord {
    pub account_id: String,
    pub account_name: String,
    pub account_region: Option<String>,
    #[serde(with = "iso_date")]
    pub month: Date,
    pub status: String,
    #[serde(with = "time::serde::rfc3339::option")]
    pub updated_at: Option<OffsetDateTime>,
    #[serde(with = "iso_date::option")]
    pub renewal_date: Option<Date>,
    pub account_owner: Option<String>,
    pub arr: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Alert {
    pub account_id: String,
    pub account_name: String,
    pub account_region: Option<String>,
    #[serde(with = "iso_date")]
    pub month: Date,
    pub status: String,
    pub duration_months: u32,
    #[serde(with = "iso_date")]
    pub risk_start_month: Date,
    #[serde(with = "iso_date::option")]
    pub renewal_date: Option<Date>,
    pub account_owner: Option<String>,
    pub arr: Option<i64>,
}

impl Alert {
    #[must_use]
    pub fn outcome_key(&self) -> OutcomeKey {
        OutcomeKey {
            account_id: self.account_id.clone(),
            month: self.month,
            alert_type: ALERT_TYPE_AT_RISK.to_string(),
        }
    }
}

/// Idempotency key of an [`AlertOutcome`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Ord, PartialOrd, Hash)]
pub struct OutcomeKey {
    pub account_id: String,
    #[serde(with = "iso_date")]
    pub month: Date,
    pub alert_type: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Sent,
    Failed,
    DryRun,
}

impl OutcomeStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::Failed => "failed",
            Self::DryRun => "dry_run",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "sent" => Some(Self::Sent),
            "failed" => Some(Self::Failed),
            "dry_run" => Some(Self::DryRun),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AlertOutcome {
    pub run_id: RunId,
    pub account_id: String,
    pub account_name: String,
    #[serde(with = "iso_date")]
    pub month: Date,
    pub alert_type: String,
    pub channel: Option<String>,
    pub status: OutcomeStatus,
    pub error_message: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub sent_at: OffsetDateTime,
}

impl AlertOutcome {
    #[must_use]
    pub fn for_alert(
        run_id: RunId,
        alert: &Alert,
        channel: Option<String>,
        status: OutcomeStatus,
        error_message: Option<String>,
    ) -> Self {
        Self {
            run_id,
            account_id: alert.account_id.clone(),
            account_name: alert.account_name.clone(),
            month: alert.month,
            alert_type: ALERT_TYPE_AT_RISK.to_string(),
            channel,
            status,
            error_message,
            sent_at: now_utc(),
        }
    }

    #[must_use]
    pub fn key(&self) -> OutcomeKey {
        OutcomeKey {
            account_id: self.account_id.clone(),
            month: self.month,
            alert_type: self.alert_type.clone(),
        }
    }
}

/// Result of a conditional outcome insert against the uniqueness key.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum InsertOutcome {
    Inserted,
    /// Another writer already recorded this key. Not an error.
    AlreadyRecorded,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed,
}

impl RunStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "running" => Some(Self::Running),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunCounters {
    pub rows_scanned: u64,
    pub duplicates_found: u64,
    pub alerts_computed: u64,
    pub alerts_sent: u64,
    pub skipped_replay: u64,
    pub failed_deliveries: u64,
    pub unknown_region_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunRecord {
    pub run_id: RunId,
    pub source_uri: String,
    #[serde(with = "iso_date")]
    pub month: Date,
    pub dry_run: bool,
    pub status: RunStatus,
    pub counters: RunCounters,
    pub error_message: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
}

impl RunRecord {
    #[must_use]
    pub fn started(run_id: RunId, source_uri: &str, month: Date, dry_run: bool) -> Self {
        Self {
            run_id,
            source_uri: source_uri.to_string(),
            month,
            dry_run,
            status: RunStatus::Running,
            counters: RunCounters::default(),
            error_message: None,
            created_at: now_utc(),
            completed_at: None,
        }
    }
}

/// Durable store for runs and alert outcomes.
///
/// Implementations MUST enforce uniqueness of (`account_id`, `month`,
/// `alert_type`) themselves; callers never lock around it.
pub trait AlertStore {
    #[allow(clippy::missing_errors_doc)]
    fn migrate(&self) -> anyhow::Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn insert_run(&self, run: &RunRecord) -> anyhow::Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn update_run_counters(&self, run_id: RunId, counters: &RunCounters) -> anyhow::Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn finish_run(
        &self,
        run_id: RunId,
        status: RunStatus,
        error_message: Option<&str>,
    ) -> anyhow::Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn get_run(&self, run_id: RunId) -> anyhow::Result<Option<RunRecord>>;

    #[allow(clippy::missing_errors_doc)]
    fn outcome_exists(&self, key: &OutcomeKey) -> anyhow::Result<bool>;

    #[allow(clippy::missing_errors_doc)]
    fn insert_outcome(&self, outcome: &AlertOutcome) -> anyhow::Result<InsertOutcome>;

    #[allow(clippy::missing_errors_doc)]
    fn list_outcomes_for_run(&self, run_id: RunId) -> anyhow::Result<Vec<AlertOutcome>>;
}

/// Inclusive range of first-of-month dates.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct MonthRange {
    #[serde(with = "iso_date")]
    pub start: Date,
    #[serde(with = "iso_date")]
    pub end: Date,
}

impl MonthRange {
    /// The window `[end - lookback_months, end]`.
    ///
    /// # Errors
    /// Returns [`AlertError::Computation`] when the start month falls outside
    /// the supported calendar.
    pub fn lookback(end: Date, lookback_months: u32) -> Result<Self, AlertError> {
        let offset = i32::try_from(lookback_months).map_err(|_| {
            AlertError::Configuration(format!("lookback_months too large: {lookback_months}"))
        })?;
        Ok(Self {
            start: shift_months(end, -offset)?,
            end,
        })
    }

    #[must_use]
    pub fn contains(&self, month: Date) -> bool {
        month >= self.start && month <= self.end
    }
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

#[must_use]
pub fn is_first_of_month(date: Date) -> bool {
    date.day() == 1
}

/// Moves a date by `delta` calendar months, landing on the first of the month.
///
/// # Errors
/// Returns [`AlertError::Computation`] when the result is outside the
/// supported calendar range.
pub fn shift_months(date: Date, delta: i32) -> Result<Date, AlertError> {
    let index = date.year() * 12 + i32::from(u8::from(date.month())) - 1 + delta;
    let year = index.div_euclid(12);
    let month_number = u8::try_from(index.rem_euclid(12) + 1)
        .map_err(|err| AlertError::Computation(format!("month index overflow: {err}")))?;
    let month = Month::try_from(month_number)
        .map_err(|err| AlertError::Computation(format!("invalid month {month_number}: {err}")))?;
    Date::from_calendar_date(year, month, 1).map_err(|err| {
        AlertError::Computation(format!("month shift out of range from {date} by {delta}: {err}"))
    })
}

/// Parses a `YYYY-MM-DD` date.
///
/// # Errors
/// Returns [`AlertError::Validation`] when the value is not an ISO date.
pub fn parse_iso_date(value: &str) -> Result<Date, AlertError> {
    Date::parse(
        value.trim(),
        time::macros::format_description!("[year]-[month]-[day]"),
    )
    .map_err(|err| AlertError::Validation(format!("invalid date '{value}': {err}")))
}

/// Formats a date as `YYYY-MM-DD`.
///
/// # Errors
/// Returns [`AlertError::Validation`] when formatting fails.
pub fn format_iso_date(date: Date) -> Result<String, AlertError> {
    date.format(time::macros::format_description!("[year]-[month]-[day]"))
        .map_err(|err| AlertError::Validation(format!("failed to format date: {err}")))
}

/// Parses a target month, which must be a first-of-month `YYYY-MM-DD` date.
///
/// # Errors
/// Returns [`AlertError::Validation`] for malformed or mid-month dates.
pub fn parse_target_month(value: &str) -> Result<Date, AlertError> {
    let date = parse_iso_date(value)?;
    if !is_first_of_month(date) {
        return Err(AlertError::Validation(format!(
            "target month MUST be the first day of a month, got {value}"
        )));
    }
    Ok(date)
}

/// Resolves `auto` (previous calendar month relative to `today`) or an
/// explicit first-of-month date.
///
/// # Errors
/// Returns [`AlertError::Validation`] when an explicit month is invalid.
pub fn resolve_target_month(raw: &str, today: Date) -> Result<Date, AlertError> {
    if raw.trim().eq_ignore_ascii_case("auto") {
        return shift_months(today, -1);
    }
    parse_target_month(raw)
}

//! Record providers for the monthly account status snapshot.
//!
//! Snapshots are Parquet files, with CSV accepted as a secondary format. The
//! format follows the file extension.

use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use csv::StringRecord;
use risk_alert_core::{parse_iso_date, AccountStatusRecord, AlertError, MonthRange};
use time::format_description::well_known::Rfc3339;
use time::{Date, OffsetDateTime, PrimitiveDateTime};

mod columnar;

pub(crate) const REQUIRED_COLUMNS: [&str; 4] = ["account_id", "account_name", "month", "status"];

/// Supplies account status rows for a locator, optionally restricted to a
/// month range.
pub trait RecordProvider {
    #[allow(clippy::missing_errors_doc)]
    fn read_records(
        &self,
        locator: &str,
        range: Option<MonthRange>,
    ) -> Result<Vec<AccountStatusRecord>, AlertError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFormat {
    Parquet,
    Csv,
}

impl SourceFormat {
    /// Picks the format from the file extension (`.parquet`/`.pq` or `.csv`).
    ///
    /// # Errors
    /// Returns [`AlertError::SourceUnavailable`] for any other extension.
    pub fn from_path(path: &Path) -> Result<Self, AlertError> {
        let extension = path
            .extension()
            .and_then(OsStr::to_str)
            .map(str::to_ascii_lowercase);
        match extension.as_deref() {
            Some("parquet" | "pq") => Ok(Self::Parquet),
            Some("csv") => Ok(Self::Csv),
            _ => Err(AlertError::SourceUnavailable(format!(
                "unsupported source format for {} (expected .parquet or .csv)",
                path.display()
            ))),
        }
    }
}

/// Reads Parquet or CSV snapshots from the local filesystem.
///
/// Locators are `file://<path>` or bare paths. Remote object store schemes
/// are recognised and rejected.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFileProvider;

impl LocalFileProvider {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl RecordProvider for LocalFileProvider {
    fn read_records(
        &self,
        locator: &str,
        range: Option<MonthRange>,
    ) -> Result<Vec<AccountStatusRecord>, AlertError> {
        let path = local_path(locator)?;
        match SourceFormat::from_path(&path)? {
            SourceFormat::Parquet => columnar::read_parquet_file(&path, range),
            SourceFormat::Csv => read_csv_file(&path, range),
        }
    }
}

/// Serves records registered per locator. Unknown locators are unavailable.
#[derive(Debug, Clone, Default)]
pub struct InMemoryProvider {
    sources: BTreeMap<String, Vec<AccountStatusRecord>>,
}

impl InMemoryProvider {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_source(mut self, locator: &str, records: Vec<AccountStatusRecord>) -> Self {
        self.sources.insert(locator.to_string(), records);
        self
    }
}

impl RecordProvider for InMemoryProvider {
    fn read_records(
        &self,
        locator: &str,
        range: Option<MonthRange>,
    ) -> Result<Vec<AccountStatusRecord>, AlertError> {
        let records = self
            .sources
            .get(locator)
            .ok_or_else(|| AlertError::SourceUnavailable(format!("unknown source {locator}")))?;
        Ok(records
            .iter()
            .filter(|record| in_range(range, record.month))
            .cloned()
            .collect())
    }
}

pub(crate) fn in_range(range: Option<MonthRange>, month: Date) -> bool {
    match range {
        Some(range) => range.contains(month),
        None => true,
    }
}

/// Resolves a locator to a local path.
///
/// # Errors
/// Returns [`AlertError::SourceUnavailable`] for any scheme other than
/// `file`.
pub fn local_path(locator: &str) -> Result<PathBuf, AlertError> {
    let locator = locator.trim();
    if locator.is_empty() {
        return Err(AlertError::SourceUnavailable(
            "source locator cannot be empty".to_string(),
        ));
    }

    match locator.split_once("://") {
        None => Ok(PathBuf::from(locator)),
        Some((scheme, rest)) if scheme.eq_ignore_ascii_case("file") => {
            if rest.is_empty() {
                return Err(AlertError::SourceUnavailable(format!(
                    "file locator has no path: {locator}"
                )));
            }
            Ok(PathBuf::from(rest))
        }
        Some((scheme, _)) => {
            let scheme = scheme.to_ascii_lowercase();
            let reason = if scheme == "gs" || scheme == "s3" {
                "remote object stores are not supported"
            } else {
                "supported: file:// or a local path"
            };
            Err(AlertError::SourceUnavailable(format!(
                "unsupported source scheme '{scheme}' ({reason})"
            )))
        }
    }
}

fn read_csv_file(
    path: &Path,
    range: Option<MonthRange>,
) -> Result<Vec<AccountStatusRecord>, AlertError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(|err| {
            AlertError::SourceUnavailable(format!("failed to open {}: {err}", path.display()))
        })?;

    let headers = reader.headers().map_err(|err| {
        AlertError::SourceUnavailable(format!("failed to read header of {}: {err}", path.display()))
    })?;
    let columns = ColumnIndex::resolve(headers)?;
    tracing::debug!(path = %path.display(), columns = headers.len(), "resolved csv header");

    let mut records = Vec::new();
    let mut skipped = 0_usize;
    for row in reader.records() {
        let row = row.map_err(|err| {
            AlertError::SourceUnavailable(format!("malformed csv in {}: {err}", path.display()))
        })?;
        let line = row.position().map_or(0, csv::Position::line);
        let record = columns.parse_row(&row).map_err(|reason| {
            AlertError::SourceUnavailable(format!("{} line {line}: {reason}", path.display()))
        })?;

        if in_range(range, record.month) {
            records.push(record);
        } else {
            skipped += 1;
        }
    }

    tracing::info!(
        path = %path.display(),
        rows = records.len(),
        skipped_outside_range = skipped,
        "loaded account status records"
    );
    Ok(records)
}

#[derive(Debug)]
struct ColumnIndex {
    account_id: usize,
    account_name: usize,
    month: usize,
    status: usize,
    account_region: Option<usize>,
    updated_at: Option<usize>,
    renewal_date: Option<usize>,
    account_owner: Option<usize>,
    arr: Option<usize>,
}

impl ColumnIndex {
    fn resolve(headers: &StringRecord) -> Result<Self, AlertError> {
        let find = |name: &str| headers.iter().position(|header| header == name);
        let require = |name: &str| {
            find(name).ok_or_else(|| {
                AlertError::SourceUnavailable(format!(
                    "missing required column '{name}' (required: {})",
                    REQUIRED_COLUMNS.join(", ")
                ))
            })
        };

        Ok(Self {
            account_id: require("account_id")?,
            account_name: require("account_name")?,
            month: require("month")?,
            status: require("status")?,
            account_region: find("account_region"),
            updated_at: find("updated_at"),
            renewal_date: find("renewal_date"),
            account_owner: find("account_owner"),
            arr: find("arr"),
        })
    }

    fn parse_row(&self, row: &StringRecord) -> Result<AccountStatusRecord, String> {
        let cell = |index: Option<usize>| {
            index
                .and_then(|index| row.get(index))
                .filter(|value| !value.is_empty())
        };
        let required = |index: usize, name: &str| {
            cell(Some(index))
                .map(str::to_string)
                .ok_or_else(|| format!("{name} is empty"))
        };

        let month_raw = required(self.month, "month")?;
        let month = parse_iso_date(&month_raw).map_err(|err| err.to_string())?;

        Ok(AccountStatusRecord {
            account_id: required(self.account_id, "account_id")?,
            account_name: cell(Some(self.account_name)).unwrap_or_default().to_string(),
            account_region: cell(self.account_region).map(str::to_string),
            month,
            status: required(self.status, "status")?,
            updated_at: cell(self.updated_at).map(parse_timestamp).transpose()?,
            renewal_date: cell(self.renewal_date)
                .map(|raw| parse_iso_date(raw).map_err(|err| err.to_string()))
                .transpose()?,
            account_owner: cell(self.account_owner).map(str::to_string),
            arr: cell(self.arr).map(parse_arr).transpose()?,
        })
    }
}

/// Parses `updated_at` as RFC3339, `YYYY-MM-DD HH:MM:SS` (UTC) or a bare
/// date at midnight UTC.
fn parse_timestamp(raw: &str) -> Result<OffsetDateTime, String> {
    if let Ok(value) = OffsetDateTime::parse(raw, &Rfc3339) {
        return Ok(value);
    }
    if let Ok(value) = PrimitiveDateTime::parse(
        raw,
        time::macros::format_description!("[year]-[month]-[day] [hour]:[minute]:[second]"),
    ) {
        return Ok(value.assume_utc());
    }
    Date::parse(raw, time::macros::format_description!("[year]-[month]-[day]"))
        .map(|date| date.midnight().assume_utc())
        .map_err(|_| format!("invalid updated_at '{raw}'"))
}

fn parse_arr(raw: &str) -> Result<i64, String> {
    if let Ok(value) = raw.parse::<i64>() {
        return Ok(value);
    }
    match raw.split_once('.') {
        Some((whole, fraction)) if fraction.chars().all(|c| c == '0') => whole
            .parse::<i64>()
            .map_err(|_| format!("invalid arr '{raw}'")),
        _ => Err(format!("invalid arr '{raw}': expected a whole number")),
    }
}

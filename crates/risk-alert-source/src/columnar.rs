use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use arrow::array::{
    Array, ArrayRef, Date32Array, Float64Array, Int64Array, StringArray, TimestampMicrosecondArray,
};
use arrow::compute::{cast, cast_with_options, CastOptions};
use arrow::datatypes::{DataType, TimeUnit};
use arrow::record_batch::RecordBatch;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use risk_alert_core::{AccountStatusRecord, AlertError, MonthRange};
use time::{Date, OffsetDateTime};

use crate::{in_range, REQUIRED_COLUMNS};

const UNIX_EPOCH_JULIAN_DAY: i32 = 2_440_588;

// Whole-dollar ARR stored as a float must stay exactly representable.
const MAX_EXACT_FLOAT_ARR: f64 = 9_007_199_254_740_992.0;

pub(crate) fn read_parquet_file(
    path: &Path,
    range: Option<MonthRange>,
) -> Result<Vec<AccountStatusRecord>, AlertError> {
    let unavailable = |reason: String| {
        AlertError::SourceUnavailable(format!("{}: {reason}", path.display()))
    };

    let file = File::open(path).map_err(|err| unavailable(format!("failed to open: {err}")))?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)
        .map_err(|err| unavailable(format!("parquet reader init failed: {err}")))?
        .build()
        .map_err(|err| unavailable(format!("parquet reader build failed: {err}")))?;

    let mut records = Vec::new();
    let mut skipped = 0_usize;
    let mut rows_before = 0_usize;
    for batch in reader {
        let batch = batch.map_err(|err| unavailable(format!("parquet read batch failed: {err}")))?;
        let columns = BatchColumns::resolve(&batch).map_err(unavailable)?;

        for row in 0..batch.num_rows() {
            let record = columns
                .record(row)
                .map_err(|reason| unavailable(format!("row {}: {reason}", rows_before + row + 1)))?;
            if in_range(range, record.month) {
                records.push(record);
            } else {
                skipped += 1;
            }
        }
        rows_before += batch.num_rows();
    }

    tracing::info!(
        path = %path.display(),
        rows = records.len(),
        skipped_outside_range = skipped,
        "loaded account status records"
    );
    Ok(records)
}

enum ArrColumn {
    Whole(Int64Array),
    Fractional(Float64Array),
}

/// Columns of one record batch, cast to the types the record needs.
struct BatchColumns {
    account_id: StringArray,
    account_name: StringArray,
    month: Date32Array,
    status: StringArray,
    account_region: Option<StringArray>,
    updated_at: Option<TimestampMicrosecondArray>,
    renewal_date: Option<Date32Array>,
    account_owner: Option<StringArray>,
    arr: Option<ArrColumn>,
}

impl BatchColumns {
    fn resolve(batch: &RecordBatch) -> Result<Self, String> {
        let utc_micros = DataType::Timestamp(TimeUnit::Microsecond, Some("+00:00".into()));

        let arr = match column(batch, "arr") {
            None => None,
            Some(array) if array.data_type().is_integer() => {
                Some(ArrColumn::Whole(cast_as(array, "arr", &DataType::Int64)?))
            }
            Some(array) => Some(ArrColumn::Fractional(cast_as(array, "arr", &DataType::Float64)?)),
        };

        Ok(Self {
            account_id: required(batch, "account_id", &DataType::Utf8)?,
            account_name: required(batch, "account_name", &DataType::Utf8)?,
            month: required(batch, "month", &DataType::Date32)?,
            status: required(batch, "status", &DataType::Utf8)?,
            account_region: optional(batch, "account_region", &DataType::Utf8)?,
            updated_at: optional(batch, "updated_at", &utc_micros)?,
            renewal_date: optional(batch, "renewal_date", &DataType::Date32)?,
            account_owner: optional(batch, "account_owner", &DataType::Utf8)?,
            arr,
        })
    }

    fn record(&self, row: usize) -> Result<AccountStatusRecord, String> {
        let text = |column: Option<&StringArray>| {
            column
                .filter(|column| !column.is_null(row))
                .map(|column| column.value(row))
                .filter(|value| !value.is_empty())
                .map(str::to_string)
        };

        Ok(AccountStatusRecord {
            account_id: text(Some(&self.account_id)).ok_or("account_id is empty")?,
            account_name: text(Some(&self.account_name)).unwrap_or_default(),
            account_region: text(self.account_region.as_ref()),
            month: date_at(&self.month, row)?.ok_or("month is empty")?,
            status: text(Some(&self.status)).ok_or("status is empty")?,
            updated_at: self
                .updated_at
                .as_ref()
                .map(|column| timestamp_at(column, row))
                .transpose()?
                .flatten(),
            renewal_date: self
                .renewal_date
                .as_ref()
                .map(|column| date_at(column, row))
                .transpose()?
                .flatten(),
            account_owner: text(self.account_owner.as_ref()),
            arr: self
                .arr
                .as_ref()
                .map(|column| arr_at(column, row))
                .transpose()?
                .flatten(),
        })
    }
}

fn column<'a>(batch: &'a RecordBatch, name: &str) -> Option<&'a ArrayRef> {
    let index = batch.schema().index_of(name).ok()?;
    Some(batch.column(index))
}

fn cast_as<T: Array + Clone + 'static>(
    array: &ArrayRef,
    name: &str,
    to: &DataType,
) -> Result<T, String> {
    let options = CastOptions {
        safe: false,
        ..CastOptions::default()
    };
    let source = blank_strings_as_null(array);
    let cast = cast_with_options(&source, to, &options)
        .map_err(|err| format!("column '{name}' cannot be read as {to}: {err}"))?;
    cast.as_any()
        .downcast_ref::<T>()
        .cloned()
        .ok_or_else(|| format!("column '{name}' did not cast to {to}"))
}

// Empty text cells are treated as missing values, matching the CSV reader.
fn blank_strings_as_null(array: &ArrayRef) -> ArrayRef {
    if !matches!(array.data_type(), DataType::Utf8 | DataType::LargeUtf8) {
        return Arc::clone(array);
    }
    let Ok(text) = cast(array, &DataType::Utf8) else {
        return Arc::clone(array);
    };
    match text.as_any().downcast_ref::<StringArray>() {
        Some(values) => Arc::new(
            values
                .iter()
                .map(|value| value.filter(|value| !value.trim().is_empty()))
                .collect::<StringArray>(),
        ),
        None => Arc::clone(array),
    }
}

fn required<T: Array + Clone + 'static>(
    batch: &RecordBatch,
    name: &str,
    to: &DataType,
) -> Result<T, String> {
    let array = column(batch, name).ok_or_else(|| {
        format!(
            "missing required column '{name}' (required: {})",
            REQUIRED_COLUMNS.join(", ")
        )
    })?;
    cast_as(array, name, to)
}

fn optional<T: Array + Clone + 'static>(
    batch: &RecordBatch,
    name: &str,
    to: &DataType,
) -> Result<Option<T>, String> {
    column(batch, name).map(|array| cast_as(array, name, to)).transpose()
}

fn date_at(column: &Date32Array, row: usize) -> Result<Option<Date>, String> {
    if column.is_null(row) {
        return Ok(None);
    }
    let days = column.value(row);
    UNIX_EPOCH_JULIAN_DAY
        .checked_add(days)
        .and_then(|julian| Date::from_julian_day(julian).ok())
        .map(Some)
        .ok_or_else(|| format!("date out of range: {days} days from epoch"))
}

fn timestamp_at(
    column: &TimestampMicrosecondArray,
    row: usize,
) -> Result<Option<OffsetDateTime>, String> {
    if column.is_null(row) {
        return Ok(None);
    }
    let micros = column.value(row);
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(micros) * 1_000)
        .map(Some)
        .map_err(|err| format!("updated_at out of range: {err}"))
}

fn arr_at(column: &ArrColumn, row: usize) -> Result<Option<i64>, String> {
    match column {
        ArrColumn::Whole(values) => Ok((!values.is_null(row)).then(|| values.value(row))),
        ArrColumn::Fractional(values) => {
            if values.is_null(row) {
                return Ok(None);
            }
            let value = values.value(row);
            if !value.is_finite() || value.fract() != 0.0 || value.abs() > MAX_EXACT_FLOAT_ARR {
                return Err(format!("invalid arr '{value}': expected a whole number"));
            }
            #[allow(clippy::cast_possible_truncation)]
            let whole = value as i64;
            Ok(Some(whole))
        }
    }
}

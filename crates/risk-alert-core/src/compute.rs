use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use time::Date;

use crate::{
    is_first_of_month, shift_months, AccountStatusRecord, Alert, AlertConfig, AlertError,
    MonthRange, AT_RISK_STATUS, DEFAULT_LOOKBACK_MONTHS,
};

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ComputeStats {
    /// Rows inside the lookback window.
    pub rows_scanned: u64,
    /// Rows dropped because a later update for the same account and month exists.
    pub duplicates_found: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AlertComputation {
    pub alerts: Vec<Alert>,
    pub stats: ComputeStats,
}

/// Derives at-risk alerts from a monthly status snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RiskEngine {
    arr_threshold: i64,
    lookback_months: u32,
}

impl RiskEngine {
    #[must_use]
    pub fn new(config: &AlertConfig) -> Self {
        Self {
            arr_threshold: config.arr_threshold,
            lookback_months: config.lookback_months,
        }
    }

    #[must_use]
    pub fn with_threshold(arr_threshold: i64) -> Self {
        Self {
            arr_threshold,
            lookback_months: DEFAULT_LOOKBACK_MONTHS,
        }
    }

    #[must_use]
    pub fn arr_threshold(&self) -> i64 {
        self.arr_threshold
    }

    /// Window of months the engine reads for `target_month`.
    ///
    /// # Errors
    /// Returns [`AlertError::Validation`] when `target_month` is not a
    /// first-of-month date.
    pub fn window(&self, target_month: Date) -> Result<MonthRange, AlertError> {
        if !is_first_of_month(target_month) {
            return Err(AlertError::Validation(format!(
                "target month MUST be the first day of a month, got {target_month}"
            )));
        }
        MonthRange::lookback(target_month, self.lookback_months)
    }

    /// Computes alerts for `target_month`.
    ///
    /// Output order follows the deduplicated rows: ascending `updated_at`
    /// with missing timestamps last and ties kept in input order. A row
    /// without `updated_at` therefore wins deduplication over timestamped
    /// rows for the same account and month.
    ///
    /// # Errors
    /// Returns [`AlertError::Validation`] for a mid-month target and
    /// [`AlertError::Computation`] when month arithmetic leaves the calendar.
    pub fn compute(
        &self,
        records: &[AccountStatusRecord],
        target_month: Date,
    ) -> Result<AlertComputation, AlertError> {
        let window = self.window(target_month)?;

        let mut scoped: Vec<&AccountStatusRecord> = records
            .iter()
            .filter(|record| window.contains(record.month))
            .collect();
        let rows_scanned = scoped.len();

        scoped.sort_by_key(|record| (record.updated_at.is_none(), record.updated_at));

        let mut last_index: BTreeMap<(&str, Date), usize> = BTreeMap::new();
        for (index, record) in scoped.iter().enumerate() {
            last_index.insert((record.account_id.as_str(), record.month), index);
        }
        let mut kept: Vec<usize> = last_index.into_values().collect();
        kept.sort_unstable();
        let deduped: Vec<&AccountStatusRecord> = kept.into_iter().map(|index| scoped[index]).collect();

        let mut history: BTreeMap<&str, BTreeMap<Date, &str>> = BTreeMap::new();
        for record in &deduped {
            history
                .entry(record.account_id.as_str())
                .or_default()
                .insert(record.month, record.status.as_str());
        }

        let mut alerts = Vec::new();
        for record in deduped.iter().filter(|record| {
            record.month == target_month
                && record.status == AT_RISK_STATUS
                && record.arr.unwrap_or(0) >= self.arr_threshold
        }) {
            let months = history.get(record.account_id.as_str());
            let (duration_months, risk_start_month) = continuous_risk(months, target_month)?;
            alerts.push(Alert {
                account_id: record.account_id.clone(),
                account_name: record.account_name.clone(),
                account_region: record.account_region.clone(),
                month: target_month,
                status: record.status.clone(),
                duration_months,
                risk_start_month,
                renewal_date: record.renewal_date,
                account_owner: record.account_owner.clone(),
                arr: record.arr,
            });
        }

        Ok(AlertComputation {
            alerts,
            stats: ComputeStats {
                rows_scanned: rows_scanned as u64,
                duplicates_found: (rows_scanned - deduped.len()) as u64,
            },
        })
    }
}

/// Counts consecutive at-risk months ending at `target_month`.
fn continuous_risk(
    months: Option<&BTreeMap<Date, &str>>,
    target_month: Date,
) -> Result<(u32, Date), AlertError> {
    let mut duration = 1_u32;
    let mut start = target_month;
    let Some(months) = months else {
        return Ok((duration, start));
    };

    loop {
        let previous = shift_months(start, -1)?;
        match months.get(&previous) {
            Some(status) if *status == AT_RISK_STATUS => {
                duration += 1;
                start = previous;
            }
            _ => break,
        }
    }

    Ok((duration, start))
}

/// Computes alerts with the default lookback window.
///
/// # Errors
/// See [`RiskEngine::compute`].
pub fn compute_alerts(
    records: &[AccountStatusRecord],
    target_month: Date,
    arr_threshold: i64,
) -> Result<(Vec<Alert>, ComputeStats), AlertError> {
    let computation = RiskEngine::with_threshold(arr_threshold).compute(records, target_month)?;
    Ok((computation.alerts, computation.stats))
}

//! Sequences record loading, risk computation and delivery for one run, and
//! reports on finished runs.

use anyhow::{anyhow, Context, Result};
use risk_alert_core::{
    format_iso_date, now_utc, Alert, AlertConfig, AlertOutcome, AlertStore, ComputeStats,
    OutcomeStatus, RiskEngine, RunCounters, RunId, RunRecord, RunStatus,
};
use risk_alert_delivery::{DeliveryPipeline, OperatorNotifier, Sleeper, WebhookTransport};
use risk_alert_source::RecordProvider;
use serde::Serialize;
use time::format_description::well_known::Rfc3339;
use time::{Date, OffsetDateTime};

pub use risk_alert_core::resolve_target_month;

/// Outcomes sampled into a run status report.
pub const STATUS_SAMPLE_SIZE: usize = 5;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RunSummary {
    pub run_id: String,
    pub status: RunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PreviewReport {
    pub month: String,
    pub alerts: Vec<Alert>,
    pub stats: ComputeStats,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SampleAlert {
    pub account_id: String,
    pub account_name: String,
    pub channel: Option<String>,
    pub status: OutcomeStatus,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SampleError {
    pub account_id: String,
    pub account_name: String,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RunStatusReport {
    pub run_id: String,
    pub source_uri: String,
    pub month: String,
    pub dry_run: bool,
    pub status: RunStatus,
    pub counts: RunCounters,
    pub error_message: Option<String>,
    pub created_at: String,
    pub completed_at: Option<String>,
    pub sample_alerts: Vec<SampleAlert>,
    pub sample_errors: Vec<SampleError>,
}

impl RunStatusReport {
    fn build(run: RunRecord, outcomes: &[AlertOutcome]) -> Result<Self> {
        let mut sample_alerts = Vec::new();
        let mut sample_errors = Vec::new();
        for outcome in outcomes.iter().take(STATUS_SAMPLE_SIZE) {
            match outcome.status {
                OutcomeStatus::Sent => sample_alerts.push(SampleAlert {
                    account_id: outcome.account_id.clone(),
                    account_name: outcome.account_name.clone(),
                    channel: outcome.channel.clone(),
                    status: outcome.status,
                }),
                OutcomeStatus::Failed => sample_errors.push(SampleError {
                    account_id: outcome.account_id.clone(),
                    account_name: outcome.account_name.clone(),
                    error: outcome.error_message.clone(),
                }),
                OutcomeStatus::DryRun => {}
            }
        }

        Ok(Self {
            run_id: run.run_id.to_string(),
            source_uri: run.source_uri,
            month: iso_date(run.month)?,
            dry_run: run.dry_run,
            status: run.status,
            counts: run.counters,
            error_message: run.error_message,
            created_at: rfc3339(run.created_at)?,
            completed_at: run.completed_at.map(rfc3339).transpose()?,
            sample_alerts,
            sample_errors,
        })
    }
}

pub struct RunOrchestrator<'a> {
    config: &'a AlertConfig,
    store: &'a dyn AlertStore,
    provider: &'a dyn RecordProvider,
    transport: &'a dyn WebhookTransport,
    sleeper: &'a dyn Sleeper,
    notifier: &'a dyn OperatorNotifier,
}

impl<'a> RunOrchestrator<'a> {
    #[must_use]
    pub fn new(
        config: &'a AlertConfig,
        store: &'a dyn AlertStore,
        provider: &'a dyn RecordProvider,
        transport: &'a dyn WebhookTransport,
        sleeper: &'a dyn Sleeper,
        notifier: &'a dyn OperatorNotifier,
    ) -> Self {
        Self {
            config,
            store,
            provider,
            transport,
            sleeper,
            notifier,
        }
    }

    /// Runs the full pipeline for `target_month` and records the result.
    ///
    /// Failures while loading, computing or delivering mark the run failed
    /// and are reported in the summary, not returned.
    ///
    /// # Errors
    /// Returns an error only when the run row cannot be created or finalized.
    pub fn process_run(&self, source: &str, target_month: Date, dry_run: bool) -> Result<RunSummary> {
        self.store.migrate()?;

        let run = RunRecord::started(RunId::new(), source, target_month, dry_run);
        self.store
            .insert_run(&run)
            .context("failed to create run record")?;
        tracing::info!(
            run_id = %run.run_id,
            source,
            month = %target_month,
            dry_run,
            "run started"
        );

        let mut counters = RunCounters::default();
        match self.execute(&run, &mut counters) {
            Ok(()) => {
                self.store
                    .finish_run(run.run_id, RunStatus::Succeeded, None)
                    .context("failed to finalize run")?;
                tracing::info!(
                    run_id = %run.run_id,
                    alerts_computed = counters.alerts_computed,
                    alerts_sent = counters.alerts_sent,
                    skipped_replay = counters.skipped_replay,
                    failed_deliveries = counters.failed_deliveries,
                    "run succeeded"
                );
                Ok(RunSummary {
                    run_id: run.run_id.to_string(),
                    status: RunStatus::Succeeded,
                    error: None,
                })
            }
            Err(err) => {
                let message = format!("{err:#}");
                tracing::error!(run_id = %run.run_id, error = %message, "run failed");
                self.store
                    .finish_run(run.run_id, RunStatus::Failed, Some(&message))
                    .context("failed to finalize run")?;
                Ok(RunSummary {
                    run_id: run.run_id.to_string(),
                    status: RunStatus::Failed,
                    error: Some(message),
                })
            }
        }
    }

    fn execute(&self, run: &RunRecord, counters: &mut RunCounters) -> Result<()> {
        let engine = RiskEngine::new(self.config);
        let window = engine.window(run.month)?;

        let records = self
            .provider
            .read_records(&run.source_uri, Some(window))
            .with_context(|| format!("failed to read records from {}", run.source_uri))?;

        let computation = engine
            .compute(&records, run.month)
            .context("failed to compute alerts")?;
        counters.rows_scanned = computation.stats.rows_scanned;
        counters.duplicates_found = computation.stats.duplicates_found;
        counters.alerts_computed = computation.alerts.len() as u64;
        self.store.update_run_counters(run.run_id, counters)?;
        tracing::info!(
            run_id = %run.run_id,
            rows_scanned = counters.rows_scanned,
            duplicates_found = counters.duplicates_found,
            alerts_computed = counters.alerts_computed,
            "alerts computed"
        );

        if run.dry_run {
            tracing::info!(run_id = %run.run_id, "dry run, skipping webhook delivery");
        }

        DeliveryPipeline::new(
            self.config,
            self.store,
            self.transport,
            self.sleeper,
            self.notifier,
        )
        .deliver(run, &computation.alerts, run.dry_run, counters)
    }

    /// Computes alerts without creating a run or any outcomes.
    ///
    /// # Errors
    /// Returns an error when the source cannot be read or the month is invalid.
    pub fn preview(&self, source: &str, target_month: Date) -> Result<PreviewReport> {
        let engine = RiskEngine::new(self.config);
        let window = engine.window(target_month)?;
        let records = self
            .provider
            .read_records(source, Some(window))
            .with_context(|| format!("failed to read records from {source}"))?;
        let computation = engine.compute(&records, target_month)?;

        Ok(PreviewReport {
            month: iso_date(target_month)?,
            alerts: computation.alerts,
            stats: computation.stats,
        })
    }

    /// Status, counters and sample outcomes of a run; `None` for an unknown id.
    ///
    /// # Errors
    /// Returns an error when the store cannot be read.
    pub fn run_status(&self, run_id: RunId) -> Result<Option<RunStatusReport>> {
        let Some(run) = self.store.get_run(run_id)? else {
            return Ok(None);
        };
        let outcomes = self.store.list_outcomes_for_run(run_id)?;
        RunStatusReport::build(run, &outcomes).map(Some)
    }
}

/// Resolves `auto` or an explicit first-of-month date against today's UTC date.
///
/// # Errors
/// Returns an error when an explicit month is malformed or not a first of month.
pub fn resolve_month(raw: &str) -> Result<Date> {
    Ok(resolve_target_month(raw, now_utc().date())?)
}

fn iso_date(value: Date) -> Result<String> {
    format_iso_date(value).map_err(|err| anyhow!(err))
}

fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&Rfc3339)
        .map_err(|err| anyhow!("invalid datetime format: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::date;

    fn outcome(account_id: &str, status: OutcomeStatus) -> AlertOutcome {
        AlertOutcome {
            run_id: RunId::new(),
            account_id: account_id.to_string(),
            account_name: format!("{account_id} Corp"),
            month: date!(2024 - 03 - 01),
            alert_type: risk_alert_core::ALERT_TYPE_AT_RISK.to_string(),
            channel: (status == OutcomeStatus::Sent).then(|| "amer-risk-alerts".to_string()),
            status,
            error_message: (status == OutcomeStatus::Failed).then(|| "unknown_region".to_string()),
            sent_at: now_utc(),
        }
    }

    #[test]
    fn status_report_samples_first_five_outcomes() {
        let run = RunRecord::started(RunId::new(), "mem://x", date!(2024 - 03 - 01), false);
        let outcomes = vec![
            outcome("A", OutcomeStatus::Sent),
            outcome("B", OutcomeStatus::Failed),
            outcome("C", OutcomeStatus::Sent),
            outcome("D", OutcomeStatus::DryRun),
            outcome("E", OutcomeStatus::Failed),
            outcome("F", OutcomeStatus::Sent),
            outcome("G", OutcomeStatus::Failed),
        ];

        let report = match RunStatusReport::build(run, &outcomes) {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        };

        let sent: Vec<&str> = report.sample_alerts.iter().map(|s| s.account_id.as_str()).collect();
        let failed: Vec<&str> = report.sample_errors.iter().map(|s| s.account_id.as_str()).collect();
        assert_eq!(sent, vec!["A", "C"]);
        assert_eq!(failed, vec!["B", "E"]);
        assert_eq!(report.sample_errors[0].error.as_deref(), Some("unknown_region"));
        assert_eq!(report.month, "2024-03-01");
        assert!(report.completed_at.is_none());
    }

    #[test]
    fn explicit_month_resolution_rejects_mid_month() {
        assert!(resolve_month("2024-03-15").is_err());
        match resolve_month("2024-03-01") {
            Ok(value) => assert_eq!(value, date!(2024 - 03 - 01)),
            Err(err) => panic!("test failure: {err}"),
        }
        match resolve_month("auto") {
            Ok(value) => assert_eq!(value.day(), 1),
            Err(err) => panic!("test failure: {err}"),
        }
    }
}

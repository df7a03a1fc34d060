//! Delivery pipeline: routes computed alerts to region channels, sends them
//! with retry/backoff and records exactly one outcome per alert key.

use anyhow::{Context, Result};
use risk_alert_core::{
    Alert, AlertConfig, AlertOutcome, AlertStore, InsertOutcome, OutcomeStatus, RunCounters,
    RunRecord, UNKNOWN_REGION_ERROR,
};

mod message;
mod notifier;
mod sender;
mod transport;

pub use message::{alert_text, format_alert_message, format_arr};
pub use notifier::{LogNotifier, OperatorNotifier, UnknownRegionAccount, UnknownRegionNotice};
pub use sender::{is_retryable_status, ChannelSender, SendResult, NO_WEBHOOK_CONFIGURED};
pub use transport::{
    parse_retry_after, Sleeper, ThreadSleeper, TransportError, TransportResponse, UreqTransport,
    WebhookTransport,
};

pub struct DeliveryPipeline<'a> {
    config: &'a AlertConfig,
    store: &'a dyn AlertStore,
    sender: ChannelSender<'a>,
    notifier: &'a dyn OperatorNotifier,
}

impl<'a> DeliveryPipeline<'a> {
    #[must_use]
    pub fn new(
        config: &'a AlertConfig,
        store: &'a dyn AlertStore,
        transport: &'a dyn WebhookTransport,
        sleeper: &'a dyn Sleeper,
        notifier: &'a dyn OperatorNotifier,
    ) -> Self {
        Self {
            config,
            store,
            sender: ChannelSender::new(config, transport, sleeper),
            notifier,
        }
    }

    /// Delivers `alerts` in order for `run`, updating and persisting
    /// `counters` after every alert.
    ///
    /// Per-alert delivery failures become `failed` outcomes; only store
    /// errors are returned.
    ///
    /// # Errors
    /// Returns an error when reading or writing the outcome store fails.
    pub fn deliver(
        &self,
        run: &RunRecord,
        alerts: &[Alert],
        dry_run: bool,
        counters: &mut RunCounters,
    ) -> Result<()> {
        let mut unknown_regions = Vec::new();

        for alert in alerts {
            let key = alert.outcome_key();
            if self
                .store
                .outcome_exists(&key)
                .with_context(|| format!("failed replay check for account {}", alert.account_id))?
            {
                tracing::info!(
                    run_id = %run.run_id,
                    account_id = %alert.account_id,
                    "alert already processed, skipping"
                );
                counters.skipped_replay += 1;
                self.store.update_run_counters(run.run_id, counters)?;
                continue;
            }

            let (outcome, delta) = if dry_run {
                (
                    AlertOutcome::for_alert(run.run_id, alert, None, OutcomeStatus::DryRun, None),
                    CounterDelta::default(),
                )
            } else if let Some(channel) = self.config.channel_for_region(alert.account_region.as_deref()) {
                let result = self.sender.send(alert, channel);
                let (status, delta) = if result.success {
                    (OutcomeStatus::Sent, CounterDelta::sent())
                } else {
                    (OutcomeStatus::Failed, CounterDelta::failed())
                };
                (
                    AlertOutcome::for_alert(
                        run.run_id,
                        alert,
                        Some(channel.to_string()),
                        status,
                        result.error,
                    ),
                    delta,
                )
            } else {
                tracing::warn!(
                    run_id = %run.run_id,
                    account_id = %alert.account_id,
                    region = alert.account_region.as_deref().unwrap_or("<null>"),
                    "no channel for region"
                );
                (
                    AlertOutcome::for_alert(
                        run.run_id,
                        alert,
                        None,
                        OutcomeStatus::Failed,
                        Some(UNKNOWN_REGION_ERROR.to_string()),
                    ),
                    CounterDelta::unknown_region(),
                )
            };

            match self.store.insert_outcome(&outcome)? {
                InsertOutcome::Inserted => {
                    delta.apply(counters);
                    if delta.unknown_region_count > 0 {
                        unknown_regions.push(UnknownRegionAccount::from(alert));
                    }
                }
                InsertOutcome::AlreadyRecorded => {
                    tracing::info!(
                        run_id = %run.run_id,
                        account_id = %alert.account_id,
                        "outcome recorded concurrently by another run"
                    );
                    counters.skipped_replay += 1;
                }
            }
            self.store.update_run_counters(run.run_id, counters)?;
        }

        if !unknown_regions.is_empty() {
            self.notifier.notify_unknown_regions(&UnknownRegionNotice {
                run_id: run.run_id,
                month: run.month,
                accounts: unknown_regions,
            });
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct CounterDelta {
    alerts_sent: u64,
    failed_deliveries: u64,
    unknown_region_count: u64,
}

impl CounterDelta {
    fn sent() -> Self {
        Self {
            alerts_sent: 1,
            ..Self::default()
        }
    }

    fn failed() -> Self {
        Self {
            failed_deliveries: 1,
            ..Self::default()
        }
    }

    fn unknown_region() -> Self {
        Self {
            failed_deliveries: 1,
            unknown_region_count: 1,
            ..Self::default()
        }
    }

    fn apply(self, counters: &mut RunCounters) {
        counters.alerts_sent += self.alerts_sent;
        counters.failed_deliveries += self.failed_deliveries;
        counters.unknown_region_count += self.unknown_region_count;
    }
}

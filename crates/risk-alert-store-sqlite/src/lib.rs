#![allow(clippy::missing_errors_doc)]

use std::path::Path;
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use risk_alert_core::{
    format_iso_date, now_utc, parse_iso_date, AlertOutcome, AlertStore, InsertOutcome,
    OutcomeKey, OutcomeStatus, RunCounters, RunId, RunRecord, RunStatus,
};
use rusqlite::{params, Connection, OptionalExtension};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

const ALERTS_MIGRATION_VERSION: i64 = 1;

const SCHEMA_ALERTS_V1: &str = r"
CREATE TABLE IF NOT EXISTS runs (
  run_id TEXT PRIMARY KEY,
  source_uri TEXT NOT NULL,
  month TEXT NOT NULL,
  dry_run INTEGER NOT NULL CHECK (dry_run IN (0, 1)),
  status TEXT NOT NULL CHECK (status IN ('running', 'succeeded', 'failed')),
  rows_scanned INTEGER NOT NULL DEFAULT 0 CHECK (rows_scanned >= 0),
  duplicates_found INTEGER NOT NULL DEFAULT 0 CHECK (duplicates_found >= 0),
  alerts_computed INTEGER NOT NULL DEFAULT 0 CHECK (alerts_computed >= 0),
  alerts_sent INTEGER NOT NULL DEFAULT 0 CHECK (alerts_sent >= 0),
  skipped_replay INTEGER NOT NULL DEFAULT 0 CHECK (skipped_replay >= 0),
  failed_deliveries INTEGER NOT NULL DEFAULT 0 CHECK (failed_deliveries >= 0),
  unknown_region_count INTEGER NOT NULL DEFAULT 0 CHECK (unknown_region_count >= 0),
  error_message TEXT,
  created_at TEXT NOT NULL,
  completed_at TEXT
);

CREATE TABLE IF NOT EXISTS alert_outcomes (
  outcome_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  run_id TEXT NOT NULL,
  account_id TEXT NOT NULL,
  account_name TEXT NOT NULL,
  month TEXT NOT NULL,
  alert_type TEXT NOT NULL,
  channel TEXT,
  status TEXT NOT NULL CHECK (status IN ('sent', 'failed', 'dry_run')),
  error_message TEXT,
  sent_at TEXT NOT NULL,
  UNIQUE (account_id, month, alert_type),
  FOREIGN KEY (run_id) REFERENCES runs(run_id)
);

CREATE INDEX IF NOT EXISTS idx_alert_outcomes_run_seq
  ON alert_outcomes(run_id, outcome_seq);
CREATE INDEX IF NOT EXISTS idx_runs_month_status
  ON runs(month, status);
";

pub struct SqliteAlertStore {
    conn: Connection,
}

impl SqliteAlertStore {
    /// Open or create an alert database and configure local pragmas.
    ///
    /// # Errors
    /// Returns an error if opening the database or applying pragmas fails.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Opens the database and applies the schema in one step.
    pub fn open_migrated(path: &Path) -> Result<Self> {
        let store = Self::open(path)?;
        store.migrate()?;
        Ok(store)
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }

    fn run_status(&self, run_id: RunId) -> Result<Option<RunStatus>> {
        self.conn
            .query_row(
                "SELECT status FROM runs WHERE run_id = ?1",
                params![run_id.to_string()],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .context("failed to read run status")?
            .map(|raw| parse_run_status(&raw))
            .transpose()
    }
}

impl AlertStore for SqliteAlertStore {
    fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_ALERTS_V1)
            .context("failed to apply alert schema")?;

        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![ALERTS_MIGRATION_VERSION, rfc3339(now_utc())?],
            )
            .context("failed to register alert schema migration")?;

        Ok(())
    }

    fn insert_run(&self, run: &RunRecord) -> Result<()> {
        let counters = CounterColumns::try_from(&run.counters)?;
        self.conn
            .execute(
                "INSERT INTO runs(
                    run_id, source_uri, month, dry_run, status,
                    rows_scanned, duplicates_found, alerts_computed, alerts_sent,
                    skipped_replay, failed_deliveries, unknown_region_count,
                    error_message, created_at, completed_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
                params![
                    run.run_id.to_string(),
                    run.source_uri,
                    iso_date(run.month)?,
                    i64::from(run.dry_run),
                    run.status.as_str(),
                    counters.0[0],
                    counters.0[1],
                    counters.0[2],
                    counters.0[3],
                    counters.0[4],
                    counters.0[5],
                    counters.0[6],
                    run.error_message,
                    rfc3339(run.created_at)?,
                    run.completed_at.map(rfc3339).transpose()?,
                ],
            )
            .with_context(|| format!("failed to insert run {}", run.run_id))?;
        Ok(())
    }

    fn update_run_counters(&self, run_id: RunId, counters: &RunCounters) -> Result<()> {
        let columns = CounterColumns::try_from(counters)?;
        let changed = self
            .conn
            .execute(
                "UPDATE runs SET
                    rows_scanned = ?2, duplicates_found = ?3, alerts_computed = ?4,
                    alerts_sent = ?5, skipped_replay = ?6, failed_deliveries = ?7,
                    unknown_region_count = ?8
                 WHERE run_id = ?1",
                params![
                    run_id.to_string(),
                    columns.0[0],
                    columns.0[1],
                    columns.0[2],
                    columns.0[3],
                    columns.0[4],
                    columns.0[5],
                    columns.0[6],
                ],
            )
            .context("failed to update run counters")?;

        if changed == 0 {
            return Err(anyhow!("run {run_id} not found"));
        }
        Ok(())
    }

    fn finish_run(
        &self,
        run_id: RunId,
        status: RunStatus,
        error_message: Option<&str>,
    ) -> Result<()> {
        if !status.is_terminal() {
            return Err(anyhow!(
                "run {run_id} cannot be finished with non-terminal status {}",
                status.as_str()
            ));
        }

        let changed = self
            .conn
            .execute(
                "UPDATE runs SET status = ?2, error_message = ?3, completed_at = ?4
                 WHERE run_id = ?1 AND status = 'running'",
                params![
                    run_id.to_string(),
                    status.as_str(),
                    error_message,
                    rfc3339(now_utc())?
                ],
            )
            .context("failed to finish run")?;

        if changed == 0 {
            return match self.run_status(run_id)? {
                Some(existing) => Err(anyhow!(
                    "run {run_id} already finalized as {}",
                    existing.as_str()
                )),
                None => Err(anyhow!("run {run_id} not found")),
            };
        }
        Ok(())
    }

    fn get_run(&self, run_id: RunId) -> Result<Option<RunRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT
                run_id, source_uri, month, dry_run, status,
                rows_scanned, duplicates_found, alerts_computed, alerts_sent,
                skipped_replay, failed_deliveries, unknown_region_count,
                error_message, created_at, completed_at
             FROM runs WHERE run_id = ?1",
        )?;

        stmt.query_row(params![run_id.to_string()], |row| {
            Ok(RunRow {
                run_id: row.get(0)?,
                source_uri: row.get(1)?,
                month: row.get(2)?,
                dry_run: row.get(3)?,
                status: row.get(4)?,
                counters: [
                    row.get(5)?,
                    row.get(6)?,
                    row.get(7)?,
                    row.get(8)?,
                    row.get(9)?,
                    row.get(10)?,
                    row.get(11)?,
                ],
                error_message: row.get(12)?,
                created_at: row.get(13)?,
                completed_at: row.get(14)?,
            })
        })
        .optional()
        .context("failed to query run")?
        .map(RunRow::into_record)
        .transpose()
    }

    fn outcome_exists(&self, key: &OutcomeKey) -> Result<bool> {
        let exists = self
            .conn
            .query_row(
                "SELECT 1 FROM alert_outcomes
                 WHERE account_id = ?1 AND month = ?2 AND alert_type = ?3
                 LIMIT 1",
                params![key.account_id, iso_date(key.month)?, key.alert_type],
                |_| Ok(()),
            )
            .optional()
            .context("failed to check for existing outcome")?
            .is_some();
        Ok(exists)
    }

    fn insert_outcome(&self, outcome: &AlertOutcome) -> Result<InsertOutcome> {
        let changed = self
            .conn
            .execute(
                "INSERT INTO alert_outcomes(
                    run_id, account_id, account_name, month, alert_type,
                    channel, status, error_message, sent_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT(account_id, month, alert_type) DO NOTHING",
                params![
                    outcome.run_id.to_string(),
                    outcome.account_id,
                    outcome.account_name,
                    iso_date(outcome.month)?,
                    outcome.alert_type,
                    outcome.channel,
                    outcome.status.as_str(),
                    outcome.error_message,
                    rfc3339(outcome.sent_at)?,
                ],
            )
            .with_context(|| {
                format!(
                    "failed to insert outcome for account {} month {}",
                    outcome.account_id, outcome.month
                )
            })?;

        Ok(if changed == 0 {
            InsertOutcome::AlreadyRecorded
        } else {
            InsertOutcome::Inserted
        })
    }

    fn list_outcomes_for_run(&self, run_id: RunId) -> Result<Vec<AlertOutcome>> {
        let mut stmt = self.conn.prepare(
            "SELECT
                run_id, account_id, account_name, month, alert_type,
                channel, status, error_message, sent_at
             FROM alert_outcomes
             WHERE run_id = ?1
             ORDER BY outcome_seq ASC",
        )?;

        let rows = stmt.query_map(params![run_id.to_string()], |row| {
            Ok(OutcomeRow {
                run_id: row.get(0)?,
                account_id: row.get(1)?,
                account_name: row.get(2)?,
                month: row.get(3)?,
                alert_type: row.get(4)?,
                channel: row.get(5)?,
                status: row.get(6)?,
                error_message: row.get(7)?,
                sent_at: row.get(8)?,
            })
        })?;

        let mut outcomes = Vec::new();
        for row in rows {
            outcomes.push(row.context("failed to read outcome row")?.into_outcome()?);
        }
        Ok(outcomes)
    }
}

/// Counter values in column order, range-checked for `INTEGER` storage.
struct CounterColumns([i64; 7]);

impl TryFrom<&RunCounters> for CounterColumns {
    type Error = anyhow::Error;

    fn try_from(counters: &RunCounters) -> Result<Self> {
        let values = [
            counters.rows_scanned,
            counters.duplicates_found,
            counters.alerts_computed,
            counters.alerts_sent,
            counters.skipped_replay,
            counters.failed_deliveries,
            counters.unknown_region_count,
        ];
        let mut columns = [0_i64; 7];
        for (slot, value) in columns.iter_mut().zip(values) {
            *slot = i64::try_from(value).with_context(|| format!("counter out of range: {value}"))?;
        }
        Ok(Self(columns))
    }
}

struct RunRow {
    run_id: String,
    source_uri: String,
    month: String,
    dry_run: i64,
    status: String,
    counters: [i64; 7],
    error_message: Option<String>,
    created_at: String,
    completed_at: Option<String>,
}

impl RunRow {
    fn into_record(self) -> Result<RunRecord> {
        let [rows_scanned, duplicates_found, alerts_computed, alerts_sent, skipped_replay, failed_deliveries, unknown_region_count] =
            self.counters.map(sql_to_count);

        Ok(RunRecord {
            run_id: parse_run_id(&self.run_id)?,
            source_uri: self.source_uri,
            month: parse_iso_date(&self.month).map_err(|err| anyhow!(err))?,
            dry_run: self.dry_run != 0,
            status: parse_run_status(&self.status)?,
            counters: RunCounters {
                rows_scanned: rows_scanned?,
                duplicates_found: duplicates_found?,
                alerts_computed: alerts_computed?,
                alerts_sent: alerts_sent?,
                skipped_replay: skipped_replay?,
                failed_deliveries: failed_deliveries?,
                unknown_region_count: unknown_region_count?,
            },
            error_message: self.error_message,
            created_at: parse_rfc3339(&self.created_at)?,
            completed_at: self
                .completed_at
                .as_deref()
                .map(parse_rfc3339)
                .transpose()?,
        })
    }
}

struct OutcomeRow {
    run_id: String,
    account_id: String,
    account_name: String,
    month: String,
    alert_type: String,
    channel: Option<String>,
    status: String,
    error_message: Option<String>,
    sent_at: String,
}

impl OutcomeRow {
    fn into_outcome(self) -> Result<AlertOutcome> {
        Ok(AlertOutcome {
            run_id: parse_run_id(&self.run_id)?,
            account_id: self.account_id,
            account_name: self.account_name,
            month: parse_iso_date(&self.month).map_err(|err| anyhow!(err))?,
            alert_type: self.alert_type,
            channel: self.channel,
            status: parse_outcome_status(&self.status)?,
            error_message: self.error_message,
            sent_at: parse_rfc3339(&self.sent_at)?,
        })
    }
}

fn parse_run_status(value: &str) -> Result<RunStatus> {
    RunStatus::parse(value).ok_or_else(|| anyhow!("unknown run status: {value}"))
}

fn parse_outcome_status(value: &str) -> Result<OutcomeStatus> {
    OutcomeStatus::parse(value).ok_or_else(|| anyhow!("unknown outcome status: {value}"))
}

fn parse_run_id(value: &str) -> Result<RunId> {
    RunId::from_str(value).map_err(|err| anyhow!(err))
}

fn sql_to_count(value: i64) -> Result<u64> {
    u64::try_from(value).map_err(|_| anyhow!("negative counter in runs table: {value}"))
}

fn iso_date(value: time::Date) -> Result<String> {
    format_iso_date(value).map_err(|err| anyhow!(err))
}

fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&Rfc3339)
        .map_err(|err| anyhow!("invalid datetime format: {err}"))
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &Rfc3339).map_err(|err| anyhow!("invalid RFC3339 datetime: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use risk_alert_core::{Alert, ALERT_TYPE_AT_RISK, AT_RISK_STATUS};
    use time::macros::date;
    use ulid::Ulid;

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err:#}"),
        }
    }

    fn temp_db_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!(
            "risk-alert-store-test-{}-{}.sqlite3",
            name,
            Ulid::new()
        ))
    }

    fn fixture_store() -> SqliteAlertStore {
        must(SqliteAlertStore::open_migrated(Path::new(":memory:")))
    }

    fn fixture_run(store: &SqliteAlertStore) -> RunId {
        let run_id = RunId::new();
        let run = RunRecord::started(run_id, "file:///tmp/snapshot.csv", date!(2024 - 03 - 01), false);
        must(store.insert_run(&run));
        run_id
    }

    fn fixture_alert(account_id: &str) -> Alert {
        Alert {
            account_id: account_id.to_string(),
            account_name: format!("{account_id} Corp"),
            account_region: Some("AMER".to_string()),
            month: date!(2024 - 03 - 01),
            status: AT_RISK_STATUS.to_string(),
            duration_months: 1,
            risk_start_month: date!(2024 - 03 - 01),
            renewal_date: None,
            account_owner: None,
            arr: Some(50_000),
        }
    }

    fn sent_outcome(run_id: RunId, account_id: &str) -> AlertOutcome {
        AlertOutcome::for_alert(
            run_id,
            &fixture_alert(account_id),
            Some("amer-risk-alerts".to_string()),
            OutcomeStatus::Sent,
            None,
        )
    }

    #[test]
    fn migrate_is_idempotent() {
        let store = fixture_store();
        must(store.migrate());
        must(store.migrate());

        let versions: i64 = match store.connection().query_row(
            "SELECT COUNT(*) FROM schema_migrations",
            [],
            |row| row.get(0),
        ) {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        };
        assert_eq!(versions, 1);
    }

    #[test]
    fn run_round_trips_with_counters() {
        let store = fixture_store();
        let run_id = fixture_run(&store);

        let counters = RunCounters {
            rows_scanned: 10,
            duplicates_found: 2,
            alerts_computed: 3,
            alerts_sent: 1,
            skipped_replay: 1,
            failed_deliveries: 1,
            unknown_region_count: 1,
        };
        must(store.update_run_counters(run_id, &counters));

        let run = match must(store.get_run(run_id)) {
            Some(value) => value,
            None => panic!("run should exist"),
        };
        assert_eq!(run.status, RunStatus::Running);
        assert_eq!(run.counters, counters);
        assert_eq!(run.month, date!(2024 - 03 - 01));
        assert!(run.completed_at.is_none());
        assert!(must(store.get_run(RunId::new())).is_none());
    }

    #[test]
    fn conflicting_outcome_reports_already_recorded() {
        let store = fixture_store();
        let first_run = fixture_run(&store);
        let second_run = fixture_run(&store);

        assert_eq!(
            must(store.insert_outcome(&sent_outcome(first_run, "A"))),
            InsertOutcome::Inserted
        );

        let mut retry = sent_outcome(second_run, "A");
        retry.status = OutcomeStatus::Failed;
        retry.error_message = Some("webhook returned 400: bad".to_string());
        assert_eq!(must(store.insert_outcome(&retry)), InsertOutcome::AlreadyRecorded);

        let recorded = must(store.list_outcomes_for_run(first_run));
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].status, OutcomeStatus::Sent);
        assert!(must(store.list_outcomes_for_run(second_run)).is_empty());
        assert!(must(store.outcome_exists(&recorded[0].key())));
    }

    #[test]
    fn outcome_key_includes_month_and_type() {
        let store = fixture_store();
        let run_id = fixture_run(&store);
        must(store.insert_outcome(&sent_outcome(run_id, "A")));

        let next_month = OutcomeKey {
            account_id: "A".to_string(),
            month: date!(2024 - 04 - 01),
            alert_type: ALERT_TYPE_AT_RISK.to_string(),
        };
        let other_type = OutcomeKey {
            account_id: "A".to_string(),
            month: date!(2024 - 03 - 01),
            alert_type: "renewal".to_string(),
        };
        assert!(!must(store.outcome_exists(&next_month)));
        assert!(!must(store.outcome_exists(&other_type)));
    }

    #[test]
    fn finish_run_is_single_shot() {
        let store = fixture_store();
        let run_id = fixture_run(&store);

        must(store.finish_run(run_id, RunStatus::Succeeded, None));
        let run = match must(store.get_run(run_id)) {
            Some(value) => value,
            None => panic!("run should exist"),
        };
        assert_eq!(run.status, RunStatus::Succeeded);
        assert!(run.completed_at.is_some());

        let second = store.finish_run(run_id, RunStatus::Failed, Some("late failure"));
        match second {
            Err(err) => assert!(err.to_string().contains("already finalized"), "{err}"),
            Ok(()) => panic!("terminal run must not be finalized twice"),
        }

        assert!(store.finish_run(RunId::new(), RunStatus::Failed, None).is_err());
        assert!(store.finish_run(fixture_run(&store), RunStatus::Running, None).is_err());
    }

    #[test]
    fn outcomes_list_in_insertion_order() {
        let store = fixture_store();
        let run_id = fixture_run(&store);
        for account in ["C", "A", "B"] {
            must(store.insert_outcome(&sent_outcome(run_id, account)));
        }

        let ids: Vec<String> = must(store.list_outcomes_for_run(run_id))
            .into_iter()
            .map(|outcome| outcome.account_id)
            .collect();
        assert_eq!(ids, vec!["C", "A", "B"]);
    }

    #[test]
    fn uniqueness_holds_across_connections() {
        let path = temp_db_path("concurrent");
        let first = must(SqliteAlertStore::open_migrated(&path));
        let second = must(SqliteAlertStore::open_migrated(&path));

        let run_a = fixture_run(&first);
        let run_b = fixture_run(&second);

        let results = [
            must(first.insert_outcome(&sent_outcome(run_a, "A"))),
            must(second.insert_outcome(&sent_outcome(run_b, "A"))),
        ];
        assert_eq!(results[0], InsertOutcome::Inserted);
        assert_eq!(results[1], InsertOutcome::AlreadyRecorded);
        assert!(must(second.outcome_exists(&fixture_alert("A").outcome_key())));

        drop(first);
        drop(second);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn schema_rejects_unknown_statuses() {
        let store = fixture_store();
        let run_id = fixture_run(&store);
        let result = store.connection().execute(
            "UPDATE runs SET status = 'paused' WHERE run_id = ?1",
            params![run_id.to_string()],
        );
        assert!(result.is_err());
    }

    proptest! {
        #[test]
        fn at_most_one_outcome_per_key(accounts in prop::collection::vec(0u8..5, 1..30)) {
            let store = fixture_store();
            let run_id = fixture_run(&store);
            let mut inserted = std::collections::BTreeSet::new();

            for account in &accounts {
                let account_id = format!("ACC-{account}");
                let result = must(store.insert_outcome(&sent_outcome(run_id, &account_id)));
                let expected = if inserted.insert(account_id) {
                    InsertOutcome::Inserted
                } else {
                    InsertOutcome::AlreadyRecorded
                };
                prop_assert_eq!(result, expected);
            }

            prop_assert_eq!(must(store.list_outcomes_for_run(run_id)).len(), inserted.len());
        }
    }
}

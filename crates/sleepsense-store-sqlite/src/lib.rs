use std::path::Path;

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use sleepsense_core::{AnalysisResult, AssessmentRun, FactRecord, RunId};
use time::OffsetDateTime;

/// Slot holding the most recently analyzed fact record.
pub const INPUT_SLOT: &str = "assessment_input";
/// Slot holding the analysis of [`INPUT_SLOT`].
pub const RESULT_SLOT: &str = "assessment_result";

const LATEST_SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS assessment_slots (
  slot TEXT PRIMARY KEY CHECK (slot IN ('assessment_input','assessment_result')),
  payload_json TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS assessment_runs (
  run_id TEXT PRIMARY KEY,
  created_at TEXT NOT NULL,
  input_digest TEXT NOT NULL,
  input_json TEXT NOT NULL,
  output_json TEXT NOT NULL,
  recommendation_count INTEGER NOT NULL CHECK (recommendation_count >= 0),
  rules_matched INTEGER NOT NULL CHECK (rules_matched >= 0)
);

CREATE INDEX IF NOT EXISTS idx_assessment_runs_input_digest ON assessment_runs(input_digest);
";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub schema_status: SchemaStatus,
}

/// Contents of the two named slots, present only when both were written.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LatestAssessment {
    pub input: FactRecord,
    pub result: AnalysisResult,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunSummary {
    pub run_id: RunId,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub input_digest: String,
    pub recommendation_count: usize,
    pub rules_matched: usize,
}

impl SqliteStore {
    /// Open a SQLite-backed assessment store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
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

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus { current_version, target_version: LATEST_SCHEMA_VERSION, pending_versions })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when a migration step fails or the database is newer than this build.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;

        if version == 0 {
            let tx = self.conn.transaction().context("failed to start migration transaction")?;
            tx.execute_batch(MIGRATION_001_SQL).context("failed to apply migration 001")?;
            record_schema_version(&tx, 1)?;
            tx.commit().context("failed to commit migration 001")?;
            tracing::debug!("applied assessment store migration 001");
            version = 1;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    /// Overwrite both named slots with one assessment and its analysis.
    ///
    /// # Errors
    /// Returns an error when serialization or transaction writes fail.
    pub fn save_slots(&mut self, input: &FactRecord, result: &AnalysisResult) -> Result<()> {
        let input_json = serde_json::to_string(input).context("failed to serialize fact record")?;
        let result_json =
            serde_json::to_string(result).context("failed to serialize analysis result")?;
        let now = now_rfc3339()?;

        let tx = self.conn.transaction().context("failed to start transaction")?;
        for (slot, payload) in [(INPUT_SLOT, input_json), (RESULT_SLOT, result_json)] {
            tx.execute(
                "INSERT INTO assessment_slots(slot, payload_json, updated_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(slot) DO UPDATE SET
                   payload_json = excluded.payload_json,
                   updated_at = excluded.updated_at",
                params![slot, payload, now],
            )
            .with_context(|| format!("failed to write slot {slot}"))?;
        }
        tx.commit().context("failed to commit slot transaction")?;
        Ok(())
    }

    /// Read both named slots.
    ///
    /// # Errors
    /// Returns an error when lookup or JSON deserialization fails.
    pub fn load_slots(&self) -> Result<Option<LatestAssessment>> {
        let input = self.read_slot(INPUT_SLOT)?;
        let result = self.read_slot(RESULT_SLOT)?;

        let (Some(input_json), Some(result_json)) = (input, result) else {
            return Ok(None);
        };

        Ok(Some(LatestAssessment {
            input: serde_json::from_str(&input_json)
                .context("failed to deserialize stored fact record")?,
            result: serde_json::from_str(&result_json)
                .context("failed to deserialize stored analysis result")?,
        }))
    }

    /// Append one analysis to the run history.
    ///
    /// # Errors
    /// Returns an error when serialization or the insert fails, including duplicate run ids.
    pub fn save_run(&mut self, run: &AssessmentRun) -> Result<()> {
        let tx = self.conn.transaction().context("failed to start transaction")?;
        tx.execute(
            "INSERT INTO assessment_runs(
               run_id, created_at, input_digest, input_json, output_json,
               recommendation_count, rules_matched
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                run.id.to_string(),
                rfc3339(run.timestamp)?,
                run.input_digest,
                serde_json::to_string(&run.input).context("failed to serialize run input")?,
                serde_json::to_string(&run.output).context("failed to serialize run output")?,
                to_sql_count(run.output.recommendations.len())?,
                to_sql_count(run.output.meta.rules_matched)?,
            ],
        )
        .with_context(|| format!("failed to persist assessment run {}", run.id))?;
        tx.commit().context("failed to commit assessment run transaction")?;
        Ok(())
    }

    /// Retrieve one run by id.
    ///
    /// # Errors
    /// Returns an error when lookup or JSON deserialization fails.
    pub fn get_run(&self, run_id: RunId) -> Result<Option<AssessmentRun>> {
        let mut stmt = self.conn.prepare(
            "SELECT created_at, input_digest, input_json, output_json
             FROM assessment_runs WHERE run_id = ?1",
        )?;
        let row = stmt
            .query_row(params![run_id.to_string()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })
            .optional()?;

        let Some((created_at, input_digest, input_json, output_json)) = row else {
            return Ok(None);
        };

        Ok(Some(AssessmentRun {
            id: run_id,
            timestamp: parse_rfc3339(&created_at)?,
            input_digest,
            input: serde_json::from_str(&input_json).context("failed to deserialize run input")?,
            output: serde_json::from_str(&output_json)
                .context("failed to deserialize run output")?,
        }))
    }

    /// Summaries of the most recent runs, newest first.
    ///
    /// # Errors
    /// Returns an error when the query or row decoding fails.
    pub fn list_runs(&self, limit: usize) -> Result<Vec<RunSummary>> {
        let mut stmt = self.conn.prepare(
            "SELECT run_id, created_at, input_digest, recommendation_count, rules_matched
             FROM assessment_runs ORDER BY rowid DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![to_sql_count(limit)?], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, i64>(4)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("failed to list assessment runs")?;

        rows.into_iter()
            .map(|(run_id, created_at, input_digest, recommendation_count, rules_matched)| {
                Ok(RunSummary {
                    run_id: parse_run_id(&run_id)?,
                    timestamp: parse_rfc3339(&created_at)?,
                    input_digest,
                    recommendation_count: from_sql_count(recommendation_count)?,
                    rules_matched: from_sql_count(rules_matched)?,
                })
            })
            .collect()
    }

    /// Run `PRAGMA quick_check` and report schema status.
    ///
    /// # Errors
    /// Returns an error when the pragma or schema inspection fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run sqlite quick_check")?;

        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            schema_status: self.schema_status()?,
        })
    }

    fn read_slot(&self, slot: &str) -> Result<Option<String>> {
        self.conn
            .query_row(
                "SELECT payload_json FROM assessment_slots WHERE slot = ?1",
                params![slot],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .with_context(|| format!("failed to read slot {slot}"))
    }
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn to_sql_count(value: usize) -> Result<i64> {
    i64::try_from(value).with_context(|| format!("count {value} does not fit in sqlite INTEGER"))
}

fn from_sql_count(value: i64) -> Result<usize> {
    usize::try_from(value).with_context(|| format!("stored count {value} is negative"))
}

fn now_rfc3339() -> Result<String> {
    rfc3339(OffsetDateTime::now_utc())
}

fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 timestamp: {value}"))
}

fn parse_run_id(raw: &str) -> Result<RunId> {
    RunId::parse(raw).map_err(|err| anyhow!("stored run id is invalid: {err}"))
}

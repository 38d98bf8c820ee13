use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sleepsense_core::{
    analyze, export_record, rule_by_id, rules, AssessmentRun, Category, ExportRecord, FactRecord,
    Recommendation, Rule, RunId, MEDICAL_REFERRAL_RULE_ID,
};
use sleepsense_store_sqlite::{
    IntegrityReport, LatestAssessment, RunSummary, SchemaStatus, SqliteStore,
};
use time::OffsetDateTime;

pub const API_CONTRACT_VERSION: &str = "api.v1";

/// Number of recommendations shown when a caller asks for the top of a result without a count.
pub const DEFAULT_TOP_PRIORITY: usize = 3;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

/// Serializable view of one knowledge-base rule.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RuleSummary {
    pub id: String,
    pub priority: u8,
    pub complexity: u8,
    pub category: Category,
    pub recommendation: String,
    pub medical_referral: bool,
}

impl From<&Rule> for RuleSummary {
    fn from(rule: &Rule) -> Self {
        Self {
            id: rule.id.to_string(),
            priority: rule.priority,
            complexity: rule.complexity,
            category: Category::from_priority(rule.priority),
            recommendation: rule.recommendation.to_string(),
            medical_referral: rule.id == MEDICAL_REFERRAL_RULE_ID,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SleepSenseApi {
    db_path: PathBuf,
}

impl SleepSenseApi {
    #[must_use]
    pub fn new(db_path: PathBuf) -> Self {
        Self { db_path }
    }

    fn open_store(&self) -> Result<SqliteStore> {
        SqliteStore::open(&self.db_path)
    }

    fn open_migrated_store(&self) -> Result<SqliteStore> {
        let mut store = self.open_store()?;
        store.migrate()?;
        Ok(store)
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let store = self.open_store()?;
        store.schema_status()
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult> {
        let mut store = self.open_store()?;
        let before = store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                after_version: None,
                up_to_date: None,
            });
        }

        let planned_versions = before.pending_versions;
        store.migrate()?;
        let after = store.schema_status()?;
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: planned_versions,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// Run `SQLite` `quick_check` against the assessment database.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or inspected.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let store = self.open_migrated_store()?;
        store.integrity_check()
    }

    /// Validate and analyze one assessment, then overwrite the latest slots and append the run
    /// to history.
    ///
    /// # Errors
    /// Returns an error when the fact record fails validation or persistence fails.
    pub fn analyze(&self, facts: FactRecord) -> Result<AssessmentRun> {
        let run = preview(facts)?;

        let mut store = self.open_migrated_store()?;
        store.save_slots(&run.input, &run.output)?;
        store.save_run(&run)?;

        tracing::info!(
            run_id = %run.id,
            rules_matched = run.output.meta.rules_matched,
            recommendations = run.output.recommendations.len(),
            "persisted assessment run"
        );
        Ok(run)
    }

    /// Most recent assessment and analysis, if one has been stored.
    ///
    /// # Errors
    /// Returns an error when the slots cannot be read.
    pub fn latest(&self) -> Result<Option<LatestAssessment>> {
        let store = self.open_migrated_store()?;
        store.load_slots()
    }

    /// First `n` recommendations of the stored result.
    ///
    /// # Errors
    /// Returns an error when the slots cannot be read.
    pub fn top_priority(&self, n: usize) -> Result<Option<Vec<Recommendation>>> {
        Ok(self
            .latest()?
            .map(|latest| sleepsense_core::top_priority(&latest.result, n).to_vec()))
    }

    /// Export envelope for the stored assessment, stamped with the current time.
    ///
    /// # Errors
    /// Returns an error when the slots cannot be read.
    pub fn export_latest(&self) -> Result<Option<ExportRecord>> {
        Ok(self.latest()?.map(|latest| export_record(&latest.input, &latest.result)))
    }

    /// Fetch one run from history.
    ///
    /// # Errors
    /// Returns an error when lookup fails.
    pub fn run_show(&self, run_id: RunId) -> Result<Option<AssessmentRun>> {
        let store = self.open_migrated_store()?;
        store.get_run(run_id)
    }

    /// Summaries of the most recent runs, newest first.
    ///
    /// # Errors
    /// Returns an error when the history cannot be read.
    pub fn list_runs(&self, limit: usize) -> Result<Vec<RunSummary>> {
        let store = self.open_migrated_store()?;
        store.list_runs(limit)
    }
}

/// Validate and analyze one assessment without touching storage.
///
/// # Errors
/// Returns an error when the fact record fails validation.
pub fn preview(facts: FactRecord) -> Result<AssessmentRun> {
    facts.validate().map_err(|err| anyhow!("{err}"))?;

    let input_digest = compute_input_digest(&facts)?;
    let output = analyze(&facts);
    Ok(AssessmentRun {
        id: RunId::new(),
        timestamp: OffsetDateTime::now_utc(),
        input_digest,
        input: facts,
        output,
    })
}

/// Every rule of the built-in knowledge base, in evaluation order.
#[must_use]
pub fn rule_catalog() -> Vec<RuleSummary> {
    rules().iter().map(RuleSummary::from).collect()
}

#[must_use]
pub fn rule_show(rule_id: &str) -> Option<RuleSummary> {
    rule_by_id(rule_id).map(RuleSummary::from)
}

/// `sha256:<hex>` of the compact JSON form of `facts`.
///
/// # Errors
/// Returns an error when the fact record cannot be serialized.
pub fn compute_input_digest(facts: &FactRecord) -> Result<String> {
    let canonical = serde_json::to_string(facts).context("failed to serialize fact record")?;
    let digest = Sha256::digest(canonical.as_bytes());
    Ok(format!("sha256:{digest:x}"))
}

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use sleepsense_api::{preview, rule_catalog, rule_show, SleepSenseApi, DEFAULT_TOP_PRIORITY};
use sleepsense_core::{requires_medical_attention, AssessmentRun, FactRecord, RunId};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const CLI_CONTRACT_VERSION: &str = "cli.v1";
const STDIN_MARKER: &str = "-";
const DEFAULT_RUN_LIMIT: usize = 20;

#[derive(Debug, Parser)]
#[command(name = "sleepsense")]
#[command(about = "Sleep hygiene assessment and recommendation CLI")]
struct Cli {
    #[arg(long, default_value = "./sleepsense.sqlite3")]
    db: PathBuf,

    /// Emit debug logs from every sleepsense crate on stderr.
    #[arg(long, global = true, default_value_t = false)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Analyze one assessment read from a JSON file, or `-` for stdin.
    Analyze(AnalyzeArgs),
    /// Print the default assessment answers as a starting template.
    Sample,
    /// Show the most recently analyzed assessment and its result.
    Results,
    Top(TopArgs),
    Export(ExportArgs),
    Rules {
        #[command(subcommand)]
        command: Box<RulesCommand>,
    },
    Runs {
        #[command(subcommand)]
        command: Box<RunsCommand>,
    },
    Db {
        #[command(subcommand)]
        command: Box<DbCommand>,
    },
}

#[derive(Debug, Args)]
struct AnalyzeArgs {
    #[arg(long)]
    input: PathBuf,
    #[arg(long, default_value_t = false)]
    no_persist: bool,
}

#[derive(Debug, Args)]
struct TopArgs {
    #[arg(long, default_value_t = DEFAULT_TOP_PRIORITY)]
    n: usize,
}

#[derive(Debug, Args)]
struct ExportArgs {
    #[arg(long)]
    out: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
enum RulesCommand {
    List,
    Show(RuleShowArgs),
}

#[derive(Debug, Args)]
struct RuleShowArgs {
    #[arg(long)]
    id: String,
}

#[derive(Debug, Subcommand)]
enum RunsCommand {
    List(RunsListArgs),
    Show(RunShowArgs),
}

#[derive(Debug, Args)]
struct RunsListArgs {
    #[arg(long, default_value_t = DEFAULT_RUN_LIMIT)]
    limit: usize,
}

#[derive(Debug, Args)]
struct RunShowArgs {
    #[arg(long)]
    run_id: String,
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    IntegrityCheck,
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn init_logging(verbose: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new(
                "sleepsense_core=debug,sleepsense_store_sqlite=debug,sleepsense_api=debug",
            )
        } else {
            EnvFilter::new("warn,sleepsense_api=info")
        }
    });

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr).with_target(false).without_time())
        .with(filter)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    tracing::debug!(db = %cli.db.display(), "using assessment database");
    let api = SleepSenseApi::new(cli.db);
    match cli.command {
        Command::Analyze(args) => run_analyze(&args, &api),
        Command::Sample => emit_json(serde_json::to_value(FactRecord::default())?),
        Command::Results => run_results(&api),
        Command::Top(args) => run_top(&args, &api),
        Command::Export(args) => run_export(&args, &api),
        Command::Rules { command } => run_rules(*command),
        Command::Runs { command } => run_runs(*command, &api),
        Command::Db { command } => run_db(*command, &api),
    }
}

fn run_analyze(args: &AnalyzeArgs, api: &SleepSenseApi) -> Result<()> {
    let facts = read_fact_record(&args.input)?;
    let run = if args.no_persist { preview(facts)? } else { api.analyze(facts)? };
    emit_json(analysis_payload(&run, !args.no_persist))
}

fn analysis_payload(run: &AssessmentRun, persisted: bool) -> Value {
    serde_json::json!({
        "persisted": persisted,
        "run_id": run.id.to_string(),
        "input_digest": run.input_digest,
        "requires_medical_attention": requires_medical_attention(&run.output),
        "result": run.output
    })
}

fn run_results(api: &SleepSenseApi) -> Result<()> {
    let latest = api.latest()?.ok_or_else(no_assessment_error)?;
    emit_json(serde_json::json!({
        "requires_medical_attention": requires_medical_attention(&latest.result),
        "input": latest.input,
        "result": latest.result
    }))
}

fn run_top(args: &TopArgs, api: &SleepSenseApi) -> Result<()> {
    let recommendations = api.top_priority(args.n)?.ok_or_else(no_assessment_error)?;
    emit_json(serde_json::json!({
        "n": args.n,
        "recommendations": recommendations
    }))
}

fn run_export(args: &ExportArgs, api: &SleepSenseApi) -> Result<()> {
    let record = api.export_latest()?.ok_or_else(no_assessment_error)?;

    let Some(out) = args.out.as_ref() else {
        return emit_json(serde_json::json!({ "export": record }));
    };

    let body = record.to_json_pretty().context("failed to serialize export envelope")?;
    fs::write(out, body)
        .with_context(|| format!("failed to write export file {}", out.display()))?;
    emit_json(serde_json::json!({
        "out": out.display().to_string(),
        "timestamp_unix": record.timestamp.unix_timestamp()
    }))
}

fn run_rules(command: RulesCommand) -> Result<()> {
    match command {
        RulesCommand::List => emit_json(serde_json::json!({ "rules": rule_catalog() })),
        RulesCommand::Show(args) => {
            let rule =
                rule_show(&args.id).ok_or_else(|| anyhow!("unknown rule id: {}", args.id))?;
            emit_json(serde_json::to_value(rule)?)
        }
    }
}

fn run_runs(command: RunsCommand, api: &SleepSenseApi) -> Result<()> {
    match command {
        RunsCommand::List(args) => {
            let runs = api.list_runs(args.limit)?;
            emit_json(serde_json::json!({ "runs": runs }))
        }
        RunsCommand::Show(args) => {
            let run_id = RunId::parse(&args.run_id)?;
            let run = api
                .run_show(run_id)?
                .ok_or_else(|| anyhow!("assessment run not found: {run_id}"))?;
            emit_json(serde_json::to_value(run)?)
        }
    }
}

fn run_db(command: DbCommand, api: &SleepSenseApi) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = api.schema_status()?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty()
            }))
        }
        DbCommand::Migrate(args) => emit_json(serde_json::to_value(api.migrate(args.dry_run)?)?),
        DbCommand::IntegrityCheck => emit_json(serde_json::to_value(api.integrity_check()?)?),
    }
}

fn read_fact_record(path: &Path) -> Result<FactRecord> {
    let body = if path.as_os_str() == STDIN_MARKER {
        io::read_to_string(io::stdin()).context("failed to read assessment from stdin")?
    } else {
        fs::read_to_string(path)
            .with_context(|| format!("failed to read assessment file {}", path.display()))?
    };

    serde_json::from_str(&body).context("assessment is not a valid fact record")
}

fn no_assessment_error() -> anyhow::Error {
    anyhow!("no assessment has been analyzed yet; run `sleepsense analyze` first")
}

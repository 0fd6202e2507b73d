//! Command surface for the provider migration tooling.
//!
//! Hosts embed the pipeline through:
//! - [`run_cli`] for full parsed CLI execution.
//! - [`run_command`] for executing a single [`Command`].
//!
//! JSON payloads go to stdout; logs go to stderr through [`init_tracing`].

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use provider_migrate_core::{
    extract_document, load_batches, translate_document, DeleteFlags, ExtractionPolicy,
    FieldDescriptor, MigrationDocument, MigrationPolicy, NamePattern, RecordKind,
    ReconciliationReport, SchemaAccessor, TranslatedBatches,
};
use provider_migrate_store_sqlite::{OwnerSelection, SqliteProviderStore, SqliteSourceProvider};
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

pub const DEFAULT_EXTRACT_PATH: &str = "./migration/extract.json";
pub const DEFAULT_LOAD_PATH: &str = "./migration/load.json";

#[derive(Debug, Parser)]
#[command(name = "pmig")]
#[command(about = "Migrate authenticators, search providers and AI providers across schema upgrades")]
pub struct Cli {
    /// Enable verbose debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Dump records from a legacy database into an interchange document
    Extract(ExtractArgs),
    /// Resolve and validate extracted records against the destination schema
    Translate(TranslateArgs),
    /// Reconcile translated records into the destination database
    Load(LoadArgs),
    /// Print the destination field descriptors for every kind
    Schema(SchemaArgs),
    Users {
        #[command(subcommand)]
        command: UsersCommand,
    },
}

#[derive(Debug, Args)]
pub struct ExtractArgs {
    #[arg(long)]
    source_db: PathBuf,
    #[arg(short, long, default_value = DEFAULT_EXTRACT_PATH)]
    output: PathBuf,
    /// Only extract records whose name matches this regex
    #[arg(long)]
    name_pattern: Option<String>,
    #[arg(long)]
    extraction_policy: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct TranslateArgs {
    #[arg(short, long, default_value = DEFAULT_EXTRACT_PATH)]
    input: PathBuf,
    #[arg(short, long, default_value = DEFAULT_LOAD_PATH)]
    output: PathBuf,
    #[arg(long)]
    target_db: PathBuf,
    #[arg(long)]
    policy: Option<PathBuf>,
    /// Only translate records whose name matches this regex
    #[arg(long)]
    name_pattern: Option<String>,
}

#[derive(Debug, Args)]
#[allow(clippy::struct_excessive_bools)]
pub struct LoadArgs {
    #[arg(short, long, default_value = DEFAULT_LOAD_PATH)]
    input: PathBuf,
    #[arg(long)]
    target_db: PathBuf,
    /// Delete existing records of each kind present in the load file before loading
    #[arg(short, long)]
    delete: bool,
    /// With -d, only delete Authenticators
    #[arg(long)]
    delete_auth: bool,
    /// With -d, only delete SearchProviders
    #[arg(long)]
    delete_sp: bool,
    /// With -d, only delete AIProviders
    #[arg(long)]
    delete_ai: bool,
    /// Owner username; must exist. Defaults to admin, then the first superuser
    #[arg(long)]
    owner: Option<String>,
    #[arg(long)]
    policy: Option<PathBuf>,
    /// Report what would change without writing
    #[arg(long)]
    dry_run: bool,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct SchemaArgs {
    #[arg(long)]
    target_db: PathBuf,
}

#[derive(Debug, Subcommand)]
pub enum UsersCommand {
    Add(UsersAddArgs),
}

#[derive(Debug, Args)]
pub struct UsersAddArgs {
    #[arg(long)]
    target_db: PathBuf,
    #[arg(long)]
    username: String,
    #[arg(long)]
    superuser: bool,
}

#[derive(Debug, Serialize)]
struct SchemaSnapshot {
    contract_version: &'static str,
    kinds: Vec<KindSchema>,
}

#[derive(Debug, Serialize)]
struct KindSchema {
    kind: RecordKind,
    fields: Vec<FieldDescriptor>,
}

/// Installs the stderr log subscriber. `RUST_LOG` overrides the level.
///
/// # Errors
/// Returns an error when a global subscriber is already installed.
pub fn init_tracing(verbose: bool) -> Result<()> {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .try_init()
        .map_err(|err| anyhow!("failed to install log subscriber: {err}"))
}

/// Executes the parsed top-level CLI command graph.
///
/// # Errors
/// Returns an error when any pipeline stage fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    run_command(cli.command)
}

/// Executes one command.
///
/// # Errors
/// Returns an error when input files are missing, a store cannot be opened,
/// or the pipeline stage fails.
pub fn run_command(command: Command) -> Result<()> {
    match command {
        Command::Extract(args) => run_extract(&args),
        Command::Translate(args) => run_translate(&args),
        Command::Load(args) => run_load(&args),
        Command::Schema(args) => {
            let store = open_destination(&args.target_db)?;
            let mut kinds = Vec::new();
            for kind in RecordKind::ALL {
                kinds.push(KindSchema {
                    kind,
                    fields: store.fields_of(kind)?,
                });
            }
            let snapshot = SchemaSnapshot {
                contract_version: "destination_schema.v1",
                kinds,
            };
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
            Ok(())
        }
        Command::Users { command } => match command {
            UsersCommand::Add(args) => {
                let store = open_destination(&args.target_db)?;
                store.add_user(&args.username, args.superuser)?;
                info!(username = %args.username, superuser = args.superuser, "user saved");
                Ok(())
            }
        },
    }
}

fn run_extract(args: &ExtractArgs) -> Result<()> {
    let policy = match &args.extraction_policy {
        Some(path) => ExtractionPolicy::from_json(&read_json(path)?)?,
        None => ExtractionPolicy::v1(),
    };
    let pattern = parse_name_pattern(args.name_pattern.as_deref())?;

    let source = SqliteSourceProvider::open(&args.source_db, policy)?;
    let document = extract_document(&source, pattern.as_ref())?;
    write_document(&args.output, &document)?;

    info!(
        output = %args.output.display(),
        authenticators = document.authenticators.len(),
        search_providers = document.search_providers.len(),
        ai_providers = document.ai_providers.len(),
        "wrote extracted data"
    );
    Ok(())
}

fn run_translate(args: &TranslateArgs) -> Result<()> {
    let document = read_document(&args.input)?;
    for (kind, count) in document.counts() {
        info!(%kind, count, "loaded records from input");
    }

    let policy = load_policy(args.policy.as_deref())?;
    let pattern = parse_name_pattern(args.name_pattern.as_deref())?;
    let store = open_destination(&args.target_db)?;

    let batches = translate_document(&document, &store, &policy, pattern.as_ref())?;
    write_document(&args.output, &batches.to_document())?;

    info!(output = %args.output.display(), "wrote translated, validated data");
    Ok(())
}

fn run_load(args: &LoadArgs) -> Result<()> {
    let document = read_document(&args.input)?;
    let policy = load_policy(args.policy.as_deref())?;

    let mut store = open_destination(&args.target_db)?;
    if let Some(owner) = &args.owner {
        store.set_owner_selection(OwnerSelection::Named(owner.clone()));
    }

    let flags = delete_flags(args);
    if !flags.global && flags.any_per_kind() {
        warn!("--delete-auth/--delete-sp/--delete-ai have no effect without -d");
    }

    let batches = TranslatedBatches::from_document(&document);
    let report = load_batches(&mut store, &policy, &flags, &batches, args.dry_run)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    Ok(())
}

fn delete_flags(args: &LoadArgs) -> DeleteFlags {
    DeleteFlags {
        global: args.delete,
        per_kind: BTreeMap::from([
            (RecordKind::Authenticator, args.delete_auth),
            (RecordKind::SearchProvider, args.delete_sp),
            (RecordKind::AiProvider, args.delete_ai),
        ]),
    }
}

fn open_destination(path: &Path) -> Result<SqliteProviderStore> {
    let store = SqliteProviderStore::open(path)?;
    store.migrate()?;
    Ok(store)
}

fn parse_name_pattern(raw: Option<&str>) -> Result<Option<NamePattern>> {
    Ok(raw.map(NamePattern::parse).transpose()?)
}

fn load_policy(path: Option<&Path>) -> Result<MigrationPolicy> {
    match path {
        Some(path) => Ok(MigrationPolicy::from_json(&read_json(path)?)?),
        None => Ok(MigrationPolicy::v1()),
    }
}

fn read_json(path: &Path) -> Result<serde_json::Value> {
    let body = read_input(path)?;
    serde_json::from_str(&body).with_context(|| format!("invalid JSON in {}", path.display()))
}

fn read_document(path: &Path) -> Result<MigrationDocument> {
    let body = read_input(path)?;
    MigrationDocument::from_json_str(&body)
        .with_context(|| format!("failed to read migration document {}", path.display()))
}

fn read_input(path: &Path) -> Result<String> {
    if !path.exists() {
        return Err(anyhow!("input file not found: {}", path.display()));
    }
    fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))
}

fn write_document(path: &Path, document: &MigrationDocument) -> Result<()> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.display()))?;
    }
    let mut body = document.to_json_pretty()?;
    body.push('\n');
    fs::write(path, body).with_context(|| format!("failed to write {}", path.display()))
}

fn print_report(report: &ReconciliationReport) {
    println!(
        "run_id={} owner={} dry_run={} generated_at={}",
        report.run_id, report.owner, report.dry_run, report.generated_at
    );
    println!("kind\tdelete_existing\tdeleted\tcreated\tupdated\tskipped");
    for item in &report.kinds {
        println!(
            "{}\t{}\t{}\t{}\t{}\t{}",
            item.kind,
            report.plan.should_delete(item.kind),
            item.deleted,
            item.created,
            item.updated,
            item.skipped
        );
    }
}

//! auditpipe CLI - route audit records and run their template pipelines
//!
//! Records are read as NDJSON from a file or stdin; results are written as
//! NDJSON to stdout. Logs go to stderr (`RUST_LOG`, default `info`).

use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::Value;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use auditpipe::runtime::{HandlerSet, Normalizer, RouteSelector, Settings, TemplateStore};
use auditpipe::serialization::{NdjsonWriter, RecordReader};
use auditpipe::EvaluatorRegistry;

#[derive(Parser)]
#[command(name = "auditpipe")]
#[command(version, about = "Rule-routed template pipelines for audit records", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate the handler configuration (and templates when given)
    Validate {
        /// Settings file
        #[arg(short, long, env = "AUDITPIPE_CONFIG", default_value = "config/auditpipe.yaml")]
        config: PathBuf,

        /// Template directory, overrides the settings file
        #[arg(short, long)]
        templates: Option<PathBuf>,
    },

    /// Show the handler and builder fields selected for each record
    Route {
        /// Settings file
        #[arg(short, long, env = "AUDITPIPE_CONFIG", default_value = "config/auditpipe.yaml")]
        config: PathBuf,

        /// NDJSON record file (default: stdin)
        #[arg(short, long)]
        input: Option<PathBuf>,
    },

    /// Route records and run their pipelines against the database
    Run {
        /// Settings file
        #[arg(short, long, env = "AUDITPIPE_CONFIG", default_value = "config/auditpipe.yaml")]
        config: PathBuf,

        /// Template directory, overrides the settings file
        #[arg(short, long)]
        templates: Option<PathBuf>,

        /// NDJSON record file (default: stdin)
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// Database URL, overrides DATABASE_URL and the settings file
        #[arg(long)]
        database_url: Option<String>,
    },
}

/// Routing decision printed by `route`.
#[derive(Serialize)]
struct RouteLine<'a> {
    record_id: i64,
    handler: &'a str,
    builder: &'a indexmap::IndexMap<String, Value>,
}

fn main() {
    dotenv::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Validate { config, templates } => validate(&config, templates),
        Commands::Route { config, input } => route(&config, input),
        Commands::Run {
            config,
            templates,
            input,
            database_url,
        } => run(&config, templates, input, database_url),
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}

/// Settings with environment overrides applied, plus the validated handlers.
fn load(config: &Path) -> Result<(Settings, HandlerSet)> {
    let mut settings = Settings::load_from_file(config)
        .with_context(|| format!("loading settings from {}", config.display()))?;
    settings.apply_env_overrides();

    let handlers = settings.handler_set(&EvaluatorRegistry::with_builtins())?;
    Normalizer::default().check_handlers(&handlers)?;

    tracing::info!(
        "{}: {} handlers loaded, unmatched records go to '{}'",
        settings.application,
        handlers.len(),
        settings.no_match_handler
    );
    Ok((settings, handlers))
}

fn load_templates(
    settings: &Settings,
    override_dir: Option<PathBuf>,
) -> Result<Option<TemplateStore>> {
    let Some(dir) = override_dir.or_else(|| settings.templates.clone()) else {
        return Ok(None);
    };

    let store = TemplateStore::load_from_dir(&dir)
        .with_context(|| format!("loading templates from {}", dir.display()))?;
    tracing::info!("{} templates loaded from {}", store.len(), dir.display());
    Ok(Some(store))
}

fn open_input(input: Option<PathBuf>) -> Result<RecordReader<Box<dyn BufRead>>> {
    let reader: Box<dyn BufRead> = match input {
        Some(path) => Box::new(BufReader::new(
            File::open(&path).with_context(|| format!("opening {}", path.display()))?,
        )),
        None => Box::new(BufReader::new(io::stdin())),
    };
    Ok(RecordReader::new(reader))
}

fn validate(config: &Path, templates: Option<PathBuf>) -> Result<()> {
    let (settings, handlers) = load(config)?;

    match load_templates(&settings, templates)? {
        Some(store) => handlers.check_executions(|key| store.has_template(key))?,
        None => tracing::warn!("no template directory configured, execution keys not checked"),
    }

    println!("configuration valid: {} handlers", handlers.len());
    Ok(())
}

fn route(config: &Path, input: Option<PathBuf>) -> Result<()> {
    let (_, handlers) = load(config)?;
    let router = RouteSelector::new(handlers, EvaluatorRegistry::with_builtins());
    let normalizer = Normalizer::default();

    let stdout = io::stdout();
    let mut writer = NdjsonWriter::new(stdout.lock());

    for record in open_input(input)? {
        let record = record?;
        let handler = router.select(&record);
        let builder = normalizer
            .normalize(&record, handler)
            .with_context(|| format!("normalizing record {}", record.id()))?;

        writer.write(&RouteLine {
            record_id: record.id(),
            handler: &handler.name,
            builder: &builder,
        })?;
    }

    writer.flush()?;
    Ok(())
}

#[cfg(feature = "postgres")]
fn run(
    config: &Path,
    templates: Option<PathBuf>,
    input: Option<PathBuf>,
    database_url: Option<String>,
) -> Result<()> {
    use auditpipe::diesel_runtime::{Database, SqlTemplateExecutor};
    use auditpipe::runtime::Engine;

    let (mut settings, handlers) = load(config)?;
    if let Some(url) = database_url {
        settings.database.url = Some(url);
    }

    let store = load_templates(&settings, templates)?
        .context("no template directory configured (templates or AUDITPIPE_TEMPLATES)")?;
    let database = Database::from_settings(&settings.database)?;
    database.test_connection()?;
    tracing::info!("database reachable");

    let engine = Engine::validated(
        RouteSelector::new(handlers, EvaluatorRegistry::with_builtins()),
        Normalizer::default(),
        SqlTemplateExecutor::new(database, store),
    )?;

    let stdout = io::stdout();
    let mut writer = NdjsonWriter::new(stdout.lock());
    let mut processed = 0usize;

    for record in open_input(input)? {
        // First failure stops the run; nothing after it is processed.
        let outcome = engine.handle(record?)?;
        writer.write(&outcome)?;
        processed += 1;
    }

    writer.flush()?;
    tracing::info!("{}: {} records processed", settings.application, processed);
    Ok(())
}

#[cfg(not(feature = "postgres"))]
fn run(
    _config: &Path,
    _templates: Option<PathBuf>,
    _input: Option<PathBuf>,
    _database_url: Option<String>,
) -> Result<()> {
    anyhow::bail!("auditpipe was built without the `postgres` feature")
}

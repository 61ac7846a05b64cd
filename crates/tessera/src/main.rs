mod steps;

use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use tessera_core::config::EngineConfig;
use tessera_core::dataset::{DatasetExt, DatasetRef};
use tessera_core::runtime::job::{Job, JobObserver};
use tessera_docstore::{Document, DocumentDataset, DocumentStore};
use tessera_error::{EngineError, Result, ResultExt};
use tessera_sqlite::{SqliteClient, SqliteDatabase};
use tracing::{debug, info};

/// Name of the table documents loaded from a file are inserted into.
const DOCUMENTS_TABLE: &str = "documents";

#[derive(Parser)]
#[clap(name = "tessera")]
struct Arguments {
    #[clap(subcommand)]
    source: Source,
    /// Engine setting as `name=value`, may be repeated.
    #[clap(long = "set", global = true)]
    settings: Vec<String>,
    /// Print the resulting dataset instead of materializing it.
    #[clap(long, global = true)]
    explain: bool,
    #[clap(long, value_enum, default_value_t = OutputFormat::Table, global = true)]
    format: OutputFormat,
    /// Default log level, overridden by RUST_LOG.
    #[clap(long, default_value = "warn", global = true)]
    log_level: tracing::Level,
    /// Log output format, `human` or `json`.
    #[clap(long, default_value = "human", global = true)]
    log_format: String,
}

#[derive(Subcommand)]
enum Source {
    /// Read a table from a SQLite database, listing tables when none is given.
    Sqlite {
        path: PathBuf,
        table: Option<String>,
        /// Operations to apply, such as `where:city=Delft sort:-population limit:10`.
        #[clap(trailing_var_arg = true)]
        steps: Vec<String>,
    },
    /// Read a JSON array of objects into an in-process document store.
    Documents {
        path: PathBuf,
        /// Field to index, may be repeated.
        #[clap(long = "index")]
        indexes: Vec<String>,
        /// Operations to apply.
        #[clap(trailing_var_arg = true)]
        steps: Vec<String>,
    },
    /// List engine settings.
    Settings,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

fn main() {
    let args = Arguments::parse();
    let log_format = logutil::LogFormat::from_name(&args.log_format).unwrap_or_default();
    logutil::configure_global_logger(args.log_level, log_format, io::stderr);

    // Outer result for the panic, inner is the execution result.
    let result = std::panic::catch_unwind(|| inner(args));

    match result {
        Ok(Err(err)) => {
            println!("ERROR: {err}");
            std::process::exit(1);
        }
        Err(err) => {
            println!("PANIC: {err:?}");
            std::process::exit(2);
        }
        Ok(Ok(())) => (),
    }
}

fn inner(args: Arguments) -> Result<()> {
    let config = Arc::new(build_config(&args.settings)?);
    let mut stdout = BufWriter::new(io::stdout());

    let (dataset, step_args) = match args.source {
        Source::Settings => {
            for (name, description) in EngineConfig::describe() {
                writeln!(stdout, "{name:<20} {:<12} {description}", config.get(name)?.to_string())?;
            }
            stdout.flush()?;
            return Ok(());
        }
        Source::Sqlite {
            path,
            table,
            steps: step_args,
        } => {
            let client = SqliteClient::open(&path)?;
            let database = Arc::new(SqliteDatabase::with_client(client, config.batch_size));
            let Some(table) = table else {
                for name in database.table_names()? {
                    writeln!(stdout, "{name}")?;
                }
                stdout.flush()?;
                return Ok(());
            };
            (database.dataset(&table)?, step_args)
        }
        Source::Documents {
            path,
            indexes,
            steps: step_args,
        } => (load_documents(&path, &indexes, config.batch_size)?, step_args),
    };

    let mut dataset = if config.enable_coalescing {
        dataset.coalesced_with(&config)
    } else {
        dataset
    };
    for step in &step_args {
        let operation = steps::parse_step(step)?;
        debug!(step = %step, operation = operation.name(), "applying step");
        dataset = dataset.apply_with(operation, &config);
    }

    if args.explain {
        explain(&mut stdout, &dataset)?;
        stdout.flush()?;
        return Ok(());
    }

    let job = Job::new(config.default_qos);
    let observer: Arc<dyn JobObserver> = Arc::new(ProgressLogger);
    let token = job.add_observer(&observer);
    let raster = dataset.wait_raster(&job);
    job.remove_observer(token);
    let raster = raster?;
    info!(rows = raster.row_count(), columns = raster.column_count(), "materialized dataset");

    match args.format {
        OutputFormat::Table => write!(stdout, "{raster}")?,
        OutputFormat::Json => {
            serde_json::to_writer_pretty(&mut stdout, raster.as_ref())
                .context("Failed to write JSON output")?;
            writeln!(stdout)?;
        }
    }
    stdout.flush()?;

    Ok(())
}

fn build_config(settings: &[String]) -> Result<EngineConfig> {
    let mut config = EngineConfig::default();
    for setting in settings {
        let (name, value) = setting.split_once('=').ok_or_else(|| {
            EngineError::new("Expected setting as 'name=value'").with_field("setting", setting)
        })?;
        config.set(name.trim(), &steps::parse_literal(value.trim()))?;
    }
    Ok(config)
}

fn load_documents(
    path: &Path,
    indexes: &[String],
    batch_size: usize,
) -> Result<DatasetRef> {
    let content = std::fs::read_to_string(path)?;
    let documents: Vec<Document> = serde_json::from_str(&content)
        .context_fn(|| format!("Failed to parse documents from '{}'", path.display()))?;

    let store = DocumentStore::with_batch_size(batch_size);
    store.create_table(DOCUMENTS_TABLE)?;
    for index in indexes {
        store.create_index(DOCUMENTS_TABLE, index)?;
    }
    let keys = store.insert(DOCUMENTS_TABLE, documents)?;
    debug!(count = keys.len(), "loaded documents");

    DocumentDataset::table(&store, DOCUMENTS_TABLE)
}

/// Prints the pushed down query when the dataset has one, otherwise the
/// dataset tree.
fn explain(out: &mut impl Write, dataset: &DatasetRef) -> Result<()> {
    if let Some(sql) = dataset.as_sql() {
        writeln!(out, "{}", sql.sql())?;
        return Ok(());
    }
    if let Some(documents) = dataset
        .as_any()
        .and_then(|any| any.downcast_ref::<DocumentDataset>())
    {
        let query = serde_json::to_string_pretty(documents.query())
            .context("Failed to serialize query")?;
        writeln!(out, "{query}")?;
        return Ok(());
    }
    writeln!(out, "{dataset:#?}")?;
    Ok(())
}

struct ProgressLogger;

impl JobObserver for ProgressLogger {
    fn job_progress(&self, job: &Job, progress: f64) {
        debug!(job_id = job.id(), progress, "job progress");
    }
}

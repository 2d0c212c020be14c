use text2sql::orchestrator::{DEFAULT_ROW_LIMIT, Orchestrator, ProgressListener, Stage};
use text2sql::output;
use text2sql::{BatchOptions, Config, QueryOutcome, RunOptions};

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::error;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "text2sql")]
#[command(about = "Ask questions of a MySQL or SQL Server database in natural language")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(clap::Args, Clone, Copy)]
struct OutputFlags {
    /// Maximum rows to request from the model
    #[arg(long, default_value_t = DEFAULT_ROW_LIMIT)]
    limit: usize,

    /// Also fetch the execution plan
    #[arg(long)]
    explain: bool,

    /// Validate the SQL without executing it
    #[arg(long)]
    dry_run: bool,

    /// Print results as JSON
    #[arg(long)]
    json: bool,

    /// Print results as CSV
    #[arg(long)]
    csv: bool,

    /// Print the table/column map before results
    #[arg(long)]
    show_schema: bool,

    /// Also write results to a timestamped file under ./results
    #[arg(long)]
    save: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Answer a single question
    Ask {
        /// The question in natural language
        question: String,

        #[command(flatten)]
        flags: OutputFlags,
    },
    /// Interactive prompt (default)
    Repl {
        #[command(flatten)]
        flags: OutputFlags,
    },
    /// Run every question in a JSON or CSV file
    Batch {
        /// JSON array of questions, or CSV with a `question` column
        file: PathBuf,

        #[arg(long, default_value_t = DEFAULT_ROW_LIMIT)]
        limit: usize,

        #[arg(long)]
        dry_run: bool,
    },
    /// Print connection details and the table map
    Schema,
}

/// Prints pipeline stages to stderr.
struct StderrProgress;

impl ProgressListener for StderrProgress {
    fn on_stage(&self, stage: Stage) {
        if stage != Stage::Done {
            eprintln!("  .. {}", stage.label());
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(io::stderr)
        .init();

    let args = Args::parse();
    let config = Config::from_env()?;

    match args.command {
        Some(Commands::Ask { question, flags }) => {
            let orchestrator = Orchestrator::from_config(config).with_progress(Arc::new(StderrProgress));
            let outcome = orchestrator.run(&run_options(&question, &flags)).await?;
            print_outcome(&outcome, &flags)?;
        }
        Some(Commands::Batch {
            file,
            limit,
            dry_run,
        }) => {
            let orchestrator = Orchestrator::from_config(config);
            let results = orchestrator
                .run_batch_file(&file, BatchOptions { limit, dry_run })
                .await?;
            println!("{}", serde_json::to_string_pretty(&results)?);
        }
        Some(Commands::Schema) => {
            let orchestrator = Orchestrator::from_config(config);
            let info = orchestrator.database_info().await?;
            println!(
                "{} @ {}:{} ({}, {} tables)",
                info.db, info.host, info.port, info.dialect, info.table_count
            );
            for (table, columns) in &info.tables {
                println!("{}: {}", table, columns.join(", "));
            }
        }
        Some(Commands::Repl { flags }) => repl(config, flags).await?,
        None => {
            repl(
                config,
                OutputFlags {
                    limit: DEFAULT_ROW_LIMIT,
                    explain: false,
                    dry_run: false,
                    json: false,
                    csv: false,
                    show_schema: false,
                    save: false,
                },
            )
            .await?
        }
    }

    Ok(())
}

fn run_options(question: &str, flags: &OutputFlags) -> RunOptions {
    RunOptions {
        question: question.to_string(),
        limit: flags.limit,
        explain: flags.explain,
        dry_run: flags.dry_run,
        show_schema: flags.show_schema,
    }
}

/// Console text for one outcome. JSON mode serializes the whole outcome,
/// rejections included.
fn render_outcome(outcome: &QueryOutcome, flags: &OutputFlags) -> Result<String> {
    if flags.json {
        return Ok(serde_json::to_string_pretty(outcome)?);
    }

    let mut lines = Vec::new();
    if let Some(ref schema) = outcome.schema {
        for (table, columns) in schema {
            lines.push(format!("{}: {}", table, columns.join(", ")));
        }
    }

    if let Some(ref rejection) = outcome.rejection {
        lines.push(format!("Rejected ({:?}): {}", rejection.kind, rejection.message));
        if !outcome.missing_terms.is_empty() {
            lines.push(format!(
                "Terms not found in the schema: {}",
                outcome.missing_terms.join(", ")
            ));
        }
        return Ok(lines.join("\n"));
    }

    if flags.csv && !flags.dry_run {
        lines.push(output::to_csv(&outcome.headers, &outcome.rows)?.trim_end().to_string());
    } else {
        lines.push(outcome.sql.clone().unwrap_or_default());
        if !flags.dry_run {
            lines.push(output::to_table(&outcome.headers, &outcome.rows));
        }
        if !outcome.plan_headers.is_empty() {
            lines.push(output::to_table(&outcome.plan_headers, &outcome.plan_rows));
        }
    }
    Ok(lines.join("\n"))
}

fn print_outcome(outcome: &QueryOutcome, flags: &OutputFlags) -> Result<()> {
    println!("{}", render_outcome(outcome, flags)?);

    if outcome.rejection.is_some() || !flags.save || flags.dry_run {
        return Ok(());
    }
    let sql = outcome.sql.as_deref().unwrap_or_default();
    let dir = Path::new(output::DEFAULT_RESULTS_DIR);
    let path = if flags.csv {
        output::save_csv(dir, &outcome.question, sql, &outcome.headers, &outcome.rows)?
    } else {
        output::save_json(dir, &outcome.question, sql, &outcome.headers, &outcome.rows)?
    };
    println!("Saved to {}", path.display());
    Ok(())
}

const REPL_HELP: &str = "Commands:
  <question>   ask a question
  -h           show this help
  -e           toggle execution plan
  -d           toggle dry run (show SQL only)
  -j           toggle JSON output
  -c           toggle CSV output
  -s           toggle schema display
  -l N         set the row limit
  -m NAME      switch model
  exit         quit";

async fn repl(config: Config, mut flags: OutputFlags) -> Result<()> {
    let orchestrator = Orchestrator::from_config(config).with_progress(Arc::new(StderrProgress));

    match orchestrator.load_schema().await {
        Ok(schema) => println!("Connected ({} tables)", schema.table_count()),
        Err(e) => {
            println!("Database connection failed: {}", e);
            return Ok(());
        }
    }
    println!("Type '-h' for help, 'exit' to quit");

    loop {
        print!("> ");
        io::stdout().flush()?;
        let mut line = String::new();
        if io::stdin().read_line(&mut line)? == 0 {
            break;
        }
        let input = line.trim();
        if input.is_empty() {
            continue;
        }

        let lowered = input.to_lowercase();
        match lowered.as_str() {
            "exit" | "quit" => break,
            "-h" | "-help" | "--help" => {
                println!("{}", REPL_HELP);
                continue;
            }
            "-e" => {
                flags.explain = !flags.explain;
                println!("explain={}", flags.explain);
                continue;
            }
            "-d" => {
                flags.dry_run = !flags.dry_run;
                println!("dry_run={}", flags.dry_run);
                continue;
            }
            "-j" => {
                flags.json = !flags.json;
                println!("json={}", flags.json);
                continue;
            }
            "-c" => {
                flags.csv = !flags.csv;
                println!("csv={}", flags.csv);
                continue;
            }
            "-s" => {
                flags.show_schema = !flags.show_schema;
                println!("show_schema={}", flags.show_schema);
                continue;
            }
            _ => {}
        }

        if lowered.starts_with("-l") {
            match input.split_whitespace().nth(1).map(str::parse::<usize>) {
                Some(Ok(limit)) => {
                    flags.limit = limit;
                    println!("LIMIT={}", limit);
                }
                _ => println!("Usage: -l 100"),
            }
            continue;
        }
        if lowered.starts_with("-m") {
            match input.split_whitespace().nth(1) {
                Some(name) => {
                    orchestrator.reconfigure_model(name);
                    println!("model={}", orchestrator.model());
                }
                None => println!("Usage: -m MODEL_NAME"),
            }
            continue;
        }

        match orchestrator.run(&run_options(input, &flags)).await {
            Ok(outcome) => print_outcome(&outcome, &flags)?,
            Err(e) => {
                error!("Query failed: {}", e);
                println!("Error: {}", e);
            }
        }
    }

    Ok(())
}

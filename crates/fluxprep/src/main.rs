use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use comfy_table::{presets::UTF8_FULL, Table};
use fluxprep_core::batch::{control_for_input, discover_input_files, run_batch, BatchReport};
use fluxprep_core::compliance::{check_file_config, check_step_config, MessageLog};
use fluxprep_core::levels::all_processing_levels;
use fluxprep_core::registry::all_correction_descriptors;
use fluxprep_core::sink::DatasetSink;
use fluxprep_core::{CancellationFlag, ControlFile, MemorySink, ParquetSink};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const CONTROL_FILE_ENV: &str = "FLUXPREP_CONTROL_FILE";

#[derive(Parser, Debug)]
#[command(author, version, about = "Eddy-covariance pre-processing CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check a control file against the reference schema without reading any data
    Check(ControlArgs),
    /// Run every configured correction over every input file
    Run(RunArgs),
    /// List the registered corrections and processing levels
    Corrections,
}

#[derive(Args, Debug)]
struct ControlArgs {
    /// Control file (TOML). Falls back to FLUXPREP_CONTROL_FILE.
    #[arg(short, long)]
    control: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct RunArgs {
    #[command(flatten)]
    control: ControlArgs,
    /// Print the batch report as JSON
    #[arg(long)]
    json: bool,
    /// Run the corrections without writing any output
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Check(args) => {
            let control = load_control(&args)?;
            check(&control)
        }
        Command::Run(args) => {
            let control = load_control(&args.control)?;
            let report = run(control, args.dry_run).await?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_batch(&report);
            }
            if report.failed_count() > 0 {
                bail!("{} of {} files failed", report.failed_count(), report.files.len());
            }
            Ok(())
        }
        Command::Corrections => {
            print_registry();
            Ok(())
        }
    }
}

fn load_control(args: &ControlArgs) -> Result<ControlFile> {
    let path = match &args.control {
        Some(path) => path.clone(),
        None => std::env::var(CONTROL_FILE_ENV)
            .map(PathBuf::from)
            .with_context(|| format!("--control or {CONTROL_FILE_ENV} must be set"))?,
    };
    let control = ControlFile::load(&path)
        .with_context(|| format!("failed to load control file {}", path.display()))?;
    info!(path = %path.display(), "Loaded control file");
    Ok(control)
}

fn check(control: &ControlFile) -> Result<()> {
    let files = control.files().context("control file has no usable Files section")?;
    let file_control = match discover_input_files(&files) {
        Ok(inputs) => match inputs.first() {
            Some(first) => control_for_input(control, &files, first),
            None => control.clone(),
        },
        Err(err) => {
            warn!(error = %err, "Could not discover input files, checking as written");
            control.clone()
        }
    };

    let mut messages = MessageLog::new();
    let file_report = check_file_config(&file_control);
    let mut ok = file_report.ok;
    messages.extend(file_report.messages);

    let steps = file_control
        .correction_steps()
        .context("failed to read Corrections")?;
    for step in &steps {
        let report = check_step_config(&file_control, step);
        ok &= report.ok;
        messages.extend(report.messages);
    }

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["Severity", "Message"]);
    for (severity, message) in messages.iter() {
        table.add_row(vec![severity.as_str(), message]);
    }
    println!("{table}");

    if !ok {
        bail!("control file failed compliance checks");
    }
    println!("Control file OK ({} correction steps)", steps.len());
    Ok(())
}

async fn run(control: ControlFile, dry_run: bool) -> Result<BatchReport> {
    let cancel = CancellationFlag::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping after the current step");
            on_signal.cancel();
        }
    });

    let report = tokio::task::spawn_blocking(move || {
        let mut sink: Box<dyn DatasetSink> = if dry_run {
            Box::new(MemorySink::new())
        } else {
            Box::new(ParquetSink::new())
        };
        run_batch(&control, sink.as_mut(), &cancel)
    })
    .await
    .context("correction worker panicked")??;
    Ok(report)
}

fn print_batch(report: &BatchReport) {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["File", "Applied", "Skipped", "Output", "Error"]);
    for file in &report.files {
        let (applied, skipped, output) = match &file.summary {
            Some(summary) => (
                summary.applied_count().to_string(),
                summary.skipped_count().to_string(),
                summary
                    .final_output
                    .as_ref()
                    .map(|path| path.display().to_string())
                    .unwrap_or_default(),
            ),
            None => (String::new(), String::new(), String::new()),
        };
        table.add_row(vec![
            file.input.relative_path.display().to_string(),
            applied,
            skipped,
            output,
            file.error.clone().unwrap_or_default(),
        ]);
    }
    println!("{table}");
    if report.cancelled {
        println!("Batch cancelled before every file was processed");
    }
}

fn print_registry() {
    let mut corrections = Table::new();
    corrections.load_preset(UTF8_FULL);
    corrections.set_header(vec!["func_name", "Aliases", "standard_name", "Description"]);
    for descriptor in all_correction_descriptors() {
        corrections.add_row(vec![
            descriptor.function_name.to_string(),
            descriptor.aliases.join(", "),
            descriptor.standard_name.to_string(),
            descriptor.description.to_string(),
        ]);
    }
    println!("{corrections}");

    let mut levels = Table::new();
    levels.load_preset(UTF8_FULL);
    levels.set_header(vec!["Key", "Level", "Folder", "Also known as"]);
    for level in all_processing_levels() {
        levels.add_row(vec![
            level.key.to_string(),
            level.long_name.to_string(),
            level.folder(),
            level.aka.to_string(),
        ]);
    }
    println!("{levels}");
}

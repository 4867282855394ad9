use std::process::ExitCode;
use std::time::Duration;

use chrono::{Local, NaiveDate};
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing::info;
use tracing_subscriber::EnvFilter;

use extract_bundler::app::{BundleResult, Bundler, BundlerSettings, ProgressEvent, ProgressSink};
use extract_bundler::cancel::CancellationToken;
use extract_bundler::catalog::CatalogHttpClient;
use extract_bundler::config::{ConfigLoader, ResolvedConfig, TargetRequest};
use extract_bundler::convert::{ContainerConverter, SystemCommandRunner};
use extract_bundler::domain::BundleTarget;
use extract_bundler::error::BundlerError;
use extract_bundler::fetch::HttpSourceFetcher;
use extract_bundler::output::{JsonOutput, TargetRow};
use extract_bundler::upload::{AzureBlockStore, ChunkedUploader, S3ObjectStore};
use extract_bundler::verify::{VerifyReport, verify_extracts};

#[derive(Parser)]
#[command(name = "extract-bundler")]
#[command(about = "Assembles, publishes and uploads the registry extract bundles")]
#[command(version, author)]
struct Cli {
    /// Print results as JSON on stdout
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Build and upload bundles for the enabled targets")]
    Run(RunArgs),
    #[command(about = "Check that today's bundles exist in both stores")]
    Verify(VerifyArgs),
    #[command(about = "List bundle targets and their artifact names")]
    Targets,
}

#[derive(Args)]
struct RunArgs {
    /// Restrict the run to these targets (default: every enabled target)
    #[arg(long = "target", value_enum)]
    targets: Vec<BundleTarget>,

    #[arg(long)]
    config: Option<String>,

    /// Cancel every pipeline once this many minutes have passed
    #[arg(long)]
    deadline_mins: Option<u64>,
}

#[derive(Args)]
struct VerifyArgs {
    #[arg(long = "target", value_enum)]
    targets: Vec<BundleTarget>,

    #[arg(long)]
    config: Option<String>,

    /// Date embedded in the object names, as YYYY-MM-DD (default: today)
    #[arg(long)]
    date: Option<NaiveDate>,
}

struct LogSink;

impl ProgressSink for LogSink {
    fn event(&self, event: ProgressEvent) {
        match event.elapsed {
            Some(elapsed) => info!(
                bundle = %event.target,
                elapsed_ms = elapsed.as_millis() as u64,
                "{}",
                event.message
            ),
            None => info!(bundle = %event.target, "{}", event.message),
        }
    }
}

fn main() -> ExitCode {
    match run() {
        Ok(code) => ExitCode::from(code),
        Err(report) => {
            eprintln!("{report:?}");
            if let Some(err) = report.downcast_ref::<BundlerError>() {
                return ExitCode::from(err.exit_code());
            }
            ExitCode::from(1)
        }
    }
}

fn run() -> miette::Result<u8> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run(args) => run_bundles(args, cli.json),
        Commands::Verify(args) => run_verify(args, cli.json),
        Commands::Targets => run_targets(cli.json),
    }
}

fn run_bundles(args: RunArgs, json: bool) -> miette::Result<u8> {
    let config = ConfigLoader::resolve(args.config.as_deref())?;
    let requests = select_requests(&config, &args.targets)?;
    if requests.is_empty() {
        return Err(BundlerError::InvalidConfig("no bundle targets enabled".to_string()).into());
    }

    let bundler = Bundler::new(
        HttpSourceFetcher::new()?,
        CatalogHttpClient::from_settings(&config.catalog)?,
        S3ObjectStore::from_settings(&config.primary_store)?,
        ChunkedUploader::new(AzureBlockStore::from_settings(&config.namespaced_store)?),
        ContainerConverter::new(
            SystemCommandRunner::new(),
            config.conversion.tool.clone(),
            config.conversion.workspace.clone(),
        ),
        BundlerSettings {
            instruction_pdf: config.instruction_pdf.clone(),
            is_test: config.namespaced_store.is_test,
        },
    );

    let cancel = CancellationToken::new();
    if let Some(minutes) = args.deadline_mins {
        cancel.cancel_after(deadline(minutes));
    }

    let results = if json {
        bundler.run_all(&requests, &JsonOutput, &cancel)
    } else {
        bundler.run_all(&requests, &LogSink, &cancel)
    };

    if json {
        JsonOutput::print_results(&results).into_diagnostic()?;
    } else {
        print_run_summary(&results);
    }
    Ok(results
        .iter()
        .map(BundleResult::exit_code)
        .max()
        .unwrap_or(0))
}

fn deadline(minutes: u64) -> Duration {
    Duration::from_secs(minutes.saturating_mul(60))
}

fn select_requests(
    config: &ResolvedConfig,
    targets: &[BundleTarget],
) -> Result<Vec<TargetRequest>, BundlerError> {
    if targets.is_empty() {
        return Ok(config.targets.clone());
    }
    targets
        .iter()
        .map(|target| {
            config.target(*target).cloned().ok_or_else(|| {
                BundlerError::InvalidConfig(format!("target {target} is not enabled"))
            })
        })
        .collect()
}

fn run_verify(args: VerifyArgs, json: bool) -> miette::Result<u8> {
    let config = ConfigLoader::resolve(args.config.as_deref())?;
    let targets = if args.targets.is_empty() {
        BundleTarget::ALL.to_vec()
    } else {
        args.targets
    };
    let date = args.date.unwrap_or_else(|| Local::now().date_naive());

    let primary = S3ObjectStore::from_settings(&config.primary_store)?;
    let namespaced = ChunkedUploader::new(AzureBlockStore::from_settings(&config.namespaced_store)?);
    let report = verify_extracts(
        &targets,
        &primary,
        &namespaced,
        date,
        config.namespaced_store.is_test,
    )?;

    if json {
        JsonOutput::print_verify(&report).into_diagnostic()?;
    } else {
        print_verify_summary(&report);
    }
    Ok(if report.is_complete() { 0 } else { 1 })
}

fn run_targets(json: bool) -> miette::Result<u8> {
    let rows = BundleTarget::ALL
        .into_iter()
        .map(TargetRow::from)
        .collect::<Vec<_>>();
    if json {
        JsonOutput::print_targets(&rows).into_diagnostic()?;
        return Ok(0);
    }
    for row in rows {
        println!(
            "{:<14} {:<28} test={} prod={}",
            row.target.as_str(),
            row.namespaced_zip,
            row.catalog_prefix_test,
            row.catalog_prefix_production
        );
        for source in row.required_sources {
            println!("    {source}");
        }
    }
    Ok(0)
}

fn print_run_summary(results: &[BundleResult]) {
    for result in results {
        let status = if result.success { "ok" } else { "FAILED" };
        println!("{} {status}", result.target);
        for artifact in &result.artifacts_uploaded {
            println!("  uploaded {artifact}");
        }
        for failure in &result.errors {
            println!("  error [{:?}] {}", failure.stage, failure.message);
        }
        for failure in &result.warnings {
            println!("  warning [{:?}] {}", failure.stage, failure.message);
        }
    }
}

fn print_verify_summary(report: &VerifyReport) {
    if report.is_complete() {
        println!("all extracts for {} are present", report.date);
        return;
    }
    for message in &report.missing {
        println!("{message}");
    }
}

use std::process::ExitCode;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use envirocode::config::{ConfigLoader, ResolvedConfig, parse_end_instant, parse_instant};
use envirocode::domain::{CancelFlag, Coordinate, TimeRange};
use envirocode::environment::Environment;
use envirocode::error::EnviroError;
use envirocode::output::JsonOutput;
use envirocode::registry::ServiceRegistry;

#[derive(Parser)]
#[command(name = "envirocode")]
#[command(about = "Cache environmental data sources locally and aggregate them at a place and time")]
#[command(version, author)]
struct Cli {
    /// Path to the configuration file (default: ./envirocode.json).
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    #[command(about = "Populate the caches of every configured service")]
    Load(LoadArgs),
    #[command(about = "Compute statistics at a coordinate and time")]
    Query(QueryArgs),
    #[command(about = "List configured services and their cache state")]
    Services,
}

#[derive(Args)]
struct LoadArgs {
    /// First instant, RFC 3339 or YYYY-MM-DD. Defaults to the configured period.
    #[arg(long)]
    start: Option<String>,

    /// Last instant, RFC 3339 or YYYY-MM-DD (whole day).
    #[arg(long)]
    end: Option<String>,
}

#[derive(Args)]
struct QueryArgs {
    #[arg(long, allow_hyphen_values = true)]
    lon: f64,

    #[arg(long, allow_hyphen_values = true)]
    lat: f64,

    /// RFC 3339 timestamp, or YYYY-MM-DD for midnight UTC.
    #[arg(long)]
    date: String,

    /// Restrict the answer to these variables.
    #[arg(long = "variable")]
    variables: Vec<String>,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(error) = report.downcast_ref::<EnviroError>() {
            return ExitCode::from(map_exit_code(error));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &EnviroError) -> u8 {
    if error.is_fatal() {
        2
    } else if error.is_upstream() {
        3
    } else {
        1
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = ConfigLoader::resolve(cli.config.as_deref())?;
    let registry = ServiceRegistry::from_config(&config)?;
    let environment = Environment::new(Arc::new(registry));

    match cli.command {
        Command::Load(args) => run_load(args, &config, &environment),
        Command::Query(args) => run_query(args, &environment),
        Command::Services => {
            JsonOutput::print_services(&environment.describe_services()).into_diagnostic()
        }
    }
}

fn run_load(
    args: LoadArgs,
    config: &ResolvedConfig,
    environment: &Environment,
) -> miette::Result<()> {
    let range = match (args.start, args.end) {
        (Some(start), Some(end)) => TimeRange::new(parse_instant(&start)?, parse_end_instant(&end)?)?,
        (None, None) => config.period.ok_or_else(|| {
            EnviroError::InvalidConfiguration(
                "no load period: pass --start and --end or set `period` in the config".to_string(),
            )
        })?,
        _ => {
            return Err(EnviroError::InvalidConfiguration(
                "--start and --end must be given together".to_string(),
            )
            .into());
        }
    };

    let summary = environment.load_all(&range, &CancelFlag::new());
    JsonOutput::print_summary(&summary).into_diagnostic()?;
    if summary.is_success() {
        Ok(())
    } else {
        let failed: usize = summary
            .services
            .values()
            .map(|report| report.failed.len() + report.cancelled.len())
            .sum();
        Err(miette::miette!("{failed} sub-range(s) were not loaded"))
    }
}

fn run_query(args: QueryArgs, environment: &Environment) -> miette::Result<()> {
    let coordinate = Coordinate::new(args.lon, args.lat)?;
    let time = parse_instant(&args.date)?;
    let result = if args.variables.is_empty() {
        environment.query(&coordinate, time)
    } else {
        environment.query_variables(&coordinate, time, &args.variables)
    };
    JsonOutput::print_result(&result).into_diagnostic()
}

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use serde::Serialize;

use hobs_toolkit::app::{App, ProgressSink, ProgressSinkKind};
use hobs_toolkit::domain::{ConfigRequest, MvmRequest, RequestId, Stage};
use hobs_toolkit::error::HobsError;
use hobs_toolkit::hobs::HobsHttpClient;
use hobs_toolkit::mirror::FsObjectStore;
use hobs_toolkit::output::{self, JsonOutput, OutputMode};
use hobs_toolkit::poll::PollPolicy;
use hobs_toolkit::settings::{Settings, SettingsLoader};
use hobs_toolkit::staging;
use hobs_toolkit::tui::Tui;

type HobsApp = App<HobsHttpClient, FsObjectStore>;

#[derive(Parser)]
#[command(name = "hobs")]
#[command(about = "Request simulation configs and measured-vs-modeled data from HOBS")]
#[command(version, author)]
struct Cli {
    #[arg(long, global = true)]
    non_interactive: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(subcommand, about = "Simulation config requests")]
    Configs(ConfigsCommand),
    #[command(subcommand, about = "Measured-vs-modeled requests")]
    Mvm(MvmCommand),
    #[command(about = "Check the status of a request once")]
    Status(RequestArgs),
    #[command(about = "Poll a request until it succeeds or fails")]
    Wait(WaitCommandArgs),
    #[command(about = "Print the download URL of a finished request")]
    ResultUrl(RequestArgs),
    #[command(about = "Download the concatenated HOBS tables and load them into SQLite")]
    Stage(StageArgs),
    #[command(about = "Download the HOBS overview table into SQLite")]
    HobsTable(DbArgs),
    #[command(about = "List tables in the staging database")]
    Tables(DbArgs),
    #[command(about = "Run a SQL query against the staging database")]
    Query(QueryArgs),
}

#[derive(Subcommand)]
enum ConfigsCommand {
    #[command(about = "Submit a config request")]
    Submit(ConfigSubmitArgs),
    #[command(about = "Download and normalize the configs of a finished request")]
    Fetch(RequestArgs),
    #[command(about = "Fetch configs and mirror them to the bucket")]
    Save(RequestArgs),
    #[command(about = "Read previously mirrored configs")]
    Retrieve(RequestArgs),
}

#[derive(Subcommand)]
enum MvmCommand {
    #[command(about = "Submit a measured-vs-modeled request")]
    Submit(MvmSubmitArgs),
    #[command(about = "Download and normalize measured-vs-modeled results")]
    Fetch(RequestArgs),
}

#[derive(Args)]
struct RequestArgs {
    request_id: String,
}

#[derive(Args, Clone)]
struct PollArgs {
    /// Seconds between status checks.
    #[arg(long)]
    interval: Option<u64>,

    /// Give up after this many status checks (0 = never).
    #[arg(long, conflicts_with = "unbounded")]
    max_attempts: Option<u32>,

    #[arg(long)]
    unbounded: bool,
}

#[derive(Args)]
struct WaitCommandArgs {
    request_id: String,

    #[command(flatten)]
    poll: PollArgs,
}

#[derive(Args)]
struct ConfigSubmitArgs {
    #[arg(required = true)]
    studies: Vec<String>,

    #[arg(long = "stage")]
    stages: Vec<String>,

    /// Regenerate configs instead of reusing cached ones.
    #[arg(long)]
    refresh: bool,

    /// Wait for the request and fetch its configs.
    #[arg(long)]
    wait: bool,

    #[command(flatten)]
    poll: PollArgs,
}

#[derive(Args)]
struct MvmSubmitArgs {
    #[arg(required = true)]
    studies: Vec<String>,

    #[arg(long = "stage")]
    stages: Vec<String>,

    #[arg(long)]
    interpolation: Option<String>,

    #[arg(long)]
    wait: bool,

    #[command(flatten)]
    poll: PollArgs,
}

#[derive(Args)]
struct StageArgs {
    #[arg(long, default_value = "production")]
    stage: String,

    #[command(flatten)]
    db: DbArgs,
}

#[derive(Args)]
struct DbArgs {
    #[arg(long)]
    db: Option<PathBuf>,
}

#[derive(Args)]
struct QueryArgs {
    sql: String,

    #[command(flatten)]
    db: DbArgs,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(error) = report.downcast_ref::<HobsError>() {
            return ExitCode::from(map_exit_code(error));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &HobsError) -> u8 {
    match error {
        HobsError::MissingSetting(_)
        | HobsError::InvalidSetting { .. }
        | HobsError::CredentialsRead { .. }
        | HobsError::CredentialsParse { .. }
        | HobsError::ObjectNotFound(_) => 2,
        error if error.is_remote() => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(output::log_filter(std::env::var("RUST_LOG").ok().as_deref()))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let output_mode = if cli.non_interactive {
        OutputMode::NonInteractive
    } else {
        OutputMode::Interactive
    };

    match cli.command {
        Commands::Tables(args) => {
            let conn = staging::open_database(&local_db_path(args.db)).map_err(miette::Report::new)?;
            let tables = staging::table_names(&conn).map_err(miette::Report::new)?;
            JsonOutput::print(&tables).into_diagnostic()
        }
        Commands::Query(args) => {
            let conn =
                staging::open_database(&local_db_path(args.db.db)).map_err(miette::Report::new)?;
            let rows = staging::query_rows(&conn, &args.sql).map_err(miette::Report::new)?;
            JsonOutput::print(&rows).into_diagnostic()
        }
        command => {
            let settings = SettingsLoader::from_env().map_err(miette::Report::new)?;
            tracing::debug!(url = %settings.hobs_url, bucket = %settings.bucket, "settings resolved");
            run_remote(command, settings, output_mode)
        }
    }
}

fn run_remote(command: Commands, settings: Settings, output_mode: OutputMode) -> miette::Result<()> {
    let app = build_app(&settings)?;
    match command {
        Commands::Configs(ConfigsCommand::Submit(args)) => {
            let request = ConfigRequest {
                study_names: args.studies,
                stages: parse_stages(&args.stages)?,
                refresh_config: args.refresh,
            };
            let policy = args
                .wait
                .then(|| poll_policy(&args.poll, &settings.poll));
            execute(ProgressSinkKind::Submit, output_mode, move |sink| {
                app.request_configs(&request, policy.as_ref(), sink)
            })
        }
        Commands::Configs(ConfigsCommand::Fetch(args)) => {
            let id = parse_request_id(&args.request_id)?;
            execute(ProgressSinkKind::Fetch, output_mode, move |sink| {
                app.fetch_configs(&id, sink)
            })
        }
        Commands::Configs(ConfigsCommand::Save(args)) => {
            let id = parse_request_id(&args.request_id)?;
            execute(ProgressSinkKind::Mirror, output_mode, move |sink| {
                app.save_configs(&id, sink)
            })
        }
        Commands::Configs(ConfigsCommand::Retrieve(args)) => {
            let id = parse_request_id(&args.request_id)?;
            let records = app
                .retrieve_configs(&id, &JsonOutput)
                .map_err(miette::Report::new)?;
            JsonOutput::print(&records).into_diagnostic()
        }
        Commands::Mvm(MvmCommand::Submit(args)) => {
            let request = MvmRequest {
                study_names: args.studies,
                stages: parse_stages(&args.stages)?,
                interpolation_method: args.interpolation,
            };
            let policy = args
                .wait
                .then(|| poll_policy(&args.poll, &settings.poll));
            execute(ProgressSinkKind::Submit, output_mode, move |sink| {
                app.request_mvm(&request, policy.as_ref(), sink)
            })
        }
        Commands::Mvm(MvmCommand::Fetch(args)) => {
            let id = parse_request_id(&args.request_id)?;
            execute(ProgressSinkKind::Fetch, output_mode, move |sink| {
                app.fetch_mvm(&id, sink)
            })
        }
        Commands::Status(args) => {
            let id = parse_request_id(&args.request_id)?;
            let report = app.poll_status(&id).map_err(miette::Report::new)?;
            JsonOutput::print(&report).into_diagnostic()
        }
        Commands::Wait(args) => {
            let id = parse_request_id(&args.request_id)?;
            let policy = poll_policy(&args.poll, &settings.poll);
            execute(ProgressSinkKind::Wait, output_mode, move |sink| {
                app.wait_until_done(&id, &policy, sink)
            })
        }
        Commands::ResultUrl(args) => {
            let id = parse_request_id(&args.request_id)?;
            let url = app.result_url(&id).map_err(miette::Report::new)?;
            JsonOutput::print(&url).into_diagnostic()
        }
        Commands::Stage(args) => {
            let stage = args.stage.parse::<Stage>().map_err(miette::Report::new)?;
            let db_path = args.db.db.unwrap_or_else(|| settings.db_path.clone());
            execute(ProgressSinkKind::Stage, output_mode, move |sink| {
                let mut conn = staging::open_database(&db_path)?;
                app.stage_concat_tables(&stage, &mut conn, sink)
            })
        }
        Commands::HobsTable(args) => {
            let db_path = args.db.unwrap_or_else(|| settings.db_path.clone());
            execute(ProgressSinkKind::Stage, output_mode, move |sink| {
                let mut conn = staging::open_database(&db_path)?;
                app.stage_hobs_table(&mut conn, sink)
            })
        }
        Commands::Tables(_) | Commands::Query(_) => Err(miette::Report::msg(
            "local database commands do not contact HOBS",
        )),
    }
}

fn build_app(settings: &Settings) -> miette::Result<HobsApp> {
    let client = HobsHttpClient::new(settings).map_err(miette::Report::new)?;
    let store = FsObjectStore::new(&settings.mirror_root, &settings.bucket);
    Ok(App::new(client, store, settings.base_folder.clone()))
}

/// Runs long operations under the dashboard, or logging to stderr when non-interactive.
fn execute<F, R>(kind: ProgressSinkKind, output_mode: OutputMode, f: F) -> miette::Result<()>
where
    F: FnOnce(&dyn ProgressSink) -> Result<R, HobsError> + Send + 'static,
    R: Serialize + Send + 'static,
{
    let result = match output_mode {
        OutputMode::NonInteractive => f(&JsonOutput).map_err(miette::Report::new)?,
        OutputMode::Interactive => Tui::new(kind).run(f)?,
    };
    JsonOutput::print(&result).into_diagnostic()
}

fn poll_policy(args: &PollArgs, defaults: &PollPolicy) -> PollPolicy {
    let interval = args
        .interval
        .map(Duration::from_secs)
        .unwrap_or(defaults.interval);
    if args.unbounded {
        return PollPolicy::unbounded(interval);
    }
    match args.max_attempts {
        Some(0) => PollPolicy::unbounded(interval),
        Some(max_attempts) => PollPolicy::bounded(interval, max_attempts),
        None => PollPolicy {
            interval,
            max_attempts: defaults.max_attempts,
        },
    }
}

fn parse_request_id(value: &str) -> miette::Result<RequestId> {
    value.parse::<RequestId>().map_err(miette::Report::new)
}

fn parse_stages(values: &[String]) -> miette::Result<Vec<Stage>> {
    values
        .iter()
        .map(|value| value.parse::<Stage>().map_err(miette::Report::new))
        .collect()
}

fn local_db_path(arg: Option<PathBuf>) -> PathBuf {
    arg.unwrap_or_else(|| SettingsLoader::db_path(|name| std::env::var(name).ok()))
}

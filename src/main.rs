use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use tracing::{error, info};

use georef::{
    key_identifier, read_names, run_export, run_extraction, run_geocoding, AppConfig, AppResult,
    CompletionClient, Credentials, GeocodeClient, Prompts, TelemetryClient, UsageLedger,
    WorkItemStore,
};

#[derive(Parser)]
#[command(
    name = "georef",
    about = "Extracts establishment addresses with an LLM and resolves them to coordinates"
)]
struct Cli {
    /// Directory holding input files and pipeline output.
    #[arg(long, default_value = ".")]
    data_dir: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Ask the completion API for address candidates per establishment.
    Extract,
    /// Resolve extracted addresses to coordinates.
    Geocode,
    /// Flatten geocoded items into a CSV.
    Export,
    /// Extract, geocode, then export in one go.
    Run,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config = AppConfig::from_env();
    georef::init_tracing(config.log_file.as_deref());
    info!(config = ?config.public_profile(), "configuration loaded");

    if let Err(err) = dispatch(&cli, &config).await {
        error!("{err}");
        std::process::exit(1);
    }
}

async fn dispatch(cli: &Cli, config: &AppConfig) -> AppResult<()> {
    let telemetry = TelemetryClient::new(&cli.data_dir, config)?;

    let result = match cli.command {
        Command::Extract => extract_stage(&cli.data_dir, config, &telemetry).await,
        Command::Geocode => geocode_stage(&cli.data_dir, config, &telemetry).await,
        Command::Export => export_stage(&cli.data_dir, config),
        Command::Run => {
            extract_stage(&cli.data_dir, config, &telemetry).await?;
            geocode_stage(&cli.data_dir, config, &telemetry).await?;
            export_stage(&cli.data_dir, config)
        }
    };

    if let Err(err) = telemetry.flush() {
        error!(?err, "failed to flush telemetry queue");
    }
    result
}

async fn extract_stage(
    data_dir: &Path,
    config: &AppConfig,
    telemetry: &TelemetryClient,
) -> AppResult<()> {
    let credentials = Credentials::load(&data_dir.join(&config.credentials_file))?;
    let prompts = Prompts::load(
        &data_dir.join(&config.system_prompt_file),
        &data_dir.join(&config.user_prompt_file),
    )?;
    let ledger = UsageLedger::open(
        data_dir.join(&config.tokens_file),
        key_identifier(credentials.openai()),
    )?;
    let mut completion =
        CompletionClient::new(config, &credentials, prompts, ledger, telemetry.clone());

    let names = read_names(&data_dir.join(&config.establishments_file))?;
    info!(count = names.len(), "loaded establishment names");
    let store = WorkItemStore::new(data_dir.join(&config.addresses_dir));

    let report = run_extraction(&names, &mut completion, &store).await?;
    telemetry.record("run_summary", serde_json::json!({ "extraction": report }))?;
    info!(
        session_prompt_tokens = completion.ledger().session_prompt_tokens(),
        session_completion_tokens = completion.ledger().session_completion_tokens(),
        total_tokens = completion.ledger().total(),
        "extraction finished"
    );
    Ok(())
}

async fn geocode_stage(
    data_dir: &Path,
    config: &AppConfig,
    telemetry: &TelemetryClient,
) -> AppResult<()> {
    let credentials = Credentials::load(&data_dir.join(&config.credentials_file))?;
    let mut client = GeocodeClient::new(config, &credentials, telemetry.clone());

    let source = WorkItemStore::new(data_dir.join(&config.addresses_dir));
    let target = WorkItemStore::new(data_dir.join(&config.geocoded_dir));

    let report = run_geocoding(&mut client, &source, &target).await?;
    telemetry.record("run_summary", serde_json::json!({ "geocoding": report }))?;
    Ok(())
}

fn export_stage(data_dir: &Path, config: &AppConfig) -> AppResult<()> {
    let store = WorkItemStore::new(data_dir.join(&config.geocoded_dir));
    let rows = run_export(&store, &data_dir.join(&config.export_csv_file))?;
    info!(rows, "export finished");
    Ok(())
}

//! Dubflow - Video Dubbing Workflow Client
//!
//! Entry point: loads configuration, sets up logging and hands user actions
//! to the workflow controller.

use anyhow::Result;
use clap::Parser;
use std::path::Path;
use std::sync::Arc;
use tokio::io::BufReader;
use tracing::{info, Level};
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use dubflow::cli::{Args, Commands};
use dubflow::config::{Config, LoggingConfig};
use dubflow::error::DubError;
use dubflow::gateway::{GatewayFactory, MediaFetcher};
use dubflow::language::Language;
use dubflow::shell::{self, Shell};
use dubflow::workflow::WorkflowController;

const DEFAULT_CONFIG_FILE: &str = "dubflow.toml";

// Stage calls suspend cooperatively on a single thread
#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let mut config = match &args.config {
        Some(config_path) => Config::from_file(config_path)?,
        None => {
            if Path::new(DEFAULT_CONFIG_FILE).exists() {
                Config::from_file(DEFAULT_CONFIG_FILE)?
            } else {
                Config::default()
            }
        }
    };
    if let Some(endpoint) = &args.endpoint {
        config.gateway.base_url = endpoint.clone();
    }

    // Setup logging to both console and file
    let _guard = setup_logging(args.verbose, &config.logging)?;
    info!("Starting Dubflow, stage services at {}", config.gateway.base_url);

    match args.command {
        Commands::Languages => {
            println!("\nSupported Target Languages:");
            println!("{:<6} {:<25}", "Code", "Name");
            println!("{}", "-".repeat(31));
            for language in Language::ALL {
                let marker = if language == config.workflow.default_language { " (default)" } else { "" };
                println!("{:<6} {:<25}", language.code(), format!("{}{}", language.name(), marker));
            }
        }
        Commands::Init { path, force } => {
            if path.exists() && !force {
                return Err(DubError::Config(format!(
                    "{} already exists (use --force to overwrite)",
                    path.display()
                ))
                .into());
            }
            config.save_to_file(&path)?;
            println!("Wrote configuration to {}", path.display());
        }
        Commands::Session { language, input } => {
            let language = resolve_language(language.as_deref(), &config)?;
            let gateway = GatewayFactory::create_gateway(config.gateway.clone())?;
            let controller = Arc::new(WorkflowController::new(gateway, language));
            let fetcher = MediaFetcher::new(&config.gateway)?;

            if let Some(input) = input {
                controller.select_input(dubflow::media::VideoHandle::new(input))?;
            }

            let mut shell = Shell::new(controller, fetcher);
            shell.run(BufReader::new(tokio::io::stdin())).await?;
        }
        Commands::Run { input, language, output } => {
            let language = resolve_language(language.as_deref(), &config)?;
            let gateway = GatewayFactory::create_gateway(config.gateway.clone())?;
            let controller = WorkflowController::new(gateway, language);
            let fetcher = MediaFetcher::new(&config.gateway)?;

            info!("Processing video file: {}", input.display());
            shell::run_once(&controller, &fetcher, &input, language, output.as_deref()).await?;
        }
    }

    info!("Dubflow finished");
    Ok(())
}

fn resolve_language(code: Option<&str>, config: &Config) -> Result<Language> {
    match code {
        Some(code) => Ok(code.parse()?),
        None => Ok(config.workflow.default_language),
    }
}

/// Setup logging to both console and file. The returned guard flushes the
/// file writer when dropped.
fn setup_logging(
    verbose: bool,
    logging: &LoggingConfig,
) -> Result<tracing_appender::non_blocking::WorkerGuard> {
    std::fs::create_dir_all(&logging.directory)?;

    // Set up file appender with daily rotation
    let file_appender = rolling::daily(&logging.directory, "dubflow.log");
    let (non_blocking_file, guard) = non_blocking(file_appender);

    let log_level = if verbose { Level::DEBUG } else { Level::INFO };

    let console_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_file(verbose)
        .with_line_number(verbose);

    let file_layer = fmt::layer()
        .with_writer(non_blocking_file)
        .with_target(false)
        .with_file(true)
        .with_line_number(true)
        .with_ansi(false); // No ANSI colors in file

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive(log_level.into()))
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    info!(
        "Logging initialized - console: {}, file: {}",
        log_level,
        logging.directory.join("dubflow.log").display()
    );

    Ok(guard)
}

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use regscan::{
    cache::RedisContentCache,
    config::Config,
    error::Error,
    orchestrator::{OrchestratorSettings, ScanOrchestrator},
    publisher::{AmqpPublisher, RetryingPublisher},
    registry::HarborRegistry,
    retry::RetryPolicy,
    scanner::TrivyClient,
};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Process exit codes
mod exit_codes {
    pub const SUCCESS: u8 = 0;
    pub const ERROR: u8 = 1;
    pub const CONFIG: u8 = 2;
}

#[derive(Parser)]
#[command(name = "regscan")]
#[command(
    author,
    version,
    about = "Continuously scan container registry artifacts for vulnerabilities"
)]
struct Cli {
    /// Path to the config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log at debug level unless RUST_LOG is set
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Poll the registry until interrupted (default)
    Run,

    /// Run a single poll cycle and print its report as JSON
    Once,

    /// Show or create config file
    Config {
        /// Generate default config file
        #[arg(long)]
        init: bool,

        /// Show config file path
        #[arg(long)]
        path: bool,
    },
}

/// Long-lived clients built at startup.
struct Service {
    orchestrator: Arc<ScanOrchestrator>,
    publisher: Arc<RetryingPublisher<AmqpPublisher>>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!(error = %format!("{e:#}"), "startup failed");
            ExitCode::from(exit_codes::ERROR)
        }
    }
}

fn init_tracing(verbose: bool) {
    let default_filter = if verbose { "debug,lapin=info" } else { "info" };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

async fn run(cli: Cli) -> Result<u8> {
    let command = cli.command.unwrap_or(Commands::Run);

    if let Commands::Config { init, path } = command {
        handle_config(cli.config.as_deref(), init, path)?;
        return Ok(exit_codes::SUCCESS);
    }

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            return Ok(exit_codes::CONFIG);
        }
    };

    let service = match connect(&config).await {
        Ok(service) => service,
        Err(Error::Config(e)) => {
            error!(error = %e, "invalid configuration");
            return Ok(exit_codes::CONFIG);
        }
        Err(e) => return Err(e.into()),
    };

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    let code = match command {
        Commands::Once => {
            let outcome = service.orchestrator.run_cycle(&shutdown).await;
            match outcome {
                Ok(report) => {
                    println!("{}", serde_json::to_string_pretty(&report)?);
                    exit_codes::SUCCESS
                }
                Err(e) => {
                    error!(error = %e, "failed to list projects");
                    exit_codes::ERROR
                }
            }
        }
        _ => {
            Arc::clone(&service.orchestrator).run(shutdown).await;
            exit_codes::SUCCESS
        }
    };

    service.publisher.inner().close().await;
    info!("shutdown complete");
    Ok(code)
}

/// Builds every client. A [`Error::Config`] here means a setting could not
/// be turned into a connection string; anything else is a connection failure.
async fn connect(config: &Config) -> regscan::Result<Service> {
    let redis_url = config.cache.redis_url()?;
    let amqp_uri = config.broker.amqp_uri()?;

    let registry = HarborRegistry::new(&config.registry)?;
    let scanner = TrivyClient::new(&config.scanner)?;
    let cache = RedisContentCache::connect(&redis_url, config.cache.timeout()).await?;

    let amqp = AmqpPublisher::connect(
        amqp_uri,
        config.broker.queue.as_str(),
        config.broker.timeout(),
    )
    .await?;
    let publisher = Arc::new(RetryingPublisher::new(
        amqp,
        RetryPolicy::for_publish(&config.broker),
    ));
    info!(
        queue = publisher.inner().queue(),
        max_attempts = publisher.policy().max_attempts,
        "publishing scan results"
    );

    let orchestrator = Arc::new(ScanOrchestrator::new(
        Arc::new(registry),
        Arc::new(cache),
        Arc::new(scanner),
        publisher.clone(),
        OrchestratorSettings::from(&config.schedule),
    ));

    Ok(Service {
        orchestrator,
        publisher,
    })
}

fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("shutdown requested");
        shutdown.cancel();
    });
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

fn handle_config(explicit: Option<&Path>, init: bool, show_path: bool) -> Result<()> {
    let config_path = explicit
        .map(Path::to_path_buf)
        .unwrap_or_else(Config::config_path);

    if show_path {
        println!("{}", config_path.display());
        return Ok(());
    }

    if init {
        if config_path.exists() {
            println!("Config file already exists at: {}", config_path.display());
            return Ok(());
        }

        Config::default().save(&config_path)?;
        println!("Created config file at: {}", config_path.display());
        println!();
        println!("Default configuration:");
        println!("{}", Config::generate_default_config());
        println!(
            "Set registry.url and scanner.url (or REGSCAN_REGISTRY_URL / REGSCAN_SCANNER_URL) \
             before running."
        );
        return Ok(());
    }

    if config_path.exists() {
        let content = std::fs::read_to_string(&config_path)
            .with_context(|| format!("failed to read {}", config_path.display()))?;
        println!("Config file: {}", config_path.display());
        println!();
        println!("{}", content);
    } else {
        println!("No config file found.");
        println!("Run 'regscan config --init' to create one.");
        println!();
        println!("Config path: {}", config_path.display());
    }

    Ok(())
}

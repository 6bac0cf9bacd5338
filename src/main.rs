use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use speedcheck::config::SpeedCheckConfig;
use speedcheck::throughput::report::{format_summary, LATENCY_UNREACHABLE};

#[derive(Parser)]
#[command(
    name = "speedcheck",
    about = "Resilient network speed test with endpoint fallback",
    version,
    long_about = None
)]
struct Cli {
    /// Config file (overrides SPEEDCHECK_CONFIG and the system path)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP API
    Serve {
        /// Bind address (defaults to the configured one)
        #[arg(long)]
        bind: Option<String>,
    },

    /// Run one speed test and print the result
    SpeedTest {
        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Print the effective configuration as TOML
    Config,
}

fn init_tracing(config: &SpeedCheckConfig, json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));

    // Logs go to stderr so --json output on stdout stays parseable.
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json || config.logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = SpeedCheckConfig::resolve(cli.config.as_deref())?;
    init_tracing(&config, cli.log_json);

    match cli.command {
        Commands::Serve { bind } => {
            let bind = bind.unwrap_or_else(|| config.api.bind.clone());
            tracing::info!(%bind, "Starting speedcheck API");
            speedcheck::serve(&bind, &config).await?;
        }
        Commands::SpeedTest { json } => {
            tracing::info!("Running speed test");
            let speed_test = speedcheck::throughput::SpeedTest::from_config(&config)
                .context("failed to initialise speed test")?;
            let report = speed_test.run_speed_test().await;

            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                let outcome = &report.outcome;
                println!("\n=== speedcheck ===");
                println!("{:<10} | {:>12}", "Metric", "Value");
                println!("{:-<10}-|-{:->12}", "", "");
                println!("{:<10} | {:>7.2} Mbps", "Download", outcome.download_mbps);
                println!("{:<10} | {:>7.2} Mbps", "Upload", outcome.upload_mbps);
                if outcome.latency_ms == LATENCY_UNREACHABLE {
                    println!("{:<10} | {:>12}", "Latency", "unreachable");
                } else {
                    println!("{:<10} | {:>9} ms", "Latency", outcome.latency_ms);
                }
                println!("\n{}", format_summary(outcome));
                if let Some(err) = &report.error {
                    println!("{}", err);
                }
                println!();
            }
        }
        Commands::Config => {
            print!("{}", toml::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

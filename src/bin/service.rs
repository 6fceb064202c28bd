use clap::{Parser, Subcommand};
use tracing::{error, info, level_filters::LevelFilter, trace};
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};

use uptimed::config::{Chunk, RunOptions, Settings};
use uptimed::supervisor;

#[derive(Debug, Clone, Parser)]
#[command(name = "uptimed", about = "Synthetic uptime monitoring service")]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Process a slice of the enabled items: --chunk=K-S
    #[arg(long, global = true)]
    chunk: Option<String>,

    /// Cap the working set to N items
    #[arg(long, global = true)]
    limit: Option<usize>,

    /// Load the test environment (.env.test)
    #[arg(long, global = true)]
    test: bool,
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Run the monitoring service
    Start,
    /// Alias of `start`
    Manager,
    /// Ask a running instance to shut down
    Stop,
    /// Print a running instance's status summary
    Status,
    /// Single-shot check of the first enabled item
    Test,
}

fn init() {
    let filter = filter::Targets::new().with_targets(vec![("uptimed", LevelFilter::TRACE)]);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .pretty()
                .with_writer(std::io::stderr)
                .compact(),
        )
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init();
    let args = Args::parse();
    trace!("started with args: {args:?}");

    // `--test` swaps in the alternate environment before settings load.
    if args.test {
        info!("test mode: loading .env.test");
        let _ = dotenv::from_filename(".env.test");
    } else {
        let _ = dotenv::dotenv();
    }

    let settings = Settings::from_env();
    let chunk = args.chunk.as_deref().map(Chunk::parse).transpose()?;
    let opts = RunOptions {
        chunk,
        limit: args.limit,
        test_env: args.test,
    };

    match args.command {
        Command::Start | Command::Manager => supervisor::run(settings, opts).await,
        Command::Stop => stop(&settings, &opts).await,
        Command::Status => status(&settings, &opts).await,
        Command::Test => {
            // Exit 1 when the single-shot check fails.
            match supervisor::run_single_check(settings).await {
                Ok(true) => Ok(()),
                Ok(false) => {
                    error!("test check failed");
                    std::process::exit(1);
                }
                Err(e) => Err(e),
            }
        }
    }
}

fn admin_base(settings: &Settings, opts: &RunOptions) -> String {
    format!(
        "http://{}:{}",
        settings.http_host,
        settings.port_for_chunk(opts.chunk_number())
    )
}

async fn stop(settings: &Settings, opts: &RunOptions) -> anyhow::Result<()> {
    let url = format!("{}/api/shutdown", admin_base(settings, opts));
    let response = reqwest::Client::new()
        .post(&url)
        .timeout(std::time::Duration::from_secs(5))
        .send()
        .await?;
    info!("stop request to {url}: HTTP {}", response.status());
    Ok(())
}

async fn status(settings: &Settings, opts: &RunOptions) -> anyhow::Result<()> {
    let url = format!("{}/api/status", admin_base(settings, opts));
    let body: serde_json::Value = reqwest::Client::new()
        .get(&url)
        .timeout(std::time::Duration::from_secs(5))
        .send()
        .await?
        .json()
        .await?;
    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}

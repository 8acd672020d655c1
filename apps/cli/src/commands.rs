//! CLI command definitions, routing, and tracing setup.

use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use docharvest_core::{CrawlService, JobStatus, OpenAiEmbedder, ProgressEvent, Stage};
use docharvest_shared::{
    AppConfig, CrawlRequest, SourceId, SourceRepository, init_config, load_config,
};
use docharvest_storage::Storage;
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info};

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// DocHarvest: crawl documentation sites into an embedded knowledge store.
#[derive(Parser)]
#[command(
    name = "docharvest",
    version,
    about = "Crawl documentation sites, chunk and embed them, and store the results.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Crawl a URL and store its chunks, embeddings and code examples.
    Crawl(CrawlArgs),

    /// Print a stored source record as JSON.
    Source {
        /// Source id.
        id: String,
    },

    /// Configuration management.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Args)]
pub(crate) struct CrawlArgs {
    /// Start URL: a page, sitemap, llms.txt or markdown/text file.
    url: String,

    /// Link depth; above 1 crawls recursively (defaults to config).
    #[arg(short, long)]
    depth: Option<u32>,

    /// Maximum chunk size in characters (defaults to config).
    #[arg(long)]
    chunk_size: Option<usize>,

    /// Knowledge type recorded on the source (defaults to config).
    #[arg(long)]
    knowledge_type: Option<String>,

    /// Tag recorded on the source (repeatable).
    #[arg(long = "tag")]
    tags: Vec<String>,

    /// Display name for the source (defaults to the URL host).
    #[arg(short, long)]
    name: Option<String>,

    /// Store under this source id instead of one derived from the URL.
    #[arg(long)]
    source_id: Option<String>,

    /// Skip the code example extraction stage.
    #[arg(long)]
    no_code_examples: bool,
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "docharvest=info",
        1 => "docharvest=debug",
        _ => "docharvest=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Crawl(args) => cmd_crawl(args).await,
        Command::Source { id } => cmd_source(&id).await,
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init(),
            ConfigAction::Show => cmd_config_show(),
        },
    }
}

// ---------------------------------------------------------------------------
// crawl
// ---------------------------------------------------------------------------

fn build_request(args: CrawlArgs, config: &AppConfig) -> CrawlRequest {
    let mut request = CrawlRequest::new(args.url);
    request.max_depth = args.depth.unwrap_or(config.defaults.max_depth);
    request.chunk_size = args.chunk_size.unwrap_or(config.defaults.chunk_size);
    request.knowledge_type = args
        .knowledge_type
        .unwrap_or_else(|| config.defaults.knowledge_type.clone());
    request.tags = args.tags;
    request.source_display_name = args.name;
    request.source_id = args.source_id;
    request.extract_code_examples = !args.no_code_examples;
    request
}

async fn cmd_crawl(args: CrawlArgs) -> Result<()> {
    let config = load_config()?;
    let embedder = OpenAiEmbedder::from_config(&config)?;
    let db_path = config.storage.resolved_database_path()?;
    let storage = Storage::open(&db_path).await?;
    let service = CrawlService::from_config(&config, Arc::new(storage), Arc::new(embedder))?;

    let request = build_request(args, &config);
    info!(url = %request.url, depth = request.max_depth, db = %db_path.display(), "starting crawl");

    let mut task = service.spawn(request)?;
    let job_id = task.job_id;
    let progress = CliProgress::new();

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut cancelling = false;

    loop {
        tokio::select! {
            received = task.events.recv() => match received {
                Ok(event) => {
                    progress.update(&event);
                    if event.stage.is_terminal() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => debug!(skipped, "progress display lagged"),
                Err(RecvError::Closed) => break,
            },
            _ = &mut ctrl_c, if !cancelling => {
                cancelling = true;
                service.cancel(&job_id);
                progress.bar.println("Cancelling, waiting for the job to stop...");
            }
        }
    }

    let outcome = task.handle.await?;
    progress.bar.finish_and_clear();

    println!("{}", serde_json::to_string_pretty(&outcome)?);
    match outcome.status {
        JobStatus::Completed | JobStatus::Cancelled => Ok(()),
        JobStatus::Failed => Err(eyre!(
            "crawl failed: {}",
            outcome.error.as_deref().unwrap_or("unknown error")
        )),
    }
}

/// Progress bar driven by the job's event stream.
struct CliProgress {
    bar: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let bar = ProgressBar::new(100);
        if let Ok(style) =
            ProgressStyle::with_template("{spinner:.cyan} [{bar:30.cyan/blue}] {pos:>3}% {prefix:<16} {msg}")
        {
            bar.set_style(style.progress_chars("=> "));
        }
        bar.enable_steady_tick(Duration::from_millis(100));
        Self { bar }
    }

    fn update(&self, event: &ProgressEvent) {
        self.bar.set_position(u64::from(event.progress));
        self.bar.set_prefix(event.stage.as_str());
        if !event.heartbeat {
            self.bar.set_message(event.message.clone());
        }
        match event.stage {
            Stage::Error => {
                let error = event.error.as_deref().unwrap_or(&event.message);
                self.bar.println(format!("error: {error}"));
            }
            Stage::Cancelled => self.bar.println("Crawl cancelled"),
            _ => {}
        }
    }
}

// ---------------------------------------------------------------------------
// source
// ---------------------------------------------------------------------------

async fn cmd_source(id: &str) -> Result<()> {
    let config = load_config()?;
    let storage = Storage::open_readonly(&config.storage.resolved_database_path()?).await?;
    let source_id = SourceId::from(id);

    let source = storage
        .get_source_by_id(&source_id)
        .await?
        .ok_or_else(|| eyre!("no source with id '{id}'"))?;
    let page_count = storage.get_page_count_by_source(&source_id).await?;

    let report = serde_json::json!({
        "source": source,
        "page_count": page_count,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

// ---------------------------------------------------------------------------
// config
// ---------------------------------------------------------------------------

fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

fn cmd_config_show() -> Result<()> {
    let config: AppConfig = load_config()?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

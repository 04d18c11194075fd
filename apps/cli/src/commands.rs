//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use darkscout_core::{
    OpenRouterClient, PipelineRun, PipelineState, ProgressReporter, ResearchOptions, Stage,
    StageSnapshot, write_report,
};
use darkscout_crawler::{CrawlEngine, ProxyHttpClient};
use darkscout_shared::{
    AppConfig, CrawlSettings, ProxySettings, expand_home, init_config, load_config,
    validate_api_key,
};
use darkscout_storage::Storage;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;
use url::Url;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// darkscout: research hidden services through a SOCKS proxy.
#[derive(Parser)]
#[command(
    name = "darkscout",
    version,
    about = "Plan, crawl, and report on hidden-service research queries through a SOCKS proxy.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
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
    /// Run the full research pipeline for a query.
    Research {
        /// Research query.
        query: String,

        /// Crawl depth per plan step (defaults to config).
        #[arg(short, long)]
        depth: Option<u32>,

        /// Fallback address for plan steps that name no onion site.
        #[arg(long)]
        seed: Option<String>,

        /// Also write the report as markdown to this file.
        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// Crawl one address and print the result as JSON.
    Crawl {
        /// Address to crawl.
        url: String,

        /// Crawl depth (defaults to config).
        #[arg(short, long)]
        depth: Option<u32>,
    },

    /// Check that traffic is routed through the proxy.
    Check,

    /// List recent research runs.
    History {
        /// Maximum number of runs to show.
        #[arg(short, long, default_value = "10")]
        limit: u32,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
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
        0 => "darkscout=info",
        1 => "darkscout=debug",
        _ => "darkscout=trace",
    };

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

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
        Command::Research {
            query,
            depth,
            seed,
            out,
        } => cmd_research(&query, depth, seed, out.as_deref()).await,
        Command::Crawl { url, depth } => cmd_crawl(&url, depth).await,
        Command::Check => cmd_check().await,
        Command::History { limit } => cmd_history(limit).await,
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show().await,
        },
    }
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_research(
    query: &str,
    depth: Option<u32>,
    seed: Option<String>,
    out: Option<&Path>,
) -> Result<()> {
    if query.trim().is_empty() {
        return Err(eyre!("research query must not be empty"));
    }

    // Validate API key before doing anything
    let config = load_config()?;
    let api_key = validate_api_key(&config)?;

    let storage = open_storage(&config).await?;
    let llm = OpenRouterClient::new(&config.llm, api_key)?;

    let mut settings = CrawlSettings::from(&config);
    if let Some(depth) = depth {
        settings.depth = depth;
    }
    if let Some(seed) = seed {
        settings.seed_url = seed;
    }
    let mut engine = CrawlEngine::with_proxy(
        ProxyHttpClient::new(ProxySettings::from(&config)),
        settings,
    );

    info!(
        query,
        model = llm.model(),
        depth = engine.settings().depth,
        "starting research"
    );

    let reporter = CliProgress::new();
    let run = PipelineRun::new(
        PipelineState::new(query, Vec::new()),
        &mut engine,
        &llm,
        &storage,
        ResearchOptions::from(&config),
    );
    let result = run.run(&reporter).await;
    engine.close();
    reporter.finish();
    let outcome = result?;

    storage.insert_run(&outcome.run).await?;

    if let Some(path) = out {
        write_report(path, &outcome)?;
        info!(path = %path.display(), "report exported");
    }

    println!("{}", outcome.run.report.trim_end());
    println!();
    println!("  Run:     {}", outcome.run.id);
    println!("  Steps:   {}", outcome.run.plan.len());
    println!("  Sources: {}", outcome.run.source_count);
    if let Some(path) = out {
        println!("  Report:  {}", path.display());
    }
    println!(
        "  Time:    {:.1}s",
        (outcome.run.finished_at - outcome.run.started_at).num_milliseconds() as f64 / 1000.0
    );

    Ok(())
}

async fn cmd_crawl(url: &str, depth: Option<u32>) -> Result<()> {
    let parsed = Url::parse(url).map_err(|e| eyre!("invalid URL '{url}': {e}"))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(eyre!("unsupported scheme '{}': expected http or https", parsed.scheme()));
    }

    let config = load_config()?;
    let settings = CrawlSettings::from(&config);
    let depth = depth.unwrap_or(settings.depth);

    let mut engine =
        CrawlEngine::with_proxy(ProxyHttpClient::new(ProxySettings::from(&config)), settings);
    let result = engine.crawl(url, depth).await;
    engine.close();

    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

async fn cmd_check() -> Result<()> {
    let config = load_config()?;
    let mut client = ProxyHttpClient::new(ProxySettings::from(&config));
    client.connect()?;
    let routed = client.check_connectivity().await;
    client.close();

    if routed {
        println!("Traffic is routed through {}", config.proxy.address);
        Ok(())
    } else {
        Err(eyre!(
            "{} did not confirm proxy routing via {}",
            config.proxy.check_url,
            config.proxy.address
        ))
    }
}

async fn cmd_history(limit: u32) -> Result<()> {
    let config = load_config()?;
    let storage = open_storage(&config).await?;
    let runs = storage.list_runs(limit).await?;

    if runs.is_empty() {
        println!("No research runs recorded yet.");
        return Ok(());
    }

    for run in runs {
        println!(
            "{}  {}  {} steps, {} sources  {}",
            run.started_at.format("%Y-%m-%d %H:%M"),
            run.id,
            run.plan.len(),
            run.source_count,
            run.query
        );
    }
    Ok(())
}

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show() -> Result<()> {
    let config: AppConfig = load_config()?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

async fn open_storage(config: &AppConfig) -> Result<Storage> {
    let db_path = expand_home(&config.knowledge.db_path)?;
    Ok(Storage::open(&db_path).await?)
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using an indicatif spinner.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        let style = ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]);
        spinner.set_style(style);
        spinner.enable_steady_tick(std::time::Duration::from_millis(80));
        Self { spinner }
    }

    fn finish(&self) {
        self.spinner.finish_and_clear();
    }
}

impl ProgressReporter for CliProgress {
    fn stage_started(&self, stage: Stage) {
        let message = match stage {
            Stage::Planner => "Planning research",
            Stage::Crawler => "Crawling plan targets",
            Stage::Analyzer => "Analyzing crawled data",
            Stage::ReportGenerator => "Writing report",
        };
        self.spinner.set_message(message);
    }

    fn stage_finished(&self, snapshot: &StageSnapshot) {
        let state = &snapshot.state;
        let summary = match snapshot.stage {
            Stage::Planner => format!("{} plan steps", state.plan.len()),
            Stage::Crawler => {
                let errors: usize = state.crawled_data.iter().map(|r| r.errors.len()).sum();
                format!("{} sources, {errors} errors", state.crawled_data.len())
            }
            Stage::Analyzer => format!("{} chars of analysis", state.report.len()),
            Stage::ReportGenerator => format!("{} chars of report", state.report.len()),
        };
        self.spinner.println(format!("  ✓ {}: {summary}", snapshot.stage));
    }
}

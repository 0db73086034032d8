mod output;

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{ArgGroup, Parser};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use scout_client::{CsvSink, FileSinks, JsonlSink, LinksFileSink, ReqwestTransport};
use scout_core::{
    Catalog, HeaderRotator, MatchPolicy, ProbeScheduler, ProbeWorker, ReorderBuffer,
    RetryPolicy, ScanConfig, ScanEvent,
};

use crate::output::Console;

#[derive(Parser)]
#[command(
    name = "scout",
    version,
    about = "Check which sites have an account for a username",
    group(ArgGroup::new("mode").args(["evidence_only", "any_200"]))
)]
struct Cli {
    /// One or more usernames
    usernames: Vec<String>,

    /// File with one username per line
    #[arg(long)]
    userlist: Option<PathBuf>,

    /// Site catalog (JSON)
    #[arg(long, env = "SCOUT_SITES", default_value = "sites.json")]
    sites: PathBuf,

    /// Header rotation file (JSON); a missing file uses a built-in default
    #[arg(long, env = "SCOUT_HEADERS", default_value = "headers.json")]
    headers: PathBuf,

    /// Maximum concurrent probes (capped at 5x the CPU count)
    #[arg(long, env = "SCOUT_THREADS", default_value_t = 32)]
    threads: usize,

    /// Per-request timeout in seconds
    #[arg(long, env = "SCOUT_TIMEOUT", default_value_t = 10.0)]
    timeout: f64,

    /// Maximum simultaneous requests to one domain
    #[arg(long, env = "SCOUT_PER_DOMAIN", default_value_t = 3)]
    per_domain: usize,

    /// Attempts per probe, including the first
    #[arg(long, env = "SCOUT_MAX_ATTEMPTS", default_value_t = 4)]
    max_attempts: u32,

    /// Give up waiting for a domain slot after this many seconds
    #[arg(long, env = "SCOUT_TASK_TIMEOUT")]
    task_timeout: Option<f64>,

    /// HTTP/SOCKS proxy (e.g. socks5://127.0.0.1:9050)
    #[arg(long, env = "SCOUT_PROXY")]
    proxy: Option<String>,

    /// Comma-separated site names to include
    #[arg(long)]
    only: Option<String>,

    /// Write hits to a JSONL file
    #[arg(long)]
    hits_out: Option<PathBuf>,

    /// Write hits to a CSV file
    #[arg(long)]
    csv_out: Option<PathBuf>,

    /// Append each hit URL as soon as it is found
    #[arg(long, env = "SCOUT_LINKS_OUT", default_value = "hits.txt")]
    links_out: PathBuf,

    /// Only count a hit when the site's evidence matches (default)
    #[arg(long)]
    evidence_only: bool,

    /// Count any HTTP 200 as a hit
    #[arg(long)]
    any_200: bool,

    /// Disable ANSI colours
    #[arg(long, env = "SCOUT_NO_COLOR")]
    no_color: bool,

    /// Print the number of catalog sites and exit
    #[arg(long)]
    count: bool,
}

impl Cli {
    fn policy(&self) -> MatchPolicy {
        if self.any_200 {
            MatchPolicy::Any200
        } else {
            MatchPolicy::EvidenceOnly
        }
    }

    fn scan_config(&self) -> Result<ScanConfig> {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let concurrency = self.threads.clamp(1, cpus * 5);
        if concurrency != self.threads {
            tracing::info!(requested = self.threads, concurrency, "Clamped concurrency");
        }

        let defaults = RetryPolicy::default();
        let mut config = ScanConfig::default()
            .with_concurrency(concurrency)
            .with_per_domain_limit(self.per_domain)
            .with_attempt_timeout(seconds(self.timeout, "--timeout")?)
            .with_retry(RetryPolicy::new(
                self.max_attempts,
                defaults.base_delay,
                defaults.max_delay,
            ))
            .with_policy(self.policy());
        if let Some(secs) = self.task_timeout {
            config = config.with_task_timeout(seconds(secs, "--task-timeout")?);
        }
        if let Some(proxy) = &self.proxy {
            config = config.with_proxy(proxy.clone());
        }
        if let Some(only) = &self.only {
            config = config.with_only(only.split(','));
        }
        config.validate()?;
        Ok(config)
    }
}

fn seconds(value: f64, flag: &str) -> Result<Duration> {
    Duration::try_from_secs_f64(value).with_context(|| format!("{flag} must be a non-negative number"))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("scout=info".parse()?))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let catalog = Catalog::from_path(&cli.sites)
        .with_context(|| format!("Failed to load site catalog: {}", cli.sites.display()))?;
    if cli.count {
        println!("{}", catalog.len());
        return Ok(());
    }

    let mut usernames = cli.usernames.clone();
    if let Some(path) = &cli.userlist {
        usernames.extend(read_user_list(path)?);
    }
    if usernames.is_empty() {
        println!("No usernames supplied on the command line or via --userlist.");
        usernames = prompt_usernames()?;
        if usernames.is_empty() {
            bail!("No usernames entered");
        }
    }

    let config = cli.scan_config()?;
    let rotator = HeaderRotator::from_path(&cli.headers)
        .with_context(|| format!("Failed to load header file: {}", cli.headers.display()))?;
    let transport = ReqwestTransport::new(&config).context("Failed to create HTTP client")?;
    let sinks = open_sinks(&cli).await?;

    let console = Console::new(!cli.no_color);
    let mode = config.policy.as_str();
    let concurrency = config.concurrency;
    let worker = ProbeWorker::new(transport, sinks.clone(), config).with_rotator(rotator.clone());
    let scheduler = ProbeScheduler::new(worker);
    let sites = scheduler.filter_catalog(catalog.sites());

    console.plain(&format!("Scouting user(s): {}", usernames.join(", ")));
    console.plain(&format!("Page count: {}", sites.len()));
    console.plain(&format!("Maximum threads: {concurrency}"));
    console.plain(&format!("Header sets: {}", rotator.len()));
    console.plain("========================================");

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupt received, finishing in-flight probes");
            on_signal.cancel();
        }
    });

    let mut run = scheduler.run(&sites, &usernames, cancel);
    let mut pending = ReorderBuffer::new();
    let mut users = Vec::new();
    while let Some(event) = run.next().await {
        match event {
            ScanEvent::Outcome(outcome) => {
                for ready in pending.push(outcome.ordinal, outcome) {
                    console.outcome(&ready);
                }
            }
            ScanEvent::UserComplete(user) => users.push(user),
        }
    }
    for left in pending.drain_remaining() {
        console.outcome(&left);
    }
    let summary = run.finish().await?;

    console.plain("========================================");
    for line in output::format_tally(&summary, sinks.saved(), mode) {
        console.plain(&line);
    }
    for user in &users {
        console.plain(&output::format_user(user));
    }
    for (kind, path) in sinks.paths() {
        console.info(&format!("Saved {kind} -> {}", path.display()));
    }

    Ok(())
}

fn read_user_list(path: &Path) -> Result<Vec<String>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read user list: {}", path.display()))?;
    Ok(raw
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect())
}

fn prompt_usernames() -> Result<Vec<String>> {
    print!("Enter username(s) (comma or space separated): ");
    std::io::stdout().flush()?;
    let mut line = String::new();
    std::io::stdin()
        .read_line(&mut line)
        .context("Failed to read usernames")?;
    Ok(split_usernames(&line))
}

fn split_usernames(raw: &str) -> Vec<String> {
    raw.split(|c: char| c == ',' || c.is_whitespace())
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect()
}

async fn open_sinks(cli: &Cli) -> Result<FileSinks> {
    let mut sinks = FileSinks::new().with_links(
        LinksFileSink::open(&cli.links_out)
            .await
            .with_context(|| format!("Failed to open {}", cli.links_out.display()))?,
    );
    if let Some(path) = &cli.hits_out {
        sinks = sinks.with_jsonl(
            JsonlSink::create(path)
                .await
                .with_context(|| format!("Failed to create {}", path.display()))?,
        );
    }
    if let Some(path) = &cli.csv_out {
        sinks = sinks.with_csv(
            CsvSink::create(path).with_context(|| format!("Failed to create {}", path.display()))?,
        );
    }
    Ok(sinks)
}

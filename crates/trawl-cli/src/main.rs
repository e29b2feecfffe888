use std::future::Future;
use std::io::Write;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use trawl_client::{
    AnalysisMode, AnthropicProvider, GoogleSearchClient, HtmlTextCleaner, HttpPageFetcher,
    OpenAiProvider, RedditClient,
};
use trawl_core::{
    AnalysisProvider, Budget, ConcurrentExtractor, ContextResolver, DomainCircuitBreaker,
    FetchTimeouts, MemoryAnswerCache, SearchPipeline, TrawlConfig,
};

#[derive(Parser)]
#[command(name = "trawl", version, about = "Budget-bounded web research fetcher")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Answer a question from live web results
    Search {
        /// The question to answer
        query: String,

        /// Prior conversation used to refine the query and answer
        #[arg(short, long, default_value = "")]
        context: String,

        #[command(flatten)]
        llm: LlmArgs,

        #[command(flatten)]
        google: GoogleArgs,

        #[command(flatten)]
        fetch: FetchArgs,
    },

    /// Fetch URLs concurrently under a token and time budget, printing the
    /// batch outcome as JSON
    Extract {
        /// URLs to fetch
        #[arg(required = true)]
        urls: Vec<String>,

        /// Stop once this many estimated summary tokens are gathered
        #[arg(long)]
        target_tokens: Option<usize>,

        /// Cancel everything still pending after this many seconds
        #[arg(long)]
        hard_cap: Option<f64>,

        /// Record pending URLs as slow after this many seconds
        #[arg(long)]
        slow_mark: Option<f64>,

        /// Do not report failures to the circuit breaker
        #[arg(long, default_value_t = false)]
        no_feedback: bool,

        #[command(flatten)]
        fetch: FetchArgs,
    },

    /// Inspect and manage the domain circuit breaker
    Domains {
        #[command(subcommand)]
        action: DomainAction,
    },
}

#[derive(Subcommand)]
enum DomainAction {
    /// List blocked, failing and whitelisted domains
    List,
    /// Show circuit breaker counters as JSON
    Stats,
    /// Block a domain
    Block {
        domain: String,
        #[arg(short, long, default_value = "manually blocked")]
        reason: String,
    },
    /// Lift a block
    Unblock { domain: String },
    /// Never block a domain (also lifts any block)
    Whitelist { domain: String },
    /// Remove a domain from the whitelist
    Unwhitelist { domain: String },
    /// Enable or disable automatic blocking
    AutoBlock {
        #[arg(action = ArgAction::Set)]
        enabled: bool,
    },
    /// Set the number of failures that triggers a block
    Threshold { failures: u32 },
}

#[derive(Clone, Copy, ValueEnum)]
enum ProviderKind {
    /// Any OpenAI-compatible chat completions API
    Openai,
    /// Anthropic Messages API
    Anthropic,
}

#[derive(Args)]
struct LlmArgs {
    /// Which LLM API to talk to
    #[arg(long, env = "TRAWL_PROVIDER", value_enum, default_value_t = ProviderKind::Openai)]
    provider: ProviderKind,

    /// LLM model to use (default: "gpt-4o-mini", or "claude-haiku-4-5" for anthropic)
    #[arg(short, long, env = "TRAWL_MODEL")]
    model: Option<String>,

    /// API base URL (default: the provider's public endpoint)
    #[arg(short, long, env = "TRAWL_BASE_URL")]
    base_url: Option<String>,

    /// API key (reads from TRAWL_API_KEY env var if not provided)
    #[arg(short, long, env = "TRAWL_API_KEY", hide_env_values = true)]
    api_key: String,

    /// Answer from the full page text in one call instead of summarizing
    /// each page first
    #[arg(long, default_value_t = false)]
    single_stage: bool,
}

#[derive(Args)]
struct GoogleArgs {
    /// Google Custom Search API key
    #[arg(long, env = "GOOGLE_API_KEY", hide_env_values = true)]
    google_api_key: String,

    /// Google Programmable Search Engine ID
    #[arg(long, env = "GOOGLE_SEARCH_ENGINE_ID")]
    search_engine_id: String,
}

#[derive(Args)]
struct FetchArgs {
    /// Reddit app client ID (enables the OAuth API)
    #[arg(long, env = "REDDIT_CLIENT_ID")]
    reddit_client_id: Option<String>,

    /// Reddit app client secret
    #[arg(long, env = "REDDIT_CLIENT_SECRET", hide_env_values = true)]
    reddit_client_secret: Option<String>,

    /// User-Agent sent to the Reddit API
    #[arg(long, env = "REDDIT_USER_AGENT")]
    reddit_user_agent: Option<String>,

    /// Allow fetching URLs that resolve to private or local addresses
    #[arg(long, default_value_t = false)]
    allow_private_urls: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("trawl=info".parse()?))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = TrawlConfig::from_env().context("Invalid configuration")?;

    match cli.command {
        Commands::Search {
            query,
            context,
            llm,
            google,
            fetch,
        } => cmd_search(&config, &query, &context, llm, google, fetch).await?,
        Commands::Extract {
            urls,
            target_tokens,
            hard_cap,
            slow_mark,
            no_feedback,
            fetch,
        } => {
            let mut budget = config.pipeline.budget;
            if let Some(tokens) = target_tokens {
                budget = budget.with_target_tokens(tokens);
            }
            if let Some(secs) = hard_cap {
                budget = budget.with_hard_cap(seconds("--hard-cap", secs)?);
            }
            if let Some(secs) = slow_mark {
                budget = budget.with_slow_mark(seconds("--slow-mark", secs)?);
            }
            budget.validate().context("Invalid budget")?;
            cmd_extract(&config, &urls, &budget, !no_feedback, fetch).await?;
        }
        Commands::Domains { action } => cmd_domains(&config, action).await?,
    }

    Ok(())
}

/// Write the user-facing output, then run `follow_up` (circuit-breaker
/// persistence and other bookkeeping). The output is flushed even when the
/// follow-up fails.
async fn deliver<W, F>(out: &mut W, text: &str, follow_up: F) -> Result<()>
where
    W: Write,
    F: Future<Output = Result<()>>,
{
    writeln!(out, "{text}")?;
    out.flush()?;
    follow_up.await
}

fn seconds(flag: &str, secs: f64) -> Result<Duration> {
    anyhow::ensure!(
        secs.is_finite() && secs > 0.0,
        "{flag} must be a positive number of seconds"
    );
    Ok(Duration::from_secs_f64(secs))
}

fn build_fetcher(
    timeouts: FetchTimeouts,
    args: FetchArgs,
) -> Result<HttpPageFetcher<HtmlTextCleaner>> {
    let cleaner = HtmlTextCleaner::new().map_err(|e| anyhow::anyhow!(e))?;

    let mut forum = RedditClient::new(timeouts).context("Failed to create Reddit client")?;
    if let Some(user_agent) = args.reddit_user_agent {
        forum = forum.with_user_agent(user_agent);
    }
    match (args.reddit_client_id, args.reddit_client_secret) {
        (Some(id), Some(secret)) => forum = forum.with_credentials(id, secret),
        (Some(_), None) | (None, Some(_)) => tracing::warn!(
            "Only one of REDDIT_CLIENT_ID and REDDIT_CLIENT_SECRET is set, using the public Reddit API"
        ),
        (None, None) => {}
    }

    let fetcher = HttpPageFetcher::with_timeouts(cleaner, timeouts)
        .context("Failed to create HTTP client")?
        .with_forum(forum);

    Ok(if args.allow_private_urls {
        fetcher.allow_private_urls()
    } else {
        fetcher
    })
}

async fn cmd_search(
    config: &TrawlConfig,
    query: &str,
    context: &str,
    llm: LlmArgs,
    google: GoogleArgs,
    fetch: FetchArgs,
) -> Result<()> {
    let search = GoogleSearchClient::new(google.google_api_key, google.search_engine_id)
        .context("Failed to create search client")?;
    let mode = if llm.single_stage {
        AnalysisMode::SingleStage
    } else {
        AnalysisMode::TwoStage
    };

    match llm.provider {
        ProviderKind::Openai => {
            let model = llm.model.as_deref().unwrap_or("gpt-4o-mini");
            let provider = match &llm.base_url {
                Some(url) => OpenAiProvider::with_base_url(&llm.api_key, model, url),
                None => OpenAiProvider::new(&llm.api_key, model),
            }
            .context("Failed to create LLM client")?
            .with_mode(mode);
            run_search(config, query, context, provider, search, fetch).await
        }
        ProviderKind::Anthropic => {
            let model = llm.model.as_deref().unwrap_or("claude-haiku-4-5");
            let provider = match &llm.base_url {
                Some(url) => AnthropicProvider::with_base_url(&llm.api_key, model, url),
                None => AnthropicProvider::new(&llm.api_key, model),
            }
            .context("Failed to create LLM client")?
            .with_mode(mode);
            run_search(config, query, context, provider, search, fetch).await
        }
    }
}

async fn run_search<P>(
    config: &TrawlConfig,
    query: &str,
    context: &str,
    provider: P,
    search: GoogleSearchClient,
    fetch: FetchArgs,
) -> Result<()>
where
    P: AnalysisProvider + ContextResolver + Clone,
{
    let breaker = DomainCircuitBreaker::load(&config.state_file);
    let fetcher = build_fetcher(config.pipeline.budget.timeouts, fetch)?;
    let extractor = ConcurrentExtractor::new(fetcher, breaker);
    let cache = MemoryAnswerCache::new(config.cache_capacity, config.cache_ttl);

    tracing::info!(%query, model = provider.name(), "Searching");
    let pipeline = SearchPipeline::new(provider.clone(), search, extractor, config.pipeline)
        .with_resolver(provider)
        .with_store(cache);

    let answer = pipeline.search_and_respond(query, context).await;

    deliver(&mut std::io::stdout(), &answer, async {
        pipeline
            .shutdown()
            .await
            .context("Failed to save circuit breaker state")
    })
    .await
}

async fn cmd_extract(
    config: &TrawlConfig,
    urls: &[String],
    budget: &Budget,
    feedback: bool,
    fetch: FetchArgs,
) -> Result<()> {
    let breaker = DomainCircuitBreaker::load(&config.state_file);
    let fetcher = build_fetcher(budget.timeouts, fetch)?;
    let extractor = ConcurrentExtractor::new(fetcher, breaker.clone());

    let outcome = extractor.extract(urls, budget).await;
    let json = serde_json::to_string_pretty(&outcome)?;

    deliver(&mut std::io::stdout(), &json, async {
        if !feedback {
            return Ok(());
        }
        breaker
            .report_outcome(&outcome, config.pipeline.count_slow_sites)
            .await;
        breaker
            .flush()
            .await
            .context("Failed to save circuit breaker state")
    })
    .await
}

async fn cmd_domains(config: &TrawlConfig, action: DomainAction) -> Result<()> {
    let breaker = DomainCircuitBreaker::load(&config.state_file);

    match action {
        DomainAction::List => {
            let state = breaker.snapshot();

            if state.blocked_domains.is_empty() {
                println!("No blocked domains");
            } else {
                println!("Blocked domains:\n");
                for (domain, record) in &state.blocked_domains {
                    println!(
                        "  {domain}: {} (since {}, {} failures)",
                        record.reason,
                        record.blocked_at.format("%Y-%m-%d %H:%M:%S UTC"),
                        record.failure_count_at_block,
                    );
                }
            }

            if !state.temporary_failures.is_empty() {
                println!(
                    "\nFailing domains (block at {}):\n",
                    state.config.max_failures_before_block
                );
                for (domain, record) in &state.temporary_failures {
                    println!(
                        "  {domain}: {} failures, last: {}",
                        record.failure_count, record.last_failure_reason
                    );
                }
            }

            if !state.whitelist.is_empty() {
                println!("\nWhitelisted domains:\n");
                for domain in &state.whitelist {
                    println!("  {domain}");
                }
            }
            // Read-only; nothing to flush.
            return Ok(());
        }
        DomainAction::Stats => {
            println!("{}", serde_json::to_string_pretty(&breaker.stats())?);
            return Ok(());
        }
        DomainAction::Block { domain, reason } => {
            breaker.block_domain(&domain, &reason).await;
            println!("Blocked {domain}");
        }
        DomainAction::Unblock { domain } => {
            if breaker.unblock_domain(&domain).await {
                println!("Unblocked {domain}");
            } else {
                println!("{domain} was not blocked");
            }
        }
        DomainAction::Whitelist { domain } => {
            breaker.add_to_whitelist(&domain).await;
            println!("Whitelisted {domain}");
        }
        DomainAction::Unwhitelist { domain } => {
            if breaker.remove_from_whitelist(&domain).await {
                println!("Removed {domain} from the whitelist");
            } else {
                println!("{domain} was not whitelisted");
            }
        }
        DomainAction::AutoBlock { enabled } => {
            breaker.set_auto_block(enabled).await;
            println!(
                "Auto-blocking {}",
                if enabled { "enabled" } else { "disabled" }
            );
        }
        DomainAction::Threshold { failures } => {
            breaker
                .set_max_failures(failures)
                .await
                .map_err(|e| anyhow::anyhow!(e))?;
            println!("Domains are now blocked after {failures} failures");
        }
    }

    breaker
        .flush()
        .await
        .context("Failed to save circuit breaker state")?;
    Ok(())
}

//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use wikiaccess_core::{
    BatchRequest, CommandChecker, CommandRenderer, ConversionPipeline, JsonSummaryWriter,
};
use wikiaccess_discovery::{
    DiscoveryEngine, DiscoveryFilter, DiscoveryWorkflow, PageExistenceProbe,
};
use wikiaccess_links::LinkResolver;
use wikiaccess_shared::{
    AppConfig, DiscoveryStatus, PageId, PipelineConfig, ProbeConfig, WikiSource, init_config,
    load_config, parse_page_list_line,
};
use wikiaccess_storage::Store;

use crate::output::{self, CliProgress};

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// WikiAccess: convert wiki pages into accessible documents.
#[derive(Parser)]
#[command(
    name = "wikiaccess",
    version,
    about = "Convert wiki pages into accessible HTML/DOCX and track links, scores and discovered pages.",
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
    /// Convert pages given as ids/URLs and/or listed in a file.
    Convert {
        /// Page ids or wiki URLs.
        pages: Vec<String>,

        /// Page list file, one id or URL per line (`N→URL` accepted).
        #[arg(short, long)]
        file: Option<PathBuf>,

        #[command(flatten)]
        opts: ConvertOpts,
    },

    /// Convert every approved discovery.
    ConvertApproved {
        /// Only pages discovered at or below this depth.
        #[arg(long)]
        max_depth: Option<u32>,

        /// List what would be converted and exit.
        #[arg(long)]
        dry_run: bool,

        #[command(flatten)]
        opts: ConvertOpts,
    },

    /// Re-run discovery over a closed batch's broken links.
    Discover {
        /// Batch to analyse.
        #[arg(long)]
        batch: String,

        /// Override the configured maximum discovery depth.
        #[arg(long)]
        max_depth: Option<u32>,

        /// Check new discoveries for 404 right away.
        #[arg(long)]
        probe: bool,
    },

    /// Review discovered pages.
    Review {
        #[command(subcommand)]
        action: ReviewAction,
    },

    /// Conversion attempts for one page, newest first.
    History {
        page: String,

        #[arg(short, long, default_value = "10")]
        limit: u32,
    },

    /// Accessibility score history for one page.
    Trends { page: String },

    /// Recent batches.
    Batches {
        #[arg(short, long, default_value = "20")]
        limit: u32,
    },

    /// One batch with its pages.
    Batch {
        batch_id: String,

        /// Also list accessibility issues per page.
        #[arg(long)]
        issues: bool,
    },

    /// Broken internal links grouped by target.
    BrokenLinks {
        /// Restrict to one batch (default: each page's latest batch).
        #[arg(long)]
        batch: Option<String>,

        #[arg(long)]
        json: bool,
    },

    /// Failed images.
    Images {
        #[arg(long)]
        batch: Option<String>,

        /// Per-URL failure rates instead of individual failures.
        #[arg(long)]
        stats: bool,
    },

    /// Re-run link resolution over every rendered page.
    Relink {
        /// Batch to record the links under (default: latest batch).
        #[arg(long)]
        batch: Option<String>,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Overrides for one conversion run.
#[derive(Args)]
pub(crate) struct ConvertOpts {
    /// Convert pages even if converted successfully within the freshness window.
    #[arg(long)]
    no_skip_recent: bool,

    /// Do not discover new pages from broken links.
    #[arg(long)]
    no_discovery: bool,

    /// Skip accessibility checks.
    #[arg(long)]
    no_check: bool,

    /// Check new discoveries for 404 right away.
    #[arg(long)]
    probe: bool,

    /// Pages converted concurrently.
    #[arg(short = 'j', long)]
    concurrency: Option<usize>,
}

/// Review subcommands.
#[derive(Subcommand)]
pub(crate) enum ReviewAction {
    /// Pages awaiting a decision.
    Pending {
        #[command(flatten)]
        filter: FilterArgs,

        #[arg(short, long)]
        limit: Option<usize>,

        #[arg(long)]
        json: bool,
    },

    /// Pages that link to a discovered page.
    Sources { page: String },

    /// Approve pages for conversion.
    Approve {
        #[arg(required = true)]
        pages: Vec<String>,

        #[arg(short, long)]
        reason: Option<String>,
    },

    /// Skip pages.
    Skip {
        #[arg(required = true)]
        pages: Vec<String>,

        #[arg(short, long)]
        reason: Option<String>,
    },

    /// Approve every pending page matching one criterion.
    BulkApprove(BulkApproveArgs),

    /// Skip every pending page matching one criterion.
    BulkSkip(BulkSkipArgs),

    /// Check one discovered page for 404.
    Check { page: String },

    /// Check every pending page for 404.
    CheckAll,

    /// Write a page list of discovered pages in one status.
    Export {
        #[arg(long, default_value = "approved")]
        status: DiscoveryStatus,

        /// Output file (default: stdout).
        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// Counts by status and depth, and the recommended next step.
    Status {
        #[arg(long)]
        json: bool,
    },
}

#[derive(Args)]
pub(crate) struct FilterArgs {
    /// Page id prefix, e.g. `course:notes:*`.
    #[arg(long)]
    namespace: Option<String>,

    #[arg(long)]
    min_refs: Option<u32>,

    #[arg(long)]
    max_refs: Option<u32>,

    #[arg(long)]
    depth: Option<u32>,
}

impl From<FilterArgs> for DiscoveryFilter {
    fn from(f: FilterArgs) -> Self {
        Self {
            namespace: f.namespace,
            min_references: f.min_refs,
            max_references: f.max_refs,
            depth: f.depth,
            max_depth: None,
        }
    }
}

#[derive(Args)]
#[group(required = true, multiple = false)]
pub(crate) struct BulkApproveArgs {
    #[arg(long)]
    all: bool,

    #[arg(long)]
    namespace: Option<String>,

    #[arg(long)]
    min_refs: Option<u32>,

    #[arg(long)]
    depth: Option<u32>,
}

#[derive(Args)]
#[group(required = true, multiple = false)]
pub(crate) struct BulkSkipArgs {
    #[arg(long)]
    all: bool,

    #[arg(long)]
    max_refs: Option<u32>,
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
        0 => "wikiaccess=info",
        1 => "wikiaccess=debug",
        _ => "wikiaccess=trace",
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
        Command::Convert { pages, file, opts } => cmd_convert(&pages, file.as_deref(), &opts).await,
        Command::ConvertApproved {
            max_depth,
            dry_run,
            opts,
        } => cmd_convert_approved(max_depth, dry_run, &opts).await,
        Command::Discover {
            batch,
            max_depth,
            probe,
        } => cmd_discover(&batch, max_depth, probe).await,
        Command::Review { action } => cmd_review(action).await,
        Command::History { page, limit } => cmd_history(&page, limit).await,
        Command::Trends { page } => cmd_trends(&page).await,
        Command::Batches { limit } => cmd_batches(limit).await,
        Command::Batch { batch_id, issues } => cmd_batch(&batch_id, issues).await,
        Command::BrokenLinks { batch, json } => cmd_broken_links(batch.as_deref(), json).await,
        Command::Images { batch, stats } => cmd_images(batch.as_deref(), stats).await,
        Command::Relink { batch } => cmd_relink(batch.as_deref()).await,
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show().await,
        },
    }
}

// ---------------------------------------------------------------------------
// Shared setup
// ---------------------------------------------------------------------------

/// Loaded config plus the opened history database.
struct Context {
    config: AppConfig,
    wiki: WikiSource,
    store: Arc<Store>,
}

impl Context {
    async fn open() -> Result<Self> {
        let config = load_config()?;
        let wiki = config.wiki_source()?;
        let store = Arc::new(Store::open(Path::new(&config.storage.db_path)).await?);
        Ok(Self {
            config,
            wiki,
            store,
        })
    }

    /// Reporting commands never create or migrate the database.
    async fn open_readonly() -> Result<Self> {
        let config = load_config()?;
        let wiki = config.wiki_source()?;
        let store = Arc::new(Store::open_readonly(Path::new(&config.storage.db_path)).await?);
        Ok(Self {
            config,
            wiki,
            store,
        })
    }

    fn workflow(&self) -> DiscoveryWorkflow {
        DiscoveryWorkflow::new(self.store.clone(), self.wiki.clone())
    }

    fn probe(&self) -> Result<Arc<PageExistenceProbe>> {
        let probe = PageExistenceProbe::new(self.wiki.clone(), ProbeConfig::from(&self.config.probe))?
            .with_store(self.store.clone());
        Ok(Arc::new(probe))
    }

    fn page_id(&self, raw: &str) -> Result<PageId> {
        parse_page_list_line(&self.wiki, raw)?.ok_or_else(|| eyre!("'{raw}' is not a page id"))
    }

    fn pipeline_config(&self, opts: &ConvertOpts) -> PipelineConfig {
        let mut config = PipelineConfig::from(&self.config);
        if opts.no_skip_recent {
            config.skip_recent = false;
        }
        if opts.no_discovery {
            config.enable_discovery = false;
        }
        if opts.no_check {
            config.check_accessibility = false;
        }
        if let Some(n) = opts.concurrency {
            config.concurrency = n.max(1);
        }
        config
    }

    fn pipeline(&self, opts: &ConvertOpts) -> Result<ConversionPipeline> {
        let config = self.pipeline_config(opts);
        let summary = JsonSummaryWriter::new(&config.output_dir);
        let check = config.check_accessibility;

        let mut pipeline = ConversionPipeline::new(
            self.store.clone(),
            self.wiki.clone(),
            config,
            Arc::new(CommandRenderer::new(self.config.renderer.clone())),
        )?
        .with_report_sink(Arc::new(summary));
        if check {
            pipeline =
                pipeline.with_checker(Arc::new(CommandChecker::new(self.config.checker.clone())));
        }
        if opts.probe {
            pipeline = pipeline.with_probe(self.probe()?);
        }
        Ok(pipeline)
    }
}

/// Cancel on Ctrl-C; pages already in flight finish.
fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; finishing pages in flight");
            child.cancel();
        }
    });
    token
}

async fn run_batch(ctx: &Context, opts: &ConvertOpts, request: BatchRequest) -> Result<()> {
    let pipeline = ctx.pipeline(opts)?;
    let reporter = CliProgress::new();
    let cancel = cancel_on_ctrl_c();

    let report = pipeline.run(request, &reporter, &cancel).await?;
    output::print_batch_report(&report);

    let next = ctx.workflow().progress().await?.next_action;
    println!("  Next: {next}");
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Conversion
// ---------------------------------------------------------------------------

async fn cmd_convert(pages: &[String], file: Option<&Path>, opts: &ConvertOpts) -> Result<()> {
    let ctx = Context::open().await?;

    let mut ids = Vec::new();
    for raw in pages {
        ids.push(ctx.page_id(raw)?);
    }
    if let Some(path) = file {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| eyre!("cannot read page list '{}': {e}", path.display()))?;
        for (n, line) in content.lines().enumerate() {
            match parse_page_list_line(&ctx.wiki, line) {
                Ok(Some(id)) => ids.push(id),
                Ok(None) => {}
                Err(e) => warn!(line = n + 1, error = %e, "skipping page list entry"),
            }
        }
    }
    if ids.is_empty() {
        return Err(eyre!("no pages to convert: pass page ids or --file"));
    }

    info!(pages = ids.len(), "converting pages");
    run_batch(&ctx, opts, BatchRequest::new(ids)).await
}

async fn cmd_convert_approved(max_depth: Option<u32>, dry_run: bool, opts: &ConvertOpts) -> Result<()> {
    let ctx = Context::open().await?;
    let approved = ctx.workflow().ready_to_convert(max_depth).await?;
    if approved.is_empty() {
        println!("No approved pages to convert.");
        return Ok(());
    }

    if dry_run {
        println!("Would convert {} approved page(s):", approved.len());
        output::print_discovered(&approved);
        return Ok(());
    }

    info!(pages = approved.len(), "converting approved pages");
    run_batch(&ctx, opts, BatchRequest::approved(&approved)).await
}

async fn cmd_discover(batch_id: &str, max_depth: Option<u32>, probe: bool) -> Result<()> {
    let ctx = Context::open().await?;
    let depth = max_depth.unwrap_or(ctx.config.pipeline.max_depth);
    let mut engine = DiscoveryEngine::new(ctx.store.clone(), ctx.wiki.clone(), depth);
    if probe {
        engine = engine.with_probe(ctx.probe()?);
    }

    let stats = engine.auto_discover(batch_id).await?;
    output::print_discovery_stats(&stats);
    Ok(())
}

// ---------------------------------------------------------------------------
// Review
// ---------------------------------------------------------------------------

async fn cmd_review(action: ReviewAction) -> Result<()> {
    match action {
        ReviewAction::Pending {
            filter,
            limit,
            json,
        } => {
            let ctx = Context::open_readonly().await?;
            let mut pages = ctx.workflow().pending_review(&filter.into()).await?;
            if let Some(limit) = limit {
                pages.truncate(limit);
            }
            if json {
                println!("{}", serde_json::to_string_pretty(&pages)?);
            } else if pages.is_empty() {
                println!("No pages awaiting review.");
            } else {
                output::print_discovered(&pages);
            }
        }
        ReviewAction::Sources { page } => {
            let ctx = Context::open_readonly().await?;
            let id = ctx.page_id(&page)?;
            let sources = ctx.workflow().sources(&id).await?;
            println!("{id} is linked from {} page(s):", sources.len());
            for s in sources {
                let text = s.link_text.as_deref().unwrap_or("");
                println!("  {:<40} {text:<30} (batch {})", s.source_page_id, s.batch_id);
            }
        }
        ReviewAction::Approve { pages, reason } => {
            decide(&pages, DiscoveryStatus::Approved, reason.as_deref()).await?;
        }
        ReviewAction::Skip { pages, reason } => {
            decide(&pages, DiscoveryStatus::Skipped, reason.as_deref()).await?;
        }
        ReviewAction::BulkApprove(args) => {
            let ctx = Context::open().await?;
            let wf = ctx.workflow();
            let n = match (args.all, args.namespace, args.min_refs, args.depth) {
                (true, ..) => wf.approve_all().await?,
                (_, Some(ns), ..) => wf.approve_namespace(&ns).await?,
                (_, _, Some(min), _) => wf.approve_min_references(min).await?,
                (_, _, _, Some(depth)) => wf.approve_depth(depth).await?,
                _ => return Err(eyre!("pick one of --all, --namespace, --min-refs, --depth")),
            };
            println!("Approved {n} page(s).");
        }
        ReviewAction::BulkSkip(args) => {
            let ctx = Context::open().await?;
            let wf = ctx.workflow();
            let n = match args.max_refs {
                Some(max) => wf.skip_max_references(max).await?,
                None => wf.skip_all().await?,
            };
            println!("Skipped {n} page(s).");
        }
        ReviewAction::Check { page } => {
            let ctx = Context::open().await?;
            let id = ctx.page_id(&page)?;
            let status = ctx.workflow().check(&*ctx.probe()?, &id).await?;
            match status {
                200 => println!("{id}: exists"),
                404 => println!("{id}: not found (marked failed_404)"),
                0 => println!("{id}: check failed (timeout or network error)"),
                other => println!("{id}: HTTP {other}"),
            }
        }
        ReviewAction::CheckAll => {
            let ctx = Context::open().await?;
            let stats = ctx.workflow().check_pending(&*ctx.probe()?).await?;
            println!(
                "Checked {}: {} found, {} not found, {} errors",
                stats.checked, stats.found, stats.not_found, stats.errors
            );
        }
        ReviewAction::Export { status, out } => {
            let ctx = Context::open_readonly().await?;
            let wf = ctx.workflow();
            match out {
                Some(path) => {
                    let n = wf.export(status, &path).await?;
                    println!("Wrote {n} page(s) to {}", path.display());
                }
                None => print!("{}", wf.export_list(status).await?),
            }
        }
        ReviewAction::Status { json } => {
            let ctx = Context::open_readonly().await?;
            let wf = ctx.workflow();
            let progress = wf.progress().await?;
            let summary = wf.summary().await?;
            if json {
                let value = serde_json::json!({ "progress": progress, "summary": summary });
                println!("{}", serde_json::to_string_pretty(&value)?);
            } else {
                output::print_discovery_status(&progress, &summary);
            }
        }
    }
    Ok(())
}

async fn decide(pages: &[String], to: DiscoveryStatus, reason: Option<&str>) -> Result<()> {
    let ctx = Context::open().await?;
    let wf = ctx.workflow();
    for raw in pages {
        let id = ctx.page_id(raw)?;
        if wf.transition(&id, to, reason, None).await? {
            println!("{id}: {to}");
        } else {
            println!("{id}: already decided, unchanged");
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Reporting
// ---------------------------------------------------------------------------

async fn cmd_history(page: &str, limit: u32) -> Result<()> {
    let ctx = Context::open_readonly().await?;
    let id = ctx.page_id(page)?;
    let history = ctx
        .store
        .page_history(ctx.wiki.base_url(), &id, limit)
        .await?;
    if history.is_empty() {
        println!("No conversions recorded for {id}.");
    } else {
        output::print_pages(&history);
    }
    Ok(())
}

async fn cmd_trends(page: &str) -> Result<()> {
    let ctx = Context::open_readonly().await?;
    let id = ctx.page_id(page)?;
    let points = ctx
        .store
        .accessibility_trends(ctx.wiki.base_url(), &id)
        .await?;
    if points.is_empty() {
        println!("No scored conversions for {id}.");
    } else {
        output::print_trends(&points);
    }
    Ok(())
}

async fn cmd_batches(limit: u32) -> Result<()> {
    let ctx = Context::open_readonly().await?;
    let batches = ctx.store.list_batches(limit).await?;
    if batches.is_empty() {
        println!("No batches yet.");
    } else {
        output::print_batches(&batches);
    }
    Ok(())
}

async fn cmd_batch(batch_id: &str, issues: bool) -> Result<()> {
    let ctx = Context::open_readonly().await?;
    let batch = ctx
        .store
        .get_batch(batch_id)
        .await?
        .ok_or_else(|| eyre!("no batch '{batch_id}'"))?;
    output::print_batches(std::slice::from_ref(&batch));

    let pages = ctx.store.batch_pages(batch_id).await?;
    println!();
    output::print_pages(&pages);

    if issues {
        for page in &pages {
            let found = ctx.store.page_issues(&page.page_id, batch_id).await?;
            if !found.is_empty() {
                println!();
                println!("  {}", page.page_id);
                output::print_issues(&found);
            }
        }
    }
    Ok(())
}

async fn cmd_broken_links(batch: Option<&str>, json: bool) -> Result<()> {
    let ctx = Context::open_readonly().await?;
    let resolver = LinkResolver::new(ctx.store.clone(), ctx.wiki.clone())?;
    let report = resolver.broken_links_report(batch).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else if report.is_empty() {
        println!("No broken links.");
    } else {
        output::print_broken_links(&report);
    }
    Ok(())
}

async fn cmd_images(batch: Option<&str>, stats: bool) -> Result<()> {
    let ctx = Context::open_readonly().await?;
    if stats {
        output::print_image_stats(&ctx.store.image_failure_stats().await?);
    } else {
        let failed = ctx.store.failed_images(batch).await?;
        if failed.is_empty() {
            println!("No failed images.");
        } else {
            output::print_failed_images(&failed);
        }
    }
    Ok(())
}

async fn cmd_relink(batch: Option<&str>) -> Result<()> {
    let ctx = Context::open().await?;
    let batch_id = match batch {
        Some(id) => id.to_string(),
        None => ctx
            .store
            .list_batches(1)
            .await?
            .into_iter()
            .next()
            .map(|b| b.batch_id)
            .ok_or_else(|| eyre!("no batches yet; convert some pages first"))?,
    };

    let resolver = LinkResolver::new(ctx.store.clone(), ctx.wiki.clone())?;
    let stats = resolver.rewrite_all_links(&batch_id).await?;
    println!();
    println!("  Links resolved (batch {batch_id})");
    output::print_link_stats(&stats);
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

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

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn convert_approved_depth_is_an_upper_bound() {
        let cmd = Cli::command();
        let sub = cmd.find_subcommand("convert-approved").unwrap();
        let arg = sub
            .get_arguments()
            .find(|a| a.get_id() == "max_depth")
            .unwrap();
        let help = arg.get_help().unwrap().to_string();
        assert!(help.contains("at or below"), "{help}");

        let cli = Cli::try_parse_from(["wikiaccess", "convert-approved", "--max-depth", "1"])
            .unwrap();
        assert!(matches!(
            cli.command,
            Command::ConvertApproved {
                max_depth: Some(1),
                ..
            }
        ));
    }
}

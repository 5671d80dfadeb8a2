use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use redirtool_core::config::load_config;
use redirtool_core::convert::{
    Confirm, ConvertOptions, ConvertSummary, PageLookup, RecordOutcome, RedirectConverter,
};
use redirtool_core::link::{PageLinkBuilder, PageReferenceSynthesizer};
use redirtool_core::migrate::{latest_version, pending_migration_count, run_migrations};
use redirtool_core::resolver::{ReqwestProbe, UrlResolver};
use redirtool_core::routing::RouteMatcher;
use redirtool_core::runtime::{
    InitOptions, MIGRATIONS_POLICY_MESSAGE, PathOverrides, ResolutionContext, ResolvedPaths,
    ensure_database_ready, init_layout, inspect_runtime, resolve_paths,
};
use redirtool_core::slugs::SlugResolver;
use redirtool_core::storage::{
    SqlitePageIndex, SqliteRedirectStore, load_redirects, redirect_stats,
};
use serde::Serialize;
use tracing::{Level, warn};
use tracing_subscriber::FmtSubscriber;

#[derive(Debug, Parser)]
#[command(
    name = "redirtool",
    version,
    about = "Sanitize redirect records: convert path targets to page links"
)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH")]
    project_root: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    db: Option<PathBuf>,
    #[arg(long, global = true, help = "Print resolved runtime diagnostics")]
    diagnostics: bool,
    #[arg(
        short,
        long,
        global = true,
        action = clap::ArgAction::Count,
        help = "More log output (-v debug, -vv trace)"
    )]
    verbose: u8,
    #[arg(short, long, global = true, conflicts_with = "verbose", help = "Only log errors")]
    quiet: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone)]
struct RuntimeOptions {
    project_root: Option<PathBuf>,
    config: Option<PathBuf>,
    db: Option<PathBuf>,
    diagnostics: bool,
}

impl RuntimeOptions {
    fn from_cli(cli: &Cli) -> Self {
        Self {
            project_root: cli.project_root.clone(),
            config: cli.config.clone(),
            db: cli.db.clone(),
            diagnostics: cli.diagnostics,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    Init(InitArgs),
    Db(DbArgs),
    #[command(
        name = "path2pagelink",
        about = "Convert redirect targets that are site paths into page links"
    )]
    Path2PageLink(Path2PageLinkArgs),
    #[command(about = "Follow redirects for a URL and show the page it maps to")]
    Resolve(ResolveArgs),
}

#[derive(Debug, Args)]
struct InitArgs {
    #[arg(long, help = "Overwrite existing config file")]
    force: bool,
    #[arg(long, help = "Skip writing .redirtool/config.toml")]
    no_config: bool,
}

#[derive(Debug, Args)]
struct DbArgs {
    #[command(subcommand)]
    command: DbSubcommand,
}

#[derive(Debug, Subcommand)]
enum DbSubcommand {
    Stats,
    Migrate,
}

#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Args)]
struct Path2PageLinkArgs {
    #[arg(short = 'd', long, help = "Report conversions without writing them")]
    dry_run: bool,
    #[arg(short = 'i', long, help = "Ask before each update")]
    interactive: bool,
    #[arg(long, help = "Probe with https even when the record does not force it")]
    force_https: bool,
    #[arg(long, help = "Link translated pages to their default-language page")]
    always_link_to_original_language: bool,
    #[arg(long, help = "Also process records flagged as protected")]
    include_protected: bool,
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,
}

#[derive(Debug, Args)]
struct ResolveArgs {
    url: String,
    #[arg(long, help = "Link translated pages to their default-language page")]
    always_link_to_original_language: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet)?;
    let runtime = RuntimeOptions::from_cli(&cli);

    match cli.command {
        Some(Commands::Init(args)) => run_init(&runtime, args),
        Some(Commands::Db(DbArgs { command })) => match command {
            DbSubcommand::Migrate => run_db_migrate(&runtime),
            DbSubcommand::Stats => run_db_stats(&runtime),
        },
        Some(Commands::Path2PageLink(args)) => run_path2pagelink(&runtime, args),
        Some(Commands::Resolve(args)) => run_resolve(&runtime, args),
        None => {
            let mut command = Cli::command();
            command.print_help()?;
            println!();
            Ok(())
        }
    }
}

fn init_logging(verbose: u8, quiet: bool) -> Result<()> {
    let level = if quiet {
        Level::ERROR
    } else {
        match verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_writer(io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("failed to install log subscriber")
}

fn run_init(runtime: &RuntimeOptions, args: InitArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let report = init_layout(
        &paths,
        &InitOptions {
            materialize_config: !args.no_config,
            force: args.force,
        },
    )?;

    println!("Initialized redirtool runtime layout");
    println!("project_root: {}", normalize_path(&paths.project_root));
    println!("state_dir: {}", normalize_path(&paths.state_dir));
    println!("db_path: {}", normalize_path(&paths.db_path));
    println!("config_path: {}", normalize_path(&paths.config_path));
    println!("created_dirs: {}", report.created_dirs.len());
    println!("wrote_config: {}", report.wrote_config);
    println!("policy: {MIGRATIONS_POLICY_MESSAGE}");
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_db_migrate(runtime: &RuntimeOptions) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let report = run_migrations(&paths)?;

    println!("db migrate");
    println!("db_path: {}", normalize_path(&paths.db_path));
    if report.applied.is_empty() {
        println!("applied: none");
    } else {
        for step in &report.applied {
            let note = if step.changed { "" } else { " (already present)" };
            println!("applied: v{:03}_{}{note}", step.version, step.name);
        }
    }
    println!("schema_version: {}", report.schema_version);
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_db_stats(runtime: &RuntimeOptions) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let status = inspect_runtime(&paths)?;
    ensure_database_ready(&paths, &status)?;
    let store = SqliteRedirectStore::open(&paths.db_path)?;
    let stats = redirect_stats(store.connection())?;

    println!("db stats");
    println!("db_path: {}", normalize_path(&paths.db_path));
    println!(
        "db_size_bytes: {}",
        status
            .db_size_bytes
            .map(|size| size.to_string())
            .unwrap_or_else(|| "n/a".to_string())
    );
    println!("pending_migrations: {}", pending_migration_count(&paths)?);
    println!("redirects: {}", stats.redirects);
    println!("protected: {}", stats.protected);
    for (target_type, count) in &stats.by_target_type {
        println!("target_type.{}: {count}", target_type.replace(' ', "_"));
    }
    println!("pages: {}", stats.pages);
    print_warnings(&status.warnings);
    print_diagnostics(runtime, &paths);
    Ok(())
}

#[derive(Debug, Serialize)]
struct ConvertReport<'a> {
    options: &'a ConvertOptions,
    summary: &'a ConvertSummary,
    outcomes: &'a [RecordOutcome],
}

fn run_path2pagelink(runtime: &RuntimeOptions, args: Path2PageLinkArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let status = inspect_runtime(&paths)?;
    ensure_database_ready(&paths, &status)?;
    let pending = pending_migration_count(&paths)?;
    if pending > 0 {
        bail!(
            "{pending} of {} schema migrations pending. {MIGRATIONS_POLICY_MESSAGE}",
            latest_version()
        );
    }

    let config = load_config(&paths.config_path)?;
    let matcher = RouteMatcher::from_registry(&config)?;
    if matcher.sites().is_empty() {
        warn!(
            "no sites configured in {}; every path target will be skipped",
            normalize_path(&paths.config_path)
        );
    }
    let probe = ReqwestProbe::new(&config.http_settings()?)?;
    let links = PageReferenceSynthesizer::new(PageLinkBuilder, config.language_parameter()?);
    let slugs = SlugResolver::new(SqlitePageIndex::open(&paths.db_path)?);
    let mut converter = RedirectConverter::new(UrlResolver::new(probe), matcher, slugs, links)
        .with_default_force_https(config.force_https());

    let mut store = SqliteRedirectStore::open(&paths.db_path)?;
    let records = load_redirects(store.connection(), args.include_protected)?;
    let options = ConvertOptions {
        dry_run: args.dry_run,
        interactive: args.interactive,
        force_https: args.force_https,
        always_link_to_original_language: args.always_link_to_original_language
            || config.always_link_to_original_language(),
    };

    let outcomes = converter.convert(records, &options, &mut store, &mut StdinConfirm);
    let summary = ConvertSummary::from_outcomes(&outcomes);

    match args.format {
        OutputFormat::Json => {
            let report = ConvertReport {
                options: &options,
                summary: &summary,
                outcomes: &outcomes,
            };
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        OutputFormat::Text => {
            for outcome in &outcomes {
                println!("{}", format_outcome(outcome));
            }
            println!("path2pagelink");
            println!("dry_run: {}", options.dry_run);
            println!("records: {}", summary.total);
            for (decision, count) in &summary.by_decision {
                println!("decision.{decision}: {count}");
            }
            println!("updated: {}", summary.updated);
            println!("declined: {}", summary.declined);
            println!("update_failures: {}", summary.update_failures);
        }
    }
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn format_outcome(outcome: &RecordOutcome) -> String {
    let mut line = format!(
        "uid={} {}: {}",
        outcome.record_id,
        outcome.decision.as_str(),
        outcome.detail
    );
    if let Some(kind) = outcome.error_kind {
        line.push_str(&format!(" [{}]", kind.as_str()));
    }
    if let Some(update) = outcome.update {
        line.push_str(&format!(" (update: {}", update.as_str()));
        if let Some(error) = &outcome.update_error {
            line.push_str(&format!(", {error}"));
        }
        line.push(')');
    }
    line
}

fn run_resolve(runtime: &RuntimeOptions, args: ResolveArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let status = inspect_runtime(&paths)?;
    ensure_database_ready(&paths, &status)?;
    let config = load_config(&paths.config_path)?;

    let mut converter = RedirectConverter::new(
        UrlResolver::new(ReqwestProbe::new(&config.http_settings()?)?),
        RouteMatcher::from_registry(&config)?,
        SlugResolver::new(SqlitePageIndex::open(&paths.db_path)?),
        PageReferenceSynthesizer::new(PageLinkBuilder, config.language_parameter()?),
    );
    let always = args.always_link_to_original_language || config.always_link_to_original_language();
    let (effective_url, lookup) = converter.url_to_page(&args.url, always)?;

    println!("url: {}", args.url);
    println!("effective_url: {effective_url}");
    match lookup {
        PageLookup::Found(info) => {
            println!("site: {}", info.site);
            println!("tail: {}", info.tail);
            println!("slug: {}", info.candidate.slug);
            println!("matched_language: {}", info.candidate.language_id);
            if let Some(title) = &info.matched_language_title {
                println!("matched_language_title: {title}");
            }
            println!("page_id: {}", info.page_id);
            println!("language_id: {}", info.language_id);
            println!("target: {}", info.target);
        }
        PageLookup::NoRoute(error) => println!("route: {error}"),
        PageLookup::NoCandidate {
            site,
            language_id,
            slug,
        } => {
            println!("site: {site}");
            println!("matched_language: {language_id}");
            println!("slug: {slug}");
            println!("page: not found");
        }
        PageLookup::EmptySynthesis {
            page_id,
            language_id,
        } => {
            println!("page_id: {page_id}");
            println!("language_id: {language_id}");
            println!("target: <empty>");
        }
    }
    print_diagnostics(runtime, &paths);
    Ok(())
}

/// Reads y/N answers from stdin; anything but yes declines.
struct StdinConfirm;

impl Confirm for StdinConfirm {
    fn confirm(&mut self, prompt: &str) -> bool {
        let mut stderr = io::stderr();
        if write!(stderr, "{prompt} [y/N] ").and_then(|()| stderr.flush()).is_err() {
            return false;
        }
        let mut answer = String::new();
        if io::stdin().lock().read_line(&mut answer).is_err() {
            return false;
        }
        matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
    }
}

fn print_warnings(warnings: &[String]) {
    if !warnings.is_empty() {
        println!("warnings:");
        for warning in warnings {
            println!("  - {warning}");
        }
    }
}

fn print_diagnostics(runtime: &RuntimeOptions, paths: &ResolvedPaths) {
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }
}

fn resolve_runtime_paths(runtime: &RuntimeOptions) -> Result<ResolvedPaths> {
    dotenvy::dotenv().ok();

    let context = ResolutionContext::from_process()?;
    let overrides = PathOverrides {
        project_root: runtime.project_root.clone(),
        db: runtime.db.clone(),
        config: runtime.config.clone(),
    };

    let initial = resolve_paths(&context, &overrides)?;
    let project_env = initial.project_root.join(".env");
    if project_env.exists() {
        let _ = dotenvy::from_path_override(&project_env);
    }

    resolve_paths(&context, &overrides)
}

fn normalize_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

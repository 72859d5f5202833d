use std::fmt::Write as _;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use miette::{IntoDiagnostic, Result};
use tracing_subscriber::EnvFilter;

use warden_core::{
    CommitRange, OutputFormat, RepoRef, ReviewParams, Severity, TaskId, TaskPayload, TaskRecord,
    TaskStatus, WardenConfig,
};
use warden_queue::Executor;
use warden_review::channels::build_channels;
use warden_review::llm::LlmClient;
use warden_review::reviewer::LlmReviewer;
use warden_review::source::RoutingDiffSource;

#[derive(Parser)]
#[command(
    name = "warden",
    version,
    about = "Review commit ranges with an LLM and notify on completion",
    long_about = "Warden fetches the diff of one or more commit ranges, reviews it chunk by chunk\n\
                   with an OpenAI-compatible LLM, optionally generates unit and scenario tests,\n\
                   and reports each finished review to the configured notification channels.\n\n\
                   Examples:\n  \
                     warden review --repo github:acme/api --range main..feature\n  \
                     warden review --range HEAD~3..HEAD --unit-tests   Review local commits\n  \
                     warden review --range v1..v2 --range v2..v3       Two reviews in parallel\n  \
                     warden init                                       Write .warden.toml"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to configuration file (default: .warden.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Output format
    #[arg(
        long,
        global = true,
        default_value = "text",
        long_help = "Output format for review results.\n\n\
                       Formats:\n  \
                         text      Human-readable summaries (default)\n  \
                         json      Task records as JSON with camelCase keys\n  \
                         markdown  GitHub-flavored Markdown"
    )]
    format: OutputFormat,

    /// Enable verbose logging (debug level unless RUST_LOG is set)
    #[arg(long, short, global = true)]
    verbose: bool,

    /// When to use colors
    #[arg(long, global = true, default_value = "auto")]
    color: ColorChoice,
}

#[derive(Subcommand)]
enum Command {
    /// Review one or more commit ranges
    #[command(long_about = "Review one or more commit ranges.\n\n\
        Each --range becomes its own task. Tasks run concurrently on a bounded worker pool;\n\
        outbound Git and LLM calls are rate limited and retried with exponential backoff.\n\
        The exit code is 1 if any review failed or --fail-on matched.\n\n\
        Examples:\n  warden review --repo github:acme/api --range main..feature\n  \
        warden review --repo . --range HEAD~1..HEAD --scenarios --format markdown")]
    Review(ReviewArgs),
    /// Create default configuration
    Init,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: clap_complete::Shell,
    },
}

#[derive(Args)]
struct ReviewArgs {
    /// Repository: github:, gitlab: or gitee:owner/repo, a forge URL, or a local path
    #[arg(long, default_value = ".")]
    repo: String,

    /// Commit range base..head (repeatable)
    #[arg(long = "range", required = true)]
    ranges: Vec<String>,

    /// Also generate unit tests for the changed code
    #[arg(long)]
    unit_tests: bool,

    /// Also generate scenario test cases
    #[arg(long)]
    scenarios: bool,

    /// Extra instructions for the reviewer
    #[arg(long)]
    instructions: Option<String>,

    /// Don't print results; only notification channels report them
    #[arg(
        long,
        long_help = "Don't print results.\n\nTask ids are printed as soon as they are queued. Warden still runs every\n\
                     task to completion and delivers the notifications before exiting."
    )]
    no_wait: bool,

    /// Exit with non-zero code if comments meet this severity
    #[arg(
        long,
        long_help = "Exit with non-zero code if comments of this severity or higher are found.\n\n\
                     Severity ranking: bug > warning > suggestion > info."
    )]
    fail_on: Option<Severity>,
}

#[derive(Clone, PartialEq, Eq, ValueEnum)]
enum ColorChoice {
    /// Auto-detect based on terminal
    Auto,
    /// Always use colors
    Always,
    /// Never use colors
    Never,
}

fn print_welcome(use_color: bool) {
    let version = env!("CARGO_PKG_VERSION");

    if use_color {
        println!("\x1b[1mwarden\x1b[0m v{version} - LLM code review for commit ranges\n");
        println!("Quick start:");
        println!("  \x1b[36mwarden init\x1b[0m                              Create a .warden.toml config file");
        println!("  \x1b[36mwarden review --range HEAD~1..HEAD\x1b[0m       Review your latest commit\n");
        println!("All commands:");
        println!("  \x1b[32mreview\x1b[0m       Review commit ranges (GitHub or local)");
        println!("  \x1b[32minit\x1b[0m         Create default configuration");
        println!("  \x1b[32mcompletions\x1b[0m  Generate shell completions\n");
    } else {
        println!("warden v{version} - LLM code review for commit ranges\n");
        println!("Quick start:");
        println!("  warden init                              Create a .warden.toml config file");
        println!("  warden review --range HEAD~1..HEAD       Review your latest commit\n");
        println!("All commands:");
        println!("  review       Review commit ranges (GitHub or local)");
        println!("  init         Create default configuration");
        println!("  completions  Generate shell completions\n");
    }

    println!("Run 'warden <command> --help' for details.");
}

const DEFAULT_CONFIG: &str = r#"# Warden Configuration

[llm]
# OpenAI-compatible endpoint; the key falls back to WARDEN_LLM_API_KEY / OPENAI_API_KEY
# base_url = "https://api.openai.com/v1"
# model = "gpt-4o"
# temperature = 0.1

[git]
# token falls back to GITHUB_TOKEN
# api_base = "https://api.github.com"
# gitlab_token falls back to GITLAB_TOKEN
# gitlab_api_base = "https://gitlab.com/api/v4"
# gitee_token falls back to GITEE_TOKEN
# gitee_api_base = "https://gitee.com/api/v5"

[review]
# max_comments = 10
# min_confidence = 80
# severity_filter = ["bug", "warning", "suggestion"]
# skip_patterns = ["docs/**"]
# skip_extensions = ["snap"]
# max_file_lines = 1000

[queue]
# max_concurrent_tasks = 4
# max_concurrent_calls_per_endpoint_class = 10
# max_retry_attempts = 3
# base_backoff_ms = 500
# max_backoff_ms = 30000
# per_call_timeout_ms = 120000
# per_task_timeout_ms = 1800000
# chunk_size_limit = 12000
# chunk_parallelism = 4
# lease_max_hold_ms = 600000
# result_ttl_secs = 3600

# [queue.endpoint_limits]
# llm = 4

[[notify.channels]]
kind = "log"

# [[notify.channels]]
# kind = "webhook"
# url = "https://hooks.example.com/warden"

# [[notify.channels]]
# kind = "wechat_work"
# webhook_url = "https://qyapi.weixin.qq.com/cgi-bin/webhook/send?key=..."
# mentioned_list = ["@all"]

# [[notify.channels]]
# kind = "github_commit_comment"

# [[notify.channels]]
# kind = "email"
# smtp_host = "smtp.example.com"
# smtp_port = 587
# tls = "starttls"
# username = "warden@example.com"
# password falls back to WARDEN_SMTP_PASSWORD
# to = ["team@example.com"]
"#;

fn init_tracing(verbose: bool) {
    let default = if verbose {
        "info,warden=debug,warden_queue=debug,warden_review=debug,warden_difflens=debug"
    } else {
        "warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    miette::set_hook(Box::new(|_| {
        Box::new(
            miette::MietteHandlerOpts::new()
                .terminal_links(true)
                .build(),
        )
    }))
    .into_diagnostic()?;
    human_panic::setup_panic!();

    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let use_color = match cli.color {
        ColorChoice::Always => true,
        ColorChoice::Never => false,
        ColorChoice::Auto => std::io::stdout().is_terminal() && std::env::var("NO_COLOR").is_err(),
    };

    match cli.command {
        None => print_welcome(use_color),
        Some(Command::Review(args)) => {
            let failed = run_review(cli.config.as_deref(), cli.format, &args).await?;
            if failed {
                std::process::exit(1);
            }
        }
        Some(Command::Init) => {
            let path = Path::new(".warden.toml");
            if path.exists() {
                miette::bail!(".warden.toml already exists");
            }
            std::fs::write(path, DEFAULT_CONFIG).into_diagnostic()?;
            println!("Created .warden.toml with default configuration");
        }
        Some(Command::Completions { shell }) => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "warden", &mut std::io::stdout());
        }
    }

    Ok(())
}

/// Run the reviews. Returns `true` when the process should exit non-zero.
async fn run_review(config_path: Option<&Path>, format: OutputFormat, args: &ReviewArgs) -> Result<bool> {
    let config = WardenConfig::load(config_path)?;

    let repo: RepoRef = args.repo.parse().map_err(|e: String| {
        miette::miette!(
            help = "use github:owner/repo (or gitlab:, gitee:) or a local path",
            "{e}"
        )
    })?;
    let ranges = args
        .ranges
        .iter()
        .map(|r| {
            r.parse::<CommitRange>()
                .map_err(|e| miette::miette!(help = "expected base..head", "invalid range '{r}': {e}"))
        })
        .collect::<Result<Vec<_>>>()?;

    let call_timeout = config.queue.per_call_timeout();
    let llm = LlmClient::new(&config.llm, call_timeout)?;
    if config.llm.resolve_api_key().is_none() {
        tracing::warn!("no LLM API key configured; set WARDEN_LLM_API_KEY or llm.api_key");
    }
    let channels = build_channels(&config.notify.channels, &config.git, call_timeout)?;

    let executor = Executor::builder()
        .queue_config(config.queue.clone())
        .review_config(config.review.clone())
        .diff_source(Arc::new(RoutingDiffSource::new(&config.git)?))
        .reviewer(Arc::new(LlmReviewer::new(llm, config.review.clone())))
        .channels(channels)
        .start()?;

    let params = ReviewParams {
        unit_tests: args.unit_tests,
        scenarios: args.scenarios,
        instructions: args.instructions.clone(),
    };
    let mut ids = Vec::with_capacity(ranges.len());
    for range in ranges {
        ids.push(executor.submit(TaskPayload {
            repo: repo.clone(),
            range,
            params: params.clone(),
        })?);
    }

    if args.no_wait {
        for id in &ids {
            println!("{id}");
        }
        executor.shutdown().await;
        return Ok(false);
    }

    let spinner = if std::io::stderr().is_terminal() {
        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {msg} ({elapsed})")
                .into_diagnostic()?,
        );
        pb.set_message(format!("Reviewing {repo}..."));
        pb.enable_steady_tick(Duration::from_millis(120));
        Some(pb)
    } else {
        None
    };

    let records = wait_all(&executor, &ids, spinner.as_ref()).await?;
    if let Some(pb) = &spinner {
        pb.finish_and_clear();
    }
    executor.shutdown().await;

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&records).into_diagnostic()?);
        }
        OutputFormat::Markdown => print!("{}", render_markdown(&records)),
        OutputFormat::Text => print!("{}", render_text(&records)),
    }

    let any_failed = records.iter().any(|r| r.status == TaskStatus::Failed);
    let threshold_hit = args.fail_on.is_some_and(|threshold| {
        records
            .iter()
            .filter_map(|r| r.result.as_ref())
            .flat_map(|o| o.chunks.iter())
            .flat_map(|c| c.comments.iter())
            .any(|c| c.severity.meets_threshold(threshold))
    });
    Ok(any_failed || threshold_hit)
}

/// Wait for every task, refreshing the spinner and cancelling all tasks on
/// Ctrl-C.
async fn wait_all(executor: &Executor, ids: &[TaskId], spinner: Option<&ProgressBar>) -> Result<Vec<TaskRecord>> {
    let mut records = Vec::with_capacity(ids.len());
    let mut ticker = tokio::time::interval(Duration::from_millis(250));
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut interrupted = false;

    for id in ids {
        let wait = executor.wait(*id);
        tokio::pin!(wait);
        let record = loop {
            tokio::select! {
                record = &mut wait => break record?,
                _ = ticker.tick() => {
                    if let Some(pb) = spinner {
                        pb.set_message(progress_message(executor, ids));
                    }
                }
                _ = &mut ctrl_c, if !interrupted => {
                    interrupted = true;
                    for id in ids {
                        // finished tasks refuse; that's fine
                        let _ = executor.cancel(*id);
                    }
                    if let Some(pb) = spinner {
                        pb.set_message("Cancelling...");
                    }
                }
            }
        };
        records.push(record);
    }
    Ok(records)
}

fn progress_message(executor: &Executor, ids: &[TaskId]) -> String {
    let records: Vec<TaskRecord> = ids.iter().filter_map(|id| executor.status(*id).ok()).collect();
    let done = records.iter().filter(|r| r.is_terminal()).count();
    if let [record] = records.as_slice() {
        return match &record.phase {
            Some(phase) => format!("{} {}: {phase}", record.payload.repo, record.payload.range),
            None => format!("{} {}: {}", record.payload.repo, record.payload.range, record.status),
        };
    }
    let running = records.iter().filter(|r| r.status == TaskStatus::Running).count();
    format!("{done}/{} reviews finished, {running} running", records.len())
}

fn render_text(records: &[TaskRecord]) -> String {
    let mut out = String::new();
    for record in records {
        let payload = &record.payload;
        let _ = writeln!(out, "{} {}  {}", payload.repo, payload.range, record.status);
        if let Some(error) = &record.error {
            let _ = writeln!(out, "  {error}");
        }
        if let Some(output) = &record.result {
            let stats = &output.stats;
            let _ = writeln!(
                out,
                "  {} files, {} chunks, {} comments ({} bugs, {} warnings), {} retries",
                stats.files_reviewed,
                stats.chunks,
                stats.comments_total(),
                stats.bugs,
                stats.warnings,
                record.retry_count
            );
            for skip in &stats.files_skipped {
                let _ = writeln!(out, "  skipped {} ({})", skip.path.display(), skip.reason);
            }
            for chunk in &output.chunks {
                for c in &chunk.comments {
                    let _ = writeln!(
                        out,
                        "  {}:{} [{}] {} ({:.0}%)",
                        c.file_path.display(),
                        c.line,
                        c.severity,
                        c.message,
                        c.confidence
                    );
                    if let Some(suggestion) = &c.suggestion {
                        let _ = writeln!(out, "    suggestion: {suggestion}");
                    }
                }
                for test in &chunk.unit_tests {
                    let _ = writeln!(out, "  unit test {} ({})", test.name, test.file_path.display());
                }
                for scenario in &chunk.scenarios {
                    let _ = writeln!(out, "  scenario: {}", scenario.title);
                }
            }
        }
        out.push('\n');
    }
    out
}

fn render_markdown(records: &[TaskRecord]) -> String {
    let mut out = String::new();
    for record in records {
        let summary = warden_queue::summarize(record);
        let _ = writeln!(out, "## {}\n", summary.title);
        if !summary.body.is_empty() {
            let _ = writeln!(out, "{}\n", summary.body);
        }
        let Some(output) = &record.result else {
            continue;
        };

        let comments: Vec<_> = output.chunks.iter().flat_map(|c| c.comments.iter()).collect();
        if !comments.is_empty() {
            out.push_str("| Severity | Location | Comment |\n|---|---|---|\n");
            for c in comments {
                let _ = writeln!(
                    out,
                    "| {} | `{}:{}` | {} |",
                    c.severity,
                    c.file_path.display(),
                    c.line,
                    c.message.replace('|', "\\|").replace('\n', " ")
                );
            }
            out.push('\n');
        }

        for test in output.chunks.iter().flat_map(|c| c.unit_tests.iter()) {
            let _ = writeln!(
                out,
                "### Unit test `{}` ({})\n\n```\n{}\n```\n",
                test.name,
                test.file_path.display(),
                test.code.trim_end()
            );
        }
        for scenario in output.chunks.iter().flat_map(|c| c.scenarios.iter()) {
            let _ = writeln!(out, "### Scenario: {}\n", scenario.title);
            if let Some(pre) = &scenario.preconditions {
                let _ = writeln!(out, "**Preconditions:** {pre}\n");
            }
            for (n, step) in scenario.steps.iter().enumerate() {
                let _ = writeln!(out, "{}. {step}", n + 1);
            }
            let _ = writeln!(out, "\n**Expected:** {}\n", scenario.expected);
        }
    }
    out
}

use anyhow::{Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use lintkeeper::ciutil::CiAllowList;
use lintkeeper::config::Config;
use lintkeeper::gitlab::{self, GitLabClient, MergeRequestRef};
use lintkeeper::input::read_comments;
use lintkeeper::{DiscussionCommenter, FlushSummary, PublishMode};
use std::fs::File;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{debug, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "lintkeeper",
    about = "Keep merge request discussions in sync with linter findings",
    version
)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Post new findings and resolve threads whose finding went away
    Sync(SyncArgs),
    /// Check whether an address belongs to a known CI provider
    CiOrigin {
        /// `ip` or `ip:port`
        addr: String,
        /// Fetch the current Travis CI address list before checking
        #[arg(long)]
        refresh: bool,
    },
}

#[derive(ClapArgs, Debug)]
struct SyncArgs {
    /// Project id or `group/project` path (detected from git remotes if omitted)
    #[arg(long, env = "CI_MERGE_REQUEST_PROJECT_PATH")]
    project: Option<String>,

    /// Merge request IID
    #[arg(short = 'm', long, env = "CI_MERGE_REQUEST_IID")]
    merge_request: u64,

    /// Commit the findings were computed on (defaults to HEAD)
    #[arg(long, env = "CI_COMMIT_SHA")]
    sha: Option<String>,

    /// Name the findings are reported under
    #[arg(short, long)]
    tool_name: String,

    /// JSON Lines file with one comment per line (default: stdin)
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Config file (default: ~/.config/lintkeeper/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// `immediate` or `draft`
    #[arg(long)]
    publish_mode: Option<PublishMode>,

    /// Maximum remote writes in flight
    #[arg(long)]
    max_concurrency: Option<usize>,

    /// GitLab API root, e.g. https://gitlab.example.com/api/v4
    #[arg(long)]
    gitlab_api: Option<String>,

    /// Repository used for remote and HEAD detection
    #[arg(long, default_value = ".")]
    repo: PathBuf,
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("lintkeeper=info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing();

    let result = match args.command {
        Command::Sync(sync) => run_sync(sync).await,
        Command::CiOrigin { addr, refresh } => run_ci_origin(&addr, refresh).await,
    };

    match result {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error: {:#}", err);
            ExitCode::FAILURE
        }
    }
}

async fn run_sync(args: SyncArgs) -> Result<ExitCode> {
    let mut config = Config::load(args.config.as_deref());
    if let Some(api) = args.gitlab_api {
        config.gitlab_api = Some(api);
    }
    if let Some(mode) = args.publish_mode {
        config.publish_mode = mode;
    }
    if args.max_concurrency.is_some() {
        config.max_concurrency = args.max_concurrency;
    }

    let token = Config::get_token().context(
        "No GitLab token found. Set LINTKEEPER_GITLAB_TOKEN or GITLAB_TOKEN",
    )?;
    let repo = args.repo.as_path();
    let project = match args.project {
        Some(project) => project,
        None => detect_project(&config, repo)?,
    };
    let head_sha = match args.sha {
        Some(sha) => sha,
        None => gitlab::get_head_sha(repo)?,
    };

    let comments = match &args.input {
        Some(path) => {
            let file = File::open(path)
                .with_context(|| format!("Failed to open {}", path.display()))?;
            read_comments(BufReader::new(file), &args.tool_name)?
        }
        None => read_comments(io::stdin().lock(), &args.tool_name)?,
    };
    debug!(count = comments.len(), "read findings");

    let merge_request = MergeRequestRef {
        project,
        iid: args.merge_request,
        head_sha,
    };
    info!(
        project = %merge_request.project,
        iid = merge_request.iid,
        mode = %config.publish_mode,
        config = %Config::config_location(),
        "syncing merge request"
    );
    let client = GitLabClient::new(
        &config.api_base(),
        &token,
        merge_request,
        config.publish_mode,
        config.request_timeout(),
    )?;

    let commenter = DiscussionCommenter::new(Arc::new(client), args.tool_name)
        .with_max_concurrency(config.max_concurrency);
    for comment in comments {
        commenter.post(comment).await;
    }
    let summary = commenter.flush().await?;
    print_summary(&summary);
    Ok(ExitCode::SUCCESS)
}

fn detect_project(config: &Config, repo: &Path) -> Result<String> {
    let host = config
        .api_host()
        .context("Could not determine the GitLab host; pass --project")?;
    gitlab::get_remote_project(repo, &host)
}

fn print_summary(summary: &FlushSummary) {
    println!(
        "created {}, resolved {}, already posted {}, skipped {}",
        summary.created,
        summary.resolved,
        summary.duplicates,
        summary.dropped + summary.fingerprint_failures
    );
}

async fn run_ci_origin(addr: &str, refresh: bool) -> Result<ExitCode> {
    let allow_list = CiAllowList::new();
    if refresh {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;
        let count = allow_list.refresh_travis(&client).await?;
        debug!(count, "refreshed Travis CI addresses");
    }

    if allow_list.is_from_appveyor(addr) {
        println!("{addr}: appveyor");
    } else if allow_list.is_from_travis(addr) {
        println!("{addr}: travis");
    } else {
        println!("{addr}: not a known CI address");
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}

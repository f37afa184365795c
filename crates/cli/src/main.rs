use anyhow::{bail, Context as AnyhowContext, Result};
use clap::{Args, Parser, Subcommand};
use config::{FileConfig, PolicyOverrides, RequestFlags};
use nix_bisect_engine::{
    BisectRunner, BisectState, ClassifierJudge, EngineError, RunEnd, Session, StateStore, Step,
    WorktreeLock,
};
use nix_bisect_git::{GitCli, Patch, PatchError, PatchsetManager, Vcs};
use nix_bisect_nix::{
    BuildCache, BuildIdentity, BuildMode, BuildSubject, CacheEntry, Classifier, NixCli,
};
use nix_bisect_protocol::{
    serialize_json_pretty, BuildTarget, CancelToken, Revision, Verdict, EXIT_ABORT, EXIT_SKIP,
};
use report::{BuildStatusReport, ConsoleProgress, RunReport, StatusReport};
use std::path::{Path, PathBuf};
use std::sync::Arc;

mod config;
mod report;

#[derive(Parser)]
#[command(name = "nix-bisect")]
#[command(about = "Bisect nix build regressions across skip ranges", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Quiet mode: log only warnings/errors
    #[arg(long, global = true)]
    quiet: bool,

    /// Print machine-readable JSON on stdout (implies --quiet)
    #[arg(long, global = true)]
    json: bool,

    /// Config file (default: nix-bisect.toml at the repository root)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Build cache directory (overrides NIX_BISECT_CACHE_DIR)
    #[arg(long, global = true)]
    cache_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start bisecting a target between a good and a bad revision
    Start(StartArgs),

    /// Build candidates until the first bad commit is found
    Run,

    /// Mark a revision (default: the next candidate) as good
    Good(MarkArgs),

    /// Mark a revision (default: the next candidate) as bad
    Bad(MarkArgs),

    /// Mark a revision (default: the next candidate) as untestable
    Skip(SkipArgs),

    /// Show the state of the bisection
    Status,

    /// Forget the bisection in progress
    Reset,

    /// Classify HEAD for `git bisect run` (0 good, 1 bad, 125 skip, 128 abort)
    #[command(name = "build-status")]
    BuildStatus(BuildStatusArgs),

    /// Run a command with commits cherry-picked onto HEAD, then restore the tree
    Env(EnvArgs),

    /// Print the recorded build log of a revision
    Log(LogArgs),

    /// Manage the build cache
    Cache(CacheArgs),
}

#[derive(Args)]
struct StartArgs {
    /// Known good revision
    #[arg(long)]
    good: String,

    /// Known bad revision
    #[arg(long)]
    bad: String,

    /// Cherry-pick onto every candidate; candidates it does not apply to are skipped
    #[arg(long = "pick", value_name = "REV")]
    picks: Vec<String>,

    /// Cherry-pick onto every candidate it applies to
    #[arg(long = "try-pick", value_name = "REV")]
    try_picks: Vec<String>,

    #[command(flatten)]
    request: RequestFlags,

    #[command(flatten)]
    policy: PolicyOverrides,
}

#[derive(Args)]
struct MarkArgs {
    rev: Option<String>,
}

#[derive(Args)]
struct SkipArgs {
    rev: Option<String>,

    /// Group the skip with every other skip of the same name
    #[arg(long)]
    range: Option<String>,

    #[arg(long, default_value = "marked by hand")]
    reason: String,
}

#[derive(Args)]
struct BuildStatusArgs {
    #[command(flatten)]
    request: RequestFlags,

    #[command(flatten)]
    policy: PolicyOverrides,
}

#[derive(Args)]
struct EnvArgs {
    /// Cherry-pick before running; exit 125 when it does not apply
    #[arg(long = "pick", value_name = "REV")]
    picks: Vec<String>,

    /// Cherry-pick before running when it applies
    #[arg(long = "try-pick", value_name = "REV")]
    try_picks: Vec<String>,

    /// Command to run, after `--`
    #[arg(last = true, required = true)]
    command: Vec<String>,
}

#[derive(Args)]
struct LogArgs {
    rev: String,
}

#[derive(Args)]
struct CacheArgs {
    #[command(subcommand)]
    command: CacheCommands,
}

#[derive(Subcommand)]
enum CacheCommands {
    /// Delete every cached outcome and log
    Clear,
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut cli = Cli::parse();
    if cli.json {
        cli.quiet = true;
    }

    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if cli.quiet {
        builder.filter_level(log::LevelFilter::Warn);
    } else if cli.verbose {
        builder.filter_level(log::LevelFilter::Debug);
    }
    builder.target(env_logger::Target::Stderr).init();

    let app = App {
        json: cli.json,
        config: cli.config,
        cache_dir: cli.cache_dir,
    };

    let code = match cli.command {
        Commands::Start(args) => run_start(&app, args).await?,
        Commands::Run => run_bisect(&app).await?,
        Commands::Good(args) => run_mark(&app, args.rev, Verdict::Good).await?,
        Commands::Bad(args) => run_mark(&app, args.rev, Verdict::Bad).await?,
        Commands::Skip(args) => {
            let verdict = match args.range {
                Some(range) => Verdict::skip_range(range, args.reason),
                None => Verdict::skip(args.reason),
            };
            run_mark(&app, args.rev, verdict).await?
        }
        Commands::Status => run_status(&app).await?,
        Commands::Reset => run_reset().await?,
        // Under `git bisect run` an exit code of 1 would read as "bad".
        Commands::BuildStatus(args) => match run_build_status(&app, args).await {
            Ok(code) => code,
            Err(err) => {
                log::error!("{err:#}");
                EXIT_ABORT
            }
        },
        Commands::Env(args) => run_env(args).await?,
        Commands::Log(args) => run_log(&app, args).await?,
        Commands::Cache(args) => match args.command {
            CacheCommands::Clear => run_cache_clear(&app).await?,
        },
    };

    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

struct App {
    json: bool,
    config: Option<PathBuf>,
    cache_dir: Option<PathBuf>,
}

impl App {
    fn config(&self, root: &Path) -> Result<FileConfig> {
        FileConfig::load(self.config.as_deref(), root)
    }

    fn cache(&self, config: &FileConfig) -> Result<BuildCache> {
        Ok(BuildCache::new(config.cache_dir(self.cache_dir.as_deref())?))
    }

    fn classifier(&self, repo: &Repo, config: &FileConfig) -> Result<Classifier> {
        let tool = NixCli::new(repo.git.workdir()).context("failed to set up nix")?;
        Ok(Classifier::new(Arc::new(tool)).with_cache(self.cache(config)?))
    }

    fn print_status(&self, state: &BisectState) -> Result<()> {
        if self.json {
            let step = state.next_step();
            let next = match &step {
                Step::Test(rev) => Some(rev),
                _ => None,
            };
            println!("{}", serialize_json_pretty(&StatusReport::new(state, next))?);
        } else {
            println!("{}", report::render_status(state));
        }
        Ok(())
    }
}

/// The repository in the current directory.
struct Repo {
    git: Arc<GitCli>,
}

impl Repo {
    async fn open() -> Result<Self> {
        let cwd = std::env::current_dir().context("no current directory")?;
        let git = GitCli::open(&cwd)
            .await
            .context("not inside a git repository")?;
        Ok(Self { git: Arc::new(git) })
    }

    fn state_dir(&self) -> PathBuf {
        self.git.state_dir()
    }

    async fn lock(&self) -> Result<WorktreeLock> {
        Ok(WorktreeLock::acquire(&self.state_dir()).await?)
    }

    async fn resolve(&self, rev: &str) -> Result<Revision> {
        self.git
            .rev_parse(rev)
            .await
            .with_context(|| format!("cannot resolve {rev}"))
    }

    async fn active(&self) -> Result<StateStore> {
        Ok(StateStore::active(&self.state_dir())
            .await?
            .ok_or(EngineError::NoSession)?)
    }

    async fn load(&self) -> Result<(StateStore, BisectState)> {
        let store = self.active().await?;
        let state = store.load().await?.ok_or(EngineError::NoSession)?;
        Ok((store, state))
    }
}

/// Cancelled on the first Ctrl-C. Installing the handler also keeps the
/// signal from killing the process before the tree is restored.
fn interrupt_token() -> CancelToken {
    let cancel = CancelToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("interrupted, stopping after the current step");
            token.cancel();
        }
    });
    cancel
}

async fn run_start(app: &App, args: StartArgs) -> Result<i32> {
    let repo = Repo::open().await?;
    let config = app.config(repo.git.workdir())?;
    let request = config.request(&args.request)?;
    let policy = config.policy(&args.policy);
    let _lock = repo.lock().await?;

    let good = repo.resolve(&args.good).await?;
    let bad = repo.resolve(&args.bad).await?;
    if good == bad || !repo.git.is_ancestor(&good, &bad).await? {
        bail!(
            "good revision {} is not a proper ancestor of bad revision {}",
            good.short(),
            bad.short()
        );
    }
    let history = repo.git.ancestry_path(&good, &bad).await?;
    log::info!(
        "bisecting {} over {} revisions",
        request.target.attr,
        history.len()
    );

    let key = request.target.key();
    let store = StateStore::new(&repo.state_dir(), &key);
    store.reset().await?;
    let patches = store.patches();
    for rev in &args.picks {
        patches
            .add(Patch::new(repo.resolve(rev).await?).mandatory())
            .await?;
    }
    for rev in &args.try_picks {
        patches.add(Patch::new(repo.resolve(rev).await?)).await?;
    }

    let state = BisectState::new(key, history)?;
    store.save_session(&Session { request, policy }).await?;
    store.save(&state).await?;
    store.mark_active().await?;
    app.print_status(&state)?;
    Ok(0)
}

async fn run_bisect(app: &App) -> Result<i32> {
    let repo = Repo::open().await?;
    let _lock = repo.lock().await?;
    let (store, mut state) = repo.load().await?;
    let session = store
        .load_session()
        .await?
        .ok_or(EngineError::NoSession)?;
    let config = app.config(repo.git.workdir())?;

    let judge = ClassifierJudge::new(
        app.classifier(&repo, &config)?,
        session.request,
        session.policy,
    );
    let runner = BisectRunner::new(
        PatchsetManager::new(repo.git.clone()),
        Arc::new(judge),
        store,
    )
    .with_progress(Arc::new(ConsoleProgress { quiet: app.json }));

    let cancel = interrupt_token();
    let summary = runner.run(&mut state, &cancel).await?;
    if app.json {
        println!("{}", serialize_json_pretty(&RunReport::new(&summary))?);
    } else {
        println!("{}", report::render_end(&summary.end));
    }
    Ok(match summary.end {
        RunEnd::Concluded(_) => 0,
        RunEnd::Aborted { .. } => EXIT_ABORT,
    })
}

async fn run_mark(app: &App, rev: Option<String>, verdict: Verdict) -> Result<i32> {
    let repo = Repo::open().await?;
    let _lock = repo.lock().await?;
    let (store, mut state) = repo.load().await?;
    let rev = match rev {
        Some(rev) => repo.resolve(&rev).await?,
        None => match state.next_step() {
            Step::Test(rev) => rev,
            _ => bail!("there is no candidate to mark; name a revision"),
        },
    };
    if !app.json {
        println!("{}: {}", rev.short(), report::verdict_banner(&verdict));
    }
    state.record(&rev, &verdict)?;
    store.save(&state).await?;
    app.print_status(&state)?;
    Ok(0)
}

async fn run_status(app: &App) -> Result<i32> {
    let repo = Repo::open().await?;
    let (_, state) = repo.load().await?;
    app.print_status(&state)?;
    Ok(0)
}

async fn run_reset() -> Result<i32> {
    let repo = Repo::open().await?;
    let _lock = repo.lock().await?;
    match StateStore::active(&repo.state_dir()).await? {
        Some(store) => {
            store.reset().await?;
            println!("bisection reset");
        }
        None => log::info!("no bisection in progress"),
    }
    Ok(0)
}

async fn run_build_status(app: &App, args: BuildStatusArgs) -> Result<i32> {
    let repo = Repo::open().await?;
    let config = app.config(repo.git.workdir())?;
    let request = config.request(&args.request)?;
    let policy = config.policy(&args.policy);

    let head = repo.git.head().await?;
    let mut subject = BuildSubject::new(head.clone(), Vec::new());
    if repo.git.is_dirty().await? {
        log::info!("the working tree has local changes, not using the build cache");
        subject = subject.uncached();
    }
    let classifier = app.classifier(&repo, &config)?;
    let cancel = interrupt_token();
    let classification = classifier.classify(&subject, &request, &cancel).await?;
    let verdict = policy.verdict(&classification.outcome);

    if app.json {
        let report = BuildStatusReport {
            revision: &head,
            outcome: &classification.outcome,
            verdict: &verdict,
            cached: classification.cached,
            exit_code: verdict.exit_code(),
        };
        println!("{}", serialize_json_pretty(&report)?);
    } else {
        println!("{}", classification.outcome.describe());
        println!("{}", report::verdict_banner(&verdict));
    }
    Ok(verdict.exit_code())
}

async fn run_env(args: EnvArgs) -> Result<i32> {
    let repo = Repo::open().await?;
    let _lock = repo.lock().await?;
    let head = repo.git.head().await?;
    let mut patches = Vec::with_capacity(args.picks.len() + args.try_picks.len());
    for rev in &args.picks {
        patches.push(Patch::new(repo.resolve(rev).await?).mandatory());
    }
    for rev in &args.try_picks {
        patches.push(Patch::new(repo.resolve(rev).await?));
    }
    let Some((program, rest)) = args.command.split_first() else {
        bail!("no command given");
    };

    let _interrupt = interrupt_token();
    let manager = PatchsetManager::new(repo.git.clone());
    let result = manager
        .with_patches(&head, &patches, |applied| async move {
            for patch in applied.failed() {
                log::warn!("{} does not apply, running without it", patch.rev.short());
            }
            tokio::process::Command::new(program)
                .args(rest)
                .status()
                .await
        })
        .await;
    match result {
        Ok(Ok(status)) => Ok(status.code().unwrap_or(EXIT_ABORT)),
        Ok(Err(err)) => Err(err).with_context(|| format!("failed to run {program}")),
        Err(PatchError::MandatoryPatch { rev, reason }) => {
            log::error!("{} does not apply: {reason}", rev.short());
            Ok(EXIT_SKIP)
        }
        Err(err) => Err(err.into()),
    }
}

async fn run_log(app: &App, args: LogArgs) -> Result<i32> {
    let repo = Repo::open().await?;
    let config = app.config(repo.git.workdir())?;
    let cache = app.cache(&config)?;
    let rev = repo.resolve(&args.rev).await?;

    let mut entries = cache.entries_for(&rev).await?;
    if let Some(target) = active_target(&repo).await {
        // Stable sort: the active target first, newest first within.
        entries.sort_by_key(|entry| !built_for(entry, &target));
    }
    for entry in &entries {
        let Some(log) = cache.read_log(&entry.identity).await? else {
            continue;
        };
        if app.json {
            let value = serde_json::json!({
                "revision": entry.revision,
                "identity": entry.identity,
                "outcome": entry.outcome,
                "log": log,
            });
            println!("{}", serialize_json_pretty(&value)?);
        } else {
            print!("{log}");
        }
        return Ok(0);
    }
    match entries.first() {
        Some(entry) => bail!(
            "{} was classified ({}) but no log was kept",
            rev.short(),
            entry.outcome.describe()
        ),
        None => bail!("no recorded build of {}", rev.short()),
    }
}

async fn active_target(repo: &Repo) -> Option<BuildTarget> {
    let store = StateStore::active(&repo.state_dir()).await.ok()??;
    let session = store.load_session().await.ok()??;
    Some(session.request.target)
}

fn built_for(entry: &CacheEntry, target: &BuildTarget) -> bool {
    [BuildMode::Normal, BuildMode::Recheck].into_iter().any(|mode| {
        BuildIdentity::compute(&entry.revision, &entry.patches, target, mode) == entry.identity
    })
}

async fn run_cache_clear(app: &App) -> Result<i32> {
    let cwd = std::env::current_dir().context("no current directory")?;
    let cache = app.cache(&app.config(&cwd)?)?;
    cache.clear().await?;
    println!("cleared {}", cache.dir().display());
    Ok(0)
}

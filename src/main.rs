//! treepub CLI - compose and publish an ostree repository

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{ArgAction, Args, Parser, Subcommand};
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use treepub::{
    install_signal_handlers, preflight, recover, BuildEnvironment, Cancellation, Config, Error,
    LabelEnforcer, LabelMode, Pipeline, ProcessRunner, PublishLock, Repository,
};

#[derive(Parser)]
#[command(name = "treepub")]
#[command(about = "compose an ostree commit and publish the repository for serving")]
#[command(version)]
struct Cli {
    /// config file
    #[arg(short, long, default_value = "treepub.toml", env = "TREEPUB_CONFIG")]
    config: PathBuf,

    /// more output (-v debug, -vv trace); RUST_LOG takes precedence
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(flatten)]
    overrides: Overrides,

    #[command(subcommand)]
    command: Commands,
}

/// per-run overrides of config keys
#[derive(Args)]
struct Overrides {
    /// repository name
    #[arg(long, global = true)]
    name: Option<String>,

    /// tree definition file
    #[arg(long, global = true)]
    tree: Option<PathBuf>,

    /// lockfile overlay, empty to turn it off
    #[arg(long, global = true)]
    lockfile: Option<PathBuf>,

    /// ref whose history drives pruning
    #[arg(long = "ref", global = true)]
    ref_name: Option<String>,

    /// directory the repository is served from
    #[arg(long, global = true)]
    srv_root: Option<PathBuf>,

    /// staging and cache directory
    #[arg(long, global = true)]
    work_dir: Option<PathBuf>,

    /// keep this many newest commits
    #[arg(long, global = true)]
    retain: Option<usize>,

    /// per-command timeout in seconds
    #[arg(long, global = true)]
    timeout: Option<u64>,

    /// security labels: auto, enabled or disabled
    #[arg(long, global = true)]
    label: Option<LabelMode>,

    /// start from an empty staging repository
    #[arg(long, global = true)]
    no_seed: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// compose the tree and publish it
    Build,

    /// run preflight checks only
    Check,

    /// restore the previous tree if the served path is missing
    Recover,

    /// show commit history of the published repository
    Log,

    /// write the effective configuration
    InitConfig {
        /// where to write it
        path: PathBuf,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    init_tracing(cli.json_logs, level);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            report_error(&e);
            ExitCode::from(e.exit_code())
        }
    }
}

fn init_tracing(json: bool, level: Level) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(false).json())
            .try_init()
            .ok();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(false))
            .try_init()
            .ok();
    }
}

fn report_error(e: &Error) {
    tracing::error!(kind = ?e.kind(), "{}", e);

    if let Error::CommandFailed { stdout, stderr, .. } = e {
        if !stdout.trim().is_empty() {
            tracing::error!("stdout:\n{}", stdout.trim_end());
        }
        if !stderr.trim().is_empty() {
            tracing::error!("stderr:\n{}", stderr.trim_end());
        }
    }

    if let Error::PublishFailed {
        backup: Some(backup),
        ..
    } = e
    {
        tracing::error!(
            backup = %backup.display(),
            "previous tree left behind; `treepub recover` restores it if the publish path is missing"
        );
    }
}

fn run(cli: Cli) -> treepub::Result<()> {
    let mut config = Config::load_or_default(&cli.config)?;
    apply_overrides(&mut config, cli.overrides);

    if let Commands::InitConfig { path } = &cli.command {
        config.save(path)?;
        println!("wrote configuration to {}", path.display());
        return Ok(());
    }

    let base_dir = std::env::current_dir().map_err(|source| Error::Io {
        path: PathBuf::from("."),
        source,
    })?;
    let owner = std::env::var("SUDO_USER").ok();
    let env = BuildEnvironment::resolve(&config, &base_dir, owner)?;

    match cli.command {
        Commands::Build => {
            install_signal_handlers()?;
            let cancel = Cancellation::from_signals();
            let runner = ProcessRunner::new(cancel.clone());

            let report = Pipeline::new(&env, &runner, cancel).run()?;
            let last = report.states.last().copied().unwrap_or(treepub::State::Done);
            if report.is_noop() {
                println!("{}: no changes, {} left as is", last, env.publish_path.display());
            } else {
                println!("{}: published {}", last, env.publish_path.display());
            }
        }

        Commands::Check => {
            let labels = LabelEnforcer::from_env(&env);
            preflight::run(&env, labels.is_enabled())?;
            println!("ok");
        }

        Commands::Recover => {
            let _lock = PublishLock::acquire(&env.lock_path())?;
            if recover(&env.publish_path)? {
                println!("restored {}", env.publish_path.display());
            } else {
                println!("nothing to recover");
            }
        }

        Commands::Log => {
            let ref_name = env
                .ref_name
                .as_deref()
                .ok_or_else(|| Error::InvalidConfig("no ref configured".to_string()))?;
            let runner = ProcessRunner::new(Cancellation::new());
            let repo = Repository::from_env(&env, &env.publish_path);

            for record in repo.log(&runner, ref_name)? {
                println!("{}  {}", record.id, record.date);
            }
        }

        Commands::InitConfig { .. } => {}
    }

    Ok(())
}

fn apply_overrides(config: &mut Config, o: Overrides) {
    if let Some(name) = o.name {
        config.name = name;
    }
    if let Some(tree) = o.tree {
        config.tree_file = Some(tree);
    }
    if let Some(lockfile) = o.lockfile {
        config.lockfile = Some(lockfile);
    }
    if let Some(ref_name) = o.ref_name {
        config.ref_name = Some(ref_name);
    }
    if let Some(srv_root) = o.srv_root {
        config.srv_root = srv_root;
    }
    if let Some(work_dir) = o.work_dir {
        config.work_dir = work_dir;
    }
    if let Some(retain) = o.retain {
        config.retain_commits = Some(retain);
    }
    if let Some(timeout) = o.timeout {
        config.command_timeout_secs = Some(timeout);
    }
    if let Some(mode) = o.label {
        config.label.mode = mode;
    }
    if o.no_seed {
        config.seed_from_published = false;
    }
}

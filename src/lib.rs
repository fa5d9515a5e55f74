//! treepub - compose and publish an ostree repository
//!
//! builds an ostree commit from a tree definition with rpm-ostree, then swaps
//! the resulting archive repository into a web-served directory without ever
//! exposing a missing or half-written tree.
//!
//! # Pipeline
//!
//! ```text
//! PREFLIGHT -> STAGE_SETUP -> REPO_INIT -> COMPOSE -> SUMMARIZE -> PRUNE
//!           -> PUBLISH -> LABEL -> CLEANUP -> DONE
//! ```
//!
//! a compose that reports no changes short-circuits to CLEANUP. every step is
//! an external command run through [`CommandRunner`] with a discrete argument
//! vector, an optional timeout, and cooperative cancellation.
//!
//! # Publish layout
//!
//! ```text
//! <srv_root>/<name>             served repository
//! <srv_root>/<name>.old         previous tree, while it is being removed
//! <srv_root>/.<name>.incoming   new tree waiting to be swapped in
//! <srv_root>/.<name>.lock       advisory lock held for the whole run
//! ```
//!
//! # Example usage
//!
//! ```no_run
//! use std::path::Path;
//! use treepub::{BuildEnvironment, Cancellation, Config, Pipeline, ProcessRunner};
//!
//! let config = Config::load_or_default(Path::new("treepub.toml")).unwrap();
//! let env = BuildEnvironment::resolve(&config, Path::new("."), None).unwrap();
//!
//! let cancel = Cancellation::from_signals();
//! let runner = ProcessRunner::new(cancel.clone());
//! let report = Pipeline::new(&env, &runner, cancel).run().unwrap();
//! println!("{:?}", report.outcome);
//! ```

mod config;
mod env;
mod error;

pub mod cancel;
pub mod cleanup;
pub mod fs;
pub mod label;
pub mod lock;
pub mod pipeline;
pub mod preflight;
pub mod process;
pub mod prune;
pub mod publish;
pub mod repo;

pub use cancel::{install_signal_handlers, Cancellation, CriticalSection};
pub use config::{CleanupConfig, Config, LabelConfig, Tools};
pub use env::BuildEnvironment;
pub use error::{Error, ErrorKind, Result};
pub use label::{LabelEnforcer, LabelMode};
pub use lock::PublishLock;
pub use pipeline::{Pipeline, RunReport, State};
pub use process::{Cmd, CommandRunner, Output, OutputMode, ProcessRunner};
pub use prune::{CommitRecord, PruneOutcome, PrunePolicy, SkipReason};
pub use publish::{recover, PublishOutcome, PublishTransaction};
pub use repo::{BuildOutcome, RepoMode, Repository};

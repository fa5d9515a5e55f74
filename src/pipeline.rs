//! the compose-and-publish state machine
//!
//! ```text
//! PREFLIGHT -> STAGE_SETUP -> REPO_INIT -> COMPOSE -+-> UNCHANGED_EXIT ------------------------+
//!                                                   |                                         |
//!                                                   +-> SUMMARIZE -> PRUNE -> PUBLISH -> LABEL -+-> CLEANUP -> DONE
//! ```
//!
//! any state may fall through to FAILED. states are strictly sequential and
//! each one checks for cancellation on entry. once the publish lock is held,
//! CLEANUP runs whatever the verdict.

use std::fmt;
use std::fs;

use uuid::Uuid;

use crate::cancel::Cancellation;
use crate::cleanup;
use crate::env::BuildEnvironment;
use crate::error::{Error, IoResultExt, Result};
use crate::fs::{copy_tree, CopyOptions};
use crate::label::LabelEnforcer;
use crate::lock::PublishLock;
use crate::preflight;
use crate::process::CommandRunner;
use crate::prune::{PruneOutcome, PrunePolicy, SkipReason};
use crate::publish::{self, PublishOutcome, PublishTransaction};
use crate::repo::{BuildOutcome, Repository};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    Preflight,
    StageSetup,
    RepoInit,
    Compose,
    UnchangedExit,
    Summarize,
    Prune,
    Publish,
    Label,
    Cleanup,
    Done,
    Failed,
}

impl State {
    pub fn as_str(&self) -> &'static str {
        match self {
            State::Preflight => "PREFLIGHT",
            State::StageSetup => "STAGE_SETUP",
            State::RepoInit => "REPO_INIT",
            State::Compose => "COMPOSE",
            State::UnchangedExit => "UNCHANGED_EXIT",
            State::Summarize => "SUMMARIZE",
            State::Prune => "PRUNE",
            State::Publish => "PUBLISH",
            State::Label => "LABEL",
            State::Cleanup => "CLEANUP",
            State::Done => "DONE",
            State::Failed => "FAILED",
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// summary of a successful run
#[derive(Clone, Debug)]
pub struct RunReport {
    pub run_id: Uuid,
    pub outcome: BuildOutcome,
    pub prune: Option<PruneOutcome>,
    pub publish: Option<PublishOutcome>,
    pub labeled: bool,
    pub states: Vec<State>,
}

impl RunReport {
    /// true when nothing new was published
    pub fn is_noop(&self) -> bool {
        self.outcome == BuildOutcome::Unchanged
    }
}

/// what the build steps produced, filled in as they complete
#[derive(Default)]
struct Progress {
    outcome: Option<BuildOutcome>,
    prune: Option<PruneOutcome>,
    publish: Option<PublishOutcome>,
    labeled: bool,
}

/// drives one build of one repository
pub struct Pipeline<'a> {
    env: &'a BuildEnvironment,
    runner: &'a dyn CommandRunner,
    cancel: Cancellation,
    labels: LabelEnforcer,
    states: Vec<State>,
    #[cfg(test)]
    publish_fault: Option<publish::Fault>,
}

impl<'a> Pipeline<'a> {
    pub fn new(env: &'a BuildEnvironment, runner: &'a dyn CommandRunner, cancel: Cancellation) -> Self {
        Self {
            env,
            runner,
            cancel,
            labels: LabelEnforcer::from_env(env),
            states: Vec::new(),
            #[cfg(test)]
            publish_fault: None,
        }
    }

    pub fn with_labels(mut self, labels: LabelEnforcer) -> Self {
        self.labels = labels;
        self
    }

    #[cfg(test)]
    fn with_publish_fault(mut self, fault: publish::Fault) -> Self {
        self.publish_fault = Some(fault);
        self
    }

    /// states entered so far, in order
    pub fn states(&self) -> &[State] {
        &self.states
    }

    /// run every state to completion
    pub fn run(&mut self) -> Result<RunReport> {
        let run_id = Uuid::new_v4();
        let span = tracing::info_span!("run", %run_id, repo = %self.env.name);
        let _enter = span.enter();

        if let Err(e) = self.enter(State::Preflight).and_then(|()| {
            preflight::run(self.env, self.labels.is_enabled())
        }) {
            return Err(self.fail(e));
        }

        let mut progress = Progress::default();
        let mut lock = None;
        let result = self.build(&mut progress, &mut lock);
        let reached = self.states.last().copied();

        // a run that never got the lock must not sweep another run's files
        if lock.is_some() {
            self.record(State::Cleanup);
            self.cleanup();
        }
        drop(lock);

        if let Err(e) = result {
            return Err(self.fail_in(reached, e));
        }

        self.record(State::Done);
        let outcome = progress.outcome.unwrap_or(BuildOutcome::Changed);
        tracing::info!(outcome = ?outcome, "run complete");

        Ok(RunReport {
            run_id,
            outcome,
            prune: progress.prune,
            publish: progress.publish,
            labeled: progress.labeled,
            states: self.states.clone(),
        })
    }

    fn build(&mut self, progress: &mut Progress, lock: &mut Option<PublishLock>) -> Result<()> {
        let env = self.env;

        self.enter(State::StageSetup)?;
        *lock = Some(PublishLock::acquire(&env.lock_path())?);
        publish::recover(&env.publish_path)?;
        self.stage_setup()?;

        self.enter(State::RepoInit)?;
        let repo = Repository::from_env(env, &env.staging_repo);
        repo.ensure_initialized(self.runner)?;

        self.enter(State::Compose)?;
        let outcome = repo.compose(
            self.runner,
            &env.tree_file,
            env.lockfile.as_deref(),
            &env.cache_dir,
        )?;
        progress.outcome = Some(outcome);

        if outcome == BuildOutcome::Unchanged {
            self.enter(State::UnchangedExit)?;
            tracing::info!("no changes since the previous commit, nothing to publish");
            return Ok(());
        }

        self.enter(State::Summarize)?;
        repo.generate_summary(self.runner)?;

        self.enter(State::Prune)?;
        progress.prune = Some(self.prune(&repo)?);

        self.enter(State::Publish)?;
        progress.publish = Some(self.publish()?);

        self.enter(State::Label)?;
        progress.labeled = self.labels.apply(self.runner, &env.publish_path, &env.cache_dir)?;

        Ok(())
    }

    /// wipe staging and cache, then seed staging from the published tree
    fn stage_setup(&self) -> Result<()> {
        let env = self.env;

        for dir in [&env.staging_repo, &env.cache_dir] {
            if dir.symlink_metadata().is_ok() {
                tracing::debug!(path = %dir.display(), "removing previous staging content");
                fs::remove_dir_all(dir).with_path(dir.as_path())?;
            }
        }
        fs::create_dir_all(&env.cache_dir).with_path(&env.cache_dir)?;

        if env.seed_from_published && env.publish_path.is_dir() {
            let options = CopyOptions {
                hardlink_under: Some("objects".into()),
            };
            let stats = copy_tree(&env.publish_path, &env.staging_repo, &options)?;
            tracing::info!(
                from = %env.publish_path.display(),
                hardlinked = stats.hardlinked,
                copied = stats.copied,
                "seeded staging repository"
            );
        }

        Ok(())
    }

    fn prune(&self, repo: &Repository) -> Result<PruneOutcome> {
        let Some(retain) = self.env.retain_commits else {
            return Ok(PruneOutcome::Skipped(SkipReason::Disabled));
        };
        let Some(ref_name) = self.env.ref_name.as_deref() else {
            tracing::info!("no ref configured, skipping prune");
            return Ok(PruneOutcome::Skipped(SkipReason::NoRef));
        };

        PrunePolicy::new(retain).apply(self.runner, repo, ref_name)
    }

    fn publish(&self) -> Result<PublishOutcome> {
        let labels = &self.labels;
        let runner = self.runner;

        let mut tx = PublishTransaction::new(&self.env.staging_repo, &self.env.publish_path);
        if labels.is_enabled() {
            tx = tx.with_relabel(move |incoming| labels.label_content(runner, incoming));
        }

        #[cfg(test)]
        if let Some(fault) = self.publish_fault {
            tx = tx.with_fault(fault);
        }

        tx.commit()
    }

    fn cleanup(&self) {
        let report = cleanup::sweep_tmp(&self.env.tmp_globs);
        for failure in &report.failures {
            tracing::warn!(error = %failure, "cleanup failed");
        }
        if !report.removed.is_empty() {
            tracing::info!(count = report.removed.len(), "removed temporary directories");
        }

        if let Some(owner) = &self.env.owner {
            if self.env.work_dir.exists() {
                if let Err(e) = cleanup::restore_owner(&self.env.work_dir, owner) {
                    tracing::warn!(error = %e, "could not restore ownership of work directory");
                }
            }
        }
    }

    fn enter(&mut self, state: State) -> Result<()> {
        self.cancel.check()?;
        self.record(state);
        Ok(())
    }

    fn record(&mut self, state: State) {
        tracing::info!(state = %state, "entering state");
        self.states.push(state);
    }

    fn fail(&mut self, err: Error) -> Error {
        let reached = self.states.last().copied();
        self.fail_in(reached, err)
    }

    fn fail_in(&mut self, reached: Option<State>, err: Error) -> Error {
        self.states.push(State::Failed);
        match reached {
            Some(state) => tracing::error!(%state, error = %err, "run failed"),
            None => tracing::error!(error = %err, "run failed before starting"),
        }
        err
    }
}

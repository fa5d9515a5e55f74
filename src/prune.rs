//! count-based retention expressed as an age cutoff
//!
//! ostree only prunes by age, so the cutoff is the date of the commit just
//! past the retention window.

use chrono::{DateTime, FixedOffset};

use crate::error::Result;
use crate::process::CommandRunner;
use crate::repo::Repository;

/// date format of `ostree log`, also accepted by `--keep-younger-than`
pub const LOG_DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S %z";

/// one entry of `ostree log` output
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommitRecord {
    pub id: String,
    /// date as printed by ostree
    pub date: String,
}

impl CommitRecord {
    pub fn timestamp(&self) -> Option<DateTime<FixedOffset>> {
        DateTime::parse_from_str(self.date.trim(), LOG_DATE_FORMAT).ok()
    }
}

/// parse `ostree log` output into records, newest first
pub fn parse_log(output: &str) -> Vec<CommitRecord> {
    let mut records: Vec<CommitRecord> = Vec::new();

    for line in output.lines() {
        if let Some(id) = line.strip_prefix("commit ") {
            records.push(CommitRecord {
                id: id.trim().to_string(),
                date: String::new(),
            });
        } else if let Some(date) = line.strip_prefix("Date:") {
            // only the header of the current commit, never message bodies
            if let Some(last) = records.last_mut() {
                if last.date.is_empty() {
                    last.date = date.trim().to_string();
                }
            }
        }
    }

    records
}

/// why pruning did not run
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SkipReason {
    /// no retention configured
    Disabled,
    /// no ref to read history from
    NoRef,
    HistoryTooShort { commits: usize, retain: usize },
    UnparsableDate(String),
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::Disabled => write!(f, "retention not configured"),
            SkipReason::NoRef => write!(f, "no ref configured"),
            SkipReason::HistoryTooShort { commits, retain } => {
                write!(f, "{} commits, retaining {}", commits, retain)
            }
            SkipReason::UnparsableDate(date) => write!(f, "unparsable commit date {:?}", date),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PruneOutcome {
    Pruned {
        /// value passed to --keep-younger-than
        cutoff: String,
        /// newest commit that fell outside the window
        boundary: String,
    },
    Skipped(SkipReason),
}

/// keep the newest `retain` commits of a ref
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PrunePolicy {
    retain: usize,
}

impl PrunePolicy {
    pub fn new(retain: usize) -> Self {
        Self { retain }
    }

    pub fn retain(&self) -> usize {
        self.retain
    }

    /// cutoff date, or `None` when there is nothing to prune
    pub fn compute_cutoff(&self, history: &[CommitRecord]) -> Option<DateTime<FixedOffset>> {
        self.evaluate(history).ok().map(|(_, date)| date)
    }

    fn evaluate<'h>(
        &self,
        history: &'h [CommitRecord],
    ) -> std::result::Result<(&'h CommitRecord, DateTime<FixedOffset>), SkipReason> {
        let boundary = history
            .get(self.retain)
            .ok_or(SkipReason::HistoryTooShort {
                commits: history.len(),
                retain: self.retain,
            })?;

        let date = boundary
            .timestamp()
            .ok_or_else(|| SkipReason::UnparsableDate(boundary.date.clone()))?;

        Ok((boundary, date))
    }

    /// read the history of `ref_name` and prune past the retention window
    ///
    /// a short history or an unreadable date is a skip, never an error
    pub fn apply(
        &self,
        runner: &dyn CommandRunner,
        repo: &Repository,
        ref_name: &str,
    ) -> Result<PruneOutcome> {
        let history = repo.log(runner, ref_name)?;

        let (boundary, date) = match self.evaluate(&history) {
            Ok(found) => found,
            Err(reason) => {
                tracing::info!(ref_name, %reason, "skipping prune");
                return Ok(PruneOutcome::Skipped(reason));
            }
        };

        let cutoff = date.format(LOG_DATE_FORMAT).to_string();
        tracing::info!(ref_name, %cutoff, boundary = %boundary.id, "pruning old commits");
        repo.prune(runner, &cutoff)?;

        Ok(PruneOutcome::Pruned {
            cutoff,
            boundary: boundary.id.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::tests::{ok, FakeRunner};
    use crate::repo::RepoMode;
    use std::path::Path;

    const LOG: &str = "\
commit 3c3f1a
ContentChecksum:  9d1e
Date:  2024-03-03 12:00:00 +0000
Version: 39.20240303.0
(no subject)

commit 2b2e0f
ContentChecksum:  8c0d
Date:  2024-03-02 12:00:00 +0000
Version: 39.20240302.0
(no subject)

commit 1a1d9e
ContentChecksum:  7b9c
Date:  2024-03-01 12:00:00 +0000
Version: 39.20240301.0
(no subject)

";

    fn history(n: usize) -> Vec<CommitRecord> {
        (0..n)
            .map(|i| CommitRecord {
                id: format!("c{i}"),
                date: format!("2024-03-{:02} 12:00:00 +0000", 28 - i),
            })
            .collect()
    }

    #[test]
    fn test_parse_log() {
        let records = parse_log(LOG);
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].id, "3c3f1a");
        assert_eq!(records[0].date, "2024-03-03 12:00:00 +0000");
        assert_eq!(records[2].id, "1a1d9e");
        assert!(records[2].timestamp().is_some());
    }

    #[test]
    fn test_parse_log_ignores_message_body_dates() {
        let out = "commit abc\nDate:  2024-03-03 12:00:00 +0000\n\n    Date: not a header\n";
        let records = parse_log(out);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].date, "2024-03-03 12:00:00 +0000");
    }

    #[test]
    fn test_cutoff_short_history() {
        let policy = PrunePolicy::new(3);
        assert!(policy.compute_cutoff(&[]).is_none());
        assert!(policy.compute_cutoff(&history(3)).is_none());
    }

    #[test]
    fn test_cutoff_is_date_of_retain_th_commit() {
        let policy = PrunePolicy::new(3);
        let h = history(5);
        let cutoff = policy.compute_cutoff(&h).unwrap();
        assert_eq!(Some(cutoff), h[3].timestamp());
        assert_eq!(cutoff.format(LOG_DATE_FORMAT).to_string(), "2024-03-25 12:00:00 +0000");
    }

    #[test]
    fn test_cutoff_retain_zero_uses_newest() {
        let h = history(2);
        assert_eq!(PrunePolicy::new(0).compute_cutoff(&h), h[0].timestamp());
    }

    #[test]
    fn test_cutoff_unparsable_date() {
        let mut h = history(4);
        h[2].date = "yesterday-ish".into();
        assert!(PrunePolicy::new(2).compute_cutoff(&h).is_none());
    }

    #[test]
    fn test_apply_prunes() {
        let repo = Repository::new(Path::new("/r"), RepoMode::Archive);
        let runner = FakeRunner::new(|cmd| {
            if cmd.get_args()[0] == "log" {
                ok(LOG)
            } else {
                ok("")
            }
        });

        let outcome = PrunePolicy::new(1).apply(&runner, &repo, "fedora/39/x86_64/vauxite").unwrap();
        assert_eq!(
            outcome,
            PruneOutcome::Pruned {
                cutoff: "2024-03-02 12:00:00 +0000".into(),
                boundary: "2b2e0f".into(),
            }
        );

        let calls = runner.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1][1], "prune");
        assert_eq!(calls[1][3], "--keep-younger-than=2024-03-02 12:00:00 +0000");
    }

    #[test]
    fn test_apply_skips_short_history() {
        let repo = Repository::new(Path::new("/r"), RepoMode::Archive);
        let runner = FakeRunner::new(|_| ok(LOG));

        let outcome = PrunePolicy::new(10).apply(&runner, &repo, "ref").unwrap();
        assert_eq!(
            outcome,
            PruneOutcome::Skipped(SkipReason::HistoryTooShort {
                commits: 3,
                retain: 10
            })
        );
        // only the log query ran
        assert_eq!(runner.calls().len(), 1);
    }

    #[test]
    fn test_apply_skips_unparsable_date() {
        let repo = Repository::new(Path::new("/r"), RepoMode::Archive);
        let runner = FakeRunner::new(|_| ok("commit a\nDate:  soon\n\ncommit b\nDate:  later\n"));

        let outcome = PrunePolicy::new(1).apply(&runner, &repo, "ref").unwrap();
        assert!(matches!(
            outcome,
            PruneOutcome::Skipped(SkipReason::UnparsableDate(_))
        ));
        assert_eq!(runner.calls().len(), 1);
    }
}

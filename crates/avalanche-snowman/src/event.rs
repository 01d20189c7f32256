//! Dependency-blocked job scheduling.
//!
//! Work that must wait for blocks to be issued (issuing a child block,
//! applying a peer's votes) is parked here as a passive job keyed by the
//! block ids it depends on. When a dependency resolves, the table hands the
//! jobs that became runnable back to the caller; the engine drains them
//! through an iterative work queue. There are no callbacks and no tasks.

use std::collections::HashMap;

use avalanche_ids::Id;
use avalanche_utils::Set;

/// A job whose dependencies have all resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ready<J> {
    /// The job payload.
    pub job: J,
    /// True if any dependency was abandoned rather than fulfilled.
    pub abandoned: bool,
}

struct Entry<J> {
    job: J,
    deps: Set<Id>,
    abandoned: bool,
}

/// A table of jobs blocked on block ids.
pub struct Blocker<J> {
    entries: HashMap<u64, Entry<J>>,
    /// Dependency id -> jobs blocked on it
    blocking: HashMap<Id, Vec<u64>>,
    next_job: u64,
}

impl<J> Default for Blocker<J> {
    fn default() -> Self {
        Self::new()
    }
}

impl<J> Blocker<J> {
    /// Creates an empty job table.
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            blocking: HashMap::new(),
            next_job: 0,
        }
    }

    /// Registers a job blocked on `deps`.
    ///
    /// If `deps` is empty the job is runnable right away and returned to the
    /// caller instead of being stored.
    #[must_use]
    pub fn register(&mut self, job: J, deps: Set<Id>) -> Option<Ready<J>> {
        if deps.is_empty() {
            return Some(Ready {
                job,
                abandoned: false,
            });
        }

        let job_id = self.next_job;
        self.next_job += 1;
        for dep in deps.iter() {
            self.blocking.entry(*dep).or_default().push(job_id);
        }
        self.entries.insert(
            job_id,
            Entry {
                job,
                deps,
                abandoned: false,
            },
        );
        None
    }

    /// Marks `id` as issued. Returns the jobs that became runnable.
    #[must_use]
    pub fn fulfill(&mut self, id: &Id) -> Vec<Ready<J>> {
        self.resolve(id, false)
    }

    /// Marks `id` as never going to be issued. Returns the jobs that became
    /// runnable, flagged as abandoned.
    #[must_use]
    pub fn abandon(&mut self, id: &Id) -> Vec<Ready<J>> {
        self.resolve(id, true)
    }

    fn resolve(&mut self, id: &Id, abandoned: bool) -> Vec<Ready<J>> {
        let Some(job_ids) = self.blocking.remove(id) else {
            return Vec::new();
        };

        let mut ready = Vec::new();
        for job_id in job_ids {
            let Some(entry) = self.entries.get_mut(&job_id) else {
                continue;
            };
            entry.deps.remove(id);
            entry.abandoned |= abandoned;
            if entry.deps.is_empty() {
                let entry = self.entries.remove(&job_id).expect("entry is resident");
                ready.push(Ready {
                    job: entry.job,
                    abandoned: entry.abandoned,
                });
            }
        }
        ready
    }

    /// Returns the number of distinct block ids jobs are blocked on.
    pub fn len(&self) -> usize {
        self.blocking.len()
    }

    /// Returns true if no jobs are blocked.
    pub fn is_empty(&self) -> bool {
        self.blocking.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_id(byte: u8) -> Id {
        Id::from_bytes([byte; 32])
    }

    #[test]
    fn test_register_unblocked_runs_immediately() {
        let mut blocker: Blocker<&str> = Blocker::new();
        let ready = blocker.register("job", Set::new());
        assert_eq!(
            ready,
            Some(Ready {
                job: "job",
                abandoned: false
            })
        );
        assert!(blocker.is_empty());
    }

    #[test]
    fn test_fulfill_releases_job() {
        let mut blocker = Blocker::new();
        assert!(blocker
            .register("job", Set::of([make_id(1)]))
            .is_none());
        assert_eq!(blocker.len(), 1);

        let ready = blocker.fulfill(&make_id(1));
        assert_eq!(
            ready,
            vec![Ready {
                job: "job",
                abandoned: false
            }]
        );
        assert!(blocker.is_empty());
    }

    #[test]
    fn test_waits_for_all_deps() {
        let mut blocker = Blocker::new();
        assert!(blocker
            .register("job", Set::of([make_id(1), make_id(2)]))
            .is_none());

        assert!(blocker.fulfill(&make_id(1)).is_empty());
        let ready = blocker.fulfill(&make_id(2));
        assert_eq!(ready.len(), 1);
        assert!(!ready[0].abandoned);
        assert!(blocker.is_empty());
    }

    #[test]
    fn test_abandon_flag_sticks() {
        let mut blocker = Blocker::new();
        assert!(blocker
            .register("job", Set::of([make_id(1), make_id(2)]))
            .is_none());

        assert!(blocker.abandon(&make_id(1)).is_empty());
        let ready = blocker.fulfill(&make_id(2));
        assert_eq!(ready.len(), 1);
        assert!(ready[0].abandoned, "one abandoned dep taints the job");
    }

    #[test]
    fn test_multiple_jobs_per_dep() {
        let mut blocker = Blocker::new();
        assert!(blocker.register("a", Set::of([make_id(1)])).is_none());
        assert!(blocker.register("b", Set::of([make_id(1)])).is_none());

        let ready = blocker.fulfill(&make_id(1));
        let mut jobs: Vec<_> = ready.into_iter().map(|r| r.job).collect();
        jobs.sort_unstable();
        assert_eq!(jobs, vec!["a", "b"]);
    }

    #[test]
    fn test_unknown_dep_is_noop() {
        let mut blocker: Blocker<&str> = Blocker::new();
        assert!(blocker.fulfill(&make_id(1)).is_empty());
        assert!(blocker.abandon(&make_id(1)).is_empty());
    }
}

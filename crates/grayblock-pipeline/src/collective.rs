//! Collective operations for a fixed group of workers.
//!
//! A [`Rendezvous`] is shared by every worker of a run. Each worker
//! joins once, checks in when the whole group has been started, and then
//! takes part in broadcasts and phase barriers through its
//! [`Participant`] handle.
//!
//! Every checked-in worker attends every phase barrier. A failure is
//! recorded in a shared flag before the barrier, and after the barrier
//! every healthy worker observes it and stops too. A participant that is
//! dropped early, because its worker returned an error or panicked,
//! raises the flag and attends the barriers it has not reached yet, so
//! the rest of the group is never left waiting.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Barrier, OnceLock};
use std::thread;

use tracing::{debug, trace, warn};

use crate::arena::ROOT_RANK;
use crate::types::PipelineError;

/// Synchronization points of a run, in the order workers pass them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    /// Shared regions are allocated and attached by every worker.
    Allocated,
    /// The loader has published the decoded source.
    SourcePublished,
    /// Every worker has published its downsampled rows.
    BlocksReduced,
    /// Every worker has published its grayscale rows.
    LumaReduced,
}

impl Phase {
    /// Every phase, in order.
    pub const ALL: [Self; 4] = [
        Self::Allocated,
        Self::SourcePublished,
        Self::BlocksReduced,
        Self::LumaReduced,
    ];
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Allocated => f.write_str("allocated"),
            Self::SourcePublished => f.write_str("source-published"),
            Self::BlocksReduced => f.write_str("blocks-reduced"),
            Self::LumaReduced => f.write_str("luma-reduced"),
        }
    }
}

/// Whether the whole group made it onto its threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Roster {
    Complete,
    Cancelled,
}

/// Shared state for one group of workers.
///
/// `T` is the type of the value the root broadcasts.
#[derive(Debug)]
pub struct Rendezvous<T> {
    barrier: Barrier,
    roster: OnceLock<Roster>,
    broadcast: OnceLock<Option<T>>,
    aborted: AtomicBool,
}

impl<T> Rendezvous<T> {
    /// A rendezvous for `workers` participants.
    #[must_use]
    pub fn new(workers: usize) -> Self {
        Self {
            barrier: Barrier::new(workers),
            roster: OnceLock::new(),
            broadcast: OnceLock::new(),
            aborted: AtomicBool::new(false),
        }
    }

    /// Handle for the worker with rank `rank`.
    pub const fn join(&self, rank: usize) -> Participant<'_, T> {
        Participant {
            rendezvous: self,
            rank,
            checked_in: false,
            last_phase: None,
        }
    }

    /// Let checked-in workers proceed: every participant is running.
    pub fn start(&self) {
        let _ = self.roster.set(Roster::Complete);
    }

    /// Turn every worker away at check-in: the group could not be
    /// started in full.
    pub fn cancel(&self) {
        self.aborted.store(true, Ordering::Release);
        let _ = self.roster.set(Roster::Cancelled);
    }

    /// Returns `true` once any worker has reported a failure.
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }
}

/// One worker's handle on a [`Rendezvous`].
#[derive(Debug)]
pub struct Participant<'a, T> {
    rendezvous: &'a Rendezvous<T>,
    rank: usize,
    checked_in: bool,
    last_phase: Option<Phase>,
}

impl<'a, T> Participant<'a, T> {
    /// This worker's rank.
    #[must_use]
    pub const fn rank(&self) -> usize {
        self.rank
    }

    /// Returns `true` for the loader/writer.
    #[must_use]
    pub const fn is_root(&self) -> bool {
        self.rank == ROOT_RANK
    }

    /// Wait until the group has been started or cancelled.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::CollectiveAbort`] if the group was
    /// cancelled. A worker turned away here never attends a barrier.
    pub fn check_in(&mut self) -> Result<(), PipelineError> {
        match self.rendezvous.roster.wait() {
            Roster::Complete => {
                self.checked_in = true;
                Ok(())
            }
            Roster::Cancelled => Err(PipelineError::CollectiveAbort { rank: self.rank }),
        }
    }

    /// Root computes a value with `produce`; every worker receives a
    /// reference to it.
    ///
    /// Non-root workers block until the root has published. `produce` is
    /// only called on the root and returns `None` when there is nothing to
    /// share. If the root leaves before broadcasting, everyone receives
    /// `None`.
    pub fn broadcast(&self, produce: impl FnOnce() -> Option<T>) -> Option<&'a T> {
        let value = if self.is_root() {
            self.rendezvous.broadcast.get_or_init(produce)
        } else {
            self.rendezvous.broadcast.wait()
        };
        value.as_ref()
    }

    /// Wait until every worker reaches `phase`.
    pub fn barrier(&mut self, phase: Phase) {
        debug_assert!(self.checked_in, "worker {} never checked in", self.rank);
        debug_assert!(
            self.last_phase.is_none_or(|last| last < phase),
            "phase {phase} reached out of order"
        );
        trace!(rank = self.rank, %phase, "waiting at barrier");
        self.rendezvous.barrier.wait();
        self.last_phase = Some(phase);
    }

    /// Finish `phase` with this worker's `outcome`.
    ///
    /// A failing worker raises the shared abort flag before waiting. After
    /// the barrier, a failing worker gets its own error back and a healthy
    /// one gets [`PipelineError::CollectiveAbort`] if anyone failed.
    ///
    /// # Errors
    ///
    /// Returns this worker's error, or a collective abort.
    pub fn settle<R>(
        &mut self,
        phase: Phase,
        outcome: Result<R, PipelineError>,
    ) -> Result<R, PipelineError> {
        if let Err(err) = &outcome {
            debug!(rank = self.rank, %phase, error = %err, "worker failed");
            self.rendezvous.aborted.store(true, Ordering::Release);
        }
        self.barrier(phase);
        match outcome {
            Err(err) => Err(err),
            Ok(_) if self.rendezvous.is_aborted() => {
                Err(PipelineError::CollectiveAbort { rank: self.rank })
            }
            Ok(value) => Ok(value),
        }
    }
}

impl<T> Drop for Participant<'_, T> {
    fn drop(&mut self) {
        if !self.checked_in {
            return;
        }
        let remaining: Vec<Phase> = Phase::ALL
            .into_iter()
            .filter(|&phase| self.last_phase.is_none_or(|last| last < phase))
            .collect();
        if remaining.is_empty() {
            return;
        }

        if thread::panicking() {
            warn!(rank = self.rank, "worker panicked, releasing the remaining barriers");
        }
        self.rendezvous.aborted.store(true, Ordering::Release);
        if self.is_root() {
            self.rendezvous.broadcast.get_or_init(|| None);
        }
        for phase in remaining {
            self.barrier(phase);
        }
    }
}

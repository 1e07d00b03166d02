//! Reconciliation sweep: periodic pass over every member that repairs
//! onboarding state lost to missed events or downtime.
//!
//! Per tick:
//! 1. Drop expired selection sessions.
//! 2. Stream the member list from the platform.
//! 3. For each member (bounded parallelism, under the member's lock):
//!    - cleared the gate but never got the marker or any governed group
//!      → run the presentation step again (missed grant);
//!    - holds the marker but has no live prompt → send a fresh prompt.
//! 4. Log the counters and prune idle per-user locks.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use futures::{StreamExt, future};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::manager::Onboarding;
use super::model::MemberRecord;
use super::state::OnboardingPhase;
use crate::error::{OnboardingError, Result};

/// Counters of one sweep run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Members pulled from the listing.
    pub scanned: usize,
    /// Members whose missed marker grant was repaired.
    pub granted: usize,
    /// Members that got a fresh prompt for an expired one.
    pub represented: usize,
    /// Members whose processing failed; left for the next sweep.
    pub failed: usize,
    /// Errors reported by the member listing itself.
    pub list_errors: usize,
    /// Expired sessions dropped before scanning.
    pub sessions_expired: usize,
    /// The sweep stopped picking up members because its deadline elapsed.
    pub deadline_reached: bool,
}

/// What the sweep did for one member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SweepAction {
    Untouched,
    Granted,
    Represented,
}

enum MemberStep {
    Done(SweepAction),
    Failed,
    ListError,
}

impl SweepReport {
    fn record(&mut self, step: MemberStep) {
        match step {
            MemberStep::Done(action) => {
                self.scanned += 1;
                match action {
                    SweepAction::Granted => self.granted += 1,
                    SweepAction::Represented => self.represented += 1,
                    SweepAction::Untouched => {}
                }
            }
            MemberStep::Failed => {
                self.scanned += 1;
                self.failed += 1;
            }
            MemberStep::ListError => self.list_errors += 1,
        }
    }
}

impl Onboarding {
    /// Run one reconciliation pass over all members.
    ///
    /// Failures are contained per member. Once the configured deadline has
    /// elapsed no further members are picked up; members already in flight
    /// are finished.
    pub async fn run_sweep(&self) -> SweepReport {
        info!("Executing member check");
        let started = Instant::now();
        let deadline = self.config().sweep_deadline;
        let concurrency = self.config().sweep_concurrency.max(1);
        let deadline_hit = AtomicBool::new(false);

        let report = SweepReport {
            sessions_expired: self.sessions.expire_old().await,
            ..SweepReport::default()
        };

        let mut report = self
            .platform()
            .list_members()
            .take_while(|_| {
                let within = deadline.is_none_or(|limit| started.elapsed() < limit);
                if !within {
                    deadline_hit.store(true, Ordering::Relaxed);
                }
                future::ready(within)
            })
            .map(move |item| async move {
                match item {
                    Ok(member) => self.sweep_step(member).await,
                    Err(e) => {
                        error!(error = %e, "Member listing failed");
                        MemberStep::ListError
                    }
                }
            })
            .buffer_unordered(concurrency)
            .fold(report, |mut report, step| {
                report.record(step);
                future::ready(report)
            })
            .await;
        report.deadline_reached = deadline_hit.load(Ordering::Relaxed);

        if report.granted > 0 {
            info!(
                count = report.granted,
                "Granted the marker to members that cleared the gate but never got it"
            );
        }
        if report.represented > 0 {
            info!(count = report.represented, "Sent members a new selection prompt");
        }
        if report.deadline_reached {
            warn!(
                elapsed_ms = started.elapsed().as_millis() as u64,
                scanned = report.scanned,
                "Sweep deadline reached, remaining members left for the next run"
            );
        }
        let pruned = self.locks.prune();
        debug!(
            scanned = report.scanned,
            failed = report.failed,
            list_errors = report.list_errors,
            sessions_expired = report.sessions_expired,
            locks_pruned = pruned,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Sweep finished"
        );
        report
    }

    async fn sweep_step(&self, member: MemberRecord) -> MemberStep {
        let user_id = member.user_id.clone();
        match self.sweep_member(member).await {
            Ok(action) => MemberStep::Done(action),
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "Sweep failed for member");
                MemberStep::Failed
            }
        }
    }

    /// Decide from the listed record, then re-check against a fresh record
    /// under the member's lock before acting.
    async fn sweep_member(&self, listed: MemberRecord) -> Result<SweepAction> {
        if self.sweep_action_for(&listed).await == SweepAction::Untouched {
            return Ok(SweepAction::Untouched);
        }

        let _guard = self.locks.acquire(&listed.user_id).await;
        let record = match self.fetch(&listed.user_id).await {
            Ok(record) => record,
            Err(OnboardingError::UserNotFound(_)) => {
                debug!(user_id = %listed.user_id, "Member left during sweep");
                return Ok(SweepAction::Untouched);
            }
            Err(e) => return Err(e),
        };

        match self.sweep_action_for(&record).await {
            SweepAction::Granted => {
                self.present_locked(&record, true).await?;
                debug!(user_id = %record.user_id, "Repaired missed marker grant");
                Ok(SweepAction::Granted)
            }
            SweepAction::Represented => {
                let session_id = self.present_locked(&record, false).await?;
                info!(user_id = %record.user_id, session_id = %session_id, "Sent new interaction message");
                Ok(SweepAction::Represented)
            }
            SweepAction::Untouched => Ok(SweepAction::Untouched),
        }
    }

    async fn sweep_action_for(&self, record: &MemberRecord) -> SweepAction {
        match self.phase_of(record) {
            // A pending member has not cleared the gate yet.
            OnboardingPhase::JoinedPending if record.pending => SweepAction::Untouched,
            OnboardingPhase::JoinedPending => {
                let not_before = self.config().not_before;
                if record.joined_at.is_some_and(|joined| joined > not_before) {
                    SweepAction::Granted
                } else {
                    SweepAction::Untouched
                }
            }
            OnboardingPhase::Presented => {
                if self.sessions.latest_for(&record.user_id).await.is_none() {
                    SweepAction::Represented
                } else {
                    SweepAction::Untouched
                }
            }
            OnboardingPhase::Committed | OnboardingPhase::Aborted => SweepAction::Untouched,
        }
    }
}

/// Spawn the periodic sweep. The first run starts immediately.
///
/// Returns the task handle and a shutdown flag checked before every run.
pub fn spawn_sweep_ticker(onboarding: Arc<Onboarding>) -> (JoinHandle<()>, Arc<AtomicBool>) {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);
    let period = onboarding.config().sweep_interval;

    let handle = tokio::spawn(async move {
        info!(interval_secs = period.as_secs(), "Reconciliation sweep started");

        let mut tick = tokio::time::interval(period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tick.tick().await;

            if shutdown.load(Ordering::Relaxed) {
                info!("Reconciliation sweep shutting down");
                return;
            }

            onboarding.run_sweep().await;
        }
    });

    (handle, shutdown_flag)
}

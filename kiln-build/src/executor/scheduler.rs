//! The polling loop shared by every executor.
//!
//! Every action starts with a pending record. Each pass looks at the pending
//! ones: an action whose in-batch producers all completed is started if a
//! slot is free; one whose producer failed or was skipped is marked skipped
//! without using a slot.
//! The loop ends once every action has a finished record.

use super::execution_log;
use super::types::{ActionOutcome, ActionState, ExecutionRecord, ExecutionSummary};
use crate::action_graph::{ActionId, BuildAction};
use async_trait::async_trait;
use kiln_cache::FileIdentity;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Runs one action somewhere.
#[async_trait]
pub trait ActionRunner: Send + Sync {
    async fn run(&self, action: &BuildAction) -> ActionOutcome;
}

type Records = Arc<Mutex<BTreeMap<ActionId, ExecutionRecord>>>;

fn lock(records: &Records) -> MutexGuard<'_, BTreeMap<ActionId, ExecutionRecord>> {
    records.lock().unwrap_or_else(PoisonError::into_inner)
}

enum Readiness {
    Ready,
    Waiting,
    Blocked,
}

#[derive(Debug, Clone)]
pub struct Scheduler {
    max_concurrency: usize,
    poll_interval: Duration,
    log_detailed_stats: bool,
}

impl Scheduler {
    /// A scheduler running at most `max_concurrency` actions at once (at
    /// least one).
    #[must_use]
    pub fn new(max_concurrency: usize) -> Self {
        Self {
            max_concurrency: max_concurrency.max(1),
            poll_interval: Duration::from_millis(10),
            log_detailed_stats: false,
        }
    }

    #[must_use]
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    #[must_use]
    pub fn with_detailed_stats(mut self, enabled: bool) -> Self {
        self.log_detailed_stats = enabled;
        self
    }

    #[must_use]
    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    /// Run `actions` with `runner`.
    ///
    /// `seeded` holds records of actions that already finished elsewhere;
    /// they are not run again but their states gate their dependents.
    pub async fn run(
        &self,
        actions: &[BuildAction],
        runner: Arc<dyn ActionRunner>,
        seeded: BTreeMap<ActionId, ExecutionRecord>,
    ) -> ExecutionSummary {
        let started = Instant::now();
        let total = actions.len();

        let producers: HashMap<&FileIdentity, ActionId> = actions
            .iter()
            .flat_map(|action| action.produced.iter().map(move |item| (item, action.id())))
            .collect();

        let finished_count = seeded.values().filter(|r| r.state.is_finished()).count();
        let mut seeded = seeded;
        for action in actions {
            let _ = seeded
                .entry(action.id())
                .or_insert_with(ExecutionRecord::pending);
        }
        let records: Records = Arc::new(Mutex::new(seeded));
        let progress = Arc::new(AtomicUsize::new(finished_count));
        let mut tasks = JoinSet::new();
        let mut max_concurrency = 0;

        info!(
            "Executing {} action(s) with up to {} in parallel",
            total, self.max_concurrency
        );

        loop {
            let mut unexecuted = 0;
            let mut skipped_this_pass = false;
            let mut executing;
            {
                let mut guard = lock(&records);
                executing = guard
                    .values()
                    .filter(|r| r.state == ActionState::Running)
                    .count();

                for action in actions {
                    if !is_pending(&guard, action.id()) {
                        continue;
                    }
                    match readiness(action, &producers, &guard) {
                        Readiness::Blocked => {
                            warn!(
                                "Skipping {}: a prerequisite failed",
                                action.description()
                            );
                            let _ = guard.insert(action.id(), ExecutionRecord::skipped());
                            skipped_this_pass = true;
                            let done = progress.fetch_add(1, Ordering::SeqCst) + 1;
                            info!("[{}/{}] {} (skipped)", done, total, action.description());
                        }
                        Readiness::Ready if executing < self.max_concurrency => {
                            let _ = guard.insert(action.id(), ExecutionRecord::running());
                            executing += 1;
                            max_concurrency = max_concurrency.max(executing);
                            let _ = tasks.spawn(run_action(
                                action.clone(),
                                Arc::clone(&runner),
                                Arc::clone(&records),
                                Arc::clone(&progress),
                                total,
                            ));
                        }
                        Readiness::Ready | Readiness::Waiting => unexecuted += 1,
                    }
                }
            }

            while let Some(joined) = tasks.try_join_next() {
                if let Err(e) = joined {
                    warn!("Action worker ended abnormally: {}", e);
                }
            }

            if unexecuted == 0 && executing == 0 {
                break;
            }
            if executing == 0 && !skipped_this_pass {
                // Nothing is running and nothing could start, which only a
                // dependency cycle inside the batch can cause.
                let mut guard = lock(&records);
                for action in actions {
                    if is_pending(&guard, action.id()) {
                        warn!("{} can never become ready", action.description());
                        let _ = guard.insert(action.id(), ExecutionRecord::skipped());
                    }
                }
                break;
            }
            tokio::time::sleep(self.poll_interval).await;
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                warn!("Action worker ended abnormally: {}", e);
            }
        }

        let records = std::mem::take(&mut *lock(&records));
        let summary = ExecutionSummary {
            records,
            total_duration: started.elapsed(),
            max_concurrency,
        };
        debug!("{}", summary.format());
        if self.log_detailed_stats {
            execution_log::log_action_stats(actions, &summary);
        }
        summary
    }
}

fn is_pending(records: &BTreeMap<ActionId, ExecutionRecord>, id: ActionId) -> bool {
    records
        .get(&id)
        .is_some_and(|record| record.state == ActionState::Pending)
}

fn readiness(
    action: &BuildAction,
    producers: &HashMap<&FileIdentity, ActionId>,
    records: &BTreeMap<ActionId, ExecutionRecord>,
) -> Readiness {
    let mut ready = true;
    for prerequisite in &action.prerequisites {
        let Some(&producer) = producers.get(prerequisite) else {
            continue;
        };
        if producer == action.id() {
            continue;
        }
        match records.get(&producer).map(|r| r.state) {
            Some(ActionState::Complete) => {}
            Some(ActionState::Failed | ActionState::SkippedDueToFailedPrerequisite) => {
                return Readiness::Blocked;
            }
            Some(ActionState::Pending | ActionState::Running) | None => ready = false,
        }
    }
    if ready {
        Readiness::Ready
    } else {
        Readiness::Waiting
    }
}

async fn run_action(
    action: BuildAction,
    runner: Arc<dyn ActionRunner>,
    records: Records,
    progress: Arc<AtomicUsize>,
    total: usize,
) {
    let started = Instant::now();
    let outcome = runner.run(&action).await;
    let elapsed = started.elapsed();

    if !outcome.success() {
        execution_log::log_failure(&action, &outcome);
    }

    let done = progress.fetch_add(1, Ordering::SeqCst) + 1;
    info!("[{}/{}] {}", done, total, action.description());

    let mut guard = lock(&records);
    let started_at = guard.get(&action.id()).and_then(|r| r.started_at);
    let mut record = ExecutionRecord::finished(outcome, elapsed);
    record.started_at = started_at;
    let _ = guard.insert(action.id(), record);
}

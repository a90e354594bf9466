//! Reconciliation driver for `PodCleanupPolicy`
//!
//! One invocation loads the policy, consults the cron gate, runs the
//! executor when due, persists the resulting status with a single write and
//! tells the runtime when to come back.

use crate::crds::PodCleanupPolicy;
use crate::tasks::cleanup::executor;
use crate::tasks::cleanup::schedule::{CronSchedule, Gate};
use crate::tasks::cleanup::status::{
    record_invalid_schedule, record_run, record_unreachable_schedule, RunResult,
};
use crate::tasks::store::ObjectStore;
use crate::tasks::types::{Clock, Context, Error, Result};
use chrono::{DateTime, Utc};
use kube::runtime::controller::Action;
use kube::ResourceExt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, instrument, warn};

/// Default number of namespaces cleaned concurrently
pub const DEFAULT_NAMESPACE_CONCURRENCY: usize = 4;

/// Tunables for a single reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileSettings {
    pub namespace_concurrency: usize,
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        Self {
            namespace_concurrency: DEFAULT_NAMESPACE_CONCURRENCY,
        }
    }
}

/// What the runtime should do after a reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Reconcile again after the given delay
    Requeue(Duration),
    /// Wait for the policy to change
    Idle,
}

impl From<ReconcileOutcome> for Action {
    fn from(outcome: ReconcileOutcome) -> Self {
        match outcome {
            ReconcileOutcome::Requeue(delay) => Action::requeue(delay),
            ReconcileOutcome::Idle => Action::await_change(),
        }
    }
}

/// Entry point used by the kube-rs controller runtime.
#[instrument(skip(policy, ctx), fields(policy = %policy.name_any()))]
pub async fn reconcile_cleanup_policy(
    policy: Arc<PodCleanupPolicy>,
    ctx: Arc<Context>,
) -> Result<Action> {
    let name = policy.metadata.name.clone().ok_or(Error::MissingObjectKey)?;
    let outcome = reconcile_policy(
        ctx.store.as_ref(),
        ctx.clock.as_ref(),
        &ctx.settings(),
        &name,
    )
    .await?;

    info!(?outcome, "Reconcile completed");
    Ok(outcome.into())
}

/// Evaluates one policy against the current cluster state.
///
/// Spec problems (bad schedule, bad selectors) end up in the `Ready`
/// condition. Only a failure to load the policy or to persist its status is
/// returned as an error.
pub async fn reconcile_policy(
    store: &dyn ObjectStore,
    clock: &dyn Clock,
    settings: &ReconcileSettings,
    name: &str,
) -> Result<ReconcileOutcome> {
    let Some(policy) = store
        .get_policy(name)
        .await
        .map_err(|source| Error::PolicyFetch {
            name: name.to_string(),
            source,
        })?
    else {
        info!(policy = %name, "PodCleanupPolicy no longer exists");
        return Ok(ReconcileOutcome::Idle);
    };

    let now = clock.now();
    let mut status = policy.status.clone().unwrap_or_default();
    let generation = policy.metadata.generation;

    let schedule = match policy.spec.schedule() {
        None => None,
        Some(expr) => match CronSchedule::parse(expr) {
            Ok(schedule) => Some(schedule),
            Err(err) => {
                error!(policy = %name, schedule = %expr, error = %err, "Invalid cron schedule");
                record_invalid_schedule(&mut status, generation, expr, &err, now);
                persist_status(store, name, &status).await?;
                // Nothing to do until the schedule is edited
                return Ok(ReconcileOutcome::Idle);
            }
        },
    };

    if let Some(schedule) = &schedule {
        match schedule.gate(status.last_run_time, now) {
            Gate::Run => {}
            Gate::Wait { until } => {
                let delay = until_delay(now, until);
                info!(
                    policy = %name,
                    next_run = %until.to_rfc3339(),
                    requeue_after_secs = delay.as_secs(),
                    "Next cleanup scheduled"
                );
                return Ok(ReconcileOutcome::Requeue(delay));
            }
            Gate::Never => {
                warn!(policy = %name, schedule = %schedule, "Cron schedule never fires");
                record_unreachable_schedule(&mut status, generation, &schedule.to_string(), now);
                persist_status(store, name, &status).await?;
                return Ok(ReconcileOutcome::Idle);
            }
        }
    }

    let result = match executor::execute(store, &policy, now, settings.namespace_concurrency).await
    {
        Ok(outcome) => RunResult::Succeeded {
            affected: outcome.affected,
        },
        Err(err) => {
            error!(policy = %name, error = %err, "Cleanup run failed");
            RunResult::Failed {
                detail: err.to_string(),
            }
        }
    };

    record_run(&mut status, generation, policy.spec.dry_run, &result, now);
    persist_status(store, name, &status).await?;

    let Some(schedule) = schedule else {
        return Ok(ReconcileOutcome::Idle);
    };

    // The next tick is measured from the end of this run, not from the tick
    // that triggered it.
    let after = clock.now();
    match schedule.next_after(after) {
        Some(next) => {
            let delay = until_delay(after, next);
            info!(
                policy = %name,
                next_run = %next.to_rfc3339(),
                requeue_after_secs = delay.as_secs(),
                "Next cleanup scheduled"
            );
            Ok(ReconcileOutcome::Requeue(delay))
        }
        None => Ok(ReconcileOutcome::Idle),
    }
}

async fn persist_status(
    store: &dyn ObjectStore,
    name: &str,
    status: &crate::crds::PodCleanupPolicyStatus,
) -> Result<()> {
    store.update_status(name, status).await.map_err(|source| {
        error!(policy = %name, error = %source, "Failed to update PodCleanupPolicy status");
        Error::StatusPersist {
            name: name.to_string(),
            source,
        }
    })
}

fn until_delay(now: DateTime<Utc>, until: DateTime<Utc>) -> Duration {
    (until - now).to_std().unwrap_or(Duration::ZERO)
}

use crate::crds::PodCleanupPolicy;
use futures::{Stream, StreamExt};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::{predicates, reflector, watcher, WatchStreamExt};
use kube::{Api, Client, ResourceExt};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn, Instrument};

pub mod cleanup;
pub mod config;
pub mod store;
pub mod types;

// Re-export commonly used items
pub use cleanup::reconcile_cleanup_policy;
pub use config::ControllerConfig;
pub use types::{Context, Error, Result};

use store::KubeStore;
use types::SystemClock;

/// Main entry point for the `PodCleanupPolicy` controller
#[instrument(skip(client, config))]
pub async fn run_cleanup_controller(client: Client, config: Arc<ControllerConfig>) -> Result<()> {
    info!("Starting PodCleanupPolicy controller");

    if let Err(validation_error) = config.validate() {
        error!("Configuration validation failed: {}", validation_error);
        return Err(Error::ConfigError(validation_error.to_string()));
    }
    debug!(
        namespace_concurrency = config.reconcile.namespace_concurrency,
        error_requeue_seconds = config.reconcile.error_requeue_seconds,
        "Configuration validation passed"
    );

    let context = Arc::new(Context::new(
        Arc::new(KubeStore::new(client.clone())),
        Arc::new(SystemClock),
        config,
    ));

    let policies: Api<PodCleanupPolicy> = Api::all(client);
    let watcher_config = watcher::Config::default().any_semantic();
    let (reader, writer) = reflector::store();
    let events = watcher(policies, watcher_config)
        .default_backoff()
        .reflect(writer)
        .applied_objects();

    Controller::for_stream(spec_changes(events), reader)
        .shutdown_on_signal()
        .run(reconcile_cleanup_policy, error_policy, context)
        .for_each(|reconciliation_result| {
            let span = tracing::info_span!("policy_reconciliation_result");
            async move {
                match reconciliation_result {
                    Ok((policy, _action)) => {
                        debug!(
                            policy = %policy.name,
                            "PodCleanupPolicy reconciliation successful"
                        );
                    }
                    Err(reconciliation_err) => {
                        warn!(
                            error = %reconciliation_err,
                            "PodCleanupPolicy reconciliation error"
                        );
                    }
                }
            }
            .instrument(span)
        })
        .await;

    info!("PodCleanupPolicy controller shutting down");
    Ok(())
}

/// Drops watch events that leave `metadata.generation` unchanged.
///
/// Status writes never bump the generation, so a policy is not re-triggered
/// by its own bookkeeping. Scheduled requeues go through the runtime's
/// scheduler and are unaffected.
pub fn spec_changes<S>(
    events: S,
) -> impl Stream<Item = std::result::Result<PodCleanupPolicy, watcher::Error>> + Send
where
    S: Stream<Item = std::result::Result<PodCleanupPolicy, watcher::Error>> + Send,
{
    events.predicate_filter(predicates::generation)
}

/// Error policy: retry infrastructure failures after a fixed delay
#[instrument(skip(policy, ctx), fields(policy = %policy.name_any()))]
pub fn error_policy(policy: Arc<PodCleanupPolicy>, err: &Error, ctx: Arc<Context>) -> Action {
    if err.is_retryable() {
        let delay = Duration::from_secs(ctx.config.reconcile.error_requeue_seconds);
        error!(
            error = %err,
            retry_after_secs = delay.as_secs(),
            "PodCleanupPolicy reconciliation failed, retrying"
        );
        Action::requeue(delay)
    } else {
        error!(
            error = %err,
            "PodCleanupPolicy reconciliation failed, waiting for changes"
        );
        Action::await_change()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crds::{PodCleanupPolicySpec, PodCleanupPolicyStatus};
    use crate::tasks::store::StoreError;
    use crate::testing::{policy, FixedClock, MemoryStore};
    use chrono::Utc;

    fn context(error_requeue_seconds: u64) -> Arc<Context> {
        let mut config = ControllerConfig::default();
        config.reconcile.error_requeue_seconds = error_requeue_seconds;
        Arc::new(Context::new(
            Arc::new(MemoryStore::new()),
            Arc::new(FixedClock::new(Utc::now())),
            Arc::new(config),
        ))
    }

    #[test]
    fn retryable_errors_requeue_after_configured_delay() {
        let err = Error::StatusPersist {
            name: "p".to_string(),
            source: StoreError::Transient("conflict".to_string()),
        };
        let action = error_policy(
            Arc::new(policy("p", PodCleanupPolicySpec::default())),
            &err,
            context(12),
        );
        assert_eq!(action, Action::requeue(Duration::from_secs(12)));
    }

    #[tokio::test]
    async fn status_only_updates_do_not_retrigger() {
        let created = policy("p", PodCleanupPolicySpec::default());
        let mut status_written = created.clone();
        status_written.status = Some(PodCleanupPolicyStatus {
            pods_deleted: 4,
            ..Default::default()
        });
        let mut edited = status_written.clone();
        edited.metadata.generation = Some(2);

        let events = futures::stream::iter(vec![Ok(created), Ok(status_written), Ok(edited)]);
        let seen: Vec<Option<i64>> = spec_changes(events)
            .map(|event| event.unwrap().metadata.generation)
            .collect()
            .await;

        assert_eq!(seen, vec![Some(1), Some(2)]);
    }

    #[test]
    fn permanent_errors_wait_for_change() {
        let action = error_policy(
            Arc::new(policy("p", PodCleanupPolicySpec::default())),
            &Error::MissingObjectKey,
            context(12),
        );
        assert_eq!(action, Action::await_change());
    }
}

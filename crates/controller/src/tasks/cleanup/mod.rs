//! Pod cleanup pipeline
//!
//! `reconcile` drives one policy evaluation. It relies on the label
//! `selector`, the pod `filter`, the cron `schedule` gate, the `executor`
//! and the `status` bookkeeping.

pub mod executor;
pub mod filter;
pub mod reconcile;
pub mod schedule;
pub mod selector;
pub mod status;

pub use reconcile::{
    reconcile_cleanup_policy, reconcile_policy, ReconcileOutcome, ReconcileSettings,
};

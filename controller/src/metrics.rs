//! Metrics contains the metrics setup for the controller.

use metrics::{counter, describe_counter};

/// Register describes the controller's metrics so the exporter renders help
/// text.
pub fn register() {
    describe_counter!("mirror_reconciles", "Total reconciler invocations");
    describe_counter!(
        "mirror_reconcile_failures",
        "Reconciler invocations that returned an error"
    );
    describe_counter!("mirror_writes", "Mirrors created or updated");
    describe_counter!("mirror_deletes", "Mirrors deleted");
    describe_counter!("mirror_breaker_opens", "Circuit-breaker open transitions");
}

pub(crate) fn reconcile(kind: &str) {
    counter!("mirror_reconciles", "kind" => kind.to_string()).increment(1);
}

pub(crate) fn reconcile_failure(kind: &str) {
    counter!("mirror_reconcile_failures", "kind" => kind.to_string()).increment(1);
}

pub(crate) fn mirror_written(kind: &str) {
    counter!("mirror_writes", "kind" => kind.to_string()).increment(1);
}

pub(crate) fn mirror_deleted(kind: &str) {
    counter!("mirror_deletes", "kind" => kind.to_string()).increment(1);
}

pub(crate) fn breaker_opened(kind: &str) {
    counter!("mirror_breaker_opens", "kind" => kind.to_string()).increment(1);
}

use lazy_static::lazy_static;
use prometheus::{
    register_int_counter, register_int_counter_vec, register_int_gauge, IntCounter, IntCounterVec,
    IntGauge, Registry,
};

lazy_static! {
    static ref WORKFLOWS_LAUNCHED: IntCounterVec = register_int_counter_vec!(
        "annolab_workflows_launched_total",
        "Number of workflows submitted to the broker",
        &["mode"]
    )
    .unwrap();
    static ref WORKFLOWS_FINISHED: IntCounterVec = register_int_counter_vec!(
        "annolab_workflows_finished_total",
        "Number of workflows that reached a terminal state",
        &["outcome"]
    )
    .unwrap();
    static ref BROKER_INSPECTION_FAILURES: IntCounter = register_int_counter!(
        "annolab_broker_inspection_failures_total",
        "Number of failed broker inspections"
    )
    .unwrap();
    static ref ACTIVE_WATCHDOGS: IntGauge = register_int_gauge!(
        "annolab_active_watchdogs",
        "Number of per-project annotation watchdogs currently running"
    )
    .unwrap();
}

pub fn register_all() -> Registry {
    prometheus::default_registry().clone()
}

pub fn record_workflow_launched(auto_launched: bool) {
    let mode = if auto_launched { "auto" } else { "user" };
    WORKFLOWS_LAUNCHED.with_label_values(&[mode]).inc();
}

pub fn record_workflow_finished(succeeded: bool) {
    let outcome = if succeeded { "succeeded" } else { "failed" };
    WORKFLOWS_FINISHED.with_label_values(&[outcome]).inc();
}

pub fn record_workflow_aborted() {
    WORKFLOWS_FINISHED.with_label_values(&["aborted"]).inc();
}

pub fn record_broker_inspection_failure() {
    BROKER_INSPECTION_FAILURES.inc();
}

pub fn record_watchdog_started() {
    ACTIVE_WATCHDOGS.inc();
}

pub fn record_watchdog_stopped() {
    ACTIVE_WATCHDOGS.dec();
}

// Prometheus metrics for the API process

use lazy_static::lazy_static;
use prometheus::{
    register_int_counter_vec, register_int_gauge, Encoder, IntCounterVec, IntGauge, TextEncoder,
};

lazy_static! {
    pub static ref SUBMISSIONS_CREATED: IntCounterVec = register_int_counter_vec!(
        "soliditybytes_submissions_created_total",
        "Submissions accepted, by mode",
        &["mode"]
    )
    .unwrap();
    pub static ref RUNS_FINISHED: IntCounterVec = register_int_counter_vec!(
        "soliditybytes_runs_finished_total",
        "Runs that reached a terminal state, by outcome",
        &["outcome"]
    )
    .unwrap();
    pub static ref DEPENDENCY_INSTALLS: IntCounterVec = register_int_counter_vec!(
        "soliditybytes_dependency_installs_total",
        "Workspace preparations, by whether dependencies were installed",
        &["result"]
    )
    .unwrap();
    pub static ref ACTIVE_STREAMS: IntGauge = register_int_gauge!(
        "soliditybytes_active_streams",
        "Event stream connections currently open"
    )
    .unwrap();
}

/// Render all registered metrics in the text exposition format
pub fn render() -> Result<String, prometheus::Error> {
    // Registration is lazy; force it so an idle process still exports
    lazy_static::initialize(&SUBMISSIONS_CREATED);
    lazy_static::initialize(&RUNS_FINISHED);
    lazy_static::initialize(&DEPENDENCY_INSTALLS);
    lazy_static::initialize(&ACTIVE_STREAMS);

    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&prometheus::gather(), &mut buffer)?;
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}

/// Keeps [`ACTIVE_STREAMS`] in step with open connections.
pub struct StreamGuard;

impl StreamGuard {
    pub fn open() -> Self {
        ACTIVE_STREAMS.inc();
        StreamGuard
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        ACTIVE_STREAMS.dec();
    }
}

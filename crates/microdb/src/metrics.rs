//! OpenTelemetry metric handles.
//!
//! Every recording function compiles to a no-op unless the `metrics` feature
//! is enabled. The binary registers the handles once through [`init`] after
//! building its meter provider; until then recording is silently skipped.

#[cfg(feature = "metrics")]
use opentelemetry::{
    KeyValue,
    metrics::{Counter, Meter, UpDownCounter},
};
#[cfg(feature = "metrics")]
use std::sync::OnceLock;

#[cfg(feature = "metrics")]
static SESSIONS_ADMITTED: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static SESSIONS_ACTIVE: OnceLock<UpDownCounter<i64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static TRANSACTIONS: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static FORCED_RELEASES: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static COMMANDS: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static RECORDS_WRITTEN: OnceLock<Counter<u64>> = OnceLock::new();

#[cfg(feature = "metrics")]
pub fn init(meter: &Meter) {
    let _ = SESSIONS_ADMITTED.set(
        meter
            .u64_counter("sessions_admitted")
            .with_description("Sessions let through the admission gate")
            .build(),
    );

    let _ = SESSIONS_ACTIVE.set(
        meter
            .i64_up_down_counter("sessions_active")
            .with_description("Concurrently connected sessions")
            .build(),
    );

    let _ = TRANSACTIONS.set(
        meter
            .u64_counter("transactions")
            .with_description("Transactions begun")
            .build(),
    );

    let _ = FORCED_RELEASES.set(
        meter
            .u64_counter("forced_lock_releases")
            .with_description("Transaction locks released on behalf of a dropped session")
            .build(),
    );

    let _ = COMMANDS.set(
        meter
            .u64_counter("commands")
            .with_description("Commands processed, by outcome")
            .build(),
    );

    let _ = RECORDS_WRITTEN.set(
        meter
            .u64_counter("records_written")
            .with_description("Records persisted by the pipeline coordinator")
            .build(),
    );
}

#[cfg(feature = "metrics")]
pub fn session_opened() {
    if let Some(counter) = SESSIONS_ADMITTED.get() {
        counter.add(1, &[]);
    }
    if let Some(counter) = SESSIONS_ACTIVE.get() {
        counter.add(1, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn session_opened() {}

#[cfg(feature = "metrics")]
pub fn session_closed() {
    if let Some(counter) = SESSIONS_ACTIVE.get() {
        counter.add(-1, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn session_closed() {}

#[cfg(feature = "metrics")]
pub fn increment_transactions() {
    if let Some(counter) = TRANSACTIONS.get() {
        counter.add(1, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn increment_transactions() {}

#[cfg(feature = "metrics")]
pub fn increment_forced_releases() {
    if let Some(counter) = FORCED_RELEASES.get() {
        counter.add(1, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn increment_forced_releases() {}

#[cfg(feature = "metrics")]
pub fn record_command(verb: &'static str, ok: bool) {
    if let Some(counter) = COMMANDS.get() {
        counter.add(
            1,
            &[
                KeyValue::new("verb", verb),
                KeyValue::new("outcome", if ok { "ok" } else { "error" }),
            ],
        );
    }
}

#[cfg(not(feature = "metrics"))]
pub fn record_command(_verb: &'static str, _ok: bool) {}

#[cfg(feature = "metrics")]
pub fn increment_records_written(count: u64) {
    if let Some(counter) = RECORDS_WRITTEN.get() {
        counter.add(count, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn increment_records_written(_count: u64) {}

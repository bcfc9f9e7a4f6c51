//! tideline runtime metrics.
//!
//! Counters for connection lifecycle, bytes moved through the write
//! buffer, task scheduling, and timer fires. Registered statically; an
//! embedding application exposes them through whatever metriken exporter
//! it already runs.

use metriken::{metric, Counter, Gauge};

// ── Connection lifecycle ─────────────────────────────────────────

#[metric(
    name = "tideline/connections/accepted",
    description = "Total connections accepted"
)]
pub static CONNECTIONS_ACCEPTED: Counter = Counter::new();

#[metric(
    name = "tideline/connections/closed",
    description = "Total connections closed"
)]
pub static CONNECTIONS_CLOSED: Counter = Counter::new();

#[metric(
    name = "tideline/connections/refused",
    description = "Connections refused at capacity"
)]
pub static CONNECTIONS_REFUSED: Counter = Counter::new();

#[metric(
    name = "tideline/connections/active",
    description = "Currently managed connections"
)]
pub static CONNECTIONS_ACTIVE: Gauge = Gauge::new();

// ── Bytes ────────────────────────────────────────────────────────

#[metric(name = "tideline/bytes/sent", description = "Total bytes sent")]
pub static BYTES_SENT: Counter = Counter::new();

#[metric(name = "tideline/bytes/received", description = "Total bytes received")]
pub static BYTES_RECEIVED: Counter = Counter::new();

// ── Tasks ────────────────────────────────────────────────────────

#[metric(
    name = "tideline/tasks/scheduled",
    description = "Tasks accepted by the pool"
)]
pub static TASKS_SCHEDULED: Counter = Counter::new();

#[metric(
    name = "tideline/tasks/rejected",
    description = "Tasks rejected by a full queue"
)]
pub static TASKS_REJECTED: Counter = Counter::new();

// ── Timers ───────────────────────────────────────────────────────

#[metric(name = "tideline/timers/fired", description = "Timer expirations handled")]
pub static TIMERS_FIRED: Counter = Counter::new();

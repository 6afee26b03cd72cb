// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Metrics and Health
//!
//! Lock-free counters shared by every component. Reading a snapshot never
//! blocks the publish or consume paths.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Metrics {
    connected: AtomicBool,
    degraded: AtomicBool,
    reconnect_attempts: AtomicU64,
    publish_attempts: AtomicU64,
    publish_success: AtomicU64,
    publish_failure: AtomicU64,
    consumer_count: AtomicU64,
    unacked: AtomicU64,
    acked: AtomicU64,
    requeued: AtomicU64,
    dead_lettered: AtomicU64,
    dead_letter_failures: AtomicU64,
    dropped: AtomicU64,
    topology_errors: AtomicU64,
}

/// Point-in-time view of [`Metrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub connected: bool,
    pub degraded: bool,
    pub reconnect_attempts: u64,
    pub publish_attempts: u64,
    pub publish_success: u64,
    pub publish_failure: u64,
    pub consumer_count: u64,
    pub unacked: u64,
    pub acked: u64,
    pub requeued: u64,
    pub dead_lettered: u64,
    pub dead_letter_failures: u64,
    pub dropped: u64,
    pub topology_errors: u64,
}

fn decrement(counter: &AtomicU64) {
    let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connected: self.connected.load(Ordering::Relaxed),
            degraded: self.degraded.load(Ordering::Relaxed),
            reconnect_attempts: self.reconnect_attempts.load(Ordering::Relaxed),
            publish_attempts: self.publish_attempts.load(Ordering::Relaxed),
            publish_success: self.publish_success.load(Ordering::Relaxed),
            publish_failure: self.publish_failure.load(Ordering::Relaxed),
            consumer_count: self.consumer_count.load(Ordering::Relaxed),
            unacked: self.unacked.load(Ordering::Relaxed),
            acked: self.acked.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            dead_letter_failures: self.dead_letter_failures.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            topology_errors: self.topology_errors.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Relaxed);
        if connected {
            self.degraded.store(false, Ordering::Relaxed);
        }
    }

    pub(crate) fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    pub(crate) fn set_degraded(&self) {
        self.degraded.store(true, Ordering::Relaxed);
    }

    pub(crate) fn reconnect_attempt(&self) {
        self.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn publish_attempt(&self) {
        self.publish_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn publish_succeeded(&self) {
        self.publish_success.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn publish_failed(&self) {
        self.publish_failure.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn consumer_attached(&self) {
        self.consumer_count.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn consumer_detached(&self) {
        decrement(&self.consumer_count);
    }

    pub(crate) fn delivery_received(&self) {
        self.unacked.fetch_add(1, Ordering::Relaxed);
    }

    /// The delivery left the in-flight set without a recorded outcome
    /// (connection loss hands it back to the broker).
    pub(crate) fn delivery_released(&self) {
        decrement(&self.unacked);
    }

    pub(crate) fn delivery_acked(&self) {
        decrement(&self.unacked);
        self.acked.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn delivery_requeued(&self) {
        decrement(&self.unacked);
        self.requeued.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn delivery_dropped(&self) {
        decrement(&self.unacked);
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn dead_lettered(&self) {
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn dead_letter_failed(&self) {
        self.dead_letter_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn topology_error(&self) {
        self.topology_errors.fetch_add(1, Ordering::Relaxed);
    }
}

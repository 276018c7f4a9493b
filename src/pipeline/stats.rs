//! Lock-free pipeline counters shared between the worker and callers

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam::utils::CachePadded;

#[derive(Default)]
struct Counters {
    frames_processed: AtomicU64,
    requests_ok: AtomicU64,
    requests_failed: AtomicU64,
    outputs_ok: AtomicU64,
    outputs_failed: AtomicU64,
    decode_failures: AtomicU64,
    flushed: AtomicU64,
}

/// Running totals for one session
#[derive(Default)]
pub struct PipelineStats {
    counters: CachePadded<Counters>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub frames_processed: u64,
    pub requests_ok: u64,
    pub requests_failed: u64,
    pub outputs_ok: u64,
    pub outputs_failed: u64,
    pub decode_failures: u64,
    pub flushed: u64,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_frame(&self) {
        self.counters.frames_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_request(&self, ok: bool) {
        let counter = if ok {
            &self.counters.requests_ok
        } else {
            &self.counters.requests_failed
        };
        counter.fetch_add(1, Ordering::Relaxed);
        let status = if ok { "ok" } else { "error" };
        metrics::counter!("extcam_results_total", "status" => status).increment(1);
    }

    pub fn record_output(&self, ok: bool) {
        let counter = if ok {
            &self.counters.outputs_ok
        } else {
            &self.counters.outputs_failed
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_decode_failure(&self) {
        self.counters.decode_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_flushed(&self, requests: u64) {
        self.counters.flushed.fetch_add(requests, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let c = &self.counters;
        StatsSnapshot {
            frames_processed: c.frames_processed.load(Ordering::Relaxed),
            requests_ok: c.requests_ok.load(Ordering::Relaxed),
            requests_failed: c.requests_failed.load(Ordering::Relaxed),
            outputs_ok: c.outputs_ok.load(Ordering::Relaxed),
            outputs_failed: c.outputs_failed.load(Ordering::Relaxed),
            decode_failures: c.decode_failures.load(Ordering::Relaxed),
            flushed: c.flushed.load(Ordering::Relaxed),
        }
    }
}

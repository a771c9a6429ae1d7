//! Prometheus metrics for WaveVault.
//!
//! All metric types use atomics internally (no locks on the hot path).
//! The `Metrics` struct is `Clone`-cheap (Arc-based registry + collectors).

use prometheus::{
    Encoder, Gauge, GaugeVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

/// All Prometheus metrics for the ingestion service.
#[derive(Clone)]
pub struct Metrics {
    pub registry: Registry,

    // -- Process & Build --
    pub process_start_time_seconds: Gauge,
    pub build_info: GaugeVec,

    // -- Ingest --
    pub ingest_files_total: IntCounterVec,
    pub ingest_bytes_total: IntCounter,
    pub dedup_hits_total: IntCounter,

    // -- Sessions --
    pub sessions_active: IntGauge,
    pub sessions_expired_total: IntCounter,

    // -- Admission --
    pub rate_limited_total: IntCounterVec,
    pub breaker_open_total: IntCounterVec,

    // -- Workers --
    pub worker_active: IntGauge,
    pub worker_queue_depth: IntGauge,

    // -- Events --
    pub events_dropped_total: IntCounter,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let process_start_time_seconds =
            Gauge::new("process_start_time_seconds", "Start time of the process").unwrap();
        registry
            .register(Box::new(process_start_time_seconds.clone()))
            .unwrap();

        let build_info = GaugeVec::new(
            Opts::new("wavevault_build_info", "Build information"),
            &["version"],
        )
        .unwrap();
        registry.register(Box::new(build_info.clone())).unwrap();

        // Standard process metrics (RSS, CPU, open FDs on Linux)
        #[cfg(target_os = "linux")]
        {
            let pc = prometheus::process_collector::ProcessCollector::for_self();
            let _ = registry.register(Box::new(pc));
        }

        let ingest_files_total = IntCounterVec::new(
            Opts::new(
                "wavevault_ingest_files_total",
                "Ingested files by outcome (success, duplicate, error)",
            ),
            &["outcome"],
        )
        .unwrap();
        registry
            .register(Box::new(ingest_files_total.clone()))
            .unwrap();

        let ingest_bytes_total = IntCounter::new(
            "wavevault_ingest_bytes_total",
            "Payload bytes successfully stored",
        )
        .unwrap();
        registry
            .register(Box::new(ingest_bytes_total.clone()))
            .unwrap();

        let dedup_hits_total = IntCounter::new(
            "wavevault_dedup_hits_total",
            "Payloads short-circuited as duplicates",
        )
        .unwrap();
        registry
            .register(Box::new(dedup_hits_total.clone()))
            .unwrap();

        let sessions_active = IntGauge::new(
            "wavevault_sessions_active",
            "Resumable upload sessions currently held",
        )
        .unwrap();
        registry
            .register(Box::new(sessions_active.clone()))
            .unwrap();

        let sessions_expired_total = IntCounter::new(
            "wavevault_sessions_expired_total",
            "Sessions removed by the TTL sweep",
        )
        .unwrap();
        registry
            .register(Box::new(sessions_expired_total.clone()))
            .unwrap();

        let rate_limited_total = IntCounterVec::new(
            Opts::new(
                "wavevault_rate_limited_total",
                "Requests denied by the rate limiter, by class",
            ),
            &["class"],
        )
        .unwrap();
        registry
            .register(Box::new(rate_limited_total.clone()))
            .unwrap();

        let breaker_open_total = IntCounterVec::new(
            Opts::new(
                "wavevault_breaker_open_total",
                "Calls rejected by an open circuit, by dependency",
            ),
            &["dependency"],
        )
        .unwrap();
        registry
            .register(Box::new(breaker_open_total.clone()))
            .unwrap();

        let worker_active = IntGauge::new(
            "wavevault_worker_active",
            "Work items currently executing",
        )
        .unwrap();
        registry.register(Box::new(worker_active.clone())).unwrap();

        let worker_queue_depth = IntGauge::new(
            "wavevault_worker_queue_depth",
            "Work items waiting in the queue",
        )
        .unwrap();
        registry
            .register(Box::new(worker_queue_depth.clone()))
            .unwrap();

        let events_dropped_total = IntCounter::new(
            "wavevault_events_dropped_total",
            "Progress events dropped on a full sink",
        )
        .unwrap();
        registry
            .register(Box::new(events_dropped_total.clone()))
            .unwrap();

        Self {
            registry,
            process_start_time_seconds,
            build_info,
            ingest_files_total,
            ingest_bytes_total,
            dedup_hits_total,
            sessions_active,
            sessions_expired_total,
            rate_limited_total,
            breaker_open_total,
            worker_active,
            worker_queue_depth,
            events_dropped_total,
        }
    }

    /// Render the registry in the Prometheus text format.
    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut out = Vec::new();
        if encoder.encode(&families, &mut out).is_err() {
            return String::new();
        }
        String::from_utf8(out).unwrap_or_default()
    }
}

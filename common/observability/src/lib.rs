use prometheus::{Histogram, IntCounterVec, IntGaugeVec, Registry};

#[derive(Clone)]
pub struct CrawlerMetrics {
    pub registry: Registry,
    pub fetches_total: IntCounterVec,
    pub pages_stored_total: IntCounterVec,
    pub people_extracted_total: IntCounterVec,
    pub fetch_duration_seconds: Histogram,
    pub jobs_processed_total: IntCounterVec,
}

impl CrawlerMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();
        let fetches_total = IntCounterVec::new(
            prometheus::Opts::new("crawler_fetches_total", "Fetch attempts by outcome reason"),
            &["reason"],
        ).unwrap();
        let pages_stored_total = IntCounterVec::new(
            prometheus::Opts::new("crawler_pages_stored_total", "Pages persisted as sources"),
            &["tenant_id"],
        ).unwrap();
        let people_extracted_total = IntCounterVec::new(
            prometheus::Opts::new("crawler_people_extracted_total", "People candidates accepted from extraction"),
            &["tenant_id"],
        ).unwrap();
        let fetch_duration_seconds = Histogram::with_opts(
            prometheus::HistogramOpts::new(
                "crawler_fetch_duration_seconds",
                "Wall time of a single fetch including robots consultation"
            ).buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0])
        ).unwrap();
        let jobs_processed_total = IntCounterVec::new(
            prometheus::Opts::new("crawler_jobs_processed_total", "Queue jobs handled by outcome"),
            &["queue", "outcome"],
        ).unwrap();
        let _ = registry.register(Box::new(fetches_total.clone()));
        let _ = registry.register(Box::new(pages_stored_total.clone()));
        let _ = registry.register(Box::new(people_extracted_total.clone()));
        let _ = registry.register(Box::new(fetch_duration_seconds.clone()));
        let _ = registry.register(Box::new(jobs_processed_total.clone()));
        CrawlerMetrics { registry, fetches_total, pages_stored_total, people_extracted_total, fetch_duration_seconds, jobs_processed_total }
    }
}

impl Default for CrawlerMetrics {
    fn default() -> Self { Self::new() }
}

#[derive(Clone)]
pub struct VerifierMetrics {
    pub registry: Registry,
    pub probes_total: IntCounterVec,
    pub verifications_total: IntCounterVec,
    pub catchall_checks_total: IntCounterVec,
    pub mx_resolutions_total: IntCounterVec,
    pub probe_duration_seconds: Histogram,
    pub rate_limited_total: IntCounterVec,
    pub jobs_processed_total: IntCounterVec,
}

impl VerifierMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();
        let probes_total = IntCounterVec::new(
            prometheus::Opts::new("verifier_probes_total", "RCPT probes by raw category"),
            &["category"],
        ).unwrap();
        let verifications_total = IntCounterVec::new(
            prometheus::Opts::new("verifier_verifications_total", "Final verdicts appended by verify_status"),
            &["status"],
        ).unwrap();
        let catchall_checks_total = IntCounterVec::new(
            prometheus::Opts::new("verifier_catchall_checks_total", "Catch-all probes by verdict"),
            &["status"],
        ).unwrap();
        let mx_resolutions_total = IntCounterVec::new(
            prometheus::Opts::new("verifier_mx_resolutions_total", "MX resolutions by outcome"),
            &["outcome"],
        ).unwrap();
        let probe_duration_seconds = Histogram::with_opts(
            prometheus::HistogramOpts::new(
                "verifier_probe_duration_seconds",
                "Wall time of a full SMTP conversation"
            ).buckets(vec![0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 25.0, 60.0])
        ).unwrap();
        let rate_limited_total = IntCounterVec::new(
            prometheus::Opts::new("verifier_rate_limited_total", "Acquire denials by scope kind"),
            &["scope"],
        ).unwrap();
        let jobs_processed_total = IntCounterVec::new(
            prometheus::Opts::new("verifier_jobs_processed_total", "Queue jobs handled by outcome"),
            &["queue", "outcome"],
        ).unwrap();
        let _ = registry.register(Box::new(probes_total.clone()));
        let _ = registry.register(Box::new(verifications_total.clone()));
        let _ = registry.register(Box::new(catchall_checks_total.clone()));
        let _ = registry.register(Box::new(mx_resolutions_total.clone()));
        let _ = registry.register(Box::new(probe_duration_seconds.clone()));
        let _ = registry.register(Box::new(rate_limited_total.clone()));
        let _ = registry.register(Box::new(jobs_processed_total.clone()));
        VerifierMetrics {
            registry,
            probes_total,
            verifications_total,
            catchall_checks_total,
            mx_resolutions_total,
            probe_duration_seconds,
            rate_limited_total,
            jobs_processed_total,
        }
    }
}

impl Default for VerifierMetrics {
    fn default() -> Self { Self::new() }
}

#[derive(Clone)]
pub struct PipelineMetrics {
    pub registry: Registry,
    pub runs_total: IntCounterVec,
    pub domains_total: IntCounterVec,
    pub queue_depth: IntGaugeVec,
    pub dlq_depth: IntGaugeVec,
    pub finalize_duration_seconds: Histogram,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();
        let runs_total = IntCounterVec::new(
            prometheus::Opts::new("pipeline_runs_total", "Run transitions by terminal status"),
            &["status"],
        ).unwrap();
        let domains_total = IntCounterVec::new(
            prometheus::Opts::new("pipeline_domains_total", "Per-domain outcomes across runs"),
            &["outcome"],
        ).unwrap();
        let queue_depth = IntGaugeVec::new(
            prometheus::Opts::new("pipeline_queue_depth", "Ready jobs per queue"),
            &["queue"],
        ).unwrap();
        let dlq_depth = IntGaugeVec::new(
            prometheus::Opts::new("pipeline_dlq_depth", "Dead jobs per queue"),
            &["queue"],
        ).unwrap();
        let finalize_duration_seconds = Histogram::with_opts(
            prometheus::HistogramOpts::new(
                "pipeline_finalize_duration_seconds",
                "Duration of a run finalization sweep"
            ).buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.0, 5.0])
        ).unwrap();
        let _ = registry.register(Box::new(runs_total.clone()));
        let _ = registry.register(Box::new(domains_total.clone()));
        let _ = registry.register(Box::new(queue_depth.clone()));
        let _ = registry.register(Box::new(dlq_depth.clone()));
        let _ = registry.register(Box::new(finalize_duration_seconds.clone()));
        PipelineMetrics { registry, runs_total, domains_total, queue_depth, dlq_depth, finalize_duration_seconds }
    }
}

impl Default for PipelineMetrics {
    fn default() -> Self { Self::new() }
}

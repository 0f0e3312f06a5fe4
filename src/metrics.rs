use crate::state::Snapshot;
use crate::tuning::TuningReport;
use prometheus::core::Collector;
use prometheus::{opts, Counter, CounterVec, Encoder, Gauge, GaugeVec, Registry, TextEncoder};
use std::sync::Arc;
use std::time::Instant;

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    started: Instant,
    pub nasd_cpu_usage_percent: Gauge,
    pub nasd_memory_usage_percent: Gauge,
    pub nasd_net_rx_bytes_per_sec: Gauge,
    pub nasd_net_tx_bytes_per_sec: Gauge,
    pub nasd_net_link_speed_mbps: Gauge,
    pub nasd_disk_read_mbps: Gauge,
    pub nasd_disk_write_mbps: Gauge,
    pub nasd_disk_iops: Gauge,
    pub nasd_temperature_celsius: Gauge,
    pub nasd_arc_size_bytes: Gauge,
    pub nasd_arc_hit_rate_percent: Gauge,
    pub nasd_l2arc_size_bytes: Gauge,
    pub nasd_l2arc_hit_rate_percent: Gauge,
    pub nasd_pool_size_bytes: GaugeVec,
    pub nasd_pool_used_bytes: GaugeVec,
    pub nasd_pool_fragmentation_percent: GaugeVec,
    pub nasd_pool_healthy: GaugeVec,
    pub nasd_pool_count: Gauge,
    pub nasd_subscribers: Gauge,
    pub nasd_tuning_lines_written: Gauge,
    pub nasd_tuning_failures: Gauge,
    pub nasd_uptime_seconds: Gauge,
    pub nasd_scrape_count_total: Counter,
    pub nasd_collect_errors_total: CounterVec,
    pub nasd_last_collect_timestamp_seconds: Gauge,
}

impl Metrics {
    pub fn new() -> Result<Arc<Self>, prometheus::Error> {
        let registry = Registry::new();

        let nasd_cpu_usage_percent = Gauge::with_opts(opts!(
            "nasd_cpu_usage_percent",
            "Average CPU usage across cores in percent (0..100)"
        ))?;
        let nasd_memory_usage_percent = Gauge::with_opts(opts!(
            "nasd_memory_usage_percent",
            "Memory in use (total minus available) in percent"
        ))?;
        let nasd_net_rx_bytes_per_sec = Gauge::with_opts(opts!(
            "nasd_net_rx_bytes_per_sec",
            "Received bytes per second over non-loopback interfaces"
        ))?;
        let nasd_net_tx_bytes_per_sec = Gauge::with_opts(opts!(
            "nasd_net_tx_bytes_per_sec",
            "Transmitted bytes per second over non-loopback interfaces"
        ))?;
        let nasd_net_link_speed_mbps = Gauge::with_opts(opts!(
            "nasd_net_link_speed_mbps",
            "Fastest negotiated link speed in Mbit/s"
        ))?;
        let nasd_disk_read_mbps =
            Gauge::with_opts(opts!("nasd_disk_read_mbps", "Disk read throughput in MB/s"))?;
        let nasd_disk_write_mbps =
            Gauge::with_opts(opts!("nasd_disk_write_mbps", "Disk write throughput in MB/s"))?;
        let nasd_disk_iops = Gauge::with_opts(opts!(
            "nasd_disk_iops",
            "Completed disk reads and writes per second"
        ))?;
        let nasd_temperature_celsius = Gauge::with_opts(opts!(
            "nasd_temperature_celsius",
            "Primary thermal zone temperature in Celsius"
        ))?;
        let nasd_arc_size_bytes =
            Gauge::with_opts(opts!("nasd_arc_size_bytes", "ZFS ARC size in bytes"))?;
        let nasd_arc_hit_rate_percent = Gauge::with_opts(opts!(
            "nasd_arc_hit_rate_percent",
            "ZFS ARC hit rate in percent"
        ))?;
        let nasd_l2arc_size_bytes =
            Gauge::with_opts(opts!("nasd_l2arc_size_bytes", "ZFS L2ARC size in bytes"))?;
        let nasd_l2arc_hit_rate_percent = Gauge::with_opts(opts!(
            "nasd_l2arc_hit_rate_percent",
            "ZFS L2ARC hit rate in percent"
        ))?;
        let nasd_pool_size_bytes = GaugeVec::new(
            opts!("nasd_pool_size_bytes", "Pool size in bytes by pool"),
            &["pool"],
        )?;
        let nasd_pool_used_bytes = GaugeVec::new(
            opts!("nasd_pool_used_bytes", "Pool allocated bytes by pool"),
            &["pool"],
        )?;
        let nasd_pool_fragmentation_percent = GaugeVec::new(
            opts!(
                "nasd_pool_fragmentation_percent",
                "Pool fragmentation in percent by pool"
            ),
            &["pool"],
        )?;
        let nasd_pool_healthy = GaugeVec::new(
            opts!(
                "nasd_pool_healthy",
                "1 when the pool reports ONLINE, 0 otherwise"
            ),
            &["pool"],
        )?;
        let nasd_pool_count = Gauge::with_opts(opts!("nasd_pool_count", "Number of pools"))?;
        let nasd_subscribers = Gauge::with_opts(opts!(
            "nasd_subscribers",
            "Connected live snapshot subscribers"
        ))?;
        let nasd_tuning_lines_written = Gauge::with_opts(opts!(
            "nasd_tuning_lines_written",
            "Directive lines appended by the last tuning run"
        ))?;
        let nasd_tuning_failures = Gauge::with_opts(opts!(
            "nasd_tuning_failures",
            "Directive lines and kernel parameters that failed in the last tuning run"
        ))?;
        let nasd_uptime_seconds =
            Gauge::with_opts(opts!("nasd_uptime_seconds", "Daemon uptime in seconds"))?;
        let nasd_scrape_count_total = Counter::with_opts(opts!(
            "nasd_scrape_count_total",
            "Number of /metrics scrapes"
        ))?;
        let nasd_collect_errors_total = CounterVec::new(
            opts!(
                "nasd_collect_errors_total",
                "Failed metric source reads by source"
            ),
            &["source"],
        )?;
        let nasd_last_collect_timestamp_seconds = Gauge::with_opts(opts!(
            "nasd_last_collect_timestamp_seconds",
            "Unix timestamp of the last snapshot"
        ))?;

        register(&registry, &nasd_cpu_usage_percent)?;
        register(&registry, &nasd_memory_usage_percent)?;
        register(&registry, &nasd_net_rx_bytes_per_sec)?;
        register(&registry, &nasd_net_tx_bytes_per_sec)?;
        register(&registry, &nasd_net_link_speed_mbps)?;
        register(&registry, &nasd_disk_read_mbps)?;
        register(&registry, &nasd_disk_write_mbps)?;
        register(&registry, &nasd_disk_iops)?;
        register(&registry, &nasd_temperature_celsius)?;
        register(&registry, &nasd_arc_size_bytes)?;
        register(&registry, &nasd_arc_hit_rate_percent)?;
        register(&registry, &nasd_l2arc_size_bytes)?;
        register(&registry, &nasd_l2arc_hit_rate_percent)?;
        register(&registry, &nasd_pool_size_bytes)?;
        register(&registry, &nasd_pool_used_bytes)?;
        register(&registry, &nasd_pool_fragmentation_percent)?;
        register(&registry, &nasd_pool_healthy)?;
        register(&registry, &nasd_pool_count)?;
        register(&registry, &nasd_subscribers)?;
        register(&registry, &nasd_tuning_lines_written)?;
        register(&registry, &nasd_tuning_failures)?;
        register(&registry, &nasd_uptime_seconds)?;
        register(&registry, &nasd_scrape_count_total)?;
        register(&registry, &nasd_collect_errors_total)?;
        register(&registry, &nasd_last_collect_timestamp_seconds)?;

        Ok(Arc::new(Self {
            registry,
            started: Instant::now(),
            nasd_cpu_usage_percent,
            nasd_memory_usage_percent,
            nasd_net_rx_bytes_per_sec,
            nasd_net_tx_bytes_per_sec,
            nasd_net_link_speed_mbps,
            nasd_disk_read_mbps,
            nasd_disk_write_mbps,
            nasd_disk_iops,
            nasd_temperature_celsius,
            nasd_arc_size_bytes,
            nasd_arc_hit_rate_percent,
            nasd_l2arc_size_bytes,
            nasd_l2arc_hit_rate_percent,
            nasd_pool_size_bytes,
            nasd_pool_used_bytes,
            nasd_pool_fragmentation_percent,
            nasd_pool_healthy,
            nasd_pool_count,
            nasd_subscribers,
            nasd_tuning_lines_written,
            nasd_tuning_failures,
            nasd_uptime_seconds,
            nasd_scrape_count_total,
            nasd_collect_errors_total,
            nasd_last_collect_timestamp_seconds,
        }))
    }

    pub fn update_from_snapshot(&self, snapshot: &Snapshot) {
        self.nasd_cpu_usage_percent.set(snapshot.cpu_usage_percent);
        self.nasd_memory_usage_percent
            .set(snapshot.memory_usage_percent);
        self.nasd_net_rx_bytes_per_sec
            .set(snapshot.network_io.bytes_in as f64);
        self.nasd_net_tx_bytes_per_sec
            .set(snapshot.network_io.bytes_out as f64);
        self.nasd_net_link_speed_mbps
            .set(snapshot.network_io.speed as f64);
        self.nasd_disk_read_mbps.set(snapshot.disk_io.read_mbps);
        self.nasd_disk_write_mbps.set(snapshot.disk_io.write_mbps);
        self.nasd_disk_iops.set(snapshot.disk_io.iops as f64);
        self.nasd_temperature_celsius
            .set(snapshot.temperature_celsius);

        let cache = &snapshot.storage.cache;
        self.nasd_arc_size_bytes.set(cache.arc_size as f64);
        self.nasd_arc_hit_rate_percent.set(cache.arc_hit_rate);
        self.nasd_l2arc_size_bytes.set(cache.l2arc_size as f64);
        self.nasd_l2arc_hit_rate_percent.set(cache.l2arc_hit_rate);

        // Pools can disappear between ticks.
        self.nasd_pool_size_bytes.reset();
        self.nasd_pool_used_bytes.reset();
        self.nasd_pool_fragmentation_percent.reset();
        self.nasd_pool_healthy.reset();
        for pool in &snapshot.storage.pools {
            let labels = [pool.name.as_str()];
            self.nasd_pool_size_bytes
                .with_label_values(&labels)
                .set(pool.size as f64);
            self.nasd_pool_used_bytes
                .with_label_values(&labels)
                .set(pool.used as f64);
            self.nasd_pool_fragmentation_percent
                .with_label_values(&labels)
                .set(pool.fragmentation);
            self.nasd_pool_healthy
                .with_label_values(&labels)
                .set(if pool.health == "ONLINE" { 1.0 } else { 0.0 });
        }
        self.nasd_pool_count
            .set(snapshot.storage.pools.len() as f64);

        self.nasd_last_collect_timestamp_seconds
            .set(snapshot.timestamp.timestamp() as f64);
        self.nasd_uptime_seconds
            .set(self.started.elapsed().as_secs() as f64);
    }

    pub fn record_tuning(&self, report: &TuningReport) {
        self.nasd_tuning_lines_written
            .set(report.lines_written as f64);
        self.nasd_tuning_failures
            .set((report.lines_failed + report.params_failed) as f64);
    }

    pub fn set_subscribers(&self, count: usize) {
        self.nasd_subscribers.set(count as f64);
    }

    pub fn inc_scrape_count(&self) {
        self.nasd_scrape_count_total.inc();
    }

    pub fn inc_collect_error(&self, source: &str) {
        self.nasd_collect_errors_total
            .with_label_values(&[source])
            .inc();
    }

    pub fn encode_metrics(&self) -> Result<Vec<u8>, prometheus::Error> {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        let mf = self.registry.gather();
        encoder.encode(&mf, &mut buf)?;
        Ok(buf)
    }
}

fn register<T: Collector + Clone + 'static>(
    registry: &Registry,
    collector: &T,
) -> Result<(), prometheus::Error> {
    registry.register(Box::new(collector.clone()))
}

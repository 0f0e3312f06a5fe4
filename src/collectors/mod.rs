pub mod storage;
pub mod system;

use crate::parse::ParseError;
use crate::state::{CacheStats, DiskIo, NetworkIo, PoolStatus, Snapshot, StorageReport};
use crate::tools::ToolError;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::future::Future;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Reported when no thermal zone is readable.
pub const DEFAULT_TEMPERATURE_CELSIUS: f64 = 42.0;

#[derive(Debug, Error)]
pub enum SampleError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error(transparent)]
    Tool(#[from] ToolError),
    #[error(transparent)]
    Parse(#[from] ParseError),
}

/// One method per metric family. Rate-style methods compare against the
/// previous call, which is why they take `&mut self`.
pub trait MetricSource: Send {
    fn cpu_usage_percent(&mut self) -> Result<f64, SampleError>;
    fn memory_usage_percent(&mut self) -> Result<f64, SampleError>;
    fn network_io(&mut self) -> Result<NetworkIo, SampleError>;
    fn disk_io(&mut self) -> Result<DiskIo, SampleError>;
    fn temperature_celsius(&mut self) -> Result<f64, SampleError>;
    fn cache_stats(&mut self) -> Result<CacheStats, SampleError>;
    fn pools(&mut self) -> impl Future<Output = Result<Vec<PoolStatus>, SampleError>> + Send;
}

pub struct Sampler<S> {
    source: S,
    failing: HashSet<&'static str>,
    last_timestamp: Option<DateTime<Utc>>,
}

impl<S: MetricSource> Sampler<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            failing: HashSet::new(),
            last_timestamp: None,
        }
    }

    /// Builds the next snapshot. Never fails: a family whose source errors
    /// gets its default value and its name is returned in the second slot.
    pub async fn sample(&mut self) -> (Snapshot, Vec<&'static str>) {
        let mut failed = Vec::new();

        let cpu = self.source.cpu_usage_percent();
        let cpu_usage_percent = self.settle("cpu", cpu, &mut failed).unwrap_or(0.0);

        let memory = self.source.memory_usage_percent();
        let memory_usage_percent = self.settle("memory", memory, &mut failed).unwrap_or(0.0);

        let network = self.source.network_io();
        let network_io = self.settle("network", network, &mut failed).unwrap_or_default();

        let disk = self.source.disk_io();
        let disk_io = self.settle("disk", disk, &mut failed).unwrap_or_default();

        let temperature = self.source.temperature_celsius();
        let temperature_celsius = self
            .settle("temperature", temperature, &mut failed)
            .unwrap_or(DEFAULT_TEMPERATURE_CELSIUS);

        let cache = self.source.cache_stats();
        let cache = self.settle("cache", cache, &mut failed).unwrap_or_default();

        let pools = self.source.pools().await;
        let pools = self.settle("pools", pools, &mut failed).unwrap_or_default();

        let now = Utc::now();
        let timestamp = match self.last_timestamp {
            Some(prev) if prev > now => prev,
            _ => now,
        };
        self.last_timestamp = Some(timestamp);

        let snapshot = Snapshot {
            timestamp,
            cpu_usage_percent,
            memory_usage_percent,
            network_io,
            disk_io,
            temperature_celsius,
            storage: StorageReport { cache, pools },
        };
        (snapshot, failed)
    }

    // Warn on the first failure of a source, then stay quiet until it
    // recovers so an absent subsystem does not flood the log every tick.
    fn settle<T>(
        &mut self,
        source: &'static str,
        result: Result<T, SampleError>,
        failed: &mut Vec<&'static str>,
    ) -> Option<T> {
        match result {
            Ok(value) => {
                if self.failing.remove(source) {
                    info!(source, "metric source recovered");
                }
                Some(value)
            }
            Err(err) => {
                if self.failing.insert(source) {
                    warn!(source, error = %err, "metric source failed, using default");
                } else {
                    debug!(source, error = %err, "metric source still failing");
                }
                failed.push(source);
                None
            }
        }
    }
}

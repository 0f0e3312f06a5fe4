use crate::collectors::{storage, MetricSource, SampleError};
use crate::config::{SourcesConfig, StorageConfig};
use crate::parse::{parse_arcstats, parse_diskstats, parse_millidegrees, DiskCounters};
use crate::state::{CacheStats, DiskIo, NetworkIo, PoolStatus};
use crate::tools::ToolRunner;
use std::fs;
use std::path::Path;
use std::time::Instant;
use sysinfo::{CpuExt, NetworkExt, NetworksExt, System, SystemExt};
use tracing::debug;

const SECTOR_BYTES: f64 = 512.0;
const MIB: f64 = 1024.0 * 1024.0;

/// Live host metrics from sysinfo, procfs and sysfs, with pools from the
/// ZFS command line tools.
pub struct SystemSource<R> {
    system: System,
    runner: R,
    sources: SourcesConfig,
    storage_enabled: bool,
    smart_enabled: bool,
    last_network: Option<Instant>,
    last_disk: Option<(Instant, Vec<DiskCounters>)>,
}

impl<R: ToolRunner> SystemSource<R> {
    pub fn new(runner: R, sources: SourcesConfig, storage: &StorageConfig) -> Self {
        let mut system = System::new();
        // Primes the CPU and network counters so the first tick has a baseline.
        system.refresh_cpu();
        system.refresh_networks_list();
        Self {
            system,
            runner,
            sources,
            storage_enabled: storage.enabled,
            smart_enabled: storage.smart_enabled,
            last_network: None,
            last_disk: None,
        }
    }
}

impl<R: ToolRunner> MetricSource for SystemSource<R> {
    fn cpu_usage_percent(&mut self) -> Result<f64, SampleError> {
        self.system.refresh_cpu();
        let cpus = self.system.cpus();
        if cpus.is_empty() {
            return Ok(0.0);
        }
        let sum: f32 = cpus.iter().map(|c| c.cpu_usage()).sum();
        Ok((sum / cpus.len() as f32) as f64)
    }

    fn memory_usage_percent(&mut self) -> Result<f64, SampleError> {
        self.system.refresh_memory();
        let total = self.system.total_memory();
        if total == 0 {
            return Ok(0.0);
        }
        let used = total.saturating_sub(self.system.available_memory());
        Ok(used as f64 / total as f64 * 100.0)
    }

    fn network_io(&mut self) -> Result<NetworkIo, SampleError> {
        self.system.refresh_networks();
        let now = Instant::now();
        let Some(prev) = self.last_network.replace(now) else {
            return Ok(NetworkIo {
                speed: self.link_speed(),
                ..NetworkIo::default()
            });
        };

        let secs = now.duration_since(prev).as_secs_f64().max(0.001);
        let (received, transmitted) = self
            .system
            .networks()
            .iter()
            .filter(|(iface, _)| iface.as_str() != "lo")
            .fold((0_u64, 0_u64), |(rx, tx), (_, data)| {
                (rx + data.received(), tx + data.transmitted())
            });

        Ok(NetworkIo {
            bytes_in: (received as f64 / secs) as u64,
            bytes_out: (transmitted as f64 / secs) as u64,
            speed: self.link_speed(),
        })
    }

    fn disk_io(&mut self) -> Result<DiskIo, SampleError> {
        let text = read_source(&self.sources.diskstats_path)?;
        let current = parse_diskstats(&text);
        let now = Instant::now();

        let rates = match &self.last_disk {
            Some((prev_at, prev)) => {
                let secs = now.duration_since(*prev_at).as_secs_f64().max(0.001);
                disk_rates(prev, &current, secs)
            }
            None => DiskIo::default(),
        };
        self.last_disk = Some((now, current));
        Ok(rates)
    }

    fn temperature_celsius(&mut self) -> Result<f64, SampleError> {
        let text = read_source(&self.sources.thermal_zone_path)?;
        Ok(parse_millidegrees(&text)?)
    }

    fn cache_stats(&mut self) -> Result<CacheStats, SampleError> {
        if !self.storage_enabled {
            return Ok(CacheStats::default());
        }
        let counters = parse_arcstats(&read_source(&self.sources.arcstats_path)?)?;
        Ok(CacheStats {
            arc_size: counters.size,
            arc_hit_rate: counters.hit_rate(),
            l2arc_size: counters.l2_size,
            l2arc_hit_rate: counters.l2_hit_rate(),
        })
    }

    async fn pools(&mut self) -> Result<Vec<PoolStatus>, SampleError> {
        if !self.storage_enabled {
            return Ok(Vec::new());
        }
        storage::enumerate_pools(&self.runner, self.smart_enabled).await
    }
}

impl<R> SystemSource<R> {
    fn link_speed(&self) -> u64 {
        match link_speed_mbps(&self.sources.net_class_path) {
            Ok(speed) => speed,
            Err(err) => {
                debug!(error = %err, "link speed unavailable");
                0
            }
        }
    }
}

fn read_source(path: &Path) -> Result<String, SampleError> {
    fs::read_to_string(path).map_err(|source| SampleError::Read {
        path: path.display().to_string(),
        source,
    })
}

/// Fastest negotiated speed in Mbit/s across non-loopback interfaces.
/// Interfaces that are down report `-1` or fail to read and are ignored.
pub fn link_speed_mbps(net_class: &Path) -> Result<u64, SampleError> {
    let entries = fs::read_dir(net_class).map_err(|source| SampleError::Read {
        path: net_class.display().to_string(),
        source,
    })?;

    let fastest = entries
        .filter_map(Result::ok)
        .filter(|entry| entry.file_name() != "lo")
        .filter_map(|entry| fs::read_to_string(entry.path().join("speed")).ok())
        .filter_map(|text| text.trim().parse::<i64>().ok())
        .filter(|speed| *speed > 0)
        .max()
        .unwrap_or(0);
    Ok(fastest as u64)
}

/// Throughput between two diskstats readings taken `secs` apart. Disks that
/// appeared since the previous reading are ignored until the next one.
pub fn disk_rates(prev: &[DiskCounters], current: &[DiskCounters], secs: f64) -> DiskIo {
    if secs <= 0.0 {
        return DiskIo::default();
    }

    let mut sectors_read = 0_u64;
    let mut sectors_written = 0_u64;
    let mut ops = 0_u64;
    for disk in current {
        let Some(before) = prev.iter().find(|p| p.device == disk.device) else {
            continue;
        };
        sectors_read += disk.sectors_read.saturating_sub(before.sectors_read);
        sectors_written += disk.sectors_written.saturating_sub(before.sectors_written);
        ops += disk.reads_completed.saturating_sub(before.reads_completed);
        ops += disk.writes_completed.saturating_sub(before.writes_completed);
    }

    DiskIo {
        read_mbps: sectors_read as f64 * SECTOR_BYTES / MIB / secs,
        write_mbps: sectors_written as f64 * SECTOR_BYTES / MIB / secs,
        iops: (ops as f64 / secs) as u64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::fake::ScriptedRunner;

    fn counters(device: &str, reads: u64, sread: u64, writes: u64, swritten: u64) -> DiskCounters {
        DiskCounters {
            device: device.to_string(),
            reads_completed: reads,
            sectors_read: sread,
            writes_completed: writes,
            sectors_written: swritten,
        }
    }

    fn source_in(dir: &Path, storage_enabled: bool) -> SystemSource<ScriptedRunner> {
        let sources = SourcesConfig {
            meminfo_path: dir.join("meminfo"),
            thermal_zone_path: dir.join("temp"),
            arcstats_path: dir.join("arcstats"),
            diskstats_path: dir.join("diskstats"),
            net_class_path: dir.join("net"),
        };
        let storage = StorageConfig {
            enabled: storage_enabled,
            smart_enabled: false,
        };
        SystemSource::new(ScriptedRunner::default(), sources, &storage)
    }

    #[test]
    fn disk_rates_over_whole_disks() {
        let prev = vec![counters("sda", 100, 2048, 50, 4096)];
        let current = vec![
            counters("sda", 300, 2048 + 4096, 150, 4096 + 2048),
            counters("sdb", 999, 999, 999, 999),
        ];
        let io = disk_rates(&prev, &current, 2.0);

        assert_eq!(io.read_mbps, 4096.0 * 512.0 / MIB / 2.0);
        assert_eq!(io.write_mbps, 2048.0 * 512.0 / MIB / 2.0);
        assert_eq!(io.iops, 150);
    }

    #[test]
    fn disk_rates_tolerate_counter_reset() {
        let prev = vec![counters("sda", 500, 500, 500, 500)];
        let current = vec![counters("sda", 10, 10, 10, 10)];
        assert_eq!(disk_rates(&prev, &current, 1.0), DiskIo::default());
        assert_eq!(disk_rates(&prev, &prev, 0.0), DiskIo::default());
    }

    #[test]
    fn link_speed_takes_fastest_up_interface() {
        let dir = tempfile::tempdir().unwrap();
        for (iface, speed) in [("lo", "100000"), ("eth0", "1000"), ("eth1", "10000"), ("eth2", "-1")] {
            let path = dir.path().join(iface);
            fs::create_dir(&path).unwrap();
            fs::write(path.join("speed"), format!("{speed}\n")).unwrap();
        }
        fs::create_dir(dir.path().join("wlan0")).unwrap();

        assert_eq!(link_speed_mbps(dir.path()).unwrap(), 10000);
        assert!(link_speed_mbps(&dir.path().join("missing")).is_err());
    }

    #[test]
    fn thermal_and_cache_from_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("temp"), "47500\n").unwrap();
        fs::write(
            dir.path().join("arcstats"),
            "name type data\nhits 4 3\nmisses 4 1\nsize 4 2048\nl2_size 4 0\n",
        )
        .unwrap();

        let mut source = source_in(dir.path(), true);
        assert_eq!(source.temperature_celsius().unwrap(), 47.5);
        let cache = source.cache_stats().unwrap();
        assert_eq!(cache.arc_size, 2048);
        assert_eq!(cache.arc_hit_rate, 75.0);
        assert_eq!(cache.l2arc_hit_rate, 0.0);
    }

    #[test]
    fn missing_files_are_read_errors() {
        let dir = tempfile::tempdir().unwrap();
        let mut source = source_in(dir.path(), true);
        assert!(matches!(
            source.temperature_celsius(),
            Err(SampleError::Read { .. })
        ));
        assert!(source.cache_stats().is_err());
        assert!(source.disk_io().is_err());
    }

    #[test]
    fn first_disk_tick_reports_zero() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("diskstats");
        fs::write(&path, "   8       0 sda 100 0 2048 10 50 0 1024 5 0 20 30\n").unwrap();

        let mut source = source_in(dir.path(), true);
        assert_eq!(source.disk_io().unwrap(), DiskIo::default());

        fs::write(&path, "   8       0 sda 200 0 4096 10 80 0 2048 5 0 20 30\n").unwrap();
        let io = source.disk_io().unwrap();
        assert!(io.read_mbps > 0.0);
        assert!(io.iops > 0);
    }

    #[tokio::test]
    async fn storage_disabled_skips_zfs() {
        let dir = tempfile::tempdir().unwrap();
        let mut source = source_in(dir.path(), false);
        assert_eq!(source.cache_stats().unwrap(), CacheStats::default());
        assert!(source.pools().await.unwrap().is_empty());
        assert!(source.runner.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn pool_failure_surfaces_as_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut source = source_in(dir.path(), true);
        assert!(matches!(source.pools().await, Err(SampleError::Tool(_))));
    }

    #[test]
    fn memory_percentage_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let mut source = source_in(dir.path(), false);
        let pct = source.memory_usage_percent().unwrap();
        assert!((0.0..=100.0).contains(&pct));
    }
}

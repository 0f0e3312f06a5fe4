//! Hardware-aware tuning for ZFS and the NVMe driver.
//!
//! Directives are appended to modprobe configuration files and take effect on
//! the next module load; kernel parameters are applied live through sysctl.

use crate::config::TuningConfig;
use crate::hardware::{CpuClass, HardwareProfile};
use crate::parse::format_bytes;
use crate::tools::{ProcessRunner, ToolError, ToolRunner};
use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use thiserror::Error;
use tracing::{info, warn};

const GIB: u64 = 1024 * 1024 * 1024;
pub const MIN_ARC_BYTES: u64 = GIB;

const ZFS_MODULE_PARAMS: [&str; 7] = [
    "options zfs zfs_dirty_data_max_max=17179869184",
    "options zfs zfs_dirty_data_max=8589934592",
    "options zfs zfs_txg_timeout=5",
    "options zfs zfs_vdev_async_read_max_active=10",
    "options zfs zfs_vdev_async_write_max_active=10",
    "options zfs zfs_vdev_sync_read_max_active=10",
    "options zfs zfs_vdev_sync_write_max_active=10",
];

const ZFS_NVME_PARAMS: [&str; 2] = [
    "options zfs zfs_vdev_def_queue_depth=128",
    "options zfs metaslab_lba_weighting_enabled=0",
];

pub const KERNEL_PARAMS: [(&str, &str); 8] = [
    ("vm.dirty_ratio", "5"),
    ("vm.dirty_background_ratio", "2"),
    ("vm.dirty_expire_centisecs", "6000"),
    ("vm.dirty_writeback_centisecs", "500"),
    ("vm.swappiness", "1"),
    ("net.core.rmem_max", "16777216"),
    ("net.core.wmem_max", "16777216"),
    ("net.core.netdev_max_backlog", "5000"),
];

#[derive(Debug, Error)]
pub enum TuningError {
    #[error("failed to open {path}: {source}")]
    Open {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to write {path}: {source}")]
    Write {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to set {key}: {source}")]
    Sysctl { key: String, source: ToolError },
}

/// Lines appended, in order, to one configuration file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TuningDirective {
    pub target: PathBuf,
    pub lines: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TuningReport {
    pub lines_written: usize,
    pub lines_skipped: usize,
    pub lines_failed: usize,
    pub params_applied: usize,
    pub params_failed: usize,
}

/// 45% of memory, capped at 80% and never below 1 GiB. The floor wins on
/// machines too small for both bounds to hold.
pub fn arc_target_bytes(total_memory: u64) -> u64 {
    let target = total_memory / 100 * 45 + total_memory % 100 * 45 / 100;
    let ceiling = total_memory / 100 * 80 + total_memory % 100 * 80 / 100;
    target.min(ceiling).max(MIN_ARC_BYTES)
}

/// NVMe `(poll_queues, write_queues)` for the core count and CPU class.
pub fn queue_counts(cpu_cores: usize, cpu_class: CpuClass) -> (usize, usize) {
    let (poll_cap, write_cap) = if cpu_class.is_server() {
        (32, 32)
    } else {
        (8, 16)
    };
    ((cpu_cores / 4).min(poll_cap), (cpu_cores / 2).min(write_cap))
}

/// Writes modprobe directives and, when a runner is present, applies
/// [`KERNEL_PARAMS`] with `sysctl -w`. The runner's timeout bounds each call.
pub struct TuningEngine<R = ProcessRunner> {
    zfs_conf: PathBuf,
    nvme_conf: PathBuf,
    skip_existing: bool,
    kernel: Option<R>,
}

impl<R: ToolRunner> TuningEngine<R> {
    /// Only keeps the runner when `apply_sysctl` is set.
    pub fn from_config(cfg: &TuningConfig, runner: R) -> Self {
        Self::new(cfg, cfg.apply_sysctl.then_some(runner))
    }

    pub fn new(cfg: &TuningConfig, kernel: Option<R>) -> Self {
        Self {
            zfs_conf: cfg.zfs_conf_path.clone(),
            nvme_conf: cfg.nvme_conf_path.clone(),
            skip_existing: cfg.skip_existing,
            kernel,
        }
    }

    /// Directives derived from the profile, without touching any file.
    pub fn plan(&self, profile: &HardwareProfile) -> Vec<TuningDirective> {
        let mut plan = vec![self.cache_directive(profile)];
        if let Some(queues) = self.queue_directive(profile) {
            plan.push(queues);
        }
        plan.push(self.module_directive(profile));
        plan
    }

    pub async fn tune(&self, profile: &HardwareProfile) -> TuningReport {
        info!("starting auto-tune");
        let mut report = TuningReport::default();

        for directive in self.plan(profile) {
            self.append(&directive, &mut report);
        }
        self.apply_kernel_params(&mut report).await;

        info!(
            lines_written = report.lines_written,
            lines_skipped = report.lines_skipped,
            lines_failed = report.lines_failed,
            params_applied = report.params_applied,
            params_failed = report.params_failed,
            "auto-tune completed"
        );
        report
    }

    fn cache_directive(&self, profile: &HardwareProfile) -> TuningDirective {
        let target = arc_target_bytes(profile.total_memory_bytes);
        let minimum = target / 4;
        info!(
            arc_max = %format_bytes(target),
            arc_min = %format_bytes(minimum),
            "ARC sizing"
        );
        TuningDirective {
            target: self.zfs_conf.clone(),
            lines: vec![
                format!("options zfs zfs_arc_max={target}"),
                format!("options zfs zfs_arc_min={minimum}"),
            ],
        }
    }

    fn queue_directive(&self, profile: &HardwareProfile) -> Option<TuningDirective> {
        if !profile.has_nvme() {
            return None;
        }
        let (poll_queues, write_queues) = queue_counts(profile.cpu_cores, profile.cpu_class);
        info!(poll_queues, write_queues, "NVMe queue sizing");
        Some(TuningDirective {
            target: self.nvme_conf.clone(),
            lines: vec![
                format!("options nvme poll_queues={poll_queues}"),
                format!("options nvme write_queues={write_queues}"),
                "options nvme io_timeout=2".to_string(),
                "options nvme max_host_mem_size_mb=512".to_string(),
            ],
        })
    }

    fn module_directive(&self, profile: &HardwareProfile) -> TuningDirective {
        let mut lines: Vec<String> = ZFS_MODULE_PARAMS.iter().map(|l| l.to_string()).collect();
        if profile.has_nvme() {
            lines.extend(ZFS_NVME_PARAMS.iter().map(|l| l.to_string()));
        }
        TuningDirective {
            target: self.zfs_conf.clone(),
            lines,
        }
    }

    fn append(&self, directive: &TuningDirective, report: &mut TuningReport) {
        let path = directive.target.display().to_string();
        let existing: HashSet<String> = if self.skip_existing {
            fs::read_to_string(&directive.target)
                .map(|text| text.lines().map(str::to_string).collect())
                .unwrap_or_default()
        } else {
            HashSet::new()
        };

        let mut file = match OpenOptions::new()
            .create(true)
            .append(true)
            .open(&directive.target)
        {
            Ok(file) => file,
            Err(source) => {
                let err = TuningError::Open { path, source };
                warn!(error = %err, "skipping tuning directive");
                report.lines_failed += directive.lines.len();
                return;
            }
        };

        for line in &directive.lines {
            if existing.contains(line) {
                report.lines_skipped += 1;
                continue;
            }
            // One write per line so a failure never leaves half a directive.
            match file.write_all(format!("{line}\n").as_bytes()) {
                Ok(()) => report.lines_written += 1,
                Err(source) => {
                    let err = TuningError::Write {
                        path: path.clone(),
                        source,
                    };
                    warn!(error = %err, line = %line, "tuning line not written");
                    report.lines_failed += 1;
                }
            }
        }
    }

    async fn apply_kernel_params(&self, report: &mut TuningReport) {
        let Some(runner) = &self.kernel else {
            return;
        };
        for (key, value) in KERNEL_PARAMS {
            let assignment = format!("{key}={value}");
            match runner.run("sysctl", &["-w", &assignment]).await {
                Ok(_) => report.params_applied += 1,
                Err(source) => {
                    let err = TuningError::Sysctl {
                        key: key.to_string(),
                        source,
                    };
                    warn!(error = %err, "failed to set kernel parameter");
                    report.params_failed += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::fake::ScriptedRunner;
    use std::path::Path;
    use std::sync::Mutex;
    use std::time::{Duration, Instant};

    fn sysctl_runner(except: Option<&str>) -> ScriptedRunner {
        KERNEL_PARAMS
            .iter()
            .filter(|(key, _)| Some(*key) != except)
            .fold(ScriptedRunner::default(), |runner, (key, value)| {
                runner.with(&format!("sysctl -w {key}={value}"), "")
            })
    }

    /// Stalls on one key and then reports it as timed out, like a hung
    /// `sysctl` under `ProcessRunner`.
    struct StallingRunner {
        stall_key: &'static str,
        stall: Duration,
        calls: Mutex<Vec<String>>,
    }

    impl ToolRunner for StallingRunner {
        async fn run(&self, program: &str, args: &[&str]) -> Result<String, ToolError> {
            let line = args.join(" ");
            if let Ok(mut calls) = self.calls.lock() {
                calls.push(line.clone());
            }
            if line.contains(self.stall_key) {
                tokio::time::sleep(self.stall).await;
                return Err(ToolError::Timeout {
                    program: program.to_string(),
                    timeout_ms: self.stall.as_millis() as u64,
                });
            }
            Ok(String::new())
        }
    }

    fn tuning_cfg(dir: &Path) -> TuningConfig {
        TuningConfig {
            zfs_conf_path: dir.join("zfs.conf"),
            nvme_conf_path: dir.join("nvme.conf"),
            ..TuningConfig::default()
        }
    }

    fn profile(memory: u64, cores: usize, class: CpuClass, nvme: bool) -> HardwareProfile {
        HardwareProfile {
            cpu_cores: cores,
            cpu_class: class,
            total_memory_bytes: memory,
            nvme_devices: if nvme {
                vec!["/dev/nvme0n1".to_string()]
            } else {
                Vec::new()
            },
            ..HardwareProfile::default()
        }
    }

    #[test]
    fn arc_target_is_45_percent_when_in_range() {
        let total = 16 * GIB;
        let target = arc_target_bytes(total);
        assert_eq!(target, total * 45 / 100);
        assert!(target > MIN_ARC_BYTES && target < total * 80 / 100);
    }

    #[test]
    fn arc_target_clamps_up_to_one_gib() {
        assert_eq!(arc_target_bytes(GIB), GIB);
        assert_eq!(arc_target_bytes(0), GIB);
    }

    #[test]
    fn queue_counts_respect_class_caps() {
        assert_eq!(queue_counts(64, CpuClass::Epyc), (16, 32));
        assert_eq!(queue_counts(256, CpuClass::Xeon), (32, 32));
        assert_eq!(queue_counts(64, CpuClass::Consumer), (8, 16));
        assert_eq!(queue_counts(8, CpuClass::Consumer), (2, 4));
    }

    #[test]
    fn plan_without_nvme_skips_queue_directive() {
        let dir = tempfile::tempdir().unwrap();
        let engine = TuningEngine::<ScriptedRunner>::new(&tuning_cfg(dir.path()), None);
        let plan = engine.plan(&profile(16 * GIB, 8, CpuClass::Consumer, false));

        assert_eq!(plan.len(), 2);
        let target = 16 * GIB * 45 / 100;
        assert_eq!(
            plan[0].lines,
            vec![
                format!("options zfs zfs_arc_max={target}"),
                format!("options zfs zfs_arc_min={}", target / 4),
            ]
        );
        assert_eq!(plan[1].lines.len(), ZFS_MODULE_PARAMS.len());
        assert!(plan.iter().all(|d| d.target == dir.path().join("zfs.conf")));
    }

    #[test]
    fn plan_with_nvme_adds_queue_and_module_lines() {
        let dir = tempfile::tempdir().unwrap();
        let engine = TuningEngine::<ScriptedRunner>::new(&tuning_cfg(dir.path()), None);
        let plan = engine.plan(&profile(64 * GIB, 64, CpuClass::Epyc, true));

        assert_eq!(plan.len(), 3);
        assert_eq!(plan[1].target, dir.path().join("nvme.conf"));
        assert_eq!(
            plan[1].lines,
            vec![
                "options nvme poll_queues=16",
                "options nvme write_queues=32",
                "options nvme io_timeout=2",
                "options nvme max_host_mem_size_mb=512",
            ]
        );
        assert_eq!(plan[2].lines.len(), ZFS_MODULE_PARAMS.len() + 2);
        assert!(plan[2]
            .lines
            .contains(&"options zfs zfs_vdev_def_queue_depth=128".to_string()));
    }

    #[tokio::test]
    async fn tune_appends_and_accumulates_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = tuning_cfg(dir.path());
        let engine = TuningEngine::new(&cfg, Some(sysctl_runner(None)));
        let hw = profile(16 * GIB, 16, CpuClass::Consumer, true);

        let first = engine.tune(&hw).await;
        assert_eq!(first.lines_written, 2 + 4 + ZFS_MODULE_PARAMS.len() + 2);
        assert_eq!(first.params_applied, KERNEL_PARAMS.len());

        engine.tune(&hw).await;
        let zfs = fs::read_to_string(&cfg.zfs_conf_path).unwrap();
        let arc_lines = zfs.lines().filter(|l| l.contains("zfs_arc_max")).count();
        assert_eq!(arc_lines, 2);
        assert!(zfs.ends_with('\n'));
    }

    #[tokio::test]
    async fn skip_existing_avoids_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = TuningConfig {
            skip_existing: true,
            ..tuning_cfg(dir.path())
        };
        let engine = TuningEngine::<ScriptedRunner>::new(&cfg, None);
        let hw = profile(16 * GIB, 16, CpuClass::Consumer, false);

        engine.tune(&hw).await;
        let second = engine.tune(&hw).await;
        assert_eq!(second.lines_written, 0);
        assert_eq!(second.lines_skipped, 2 + ZFS_MODULE_PARAMS.len());

        let zfs = fs::read_to_string(&cfg.zfs_conf_path).unwrap();
        assert_eq!(zfs.lines().count(), 2 + ZFS_MODULE_PARAMS.len());
    }

    #[tokio::test]
    async fn unwritable_target_does_not_stop_other_directives() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = TuningConfig {
            nvme_conf_path: dir.path().join("missing-dir").join("nvme.conf"),
            ..tuning_cfg(dir.path())
        };
        let engine = TuningEngine::<ScriptedRunner>::new(&cfg, None);
        let report = engine.tune(&profile(16 * GIB, 16, CpuClass::Xeon, true)).await;

        assert_eq!(report.lines_failed, 4);
        assert_eq!(report.lines_written, 2 + ZFS_MODULE_PARAMS.len() + 2);
        assert!(cfg.zfs_conf_path.exists());
    }

    #[tokio::test]
    async fn kernel_param_failure_does_not_abort_the_rest() {
        let dir = tempfile::tempdir().unwrap();
        let engine = TuningEngine::new(
            &tuning_cfg(dir.path()),
            Some(sysctl_runner(Some("vm.swappiness"))),
        );
        let report = engine.tune(&profile(8 * GIB, 4, CpuClass::Consumer, false)).await;

        assert_eq!(report.params_failed, 1);
        assert_eq!(report.params_applied, KERNEL_PARAMS.len() - 1);
        let calls = engine.kernel.as_ref().unwrap().calls.lock().unwrap();
        assert_eq!(calls.len(), KERNEL_PARAMS.len());
        assert_eq!(calls[0], "sysctl -w vm.dirty_ratio=5");
    }

    #[tokio::test]
    async fn stalled_sysctl_is_counted_and_tuning_finishes() {
        let dir = tempfile::tempdir().unwrap();
        let runner = StallingRunner {
            stall_key: "vm.dirty_expire_centisecs",
            stall: Duration::from_millis(50),
            calls: Mutex::new(Vec::new()),
        };
        let engine = TuningEngine::new(&tuning_cfg(dir.path()), Some(runner));

        let started = Instant::now();
        let report = engine.tune(&profile(8 * GIB, 4, CpuClass::Consumer, false)).await;

        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(report.params_failed, 1);
        assert_eq!(report.params_applied, KERNEL_PARAMS.len() - 1);
        assert_eq!(report.lines_written, 2 + ZFS_MODULE_PARAMS.len());
        let calls = engine.kernel.as_ref().unwrap().calls.lock().unwrap();
        assert_eq!(calls.last().map(String::as_str), Some("-w net.core.netdev_max_backlog=5000"));
    }

    #[tokio::test]
    async fn from_config_drops_runner_unless_sysctl_is_enabled() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = TuningConfig {
            apply_sysctl: false,
            ..tuning_cfg(dir.path())
        };
        let engine = TuningEngine::from_config(&cfg, ScriptedRunner::default());
        let report = engine.tune(&profile(8 * GIB, 4, CpuClass::Consumer, false)).await;
        assert_eq!(report.params_applied + report.params_failed, 0);
    }
}

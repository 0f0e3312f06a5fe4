//! One-shot hardware detection feeding the tuning engine and the system
//! summary endpoints.

use crate::parse::{
    format_bytes, parse_block_devices, parse_cpu_model, parse_mem_total, ParseError,
};
use crate::state::DeviceClass;
use crate::tools::{ToolError, ToolRunner};
use serde::Serialize;
use std::fs;
use std::path::Path;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CpuClass {
    Epyc,
    Xeon,
    #[default]
    Consumer,
}

impl CpuClass {
    pub fn from_identification(text: &str) -> Self {
        if text.contains("EPYC") {
            CpuClass::Epyc
        } else if text.contains("Xeon") {
            CpuClass::Xeon
        } else {
            CpuClass::Consumer
        }
    }

    pub fn is_server(self) -> bool {
        matches!(self, CpuClass::Epyc | CpuClass::Xeon)
    }
}

#[derive(Debug, Error)]
pub enum DetectError {
    #[error(transparent)]
    Tool(#[from] ToolError),
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error(transparent)]
    Parse(#[from] ParseError),
}

/// Immutable after construction.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HardwareProfile {
    pub cpu_cores: usize,
    pub cpu_class: CpuClass,
    pub cpu_model: Option<String>,
    pub total_memory_bytes: u64,
    pub nvme_devices: Vec<String>,
    pub ssd_devices: Vec<String>,
    pub hdd_devices: Vec<String>,
}

impl HardwareProfile {
    /// Assembles a profile from the raw probe results. Each failed probe
    /// leaves its fields at their zero value and is logged.
    pub fn from_probes(
        cpu_cores: usize,
        lscpu: Result<String, DetectError>,
        meminfo: Result<String, DetectError>,
        lsblk: Result<String, DetectError>,
    ) -> Self {
        let mut profile = Self {
            cpu_cores,
            ..Self::default()
        };

        match lscpu {
            Ok(text) => {
                profile.cpu_class = CpuClass::from_identification(&text);
                profile.cpu_model = parse_cpu_model(&text);
            }
            Err(err) => warn!(source = "cpu", error = %err, "CPU identification unavailable"),
        }

        match meminfo.and_then(|text| Ok(parse_mem_total(&text)?)) {
            Ok(bytes) => profile.total_memory_bytes = bytes,
            Err(err) => warn!(source = "memory", error = %err, "total memory unavailable"),
        }

        match lsblk {
            Ok(text) => {
                for dev in parse_block_devices(&text)
                    .into_iter()
                    .filter(|d| d.kind == "disk")
                {
                    let path = format!("/dev/{}", dev.name);
                    match DeviceClass::for_block_device(&dev.name, dev.rotational) {
                        DeviceClass::Nvme => profile.nvme_devices.push(path),
                        DeviceClass::Ssd => profile.ssd_devices.push(path),
                        _ => profile.hdd_devices.push(path),
                    }
                }
            }
            Err(err) => warn!(source = "block_devices", error = %err, "block device enumeration failed"),
        }

        profile
    }

    pub fn has_nvme(&self) -> bool {
        !self.nvme_devices.is_empty()
    }

    /// Every detected device tagged with its class, NVMe first.
    pub fn devices(&self) -> Vec<(&str, DeviceClass)> {
        [
            (&self.nvme_devices, DeviceClass::Nvme),
            (&self.ssd_devices, DeviceClass::Ssd),
            (&self.hdd_devices, DeviceClass::Hdd),
        ]
        .into_iter()
        .flat_map(|(list, class)| list.iter().map(move |p| (p.as_str(), class)))
        .collect()
    }
}

/// Runs every probe once. Never fails; see [`HardwareProfile::from_probes`].
pub async fn detect<R: ToolRunner>(
    runner: &R,
    meminfo_path: &Path,
    cpu_cores: usize,
) -> HardwareProfile {
    let lscpu = runner.run("lscpu", &[]).await.map_err(DetectError::from);
    // procfs reads never block on I/O, same as the sampler's sources.
    let meminfo = fs::read_to_string(meminfo_path).map_err(|source| DetectError::Read {
            path: meminfo_path.display().to_string(),
            source,
        });
    let lsblk = runner
        .run("lsblk", &["-ndo", "NAME,ROTA,TYPE"])
        .await
        .map_err(DetectError::from);

    let profile = HardwareProfile::from_probes(cpu_cores, lscpu, meminfo, lsblk);
    info!(
        cpu_cores = profile.cpu_cores,
        cpu_class = ?profile.cpu_class,
        memory = %format_bytes(profile.total_memory_bytes),
        nvme = profile.nvme_devices.len(),
        ssd = profile.ssd_devices.len(),
        hdd = profile.hdd_devices.len(),
        "hardware detected"
    );
    profile
}

/// Host facts served by the system info endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct SystemSummary {
    pub hostname: String,
    pub kernel_version: String,
    pub cpu_model: Option<String>,
    pub cpu_cores: usize,
    pub cpu_class: CpuClass,
    pub total_ram: u64,
}

impl SystemSummary {
    pub fn new(
        profile: &HardwareProfile,
        hostname: Option<String>,
        kernel_version: Option<String>,
    ) -> Self {
        Self {
            hostname: hostname.unwrap_or_else(|| "unknown".to_string()),
            kernel_version: kernel_version.unwrap_or_else(|| "unknown".to_string()),
            cpu_model: profile.cpu_model.clone(),
            cpu_cores: profile.cpu_cores,
            cpu_class: profile.cpu_class,
            total_ram: profile.total_memory_bytes,
        }
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The single live telemetry record. Field names on the wire follow the
/// dashboard protocol (`cpu_usage`, `network_io`, `zfs_stats`, ...).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "cpu_usage")]
    pub cpu_usage_percent: f64,
    #[serde(rename = "memory_usage")]
    pub memory_usage_percent: f64,
    pub network_io: NetworkIo,
    pub disk_io: DiskIo,
    #[serde(rename = "temperature")]
    pub temperature_celsius: f64,
    #[serde(rename = "zfs_stats")]
    pub storage: StorageReport,
}

/// Throughput over the last sampling window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkIo {
    pub bytes_in: u64,
    pub bytes_out: u64,
    /// Link speed in Mbit/s of the fastest interface with a known speed.
    pub speed: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DiskIo {
    pub read_mbps: f64,
    pub write_mbps: f64,
    pub iops: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub arc_size: u64,
    pub arc_hit_rate: f64,
    pub l2arc_size: u64,
    pub l2arc_hit_rate: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageReport {
    #[serde(flatten)]
    pub cache: CacheStats,
    pub pools: Vec<PoolStatus>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolStatus {
    pub name: String,
    pub size: u64,
    pub used: u64,
    pub available: u64,
    pub health: String,
    pub fragmentation: f64,
    pub devices: Vec<DeviceStatus>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceStatus {
    #[serde(rename = "name")]
    pub path: String,
    #[serde(rename = "type")]
    pub class: DeviceClass,
    pub health: String,
    pub temperature: Option<f64>,
    pub model: Option<String>,
    pub serial: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceClass {
    Nvme,
    Ssd,
    Hdd,
    Unknown,
}

impl DeviceClass {
    /// Classification of an `lsblk` disk row: the name wins over the
    /// rotational flag for NVMe namespaces.
    pub fn for_block_device(name: &str, rotational: bool) -> Self {
        if name.contains("nvme") {
            DeviceClass::Nvme
        } else if !rotational {
            DeviceClass::Ssd
        } else {
            DeviceClass::Hdd
        }
    }

    /// Classification of a pool member. `rotational` is `None` when the
    /// lookup failed; SCSI-style `sd*` disks then default to HDD.
    pub fn for_pool_member(path: &str, rotational: Option<bool>) -> Self {
        if path.contains("nvme") {
            return DeviceClass::Nvme;
        }
        match rotational {
            Some(false) => DeviceClass::Ssd,
            Some(true) => DeviceClass::Hdd,
            None => {
                let name = path.rsplit('/').next().unwrap_or(path);
                if name.starts_with("sd") {
                    DeviceClass::Hdd
                } else {
                    DeviceClass::Unknown
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_device_classes() {
        assert_eq!(DeviceClass::for_block_device("nvme0n1", true), DeviceClass::Nvme);
        assert_eq!(DeviceClass::for_block_device("nvme0n1", false), DeviceClass::Nvme);
        assert_eq!(DeviceClass::for_block_device("sda", false), DeviceClass::Ssd);
        assert_eq!(DeviceClass::for_block_device("sda", true), DeviceClass::Hdd);
    }

    #[test]
    fn pool_member_classes() {
        assert_eq!(
            DeviceClass::for_pool_member("/dev/nvme1n1", Some(true)),
            DeviceClass::Nvme
        );
        assert_eq!(DeviceClass::for_pool_member("/dev/sdb", Some(false)), DeviceClass::Ssd);
        assert_eq!(DeviceClass::for_pool_member("/dev/sdb", None), DeviceClass::Hdd);
        assert_eq!(
            DeviceClass::for_pool_member("/dev/disk/by-id/wwn-0x5000", None),
            DeviceClass::Unknown
        );
    }

    #[test]
    fn snapshot_wire_names() {
        let snapshot = Snapshot {
            storage: StorageReport {
                cache: CacheStats {
                    arc_size: 2048,
                    ..CacheStats::default()
                },
                pools: vec![PoolStatus {
                    name: "tank".to_string(),
                    size: 10,
                    used: 4,
                    available: 6,
                    health: "ONLINE".to_string(),
                    fragmentation: 3.0,
                    devices: vec![DeviceStatus {
                        path: "/dev/sda".to_string(),
                        class: DeviceClass::Ssd,
                        health: "ONLINE".to_string(),
                        temperature: None,
                        model: None,
                        serial: None,
                    }],
                }],
            },
            ..Snapshot::default()
        };

        let value = serde_json::to_value(&snapshot).unwrap();
        assert!(value.get("cpu_usage").is_some());
        assert!(value.get("network_io").is_some());
        assert_eq!(value["zfs_stats"]["arc_size"], 2048);
        assert_eq!(value["zfs_stats"]["pools"][0]["devices"][0]["type"], "ssd");
        assert_eq!(value["zfs_stats"]["pools"][0]["devices"][0]["name"], "/dev/sda");
    }
}

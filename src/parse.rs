//! Parsers for the text emitted by `zpool`, `lsblk`, `lscpu`, `smartctl` and
//! the kernel pseudo-files the daemon reads.
//!
//! Everything here is pure: callers hand in captured stdout or file contents
//! and decide how to degrade when a parser rejects its input.

use thiserror::Error;

const KIB: f64 = 1024.0;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("invalid size '{0}': expected <number>[K|M|G|T]")]
    InvalidSize(String),
    #[error("invalid number '{0}'")]
    InvalidNumber(String),
    #[error("field '{0}' not found")]
    Missing(&'static str),
}

/// Parses a ZFS-style size such as `1.5T`, `500G` or `42`.
///
/// Suffixes are binary multiples of 1024. Anything that is not
/// `<digits>[.<digits>][K|M|G|T]` is rejected.
pub fn parse_size(input: &str) -> Result<u64, ParseError> {
    let trimmed = input.trim();
    let (number, multiplier) = match trimmed.chars().last() {
        Some('K') => (&trimmed[..trimmed.len() - 1], KIB),
        Some('M') => (&trimmed[..trimmed.len() - 1], KIB.powi(2)),
        Some('G') => (&trimmed[..trimmed.len() - 1], KIB.powi(3)),
        Some('T') => (&trimmed[..trimmed.len() - 1], KIB.powi(4)),
        _ => (trimmed, 1.0),
    };

    if !is_decimal(number) {
        return Err(ParseError::InvalidSize(input.to_string()));
    }

    let value = number
        .parse::<f64>()
        .map_err(|_| ParseError::InvalidSize(input.to_string()))?;
    Ok((value * multiplier) as u64)
}

fn is_decimal(s: &str) -> bool {
    let mut parts = s.splitn(2, '.');
    let whole = parts.next().unwrap_or_default();
    let digits = |p: &str| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit());
    match parts.next() {
        Some(frac) => digits(whole) && digits(frac),
        None => digits(whole),
    }
}

/// Formats a byte count with the largest unit that keeps the magnitude
/// below 1024. Whole bytes have no decimal place.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["KB", "MB", "GB", "TB"];

    if bytes < 1024 {
        return format!("{bytes} B");
    }

    let mut value = bytes as f64 / KIB;
    let mut unit = 0;
    while value >= KIB && unit < UNITS.len() - 1 {
        value /= KIB;
        unit += 1;
    }
    format!("{value:.1} {}", UNITS[unit])
}

/// One row of `zpool list -H -o name,size,alloc,free,health,frag`.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolListRow {
    pub name: String,
    pub size_bytes: u64,
    pub alloc_bytes: u64,
    pub free_bytes: u64,
    pub health: String,
    pub fragmentation_percent: f64,
}

/// Rows with fewer than six columns are skipped. Unparsable sizes (for
/// example `-` on a faulted pool) become zero.
pub fn parse_pool_list(text: &str) -> Vec<PoolListRow> {
    text.lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 6 {
                return None;
            }

            Some(PoolListRow {
                name: fields[0].to_string(),
                size_bytes: parse_size(fields[1]).unwrap_or(0),
                alloc_bytes: parse_size(fields[2]).unwrap_or(0),
                free_bytes: parse_size(fields[3]).unwrap_or(0),
                health: fields[4].to_string(),
                fragmentation_percent: fields[5]
                    .trim_end_matches('%')
                    .parse::<f64>()
                    .unwrap_or(0.0),
            })
        })
        .collect()
}

/// A leaf device listed in the `config:` section of `zpool status`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolMember {
    pub path: String,
    pub state: String,
}

const VDEV_GROUP_PREFIXES: [&str; 5] = ["mirror", "raidz", "draid", "spare-", "replacing-"];
const VDEV_SECTIONS: [&str; 5] = ["logs", "cache", "spares", "special", "dedup"];

// Persistent link names udev creates under /dev/disk rather than /dev.
const BY_ID_PREFIXES: [&str; 8] = [
    "ata-", "wwn-", "scsi-", "nvme-", "usb-", "virtio-", "dm-uuid-", "md-uuid-",
];
const BY_PATH_PREFIXES: [&str; 1] = ["pci-"];

/// Extracts leaf devices from `zpool status -P <pool>`, skipping the pool
/// row, vdev groups (`mirror-0`, `raidz2-1`, ...) and section headers.
///
/// Absolute paths are kept. Bare names, as printed without `-P`, are
/// resolved with [`member_device_path`].
pub fn parse_pool_members(text: &str, pool: &str) -> Vec<PoolMember> {
    let mut in_config = false;
    let mut members = Vec::new();

    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with("config:") {
            in_config = true;
            continue;
        }
        if !in_config {
            continue;
        }
        if trimmed.starts_with("errors:") {
            break;
        }

        let fields: Vec<&str> = trimmed.split_whitespace().collect();
        if fields.len() < 2 {
            continue;
        }
        let name = fields[0];
        if name == "NAME" || name == pool {
            continue;
        }
        if VDEV_SECTIONS.contains(&name) || VDEV_GROUP_PREFIXES.iter().any(|p| name.starts_with(p))
        {
            continue;
        }

        members.push(PoolMember {
            path: member_device_path(name),
            state: fields[1].to_string(),
        });
    }

    members
}

/// Device node for a pool member name. Persistent `by-id`/`by-path` link
/// names map into `/dev/disk`; kernel names such as `sda` map into `/dev`.
pub fn member_device_path(name: &str) -> String {
    if name.starts_with('/') {
        name.to_string()
    } else if BY_ID_PREFIXES.iter().any(|p| name.starts_with(p)) {
        format!("/dev/disk/by-id/{name}")
    } else if BY_PATH_PREFIXES.iter().any(|p| name.starts_with(p)) {
        format!("/dev/disk/by-path/{name}")
    } else {
        format!("/dev/{name}")
    }
}

/// One row of `lsblk -ndo NAME,ROTA,TYPE`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockDevice {
    pub name: String,
    pub rotational: bool,
    pub kind: String,
}

pub fn parse_block_devices(text: &str) -> Vec<BlockDevice> {
    text.lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 3 {
                return None;
            }
            Some(BlockDevice {
                name: fields[0].to_string(),
                rotational: fields[1] != "0",
                kind: fields[2].to_string(),
            })
        })
        .collect()
}

/// Reads `MemTotal: <n> kB` from `/proc/meminfo` and returns bytes.
pub fn parse_mem_total(text: &str) -> Result<u64, ParseError> {
    let line = text
        .lines()
        .find(|l| l.starts_with("MemTotal:"))
        .ok_or(ParseError::Missing("MemTotal"))?;

    let value = line
        .split_whitespace()
        .nth(1)
        .ok_or(ParseError::Missing("MemTotal"))?;
    let kib = value
        .parse::<u64>()
        .map_err(|_| ParseError::InvalidNumber(value.to_string()))?;
    Ok(kib.saturating_mul(1024))
}

/// `Model name:` from `lscpu`.
pub fn parse_cpu_model(text: &str) -> Option<String> {
    text.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        if key.trim() != "Model name" {
            return None;
        }
        let value = value.trim();
        (!value.is_empty()).then(|| value.to_string())
    })
}

/// Thermal zones report millidegrees Celsius.
pub fn parse_millidegrees(text: &str) -> Result<f64, ParseError> {
    let trimmed = text.trim();
    let raw = trimmed
        .parse::<f64>()
        .map_err(|_| ParseError::InvalidNumber(trimmed.to_string()))?;
    Ok(raw / 1000.0)
}

/// Cumulative counters for one whole disk from `/proc/diskstats`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiskCounters {
    pub device: String,
    pub reads_completed: u64,
    pub sectors_read: u64,
    pub writes_completed: u64,
    pub sectors_written: u64,
}

const DISKSTATS_SKIP_PREFIXES: [&str; 5] = ["loop", "ram", "zd", "dm-", "sr"];

/// Parses `/proc/diskstats`, keeping whole disks only so that partition and
/// zvol traffic is not counted twice.
pub fn parse_diskstats(text: &str) -> Vec<DiskCounters> {
    text.lines()
        .filter_map(|line| {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() < 10 {
                return None;
            }
            let device = parts[2];
            if DISKSTATS_SKIP_PREFIXES.iter().any(|p| device.starts_with(p)) {
                return None;
            }
            if is_partition(device) {
                return None;
            }

            Some(DiskCounters {
                device: device.to_string(),
                reads_completed: parts[3].parse().unwrap_or(0),
                sectors_read: parts[5].parse().unwrap_or(0),
                writes_completed: parts[7].parse().unwrap_or(0),
                sectors_written: parts[9].parse().unwrap_or(0),
            })
        })
        .collect()
}

fn is_partition(device: &str) -> bool {
    if let Some(rest) = device.strip_prefix("nvme") {
        // nvme0n1 is a namespace, nvme0n1p2 a partition.
        return rest.contains('p');
    }
    device
        .chars()
        .last()
        .map(|c| c.is_ascii_digit())
        .unwrap_or(false)
}

/// Raw counters from `/proc/spl/kstat/zfs/arcstats`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArcCounters {
    pub size: u64,
    pub hits: u64,
    pub misses: u64,
    pub l2_size: u64,
    pub l2_hits: u64,
    pub l2_misses: u64,
}

impl ArcCounters {
    pub fn hit_rate(&self) -> f64 {
        hit_rate(self.hits, self.misses)
    }

    pub fn l2_hit_rate(&self) -> f64 {
        hit_rate(self.l2_hits, self.l2_misses)
    }
}

fn hit_rate(hits: u64, misses: u64) -> f64 {
    let total = hits.saturating_add(misses);
    if total == 0 {
        return 0.0;
    }
    hits as f64 / total as f64 * 100.0
}

/// The kstat file is `name type data` rows after two header lines; the
/// header rows never match a counter name so they need no special casing.
pub fn parse_arcstats(text: &str) -> Result<ArcCounters, ParseError> {
    let mut counters = ArcCounters::default();
    let mut saw_size = false;

    for line in text.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() != 3 {
            continue;
        }
        let Ok(value) = fields[2].parse::<u64>() else {
            continue;
        };
        match fields[0] {
            "size" => {
                counters.size = value;
                saw_size = true;
            }
            "hits" => counters.hits = value,
            "misses" => counters.misses = value,
            "l2_size" => counters.l2_size = value,
            "l2_hits" => counters.l2_hits = value,
            "l2_misses" => counters.l2_misses = value,
            _ => {}
        }
    }

    if !saw_size {
        return Err(ParseError::Missing("size"));
    }
    Ok(counters)
}

/// Identity and temperature pulled from `smartctl -a`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SmartInfo {
    pub model: Option<String>,
    pub serial: Option<String>,
    pub temperature_celsius: Option<f64>,
}

pub fn parse_smartctl(text: &str) -> SmartInfo {
    let mut info = SmartInfo::default();

    for line in text.lines() {
        if line.contains("Temperature_Celsius") {
            // ID# ATTRIBUTE_NAME FLAG VALUE WORST THRESH TYPE UPDATED WHEN_FAILED RAW_VALUE
            let fields: Vec<&str> = line.split_whitespace().collect();
            if let Some(raw) = fields.get(9).and_then(|v| v.parse::<f64>().ok()) {
                info.temperature_celsius = Some(raw);
            }
            continue;
        }

        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match key.trim() {
            "Device Model" | "Model Number" | "Product" if info.model.is_none() => {
                info.model = Some(value.to_string());
            }
            "Serial Number" | "Serial number" => info.serial = Some(value.to_string()),
            "Current Drive Temperature" | "Temperature" if info.temperature_celsius.is_none() => {
                info.temperature_celsius = value
                    .split_whitespace()
                    .next()
                    .and_then(|v| v.parse::<f64>().ok());
            }
            _ => {}
        }
    }

    info
}

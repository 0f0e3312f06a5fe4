use crate::collectors::SampleError;
use crate::parse::{parse_pool_list, parse_pool_members, parse_smartctl, SmartInfo};
use crate::state::{DeviceClass, DeviceStatus, PoolStatus};
use crate::tools::{ToolError, ToolRunner};
use tracing::debug;

/// Lists every imported pool with its member devices. A failure of either
/// `zpool` call fails the whole enumeration; per-device lookups degrade.
pub async fn enumerate_pools<R: ToolRunner>(
    runner: &R,
    smart_enabled: bool,
) -> Result<Vec<PoolStatus>, SampleError> {
    let listing = runner
        .run("zpool", &["list", "-H", "-o", "name,size,alloc,free,health,frag"])
        .await?;

    let mut pools = Vec::new();
    for row in parse_pool_list(&listing) {
        // -P prints full member paths, so by-id members stay resolvable.
        let status = runner.run("zpool", &["status", "-P", &row.name]).await?;

        let mut devices = Vec::new();
        for member in parse_pool_members(&status, &row.name) {
            let rota = rotational(runner, &member.path).await;
            let class = DeviceClass::for_pool_member(&member.path, rota);
            let smart = if smart_enabled {
                smart_info(runner, &member.path).await
            } else {
                SmartInfo::default()
            };
            devices.push(DeviceStatus {
                path: member.path,
                class,
                health: member.state,
                temperature: smart.temperature_celsius,
                model: smart.model,
                serial: smart.serial,
            });
        }

        pools.push(PoolStatus {
            name: row.name,
            size: row.size_bytes,
            used: row.alloc_bytes,
            available: row.free_bytes,
            health: row.health,
            fragmentation: row.fragmentation_percent,
            devices,
        });
    }

    Ok(pools)
}

async fn rotational<R: ToolRunner>(runner: &R, path: &str) -> Option<bool> {
    if path.contains("nvme") {
        return None;
    }
    match runner.run("lsblk", &["-ndo", "ROTA", path]).await {
        Ok(out) => match out.trim() {
            "0" => Some(false),
            "1" => Some(true),
            _ => None,
        },
        Err(err) => {
            debug!(device = %path, error = %err, "rotational lookup failed");
            None
        }
    }
}

// smartctl encodes health warnings in its exit status bitmask while still
// printing a full report, so a non-zero exit is parsed too.
async fn smart_info<R: ToolRunner>(runner: &R, path: &str) -> SmartInfo {
    match runner.run("smartctl", &["-a", path]).await {
        Ok(out) | Err(ToolError::Failed { stdout: out, .. }) => parse_smartctl(&out),
        Err(err) => {
            debug!(device = %path, error = %err, "smartctl unavailable");
            SmartInfo::default()
        }
    }
}

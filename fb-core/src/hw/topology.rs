//! Kernel topology metadata for hwmon chips
//!
//! Bus address, vendor/device ids and the bound driver are read from the
//! `device` link of a hwmon directory. None of it depends on the `hwmonN`
//! number the kernel picked this boot.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::trace;

use crate::data::Chip;

/// Topology facts about one chip; absent facts stay `None`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChipTopology {
    pub bus_address: Option<String>,
    pub vendor_id: Option<String>,
    pub device_id: Option<String>,
    pub driver: Option<String>,
}

/// Source of topology metadata for a chip
#[cfg_attr(test, mockall::automock)]
pub trait TopologySource: Send + Sync {
    fn chip_topology(&self, chip: &Chip) -> ChipTopology;
}

/// Reads topology from the live sysfs device links
#[derive(Debug, Default, Clone, Copy)]
pub struct SysfsTopology;

impl TopologySource for SysfsTopology {
    fn chip_topology(&self, chip: &Chip) -> ChipTopology {
        let device_path = chip.path.join("device");
        let Ok(resolved) = fs::canonicalize(&device_path) else {
            trace!(chip = %chip.name, "No device link, chip is virtual");
            return ChipTopology::default();
        };
        let path_str = resolved.to_string_lossy();

        let bus_address = extract_i2c_address(&path_str)
            .or_else(|| extract_pci_address(&path_str))
            .or_else(|| extract_platform_address(&path_str))
            .or_else(|| {
                resolved
                    .file_name()
                    .map(|n| format!("device:{}", n.to_string_lossy()))
            });

        let driver = fs::canonicalize(device_path.join("driver"))
            .ok()
            .and_then(|p| p.file_name().map(|n| n.to_string_lossy().to_string()));

        ChipTopology {
            bus_address,
            vendor_id: read_id_attr(&device_path, "vendor"),
            device_id: read_id_attr(&device_path, "device"),
            driver,
        }
    }
}

/// Deepest PCI address in a device path, e.g. `0000:03:00.0`
fn extract_pci_address(path: &str) -> Option<String> {
    let pci_addr_pattern =
        regex::Regex::new(r"([0-9a-fA-F]{4}:[0-9a-fA-F]{2}:[0-9a-fA-F]{2}\.[0-9a-fA-F])").ok()?;
    pci_addr_pattern
        .captures_iter(path)
        .last()
        .map(|c| format!("pci:{}", c[1].to_lowercase()))
}

/// I2C client address, e.g. `i2c-0:0x2d`
fn extract_i2c_address(path: &str) -> Option<String> {
    let i2c_pattern = regex::Regex::new(r"i2c-(\d+)/(\d+)-([0-9a-fA-F]{4})").ok()?;
    let caps = i2c_pattern.captures_iter(path).last()?;
    let bus: u32 = caps[1].parse().ok()?;
    let addr = u16::from_str_radix(&caps[3], 16).ok()?;
    Some(format!("i2c-{}:0x{:02x}", bus, addr))
}

/// Platform device name, e.g. `platform:nct6775.656`
fn extract_platform_address(path: &str) -> Option<String> {
    let (_, rest) = path.rsplit_once("/platform/")?;
    let name = rest.split('/').next().filter(|s| !s.is_empty())?;
    Some(format!("platform:{}", name))
}

fn read_id_attr(device_path: &Path, attr: &str) -> Option<String> {
    fs::read_to_string(device_path.join(attr))
        .ok()
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
}

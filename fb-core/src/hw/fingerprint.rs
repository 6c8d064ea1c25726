//! Hardware fingerprints
//!
//! A fingerprint names one channel by what it is attached to (bus address,
//! vendor/device ids, driver, chip model) plus its kind and index inside the
//! chip. It never contains a filesystem path: `hwmonN` numbers are handed out
//! in probe order and change across boots.
//!
//! Matching is exact equality on every field. Channels that cannot be told
//! apart (two identical chips with no bus information) are excluded from the
//! inventory rather than guessed at.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tracing::{debug, warn};

use crate::data::{
    ChannelKind, Chip, FanChannel, HardwareSnapshot, PwmChannel, TemperatureChannel,
};
use crate::error::{FanbindError, Result};
use crate::hw::topology::{ChipTopology, TopologySource};

/// Stable structural identity of one hwmon channel
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct HardwareFingerprint {
    pub bus_address: Option<String>,
    pub vendor_id: Option<String>,
    pub device_id: Option<String>,
    pub driver: Option<String>,
    pub chip_model: String,
    pub kind: ChannelKind,
    pub channel_index: u32,
}

impl HardwareFingerprint {
    /// SHA-256 hex digest of every field, usable as a persistence key
    pub fn stable_id(&self) -> String {
        let mut hasher = Sha256::new();
        for field in [
            &self.bus_address,
            &self.vendor_id,
            &self.device_id,
            &self.driver,
        ] {
            hasher.update(field.as_deref().unwrap_or("~").as_bytes());
            hasher.update(b"|");
        }
        hasher.update(self.chip_model.as_bytes());
        hasher.update(b"|");
        hasher.update(self.kind.prefix().as_bytes());
        hasher.update(self.channel_index.to_le_bytes());

        hasher
            .finalize()
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect()
    }

    /// Whether both fingerprints belong to the same physical chip
    pub fn same_chip(&self, other: &HardwareFingerprint) -> bool {
        self.bus_address == other.bus_address
            && self.vendor_id == other.vendor_id
            && self.device_id == other.device_id
            && self.driver == other.driver
            && self.chip_model == other.chip_model
    }
}

impl fmt::Display for HardwareFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{}/{}{}",
            self.chip_model,
            self.bus_address.as_deref().unwrap_or("-"),
            self.kind.prefix(),
            self.channel_index
        )
    }
}

/// Broad chip family, used for presentation and heuristics only
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChipClass {
    Cpu,
    Gpu,
    SuperIo,
    EmbeddedController,
    Storage,
    AcpiThermal,
    Unknown,
}

/// Classify a chip from its model string and bound driver
pub fn classify_chip(chip_model: &str, driver: Option<&str>) -> ChipClass {
    let name = chip_model.to_lowercase();
    let driver = driver.map(str::to_lowercase).unwrap_or_default();
    let any = |needles: &[&str]| {
        needles
            .iter()
            .any(|n| name.contains(n) || driver.contains(n))
    };

    if any(&["coretemp", "k10temp", "k8temp", "zenpower"]) {
        ChipClass::Cpu
    } else if any(&["amdgpu", "radeon", "nouveau", "nvidia", "i915"]) {
        ChipClass::Gpu
    } else if any(&["thinkpad", "dell_smm", "dell-smm", "hp-wmi", "asus-ec", "applesmc"]) {
        ChipClass::EmbeddedController
    } else if any(&["nct", "it87", "it86", "w83", "f71", "sch5", "pc87", "adt", "emc"]) {
        ChipClass::SuperIo
    } else if any(&["nvme", "drivetemp"]) {
        ChipClass::Storage
    } else if any(&["acpitz", "thermal"]) {
        ChipClass::AcpiThermal
    } else {
        ChipClass::Unknown
    }
}

/// Identity shared by every channel of one chip
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChipIdentity {
    pub topology: ChipTopology,
    pub chip_model: String,
    pub class: ChipClass,
}

impl ChipIdentity {
    pub fn channel(&self, kind: ChannelKind, channel_index: u32) -> HardwareFingerprint {
        HardwareFingerprint {
            bus_address: self.topology.bus_address.clone(),
            vendor_id: self.topology.vendor_id.clone(),
            device_id: self.topology.device_id.clone(),
            driver: self.topology.driver.clone(),
            chip_model: self.chip_model.clone(),
            kind,
            channel_index,
        }
    }
}

/// Derives fingerprints from chips plus topology metadata
pub struct Fingerprinter<'a> {
    topology: &'a dyn TopologySource,
}

impl<'a> Fingerprinter<'a> {
    pub fn new(topology: &'a dyn TopologySource) -> Self {
        Self { topology }
    }

    pub fn chip_identity(&self, chip: &Chip) -> ChipIdentity {
        let topology = self.topology.chip_topology(chip);
        let class = classify_chip(&chip.name, topology.driver.as_deref());
        ChipIdentity {
            topology,
            chip_model: chip.name.clone(),
            class,
        }
    }

    pub fn fingerprint(&self, chip: &Chip, kind: ChannelKind, channel_index: u32) -> HardwareFingerprint {
        self.chip_identity(chip).channel(kind, channel_index)
    }

    /// Index every channel of a snapshot by fingerprint
    pub fn inventory(&self, snapshot: &HardwareSnapshot) -> HardwareInventory {
        let mut inventory = HardwareInventory {
            snapshot: snapshot.clone(),
            ..HardwareInventory::default()
        };

        for chip in &snapshot.chips {
            let identity = self.chip_identity(chip);
            debug!(chip = %chip.name, class = ?identity.class, bus = ?identity.topology.bus_address, "Fingerprinted chip");

            for temp in &chip.temperatures {
                let fp = identity.channel(ChannelKind::Temp, temp.index);
                insert_unique(&mut inventory.temps, &mut inventory.duplicates, fp, temp.clone());
            }
            for fan in &chip.fans {
                let fp = identity.channel(ChannelKind::Fan, fan.index);
                insert_unique(&mut inventory.fans, &mut inventory.duplicates, fp, fan.clone());
            }
            for pwm in &chip.pwms {
                let fp = identity.channel(ChannelKind::Pwm, pwm.index);
                insert_unique(&mut inventory.pwms, &mut inventory.duplicates, fp, pwm.clone());
            }
            inventory.classes.insert(identity.chip_model.clone(), identity.class);
        }

        for fp in &inventory.duplicates {
            warn!(fingerprint = %fp, "Indistinguishable channels share a fingerprint, excluding them");
        }
        inventory
    }
}

fn insert_unique<T>(
    map: &mut BTreeMap<HardwareFingerprint, T>,
    duplicates: &mut BTreeSet<HardwareFingerprint>,
    fp: HardwareFingerprint,
    channel: T,
) {
    if duplicates.contains(&fp) {
        return;
    }
    if map.remove(&fp).is_some() {
        duplicates.insert(fp);
    } else {
        map.insert(fp, channel);
    }
}

/// Snapshot channels indexed by fingerprint
#[derive(Debug, Clone, Default)]
pub struct HardwareInventory {
    pub snapshot: HardwareSnapshot,
    temps: BTreeMap<HardwareFingerprint, TemperatureChannel>,
    fans: BTreeMap<HardwareFingerprint, FanChannel>,
    pwms: BTreeMap<HardwareFingerprint, PwmChannel>,
    duplicates: BTreeSet<HardwareFingerprint>,
    classes: BTreeMap<String, ChipClass>,
}

impl HardwareInventory {
    pub fn resolve_temperature(&self, fp: &HardwareFingerprint) -> Result<&TemperatureChannel> {
        self.check_duplicate(fp)?;
        self.temps.get(fp).ok_or_else(|| not_present(fp))
    }

    pub fn resolve_fan(&self, fp: &HardwareFingerprint) -> Result<&FanChannel> {
        self.check_duplicate(fp)?;
        self.fans.get(fp).ok_or_else(|| not_present(fp))
    }

    pub fn resolve_pwm(&self, fp: &HardwareFingerprint) -> Result<&PwmChannel> {
        self.check_duplicate(fp)?;
        self.pwms.get(fp).ok_or_else(|| not_present(fp))
    }

    pub fn temperatures(&self) -> impl Iterator<Item = (&HardwareFingerprint, &TemperatureChannel)> {
        self.temps.iter()
    }

    pub fn fans(&self) -> impl Iterator<Item = (&HardwareFingerprint, &FanChannel)> {
        self.fans.iter()
    }

    pub fn pwms(&self) -> impl Iterator<Item = (&HardwareFingerprint, &PwmChannel)> {
        self.pwms.iter()
    }

    pub fn duplicates(&self) -> &BTreeSet<HardwareFingerprint> {
        &self.duplicates
    }

    pub fn chip_class(&self, chip_model: &str) -> ChipClass {
        self.classes.get(chip_model).copied().unwrap_or(ChipClass::Unknown)
    }

    fn check_duplicate(&self, fp: &HardwareFingerprint) -> Result<()> {
        if self.duplicates.contains(fp) {
            return Err(FanbindError::DuplicateFingerprint(fp.to_string()));
        }
        Ok(())
    }
}

fn not_present(fp: &HardwareFingerprint) -> FanbindError {
    FanbindError::HardwareNotFound(format!("{} is not present", fp))
}

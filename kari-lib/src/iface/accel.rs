//! Kernel-bypass acceleration capability.
//!
//! Acceleration is probed at interface init: the prerequisites are a bound
//! userspace PCI driver, reserved huge pages, and a bypass runtime compiled
//! in (the `accel` feature). When any prerequisite is missing the interface
//! transparently degrades to the optimized raw path and reclassifies itself;
//! consumers never branch on the transport, they call `send_batch`
//! polymorphically.

use serde::Serialize;
use std::path::Path;

pub const DEFAULT_TX_DESCRIPTORS: u16 = 1024;
pub const DEFAULT_RX_DESCRIPTORS: u16 = 1024;

#[derive(Debug, Clone, Copy, Serialize)]
pub struct AccelCapability {
    pub driver_present: bool,
    pub hugepages_reserved: bool,
    pub runtime_linked: bool,
}

impl AccelCapability {
    pub fn available(&self) -> bool {
        self.driver_present && self.hugepages_reserved && self.runtime_linked
    }
}

/// Inspects the host for bypass prerequisites.
pub fn probe() -> AccelCapability {
    let driver_present = Path::new("/sys/bus/pci/drivers/vfio-pci").exists()
        || Path::new("/sys/bus/pci/drivers/igb_uio").exists();
    let hugepages_reserved = hugepages_reserved();
    AccelCapability {
        driver_present,
        hugepages_reserved,
        runtime_linked: cfg!(feature = "accel"),
    }
}

pub fn acceleration_available() -> bool {
    probe().available()
}

fn hugepages_reserved() -> bool {
    let Ok(meminfo) = std::fs::read_to_string("/proc/meminfo") else {
        return false;
    };
    meminfo.lines().any(|line| {
        line.strip_prefix("HugePages_Total:")
            .and_then(|rest| rest.trim().parse::<u64>().ok())
            .is_some_and(|total| total > 0)
    })
}

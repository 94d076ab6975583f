//! Capability gate for fused attention kernels.
//!
//! A fused kernel is only usable when the device belongs to the hardware
//! generation it was built for and the vendor math library it links against
//! is installed. An unsupported device means the comparison is skipped, never
//! failed.

use std::{env, fmt};

use candle_core::{Device, DeviceLocation};

/// Version string reported when the math library is absent.
pub const LIBRARY_NOT_INSTALLED: &str = "False";

/// Environment variable overriding the math library version seen by [`CandleProbe`].
pub const MATH_LIBRARY_ENV: &str = "ATTN_CHECK_MATH_LIBRARY";

/// Version of the tiled kernel bundled with this crate.
pub const BUNDLED_LIBRARY_VERSION: &str = concat!("tiled-", env!("CARGO_PKG_VERSION"));

/// Hardware generations a kernel may target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceGeneration {
    Cpu,
    Cuda,
    Metal,
    Xpu1,
    Xpu2,
    Xpu3,
}

impl fmt::Display for DeviceGeneration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeviceGeneration::Cpu => "CPU",
            DeviceGeneration::Cuda => "CUDA",
            DeviceGeneration::Metal => "Metal",
            DeviceGeneration::Xpu1 => "XPU1",
            DeviceGeneration::Xpu2 => "XPU2",
            DeviceGeneration::Xpu3 => "XPU3",
        };
        f.write_str(name)
    }
}

/// What a fused kernel needs from the machine it runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelRequirement {
    pub generation: DeviceGeneration,
    pub library: &'static str,
}

impl KernelRequirement {
    /// Reason reported when the requirement is not met.
    pub fn skip_reason(&self) -> String {
        format!("only available on {} with {}", self.generation, self.library)
    }
}

/// Third-generation XPU with the XHPC math library.
pub const XPU3_XHPC: KernelRequirement = KernelRequirement {
    generation: DeviceGeneration::Xpu3,
    library: "XHPC",
};

/// Host CPU with the bundled tiled kernel.
pub const CPU_TILED: KernelRequirement = KernelRequirement {
    generation: DeviceGeneration::Cpu,
    library: "tiled",
};

/// Source of hardware facts consulted by the gate.
pub trait DeviceProbe {
    fn generation(&self) -> DeviceGeneration;

    /// Installed math library version, [`LIBRARY_NOT_INSTALLED`] when absent.
    fn math_library_version(&self) -> String;
}

/// Gate verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Capability {
    Supported,
    Unsupported { reason: String },
}

impl Capability {
    pub fn is_supported(&self) -> bool {
        matches!(self, Capability::Supported)
    }
}

/// Whether a kernel with `requirement` may run on the probed device.
pub fn is_flash_attention_supported(probe: &dyn DeviceProbe, requirement: &KernelRequirement) -> bool {
    if probe.generation() != requirement.generation {
        return false;
    }
    probe.math_library_version() != LIBRARY_NOT_INSTALLED
}

pub fn check(probe: &dyn DeviceProbe, requirement: &KernelRequirement) -> Capability {
    if is_flash_attention_supported(probe, requirement) {
        Capability::Supported
    } else {
        log::debug!(
            "capability gate rejected: device={} library={} required={:?}",
            probe.generation(),
            probe.math_library_version(),
            requirement
        );
        Capability::Unsupported {
            reason: requirement.skip_reason(),
        }
    }
}

/// Probe backed by a candle device.
///
/// CPU devices report the bundled tiled kernel; accelerators report no math
/// library since none ships with this crate. Set [`MATH_LIBRARY_ENV`] to
/// override the reported version, e.g. `False` to force a skip.
#[derive(Debug, Clone)]
pub struct CandleProbe {
    device: Device,
}

impl CandleProbe {
    pub fn new(device: Device) -> Self {
        Self { device }
    }
}

impl DeviceProbe for CandleProbe {
    fn generation(&self) -> DeviceGeneration {
        match self.device.location() {
            DeviceLocation::Cpu => DeviceGeneration::Cpu,
            DeviceLocation::Cuda { .. } => DeviceGeneration::Cuda,
            DeviceLocation::Metal { .. } => DeviceGeneration::Metal,
        }
    }

    fn math_library_version(&self) -> String {
        if let Ok(version) = env::var(MATH_LIBRARY_ENV) {
            return version;
        }
        match self.device.location() {
            DeviceLocation::Cpu if cfg!(feature = "fused") => BUNDLED_LIBRARY_VERSION.to_string(),
            _ => LIBRARY_NOT_INSTALLED.to_string(),
        }
    }
}

/// Probe returning fixed answers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticProbe {
    pub generation: DeviceGeneration,
    pub library_version: String,
}

impl StaticProbe {
    pub fn new(generation: DeviceGeneration, library_version: impl Into<String>) -> Self {
        Self {
            generation,
            library_version: library_version.into(),
        }
    }
}

impl DeviceProbe for StaticProbe {
    fn generation(&self) -> DeviceGeneration {
        self.generation
    }

    fn math_library_version(&self) -> String {
        self.library_version.clone()
    }
}

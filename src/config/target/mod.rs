use std::fmt;

use serde::{Deserialize, Serialize};

use crate::diagnostic::Diagnostic;

/// Graphics IP generation of the target GPU.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GfxIpVersion {
    pub major: u32,
    pub minor: u32,
    #[serde(default)]
    pub stepping: u32,
}

impl GfxIpVersion {
    pub const fn new(major: u32, minor: u32, stepping: u32) -> Self {
        Self {
            major,
            minor,
            stepping,
        }
    }

    /// Parse either the `gfxMmS` processor form (`gfx1030`, `gfx1100`) or a
    /// dotted `major.minor[.stepping]` form.
    pub fn parse(text: &str) -> Result<Self, Diagnostic> {
        let err = || {
            Diagnostic::configuration(format!("invalid graphics IP version '{}'", text))
                .with_help("expected e.g. 'gfx1030' or '10.3'".to_string())
        };

        if let Some(digits) = text.strip_prefix("gfx") {
            // gfxMMms: two-digit major, then single minor and stepping digits
            if digits.len() != 4 || !digits.bytes().all(|b| b.is_ascii_digit()) {
                return Err(err());
            }
            let major = digits[..2].parse().map_err(|_| err())?;
            let minor = digits[2..3].parse().map_err(|_| err())?;
            let stepping = digits[3..].parse().map_err(|_| err())?;
            return Ok(Self::new(major, minor, stepping));
        }

        let mut parts = text.split('.');
        let major = parts.next().and_then(|p| p.parse().ok()).ok_or_else(err)?;
        let minor = parts.next().and_then(|p| p.parse().ok()).ok_or_else(err)?;
        let stepping = match parts.next() {
            Some(p) => p.parse().map_err(|_| err())?,
            None => 0,
        };
        if parts.next().is_some() {
            return Err(err());
        }
        Ok(Self::new(major, minor, stepping))
    }
}

impl fmt::Display for GfxIpVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gfx{}.{}.{}", self.major, self.minor, self.stepping)
    }
}

/// Hardware queries needed by the lowering.
///
/// Every hardware constant the lowering depends on lives here so that
/// supporting a new generation is a one-place change.
#[derive(Clone, Copy, Debug)]
pub struct TargetInfo {
    pub gfx_ip: GfxIpVersion,
    pub wave_size: u32,
}

/// First generation with NGG primitive shaders, which mesh shaders run on.
const MIN_MESH_GFX_IP: GfxIpVersion = GfxIpVersion::new(10, 1, 0);

/// First generation supporting per-primitive variable rate shading.
const MIN_VRS_GFX_IP: GfxIpVersion = GfxIpVersion::new(10, 3, 0);

impl TargetInfo {
    pub fn new(gfx_ip: GfxIpVersion, wave_size: u32) -> Self {
        Self { gfx_ip, wave_size }
    }

    pub fn supports_mesh_shader(&self) -> bool {
        self.gfx_ip >= MIN_MESH_GFX_IP
    }

    pub fn supports_primitive_shading_rate(&self) -> bool {
        self.gfx_ip >= MIN_VRS_GFX_IP
    }

    /// LDS available to one workgroup, in bytes.
    pub fn lds_size_per_workgroup(&self) -> u32 {
        64 * 1024
    }

    /// Upper bound on both `max_vertices` and `max_primitives`.
    pub fn max_mesh_outputs(&self) -> u32 {
        256
    }

    /// Upper bound on the flattened workgroup size of task and mesh shaders.
    pub fn max_workgroup_threads(&self) -> u32 {
        1024
    }

    pub fn is_valid_wave_size(wave_size: u32) -> bool {
        wave_size == 32 || wave_size == 64
    }
}

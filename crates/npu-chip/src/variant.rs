// SPDX-License-Identifier: AGPL-3.0-only

//! Chip variants and the capabilities the driver core depends on.
//!
//! The product id lives in the top half of the `VERSION` register of core 0.

/// Product ids (high 16 bits of `VERSION`).
pub mod product_id {
    /// Single-core part, no job-cancel register.
    pub const LITE: u16 = 0x4E31;
    /// Dual-core part, no job-cancel register.
    pub const DUO: u16 = 0x4E32;
    /// Three-core part with job cancel.
    pub const TRIO: u16 = 0x4E33;
    /// Four-core part with job cancel.
    pub const QUAD: u16 = 0x4E34;
}

/// All known product ids.
pub const ALL_PRODUCT_IDS: &[u16] = &[
    product_id::LITE,
    product_id::DUO,
    product_id::TRIO,
    product_id::QUAD,
];

/// Wait-link entries a core can hold in hardware.
pub const MAX_WAIT_LINK_DEPTH: usize = 16;

/// Chip variant identified at bring-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChipVariant {
    /// One core.
    Lite,
    /// Two cores.
    Duo,
    /// Three cores, job cancel.
    Trio,
    /// Four cores, job cancel.
    Quad,
    /// Unknown / future product id.
    Unknown(u16),
}

impl ChipVariant {
    /// Identify the variant from a raw `VERSION` register value.
    #[must_use]
    pub const fn from_version(version: u32) -> Self {
        #[allow(clippy::cast_possible_truncation)]
        let id = (version >> 16) as u16;
        match id {
            product_id::LITE => Self::Lite,
            product_id::DUO => Self::Duo,
            product_id::TRIO => Self::Trio,
            product_id::QUAD => Self::Quad,
            other => Self::Unknown(other),
        }
    }

    /// `VERSION` register value for this variant at revision `rev`.
    #[must_use]
    pub const fn version_word(&self, rev: u16) -> u32 {
        let id = match self {
            Self::Lite => product_id::LITE,
            Self::Duo => product_id::DUO,
            Self::Trio => product_id::TRIO,
            Self::Quad => product_id::QUAD,
            Self::Unknown(id) => *id,
        };
        ((id as u32) << 16) | rev as u32
    }

    /// Core count for this variant.
    #[must_use]
    pub const fn core_count(&self) -> u8 {
        match self {
            Self::Lite | Self::Unknown(_) => 1,
            Self::Duo => 2,
            Self::Trio => 3,
            Self::Quad => 4,
        }
    }

    /// Whether the `JOB_CANCEL` register is implemented.
    #[must_use]
    pub const fn has_job_cancel(&self) -> bool {
        matches!(self, Self::Trio | Self::Quad)
    }

    /// Variant with `cores` cores, if one exists.
    #[must_use]
    pub const fn with_cores(cores: u8) -> Option<Self> {
        match cores {
            1 => Some(Self::Lite),
            2 => Some(Self::Duo),
            3 => Some(Self::Trio),
            4 => Some(Self::Quad),
            _ => None,
        }
    }
}

impl std::fmt::Display for ChipVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Lite => write!(f, "NPU-Lite (1 core)"),
            Self::Duo => write!(f, "NPU-Duo (2 cores)"),
            Self::Trio => write!(f, "NPU-Trio (3 cores)"),
            Self::Quad => write!(f, "NPU-Quad (4 cores)"),
            Self::Unknown(id) => write!(f, "unknown product {id:#06x}"),
        }
    }
}

// SPDX-License-Identifier: MPL-2.0

//! Run-time and format-time parameters.

use serde::{Deserialize, Serialize};

use crate::prelude::*;

/// Parameters of a running [`crate::Cbe`].
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Channels per module, i.e., how many requests each module keeps in
    /// flight.
    pub nr_of_channels: usize,
    /// Metadata blocks held by the cache.
    pub cache_capacity: usize,
    /// PBAs added to the free tree per extension step.
    pub ft_extension_step: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            nr_of_channels: 4,
            cache_capacity: 256,
            ft_extension_step: 64,
        }
    }
}

impl Config {
    /// Parses a TOML document. Missing keys take their defaults.
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|err| {
            warn!("invalid configuration: {}", err);
            Error::with_msg(InvalidArgs, "invalid configuration")
        })?;
        if config.nr_of_channels == 0 || config.cache_capacity == 0 {
            return_errno_with_msg!(InvalidArgs, "channels and cache capacity must be non-zero");
        }
        Ok(config)
    }
}

/// The shape of a new device, fixed when it is formatted.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Geometry {
    /// Fan-out of the VBD tree, a power of two in `[2, 64]`.
    pub degree: u32,
    /// Client-visible blocks.
    pub nr_of_leaves: u64,
    /// Blocks managed by the free tree, including the initial inner nodes.
    pub nr_of_pbas: u64,
}

impl Default for Geometry {
    fn default() -> Self {
        Self {
            degree: 64,
            nr_of_leaves: 4096,
            nr_of_pbas: 8192,
        }
    }
}

impl Geometry {
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|err| {
            warn!("invalid geometry: {}", err);
            Error::with_msg(InvalidArgs, "invalid geometry")
        })
    }
}

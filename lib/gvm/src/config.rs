// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Address-space manager configuration.
//!
//! Values are layered, lowest priority first:
//!   1. Built-in defaults.
//!   2. Optional TOML file pointed to by `DYN_GVM_CONFIG_PATH`.
//!   3. Environment variables prefixed with `DYN_GVM_` (e.g. `DYN_GVM_RESERVE_START`).
//!
//! Addresses may be given as decimal integers or `0x`-prefixed hex strings.

use anyhow::Result;
use derive_builder::Builder;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Deserializer, Serialize};
use validator::{Validate, ValidationError};

/// Path of an optional TOML file with overrides.
pub const DYN_GVM_CONFIG_PATH: &str = "DYN_GVM_CONFIG_PATH";
/// Start of the reservation window.
pub const DYN_GVM_RESERVE_START: &str = "DYN_GVM_RESERVE_START";
/// End (exclusive) of the reservation window.
pub const DYN_GVM_RESERVE_END: &str = "DYN_GVM_RESERVE_END";
/// Reject an unknown platform capability in `initialize`.
pub const DYN_GVM_REQUIRE_CAPABILITY: &str = "DYN_GVM_REQUIRE_CAPABILITY";

const ENV_PREFIX: &str = "DYN_GVM_";

/// Default start of the reservation window (40 TiB)
pub const DEFAULT_RESERVE_START: u64 = 0x2800_0000_0000;

/// Default end of the reservation window (168 TiB)
pub const DEFAULT_RESERVE_END: u64 = 0xA800_0000_0000;

/// Configuration of a [`crate::VaRegistry`].
#[derive(Serialize, Deserialize, Validate, Debug, Builder, Clone, PartialEq, Eq)]
#[builder(build_fn(private, name = "build_internal"), derive(Debug))]
#[validate(schema(function = "validate_reserve_window"))]
pub struct GvmConfig {
    /// First address handed out by `alloc_reserve_gva`.
    /// Set this at runtime with environment variable DYN_GVM_RESERVE_START.
    #[validate(range(min = 1))]
    #[builder(default = "DEFAULT_RESERVE_START")]
    #[serde(deserialize_with = "deserialize_addr")]
    pub reserve_start: u64,

    /// One past the last address handed out by `alloc_reserve_gva`.
    /// Set this at runtime with environment variable DYN_GVM_RESERVE_END.
    #[builder(default = "DEFAULT_RESERVE_END")]
    #[serde(deserialize_with = "deserialize_addr")]
    pub reserve_end: u64,

    /// When true, `initialize` refuses [`crate::Capability::Unknown`].
    #[builder(default = "false")]
    pub require_capability: bool,
}

impl Default for GvmConfig {
    fn default() -> Self {
        Self {
            reserve_start: DEFAULT_RESERVE_START,
            reserve_end: DEFAULT_RESERVE_END,
            require_capability: false,
        }
    }
}

impl GvmConfig {
    pub fn builder() -> GvmConfigBuilder {
        GvmConfigBuilder::default()
    }

    pub(crate) fn figment() -> Figment {
        let mut figment = Figment::new().merge(Serialized::defaults(GvmConfig::default()));

        match std::env::var(DYN_GVM_CONFIG_PATH) {
            Ok(path) if !path.is_empty() => figment = figment.merge(Toml::file(path)),
            _ => {}
        }

        figment.merge(Env::prefixed(ENV_PREFIX).filter_map(|k| {
            let full_key = format!("{ENV_PREFIX}{}", k.as_str());
            // filters out empty environment variables
            match std::env::var(&full_key) {
                Ok(v) if !v.is_empty() => Some(k.into()),
                _ => None,
            }
        }))
    }

    /// Load the configuration from defaults, the optional TOML file and the
    /// environment, then validate it.
    pub fn from_settings() -> Result<GvmConfig> {
        let config: GvmConfig = Self::figment().extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Size of the reservation window in bytes, 0 for an inverted window.
    pub fn reserve_window(&self) -> u64 {
        self.reserve_end.saturating_sub(self.reserve_start)
    }
}

impl GvmConfigBuilder {
    /// Build and validate the configuration
    pub fn build(&self) -> Result<GvmConfig> {
        let config = self.build_internal()?;
        config.validate()?;
        Ok(config)
    }
}

fn validate_reserve_window(config: &GvmConfig) -> std::result::Result<(), ValidationError> {
    if config.reserve_start >= config.reserve_end {
        let mut err = ValidationError::new("reserve_window");
        err.message = Some("reserve_start must be below reserve_end".into());
        return Err(err);
    }
    Ok(())
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawAddr {
    Int(u64),
    Str(String),
}

fn deserialize_addr<'de, D>(deserializer: D) -> std::result::Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    match RawAddr::deserialize(deserializer)? {
        RawAddr::Int(v) => Ok(v),
        RawAddr::Str(s) => parse_addr(&s).map_err(serde::de::Error::custom),
    }
}

/// Parse an address given either as decimal or as `0x`-prefixed hex.
pub fn parse_addr(val: &str) -> Result<u64> {
    let val = val.trim().replace('_', "");
    let parsed = match val
        .strip_prefix("0x")
        .or_else(|| val.strip_prefix("0X"))
    {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => val.parse::<u64>(),
    };
    parsed.map_err(|e| anyhow::anyhow!("Invalid address value '{}': {}", val, e))
}

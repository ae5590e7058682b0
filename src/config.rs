//! JIT Memory Configuration
//!
//! One real tunable (the region size, fixed at initialization) plus the
//! activation profile and the default activation wait. Read from the `[jit]`
//! table of a TOML file and optionally overridden from the environment.
//!
//! ```toml
//! [jit]
//! region_size = 67108864          # bytes, default 64 MiB
//! profile = "deferred"            # or "immediate"
//! activation_timeout_ms = 5000    # omit to wait without bound
//! ```
//!
//! Environment overrides: `DUALJIT_REGION_SIZE`, `DUALJIT_PROFILE`,
//! `DUALJIT_ACTIVATION_TIMEOUT_MS`.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{JitMemoryError, JitMemoryResult};
use crate::memory::DEFAULT_REGION_SIZE;

pub const ENV_REGION_SIZE: &str = "DUALJIT_REGION_SIZE";
pub const ENV_PROFILE: &str = "DUALJIT_PROFILE";
pub const ENV_ACTIVATION_TIMEOUT_MS: &str = "DUALJIT_ACTIVATION_TIMEOUT_MS";

/// Whether JIT needs an external grant before it may be used
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivationProfile {
    /// JIT must be granted through the activation handshake
    #[default]
    Deferred,

    /// A successfully created region is immediately usable
    Immediate,
}

impl std::str::FromStr for ActivationProfile {
    type Err = JitMemoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "deferred" => Ok(ActivationProfile::Deferred),
            "immediate" => Ok(ActivationProfile::Immediate),
            other => Err(JitMemoryError::Config(format!(
                "unknown activation profile '{}'",
                other
            ))),
        }
    }
}

/// Runtime configuration for [`JitRuntime`](crate::runtime::JitRuntime)
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct JitConfig {
    /// Region size in bytes
    pub region_size: usize,

    /// Activation profile
    pub profile: ActivationProfile,

    /// Default bound for activation waits, `None` = unbounded
    pub activation_timeout_ms: Option<u64>,
}

impl Default for JitConfig {
    fn default() -> Self {
        JitConfig {
            region_size: DEFAULT_REGION_SIZE,
            profile: ActivationProfile::Deferred,
            activation_timeout_ms: None,
        }
    }
}

/// Top-level layout of a configuration file
#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    jit: JitConfig,
}

impl JitConfig {
    /// Configuration for the leaner profile without external activation
    pub fn immediate() -> Self {
        JitConfig {
            profile: ActivationProfile::Immediate,
            ..Default::default()
        }
    }

    pub fn with_region_size(mut self, region_size: usize) -> Self {
        self.region_size = region_size;
        self
    }

    pub fn with_profile(mut self, profile: ActivationProfile) -> Self {
        self.profile = profile;
        self
    }

    pub fn with_activation_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.activation_timeout_ms =
            timeout.map(|t| u64::try_from(t.as_millis()).unwrap_or(u64::MAX));
        self
    }

    /// Default activation wait
    pub fn activation_timeout(&self) -> Option<Duration> {
        self.activation_timeout_ms.map(Duration::from_millis)
    }

    /// Parse the `[jit]` table of a TOML document. Missing keys keep defaults.
    pub fn from_toml_str(content: &str) -> JitMemoryResult<Self> {
        let file: ConfigFile = toml::from_str(content)
            .map_err(|e| JitMemoryError::Config(format!("invalid TOML: {}", e)))?;
        file.jit.validate()
    }

    /// Load from a TOML file.
    pub fn load(path: &Path) -> JitMemoryResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            JitMemoryError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    /// Apply `DUALJIT_*` environment overrides.
    pub fn with_env_overrides(self) -> JitMemoryResult<Self> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary key lookup.
    pub fn with_overrides<F>(mut self, lookup: F) -> JitMemoryResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(ENV_REGION_SIZE) {
            self.region_size = value.trim().parse().map_err(|_| {
                JitMemoryError::Config(format!("{} is not a byte count: '{}'", ENV_REGION_SIZE, value))
            })?;
        }
        if let Some(value) = lookup(ENV_PROFILE) {
            self.profile = value.parse()?;
        }
        if let Some(value) = lookup(ENV_ACTIVATION_TIMEOUT_MS) {
            self.activation_timeout_ms = Some(value.trim().parse().map_err(|_| {
                JitMemoryError::Config(format!(
                    "{} is not a millisecond count: '{}'",
                    ENV_ACTIVATION_TIMEOUT_MS, value
                ))
            })?);
        }
        self.validate()
    }

    fn validate(self) -> JitMemoryResult<Self> {
        if self.region_size == 0 {
            return Err(JitMemoryError::Config("region_size must be non-zero".to_string()));
        }
        Ok(self)
    }
}

//! Engine configuration: defaults, JSON files and `TARN_*` environment
//! overrides.

use std::env;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Device, Result, TarnError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of virtual accelerators.
    pub accelerators: usize,
    /// Placement of tensors created through the engine rather than a
    /// [`Scope`](crate::Scope).
    pub default_device: Device,
    /// Simulated interconnect latency per host/device transfer.
    pub link_latency_us: u64,
    /// Slack allowed between overlapped and fully serial execution.
    pub overlap_tolerance_ms: u64,
    /// Materialize every node as soon as it is created.
    pub eager: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            accelerators: 1,
            default_device: Device::Cpu,
            link_latency_us: 0,
            overlap_tolerance_ms: 100,
            eager: false,
        }
    }
}

fn parse_bool(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    matches!(normalized.as_str(), "1" | "true" | "yes" | "on")
}

fn parse_var<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| TarnError::Config(format!("{name}={value:?} is not a valid value")))
}

impl EngineConfig {
    /// Defaults with `TARN_*` overrides applied.
    pub fn from_env() -> Result<Self> {
        Self::default().with_env_overrides()
    }

    /// Apply `TARN_ACCELERATORS`, `TARN_DEFAULT_DEVICE`,
    /// `TARN_LINK_LATENCY_US`, `TARN_OVERLAP_TOLERANCE_MS` and `TARN_EAGER`.
    pub fn with_env_overrides(mut self) -> Result<Self> {
        self.apply_overrides(|name| env::var(name).ok().filter(|v| !v.trim().is_empty()))?;
        Ok(self)
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(v) = lookup("TARN_ACCELERATORS") {
            self.accelerators = parse_var("TARN_ACCELERATORS", &v)?;
        }
        if let Some(v) = lookup("TARN_DEFAULT_DEVICE") {
            self.default_device = v.parse().map_err(TarnError::Config)?;
        }
        if let Some(v) = lookup("TARN_LINK_LATENCY_US") {
            self.link_latency_us = parse_var("TARN_LINK_LATENCY_US", &v)?;
        }
        if let Some(v) = lookup("TARN_OVERLAP_TOLERANCE_MS") {
            self.overlap_tolerance_ms = parse_var("TARN_OVERLAP_TOLERANCE_MS", &v)?;
        }
        if let Some(v) = lookup("TARN_EAGER") {
            self.eager = parse_bool(&v);
        }
        Ok(())
    }

    /// Load from a JSON file. Missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| TarnError::Config(format!("{}: {e}", path.display())))?;
        Self::from_json_str(&text)
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| TarnError::Config(e.to_string()))
    }

    pub fn link_latency(&self) -> Duration {
        Duration::from_micros(self.link_latency_us)
    }

    pub fn overlap_tolerance(&self) -> Duration {
        Duration::from_millis(self.overlap_tolerance_ms)
    }

    pub fn validate(&self) -> Result<()> {
        self.check_device(self.default_device)
            .map_err(|_| TarnError::Config(format!(
                "default device {} needs at least {} accelerator(s), {} configured",
                self.default_device,
                self.default_device.accel_index().map_or(0, |i| i + 1),
                self.accelerators
            )))
    }

    pub(crate) fn check_device(&self, device: Device) -> Result<()> {
        match device {
            Device::Accel(i) if i >= self.accelerators => Err(TarnError::DeviceUnavailable {
                device,
                available: self.accelerators,
            }),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn test_defaults() {
        let c = EngineConfig::default();
        assert_eq!(c.accelerators, 1);
        assert_eq!(c.default_device, Device::Cpu);
        assert!(!c.eager);
        assert_eq!(c.overlap_tolerance(), Duration::from_millis(100));
    }

    #[test]
    fn test_overrides() {
        let vars: HashMap<&str, &str> = [
            ("TARN_ACCELERATORS", "2"),
            ("TARN_DEFAULT_DEVICE", "accel:1"),
            ("TARN_LINK_LATENCY_US", " 250 "),
            ("TARN_EAGER", "yes"),
        ]
        .into_iter()
        .collect();
        let mut c = EngineConfig::default();
        c.apply_overrides(|k| vars.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(c.accelerators, 2);
        assert_eq!(c.default_device, Device::Accel(1));
        assert_eq!(c.link_latency(), Duration::from_micros(250));
        assert!(c.eager);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn test_bad_override() {
        let mut c = EngineConfig::default();
        let err = c
            .apply_overrides(|k| (k == "TARN_ACCELERATORS").then(|| "many".to_string()))
            .unwrap_err();
        assert!(matches!(err, TarnError::Config(_)));
    }

    #[test]
    fn test_json_partial() {
        let c = EngineConfig::from_json_str(r#"{"accelerators": 0, "eager": true}"#).unwrap();
        assert_eq!(c.accelerators, 0);
        assert!(c.eager);
        assert_eq!(c.overlap_tolerance_ms, 100);

        let c = EngineConfig::from_json_str(r#"{"default_device": {"accel": 0}}"#).unwrap();
        assert_eq!(c.default_device, Device::Accel(0));
    }

    #[test]
    fn test_validate_default_device() {
        let c = EngineConfig {
            accelerators: 0,
            default_device: Device::Accel(0),
            ..Default::default()
        };
        assert!(matches!(c.validate(), Err(TarnError::Config(_))));
    }
}

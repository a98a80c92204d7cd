use std::fmt;

use serde::{Deserialize, Serialize};

/// Placement of tensor data and of the stream that computes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    /// Host memory, computed on the host dispatch thread or host stream
    #[default]
    Cpu,
    /// Accelerator with device index
    Accel(usize),
}

impl Device {
    /// Whether this is the host.
    pub fn is_cpu(&self) -> bool {
        matches!(self, Device::Cpu)
    }

    /// Whether this is an accelerator.
    pub fn is_accel(&self) -> bool {
        matches!(self, Device::Accel(_))
    }

    /// Get the accelerator index, if applicable.
    pub fn accel_index(&self) -> Option<usize> {
        match self {
            Device::Accel(idx) => Some(*idx),
            _ => None,
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Accel(idx) => write!(f, "accel:{idx}"),
        }
    }
}

impl std::str::FromStr for Device {
    type Err = String;

    /// Parses `cpu`, `accel`, `accel:N`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cpu" | "host" => Ok(Device::Cpu),
            "accel" => Ok(Device::Accel(0)),
            other => other
                .strip_prefix("accel:")
                .and_then(|idx| idx.parse().ok())
                .map(Device::Accel)
                .ok_or_else(|| format!("unknown device '{s}'")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_properties() {
        assert!(Device::Cpu.is_cpu());
        assert!(!Device::Cpu.is_accel());
        assert!(Device::Accel(0).is_accel());
        assert_eq!(Device::Accel(1).accel_index(), Some(1));
        assert_eq!(Device::Cpu.accel_index(), None);
    }

    #[test]
    fn test_display() {
        assert_eq!(format!("{}", Device::Cpu), "cpu");
        assert_eq!(format!("{}", Device::Accel(0)), "accel:0");
    }

    #[test]
    fn test_parse() {
        assert_eq!("cpu".parse::<Device>(), Ok(Device::Cpu));
        assert_eq!("accel:2".parse::<Device>(), Ok(Device::Accel(2)));
        assert_eq!("accel".parse::<Device>(), Ok(Device::Accel(0)));
        assert!("gpu".parse::<Device>().is_err());
    }

    #[test]
    fn test_default() {
        assert_eq!(Device::default(), Device::Cpu);
    }
}

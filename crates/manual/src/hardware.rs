//! Hardware characteristics of a bootstrapped machine.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Hardware characteristics reported for (or detected on) a machine.
///
/// Every field is optional: callers may pin only the architecture and leave
/// the rest to remote detection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardwareCharacteristics {
    /// Normalised architecture (e.g. `amd64`, `arm64`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arch: Option<String>,
    /// Memory in MiB.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mem: Option<u64>,
    /// Number of CPU cores.
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "cpu-cores")]
    pub cpu_cores: Option<u64>,
    /// Root disk size in MiB.
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "root-disk")]
    pub root_disk: Option<u64>,
}

impl HardwareCharacteristics {
    /// Characteristics with only the architecture set.
    #[must_use]
    pub fn with_arch(arch: impl Into<String>) -> Self {
        Self {
            arch: Some(arch.into()),
            ..Self::default()
        }
    }
}

impl fmt::Display for HardwareCharacteristics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if let Some(arch) = &self.arch {
            parts.push(format!("arch={arch}"));
        }
        if let Some(mem) = self.mem {
            parts.push(format!("mem={mem}M"));
        }
        if let Some(cores) = self.cpu_cores {
            parts.push(format!("cores={cores}"));
        }
        if let Some(disk) = self.root_disk {
            parts.push(format!("root-disk={disk}M"));
        }
        write!(f, "{}", parts.join(" "))
    }
}

/// Architectures the agent is built for.
pub const SUPPORTED_ARCHES: &[&str] = &["amd64", "i386", "armhf", "arm64", "ppc64el", "s390x"];

/// Map a kernel machine name (`uname -m`) to a normalised architecture.
///
/// Returns `None` for machine names that have no agent build.
#[must_use]
pub fn normalise_arch(machine: &str) -> Option<&'static str> {
    match machine.trim() {
        "x86_64" | "amd64" => Some("amd64"),
        "i386" | "i486" | "i586" | "i686" => Some("i386"),
        "armv7l" | "armv7" | "armhf" => Some("armhf"),
        "aarch64" | "arm64" | "aarch64_be" => Some("arm64"),
        "ppc64le" | "ppc64el" => Some("ppc64el"),
        "s390x" => Some("s390x"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalise_arch() {
        assert_eq!(normalise_arch("x86_64"), Some("amd64"));
        assert_eq!(normalise_arch("i686"), Some("i386"));
        assert_eq!(normalise_arch("aarch64\n"), Some("arm64"));
        assert_eq!(normalise_arch("armv7l"), Some("armhf"));
        assert_eq!(normalise_arch("ppc64le"), Some("ppc64el"));
        assert_eq!(normalise_arch("mips"), None);
    }

    #[test]
    fn test_normalise_arch_stays_within_supported() {
        for machine in ["x86_64", "i586", "armv7", "aarch64_be", "ppc64le", "s390x"] {
            let arch = normalise_arch(machine).unwrap();
            assert!(SUPPORTED_ARCHES.contains(&arch), "{machine} -> {arch}");
        }
        for arch in SUPPORTED_ARCHES {
            assert_eq!(normalise_arch(arch), Some(*arch));
        }
    }

    #[test]
    fn test_display() {
        let hw = HardwareCharacteristics {
            arch: Some("amd64".into()),
            mem: Some(2048),
            cpu_cores: Some(2),
            root_disk: None,
        };
        assert_eq!(hw.to_string(), "arch=amd64 mem=2048M cores=2");
        assert_eq!(HardwareCharacteristics::default().to_string(), "");
    }

    #[test]
    fn test_yaml_skips_unset_fields() {
        let yaml = serde_yaml::to_string(&HardwareCharacteristics::with_arch("arm64")).unwrap();
        assert_eq!(yaml.trim(), "arch: arm64");
    }
}

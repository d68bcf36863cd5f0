//! Host platform detection for operational diagnostics.

use std::fmt;
use std::fs;

/// Coarse classification of the machine running the hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemType {
    Mac,
    RaspberryPi,
    Ubuntu,
    Linux,
    Unknown,
}

impl fmt::Display for SystemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SystemType::Mac => "Mac",
            SystemType::RaspberryPi => "RPi",
            SystemType::Ubuntu => "Ubuntu",
            SystemType::Linux => "Linux",
            SystemType::Unknown => "Unknown",
        };
        f.write_str(name)
    }
}

/// Detect the current system type.
pub fn detect() -> SystemType {
    let os_release = fs::read_to_string("/etc/os-release").ok();
    classify(std::env::consts::OS, os_release.as_deref())
}

/// Classify from an OS name and optional `/etc/os-release` contents.
pub fn classify(os: &str, os_release: Option<&str>) -> SystemType {
    match os {
        "macos" => SystemType::Mac,
        "linux" => {
            let release = os_release.unwrap_or_default().to_lowercase();
            if release.contains("raspbian") {
                SystemType::RaspberryPi
            } else if release.contains("ubuntu") {
                SystemType::Ubuntu
            } else {
                SystemType::Linux
            }
        }
        _ => SystemType::Unknown,
    }
}

use crate::icmp::{MAX_IP4_HEADER_SIZE, MIN_IP4_HEADER_SIZE};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

/// Engine-wide settings. Every field has a default so partial files load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub detect_public_ip: bool,
    pub ipv4_service: String,
    pub ipv6_service: String,
    pub custom_ip4_header: bool,
    pub ip4_header_size: u32,
    /// Seconds between resource checks.
    pub resource_check_period: u64,
    /// Milliseconds.
    pub resolve_timeout: u64,
    /// Milliseconds.
    pub tcp_knock_timeout: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            detect_public_ip: false,
            ipv4_service: "https://api.ipify.org".to_string(),
            ipv6_service: "https://api6.ipify.org".to_string(),
            custom_ip4_header: false,
            ip4_header_size: MIN_IP4_HEADER_SIZE as u32,
            resource_check_period: 60,
            resolve_timeout: 5000,
            tcp_knock_timeout: 500,
        }
    }
}

impl Settings {
    /// IPv4 header size used for `full_packet` ICMP sizing.
    pub fn ip4_header_size(&self) -> usize {
        if self.custom_ip4_header {
            (self.ip4_header_size as usize).clamp(MIN_IP4_HEADER_SIZE, MAX_IP4_HEADER_SIZE)
        } else {
            MIN_IP4_HEADER_SIZE
        }
    }

    pub fn resource_check_period(&self) -> Duration {
        Duration::from_secs(self.resource_check_period.max(1))
    }

    pub fn resolve_timeout(&self) -> Duration {
        Duration::from_millis(self.resolve_timeout.max(1))
    }

    pub fn tcp_knock_timeout(&self) -> Duration {
        Duration::from_millis(self.tcp_knock_timeout.max(1))
    }
}

pub trait SettingsProvider: Send + Sync {
    fn settings(&self) -> Settings;
}

impl SettingsProvider for Settings {
    fn settings(&self) -> Settings {
        self.clone()
    }
}

/// Settings backed by a JSON file. A missing file means defaults.
#[derive(Debug)]
pub struct SettingsFile {
    path: PathBuf,
    current: RwLock<Settings>,
}

impl SettingsFile {
    pub fn load(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let current = read_settings(&path)?;
        Ok(Self {
            path,
            current: RwLock::new(current),
        })
    }

    pub fn reload(&self) -> anyhow::Result<()> {
        let settings = read_settings(&self.path)?;
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = settings;
        Ok(())
    }
}

impl SettingsProvider for SettingsFile {
    fn settings(&self) -> Settings {
        self.current.read().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

fn read_settings(path: &Path) -> anyhow::Result<Settings> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            log::debug!("No settings at {}, using defaults", path.display());
            return Ok(Settings::default());
        }
        Err(e) => return Err(e).with_context(|| format!("cannot open settings {}", path.display())),
    };

    let settings: Settings = serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("failed to parse settings {}", path.display()))?;
    log::info!("Settings loaded from: {}", path.display());
    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.ip4_header_size(), 20);
        assert_eq!(settings.resource_check_period(), Duration::from_secs(60));
        assert_eq!(settings.tcp_knock_timeout(), Duration::from_millis(500));
        assert!(!settings.detect_public_ip);
    }

    #[test]
    fn test_custom_ip4_header_is_clamped() {
        let mut settings = Settings { ip4_header_size: 24, ..Settings::default() };
        assert_eq!(settings.ip4_header_size(), 20);

        settings.custom_ip4_header = true;
        assert_eq!(settings.ip4_header_size(), 24);
        settings.ip4_header_size = 100;
        assert_eq!(settings.ip4_header_size(), 60);
        settings.ip4_header_size = 4;
        assert_eq!(settings.ip4_header_size(), 20);
    }

    #[test]
    fn test_partial_file_and_missing_file() {
        let dir = std::env::temp_dir();
        let missing = SettingsFile::load(dir.join("ruknock-no-such-settings.json")).unwrap();
        assert_eq!(missing.settings(), Settings::default());

        let path = dir.join(format!("ruknock-settings-{}.json", std::process::id()));
        std::fs::write(&path, r#"{"detect_public_ip": true, "resource_check_period": 5}"#).unwrap();
        let file = SettingsFile::load(&path).unwrap();
        let settings = file.settings();
        assert!(settings.detect_public_ip);
        assert_eq!(settings.resource_check_period(), Duration::from_secs(5));
        assert_eq!(settings.ipv4_service, "https://api.ipify.org");

        std::fs::write(&path, "[]").unwrap();
        assert!(file.reload().is_err());
        let _ = std::fs::remove_file(&path);
    }
}

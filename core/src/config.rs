//! Engine configuration: where nginx, certbot, and backups live

use crate::{CertPaths, Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Current config version for migration support
pub const CONFIG_VERSION: u32 = 1;

/// Global configuration for the provisioning engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub version: u32,
    pub nginx: NginxSection,
    pub certbot: CertbotSection,
    pub backup: BackupSection,
    pub probe: ProbeSection,
    #[serde(default)]
    pub log: LogSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NginxSection {
    /// Root of the nginx configuration tree (what gets snapshotted)
    pub config_root: PathBuf,
    /// Directory holding one generated file per domain
    pub sites_available: PathBuf,
    /// Directory holding the enable symlinks
    pub sites_enabled: PathBuf,
    pub binary: String,
    pub service: String,
    pub systemctl: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertbotSection {
    pub binary: String,
    /// Per-domain certificate directories (`<live_dir>/<domain>/fullchain.pem`)
    pub live_dir: PathBuf,
    pub openssl: String,
    /// Document root the webserver plugin writes into a rewritten `/` location
    pub static_sentinel: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupSection {
    /// Directory where timestamped snapshots accumulate
    pub root: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeSection {
    /// Timeout for backend connectivity probes in seconds
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LogSection {
    /// Optional file every run-context entry is appended to
    pub path: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            nginx: NginxSection {
                config_root: PathBuf::from("/etc/nginx"),
                sites_available: PathBuf::from("/etc/nginx/sites-available"),
                sites_enabled: PathBuf::from("/etc/nginx/sites-enabled"),
                binary: "nginx".to_string(),
                service: "nginx".to_string(),
                systemctl: "systemctl".to_string(),
            },
            certbot: CertbotSection {
                binary: "certbot".to_string(),
                live_dir: PathBuf::from("/etc/letsencrypt/live"),
                openssl: "openssl".to_string(),
                static_sentinel: "/var/www/html".to_string(),
            },
            backup: BackupSection {
                root: PathBuf::from("/var/backups/nginx-proxy-wizard"),
            },
            probe: ProbeSection {
                connect_timeout_secs: 5,
            },
            log: LogSection {
                path: Some(PathBuf::from("/var/log/nginx-proxy-wizard.log")),
            },
        }
    }
}

impl EngineConfig {
    /// Get the default config file path
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/etc"))
            .join("nginx-proxy-wizard")
            .join("config.toml")
    }

    /// Load config from file, or create default if not exists
    pub fn load_or_default() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load(&path)
        } else {
            let config = Self::default();
            config.save_to(&path)?;
            Ok(config)
        }
    }

    /// Load config from a specific path
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        if config.version > CONFIG_VERSION {
            return Err(Error::config(format!(
                "Config version {} is newer than supported version {}",
                config.version, CONFIG_VERSION
            )));
        }
        Ok(config)
    }

    /// Save config to a specific path
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Same layout with every filesystem path moved under `prefix`
    pub fn rooted(prefix: &Path) -> Self {
        let base = Self::default();
        let rebase = |p: &Path| prefix.join(p.strip_prefix("/").unwrap_or(p));
        Self {
            nginx: NginxSection {
                config_root: rebase(&base.nginx.config_root),
                sites_available: rebase(&base.nginx.sites_available),
                sites_enabled: rebase(&base.nginx.sites_enabled),
                ..base.nginx
            },
            certbot: CertbotSection {
                live_dir: rebase(&base.certbot.live_dir),
                ..base.certbot
            },
            backup: BackupSection {
                root: rebase(&base.backup.root),
            },
            log: LogSection { path: None },
            ..base
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if !self.nginx.sites_available.starts_with(&self.nginx.config_root)
            || !self.nginx.sites_enabled.starts_with(&self.nginx.config_root)
        {
            return Err(Error::config(
                "sites-available and sites-enabled must live under the nginx config root",
            ));
        }
        if self.backup.root.starts_with(&self.nginx.config_root) {
            return Err(Error::config(
                "Backup root cannot be inside the nginx config root",
            ));
        }
        if self.probe.connect_timeout_secs == 0 || self.probe.connect_timeout_secs > 30 {
            return Err(Error::config(
                "Probe timeout must be between 1 and 30 seconds",
            ));
        }
        if self.certbot.static_sentinel.trim().is_empty() {
            return Err(Error::config("Static sentinel root cannot be empty"));
        }
        Ok(())
    }

    /// Generated site file for a domain
    pub fn site_available(&self, domain: &str) -> PathBuf {
        self.nginx.sites_available.join(domain)
    }

    /// Enable symlink for a domain
    pub fn site_enabled(&self, domain: &str) -> PathBuf {
        self.nginx.sites_enabled.join(domain)
    }

    /// Where certbot keeps the chain and key for a domain
    pub fn cert_paths(&self, domain: &str) -> CertPaths {
        let dir = self.certbot.live_dir.join(domain);
        CertPaths {
            chain: dir.join("fullchain.pem"),
            key: dir.join("privkey.pem"),
        }
    }

    /// Path of `path` relative to the nginx config root, as stored in backups
    pub fn relative_to_root<'a>(&self, path: &'a Path) -> Option<&'a Path> {
        path.strip_prefix(&self.nginx.config_root).ok()
    }
}

//! Domain model types for the Nginx Proxy Wizard

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::PathBuf;

/// Complete proxy configuration for one domain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub domain: String,
    pub backend_host: String,
    pub backend_port: u16,
    pub ssl_enabled: bool,
    pub ssl_email: Option<String>,
    pub force_https: bool,
}

impl ProxyConfig {
    /// Create an HTTP-only configuration. The domain is normalized on the way in.
    pub fn new(domain: &str, backend_host: &str, backend_port: u16) -> Self {
        Self {
            domain: normalize_domain(domain),
            backend_host: backend_host.trim().to_lowercase(),
            backend_port,
            ssl_enabled: false,
            ssl_email: None,
            force_https: false,
        }
    }

    pub fn with_ssl(mut self, email: &str, force_https: bool) -> Self {
        self.ssl_enabled = true;
        self.ssl_email = Some(email.trim().to_string());
        self.force_https = force_https;
        self
    }

    /// `host:port` as it appears after `proxy_pass http://`
    pub fn backend_authority(&self) -> String {
        match self.backend_host.parse::<IpAddr>() {
            Ok(IpAddr::V6(v6)) => format!("[{}]:{}", v6, self.backend_port),
            _ => format!("{}:{}", self.backend_host, self.backend_port),
        }
    }

    /// Whether the HTTP block should become a redirect once HTTPS is live
    pub fn wants_redirect(&self) -> bool {
        self.ssl_enabled && self.force_https
    }

    /// Validate the proxy configuration
    pub fn validate(&self) -> Result<()> {
        validate_domain(&self.domain)?;
        validate_backend_host(&self.backend_host)?;
        validate_backend_port(u32::from(self.backend_port))?;

        if self.ssl_enabled {
            match self.ssl_email.as_deref() {
                Some(email) => validate_email(email)?,
                None => {
                    return Err(Error::validation(
                        "An email address is required when SSL is enabled",
                    ))
                }
            }
        }

        Ok(())
    }
}

/// Normalize a domain: trimmed, lowercase, no trailing dot, leading `www.` stripped
pub fn normalize_domain(domain: &str) -> String {
    let lowered = domain.trim().trim_end_matches('.').to_lowercase();
    match lowered.strip_prefix("www.") {
        Some(rest) => rest.to_string(),
        None => lowered,
    }
}

/// Validates a DNS hostname with at least two labels
pub fn validate_domain(domain: &str) -> Result<()> {
    if domain.is_empty() {
        return Err(Error::validation("Domain cannot be empty"));
    }
    if domain.len() > 253 {
        return Err(Error::validation("Domain must be 253 characters or less"));
    }

    let re = Regex::new(r"^([a-z0-9]([a-z0-9-]{0,61}[a-z0-9])?\.)+[a-z][a-z0-9-]{0,61}[a-z0-9]$")
        .map_err(|e| Error::Parse(e.to_string()))?;
    if !re.is_match(domain) {
        return Err(Error::validation(format!(
            "'{}' is not a valid domain name",
            domain
        )));
    }
    Ok(())
}

/// Validates a backend host: IP literal, `localhost`, or a hostname
pub fn validate_backend_host(host: &str) -> Result<()> {
    if host.is_empty() {
        return Err(Error::validation("Backend host cannot be empty"));
    }
    if host == "localhost" || host.parse::<IpAddr>().is_ok() {
        return Ok(());
    }

    let re = Regex::new(r"^[a-z0-9]([a-z0-9-]{0,61}[a-z0-9])?(\.[a-z0-9]([a-z0-9-]{0,61}[a-z0-9])?)*$")
        .map_err(|e| Error::Parse(e.to_string()))?;
    if !re.is_match(host) {
        return Err(Error::validation(format!(
            "'{}' is not an IP address, localhost, or hostname",
            host
        )));
    }
    Ok(())
}

/// Validates a backend port given as an unbounded integer
pub fn validate_backend_port(port: u32) -> Result<u16> {
    if port == 0 || port > u32::from(u16::MAX) {
        return Err(Error::validation(format!(
            "Port must be between 1 and 65535, got {}",
            port
        )));
    }
    Ok(port as u16)
}

/// Parse a backend port from user input
pub fn parse_backend_port(input: &str) -> Result<u16> {
    let port: u32 = input
        .trim()
        .parse()
        .map_err(|_| Error::validation(format!("'{}' is not a port number", input.trim())))?;
    validate_backend_port(port)
}

/// Validates an email address for certificate registration
pub fn validate_email(email: &str) -> Result<()> {
    let re = Regex::new(r"^[A-Za-z0-9._%+-]+@[A-Za-z0-9-]+(\.[A-Za-z0-9-]+)*\.[A-Za-z]{2,}$")
        .map_err(|e| Error::Parse(e.to_string()))?;
    if !re.is_match(email) {
        return Err(Error::validation(format!(
            "'{}' is not a valid email address",
            email
        )));
    }
    Ok(())
}

/// How a certificate was obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CertStrategy {
    Standalone,
    WebserverPlugin,
}

impl CertStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            CertStrategy::Standalone => "standalone",
            CertStrategy::WebserverPlugin => "webserver-plugin",
        }
    }
}

/// Certificate state for a domain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum CertStatus {
    #[default]
    Absent,
    Active,
    Expired,
    RenewalFailed,
}

impl CertStatus {
    pub fn display_name(&self) -> &'static str {
        match self {
            CertStatus::Absent => "absent",
            CertStatus::Active => "active",
            CertStatus::Expired => "expired",
            CertStatus::RenewalFailed => "renewal-failed",
        }
    }
}

/// Certificate chain and key for a domain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertPaths {
    pub chain: PathBuf,
    pub key: PathBuf,
}

/// Certificate store entry, keyed by domain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateRecord {
    pub domain: String,
    /// Known only for certificates issued during this run
    pub issued_strategy: Option<CertStrategy>,
    pub expiry: Option<DateTime<Utc>>,
    pub status: CertStatus,
}

impl CertificateRecord {
    pub fn absent(domain: &str) -> Self {
        Self {
            domain: domain.to_string(),
            issued_strategy: None,
            expiry: None,
            status: CertStatus::Absent,
        }
    }

    /// Build a record from an expiry timestamp as seen at `now`
    pub fn from_expiry(domain: &str, expiry: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        let status = if expiry <= now {
            CertStatus::Expired
        } else {
            CertStatus::Active
        };
        Self {
            domain: domain.to_string(),
            issued_strategy: None,
            expiry: Some(expiry),
            status,
        }
    }

    /// Whole days until expiry, negative once expired
    pub fn days_remaining(&self, now: DateTime<Utc>) -> Option<i64> {
        self.expiry.map(|expiry| (expiry - now).num_days())
    }
}

/// One listen directive of a server block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenSpec {
    pub port: u16,
    pub tls: bool,
}

/// What the primary `/` location of a server block does
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocationKind {
    /// Forwards to `host:port`
    Proxy(String),
    Redirect,
    /// Rewritten by a third-party tool to serve static files
    StaticPlaceholder,
    Other,
    Missing,
}

/// Summary of one `server { ... }` block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerBlock {
    /// Every top-level listen directive, in file order
    pub listens: Vec<ListenSpec>,
    pub server_name: Option<String>,
    pub root_location: LocationKind,
    /// A `return 301 https://...` directly at server level
    pub server_redirect: bool,
    /// First and last line (the closing brace), zero based
    pub start_line: usize,
    pub end_line: usize,
}

impl ServerBlock {
    /// Any TLS listen makes the block an HTTPS block, even if it also listens on 80
    pub fn is_https(&self) -> bool {
        self.listens.iter().any(|l| l.tls)
    }

    pub fn listens_on(&self, port: u16) -> bool {
        self.listens.iter().any(|l| l.port == port)
    }

    pub fn has_proxy(&self) -> bool {
        matches!(self.root_location, LocationKind::Proxy(_))
    }

    /// Redirects either from its `/` location or at server level
    pub fn redirects(&self) -> bool {
        self.server_redirect || self.root_location == LocationKind::Redirect
    }
}

/// A generated site file, as an ordered list of server blocks
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConfigFile {
    pub blocks: Vec<ServerBlock>,
}

impl ConfigFile {
    /// First block with no TLS listen at all
    pub fn http_block(&self) -> Option<&ServerBlock> {
        self.blocks.iter().find(|b| !b.is_https())
    }

    pub fn https_block(&self) -> Option<&ServerBlock> {
        self.blocks.iter().find(|b| b.is_https())
    }

    pub fn has_https(&self) -> bool {
        self.https_block().is_some()
    }
}

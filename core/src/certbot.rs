//! Certificate authority client via CLI tools (certbot, openssl)

use crate::config::CertbotSection;
use crate::nginx::run_cmd;
use crate::{CertPaths, Error, Result};
use std::fs;
use std::path::PathBuf;

/// Issuance and inspection of per-domain certificates
pub trait CertificateAuthority {
    /// Issue while owning port 80 (the edge server must be stopped)
    fn issue_standalone(&self, domain: &str, email: &str) -> Result<()>;
    /// Issue through the webserver plugin, which edits the live site config
    fn issue_via_plugin(&self, domain: &str, email: &str) -> Result<()>;
    fn renew(&self, domain: &str, force: bool) -> Result<()>;
    fn delete(&self, domain: &str) -> Result<()>;
    /// Chain and key, if a certificate exists for the domain
    fn certificate_paths(&self, domain: &str) -> Option<CertPaths>;
    /// Domains with a certificate in the store
    fn list_certificates(&self) -> Result<Vec<String>>;
    /// Raw notAfter text of the domain's certificate
    fn not_after(&self, domain: &str) -> Result<Option<String>>;
}

#[derive(Debug, Clone)]
pub struct CertbotAdapter {
    binary: String,
    openssl: String,
    live_dir: PathBuf,
}

impl CertbotAdapter {
    pub fn new(section: &CertbotSection) -> Self {
        Self {
            binary: section.binary.clone(),
            openssl: section.openssl.clone(),
            live_dir: section.live_dir.clone(),
        }
    }

    pub fn check_prerequisites(&self) -> Result<()> {
        crate::nginx::check_commands(&[self.binary.as_str(), self.openssl.as_str()])
    }

    fn paths_for(&self, domain: &str) -> CertPaths {
        let dir = self.live_dir.join(domain);
        CertPaths {
            chain: dir.join("fullchain.pem"),
            key: dir.join("privkey.pem"),
        }
    }

    /// Arguments for `certbot certonly --standalone`
    pub fn build_standalone_args<'a>(domain: &'a str, email: &'a str) -> Vec<&'a str> {
        vec![
            "certonly",
            "--standalone",
            "--non-interactive",
            "--agree-tos",
            "--email",
            email,
            "-d",
            domain,
        ]
    }

    /// Arguments for `certbot --nginx`
    pub fn build_plugin_args<'a>(domain: &'a str, email: &'a str) -> Vec<&'a str> {
        vec![
            "--nginx",
            "--non-interactive",
            "--agree-tos",
            "--no-redirect",
            "--email",
            email,
            "-d",
            domain,
        ]
    }

    fn run_certbot(&self, what: &str, args: &[&str]) -> Result<()> {
        let output = run_cmd(&self.binary, args)?;
        if !output.success() {
            return Err(Error::acquisition(format!(
                "{} failed: {}",
                what,
                output.details()
            )));
        }
        Ok(())
    }
}

impl CertificateAuthority for CertbotAdapter {
    fn issue_standalone(&self, domain: &str, email: &str) -> Result<()> {
        self.run_certbot(
            "standalone issuance",
            &Self::build_standalone_args(domain, email),
        )
    }

    fn issue_via_plugin(&self, domain: &str, email: &str) -> Result<()> {
        self.run_certbot("nginx plugin issuance", &Self::build_plugin_args(domain, email))
    }

    fn renew(&self, domain: &str, force: bool) -> Result<()> {
        let mut args = vec!["renew", "--cert-name", domain, "--non-interactive"];
        if force {
            args.push("--force-renewal");
        }
        self.run_certbot("renewal", &args)
    }

    fn delete(&self, domain: &str) -> Result<()> {
        self.run_certbot(
            "deletion",
            &["delete", "--cert-name", domain, "--non-interactive"],
        )
    }

    fn certificate_paths(&self, domain: &str) -> Option<CertPaths> {
        let paths = self.paths_for(domain);
        (paths.chain.is_file() && paths.key.is_file()).then_some(paths)
    }

    fn list_certificates(&self) -> Result<Vec<String>> {
        if !self.live_dir.exists() {
            return Ok(Vec::new());
        }
        let mut domains = Vec::new();
        for entry in fs::read_dir(&self.live_dir)? {
            let path = entry?.path();
            if path.is_dir() && path.join("fullchain.pem").exists() {
                if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                    domains.push(name.to_string());
                }
            }
        }
        domains.sort();
        Ok(domains)
    }

    fn not_after(&self, domain: &str) -> Result<Option<String>> {
        let Some(paths) = self.certificate_paths(domain) else {
            return Ok(None);
        };
        let chain = paths.chain.to_string_lossy().to_string();
        let output = run_cmd(&self.openssl, &["x509", "-enddate", "-noout", "-in", &chain])?;
        if !output.success() {
            return Err(Error::Parse(format!(
                "openssl could not read {}: {}",
                chain,
                output.details()
            )));
        }
        Ok(output
            .stdout
            .lines()
            .find_map(|l| l.trim().strip_prefix("notAfter="))
            .map(|s| s.trim().to_string()))
    }
}

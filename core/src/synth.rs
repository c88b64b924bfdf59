//! Nginx server block generation
//!
//! # Shape contract
//!
//! [`crate::mutator`] edits generated files without a grammar. It relies on every
//! rendered block keeping this line-oriented shape:
//!
//! - `server {` opens a block at column 0 and its closing `}` sits alone at column 0;
//! - the primary location is a line `    location / {` at depth 1, closed by `    }`;
//! - every other brace opens or closes on its own line (`location ~ ... {`, `}`);
//! - directive values never contain `{`, `}` or `#`;
//! - `server_name` appears once per block, before any location.
//!
//! Rendering is deterministic: the same inputs give byte-identical output.

use crate::{CertPaths, ProxyConfig};

/// First line of every generated file
pub const MANAGED_HEADER: &str = "# Managed by nginx-proxy-wizard";

/// Directive that marks a proxy stanza
pub const PROXY_PASS_PREFIX: &str = "proxy_pass http://";

/// The redirect directive, with nginx's own `$host$request_uri` substitution
pub const REDIRECT_DIRECTIVE: &str = "return 301 https://$host$request_uri;";

const TLS_PROTOCOLS: &str = "TLSv1.2 TLSv1.3";
const TLS_CIPHERS: &str = "ECDHE-ECDSA-AES128-GCM-SHA256:ECDHE-RSA-AES128-GCM-SHA256:\
ECDHE-ECDSA-AES256-GCM-SHA384:ECDHE-RSA-AES256-GCM-SHA384:\
ECDHE-ECDSA-CHACHA20-POLY1305:ECDHE-RSA-CHACHA20-POLY1305:\
DHE-RSA-AES128-GCM-SHA256:DHE-RSA-AES256-GCM-SHA384";

/// Builder for the per-domain nginx site file
#[derive(Debug)]
pub struct ConfigSynthesizer;

impl ConfigSynthesizer {
    /// The plain-HTTP server block, preceded by the managed-file header
    pub fn render_http_block(config: &ProxyConfig) -> String {
        let mut lines = Vec::new();

        lines.push(format!("{} for {}", MANAGED_HEADER, config.domain));
        lines.push(format!(
            "# Backend: {} (ssl: {}, force_https: {})",
            config.backend_authority(),
            config.ssl_enabled,
            config.force_https
        ));
        lines.push("server {".to_string());
        lines.push("    listen 80;".to_string());
        lines.push("    listen [::]:80;".to_string());
        lines.push(format!("    server_name {};", config.domain));
        lines.push(String::new());
        Self::push_security_headers(&mut lines);
        lines.push(String::new());
        Self::push_dotfile_rule(&mut lines);
        lines.push(String::new());
        Self::push_root_location(&mut lines, config);
        lines.push("}".to_string());

        let mut out = lines.join("\n");
        out.push('\n');
        out
    }

    /// The TLS server block appended once a certificate exists
    pub fn render_https_block(config: &ProxyConfig, certs: &CertPaths) -> String {
        let mut lines = Vec::new();

        lines.push("server {".to_string());
        lines.push("    listen 443 ssl http2;".to_string());
        lines.push("    listen [::]:443 ssl http2;".to_string());
        lines.push(format!("    server_name {};", config.domain));
        lines.push(String::new());

        lines.push(format!("    ssl_certificate {};", certs.chain.display()));
        lines.push(format!("    ssl_certificate_key {};", certs.key.display()));
        lines.push(format!("    ssl_protocols {};", TLS_PROTOCOLS));
        lines.push(format!("    ssl_ciphers {};", TLS_CIPHERS));
        // Client cipher preference is allowed
        lines.push("    ssl_prefer_server_ciphers off;".to_string());
        lines.push("    ssl_session_cache shared:SSL:10m;".to_string());
        lines.push("    ssl_session_timeout 10m;".to_string());
        lines.push(String::new());

        lines.push(
            "    add_header Strict-Transport-Security \"max-age=31536000; includeSubDomains\" always;"
                .to_string(),
        );
        Self::push_security_headers(&mut lines);
        lines.push(String::new());
        Self::push_dotfile_rule(&mut lines);
        lines.push(String::new());
        Self::push_root_location(&mut lines, config);
        lines.push("}".to_string());

        let mut out = lines.join("\n");
        out.push('\n');
        out
    }

    /// Body of `location /` for proxying, one line per entry, indented for depth 2
    pub fn render_proxy_stanza(config: &ProxyConfig) -> Vec<String> {
        [
            format!("{}{};", PROXY_PASS_PREFIX, config.backend_authority()),
            "proxy_http_version 1.1;".to_string(),
            "proxy_set_header Host $host;".to_string(),
            "proxy_set_header X-Real-IP $remote_addr;".to_string(),
            "proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;".to_string(),
            "proxy_set_header X-Forwarded-Proto $scheme;".to_string(),
            String::new(),
            "proxy_connect_timeout 60s;".to_string(),
            "proxy_send_timeout 60s;".to_string(),
            "proxy_read_timeout 60s;".to_string(),
            String::new(),
            "proxy_buffering on;".to_string(),
            "proxy_buffer_size 4k;".to_string(),
            "proxy_buffers 8 4k;".to_string(),
            "proxy_busy_buffers_size 8k;".to_string(),
        ]
        .into_iter()
        .map(|line| indent(&line, 2))
        .collect()
    }

    /// Body of `location /` for the HTTP-to-HTTPS redirect
    pub fn render_redirect_stanza() -> Vec<String> {
        vec![indent(REDIRECT_DIRECTIVE, 2)]
    }

    /// Full two-block file, as written after a certificate was obtained
    pub fn render_site(config: &ProxyConfig, certs: Option<&CertPaths>) -> String {
        let mut out = Self::render_http_block(config);
        if let Some(certs) = certs {
            out.push('\n');
            out.push_str(&Self::render_https_block(config, certs));
        }
        out
    }

    fn push_security_headers(lines: &mut Vec<String>) {
        lines.push("    add_header X-Frame-Options \"DENY\" always;".to_string());
        lines.push("    add_header X-Content-Type-Options \"nosniff\" always;".to_string());
        lines.push("    add_header X-XSS-Protection \"1; mode=block\" always;".to_string());
    }

    // 404 rather than 403 so probes cannot tell the file exists
    fn push_dotfile_rule(lines: &mut Vec<String>) {
        lines.push("    location ~ /\\.(env|git) {".to_string());
        lines.push("        return 404;".to_string());
        lines.push("    }".to_string());
    }

    fn push_root_location(lines: &mut Vec<String>, config: &ProxyConfig) {
        lines.push("    location / {".to_string());
        lines.extend(Self::render_proxy_stanza(config));
        lines.push("    }".to_string());
    }
}

fn indent(line: &str, depth: usize) -> String {
    if line.is_empty() {
        String::new()
    } else {
        format!("{}{}", "    ".repeat(depth), line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn sample() -> ProxyConfig {
        ProxyConfig::new("api.example.com", "10.0.0.5", 4000).with_ssl("ops@example.com", true)
    }

    fn certs() -> CertPaths {
        CertPaths {
            chain: PathBuf::from("/etc/letsencrypt/live/api.example.com/fullchain.pem"),
            key: PathBuf::from("/etc/letsencrypt/live/api.example.com/privkey.pem"),
        }
    }

    #[test]
    fn test_rendering_is_byte_stable() {
        let config = sample();
        assert_eq!(
            ConfigSynthesizer::render_http_block(&config),
            ConfigSynthesizer::render_http_block(&config.clone())
        );
        assert_eq!(
            ConfigSynthesizer::render_https_block(&config, &certs()),
            ConfigSynthesizer::render_https_block(&config.clone(), &certs())
        );
    }

    #[test]
    fn test_http_block_contents() {
        let content = ConfigSynthesizer::render_http_block(&sample());
        assert!(content.starts_with(MANAGED_HEADER));
        assert!(content.contains("listen 80;"));
        assert!(content.contains("server_name api.example.com;"));
        assert!(content.contains("proxy_pass http://10.0.0.5:4000;"));
        assert!(content.contains("proxy_set_header X-Forwarded-Proto $scheme;"));
        assert!(content.contains("proxy_connect_timeout 60s;"));
        assert!(content.contains("proxy_read_timeout 60s;"));
        assert!(content.contains("proxy_buffering on;"));
        assert!(content.contains("X-Frame-Options \"DENY\""));
        assert!(content.contains("location ~ /\\.(env|git) {"));
        assert!(content.contains("return 404;"));
        assert!(!content.contains("deny all"));
        assert!(!content.contains("ssl_certificate"));
    }

    #[test]
    fn test_https_block_contents() {
        let content = ConfigSynthesizer::render_https_block(&sample(), &certs());
        assert!(content.contains("listen 443 ssl http2;"));
        assert!(content.contains("ssl_protocols TLSv1.2 TLSv1.3;"));
        assert!(content.contains("ssl_prefer_server_ciphers off;"));
        assert!(content.contains("ssl_session_cache shared:SSL:10m;"));
        assert!(content.contains("includeSubDomains"));
        assert!(content.contains("ssl_certificate /etc/letsencrypt/live/api.example.com/fullchain.pem;"));
        assert!(content.contains("proxy_pass http://10.0.0.5:4000;"));
    }

    #[test]
    fn test_proxy_stanza_shared_between_blocks() {
        let config = sample();
        let stanza = ConfigSynthesizer::render_proxy_stanza(&config).join("\n");
        assert!(ConfigSynthesizer::render_http_block(&config).contains(&stanza));
        assert!(ConfigSynthesizer::render_https_block(&config, &certs()).contains(&stanza));
    }

    #[test]
    fn test_braces_balanced_and_isolated() {
        let content = ConfigSynthesizer::render_site(&sample(), Some(&certs()));
        let opens = content.matches('{').count();
        let closes = content.matches('}').count();
        assert_eq!(opens, closes);
        for line in content.lines() {
            let t = line.trim();
            if t.contains('}') {
                assert_eq!(t, "}");
            }
            if t.contains('{') {
                assert!(t.ends_with('{'));
            }
        }
    }
}

//! Certificate acquisition with strategy fallback, and renewal

use crate::certbot::CertificateAuthority;
use crate::fsops;
use crate::mutator::{ConfigMutator, ProxyRestoreOutcome};
use crate::nginx::EdgeServer;
use crate::supervisor::ReloadSupervisor;
use crate::{
    CertPaths, CertStatus, CertStrategy, CertificateRecord, Error, ProxyConfig, Result, RunContext,
};
use chrono::{DateTime, NaiveDateTime, Utc};
use std::path::Path;

/// Steps of one acquisition run, in the order they were taken
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertState {
    NotRequested,
    Requested,
    ExistingReused,
    RenewalAttempt,
    StandaloneAttempt,
    StandaloneSucceeded,
    StandaloneFailed,
    PluginAttempt,
    PluginSucceeded,
    PluginFailed,
    ResolvedSuccess,
    ResolvedDegraded,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Acquisition {
    /// A usable certificate is in place. `strategy` is `None` for a reused one.
    Issued {
        paths: CertPaths,
        strategy: Option<CertStrategy>,
    },
    /// No certificate; the site stays HTTP-only
    Degraded(String),
    /// SSL was not asked for
    Skipped,
}

#[derive(Debug, Clone)]
pub struct AcquisitionOutcome {
    pub result: Acquisition,
    pub trace: Vec<CertState>,
    /// Set when the plugin strategy ran and the proxy location had to be checked
    pub proxy_restore: Option<ProxyRestoreOutcome>,
    /// Store entry of the certificate in use, with the strategy that produced it
    pub record: Option<CertificateRecord>,
}

impl AcquisitionOutcome {
    /// Outcome for an acquisition that ended before any strategy resolved
    pub fn degraded(reason: impl Into<String>) -> Self {
        Self {
            result: Acquisition::Degraded(reason.into()),
            trace: vec![CertState::ResolvedDegraded],
            proxy_restore: None,
            record: None,
        }
    }

    pub fn paths(&self) -> Option<&CertPaths> {
        match &self.result {
            Acquisition::Issued { paths, .. } => Some(paths),
            _ => None,
        }
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self.result, Acquisition::Degraded(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenewalOutcome {
    /// Renewed and the edge server picked it up
    Renewed,
    /// Renewed, but the config tree failed its syntax check so nothing was reloaded
    RenewedNotReloaded(String),
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct RenewalReport {
    pub domain: String,
    pub outcome: RenewalOutcome,
    pub record: CertificateRecord,
}

/// Reason text for a certificate-authority error that only fails the current
/// strategy. Anything else is passed through as `Err`.
fn strategy_failure(err: Error) -> Result<String> {
    match err {
        Error::Acquisition(reason) | Error::Parse(reason) => Ok(reason),
        Error::CommandNotFound(cmd) => Ok(format!("{} is not available", cmd)),
        e @ Error::Command { .. } => Ok(e.to_string()),
        other => Err(other),
    }
}

/// Parse the notAfter text of a certificate.
///
/// Accepts openssl's `Mar  5 12:00:00 2031 GMT` and certbot's
/// `2031-03-05 12:00:00+00:00`.
pub fn parse_not_after(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if let Ok(naive) = NaiveDateTime::parse_from_str(&collapsed, "%b %d %H:%M:%S %Y GMT") {
        return Some(naive.and_utc());
    }
    DateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%:z")
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Runs the acquisition state machine and the renewal operations
pub struct CertificateManager<'a> {
    edge: &'a dyn EdgeServer,
    ca: &'a dyn CertificateAuthority,
    mutator: ConfigMutator<'a>,
}

impl<'a> CertificateManager<'a> {
    pub fn new(
        edge: &'a dyn EdgeServer,
        ca: &'a dyn CertificateAuthority,
        static_sentinel: &str,
    ) -> Self {
        Self {
            edge,
            ca,
            mutator: ConfigMutator::new(edge, static_sentinel),
        }
    }

    /// Obtain a certificate for `config.domain`, falling back from standalone to the plugin.
    ///
    /// `site` is the live generated file; the plugin strategy is allowed to rewrite it.
    /// Strategy failures end in `Acquisition::Degraded`. An `Err` means the edge
    /// server or the site file was left in a state the caller must roll back.
    pub fn acquire(
        &self,
        ctx: &mut RunContext,
        config: &ProxyConfig,
        site: &Path,
        renew_existing: bool,
    ) -> Result<AcquisitionOutcome> {
        let mut trace = vec![CertState::NotRequested];
        let Some(email) = config.ssl_email.as_deref().filter(|_| config.ssl_enabled) else {
            return Ok(AcquisitionOutcome {
                result: Acquisition::Skipped,
                trace,
                proxy_restore: None,
                record: None,
            });
        };
        let domain = config.domain.as_str();
        trace.push(CertState::Requested);

        if let Some(paths) = self.ca.certificate_paths(domain) {
            trace.push(CertState::ExistingReused);
            ctx.info(format!("Reusing existing certificate for {}", domain));
            if renew_existing {
                trace.push(CertState::RenewalAttempt);
                match self.ca.renew(domain, true) {
                    Ok(()) => ctx.success(format!("Renewed certificate for {}", domain)),
                    Err(e) => ctx.warn(format!(
                        "Renewal of {} failed, keeping the current certificate: {}",
                        domain, e
                    )),
                }
            }
            trace.push(CertState::ResolvedSuccess);
            return Ok(self.issued(domain, paths, None, trace, None));
        }

        trace.push(CertState::StandaloneAttempt);
        let standalone = self.attempt_standalone(ctx, domain, email)?;
        if let Some(paths) = standalone {
            trace.push(CertState::StandaloneSucceeded);
            trace.push(CertState::ResolvedSuccess);
            return Ok(self.issued(
                domain,
                paths,
                Some(CertStrategy::Standalone),
                trace,
                None,
            ));
        }
        trace.push(CertState::StandaloneFailed);

        let file_backup = match fsops::backup_file(site) {
            Ok(path) => path,
            Err(e) => {
                trace.push(CertState::ResolvedDegraded);
                return Ok(AcquisitionOutcome {
                    result: Acquisition::Degraded(format!(
                        "standalone issuance failed and {} could not be backed up for the plugin: {}",
                        site.display(),
                        e
                    )),
                    trace,
                    proxy_restore: None,
                    record: None,
                });
            }
        };

        trace.push(CertState::PluginAttempt);
        ctx.info(format!("Trying the nginx plugin for {}", domain));
        let plugin = self.ca.issue_via_plugin(domain, email);
        let issued = plugin.and_then(|()| {
            self.ca.certificate_paths(domain).ok_or_else(|| {
                Error::acquisition("plugin reported success but no certificate files exist")
            })
        });

        match issued {
            Ok(paths) => {
                trace.push(CertState::PluginSucceeded);
                let restore = self
                    .mutator
                    .restore_proxy_after_external_mutation(ctx, site, &file_backup, config)?;
                if let ProxyRestoreOutcome::BackupReinstated(details) = &restore {
                    ctx.warn(format!(
                        "Plugin edits to {} were discarded: {}",
                        site.display(),
                        details
                    ));
                }
                ctx.success(format!("Certificate issued for {} via nginx plugin", domain));
                trace.push(CertState::ResolvedSuccess);
                Ok(self.issued(
                    domain,
                    paths,
                    Some(CertStrategy::WebserverPlugin),
                    trace,
                    Some(restore),
                ))
            }
            Err(e) => {
                fsops::restore_file_backup(&file_backup, site)?;
                let reason = strategy_failure(e)?;
                trace.push(CertState::PluginFailed);
                ctx.warn(format!(
                    "Could not obtain a certificate for {}; continuing HTTP-only",
                    domain
                ));
                trace.push(CertState::ResolvedDegraded);
                Ok(AcquisitionOutcome {
                    result: Acquisition::Degraded(format!(
                        "standalone and nginx plugin issuance both failed: {}",
                        reason
                    )),
                    trace,
                    proxy_restore: None,
                    record: None,
                })
            }
        }
    }

    fn issued(
        &self,
        domain: &str,
        paths: CertPaths,
        strategy: Option<CertStrategy>,
        trace: Vec<CertState>,
        proxy_restore: Option<ProxyRestoreOutcome>,
    ) -> AcquisitionOutcome {
        let record = CertificateRecord {
            issued_strategy: strategy,
            ..self.record_for(domain, Utc::now())
        };
        AcquisitionOutcome {
            result: Acquisition::Issued { paths, strategy },
            trace,
            proxy_restore,
            record: Some(record),
        }
    }

    /// Stop nginx, run the standalone challenge, bring nginx back no matter what
    fn attempt_standalone(
        &self,
        ctx: &mut RunContext,
        domain: &str,
        email: &str,
    ) -> Result<Option<CertPaths>> {
        ctx.info(format!("Stopping nginx for standalone issuance of {}", domain));
        if let Err(e) = self.edge.stop() {
            ctx.warn(format!("Could not stop nginx: {}", e));
        }

        let issued = self.ca.issue_standalone(domain, email);
        self.bring_back_up(ctx)?;

        match issued {
            Ok(()) => match self.ca.certificate_paths(domain) {
                Some(paths) => {
                    ctx.success(format!("Certificate issued for {} (standalone)", domain));
                    Ok(Some(paths))
                }
                None => {
                    ctx.warn("Standalone issuance reported success but left no certificate");
                    Ok(None)
                }
            },
            Err(e) => {
                let reason = strategy_failure(e)?;
                ctx.warn(format!("Standalone issuance failed: {}", reason));
                Ok(None)
            }
        }
    }

    fn bring_back_up(&self, ctx: &mut RunContext) -> Result<()> {
        if self.edge.start().is_ok() && self.edge.is_active() {
            return Ok(());
        }
        ctx.warn("nginx did not start after standalone issuance; restarting");
        if self.edge.restart().is_ok() && self.edge.is_active() {
            return Ok(());
        }
        ctx.error("nginx is down after standalone issuance");
        Err(Error::process(
            "nginx could not be started again after standalone issuance",
        ))
    }

    /// One record per certificate in the store, most urgent first
    pub fn certificate_report(&self, now: DateTime<Utc>) -> Result<Vec<CertificateRecord>> {
        let mut records = Vec::new();
        for domain in self.ca.list_certificates()? {
            records.push(self.record_for(&domain, now));
        }
        records.sort_by(|a, b| match (a.expiry, b.expiry) {
            (Some(x), Some(y)) => x.cmp(&y).then_with(|| a.domain.cmp(&b.domain)),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => a.domain.cmp(&b.domain),
        });
        Ok(records)
    }

    fn record_for(&self, domain: &str, now: DateTime<Utc>) -> CertificateRecord {
        if self.ca.certificate_paths(domain).is_none() {
            return CertificateRecord::absent(domain);
        }
        let raw = match self.ca.not_after(domain) {
            Ok(raw) => raw,
            Err(e) => {
                log::warn!("Could not read expiry of {}: {}", domain, e);
                None
            }
        };
        match raw.as_deref().and_then(parse_not_after) {
            Some(expiry) => CertificateRecord::from_expiry(domain, expiry, now),
            None => {
                if let Some(text) = raw {
                    log::warn!("Unrecognized notAfter for {}: {}", domain, text);
                }
                CertificateRecord {
                    status: CertStatus::Active,
                    ..CertificateRecord::absent(domain)
                }
            }
        }
    }

    /// Force-renew one certificate and reload only if the tree still passes `nginx -t`
    pub fn renew(
        &self,
        ctx: &mut RunContext,
        domain: &str,
        now: DateTime<Utc>,
    ) -> Result<RenewalReport> {
        if !self.ca.list_certificates()?.iter().any(|d| d == domain) {
            return Err(Error::NotFound(format!("No certificate for {}", domain)));
        }

        ctx.info(format!("Renewing certificate for {}", domain));
        if let Err(e) = self.ca.renew(domain, true) {
            let reason = strategy_failure(e)?;
            ctx.error(format!("Renewal of {} failed: {}", domain, reason));
            let record = CertificateRecord {
                status: CertStatus::RenewalFailed,
                ..self.record_for(domain, now)
            };
            return Ok(RenewalReport {
                domain: domain.to_string(),
                outcome: RenewalOutcome::Failed(reason),
                record,
            });
        }

        let outcome = match ReloadSupervisor::new(self.edge).apply(ctx, None) {
            Ok(_) => RenewalOutcome::Renewed,
            Err(Error::Syntax(details)) => {
                ctx.warn("Renewed, but the config tree fails its syntax check; not reloading");
                RenewalOutcome::RenewedNotReloaded(details)
            }
            Err(e) => return Err(e),
        };

        Ok(RenewalReport {
            domain: domain.to_string(),
            outcome,
            record: self.record_for(domain, now),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synth::ConfigSynthesizer;
    use crate::testing::{FakeCertificateAuthority, FakeEdgeServer};
    use crate::LocationKind;
    use chrono::TimeZone;
    use std::fs;
    use tempfile::tempdir;

    fn config() -> ProxyConfig {
        ProxyConfig::new("api.example.com", "10.0.0.5", 4000).with_ssl("ops@example.com", true)
    }

    #[test]
    fn test_parse_not_after_formats() {
        let expected = Utc.with_ymd_and_hms(2031, 3, 5, 12, 0, 0).unwrap();
        assert_eq!(parse_not_after("Mar  5 12:00:00 2031 GMT"), Some(expected));
        assert_eq!(parse_not_after("Mar 05 12:00:00 2031 GMT"), Some(expected));
        assert_eq!(parse_not_after("2031-03-05 12:00:00+00:00"), Some(expected));
        assert_eq!(parse_not_after("next tuesday"), None);
    }

    #[test]
    fn test_existing_certificate_is_reused() {
        let dir = tempdir().unwrap();
        let edge = FakeEdgeServer::new();
        let ca = FakeCertificateAuthority::new(dir.path());
        ca.seed_certificate("api.example.com", "Mar  5 12:00:00 2031 GMT")
            .unwrap();
        let manager = CertificateManager::new(&edge, &ca, "/var/www/html");
        let mut ctx = RunContext::new();

        let outcome = manager
            .acquire(&mut ctx, &config(), &dir.path().join("site"), false)
            .unwrap();
        assert!(matches!(
            outcome.result,
            Acquisition::Issued { strategy: None, .. }
        ));
        assert!(ca.calls().is_empty());
        assert!(edge.calls().is_empty());
    }

    #[test]
    fn test_standalone_restarts_nginx_even_on_failure() {
        let dir = tempdir().unwrap();
        let site = dir.path().join("api.example.com");
        fs::write(&site, ConfigSynthesizer::render_http_block(&config())).unwrap();
        let edge = FakeEdgeServer::new();
        let ca = FakeCertificateAuthority::new(&dir.path().join("live"));
        ca.standalone_succeeds(false);
        ca.plugin_succeeds(false);
        let manager = CertificateManager::new(&edge, &ca, "/var/www/html");
        let mut ctx = RunContext::new();

        let outcome = manager.acquire(&mut ctx, &config(), &site, false).unwrap();
        assert!(outcome.is_degraded());
        assert_eq!(edge.calls()[..2], ["stop", "start"]);
        assert!(edge.is_active());
        assert_eq!(
            outcome.trace.last(),
            Some(&CertState::ResolvedDegraded)
        );
        assert!(outcome.trace.contains(&CertState::PluginFailed));
    }

    #[test]
    fn test_plugin_fallback_restores_proxy_location() {
        let dir = tempdir().unwrap();
        let site = dir.path().join("api.example.com");
        let original = ConfigSynthesizer::render_http_block(&config());
        fs::write(&site, &original).unwrap();
        let edge = FakeEdgeServer::new();
        let ca = FakeCertificateAuthority::new(&dir.path().join("live"));
        ca.standalone_succeeds(false);
        ca.plugin_rewrites(&site);
        let manager = CertificateManager::new(&edge, &ca, "/var/www/html");
        let mut ctx = RunContext::new();

        let outcome = manager.acquire(&mut ctx, &config(), &site, false).unwrap();
        assert!(matches!(
            outcome.result,
            Acquisition::Issued {
                strategy: Some(CertStrategy::WebserverPlugin),
                ..
            }
        ));
        assert_eq!(
            outcome.proxy_restore,
            Some(ProxyRestoreOutcome::Restored {
                locations: 1,
                stripped: 6
            })
        );
        let text = fs::read_to_string(&site).unwrap();
        assert_eq!(text, original);
        let summary = ConfigMutator::new(&edge, "/var/www/html").inspect(&text);
        assert_eq!(
            summary.blocks[0].root_location,
            LocationKind::Proxy("10.0.0.5:4000".to_string())
        );
        assert_eq!(
            outcome.trace,
            vec![
                CertState::NotRequested,
                CertState::Requested,
                CertState::StandaloneAttempt,
                CertState::StandaloneFailed,
                CertState::PluginAttempt,
                CertState::PluginSucceeded,
                CertState::ResolvedSuccess,
            ]
        );
    }

    #[test]
    fn test_missing_plugin_degrades_instead_of_failing() {
        let dir = tempdir().unwrap();
        let site = dir.path().join("api.example.com");
        let original = ConfigSynthesizer::render_http_block(&config());
        fs::write(&site, &original).unwrap();
        let edge = FakeEdgeServer::new();
        let ca = FakeCertificateAuthority::new(&dir.path().join("live"));
        ca.standalone_succeeds(false);
        ca.plugin_unavailable();
        let manager = CertificateManager::new(&edge, &ca, "/var/www/html");
        let mut ctx = RunContext::new();

        let outcome = manager.acquire(&mut ctx, &config(), &site, false).unwrap();
        match &outcome.result {
            Acquisition::Degraded(reason) => assert!(reason.contains("certbot nginx plugin")),
            other => panic!("expected a degraded outcome, got {:?}", other),
        }
        assert!(outcome.trace.contains(&CertState::PluginFailed));
        assert!(outcome.record.is_none());
        assert_eq!(fs::read_to_string(&site).unwrap(), original);
        assert!(edge.is_active());
    }

    #[test]
    fn test_issued_record_carries_strategy() {
        let dir = tempdir().unwrap();
        let edge = FakeEdgeServer::new();
        let ca = FakeCertificateAuthority::new(dir.path());
        let manager = CertificateManager::new(&edge, &ca, "/var/www/html");
        let mut ctx = RunContext::new();

        let outcome = manager
            .acquire(&mut ctx, &config(), &dir.path().join("site"), false)
            .unwrap();
        let record = outcome.record.unwrap();
        assert_eq!(record.domain, "api.example.com");
        assert_eq!(record.issued_strategy, Some(CertStrategy::Standalone));
        assert_eq!(record.status, CertStatus::Active);

        // a reused certificate has no known strategy
        let again = manager
            .acquire(&mut ctx, &config(), &dir.path().join("site"), false)
            .unwrap();
        assert_eq!(again.record.unwrap().issued_strategy, None);
    }

    #[test]
    fn test_nginx_down_after_standalone_is_an_error() {
        let dir = tempdir().unwrap();
        let edge = FakeEdgeServer::new();
        edge.fail_starts(1);
        edge.fail_restarts(1);
        let ca = FakeCertificateAuthority::new(dir.path());
        let manager = CertificateManager::new(&edge, &ca, "/var/www/html");
        let mut ctx = RunContext::new();

        let err = manager
            .acquire(&mut ctx, &config(), &dir.path().join("site"), false)
            .unwrap_err();
        assert!(matches!(err, Error::Process(_)));
    }

    #[test]
    fn test_report_sorted_by_urgency() {
        let dir = tempdir().unwrap();
        let edge = FakeEdgeServer::new();
        let ca = FakeCertificateAuthority::new(dir.path());
        ca.seed_certificate("later.example.com", "Jun  1 00:00:00 2031 GMT")
            .unwrap();
        ca.seed_certificate("soon.example.com", "2030-01-10 00:00:00+00:00")
            .unwrap();
        ca.seed_certificate("gone.example.com", "Jan  1 00:00:00 2029 GMT")
            .unwrap();
        let manager = CertificateManager::new(&edge, &ca, "/var/www/html");
        let now = Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap();

        let report = manager.certificate_report(now).unwrap();
        let order: Vec<&str> = report.iter().map(|r| r.domain.as_str()).collect();
        assert_eq!(
            order,
            vec!["gone.example.com", "soon.example.com", "later.example.com"]
        );
        assert_eq!(report[0].status, CertStatus::Expired);
        assert_eq!(report[1].days_remaining(now), Some(9));
    }

    #[test]
    fn test_renewal_skips_reload_on_syntax_failure() {
        let dir = tempdir().unwrap();
        let edge = FakeEdgeServer::new();
        edge.fail_syntax_checks(1);
        let ca = FakeCertificateAuthority::new(dir.path());
        ca.seed_certificate("api.example.com", "Mar  5 12:00:00 2031 GMT")
            .unwrap();
        let manager = CertificateManager::new(&edge, &ca, "/var/www/html");
        let mut ctx = RunContext::new();

        let report = manager.renew(&mut ctx, "api.example.com", Utc::now()).unwrap();
        assert!(matches!(report.outcome, RenewalOutcome::RenewedNotReloaded(_)));
        assert_eq!(edge.calls(), vec!["validate"]);
        assert_eq!(ca.calls(), vec!["renew:api.example.com:true"]);
    }

    #[test]
    fn test_renewal_failure_marks_record() {
        let dir = tempdir().unwrap();
        let edge = FakeEdgeServer::new();
        let ca = FakeCertificateAuthority::new(dir.path());
        ca.seed_certificate("api.example.com", "Mar  5 12:00:00 2031 GMT")
            .unwrap();
        ca.renew_succeeds(false);
        let manager = CertificateManager::new(&edge, &ca, "/var/www/html");
        let mut ctx = RunContext::new();

        let report = manager.renew(&mut ctx, "api.example.com", Utc::now()).unwrap();
        assert!(matches!(report.outcome, RenewalOutcome::Failed(_)));
        assert_eq!(report.record.status, CertStatus::RenewalFailed);
        assert!(edge.calls().is_empty());

        let err = manager.renew(&mut ctx, "missing.example.com", Utc::now()).unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}

//! Transactional install and removal of proxied sites
//!
//! Every mutating operation runs under one [`Transaction`]: a snapshot of the
//! nginx config root is taken first, each reversible action is recorded as a
//! [`Step`], and any fatal error unwinds through [`ProvisioningEngine::rollback`]
//! before control returns to the caller.

use crate::backup::{BackupRef, BackupStore};
use crate::cert::{Acquisition, AcquisitionOutcome, CertificateManager, RenewalReport};
use crate::certbot::CertificateAuthority;
use crate::fsops;
use crate::mutator::{ConfigMutator, RedirectOutcome};
use crate::nginx::EdgeServer;
use crate::probe;
use crate::supervisor::ReloadSupervisor;
use crate::synth::{ConfigSynthesizer, MANAGED_HEADER};
use crate::{
    normalize_domain, validate_domain, CertificateRecord, ConfigFile, EngineConfig, Error,
    ProxyConfig, Result, RunContext, Warning,
};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

/// A reversible action taken by a transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    FileWritten { path: PathBuf, existed_before: bool },
    SymlinkCreated(PathBuf),
    HttpsAppended(PathBuf),
    RedirectInserted(PathBuf),
    SymlinkRemoved(PathBuf),
    FileRemoved(PathBuf),
}

/// State of the edge server once a rollback has finished
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SystemState {
    Restored,
    NeedsManualIntervention(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxOutcome {
    Committed,
    RolledBack(SystemState),
}

/// One install or remove, alive only for the duration of the call
#[derive(Debug, Clone)]
pub struct Transaction {
    pub id: Uuid,
    pub domain: String,
    pub backup: Option<BackupRef>,
    pub steps: Vec<Step>,
    pub outcome: Option<TxOutcome>,
}

impl Transaction {
    pub fn begin(domain: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            domain: domain.to_string(),
            backup: None,
            steps: Vec::new(),
            outcome: None,
        }
    }

    fn record(&mut self, step: Step) {
        log::debug!("[{}] step: {:?}", self.id, step);
        self.steps.push(step);
    }

    pub fn is_rolled_back(&self) -> bool {
        matches!(self.outcome, Some(TxOutcome::RolledBack(_)))
    }
}

#[derive(Debug, Clone)]
pub struct RollbackReport {
    pub state: SystemState,
    pub removed: Vec<PathBuf>,
    pub restored: Vec<PathBuf>,
    pub failures: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportStatus {
    Success,
    /// The proxy is live but an optional part (TLS, redirect) is missing
    PartialSuccess,
    Failed,
}

impl ReportStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReportStatus::Success => "success",
            ReportStatus::PartialSuccess => "partial-success",
            ReportStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Install,
    Remove,
}

/// Final summary of an install or remove
#[derive(Debug, Clone)]
pub struct OperationReport {
    pub operation: Operation,
    pub domain: String,
    pub status: ReportStatus,
    pub transaction: Transaction,
    pub certificate: Option<AcquisitionOutcome>,
    pub redirect: Option<RedirectOutcome>,
    pub warnings: Vec<Warning>,
    pub error: Option<String>,
    pub rollback: Option<RollbackReport>,
}

impl OperationReport {
    fn new(operation: Operation, transaction: Transaction) -> Self {
        Self {
            operation,
            domain: transaction.domain.clone(),
            status: ReportStatus::Failed,
            transaction,
            certificate: None,
            redirect: None,
            warnings: Vec::new(),
            error: None,
            rollback: None,
        }
    }

    /// Whether the site serves HTTPS after this operation
    pub fn https_live(&self) -> bool {
        self.status != ReportStatus::Failed
            && self
                .certificate
                .as_ref()
                .map_or(false, |c| c.paths().is_some())
    }

    /// Human-readable summary lines
    pub fn summary(&self) -> Vec<String> {
        let verb = match self.operation {
            Operation::Install => "install",
            Operation::Remove => "remove",
        };
        let mut lines = vec![format!(
            "{} {}: {}",
            verb,
            self.domain,
            self.status.as_str()
        )];
        if self.operation == Operation::Install && self.status != ReportStatus::Failed {
            let tls = match self.certificate.as_ref().map(|c| &c.result) {
                Some(Acquisition::Issued { .. }) => "HTTPS enabled",
                Some(Acquisition::Degraded(_)) => "HTTP only (certificate not obtained)",
                _ => "HTTP only",
            };
            lines.push(format!("  {}", tls));
        }
        for warning in &self.warnings {
            lines.push(format!("  warning: {}", warning));
        }
        if let Some(error) = &self.error {
            lines.push(format!("  error: {}", error));
        }
        if let Some(rollback) = &self.rollback {
            match &rollback.state {
                SystemState::Restored => lines.push("  rolled back; previous config restored".into()),
                SystemState::NeedsManualIntervention(why) => {
                    lines.push(format!("  rollback incomplete, manual intervention needed: {}", why))
                }
            }
        }
        lines
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstallOptions {
    /// TCP-probe the backend before touching nginx
    pub probe_backend: bool,
    /// Renew an existing certificate instead of only reusing it
    pub renew_existing: bool,
}

impl Default for InstallOptions {
    fn default() -> Self {
        Self {
            probe_backend: true,
            renew_existing: false,
        }
    }
}

/// A generated site file in sites-available
#[derive(Debug, Clone)]
pub struct SiteEntry {
    pub domain: String,
    pub path: PathBuf,
    pub enabled: bool,
    /// Carries the managed-file header
    pub managed: bool,
    pub summary: ConfigFile,
}

pub struct ProvisioningEngine<'a> {
    config: &'a EngineConfig,
    edge: &'a dyn EdgeServer,
    ca: &'a dyn CertificateAuthority,
    backups: BackupStore,
}

impl<'a> ProvisioningEngine<'a> {
    pub fn new(
        config: &'a EngineConfig,
        edge: &'a dyn EdgeServer,
        ca: &'a dyn CertificateAuthority,
    ) -> Self {
        Self {
            config,
            edge,
            ca,
            backups: BackupStore::new(
                config.nginx.config_root.clone(),
                config.backup.root.clone(),
            ),
        }
    }

    pub fn backups(&self) -> &BackupStore {
        &self.backups
    }

    fn supervisor(&self) -> ReloadSupervisor<'a> {
        ReloadSupervisor::new(self.edge)
    }

    fn mutator(&self) -> ConfigMutator<'a> {
        ConfigMutator::new(self.edge, self.config.certbot.static_sentinel.as_str())
    }

    fn certificates(&self) -> CertificateManager<'a> {
        CertificateManager::new(self.edge, self.ca, &self.config.certbot.static_sentinel)
    }

    /// Provision `proxy` end to end.
    ///
    /// Invalid input is returned as `Err(Validation)` before anything is
    /// touched. Every later failure is rolled back and reported as `Failed`.
    pub fn install(
        &self,
        ctx: &mut RunContext,
        proxy: &ProxyConfig,
        options: &InstallOptions,
    ) -> Result<OperationReport> {
        proxy.validate()?;
        let mut report = OperationReport::new(Operation::Install, Transaction::begin(&proxy.domain));
        ctx.info(format!(
            "[{}] Installing {} -> {}",
            report.transaction.id,
            proxy.domain,
            proxy.backend_authority()
        ));

        if options.probe_backend {
            let timeout = Duration::from_secs(self.config.probe.connect_timeout_secs);
            if let Err(e) = probe::test_tcp_connection(&proxy.backend_host, proxy.backend_port, timeout)
            {
                ctx.warn(format!("Backend probe failed: {}", e));
                report.warnings.push(Warning::from(&e));
            }
        }

        self.take_snapshot(ctx, "install", &mut report);

        let result = self.provision(ctx, proxy, options, &mut report);
        self.finish(ctx, result, &mut report);
        Ok(report)
    }

    fn take_snapshot(&self, ctx: &mut RunContext, label: &str, report: &mut OperationReport) {
        match self
            .backups
            .snapshot(&format!("{}-{}", label, report.domain))
        {
            Ok(backup) => {
                ctx.info(format!("Backup taken at {}", backup.path.display()));
                report.transaction.backup = Some(backup);
            }
            Err(e) => {
                ctx.warn(format!("Backup failed, continuing without one: {}", e));
                report.warnings.push(Warning::Resource(e.to_string()));
            }
        }
    }

    fn provision(
        &self,
        ctx: &mut RunContext,
        proxy: &ProxyConfig,
        options: &InstallOptions,
        report: &mut OperationReport,
    ) -> Result<()> {
        let site = self.config.site_available(&proxy.domain);
        let link = self.config.site_enabled(&proxy.domain);
        let tx = &mut report.transaction;

        let existed_before = fsops::exists_no_follow(&site);
        fsops::write_atomic(&site, &ConfigSynthesizer::render_http_block(proxy))?;
        tx.record(Step::FileWritten {
            path: site.clone(),
            existed_before,
        });
        ctx.info(format!("Wrote {}", site.display()));

        let new_link = fsops::create_symlink(&site, &link)?;
        if new_link {
            tx.record(Step::SymlinkCreated(link.clone()));
        }
        let added_link = new_link.then_some(link.as_path());

        self.supervisor().apply(ctx, added_link)?;

        if !proxy.ssl_enabled {
            return Ok(());
        }

        let outcome = match self
            .certificates()
            .acquire(ctx, proxy, &site, options.renew_existing)
        {
            Ok(outcome) => outcome,
            Err(e) if !e.is_fatal() => {
                ctx.warn(format!("Certificate phase for {} failed: {}", proxy.domain, e));
                AcquisitionOutcome::degraded(e.to_string())
            }
            Err(e) => return Err(e),
        };
        let issued = outcome.paths().cloned();
        if let Acquisition::Degraded(reason) = &outcome.result {
            report.warnings.push(Warning::Acquisition(reason.clone()));
        }
        report.certificate = Some(outcome);

        if let Some(paths) = issued {
            let mutator = self.mutator();
            if mutator.append_https(ctx, &site, proxy, &paths)? {
                report.transaction.record(Step::HttpsAppended(site.clone()));
            }
            if proxy.wants_redirect() {
                let redirect = mutator.insert_redirect(ctx, &site)?;
                match &redirect {
                    RedirectOutcome::Replaced | RedirectOutcome::Anchored => {
                        report.transaction.record(Step::RedirectInserted(site.clone()))
                    }
                    RedirectOutcome::AlreadyPresent => {}
                    RedirectOutcome::Degraded(reason) => {
                        ctx.warn(format!(
                            "HTTP to HTTPS redirect not installed, add it by hand: {}",
                            reason
                        ));
                        report
                            .warnings
                            .push(Warning::RedirectNotInstalled(reason.clone()));
                    }
                }
                report.redirect = Some(redirect);
            }
            self.verify_site(&site, report.redirect.as_ref())?;
        }

        self.supervisor().apply(ctx, added_link)?;
        Ok(())
    }

    /// Post-apply assertion on the final file
    fn verify_site(&self, site: &Path, redirect: Option<&RedirectOutcome>) -> Result<()> {
        let summary = self.mutator().inspect(&fs::read_to_string(site)?);
        let tls_blocks = summary.blocks.iter().filter(|b| b.is_https()).count();
        let https_ok = tls_blocks == 1 && summary.https_block().map_or(false, |b| b.has_proxy());
        let http = summary.http_block();
        let redirect_expected = redirect.map_or(false, |r| r.is_installed());
        let http_ok = match http {
            Some(b) if redirect_expected => b.redirects(),
            Some(b) => b.has_proxy() || b.redirects(),
            None => false,
        };
        if https_ok && http_ok {
            Ok(())
        } else {
            Err(Error::syntax(format!(
                "{} does not have the expected HTTP/HTTPS server blocks ({} found)",
                site.display(),
                summary.blocks.len()
            )))
        }
    }

    fn finish(&self, ctx: &mut RunContext, result: Result<()>, report: &mut OperationReport) {
        match result {
            Ok(()) => {
                let site = self.config.site_available(&report.domain);
                match fsops::remove_artifacts(&site) {
                    Ok(removed) if !removed.is_empty() => {
                        log::debug!("Removed {} leftover artifact(s)", removed.len())
                    }
                    Ok(_) => {}
                    Err(e) => report.warnings.push(Warning::Resource(format!(
                        "could not clean up artifacts of {}: {}",
                        site.display(),
                        e
                    ))),
                }
                report.transaction.outcome = Some(TxOutcome::Committed);
                let partial = report.warnings.iter().any(|w| {
                    matches!(
                        w,
                        Warning::Acquisition(_) | Warning::RedirectNotInstalled(_)
                    )
                });
                report.status = if partial {
                    ctx.warn(format!("{} completed with degraded features", report.domain));
                    ReportStatus::PartialSuccess
                } else {
                    ctx.success(format!("{} completed", report.domain));
                    ReportStatus::Success
                };
            }
            Err(e) => {
                ctx.error(format!("Operation on {} failed: {}", report.domain, e));
                report.error = Some(e.to_string());
                report.status = ReportStatus::Failed;
                let rollback = self.rollback(ctx, &mut report.transaction);
                report.rollback = Some(rollback);
            }
        }
    }

    /// Undo every recorded step and confirm nginx is healthy.
    ///
    /// Calling it again, or on a transaction with no steps, only re-confirms health.
    pub fn rollback(&self, ctx: &mut RunContext, tx: &mut Transaction) -> RollbackReport {
        let mut removed = Vec::new();
        let mut restored = Vec::new();
        let mut failures = Vec::new();

        if tx.is_rolled_back() || tx.steps.is_empty() {
            ctx.info(format!("[{}] Nothing to undo; checking nginx health", tx.id));
        } else {
            ctx.warn(format!("[{}] Rolling back {}", tx.id, tx.domain));
            let site = self.config.site_available(&tx.domain);
            let link = self.config.site_enabled(&tx.domain);

            for step in tx.steps.iter().rev() {
                let target = match step {
                    Step::SymlinkCreated(created) => Some(created),
                    Step::FileWritten {
                        path,
                        existed_before: false,
                    } => Some(path),
                    _ => None,
                };
                if let Some(path) = target {
                    match fsops::remove_if_exists(path) {
                        Ok(true) => removed.push(path.clone()),
                        Ok(false) => {}
                        Err(e) => failures.push(format!("remove {}: {}", path.display(), e)),
                    }
                }
            }

            match fsops::remove_artifacts(&site) {
                Ok(paths) => removed.extend(paths),
                Err(e) => failures.push(format!("artifacts of {}: {}", site.display(), e)),
            }

            let needs_restore = tx.steps.iter().any(|s| {
                matches!(
                    s,
                    Step::FileWritten {
                        existed_before: true,
                        ..
                    } | Step::FileRemoved(_)
                        | Step::SymlinkRemoved(_)
                )
            });
            match &tx.backup {
                Some(backup) => {
                    for path in [&site, &link] {
                        let Some(relative) = self.config.relative_to_root(path) else {
                            continue;
                        };
                        if !backup.contains(relative) {
                            continue;
                        }
                        match self.backups.restore_entry(backup, relative) {
                            Ok(()) => restored.push(path.clone()),
                            Err(e) => failures.push(format!("restore {}: {}", path.display(), e)),
                        }
                    }
                }
                None if needs_restore => {
                    failures.push("no backup was taken; overwritten files cannot be restored".into())
                }
                None => {}
            }
        }

        let state = if !failures.is_empty() {
            SystemState::NeedsManualIntervention(failures.join("; "))
        } else if let Err(e) = self.edge.validate_syntax() {
            SystemState::NeedsManualIntervention(format!(
                "config still fails its syntax check after rollback: {}",
                e
            ))
        } else if !self.supervisor().reload_or_restart(ctx) {
            SystemState::NeedsManualIntervention("nginx is not running after rollback".into())
        } else {
            SystemState::Restored
        };

        match &state {
            SystemState::Restored => ctx.success(format!("[{}] Previous state restored", tx.id)),
            SystemState::NeedsManualIntervention(why) => {
                ctx.error(format!("[{}] Manual intervention needed: {}", tx.id, why))
            }
        }
        tx.outcome = Some(TxOutcome::RolledBack(state.clone()));

        RollbackReport {
            state,
            removed,
            restored,
            failures,
        }
    }

    /// Disable and delete a site, optionally deleting its certificate too
    pub fn remove(
        &self,
        ctx: &mut RunContext,
        domain: &str,
        delete_certificate: bool,
    ) -> Result<OperationReport> {
        let domain = normalize_domain(domain);
        validate_domain(&domain)?;
        let site = self.config.site_available(&domain);
        let link = self.config.site_enabled(&domain);
        if !fsops::exists_no_follow(&site) && !fsops::exists_no_follow(&link) {
            return Err(Error::NotFound(format!("No site configured for {}", domain)));
        }

        let mut report = OperationReport::new(Operation::Remove, Transaction::begin(&domain));
        ctx.info(format!("[{}] Removing {}", report.transaction.id, domain));
        let backup = self
            .backups
            .snapshot(&format!("remove-{}", domain))
            .map_err(|e| Error::resource(format!("refusing to remove without a backup: {}", e)))?;
        report.transaction.backup = Some(backup);

        let result = self.unprovision(ctx, &site, &link, &mut report.transaction);
        self.finish(ctx, result, &mut report);

        if delete_certificate && report.status != ReportStatus::Failed {
            match self.ca.delete(&domain) {
                Ok(()) => ctx.success(format!("Deleted certificate for {}", domain)),
                Err(e) => {
                    ctx.warn(format!("Could not delete certificate for {}: {}", domain, e));
                    report.warnings.push(Warning::Resource(e.to_string()));
                }
            }
        }
        Ok(report)
    }

    fn unprovision(
        &self,
        ctx: &mut RunContext,
        site: &Path,
        link: &Path,
        tx: &mut Transaction,
    ) -> Result<()> {
        if fsops::remove_if_exists(link)? {
            tx.record(Step::SymlinkRemoved(link.to_path_buf()));
            ctx.info(format!("Disabled {}", link.display()));
        }
        if fsops::remove_if_exists(site)? {
            tx.record(Step::FileRemoved(site.to_path_buf()));
            ctx.info(format!("Deleted {}", site.display()));
        }
        fsops::remove_artifacts(site)?;
        self.supervisor().apply(ctx, None)?;
        Ok(())
    }

    /// Force-renew one certificate
    pub fn renew(&self, ctx: &mut RunContext, domain: &str) -> Result<RenewalReport> {
        let domain = normalize_domain(domain);
        validate_domain(&domain)?;
        self.certificates().renew(ctx, &domain, chrono::Utc::now())
    }

    /// Every stored certificate, most urgent first
    pub fn certificate_report(&self) -> Result<Vec<CertificateRecord>> {
        self.certificates().certificate_report(chrono::Utc::now())
    }

    /// Site files in sites-available, sorted by domain
    pub fn list_sites(&self) -> Result<Vec<SiteEntry>> {
        let dir = &self.config.nginx.sites_available;
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mutator = self.mutator();
        let mut sites = Vec::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if name.ends_with(fsops::TEMP_SUFFIX)
                || name.ends_with(fsops::FILE_BACKUP_SUFFIX)
                || !path.is_file()
            {
                continue;
            }
            let text = fs::read_to_string(&path)?;
            sites.push(SiteEntry {
                domain: name.to_string(),
                enabled: self.config.site_enabled(name).exists(),
                managed: text.starts_with(MANAGED_HEADER),
                summary: mutator.inspect(&text),
                path,
            });
        }
        sites.sort_by(|a, b| a.domain.cmp(&b.domain));
        Ok(sites)
    }
}

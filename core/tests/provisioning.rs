use nginx_proxy_core::testing::{FakeCertificateAuthority, FakeEdgeServer};
use nginx_proxy_core::{
    Acquisition, CertState, CertStrategy, ConfigMutator, ConfigSynthesizer, EdgeServer, EngineConfig,
    Error,
    InstallOptions, LocationKind, ProvisioningEngine, ProxyConfig, RedirectOutcome, ReportStatus,
    RunContext, Step, SystemState, TxOutcome, Warning,
};
use std::fs;
use std::path::Path;
use tempfile::{tempdir, TempDir};

fn setup() -> (TempDir, EngineConfig) {
    let dir = tempdir().unwrap();
    let config = EngineConfig::rooted(dir.path());
    fs::create_dir_all(&config.nginx.sites_available).unwrap();
    fs::create_dir_all(&config.nginx.sites_enabled).unwrap();
    (dir, config)
}

fn no_probe() -> InstallOptions {
    InstallOptions {
        probe_backend: false,
        renew_existing: false,
    }
}

fn api_proxy() -> ProxyConfig {
    ProxyConfig::new("api.example.com", "10.0.0.5", 4000)
}

fn summary_of(edge: &FakeEdgeServer, path: &Path) -> nginx_proxy_core::ConfigFile {
    ConfigMutator::new(edge, "/var/www/html").inspect(&fs::read_to_string(path).unwrap())
}

#[test]
fn test_http_only_install() {
    let (_dir, config) = setup();
    let edge = FakeEdgeServer::watching(&config.nginx.sites_enabled);
    let ca = FakeCertificateAuthority::new(&config.certbot.live_dir);
    let engine = ProvisioningEngine::new(&config, &edge, &ca);
    let mut ctx = RunContext::new();

    let proxy = ProxyConfig::new("WWW.Example.COM", "127.0.0.1", 3000);
    let report = engine.install(&mut ctx, &proxy, &no_probe()).unwrap();

    assert_eq!(report.status, ReportStatus::Success);
    assert_eq!(report.domain, "example.com");
    let site = config.site_available("example.com");
    let link = config.site_enabled("example.com");
    assert_eq!(
        fs::read_to_string(&site).unwrap(),
        ConfigSynthesizer::render_http_block(&proxy)
    );
    assert_eq!(fs::read_link(&link).unwrap(), site);
    assert_eq!(edge.calls(), vec!["validate", "reload"]);
    assert!(ca.calls().is_empty());
    assert_eq!(report.transaction.outcome, Some(TxOutcome::Committed));
    assert_eq!(
        report.transaction.steps,
        vec![
            Step::FileWritten {
                path: site.clone(),
                existed_before: false
            },
            Step::SymlinkCreated(link),
        ]
    );
    assert_eq!(engine.backups().list().unwrap().len(), 1);
}

#[test]
fn test_ssl_install_with_redirect() {
    let (_dir, config) = setup();
    let edge = FakeEdgeServer::watching(&config.nginx.sites_enabled);
    let ca = FakeCertificateAuthority::new(&config.certbot.live_dir);
    let engine = ProvisioningEngine::new(&config, &edge, &ca);
    let mut ctx = RunContext::new();

    let proxy = api_proxy().with_ssl("ops@example.com", true);
    let report = engine.install(&mut ctx, &proxy, &no_probe()).unwrap();

    assert_eq!(report.status, ReportStatus::Success);
    assert!(report.https_live());
    let cert = report.certificate.as_ref().unwrap();
    assert!(matches!(
        cert.result,
        Acquisition::Issued {
            strategy: Some(CertStrategy::Standalone),
            ..
        }
    ));
    assert_eq!(report.redirect, Some(RedirectOutcome::Replaced));

    let site = config.site_available("api.example.com");
    let file = summary_of(&edge, &site);
    assert_eq!(file.blocks.len(), 2);
    let http = file.http_block().unwrap();
    assert!(http.redirects() && !http.has_proxy());
    let https = file.https_block().unwrap();
    assert_eq!(
        https.root_location,
        LocationKind::Proxy("10.0.0.5:4000".to_string())
    );

    let calls = edge.calls();
    let stop = calls.iter().position(|c| c == "stop").unwrap();
    assert_eq!(calls[stop + 1], "start");
    assert_eq!(calls.last().map(String::as_str), Some("reload"));
    assert!(report
        .transaction
        .steps
        .contains(&Step::HttpsAppended(site.clone())));
}

#[test]
fn test_plugin_fallback_keeps_proxy_location() {
    let (_dir, config) = setup();
    let site = config.site_available("api.example.com");
    let edge = FakeEdgeServer::watching(&config.nginx.sites_enabled);
    let ca = FakeCertificateAuthority::new(&config.certbot.live_dir);
    ca.standalone_succeeds(false);
    ca.plugin_rewrites(&site);
    let engine = ProvisioningEngine::new(&config, &edge, &ca);
    let mut ctx = RunContext::new();

    let proxy = api_proxy().with_ssl("ops@example.com", false);
    let report = engine.install(&mut ctx, &proxy, &no_probe()).unwrap();

    assert_eq!(report.status, ReportStatus::Success);
    let cert = report.certificate.as_ref().unwrap();
    assert!(cert.trace.contains(&CertState::StandaloneFailed));
    assert!(cert.trace.contains(&CertState::PluginSucceeded));

    let text = fs::read_to_string(&site).unwrap();
    assert!(!text.contains("root /var/www/html"));
    let file = summary_of(&edge, &site);
    let https = file.https_block().unwrap();
    assert_eq!(
        https.root_location,
        LocationKind::Proxy("10.0.0.5:4000".to_string())
    );
    // no redirect requested: HTTP keeps serving the proxy
    assert!(file.http_block().unwrap().has_proxy());
    assert!(report.redirect.is_none());
    assert!(!Path::new(&format!("{}.wizard-bak", site.display())).exists());
}

#[test]
fn test_plugin_fallback_with_redirect_leaves_one_tls_block() {
    let (_dir, config) = setup();
    let site = config.site_available("api.example.com");
    let edge = FakeEdgeServer::watching(&config.nginx.sites_enabled);
    let ca = FakeCertificateAuthority::new(&config.certbot.live_dir);
    ca.standalone_succeeds(false);
    ca.plugin_rewrites(&site);
    let engine = ProvisioningEngine::new(&config, &edge, &ca);
    let mut ctx = RunContext::new();

    let proxy = api_proxy().with_ssl("ops@example.com", true);
    let report = engine.install(&mut ctx, &proxy, &no_probe()).unwrap();

    assert_eq!(report.status, ReportStatus::Success);
    assert_eq!(report.redirect, Some(RedirectOutcome::Replaced));
    let text = fs::read_to_string(&site).unwrap();
    assert!(!text.contains("managed by Certbot"));

    let file = summary_of(&edge, &site);
    assert_eq!(file.blocks.len(), 2);
    let http = &file.blocks[0];
    assert!(!http.is_https() && !http.listens_on(443));
    assert!(http.redirects() && !http.has_proxy());
    let https = &file.blocks[1];
    assert!(https.is_https() && !https.redirects());
    assert_eq!(
        https.root_location,
        LocationKind::Proxy("10.0.0.5:4000".to_string())
    );
    let record = report.certificate.unwrap().record.unwrap();
    assert_eq!(record.issued_strategy, Some(CertStrategy::WebserverPlugin));
}

#[test]
fn test_missing_plugin_keeps_http_site() {
    let (_dir, config) = setup();
    let edge = FakeEdgeServer::watching(&config.nginx.sites_enabled);
    let ca = FakeCertificateAuthority::new(&config.certbot.live_dir);
    ca.standalone_succeeds(false);
    ca.plugin_unavailable();
    let engine = ProvisioningEngine::new(&config, &edge, &ca);
    let mut ctx = RunContext::new();

    let proxy = api_proxy().with_ssl("ops@example.com", true);
    let report = engine.install(&mut ctx, &proxy, &no_probe()).unwrap();

    assert_eq!(report.status, ReportStatus::PartialSuccess);
    assert!(report.error.is_none() && report.rollback.is_none());
    assert!(report.certificate.as_ref().unwrap().is_degraded());
    let site = config.site_available("api.example.com");
    assert_eq!(
        fs::read_to_string(&site).unwrap(),
        ConfigSynthesizer::render_http_block(&proxy)
    );
    assert_eq!(
        fs::read_link(config.site_enabled("api.example.com")).unwrap(),
        site
    );
    assert_eq!(report.transaction.outcome, Some(TxOutcome::Committed));
}

#[test]
fn test_both_strategies_failing_is_degraded() {
    let (_dir, config) = setup();
    let edge = FakeEdgeServer::watching(&config.nginx.sites_enabled);
    let ca = FakeCertificateAuthority::new(&config.certbot.live_dir);
    ca.standalone_succeeds(false);
    ca.plugin_succeeds(false);
    let engine = ProvisioningEngine::new(&config, &edge, &ca);
    let mut ctx = RunContext::new();

    let proxy = api_proxy().with_ssl("ops@example.com", true);
    let report = engine.install(&mut ctx, &proxy, &no_probe()).unwrap();

    assert_eq!(report.status, ReportStatus::PartialSuccess);
    assert_ne!(report.status, ReportStatus::Success);
    assert!(report.certificate.as_ref().unwrap().is_degraded());
    assert!(report
        .warnings
        .iter()
        .any(|w| matches!(w, Warning::Acquisition(_))));
    assert!(!report.https_live());

    let site = config.site_available("api.example.com");
    assert_eq!(
        fs::read_to_string(&site).unwrap(),
        ConfigSynthesizer::render_http_block(&proxy)
    );
    assert!(config.site_enabled("api.example.com").exists());
    assert!(edge.is_active());
    assert_eq!(report.transaction.outcome, Some(TxOutcome::Committed));
}

#[test]
fn test_rollback_restores_previous_file_byte_identical() {
    let (_dir, config) = setup();
    let site = config.site_available("example.com");
    let previous = ConfigSynthesizer::render_http_block(&ProxyConfig::new(
        "example.com",
        "127.0.0.1",
        3000,
    ));
    fs::write(&site, &previous).unwrap();

    let edge = FakeEdgeServer::new();
    edge.fail_syntax_checks(1);
    let ca = FakeCertificateAuthority::new(&config.certbot.live_dir);
    let engine = ProvisioningEngine::new(&config, &edge, &ca);
    let mut ctx = RunContext::new();

    let proxy = ProxyConfig::new("example.com", "127.0.0.1", 4000);
    let mut report = engine.install(&mut ctx, &proxy, &no_probe()).unwrap();

    assert_eq!(report.status, ReportStatus::Failed);
    assert!(report.error.as_deref().unwrap().contains("syntax"));
    let rollback = report.rollback.clone().unwrap();
    assert_eq!(rollback.state, SystemState::Restored);
    assert_eq!(fs::read_to_string(&site).unwrap(), previous);
    assert!(!config.site_enabled("example.com").exists());
    assert!(matches!(
        report.transaction.outcome,
        Some(TxOutcome::RolledBack(SystemState::Restored))
    ));

    // a second rollback only re-checks health
    let again = engine.rollback(&mut ctx, &mut report.transaction);
    assert_eq!(again.state, SystemState::Restored);
    assert!(again.removed.is_empty());
    assert!(again.restored.is_empty());
    assert_eq!(fs::read_to_string(&site).unwrap(), previous);
}

#[test]
fn test_failure_after_tls_phase_restores_previous_site() {
    let (_dir, config) = setup();
    let edge = FakeEdgeServer::watching(&config.nginx.sites_enabled);
    let ca = FakeCertificateAuthority::new(&config.certbot.live_dir);
    let engine = ProvisioningEngine::new(&config, &edge, &ca);
    let mut ctx = RunContext::new();

    let first = api_proxy().with_ssl("ops@example.com", true);
    engine.install(&mut ctx, &first, &no_probe()).unwrap();
    let site = config.site_available("api.example.com");
    let link = config.site_enabled("api.example.com");
    let previous = fs::read_to_string(&site).unwrap();

    // first apply, HTTPS append and redirect pass; the final apply is rejected
    edge.fail_syntax_check_after(3);
    let moved = ProxyConfig::new("api.example.com", "10.0.0.6", 4001)
        .with_ssl("ops@example.com", true);
    let report = engine.install(&mut ctx, &moved, &no_probe()).unwrap();

    assert_eq!(report.status, ReportStatus::Failed);
    assert!(report.error.as_deref().unwrap().contains("syntax"));
    let steps = &report.transaction.steps;
    assert!(steps.contains(&Step::FileWritten {
        path: site.clone(),
        existed_before: true
    }));
    assert!(steps.contains(&Step::HttpsAppended(site.clone())));
    assert!(steps.contains(&Step::RedirectInserted(site.clone())));

    assert_eq!(report.rollback.unwrap().state, SystemState::Restored);
    assert_eq!(fs::read_to_string(&site).unwrap(), previous);
    assert_eq!(fs::read_link(&link).unwrap(), site);
    assert!(edge.is_active());
}

#[test]
fn test_rollback_keeps_preexisting_link() {
    let (_dir, config) = setup();
    let site = config.site_available("example.com");
    let link = config.site_enabled("example.com");
    fs::write(&site, "server {\n    listen 80;\n}\n").unwrap();
    std::os::unix::fs::symlink(&site, &link).unwrap();

    let edge = FakeEdgeServer::new();
    edge.fail_syntax_checks(1);
    let ca = FakeCertificateAuthority::new(&config.certbot.live_dir);
    let engine = ProvisioningEngine::new(&config, &edge, &ca);
    let mut ctx = RunContext::new();

    let proxy = ProxyConfig::new("example.com", "127.0.0.1", 4000);
    let report = engine.install(&mut ctx, &proxy, &no_probe()).unwrap();

    assert_eq!(report.status, ReportStatus::Failed);
    assert_eq!(fs::read_link(&link).unwrap(), site);
    assert_eq!(
        fs::read_to_string(&site).unwrap(),
        "server {\n    listen 80;\n}\n"
    );
}

#[test]
fn test_emergency_reversion_then_rollback() {
    let (_dir, config) = setup();
    let edge = FakeEdgeServer::new();
    edge.reload_leaves_inactive(true);
    edge.fail_restarts(1);
    let ca = FakeCertificateAuthority::new(&config.certbot.live_dir);
    let engine = ProvisioningEngine::new(&config, &edge, &ca);
    let mut ctx = RunContext::new();

    let report = engine
        .install(&mut ctx, &api_proxy(), &no_probe())
        .unwrap();

    assert_eq!(report.status, ReportStatus::Failed);
    assert_eq!(report.rollback.unwrap().state, SystemState::Restored);
    assert!(!config.site_enabled("api.example.com").exists());
    assert!(!config.site_available("api.example.com").exists());
    assert!(edge.is_active());
}

#[test]
fn test_broken_neighbour_needs_manual_intervention() {
    let (_dir, config) = setup();
    fs::write(
        config.nginx.sites_enabled.join("legacy.conf"),
        "server {\n    listen 8080;\n",
    )
    .unwrap();
    let edge = FakeEdgeServer::watching(&config.nginx.sites_enabled);
    let ca = FakeCertificateAuthority::new(&config.certbot.live_dir);
    let engine = ProvisioningEngine::new(&config, &edge, &ca);
    let mut ctx = RunContext::new();

    let report = engine
        .install(&mut ctx, &api_proxy(), &no_probe())
        .unwrap();

    assert_eq!(report.status, ReportStatus::Failed);
    let rollback = report.rollback.unwrap();
    assert!(matches!(
        rollback.state,
        SystemState::NeedsManualIntervention(_)
    ));
    // our own changes are still undone
    assert!(!config.site_available("api.example.com").exists());
    assert!(!config.site_enabled("api.example.com").exists());
    assert!(ctx.error_count() > 0);
}

#[test]
fn test_remove_site_and_certificate() {
    let (_dir, config) = setup();
    let edge = FakeEdgeServer::watching(&config.nginx.sites_enabled);
    let ca = FakeCertificateAuthority::new(&config.certbot.live_dir);
    let engine = ProvisioningEngine::new(&config, &edge, &ca);
    let mut ctx = RunContext::new();

    let proxy = api_proxy().with_ssl("ops@example.com", true);
    engine.install(&mut ctx, &proxy, &no_probe()).unwrap();
    assert_eq!(engine.list_sites().unwrap().len(), 1);

    let report = engine.remove(&mut ctx, "api.example.com", true).unwrap();
    assert_eq!(report.status, ReportStatus::Success);
    assert!(!config.site_available("api.example.com").exists());
    assert!(!config.site_enabled("api.example.com").exists());
    assert!(ca.calls().contains(&"delete:api.example.com".to_string()));
    assert!(engine.list_sites().unwrap().is_empty());
    assert!(engine.certificate_report().unwrap().is_empty());
}

#[test]
fn test_failed_remove_restores_site_and_link() {
    let (_dir, config) = setup();
    let edge = FakeEdgeServer::new();
    let ca = FakeCertificateAuthority::new(&config.certbot.live_dir);
    let engine = ProvisioningEngine::new(&config, &edge, &ca);
    let mut ctx = RunContext::new();

    engine
        .install(&mut ctx, &api_proxy(), &no_probe())
        .unwrap();
    let site = config.site_available("api.example.com");
    let link = config.site_enabled("api.example.com");
    let before = fs::read_to_string(&site).unwrap();

    edge.fail_syntax_checks(1);
    let report = engine.remove(&mut ctx, "api.example.com", true).unwrap();

    assert_eq!(report.status, ReportStatus::Failed);
    assert_eq!(fs::read_to_string(&site).unwrap(), before);
    assert_eq!(fs::read_link(&link).unwrap(), site);
    assert!(!ca.calls().iter().any(|c| c.starts_with("delete:")));
}

#[test]
fn test_remove_unknown_domain() {
    let (_dir, config) = setup();
    let edge = FakeEdgeServer::new();
    let ca = FakeCertificateAuthority::new(&config.certbot.live_dir);
    let engine = ProvisioningEngine::new(&config, &edge, &ca);
    let mut ctx = RunContext::new();

    let err = engine
        .remove(&mut ctx, "nothing.example.com", false)
        .unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
    assert!(edge.calls().is_empty());
}

#[test]
fn test_reinstall_reuses_certificate() {
    let (_dir, config) = setup();
    let edge = FakeEdgeServer::watching(&config.nginx.sites_enabled);
    let ca = FakeCertificateAuthority::new(&config.certbot.live_dir);
    let engine = ProvisioningEngine::new(&config, &edge, &ca);
    let mut ctx = RunContext::new();

    let proxy = api_proxy().with_ssl("ops@example.com", true);
    let first = engine.install(&mut ctx, &proxy, &no_probe()).unwrap();
    let rendered = fs::read_to_string(config.site_available("api.example.com")).unwrap();
    let second = engine.install(&mut ctx, &proxy, &no_probe()).unwrap();

    assert_eq!(first.status, ReportStatus::Success);
    assert_eq!(second.status, ReportStatus::Success);
    assert!(matches!(
        second.certificate.unwrap().result,
        Acquisition::Issued { strategy: None, .. }
    ));
    assert_eq!(
        ca.calls()
            .iter()
            .filter(|c| c.starts_with("standalone:"))
            .count(),
        1
    );
    assert_eq!(
        fs::read_to_string(config.site_available("api.example.com")).unwrap(),
        rendered
    );
    assert_eq!(engine.backups().list().unwrap().len(), 2);
}

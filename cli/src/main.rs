//! Nginx Proxy Wizard - command line
//!
//! Thin front end over `nginx-proxy-core`: parses arguments, wires the real
//! nginx and certbot adapters, and prints the final summary.

use clap::{Parser, Subcommand};
use nginx_proxy_core::{
    parse_backend_port, CertbotAdapter, EngineConfig, InstallOptions, NginxAdapter,
    OperationReport, ProvisioningEngine, ProxyConfig, RenewalOutcome, ReportStatus, Result,
    RunContext,
};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "nginx-proxy-wizard")]
#[command(about = "Provision nginx reverse proxies with optional Let's Encrypt TLS", long_about = None)]
struct Cli {
    /// Config file (defaults to the user config dir)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Proxy a domain to a backend service
    Install {
        domain: String,
        backend_host: String,
        backend_port: String,
        /// Obtain a certificate and serve HTTPS
        #[arg(long, requires = "email")]
        ssl: bool,
        /// Contact address for the certificate authority
        #[arg(long)]
        email: Option<String>,
        /// Redirect HTTP to HTTPS once a certificate is in place
        #[arg(long, requires = "ssl")]
        force_https: bool,
        /// Skip the backend connectivity probe
        #[arg(long)]
        no_probe: bool,
        /// Renew an existing certificate instead of reusing it as is
        #[arg(long)]
        renew: bool,
    },
    /// Disable and delete a domain's site
    Remove {
        domain: String,
        /// Also delete the domain's certificate
        #[arg(long)]
        delete_cert: bool,
    },
    /// Force-renew one certificate
    Renew { domain: String },
    /// List certificates by expiry
    Certs,
    /// List generated site files
    Sites,
    /// List configuration backups
    Backups,
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<EngineConfig> {
    let config = match path {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::load_or_default()?,
    };
    config.validate()?;
    Ok(config)
}

fn run_context(config: &EngineConfig) -> RunContext {
    let Some(path) = &config.log.path else {
        return RunContext::new();
    };
    RunContext::new().with_log_file(path).unwrap_or_else(|e| {
        log::warn!("Log file {} unavailable: {}", path.display(), e);
        RunContext::new()
    })
}

fn run(cli: Cli) -> Result<ExitCode> {
    let config = load_config(cli.config.as_ref())?;
    let edge = NginxAdapter::new(&config.nginx);
    let ca = CertbotAdapter::new(&config.certbot);
    let engine = ProvisioningEngine::new(&config, &edge, &ca);
    let mut ctx = run_context(&config);

    match cli.command {
        Commands::Install {
            domain,
            backend_host,
            backend_port,
            ssl,
            email,
            force_https,
            no_probe,
            renew,
        } => {
            edge.check_prerequisites()?;
            let port = parse_backend_port(&backend_port)?;
            let mut proxy = ProxyConfig::new(&domain, &backend_host, port);
            if ssl {
                ca.check_prerequisites()?;
                proxy = proxy.with_ssl(email.as_deref().unwrap_or_default(), force_https);
            }
            let options = InstallOptions {
                probe_backend: !no_probe,
                renew_existing: renew,
            };
            let report = engine.install(&mut ctx, &proxy, &options)?;
            Ok(print_report(&report))
        }
        Commands::Remove {
            domain,
            delete_cert,
        } => {
            edge.check_prerequisites()?;
            let report = engine.remove(&mut ctx, &domain, delete_cert)?;
            Ok(print_report(&report))
        }
        Commands::Renew { domain } => {
            ca.check_prerequisites()?;
            let report = engine.renew(&mut ctx, &domain)?;
            match &report.outcome {
                RenewalOutcome::Renewed => {
                    println!("{}: renewed and reloaded", report.domain);
                    Ok(ExitCode::SUCCESS)
                }
                RenewalOutcome::RenewedNotReloaded(details) => {
                    println!(
                        "{}: renewed, but nginx was not reloaded because `nginx -t` failed:\n  {}",
                        report.domain, details
                    );
                    Ok(ExitCode::FAILURE)
                }
                RenewalOutcome::Failed(reason) => {
                    println!("{}: renewal failed: {}", report.domain, reason);
                    Ok(ExitCode::FAILURE)
                }
            }
        }
        Commands::Certs => {
            let now = chrono::Utc::now();
            let records = engine.certificate_report()?;
            if records.is_empty() {
                println!("No certificates found");
            }
            for record in records {
                let days = record
                    .days_remaining(now)
                    .map(|d| format!("{} days", d))
                    .unwrap_or_else(|| "unknown expiry".to_string());
                println!(
                    "{:<40} {:<15} {}",
                    record.domain,
                    record.status.display_name(),
                    days
                );
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Sites => {
            for site in engine.list_sites()? {
                let https = if site.summary.has_https() { "https" } else { "http" };
                println!(
                    "{:<40} {:<9} {:<6} {}",
                    site.domain,
                    if site.enabled { "enabled" } else { "disabled" },
                    https,
                    if site.managed { "" } else { "(not managed)" }
                );
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Backups => {
            for backup in engine.backups().list()? {
                println!(
                    "{}  {:<30} {}",
                    backup.timestamp().format("%Y-%m-%d %H:%M:%S"),
                    backup.manifest.label,
                    backup.path.display()
                );
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn print_report(report: &OperationReport) -> ExitCode {
    for line in report.summary() {
        println!("{}", line);
    }
    match report.status {
        ReportStatus::Success | ReportStatus::PartialSuccess => ExitCode::SUCCESS,
        ReportStatus::Failed => ExitCode::FAILURE,
    }
}

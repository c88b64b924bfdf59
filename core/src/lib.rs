//! Nginx Proxy Wizard Core Library
//!
//! This crate provides the transactional provisioning engine behind the
//! wizard: it renders and edits per-domain nginx site files, obtains
//! certificates through certbot, supervises reloads, and rolls every change
//! back to the last backup when a step fails.

pub mod backup;
pub mod cert;
pub mod certbot;
pub mod config;
pub mod context;
pub mod error;
pub mod fsops;
pub mod model;
pub mod mutator;
pub mod nginx;
pub mod probe;
pub mod supervisor;
pub mod synth;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod transaction;

pub use backup::{BackupManifest, BackupRef, BackupStore, RestoreReport};
pub use cert::{
    parse_not_after, Acquisition, AcquisitionOutcome, CertState, CertificateManager,
    RenewalOutcome, RenewalReport,
};
pub use certbot::{CertbotAdapter, CertificateAuthority};
pub use config::EngineConfig;
pub use context::{LogEntry, RunContext, StatusLevel};
pub use error::{Error, Result, Warning};
pub use model::*;
pub use mutator::{ConfigMutator, ProxyRestoreOutcome, RedirectOutcome};
pub use nginx::{EdgeServer, NginxAdapter};
pub use supervisor::{ApplyOutcome, ReloadSupervisor};
pub use synth::ConfigSynthesizer;
pub use transaction::{
    InstallOptions, Operation, OperationReport, ProvisioningEngine, ReportStatus, RollbackReport,
    SiteEntry, Step, SystemState, Transaction, TxOutcome,
};

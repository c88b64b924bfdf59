//! Validate-then-activate with reload/restart escalation

use crate::fsops;
use crate::nginx::EdgeServer;
use crate::{Error, Result, RunContext};
use std::path::Path;

/// Which escalation level brought the edge server up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Reloaded,
    Restarted,
}

pub struct ReloadSupervisor<'a> {
    edge: &'a dyn EdgeServer,
}

impl<'a> ReloadSupervisor<'a> {
    pub fn new(edge: &'a dyn EdgeServer) -> Self {
        Self { edge }
    }

    /// Activate the current configuration tree.
    ///
    /// `new_link` is the enable symlink added by the caller's transaction, if
    /// any; it is the only thing removed during emergency reversion.
    ///
    /// Errors: `Syntax` (nothing touched), `Process` (server recovered only after
    /// the link was removed), `ManualIntervention` (server is down).
    pub fn apply(&self, ctx: &mut RunContext, new_link: Option<&Path>) -> Result<ApplyOutcome> {
        if let Err(e) = self.edge.validate_syntax() {
            ctx.error(format!("Syntax check failed: {}", e));
            return Err(e);
        }

        match self.edge.reload() {
            Ok(()) if self.edge.is_active() => {
                ctx.success("Nginx reloaded");
                return Ok(ApplyOutcome::Reloaded);
            }
            Ok(()) => ctx.warn("Reload returned but nginx is not active; restarting"),
            Err(e) => ctx.warn(format!("Reload failed ({}); restarting", e)),
        }

        match self.edge.restart() {
            Ok(()) if self.edge.is_active() => {
                ctx.success("Nginx restarted");
                return Ok(ApplyOutcome::Restarted);
            }
            Ok(()) => ctx.error("Restart returned but nginx is not active"),
            Err(e) => ctx.error(format!("Restart failed: {}", e)),
        }

        self.emergency_revert(ctx, new_link)
    }

    fn emergency_revert(&self, ctx: &mut RunContext, new_link: Option<&Path>) -> Result<ApplyOutcome> {
        let Some(link) = new_link else {
            return Err(Error::manual(
                "nginx will not start and this operation added no site link to revert; \
                 inspect `systemctl status nginx` and `nginx -t`",
            ));
        };

        ctx.warn(format!("Emergency reversion: removing {}", link.display()));
        if let Err(e) = fsops::remove_if_exists(link) {
            return Err(Error::manual(format!(
                "nginx is down and {} could not be removed: {}",
                link.display(),
                e
            )));
        }

        match self.edge.restart() {
            Ok(()) if self.edge.is_active() => {
                ctx.warn("Nginx is back up with the new site disabled");
                Err(Error::process(format!(
                    "nginx only came back after disabling {}",
                    link.display()
                )))
            }
            _ => {
                ctx.error("Nginx is still down after emergency reversion");
                Err(Error::manual(
                    "nginx will not start even with the new site disabled; \
                     inspect `systemctl status nginx` and `journalctl -u nginx`",
                ))
            }
        }
    }

    /// Reload, falling back to restart; used after rollback to confirm health
    pub fn reload_or_restart(&self, ctx: &mut RunContext) -> bool {
        if self.edge.reload().is_ok() && self.edge.is_active() {
            return true;
        }
        ctx.warn("Reload did not leave nginx active; restarting");
        self.edge.restart().is_ok() && self.edge.is_active()
    }
}

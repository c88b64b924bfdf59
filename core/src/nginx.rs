//! Nginx control via CLI tools (nginx, systemctl)

use crate::config::NginxSection;
use crate::{Error, Result};
use std::process::{Command, Output};

/// Output from a command execution
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// stderr if present, otherwise stdout, trimmed
    pub fn details(&self) -> String {
        let text = if self.stderr.trim().is_empty() {
            &self.stdout
        } else {
            &self.stderr
        };
        text.trim().to_string()
    }
}

/// Run a command and capture output
pub fn run_cmd(cmd: &str, args: &[&str]) -> Result<CommandOutput> {
    log::debug!("Running: {} {}", cmd, args.join(" "));
    let output = Command::new(cmd).args(args).output().map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            Error::CommandNotFound(cmd.to_string())
        } else {
            Error::Command {
                cmd: format!("{} {}", cmd, args.join(" ")),
                message: e.to_string(),
            }
        }
    })?;

    Ok(parse_output(output))
}

fn parse_output(output: Output) -> CommandOutput {
    CommandOutput {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    }
}

/// Check that every command in `required` is on the PATH
pub fn check_commands(required: &[&str]) -> Result<()> {
    let missing: Vec<&str> = required
        .iter()
        .copied()
        .filter(|cmd| {
            Command::new("which")
                .arg(cmd)
                .output()
                .map(|o| !o.status.success())
                .unwrap_or(true)
        })
        .collect();

    if !missing.is_empty() {
        return Err(Error::CommandNotFound(format!(
            "Required commands not found: {}",
            missing.join(", ")
        )));
    }
    Ok(())
}

/// Control surface of the running edge server
pub trait EdgeServer {
    /// Full-tree syntax check. Never touches the running process.
    fn validate_syntax(&self) -> Result<()>;
    fn reload(&self) -> Result<()>;
    fn restart(&self) -> Result<()>;
    fn stop(&self) -> Result<()>;
    fn start(&self) -> Result<()>;
    fn is_active(&self) -> bool;
}

/// Adapter for nginx managed by systemd
#[derive(Debug, Clone)]
pub struct NginxAdapter {
    binary: String,
    service: String,
    systemctl: String,
}

impl NginxAdapter {
    pub fn new(section: &NginxSection) -> Self {
        Self {
            binary: section.binary.clone(),
            service: section.service.clone(),
            systemctl: section.systemctl.clone(),
        }
    }

    pub fn check_prerequisites(&self) -> Result<()> {
        check_commands(&[self.binary.as_str(), self.systemctl.as_str()])
    }

    fn systemctl(&self, action: &str) -> Result<()> {
        let output = run_cmd(&self.systemctl, &[action, &self.service])?;
        if !output.success() {
            return Err(Error::process(format!(
                "systemctl {} {} failed: {}",
                action,
                self.service,
                output.details()
            )));
        }
        Ok(())
    }
}

impl EdgeServer for NginxAdapter {
    fn validate_syntax(&self) -> Result<()> {
        let output = run_cmd(&self.binary, &["-t"])?;
        if !output.success() {
            return Err(Error::syntax(output.details()));
        }
        Ok(())
    }

    fn reload(&self) -> Result<()> {
        self.systemctl("reload")
    }

    fn restart(&self) -> Result<()> {
        self.systemctl("restart")
    }

    fn stop(&self) -> Result<()> {
        self.systemctl("stop")
    }

    fn start(&self) -> Result<()> {
        self.systemctl("start")
    }

    fn is_active(&self) -> bool {
        run_cmd(&self.systemctl, &["is-active", "--quiet", &self.service])
            .map(|o| o.success())
            .unwrap_or(false)
    }
}

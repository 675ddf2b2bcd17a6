use anyhow::{Context, Result};
use stack_core::CommandError;
use std::path::Path;
use std::process::Command;

/// Fixed ssh/scp options for test machines: throwaway hosts, no prompts.
const SSH_OPTIONS: &[(&str, &str)] = &[
    ("User", "ubuntu"),
    ("UserKnownHostsFile", "/dev/null"),
    ("StrictHostKeyChecking", "no"),
    ("PasswordAuthentication", "no"),
];

const REMOTE_TIMEOUT_SECS: f64 = 120.0;

/// Log locations on a Windows-variant machine: the installer/init log
/// directory and the agent log directory.
pub const WINDOWS_LOG_PATTERNS: &[&str] = &[
    "%ProgramFiles(x86)%\\Cloudbase Solutions\\Cloudbase-Init\\log\\*",
    "C:\\Juju\\log\\juju\\*.log",
];

/// One reachable machine. Created per machine per log-collection pass, never
/// persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Remote {
    pub address: String,
    pub series: Option<String>,
    /// Cleared once the native secure-shell tool is detected broken for this
    /// endpoint.
    pub use_ssh: bool,
}

impl Remote {
    pub fn from_address(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            series: None,
            use_ssh: true,
        }
    }

    pub fn with_series(address: impl Into<String>, series: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            series: Some(series.into()),
            use_ssh: true,
        }
    }

    pub fn is_windows(&self) -> bool {
        self.series
            .as_deref()
            .map_or(false, |series| series.starts_with("win"))
    }

    /// Run a command on the machine over ssh.
    pub fn run(&self, command: &str) -> Result<()> {
        run_argv(&ssh_command_args(&self.address, command))
    }

    /// Bulk-copy remote path patterns into `destination`.
    pub fn copy_files(&self, patterns: &[&str], destination: &Path) -> Result<()> {
        let sources: Vec<String> = patterns
            .iter()
            .map(|pattern| format!("{}:{}", self.address, pattern))
            .collect();
        run_argv(&scp_command_args(&sources, destination))
    }

    /// Multi-path copy from a Windows-variant machine.
    pub fn copy_windows_logs(&self, destination: &Path) -> Result<()> {
        self.copy_files(WINDOWS_LOG_PATTERNS, destination)
    }
}

fn timeout_prefix(seconds: f64) -> Vec<String> {
    vec!["timeout".to_string(), format!("{seconds:.2}")]
}

fn ssh_option_args() -> Vec<String> {
    let mut args = Vec::new();
    for (key, value) in SSH_OPTIONS {
        args.push("-o".to_string());
        args.push(format!("{key} {value}"));
    }
    args
}

pub fn ssh_command_args(address: &str, command: &str) -> Vec<String> {
    let mut args = timeout_prefix(REMOTE_TIMEOUT_SECS);
    args.push("ssh".to_string());
    args.extend(ssh_option_args());
    args.push(address.to_string());
    args.push(command.to_string());
    args
}

pub fn scp_command_args(sources: &[String], destination: &Path) -> Vec<String> {
    let mut args = timeout_prefix(REMOTE_TIMEOUT_SECS);
    args.push("scp".to_string());
    args.push("-rC".to_string());
    args.extend(ssh_option_args());
    args.extend(sources.iter().cloned());
    args.push(destination.display().to_string());
    args
}

fn run_argv(argv: &[String]) -> Result<()> {
    let rendered = argv.join(" ");
    let output = Command::new(&argv[0])
        .args(&argv[1..])
        .output()
        .with_context(|| format!("could not spawn {rendered}"))?;
    if !output.status.success() {
        return Err(CommandError {
            command: rendered,
            status: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        }
        .into());
    }
    Ok(())
}

/// Whether the harness host has a usable secure-shell tool at all.
pub fn can_run_ssh() -> bool {
    if cfg!(windows) {
        return false;
    }
    std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).any(|dir| dir.join("ssh").exists()))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn windows_detection_by_series() {
        assert!(Remote::with_series("10.10.0.22", "win2012hvr2").is_windows());
        assert!(!Remote::with_series("10.10.0.1", "trusty").is_windows());
        assert!(!Remote::from_address("10.10.0.1").is_windows());
    }

    #[test]
    fn ssh_args_carry_timeout_and_fixed_options() {
        let args = ssh_command_args("10.10.0.1", "sudo chmod -Rf go+r /var/log/syslog");
        assert_eq!(
            args,
            vec![
                "timeout",
                "120.00",
                "ssh",
                "-o",
                "User ubuntu",
                "-o",
                "UserKnownHostsFile /dev/null",
                "-o",
                "StrictHostKeyChecking no",
                "-o",
                "PasswordAuthentication no",
                "10.10.0.1",
                "sudo chmod -Rf go+r /var/log/syslog",
            ]
        );
    }

    #[test]
    fn scp_args_list_every_source_before_destination() {
        let sources = vec![
            "10.10.0.1:/var/log/syslog".to_string(),
            "10.10.0.1:/var/log/juju/*.log".to_string(),
        ];
        let args = scp_command_args(&sources, Path::new("/foo"));
        assert_eq!(&args[..3], &["timeout", "120.00", "scp"]);
        assert_eq!(args[3], "-rC");
        assert_eq!(
            &args[args.len() - 3..],
            &[
                "10.10.0.1:/var/log/syslog",
                "10.10.0.1:/var/log/juju/*.log",
                "/foo",
            ]
        );
    }

    #[test]
    fn windows_copy_uses_the_two_fixed_patterns() {
        assert_eq!(WINDOWS_LOG_PATTERNS.len(), 2);
        assert!(WINDOWS_LOG_PATTERNS[0].contains("Cloudbase-Init"));
        assert!(WINDOWS_LOG_PATTERNS[1].ends_with("*.log"));
    }
}

use std::path::Path;
use std::process::{Command, ExitStatus};

use anyhow::Context;
use regex::Regex;

use crate::install::ENTRY_POINT;

const MIN_NODE_MAJOR: u32 = 18;

/// Run the framework entry point of the release at `release_path` under
/// `node`, forwarding `args`, environment and stdio. Returns the child's
/// exit code.
///
/// Spawn and wait rather than `exec()`: the launcher's interrupt handler
/// stays installed and merely records the signal, while node (same process
/// group) handles it and decides the exit code.
pub fn run_framework(release_path: &Path, args: &[String]) -> anyhow::Result<i32> {
    run_node(&release_path.join(ENTRY_POINT), args)
}

pub fn run_node(script: &Path, args: &[String]) -> anyhow::Result<i32> {
    let mut child = node_command(script, args)
        .spawn()
        .context("starting node")?;
    let status = child.wait().context("node process wait")?;
    Ok(exit_code(&status))
}

fn node_command(script: &Path, args: &[String]) -> Command {
    let mut cmd = Command::new("node");
    cmd.arg(script).args(args);
    if wants_source_maps(args) {
        cmd.env("NODE_OPTIONS", "--enable-source-maps");
    }
    cmd
}

fn wants_source_maps(args: &[String]) -> bool {
    args.iter().any(|a| a == "--debug" || a.starts_with("--debug="))
}

fn exit_code(status: &ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(sig) = status.signal() {
            return 128 + sig;
        }
    }
    1
}

/// `node` and `npm` on PATH and node new enough to run the framework.
pub fn check_node() -> anyhow::Result<()> {
    if which::which("node").is_err() || which::which("npm").is_err() {
        anyhow::bail!("Nodejs is not installed, please install Nodejs and run the command again");
    }
    let output = Command::new("node").arg("--version").output();
    let major = output
        .ok()
        .filter(|o| o.status.success())
        .and_then(|o| node_major(&String::from_utf8_lossy(&o.stdout)));
    match major {
        Some(major) if major >= MIN_NODE_MAJOR => Ok(()),
        _ => anyhow::bail!(
            "Your Nodejs version is too old, please upgrade to Node {} or newer and rerun Serverless",
            MIN_NODE_MAJOR
        ),
    }
}

fn node_major(version: &str) -> Option<u32> {
    let re = Regex::new(r"^v(\d+)\.\d+\.\d+").ok()?;
    re.captures(version.trim())?[1].parse().ok()
}

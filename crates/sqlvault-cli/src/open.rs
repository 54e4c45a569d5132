use std::{
    io,
    path::Path,
    process::ExitStatus,
    time::{Duration, Instant},
};

use color_eyre::{eyre::bail, Result};
use sqlvault_core::GateConfig;
use tokio::process::{Child, Command};
use tracing::{info, warn};

use crate::{gate, prompt::PasswordSource};

/// Tool launched when `open` is given no command.
pub const DEFAULT_TOOL: &str = "sqlite3";
/// Exported to the child so scripts can find the working file.
pub const WORKING_DB_ENV: &str = "SQLVAULT_WORKING_DB";
const PATH_PLACEHOLDER: &str = "{}";
/// Second Ctrl-C within this window stops the tool.
const FORCE_QUIT_WINDOW: Duration = Duration::from_secs(2);

/// Unlock, hand the working file to a database tool, and lock again once the
/// tool exits.
pub async fn run(config: GateConfig, passwords: PasswordSource, command: Vec<String>) -> Result<()> {
    let locked = gate::open(config).await?;
    let (gate, working) = gate::unlock(locked, passwords).await?;
    info!(path = %working.display(), "database unlocked");

    let outcome = supervise(build_command(&command, &working)).await;
    gate::lock(gate).await?;
    println!("Database locked.");

    let status = outcome?;
    if !status.success() {
        bail!("database tool exited with {status}");
    }
    Ok(())
}

/// Tracks Ctrl-C presses while the tool runs.
///
/// The tool shares the terminal, so it sees every Ctrl-C itself (sqlite3
/// uses it to cancel a query). Only two presses within `window` ask the
/// supervisor to stop the tool.
#[derive(Debug)]
struct Interrupts {
    window: Duration,
    last: Option<Instant>,
}

impl Interrupts {
    fn new(window: Duration) -> Self {
        Self { window, last: None }
    }

    /// Record a press at `now`; true when the tool should be terminated.
    fn escalate(&mut self, now: Instant) -> bool {
        let repeated = self
            .last
            .is_some_and(|prev| now.saturating_duration_since(prev) <= self.window);
        self.last = Some(now);
        repeated
    }
}

/// Wait for the child to exit. A double Ctrl-C sends it SIGTERM so it can
/// still close the database cleanly.
async fn supervise(mut command: Command) -> Result<ExitStatus> {
    let mut child = command.spawn()?;
    let mut interrupts = Interrupts::new(FORCE_QUIT_WINDOW);
    loop {
        tokio::select! {
            status = child.wait() => return Ok(status?),
            signal = tokio::signal::ctrl_c() => {
                signal?;
                if interrupts.escalate(Instant::now()) {
                    warn!("stopping database tool");
                    terminate(&mut child)?;
                    return Ok(child.wait().await?);
                }
                info!("press Ctrl-C again to stop the database tool");
            }
        }
    }
}

#[cfg(unix)]
fn terminate(child: &mut Child) -> io::Result<()> {
    // Already reaped.
    let Some(pid) = child.id() else {
        return Ok(());
    };
    let pid = libc::pid_t::try_from(pid)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "child pid out of range"))?;
    // SAFETY: signals our own child process; no memory is shared.
    if unsafe { libc::kill(pid, libc::SIGTERM) } == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
fn terminate(child: &mut Child) -> io::Result<()> {
    child.start_kill()
}

pub fn build_command(args: &[String], working: &Path) -> Command {
    let path = working.to_string_lossy();
    let mut command = match args.split_first() {
        Some((program, rest)) => {
            let mut command = Command::new(program);
            command.args(rest.iter().map(|arg| arg.replace(PATH_PLACEHOLDER, &path)));
            command
        }
        None => {
            let mut command = Command::new(DEFAULT_TOOL);
            command.arg(working);
            command
        }
    };
    command.env(WORKING_DB_ENV, working);
    command
}

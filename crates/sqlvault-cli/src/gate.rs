use std::path::PathBuf;

use color_eyre::{
    eyre::{bail, eyre},
    Report, Result,
};
use sqlvault_core::{GateConfig, VaultError};
use sqlvault_session::SessionGate;
use tracing::debug;

use crate::prompt::PasswordSource;

/// Run blocking gate work (KDF, file I/O) off the async runtime.
pub async fn blocking<T, F>(work: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work).await?
}

/// Convert a gate error for display. Access failures all read the same so
/// the message does not reveal which check failed.
pub fn report(err: VaultError) -> Report {
    if err.is_access_denied() {
        debug!(%err, "access denied");
        eyre!(err.public_message())
    } else {
        err.into()
    }
}

pub async fn open(config: GateConfig) -> Result<SessionGate> {
    blocking(move || SessionGate::from_config(config).map_err(report)).await
}

/// What the prompt loop does after one unlock attempt.
#[derive(Debug, PartialEq, Eq)]
enum Attempt {
    Unlocked(PathBuf),
    Retry,
}

/// Decide the next step from an attempt's outcome, the gate's failure
/// counter, and whether the password source can be asked again.
fn next_attempt(
    outcome: Result<PathBuf, VaultError>,
    failed_attempts: u32,
    cooldown: bool,
    can_retry: bool,
) -> Result<Attempt> {
    match outcome {
        Ok(path) => Ok(Attempt::Unlocked(path)),
        Err(VaultError::Auth) if cooldown => bail!(
            "unable to unlock the database: {failed_attempts} failed attempts, try again later"
        ),
        Err(VaultError::Auth) if can_retry => Ok(Attempt::Retry),
        Err(err) => Err(report(err)),
    }
}

/// Prompt until the gate unlocks, the failure bound is reached, or the
/// source cannot be retried. Returns the gate and the working file path.
pub async fn unlock(
    mut gate: SessionGate,
    passwords: PasswordSource,
) -> Result<(SessionGate, PathBuf)> {
    loop {
        let password = passwords.read("Password: ")?;
        let (returned, outcome) = blocking(move || {
            let outcome = gate
                .unlock(&password)
                .map(|session| session.working_path().to_path_buf());
            Ok((gate, outcome))
        })
        .await?;
        gate = returned;

        let step = next_attempt(
            outcome,
            gate.failed_attempts(),
            gate.cooldown_required(),
            passwords.can_retry(),
        )?;
        match step {
            Attempt::Unlocked(path) => return Ok((gate, path)),
            Attempt::Retry => eprintln!("Wrong password."),
        }
    }
}

/// Seal and wipe the working file.
pub async fn lock(mut gate: SessionGate) -> Result<()> {
    blocking(move || gate.lock().map_err(report)).await
}

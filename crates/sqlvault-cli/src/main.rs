mod cli;
mod config;
mod gate;
mod open;
mod prompt;

use std::{
    fs,
    path::{Path, PathBuf},
};

use crate::{cli::ConfigCommand, prompt::PasswordSource};
use clap::Parser;
use color_eyre::{eyre::bail, Result};
use sqlvault_core::{GateConfig, KdfParams};
use sqlvault_session::{BootstrapReport, SessionGate};
use sqlvault_storage::FileKeyStore;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const HEALTH_SAMPLE: &[u8] = b"SQLite format 3\0sqlvault health check";

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    init_tracing();

    let cli = cli::Cli::parse();
    let passwords = PasswordSource::from_flag(cli.password_stdin);
    let config_flag = cli.config.as_deref();
    match cli.command {
        cli::Command::Version => print_version(),
        cli::Command::Config(ConfigCommand::Init) => init_config(config_flag)?,
        cli::Command::Health => run_health_check(load_gate_config(config_flag)?.kdf).await?,
        cli::Command::Init => run_init(load_gate_config(config_flag)?).await?,
        cli::Command::Status => print_status(&load_gate_config(config_flag)?),
        cli::Command::Open { command } => {
            open::run(load_gate_config(config_flag)?, passwords, command).await?
        }
        cli::Command::Passwd => run_passwd(load_gate_config(config_flag)?, passwords).await?,
        cli::Command::RotateKey => {
            run_rotate_key(load_gate_config(config_flag)?, passwords).await?
        }
        cli::Command::Backup { dest } => {
            run_backup(load_gate_config(config_flag)?, dest).await?
        }
    }

    Ok(())
}

/// Config file plus `SQLVAULT_*` overrides; only commands that touch the
/// database read them.
fn load_gate_config(config_flag: Option<&Path>) -> Result<GateConfig> {
    let config = config::load(config_flag)?;
    config.to_gate_config(&config::EnvOverrides::from_env())
}

fn init_tracing() {
    // Respect user-provided filters; stdout is left to command output.
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}

fn print_version() {
    println!("sqlvault {}", env!("CARGO_PKG_VERSION"));
}

fn init_config(config_flag: Option<&Path>) -> Result<()> {
    let path = match config_flag {
        Some(path) => path.to_path_buf(),
        None => config::default_path()?,
    };
    if path.exists() {
        println!("Config already present at {}", path.display());
        return Ok(());
    }
    let path = config::write_if_missing(&config::Config::default(), &path)?;
    println!("Config initialized at {}", path.display());
    Ok(())
}

async fn run_init(gate_config: GateConfig) -> Result<()> {
    let report = gate::blocking(move || {
        let mut gate = SessionGate::from_config(gate_config).map_err(gate::report)?;
        gate.bootstrap().map_err(gate::report)
    })
    .await?;
    print_bootstrap(&report);
    Ok(())
}

async fn run_passwd(gate_config: GateConfig, passwords: PasswordSource) -> Result<()> {
    let old = passwords.read("Current password: ")?;
    let new = passwords.read_new("New password: ")?;
    gate::blocking(move || {
        let mut gate = SessionGate::from_config(gate_config).map_err(gate::report)?;
        gate.change_password(&old, &new).map_err(gate::report)
    })
    .await?;
    println!("Password changed.");
    Ok(())
}

async fn run_rotate_key(gate_config: GateConfig, passwords: PasswordSource) -> Result<()> {
    let locked = gate::open(gate_config).await?;
    let (mut gate, _) = gate::unlock(locked, passwords).await?;
    let gate = gate::blocking(move || {
        gate.rotate_key().map_err(gate::report)?;
        Ok(gate)
    })
    .await?;
    gate::lock(gate).await?;
    println!("Key rotated.");
    Ok(())
}

async fn run_backup(gate_config: GateConfig, dest: PathBuf) -> Result<()> {
    let shown = dest.display().to_string();
    gate::blocking(move || {
        let mut gate = SessionGate::from_config(gate_config).map_err(gate::report)?;
        gate.backup_to(&dest).map_err(gate::report)
    })
    .await?;
    println!("Encrypted database copied to {shown}");
    Ok(())
}

fn print_bootstrap(report: &BootstrapReport) {
    if report.created_key {
        println!("Generated a new database key.");
    }
    if report.initialized_password {
        println!("Password record created with the initial password; run `sqlvault passwd` now.");
    }
    if report.migrated_plaintext {
        println!("Encrypted the existing plaintext database.");
    }
    if report.removed_stale_working_file {
        println!("Removed a plaintext working file left by an earlier crash.");
    }
    if report.swept_temp_files > 0 {
        println!("Removed {} leftover temp file(s).", report.swept_temp_files);
    }
    println!("Ready.");
}

fn print_status(config: &GateConfig) {
    let present = |path: &Path| if path.exists() { "present" } else { "missing" };
    let envelope = config.envelope_path();
    let working = config.working_path();
    println!("key:       {} ({})", config.key_path.display(), present(&config.key_path));
    println!("password:  {} ({})", config.auth_path.display(), present(&config.auth_path));
    println!("database:  {} ({})", envelope.display(), present(&envelope));
    if working.exists() {
        println!(
            "working:   {} (present: unlocked elsewhere or left by a crash)",
            working.display()
        );
    } else {
        println!("working:   {} (none)", working.display());
    }
    if config.database_path.exists() {
        println!(
            "plaintext: {} (unencrypted; run `sqlvault init`)",
            config.database_path.display()
        );
    }
}

/// Full bootstrap/seal/open cycle in a scratch directory.
async fn run_health_check(kdf: KdfParams) -> Result<()> {
    gate::blocking(move || {
        let scratch = tempfile::tempdir()?;
        run_gate_health(scratch.path(), kdf)
    })
    .await?;
    println!("Storage: ok");
    Ok(())
}

fn run_gate_health(root: &Path, kdf: KdfParams) -> Result<()> {
    let mut config = GateConfig::in_dirs(root.join("data"), root.join("run"));
    config.kdf = kdf;
    let password = config.initial_password.clone();
    let keys = FileKeyStore::new(&config.key_path);
    let mut gate = SessionGate::with_key_store(config.clone(), keys);

    gate.bootstrap()?;
    let working = gate.unlock(&password)?.working_path().to_path_buf();
    fs::write(&working, HEALTH_SAMPLE)?;
    gate.lock()?;
    if working.exists() {
        bail!("working file survived lock");
    }

    let working = gate.unlock(&password)?.working_path().to_path_buf();
    let round_trip = fs::read(&working)?;
    gate.lock()?;
    if round_trip != HEALTH_SAMPLE {
        bail!("storage round-trip failed");
    }
    Ok(())
}

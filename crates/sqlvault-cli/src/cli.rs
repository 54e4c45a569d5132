use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// CLI surface definition.
#[derive(Parser, Debug)]
#[command(
    name = "sqlvault",
    about = "Keeps a local SQLite database encrypted at rest behind a password",
    version,
    propagate_version = true
)]
pub struct Cli {
    /// Config file to use instead of the platform default.
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Read passwords from stdin, one per line, instead of prompting.
    #[arg(long, global = true)]
    pub password_stdin: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Create the key and password record, migrate a plaintext database and
    /// clean up after crashes.
    Init,
    /// Show which files exist and where they are.
    Status,
    /// Unlock, run a database tool on the working file, then lock again.
    Open {
        /// Command to run instead of `sqlite3 <working file>`; `{}` is
        /// replaced by the working file path.
        #[arg(last = true, value_name = "CMD")]
        command: Vec<String>,
    },
    /// Change the password.
    Passwd,
    /// Re-encrypt the database under a freshly generated key.
    RotateKey,
    /// Copy the encrypted database to DEST.
    Backup {
        #[arg(value_name = "DEST")]
        dest: PathBuf,
    },
    /// Run an encrypt/decrypt round trip in a scratch directory.
    Health,
    /// Manage CLI configuration.
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Print version and exit.
    Version,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum ConfigCommand {
    /// Create a default config file if one does not exist.
    Init,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_init_subcommand() {
        let cli = Cli::try_parse_from(["sqlvault", "init"]).expect("parse should succeed");
        assert_eq!(cli.command, Command::Init);
        assert!(!cli.password_stdin);
        assert_eq!(cli.config, None);
    }

    #[test]
    fn subcommand_is_required() {
        assert!(Cli::try_parse_from(["sqlvault"]).is_err());
    }

    #[test]
    fn parses_open_with_trailing_command() {
        let cli = Cli::try_parse_from(["sqlvault", "open", "--", "litecli", "{}"])
            .expect("parse should succeed");
        assert_eq!(
            cli.command,
            Command::Open {
                command: vec!["litecli".into(), "{}".into()]
            }
        );

        let cli = Cli::try_parse_from(["sqlvault", "open"]).expect("parse should succeed");
        assert_eq!(cli.command, Command::Open { command: vec![] });
    }

    #[test]
    fn global_flags_follow_the_subcommand() {
        let cli = Cli::try_parse_from([
            "sqlvault",
            "rotate-key",
            "--password-stdin",
            "--config",
            "/tmp/sqlvault.toml",
        ])
        .expect("parse should succeed");
        assert_eq!(cli.command, Command::RotateKey);
        assert!(cli.password_stdin);
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/sqlvault.toml")));
    }

    #[test]
    fn parses_backup_destination() {
        let cli = Cli::try_parse_from(["sqlvault", "backup", "/mnt/usb/db.enc"])
            .expect("parse should succeed");
        assert_eq!(
            cli.command,
            Command::Backup {
                dest: PathBuf::from("/mnt/usb/db.enc")
            }
        );
        assert!(Cli::try_parse_from(["sqlvault", "backup"]).is_err());
    }

    #[test]
    fn parses_config_init_subcommand() {
        let cli =
            Cli::try_parse_from(["sqlvault", "config", "init"]).expect("parse should succeed");
        assert_eq!(cli.command, Command::Config(ConfigCommand::Init));
    }
}

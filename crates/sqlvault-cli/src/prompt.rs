use std::io::{self, BufRead};

use color_eyre::{eyre::bail, Result};
use zeroize::Zeroizing;

/// Where passwords come from: the terminal, or stdin for scripted use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PasswordSource {
    Terminal,
    Stdin,
}

impl PasswordSource {
    pub fn from_flag(password_stdin: bool) -> Self {
        if password_stdin {
            Self::Stdin
        } else {
            Self::Terminal
        }
    }

    /// Retrying a wrong password only makes sense with someone at the prompt.
    pub fn can_retry(self) -> bool {
        self == Self::Terminal
    }

    pub fn read(self, prompt: &str) -> Result<Zeroizing<String>> {
        match self {
            Self::Terminal => {
                let password = Zeroizing::new(rpassword::prompt_password(prompt)?);
                non_empty(password)
            }
            Self::Stdin => read_secret_line(&mut io::stdin().lock()),
        }
    }

    /// Ask twice on a terminal; stdin supplies the value once.
    pub fn read_new(self, prompt: &str) -> Result<Zeroizing<String>> {
        let first = self.read(prompt)?;
        if self == Self::Terminal {
            let again = self.read("Repeat new password: ")?;
            if *first != *again {
                bail!("passwords do not match");
            }
        }
        Ok(first)
    }
}

/// One line without its line ending.
fn read_secret_line(reader: &mut impl BufRead) -> Result<Zeroizing<String>> {
    let mut line = Zeroizing::new(String::new());
    if reader.read_line(&mut line)? == 0 {
        bail!("expected a password on stdin");
    }
    let trimmed = line.trim_end_matches(['\n', '\r']).len();
    line.truncate(trimmed);
    non_empty(line)
}

fn non_empty(password: Zeroizing<String>) -> Result<Zeroizing<String>> {
    if password.is_empty() {
        bail!("empty password");
    }
    Ok(password)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stdin_lines_are_read_one_at_a_time() {
        let mut input = io::Cursor::new("old secret\r\n new one \n");
        assert_eq!(read_secret_line(&mut input).expect("first").as_str(), "old secret");
        assert_eq!(read_secret_line(&mut input).expect("second").as_str(), " new one ");
        assert!(read_secret_line(&mut input).is_err());
    }

    #[test]
    fn empty_line_is_rejected() {
        let mut input = io::Cursor::new("\n");
        assert!(read_secret_line(&mut input).is_err());
    }

    #[test]
    fn only_terminal_input_is_retried() {
        assert!(PasswordSource::from_flag(false).can_retry());
        assert!(!PasswordSource::from_flag(true).can_retry());
    }
}

//! CLI errors and exit codes

use c0flash_core::{Error as CoreError, ErrorKind};
use std::path::PathBuf;
use thiserror::Error;

/// Exit codes (sysexits.h)
pub mod exit {
    pub const USAGE: i32 = 64;
    pub const DATAERR: i32 = 65;
    pub const NOINPUT: i32 = 66;
    pub const SOFTWARE: i32 = 70;
    pub const NOPERM: i32 = 77;
}

/// Errors raised by the front end itself
#[derive(Debug, Error)]
pub enum CliError {
    #[error("no target device given, use -t/--target")]
    MissingTarget,

    #[error("aborted by user")]
    Declined,

    #[error("cannot read {}: {source}", path.display())]
    Input {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot write {}: {source}", path.display())]
    Output {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{what} failed verification after {attempts} attempts")]
    VerifyFailed { what: String, attempts: u32 },

    #[error("{0}")]
    Check(String),
}

impl CliError {
    fn exit_code(&self) -> i32 {
        match self {
            Self::MissingTarget | Self::Declined => exit::USAGE,
            Self::Input { source, .. } | Self::Output { source, .. } => match source.kind() {
                std::io::ErrorKind::PermissionDenied => exit::NOPERM,
                std::io::ErrorKind::NotFound => exit::NOINPUT,
                _ => exit::SOFTWARE,
            },
            Self::VerifyFailed { .. } => exit::SOFTWARE,
            Self::Check(_) => exit::DATAERR,
        }
    }
}

fn core_exit_code(e: &CoreError) -> i32 {
    match e {
        CoreError::DeviceNotFound => exit::NOINPUT,
        CoreError::PermissionDenied => exit::NOPERM,
        _ if e.kind() == ErrorKind::Data => exit::DATAERR,
        _ => exit::SOFTWARE,
    }
}

/// Map a command error onto a process exit code
pub fn exit_code(err: &(dyn std::error::Error + 'static)) -> i32 {
    if let Some(e) = err.downcast_ref::<CliError>() {
        e.exit_code()
    } else if let Some(e) = err.downcast_ref::<CoreError>() {
        core_exit_code(e)
    } else {
        exit::SOFTWARE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn code(err: Box<dyn std::error::Error>) -> i32 {
        exit_code(err.as_ref())
    }

    #[test]
    fn core_errors() {
        assert_eq!(code(Box::new(CoreError::DeviceNotFound)), exit::NOINPUT);
        assert_eq!(code(Box::new(CoreError::PermissionDenied)), exit::NOPERM);
        assert_eq!(code(Box::new(CoreError::MissingField("crc"))), exit::DATAERR);
        assert_eq!(code(Box::new(CoreError::BusError)), exit::SOFTWARE);
    }

    #[test]
    fn cli_errors() {
        assert_eq!(code(Box::new(CliError::Declined)), exit::USAGE);
        assert_eq!(code(Box::new(CliError::MissingTarget)), exit::USAGE);
        let missing = CliError::Input {
            path: "image.bin".into(),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        };
        assert_eq!(code(Box::new(missing)), exit::NOINPUT);
    }

    #[test]
    fn unclassified() {
        assert_eq!(code("something else".into()), exit::SOFTWARE);
    }
}

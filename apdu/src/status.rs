// Copyright (c) 2023-2024 Calypso Networks Association

//! Status-word resolution: each command exposes a small table mapping a
//! 16-bit status word to a human message and, for failures, a typed
//! [`ErrorKind`]. `0x9000` is always successful and is folded into every
//! command's table by [`status_table`].

use crate::framing::ApduResponse;

/// Mutually-exclusive failure categories a command's status word can map to.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    AccessForbidden,
    DataAccess,
    DataOutOfBounds,
    IllegalParameter,
    Pin { attempts_remaining: u8 },
    SecurityContext,
    SecurityData,
    SessionBufferOverflow,
    Terminated,
}

/// A single status-word table entry: message plus success/failure classification.
#[derive(Copy, Clone, Debug)]
pub struct StatusProperties {
    pub message: &'static str,
    pub error_kind: Option<ErrorKind>,
}

impl StatusProperties {
    pub const fn success(message: &'static str) -> Self {
        Self {
            message,
            error_kind: None,
        }
    }

    pub const fn error(message: &'static str, kind: ErrorKind) -> Self {
        Self {
            message,
            error_kind: Some(kind),
        }
    }

    pub fn is_successful(&self) -> bool {
        self.error_kind.is_none()
    }
}

/// Status word -> properties table, as a flat sorted-by-nothing slice (tables
/// are small enough that a linear scan is cheaper than hashing).
pub type StatusTable = &'static [(u16, StatusProperties)];

/// Entry common to every command's table. Commands build their own table by
/// listing this entry first followed by their command-specific entries.
pub const SUCCESS: (u16, StatusProperties) = (0x9000, StatusProperties::success("Success"));

/// Errors raised while checking a command's response against its status table.
#[derive(Debug, thiserror::Error)]
pub enum CalypsoCardError {
    #[error("{message} (command={command}, sw={status_word:04X})")]
    Card {
        command: &'static str,
        status_word: u16,
        message: &'static str,
        kind: ErrorKind,
    },

    #[error("incorrect APDU response length for {command} (expected {expected}, actual {actual})")]
    UnexpectedResponseLength {
        command: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("unknown status word {status_word:04X} for command {command}")]
    UnknownStatus {
        command: &'static str,
        status_word: u16,
    },

    #[error("illegal argument: {0}")]
    IllegalArgument(String),

    #[error("APDU response too short to carry a status word ({actual} byte(s), need at least 2)")]
    TruncatedResponse { actual: usize },
}

impl CalypsoCardError {
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            CalypsoCardError::Card { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    pub fn status_word(&self) -> Option<u16> {
        match self {
            CalypsoCardError::Card { status_word, .. }
            | CalypsoCardError::UnknownStatus { status_word, .. } => Some(*status_word),
            _ => None,
        }
    }
}

/// Resolve a response's status word against `table`, checking `expected_len`
/// (CL-CSS-RESPLE.1) when `Some`. Mirrors `AbstractApduCommand::checkStatus`.
pub fn check_status(
    command: &'static str,
    table: StatusTable,
    response: &ApduResponse,
    expected_len: Option<usize>,
) -> Result<(), CalypsoCardError> {
    let sw = response.status_word();
    match table.iter().find(|(word, _)| *word == sw) {
        Some((_, props)) if props.is_successful() => {
            if let Some(expected) = expected_len {
                let actual = response.data_out().len();
                if actual != expected {
                    return Err(CalypsoCardError::UnexpectedResponseLength {
                        command,
                        expected,
                        actual,
                    });
                }
            }
            Ok(())
        }
        Some((_, props)) => Err(CalypsoCardError::Card {
            command,
            status_word: sw,
            message: props.message,
            kind: props.error_kind.expect("non-successful entry carries a kind"),
        }),
        None => Err(CalypsoCardError::UnknownStatus {
            command,
            status_word: sw,
        }),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const TABLE: &[(u16, StatusProperties)] = &[
        SUCCESS,
        (
            0x6A82,
            StatusProperties::error("File not found.", ErrorKind::DataAccess),
        ),
    ];

    #[test]
    fn success_with_matching_length() {
        let resp = ApduResponse::new(vec![0x01, 0x02, 0x90, 0x00]).unwrap();
        assert!(check_status("TEST", TABLE, &resp, Some(2)).is_ok());
    }

    #[test]
    fn success_with_wrong_length_is_unexpected_length() {
        let resp = ApduResponse::new(vec![0x01, 0x90, 0x00]).unwrap();
        let err = check_status("TEST", TABLE, &resp, Some(2)).unwrap_err();
        assert!(matches!(
            err,
            CalypsoCardError::UnexpectedResponseLength {
                expected: 2,
                actual: 1,
                ..
            }
        ));
    }

    #[test]
    fn mapped_failure_carries_kind() {
        let resp = ApduResponse::new(vec![0x6A, 0x82]).unwrap();
        let err = check_status("TEST", TABLE, &resp, None).unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::DataAccess));
    }

    #[test]
    fn absent_status_word_is_unknown() {
        let resp = ApduResponse::new(vec![0x6F, 0x00]).unwrap();
        let err = check_status("TEST", TABLE, &resp, None).unwrap_err();
        assert!(matches!(err, CalypsoCardError::UnknownStatus { .. }));
    }
}

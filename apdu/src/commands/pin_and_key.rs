// Copyright (c) 2023-2024 Calypso Networks Association

//! VERIFY_PIN, CHANGE_PIN and CHANGE_KEY -- all framed on INS `0x20`/`0xD8`.
//! CHANGE_PIN and CHANGE_KEY share INS `0xD8`; P2 `0xFF` selects the PIN
//! form, any other value is a key index.

use crate::framing::{ApduRequest, ApduResponse};
use crate::instruction::{CalypsoCardClass, Instruction};
use crate::status::{CalypsoCardError, ErrorKind};

const CHANGE_PIN_P2: u8 = 0xFF;

/// Outcome of a VERIFY_PIN exchange: either the PIN counter read back (no
/// presentation attempted) or the result of a presentation attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VerifyPinOutcome {
    Accepted,
    Rejected { attempts_remaining: u8 },
    Blocked,
}

pub fn build_verify_pin_presentation(card_class: CalypsoCardClass, pin: Vec<u8>) -> ApduRequest {
    debug_assert!(pin.len() == 4 || pin.len() == 8, "PIN data must be 4 (plain) or 8 (ciphered) bytes");
    ApduRequest::new(
        card_class.value(),
        Instruction::VerifyPin.byte(),
        0x00,
        0x00,
        Instruction::VerifyPin.name(),
    )
    .with_data(pin)
}

pub fn build_verify_pin_read_counter(card_class: CalypsoCardClass) -> ApduRequest {
    ApduRequest::new(
        card_class.value(),
        Instruction::VerifyPin.byte(),
        0x00,
        0x00,
        Instruction::VerifyPin.name(),
    )
}

/// Maps the VERIFY_PIN-specific status words directly (CL-PIN semantics
/// don't fit the generic status table: the attempts-remaining count must be
/// carried out of the SW itself).
///
/// When `read_counter_only` is set, a PIN-rejection status is swallowed
/// (attempts-remaining is still reported) rather than raised as an error --
/// this call was only checking the counter, not attempting presentation.
pub fn parse_verify_pin(response: &ApduResponse, read_counter_only: bool) -> Result<VerifyPinOutcome, CalypsoCardError> {
    let sw = response.status_word();
    let outcome = match sw {
        0x9000 => VerifyPinOutcome::Accepted,
        0x63C2 => VerifyPinOutcome::Rejected { attempts_remaining: 2 },
        0x63C1 => VerifyPinOutcome::Rejected { attempts_remaining: 1 },
        0x6983 => VerifyPinOutcome::Blocked,
        other => {
            return Err(CalypsoCardError::UnknownStatus {
                command: Instruction::VerifyPin.name(),
                status_word: other,
            })
        }
    };

    match outcome {
        VerifyPinOutcome::Accepted => Ok(outcome),
        _ if read_counter_only => Ok(outcome),
        VerifyPinOutcome::Rejected { attempts_remaining } => Err(CalypsoCardError::Card {
            command: Instruction::VerifyPin.name(),
            status_word: sw,
            message: "Incorrect PIN.",
            kind: ErrorKind::Pin { attempts_remaining },
        }),
        VerifyPinOutcome::Blocked => Err(CalypsoCardError::Card {
            command: Instruction::VerifyPin.name(),
            status_word: sw,
            message: "PIN blocked.",
            kind: ErrorKind::Pin { attempts_remaining: 0 },
        }),
    }
}

/// `data` is 4 bytes (plain) or 16 bytes (ciphered: new PIN block + MAC).
pub fn build_change_pin(card_class: CalypsoCardClass, data: Vec<u8>) -> ApduRequest {
    debug_assert!(data.len() == 4 || data.len() == 16, "CHANGE_PIN data must be 4 or 16 bytes");
    ApduRequest::new(
        card_class.value(),
        Instruction::ChangePinOrKey.byte(),
        0x00,
        CHANGE_PIN_P2,
        "CHANGE_PIN",
    )
    .with_data(data)
}

pub fn build_change_key(card_class: CalypsoCardClass, key_index: u8, cryptogram: Vec<u8>) -> ApduRequest {
    debug_assert_ne!(key_index, CHANGE_PIN_P2, "key index must not collide with the CHANGE_PIN marker");
    ApduRequest::new(
        card_class.value(),
        Instruction::ChangePinOrKey.byte(),
        0x00,
        key_index,
        "CHANGE_KEY",
    )
    .with_data(cryptogram)
}

pub fn parse_change_pin_or_key(response: &ApduResponse, command_name: &'static str) -> Result<(), CalypsoCardError> {
    let sw = response.status_word();
    match sw {
        0x9000 => Ok(()),
        0x6700 => Err(CalypsoCardError::Card {
            command: command_name,
            status_word: sw,
            message: "Lc value not supported.",
            kind: ErrorKind::IllegalParameter,
        }),
        0x6982 => Err(CalypsoCardError::Card {
            command: command_name,
            status_word: sw,
            message: "Security conditions not fulfilled.",
            kind: ErrorKind::SecurityContext,
        }),
        0x6988 => Err(CalypsoCardError::Card {
            command: command_name,
            status_word: sw,
            message: "Incorrect cryptogram.",
            kind: ErrorKind::SecurityData,
        }),
        other => Err(CalypsoCardError::UnknownStatus {
            command: command_name,
            status_word: other,
        }),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn change_pin_uses_marker_p2() {
        let req = build_change_pin(CalypsoCardClass::Iso, vec![0; 4]);
        assert_eq!(req.p2, CHANGE_PIN_P2);
    }

    #[test]
    fn rejected_carries_attempts_remaining() {
        let resp = ApduResponse::new(vec![0x63, 0xC2]).unwrap();
        let err = parse_verify_pin(&resp, false).unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::Pin { attempts_remaining: 2 }));
    }

    #[test]
    fn read_counter_only_swallows_rejection() {
        let resp = ApduResponse::new(vec![0x63, 0xC1]).unwrap();
        let outcome = parse_verify_pin(&resp, true).unwrap();
        assert_eq!(outcome, VerifyPinOutcome::Rejected { attempts_remaining: 1 });
    }

    #[test]
    fn blocked_is_zero_attempts() {
        let resp = ApduResponse::new(vec![0x69, 0x83]).unwrap();
        let outcome = parse_verify_pin(&resp, true).unwrap();
        assert_eq!(outcome, VerifyPinOutcome::Blocked);
    }
}

// Copyright (c) 2023-2024 Calypso Networks Association

//! GET_CHALLENGE (INS 0x84). Reads an 8-byte card challenge, used ahead of a
//! ciphered VERIFY_PIN / CHANGE_PIN / CHANGE_KEY.

use crate::framing::{ApduRequest, ApduResponse};
use crate::instruction::{CalypsoCardClass, Instruction};
use crate::status::{check_status, CalypsoCardError, StatusTable, SUCCESS};

const STATUS_TABLE: StatusTable = &[SUCCESS];

pub const CHALLENGE_LENGTH: usize = 8;

pub fn build_get_challenge(card_class: CalypsoCardClass) -> ApduRequest {
    ApduRequest::new(
        card_class.value(),
        Instruction::GetChallenge.byte(),
        0x00,
        0x00,
        Instruction::GetChallenge.name(),
    )
    .with_le(CHALLENGE_LENGTH as u8)
}

pub fn parse_get_challenge(response: &ApduResponse) -> Result<Vec<u8>, CalypsoCardError> {
    check_status(
        Instruction::GetChallenge.name(),
        STATUS_TABLE,
        response,
        Some(CHALLENGE_LENGTH),
    )?;
    Ok(response.data_out().to_vec())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn builds_case_2_request() {
        let req = build_get_challenge(CalypsoCardClass::Iso);
        assert_eq!(req.to_bytes(), vec![0x00, 0x84, 0x00, 0x00, 0x08]);
    }

    #[test]
    fn parses_eight_byte_challenge() {
        let mut bytes = vec![1, 2, 3, 4, 5, 6, 7, 8];
        bytes.extend_from_slice(&[0x90, 0x00]);
        let resp = ApduResponse::new(bytes).unwrap();
        assert_eq!(parse_get_challenge(&resp).unwrap(), vec![1, 2, 3, 4, 5, 6, 7, 8]);
    }
}

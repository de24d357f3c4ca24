// Copyright (c) 2023-2024 Calypso Networks Association

//! CLOSE_SESSION (INS 0x8E). Ends a Secure Session; in normal mode carries
//! the terminal signature and returns any postponed data blocks plus the
//! card's signature Lo. The abort form (empty signature, P1=P2=Lc=0) is used
//! by `processCancel`.

use crate::framing::{ApduRequest, ApduResponse};
use crate::instruction::{CalypsoCardClass, Instruction};
use crate::status::{check_status, CalypsoCardError, ErrorKind, StatusProperties, StatusTable, SUCCESS};

const STATUS_TABLE: StatusTable = &[
    SUCCESS,
    (
        0x6700,
        StatusProperties::error("Lc value not supported.", ErrorKind::IllegalParameter),
    ),
    (
        0x6982,
        StatusProperties::error(
            "Security conditions not fulfilled.",
            ErrorKind::SecurityContext,
        ),
    ),
    (
        0x6985,
        StatusProperties::error(
            "Access forbidden (no session open).",
            ErrorKind::AccessForbidden,
        ),
    ),
    (
        0x6988,
        StatusProperties::error("Incorrect signature.", ErrorKind::SecurityData),
    ),
];

pub fn build_close_session(
    card_class: CalypsoCardClass,
    ratification_requested: bool,
    terminal_signature: &[u8],
) -> ApduRequest {
    let p1 = if ratification_requested { 0x80 } else { 0x00 };
    ApduRequest::new(
        card_class.value(),
        Instruction::CloseSession.byte(),
        p1,
        0x00,
        Instruction::CloseSession.name(),
    )
    .with_data(terminal_signature.to_vec())
}

/// Abort form: empty signature, P1=P2=Lc=0.
pub fn build_close_session_abort(card_class: CalypsoCardClass) -> ApduRequest {
    ApduRequest::new(
        card_class.value(),
        Instruction::CloseSession.byte(),
        0x00,
        0x00,
        "CLOSE_SESSION-ABORT",
    )
}

#[derive(Clone, Debug, Default)]
pub struct CloseSessionResponse {
    pub postponed_data: Vec<Vec<u8>>,
    pub signature_lo: Vec<u8>,
}

pub fn parse_close_session(
    response: &ApduResponse,
    extended_mode: bool,
) -> Result<CloseSessionResponse, CalypsoCardError> {
    check_status(Instruction::CloseSession.name(), STATUS_TABLE, response, None)?;

    let data = response.data_out();
    if data.is_empty() {
        return Ok(CloseSessionResponse::default());
    }

    let sig_len = if extended_mode { 8 } else { 4 };
    if data.len() < sig_len {
        return Err(CalypsoCardError::UnexpectedResponseLength {
            command: Instruction::CloseSession.name(),
            expected: sig_len,
            actual: data.len(),
        });
    }

    let mut postponed_data = Vec::new();
    let mut idx = 0;
    while data.len() - idx > sig_len {
        let len = data[idx] as usize;
        idx += 1;
        if idx + len > data.len() - sig_len {
            return Err(CalypsoCardError::IllegalArgument(
                "malformed postponed-data block in CLOSE_SESSION response".into(),
            ));
        }
        postponed_data.push(data[idx..idx + len].to_vec());
        idx += len;
    }

    Ok(CloseSessionResponse {
        postponed_data,
        signature_lo: data[idx..idx + sig_len].to_vec(),
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn abort_form_has_no_data() {
        let req = build_close_session_abort(CalypsoCardClass::Iso);
        assert_eq!(req.to_bytes(), vec![0x00, 0x8E, 0x00, 0x00]);
    }

    #[test]
    fn parses_signature_only_response() {
        let mut bytes = vec![0x11, 0x22, 0x33, 0x44];
        bytes.extend_from_slice(&[0x90, 0x00]);
        let resp = ApduResponse::new(bytes).unwrap();
        let parsed = parse_close_session(&resp, false).unwrap();
        assert!(parsed.postponed_data.is_empty());
        assert_eq!(parsed.signature_lo, vec![0x11, 0x22, 0x33, 0x44]);
    }

    #[test]
    fn parses_postponed_block_then_signature() {
        let mut bytes = vec![0x03, 0xAA, 0xBB, 0xCC];
        bytes.extend_from_slice(&[0x11, 0x22, 0x33, 0x44]);
        bytes.extend_from_slice(&[0x90, 0x00]);
        let resp = ApduResponse::new(bytes).unwrap();
        let parsed = parse_close_session(&resp, false).unwrap();
        assert_eq!(parsed.postponed_data, vec![vec![0xAA, 0xBB, 0xCC]]);
        assert_eq!(parsed.signature_lo, vec![0x11, 0x22, 0x33, 0x44]);
    }
}

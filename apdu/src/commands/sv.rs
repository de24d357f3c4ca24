// Copyright (c) 2023-2024 Calypso Networks Association

//! Stored-Value commands: SV_GET (INS 0x7C, read-only) and the three
//! two-phase modifying commands SV_RELOAD/SV_DEBIT/SV_UNDEBIT (INS
//! 0xB8/0xBA/0xBC). The modifying commands are built in two steps: a
//! `*Template` carrying the terminal-known fields, then `finalize` with the
//! SAM-supplied complementary data (SAM id + signature-hi) to produce the
//! actual request.

use crate::framing::{ApduRequest, ApduResponse};
use crate::instruction::{CalypsoCardClass, Instruction};
use crate::status::{check_status, CalypsoCardError, ErrorKind, StatusProperties, StatusTable, SUCCESS};

const POSTPONED_SW: u16 = 0x6200;
pub const SV_AMOUNT_MIN: i32 = 0;
pub const SV_AMOUNT_MAX: i32 = 32767;

fn modifying_status_table() -> StatusTable {
    const TABLE: StatusTable = &[
        SUCCESS,
        (
            POSTPONED_SW,
            StatusProperties::success("Success, data postponed."),
        ),
        (
            0x6400,
            StatusProperties::error("Session buffer overflow.", ErrorKind::SessionBufferOverflow),
        ),
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
            StatusProperties::error("Access forbidden (no session, SV not first in batch).", ErrorKind::AccessForbidden),
        ),
        (
            0x6988,
            StatusProperties::error("Incorrect signature/certificate.", ErrorKind::SecurityData),
        ),
        (
            0x6A80,
            StatusProperties::error("Incorrect amount (overflow/negative balance).", ErrorKind::DataOutOfBounds),
        ),
        (
            0x6A82,
            StatusProperties::error("File not found.", ErrorKind::DataAccess),
        ),
    ];
    TABLE
}

const SV_GET_STATUS_TABLE: StatusTable = &[
    SUCCESS,
    (
        0x6982,
        StatusProperties::error(
            "Security conditions not fulfilled.",
            ErrorKind::SecurityContext,
        ),
    ),
    (
        0x6985,
        StatusProperties::error("Access forbidden.", ErrorKind::AccessForbidden),
    ),
    (
        0x6A81,
        StatusProperties::error("Incorrect P1/P2.", ErrorKind::IllegalParameter),
    ),
];

/// The two SV transaction families; an SV_GET pins the family for the
/// modifying command that must immediately follow it (CL-SV rules are
/// enforced by the orchestrator, not here).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SvOperation {
    Reload,
    DebitOrUndebit,
}

impl SvOperation {
    const fn p2(self) -> u8 {
        match self {
            SvOperation::Reload => 0x07,
            SvOperation::DebitOrUndebit => 0x09,
        }
    }
}

pub fn build_sv_get(card_class: CalypsoCardClass, operation: SvOperation, extended_mode: bool) -> ApduRequest {
    let p1 = if extended_mode { 0x01 } else { 0x00 };
    ApduRequest::new(
        crate::instruction::sv_class(card_class),
        Instruction::SvGet.byte(),
        p1,
        operation.p2(),
        Instruction::SvGet.name(),
    )
    .with_le(0x00)
}

/// Decoded SV_GET response. Field layout is keyed by the three response
/// lengths the card can return; see the module doc for the byte breakdown.
#[derive(Clone, Debug)]
pub struct SvGetResponse {
    pub kvc: u8,
    pub transaction_number: u16,
    pub previous_signature_lo: Vec<u8>,
    pub challenge: Vec<u8>,
    pub balance: i32,
    pub load_log: Option<Vec<u8>>,
    pub debit_log: Option<Vec<u8>>,
}

fn decode_balance(b: &[u8]) -> i32 {
    let raw = ((b[0] as i32) << 16) | ((b[1] as i32) << 8) | b[2] as i32;
    if raw & 0x0080_0000 != 0 {
        raw - 0x0100_0000
    } else {
        raw
    }
}

pub fn parse_sv_get(response: &ApduResponse, operation: SvOperation, extended_mode: bool) -> Result<SvGetResponse, CalypsoCardError> {
    check_status(Instruction::SvGet.name(), SV_GET_STATUS_TABLE, response, None)?;
    let data = response.data_out();

    let (sig_len, challenge_len) = if extended_mode { (6, 4) } else { (3, 2) };
    let fixed = 1 + 2 + sig_len + challenge_len + 3;

    if extended_mode {
        let expected = fixed + 4 + 22 + 19;
        if data.len() != expected {
            return Err(CalypsoCardError::UnexpectedResponseLength {
                command: Instruction::SvGet.name(),
                expected,
                actual: data.len(),
            });
        }
    } else {
        let log_len = if operation == SvOperation::Reload { 22 } else { 19 };
        let expected = fixed + log_len;
        if data.len() != expected {
            return Err(CalypsoCardError::UnexpectedResponseLength {
                command: Instruction::SvGet.name(),
                expected,
                actual: data.len(),
            });
        }
    }

    let mut cursor = 0;
    let kvc = data[cursor];
    cursor += 1;
    let transaction_number = ((data[cursor] as u16) << 8) | data[cursor + 1] as u16;
    cursor += 2;
    let previous_signature_lo = data[cursor..cursor + sig_len].to_vec();
    cursor += sig_len;
    let challenge = data[cursor..cursor + challenge_len].to_vec();
    cursor += challenge_len;
    let balance = decode_balance(&data[cursor..cursor + 3]);
    cursor += 3;

    if extended_mode {
        cursor += 4; // SAM id echoed back, not surfaced
        let load_log = data[cursor..cursor + 22].to_vec();
        cursor += 22;
        let debit_log = data[cursor..cursor + 19].to_vec();
        Ok(SvGetResponse {
            kvc,
            transaction_number,
            previous_signature_lo,
            challenge,
            balance,
            load_log: Some(load_log),
            debit_log: Some(debit_log),
        })
    } else if operation == SvOperation::Reload {
        Ok(SvGetResponse {
            kvc,
            transaction_number,
            previous_signature_lo,
            challenge,
            balance,
            load_log: Some(data[cursor..].to_vec()),
            debit_log: None,
        })
    } else {
        Ok(SvGetResponse {
            kvc,
            transaction_number,
            previous_signature_lo,
            challenge,
            balance,
            load_log: None,
            debit_log: Some(data[cursor..].to_vec()),
        })
    }
}

/// Terminal-known fields of an SV_RELOAD/SV_DEBIT/SV_UNDEBIT request, built
/// before the SAM is consulted.
#[derive(Clone, Debug)]
pub struct SvCommandTemplate {
    pub ins: Instruction,
    pub amount: i32,
    pub date: [u8; 2],
    pub time: [u8; 2],
    pub kvc: u8,
    pub extended_mode: bool,
}

impl SvCommandTemplate {
    pub fn new(ins: Instruction, amount: i32, date: [u8; 2], time: [u8; 2], kvc: u8, extended_mode: bool) -> Result<Self, CalypsoCardError> {
        if !(SV_AMOUNT_MIN..=SV_AMOUNT_MAX).contains(&amount) {
            return Err(CalypsoCardError::IllegalArgument(format!(
                "SV amount {amount} out of range [{SV_AMOUNT_MIN}, {SV_AMOUNT_MAX}]"
            )));
        }
        Ok(Self {
            ins,
            amount,
            date,
            time,
            kvc,
            extended_mode,
        })
    }

    fn body_prefix(&self) -> Vec<u8> {
        let amount = self.amount as i16;
        let amount = amount.to_be_bytes();
        vec![amount[0], amount[1], self.date[0], self.date[1], self.time[0], self.time[1], self.kvc]
    }

    /// Complete the request with SAM-supplied `sam_id` (3 bytes) and
    /// `signature_hi` (5 bytes non-extended, 10 extended). Body length is
    /// 15 or 20 bytes accordingly (CL-SV body length invariant).
    pub fn finalize(&self, card_class: CalypsoCardClass, sam_id: [u8; 3], signature_hi: Vec<u8>) -> Result<ApduRequest, CalypsoCardError> {
        let expected_sig_len = if self.extended_mode { 10 } else { 5 };
        if signature_hi.len() != expected_sig_len {
            return Err(CalypsoCardError::IllegalArgument(format!(
                "SV signature-hi must be {expected_sig_len} bytes, got {}",
                signature_hi.len()
            )));
        }

        let mut data = self.body_prefix();
        data.extend_from_slice(&sam_id);
        data.extend_from_slice(&signature_hi);

        Ok(ApduRequest::new(
            crate::instruction::sv_class(card_class),
            self.ins.byte(),
            0x00,
            0x00,
            self.ins.name(),
        )
        .with_data(data)
        .with_extra_successful_sw(POSTPONED_SW))
    }
}

/// `None` when the card postponed the signature (in-session response is
/// empty, or SW `0x6200`); `Some` carries signature Lo (3 or 6 bytes).
pub fn parse_sv_modifying(response: &ApduResponse, ins: Instruction) -> Result<Option<Vec<u8>>, CalypsoCardError> {
    check_status(ins.name(), modifying_status_table(), response, None)?;
    if response.status_word() == POSTPONED_SW {
        return Ok(None);
    }
    let data = response.data_out();
    if data.is_empty() {
        Ok(None)
    } else {
        Ok(Some(data.to_vec()))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn rejects_amount_out_of_range() {
        assert!(SvCommandTemplate::new(Instruction::SvReload, 40000, [0; 2], [0; 2], 0x7B, false).is_err());
    }

    #[test]
    fn finalize_builds_expected_body_length() {
        let template = SvCommandTemplate::new(Instruction::SvDebit, 10, [1, 2], [3, 4], 0x7B, false).unwrap();
        let req = template.finalize(CalypsoCardClass::Iso, [0xAA, 0xBB, 0xCC], vec![0; 5]).unwrap();
        assert_eq!(req.data().len(), 15);
    }

    #[test]
    fn parses_non_extended_reload_response() {
        let mut bytes = vec![0x7B, 0x00, 0x01];
        bytes.extend_from_slice(&[0xAA, 0xBB, 0xCC]); // prev sig lo
        bytes.extend_from_slice(&[0x11, 0x22]); // challenge
        bytes.extend_from_slice(&[0x00, 0x00, 0x64]); // balance = 100
        bytes.extend_from_slice(&[0u8; 22]); // load log
        bytes.extend_from_slice(&[0x90, 0x00]);
        let resp = ApduResponse::new(bytes).unwrap();
        let parsed = parse_sv_get(&resp, SvOperation::Reload, false).unwrap();
        assert_eq!(parsed.balance, 100);
        assert!(parsed.load_log.is_some());
        assert!(parsed.debit_log.is_none());
    }

    #[test]
    fn postponed_modifying_response_is_none() {
        let resp = ApduResponse::new(vec![0x62, 0x00]).unwrap();
        assert_eq!(parse_sv_modifying(&resp, Instruction::SvDebit).unwrap(), None);
    }
}

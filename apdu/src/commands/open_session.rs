// Copyright (c) 2023-2024 Calypso Networks Association

//! OPEN_SESSION (INS 0x8A). Starts a Secure Session: CLA, P1 and the
//! response layout all branch on the card's product type.

use crate::framing::{ApduRequest, ApduResponse};
use crate::instruction::{CalypsoCardClass, Instruction, ProductType};
use crate::status::{check_status, CalypsoCardError, ErrorKind, StatusProperties, StatusTable, SUCCESS};

/// Fixed length of the optional record payload returned when OPEN_SESSION
/// is asked to read a record as part of opening.
pub const OPEN_SESSION_RECORD_LENGTH: usize = 29;

const STATUS_TABLE: StatusTable = &[
    SUCCESS,
    (
        0x6700,
        StatusProperties::error("Lc value not supported.", ErrorKind::IllegalParameter),
    ),
    (
        0x6900,
        StatusProperties::error("Transaction counter is 0.", ErrorKind::Terminated),
    ),
    (
        0x6982,
        StatusProperties::error(
            "Security conditions not fulfilled (no session, wrong key).",
            ErrorKind::SecurityContext,
        ),
    ),
    (
        0x6985,
        StatusProperties::error(
            "Access forbidden (a session is already open, or DF is invalidated).",
            ErrorKind::AccessForbidden,
        ),
    ),
    (
        0x6A81,
        StatusProperties::error(
            "Incorrect P1 or P2 (key index, or SFI/record).",
            ErrorKind::IllegalParameter,
        ),
    ),
    (
        0x6A82,
        StatusProperties::error("File not found.", ErrorKind::DataAccess),
    ),
    (
        0x6A83,
        StatusProperties::error("Record not found.", ErrorKind::DataAccess),
    ),
];

/// Build the OPEN_SESSION request.
///
/// `key_index` selects the debit/load/personalization key (0-7); `sfi_record`
/// optionally inlines a `(SFI, record#)` to read during opening, folded away
/// from the queue by the orchestrator (CL-CSS-OSSS scenario S2).
pub fn build_open_session(
    card_class: CalypsoCardClass,
    product_type: ProductType,
    key_index: u8,
    sfi_record: Option<(u8, u8)>,
    extended_mode: bool,
) -> ApduRequest {
    let (sfi, record_number) = sfi_record.unwrap_or((0, 0));

    let p1 = (record_number << 3) | (key_index & 0x07);
    let p2 = if product_type.is_rev1() {
        sfi << 3
    } else {
        (sfi << 3) | u8::from(extended_mode)
    };

    ApduRequest::new(
        card_class.value(),
        Instruction::OpenSession.byte(),
        p1,
        p2,
        Instruction::OpenSession.name(),
    )
    .with_le(0x00)
}

/// Decoded OPEN_SESSION response.
#[derive(Clone, Debug)]
pub struct OpenSessionResponse {
    pub transaction_counter: u32,
    pub challenge: Vec<u8>,
    pub previous_session_ratified: bool,
    pub manage_secure_session: bool,
    pub kif: Option<u8>,
    pub kvc: Option<u8>,
    pub record: Option<Vec<u8>>,
}

/// Parse the OPEN_SESSION response. Layout branches on product type:
/// - Rev3 extended: `flags(1) | counter(3) | challenge(4) | kif(1) | kvc(1)` header (10B)
/// - Rev3 standard / Rev2.4: `counter(3) | challenge(4) | kif(1)? | kvc(1) | ratified(1)` header
/// - Rev1.0: `counter(3) | challenge(4) | ratified(1)` header, no key data
///
/// followed by the optional `OPEN_SESSION_RECORD_LENGTH`-byte record payload
/// when a record was requested.
pub fn parse_open_session(
    response: &ApduResponse,
    product_type: ProductType,
    record_requested: bool,
) -> Result<OpenSessionResponse, CalypsoCardError> {
    check_status(Instruction::OpenSession.name(), STATUS_TABLE, response, None)?;

    let data = response.data_out();
    let header_len = match product_type {
        ProductType::Rev3_1 | ProductType::Rev3_2 | ProductType::Rev3_3 => 10,
        ProductType::Rev2_4 | ProductType::Light | ProductType::Basic => 9,
        ProductType::Rev1_0 => 8,
        ProductType::Unknown => 10,
    };

    let expected = header_len + if record_requested { OPEN_SESSION_RECORD_LENGTH } else { 0 };
    if data.len() != expected {
        return Err(CalypsoCardError::UnexpectedResponseLength {
            command: Instruction::OpenSession.name(),
            expected,
            actual: data.len(),
        });
    }

    let (flags, counter_off) = match product_type {
        ProductType::Rev3_1 | ProductType::Rev3_2 | ProductType::Rev3_3 => (data[0], 1),
        _ => (0, 0),
    };

    let transaction_counter =
        ((data[counter_off] as u32) << 16) | ((data[counter_off + 1] as u32) << 8) | data[counter_off + 2] as u32;
    let challenge = data[counter_off + 3..counter_off + 7].to_vec();

    let mut cursor = counter_off + 7;
    let kif = if matches!(
        product_type,
        ProductType::Rev3_1 | ProductType::Rev3_2 | ProductType::Rev3_3
    ) {
        let v = data[cursor];
        cursor += 1;
        Some(v)
    } else {
        None
    };
    let kvc = if matches!(product_type, ProductType::Rev1_0) {
        None
    } else {
        let v = data[cursor];
        cursor += 1;
        Some(v)
    };

    let previous_session_ratified = if matches!(
        product_type,
        ProductType::Rev3_1 | ProductType::Rev3_2 | ProductType::Rev3_3
    ) {
        flags & 0x01 == 0x01
    } else {
        let v = data[cursor] != 0;
        cursor += 1;
        v
    };
    let manage_secure_session = matches!(
        product_type,
        ProductType::Rev3_1 | ProductType::Rev3_2 | ProductType::Rev3_3
    ) && (flags & 0x02 == 0x02);

    let record = if record_requested {
        Some(data[cursor..cursor + OPEN_SESSION_RECORD_LENGTH].to_vec())
    } else {
        None
    };

    Ok(OpenSessionResponse {
        transaction_counter,
        challenge,
        previous_session_ratified,
        manage_secure_session,
        kif,
        kvc,
        record,
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn builds_request_with_inlined_record() {
        let req = build_open_session(
            CalypsoCardClass::Iso,
            ProductType::Rev3_2,
            2,
            Some((7, 1)),
            false,
        );
        assert_eq!(req.p1, (1 << 3) | 2);
        assert_eq!(req.p2, 7 << 3);
    }

    #[test]
    fn parses_rev3_header_without_record() {
        let mut bytes = vec![0x00, 0x00, 0x00, 0x01, 0xAA, 0xBB, 0xCC, 0xDD, 0x30, 0x7B];
        bytes.extend_from_slice(&[0x90, 0x00]);
        let resp = ApduResponse::new(bytes).unwrap();
        let parsed = parse_open_session(&resp, ProductType::Rev3_2, false).unwrap();
        assert_eq!(parsed.transaction_counter, 1);
        assert_eq!(parsed.challenge, vec![0xAA, 0xBB, 0xCC, 0xDD]);
        assert_eq!(parsed.kif, Some(0x30));
        assert_eq!(parsed.kvc, Some(0x7B));
        assert!(!parsed.previous_session_ratified);
    }
}

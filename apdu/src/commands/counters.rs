// Copyright (c) 2023-2024 Calypso Networks Association

//! INCREASE/DECREASE (INS 0x32/0x30) and their multi-counter forms (INS
//! 0x3A/0x38). A single-counter command's response is either the new 3-byte
//! value, or status `0x6200` ("data postponed") meaning the caller's
//! anticipated value must be trusted instead.

use crate::framing::{ApduRequest, ApduResponse};
use crate::instruction::{CalypsoCardClass, Instruction};
use crate::status::{check_status, CalypsoCardError, ErrorKind, StatusProperties, StatusTable, SUCCESS};

const POSTPONED_SW: u16 = 0x6200;

const STATUS_TABLE: StatusTable = &[
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
        0x6981,
        StatusProperties::error("Wrong EF type (not a counter file).", ErrorKind::DataAccess),
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
        StatusProperties::error("Access forbidden.", ErrorKind::AccessForbidden),
    ),
    (
        0x6A80,
        StatusProperties::error("Incorrect command data (counter overflow/underflow).", ErrorKind::DataOutOfBounds),
    ),
    (
        0x6A82,
        StatusProperties::error("File not found.", ErrorKind::DataAccess),
    ),
    (
        0x6A83,
        StatusProperties::error("Counter not found.", ErrorKind::DataAccess),
    ),
];

fn build_single(card_class: CalypsoCardClass, ins: Instruction, sfi: u8, counter_number: u8, amount: u32) -> ApduRequest {
    let amount = amount.to_be_bytes();
    ApduRequest::new(card_class.value(), ins.byte(), counter_number, sfi << 3, ins.name())
        .with_data(vec![amount[1], amount[2], amount[3]])
        .with_le(0x00)
        .with_extra_successful_sw(POSTPONED_SW)
}

pub fn build_increase(card_class: CalypsoCardClass, sfi: u8, counter_number: u8, amount: u32) -> ApduRequest {
    build_single(card_class, Instruction::Increase, sfi, counter_number, amount)
}

pub fn build_decrease(card_class: CalypsoCardClass, sfi: u8, counter_number: u8, amount: u32) -> ApduRequest {
    build_single(card_class, Instruction::Decrease, sfi, counter_number, amount)
}

/// `None` when the card postponed the value (SW `0x6200`); the caller must
/// use its own anticipated new value in that case.
pub fn parse_single(response: &ApduResponse, ins: Instruction) -> Result<Option<u32>, CalypsoCardError> {
    check_status(ins.name(), STATUS_TABLE, response, None)?;
    if response.status_word() == POSTPONED_SW {
        return Ok(None);
    }
    let data = response.data_out();
    if data.len() != 3 {
        return Err(CalypsoCardError::UnexpectedResponseLength {
            command: ins.name(),
            expected: 3,
            actual: data.len(),
        });
    }
    Ok(Some(((data[0] as u32) << 16) | ((data[1] as u32) << 8) | data[2] as u32))
}

fn build_multiple(card_class: CalypsoCardClass, ins: Instruction, sfi: u8, counters: &[(u8, u32)]) -> ApduRequest {
    let mut data = Vec::with_capacity(counters.len() * 4);
    for (counter_number, amount) in counters {
        let amount = amount.to_be_bytes();
        data.push(*counter_number);
        data.extend_from_slice(&amount[1..4]);
    }
    ApduRequest::new(card_class.value(), ins.byte(), 0x00, sfi << 3, ins.name())
        .with_data(data)
        .with_le(0x00)
}

pub fn build_increase_multiple(card_class: CalypsoCardClass, sfi: u8, counters: &[(u8, u32)]) -> ApduRequest {
    build_multiple(card_class, Instruction::IncreaseMultiple, sfi, counters)
}

pub fn build_decrease_multiple(card_class: CalypsoCardClass, sfi: u8, counters: &[(u8, u32)]) -> ApduRequest {
    build_multiple(card_class, Instruction::DecreaseMultiple, sfi, counters)
}

/// Response is a concatenation of `counter#(1) | value(3)` entries.
pub fn parse_multiple(response: &ApduResponse, ins: Instruction) -> Result<Vec<(u8, u32)>, CalypsoCardError> {
    check_status(ins.name(), STATUS_TABLE, response, None)?;
    let data = response.data_out();
    if data.len() % 4 != 0 {
        return Err(CalypsoCardError::IllegalArgument(format!(
            "{} response length {} is not a multiple of 4",
            ins.name(),
            data.len()
        )));
    }
    Ok(data
        .chunks(4)
        .map(|c| (c[0], ((c[1] as u32) << 16) | ((c[2] as u32) << 8) | c[3] as u32))
        .collect())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn increase_body_is_three_bytes_big_endian() {
        let req = build_increase(CalypsoCardClass::Iso, 1, 1, 3);
        assert_eq!(req.data(), &[0x00, 0x00, 0x03]);
    }

    #[test]
    fn parses_postponed_single_response() {
        let resp = ApduResponse::new(vec![0x62, 0x00]).unwrap();
        assert_eq!(parse_single(&resp, Instruction::Decrease).unwrap(), None);
    }

    #[test]
    fn parses_new_value_single_response() {
        let resp = ApduResponse::new(vec![0x00, 0x00, 0x08, 0x90, 0x00]).unwrap();
        assert_eq!(parse_single(&resp, Instruction::Increase).unwrap(), Some(8));
    }

    #[test]
    fn parses_multiple_counters_response() {
        let mut bytes = vec![0x01, 0x00, 0x00, 0x05, 0x02, 0x00, 0x00, 0x07];
        bytes.extend_from_slice(&[0x90, 0x00]);
        let resp = ApduResponse::new(bytes).unwrap();
        let parsed = parse_multiple(&resp, Instruction::IncreaseMultiple).unwrap();
        assert_eq!(parsed, vec![(1, 5), (2, 7)]);
    }
}

// Copyright (c) 2023-2024 Calypso Networks Association

//! READ_RECORD_MULTIPLE (INS 0xB3). Reads a fixed-size slice
//! `[offset..offset+length)` out of each record in a range, returning the
//! slices concatenated. Must be reissued with an advanced start record to
//! cover a range that does not fit in one response.

use crate::framing::{ApduRequest, ApduResponse};
use crate::instruction::{CalypsoCardClass, Instruction};
use crate::status::{check_status, CalypsoCardError, ErrorKind, StatusProperties, StatusTable, SUCCESS};

const STATUS_TABLE: StatusTable = &[
    SUCCESS,
    (
        0x6981,
        StatusProperties::error("Wrong EF type (not a record file).", ErrorKind::DataAccess),
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
        StatusProperties::error("Access forbidden (never access mode).", ErrorKind::AccessForbidden),
    ),
    (
        0x6A82,
        StatusProperties::error("File not found.", ErrorKind::DataAccess),
    ),
    (
        0x6A83,
        StatusProperties::error("Record not found.", ErrorKind::DataAccess),
    ),
    (
        0x6B00,
        StatusProperties::error("Incorrect P1/P2 (offset out of range).", ErrorKind::IllegalParameter),
    ),
];

/// `offset`/`length` select the per-record slice; `record_number` is the
/// first record of the range, `le` the total bytes requested (a multiple of
/// `length`, bounded by the card's payload capacity).
pub fn build_read_record_multiple(
    card_class: CalypsoCardClass,
    sfi: u8,
    record_number: u8,
    offset: u8,
    length: u8,
    le: u8,
) -> ApduRequest {
    ApduRequest::new(
        card_class.value(),
        Instruction::ReadRecordMultiple.byte(),
        record_number,
        (sfi << 3) | 0x06,
        Instruction::ReadRecordMultiple.name(),
    )
    .with_data(vec![offset, length])
    .with_le(le)
}

#[derive(Clone, Debug, Default)]
pub struct ReadRecordMultipleResult {
    pub first_record_number: u8,
    pub slice_length: usize,
    pub slices: Vec<Vec<u8>>,
}

pub fn parse_read_record_multiple(
    response: &ApduResponse,
    first_record_number: u8,
    slice_length: usize,
) -> Result<ReadRecordMultipleResult, CalypsoCardError> {
    check_status(
        Instruction::ReadRecordMultiple.name(),
        STATUS_TABLE,
        response,
        None,
    )?;
    let data = response.data_out();
    if slice_length == 0 || data.len() % slice_length != 0 {
        return Err(CalypsoCardError::IllegalArgument(format!(
            "READ_RECORD_MULTIPLE response length {} is not a multiple of slice length {slice_length}",
            data.len()
        )));
    }
    let slices = data.chunks(slice_length).map(|c| c.to_vec()).collect();
    Ok(ReadRecordMultipleResult {
        first_record_number,
        slice_length,
        slices,
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn builds_request_with_offset_and_length() {
        let req = build_read_record_multiple(CalypsoCardClass::Iso, 7, 1, 2, 3, 9);
        assert_eq!(req.data(), &[2, 3]);
    }

    #[test]
    fn chunks_response_by_slice_length() {
        let mut bytes = vec![0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF];
        bytes.extend_from_slice(&[0x90, 0x00]);
        let resp = ApduResponse::new(bytes).unwrap();
        let parsed = parse_read_record_multiple(&resp, 1, 3).unwrap();
        assert_eq!(parsed.slices, vec![vec![0xAA, 0xBB, 0xCC], vec![0xDD, 0xEE, 0xFF]]);
    }
}

// Copyright (c) 2023-2024 Calypso Networks Association

//! READ_BINARY (INS 0xB0). Reads `length` bytes starting at `offset` from a
//! binary EF. Splitting a read across the card's payload capacity is the
//! orchestrator's job (component F), not this command's.

use crate::framing::{ApduRequest, ApduResponse};
use crate::instruction::{CalypsoCardClass, Instruction};
use crate::status::{check_status, CalypsoCardError, ErrorKind, StatusProperties, StatusTable, SUCCESS};

const STATUS_TABLE: StatusTable = &[
    SUCCESS,
    (
        0x6981,
        StatusProperties::error("Wrong EF type (not a binary file).", ErrorKind::DataAccess),
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
        0x6B00,
        StatusProperties::error("Offset out of bounds.", ErrorKind::DataOutOfBounds),
    ),
];

/// `sfi == 0` selects "currently selected EF" addressing (P1 carries the
/// offset MSB directly); otherwise P1 carries `0x80 | sfi` when the offset
/// fits a single byte (< 256), else falls back to offset-MSB addressing with
/// the SFI implied by a prior SELECT_FILE.
pub fn build_read_binary(card_class: CalypsoCardClass, sfi: u8, offset: u16, length: u8) -> ApduRequest {
    let (p1, p2) = if sfi != 0 && offset < 256 {
        (0x80 | sfi, offset as u8)
    } else {
        ((offset >> 8) as u8, offset as u8)
    };
    ApduRequest::new(
        card_class.value(),
        Instruction::ReadBinary.byte(),
        p1,
        p2,
        Instruction::ReadBinary.name(),
    )
    .with_le(length)
}

pub fn parse_read_binary(response: &ApduResponse, expected_length: usize) -> Result<Vec<u8>, CalypsoCardError> {
    check_status(
        Instruction::ReadBinary.name(),
        STATUS_TABLE,
        response,
        Some(expected_length),
    )?;
    Ok(response.data_out().to_vec())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn short_offset_encodes_sfi_in_p1() {
        let req = build_read_binary(CalypsoCardClass::Iso, 7, 10, 5);
        assert_eq!(req.p1, 0x80 | 7);
        assert_eq!(req.p2, 10);
    }

    #[test]
    fn long_offset_uses_offset_msb() {
        let req = build_read_binary(CalypsoCardClass::Iso, 7, 300, 5);
        assert_eq!(req.p1, (300 >> 8) as u8);
        assert_eq!(req.p2, 300u16 as u8);
    }
}

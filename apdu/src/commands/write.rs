// Copyright (c) 2023-2024 Calypso Networks Association

//! The four modifying write commands: UPDATE_RECORD/WRITE_RECORD replace or
//! OR-merge a full record; UPDATE_BINARY/WRITE_BINARY do the same at a byte
//! offset in a binary EF. All four are session-buffer-using.

use crate::framing::ApduRequest;
use crate::instruction::{CalypsoCardClass, Instruction};
use crate::status::{ErrorKind, StatusProperties, StatusTable, SUCCESS};

const RECORD_STATUS_TABLE: StatusTable = &[
    SUCCESS,
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
        StatusProperties::error("Access forbidden (no session, or never access mode).", ErrorKind::AccessForbidden),
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

const BINARY_STATUS_TABLE: StatusTable = &[
    SUCCESS,
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
        StatusProperties::error("Access forbidden (no session, or never access mode).", ErrorKind::AccessForbidden),
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

pub fn record_status_table() -> StatusTable {
    RECORD_STATUS_TABLE
}

pub fn binary_status_table() -> StatusTable {
    BINARY_STATUS_TABLE
}

fn build_record_command(
    card_class: CalypsoCardClass,
    ins: Instruction,
    sfi: u8,
    record_number: u8,
    data: Vec<u8>,
) -> ApduRequest {
    ApduRequest::new(card_class.value(), ins.byte(), record_number, (sfi << 3) | 0x04, ins.name())
        .with_data(data)
}

pub fn build_update_record(card_class: CalypsoCardClass, sfi: u8, record_number: u8, data: Vec<u8>) -> ApduRequest {
    build_record_command(card_class, Instruction::UpdateRecord, sfi, record_number, data)
}

pub fn build_write_record(card_class: CalypsoCardClass, sfi: u8, record_number: u8, data: Vec<u8>) -> ApduRequest {
    build_record_command(card_class, Instruction::WriteRecord, sfi, record_number, data)
}

fn build_binary_command(card_class: CalypsoCardClass, ins: Instruction, sfi: u8, offset: u16, data: Vec<u8>) -> ApduRequest {
    let (p1, p2) = if sfi != 0 && offset < 256 {
        (0x80 | sfi, offset as u8)
    } else {
        ((offset >> 8) as u8, offset as u8)
    };
    ApduRequest::new(card_class.value(), ins.byte(), p1, p2, ins.name()).with_data(data)
}

pub fn build_update_binary(card_class: CalypsoCardClass, sfi: u8, offset: u16, data: Vec<u8>) -> ApduRequest {
    build_binary_command(card_class, Instruction::UpdateBinary, sfi, offset, data)
}

pub fn build_write_binary(card_class: CalypsoCardClass, sfi: u8, offset: u16, data: Vec<u8>) -> ApduRequest {
    build_binary_command(card_class, Instruction::WriteBinary, sfi, offset, data)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::framing::ApduResponse;
    use crate::status::check_status;

    #[test]
    fn update_record_encodes_sfi_and_record_number() {
        let req = build_update_record(CalypsoCardClass::Iso, 7, 1, vec![0xAA, 0xBB]);
        assert_eq!(req.p1, 1);
        assert_eq!(req.p2, (7 << 3) | 0x04);
        assert_eq!(req.data(), &[0xAA, 0xBB]);
    }

    #[test]
    fn success_status_checks_out() {
        let resp = ApduResponse::new(vec![0x90, 0x00]).unwrap();
        assert!(check_status("UPDATE_RECORD", record_status_table(), &resp, None).is_ok());
    }
}

// Copyright (c) 2023-2024 Calypso Networks Association

//! APPEND_RECORD (INS 0xE2). Adds a record to a cyclic EF; the card shifts
//! existing records up by one and the new bytes become record #1.

use crate::framing::ApduRequest;
use crate::instruction::{CalypsoCardClass, Instruction};
use crate::status::{ErrorKind, StatusProperties, StatusTable, SUCCESS};

const STATUS_TABLE: StatusTable = &[
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
        StatusProperties::error("Wrong EF type (not a cyclic file).", ErrorKind::DataAccess),
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
        StatusProperties::error("Access forbidden (no session open).", ErrorKind::AccessForbidden),
    ),
    (
        0x6A82,
        StatusProperties::error("File not found.", ErrorKind::DataAccess),
    ),
];

pub fn status_table() -> StatusTable {
    STATUS_TABLE
}

pub fn build_append_record(card_class: CalypsoCardClass, sfi: u8, data: Vec<u8>) -> ApduRequest {
    ApduRequest::new(
        card_class.value(),
        Instruction::AppendRecord.byte(),
        0x00,
        sfi << 3,
        Instruction::AppendRecord.name(),
    )
    .with_data(data)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn encodes_sfi_in_p2_only() {
        let req = build_append_record(CalypsoCardClass::Iso, 7, vec![0x01]);
        assert_eq!(req.p1, 0x00);
        assert_eq!(req.p2, 7 << 3);
    }
}

// Copyright (c) 2023-2024 Calypso Networks Association

//! INVALIDATE (INS 0x04) and REHABILITATE (INS 0x44) toggle the DF
//! invalidation flag. The reference implementation labels REHABILITATE's
//! debug string "Invalidate" -- a naming bug; the INS byte is authoritative
//! (see `Instruction::Rehabilitate`).

use crate::framing::ApduRequest;
use crate::instruction::{CalypsoCardClass, Instruction};
use crate::status::{ErrorKind, StatusProperties, StatusTable, SUCCESS};

const STATUS_TABLE: StatusTable = &[
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
        StatusProperties::error("Access forbidden (DF already in target state).", ErrorKind::AccessForbidden),
    ),
];

pub fn status_table() -> StatusTable {
    STATUS_TABLE
}

fn build(card_class: CalypsoCardClass, ins: Instruction) -> ApduRequest {
    ApduRequest::new(card_class.value(), ins.byte(), 0x00, 0x00, ins.name())
}

pub fn build_invalidate(card_class: CalypsoCardClass) -> ApduRequest {
    build(card_class, Instruction::Invalidate)
}

pub fn build_rehabilitate(card_class: CalypsoCardClass) -> ApduRequest {
    build(card_class, Instruction::Rehabilitate)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn rehabilitate_uses_0x44_not_the_mislabeled_name() {
        let req = build_rehabilitate(CalypsoCardClass::Iso);
        assert_eq!(req.ins, 0x44);
    }
}

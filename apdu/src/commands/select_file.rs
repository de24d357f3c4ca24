// Copyright (c) 2023-2024 Calypso Networks Association

//! SELECT_FILE (INS 0xA4). Selects either a file by its 2-byte LID, or
//! navigates the current DF (first EF / next EF / current DF). Both forms
//! return the same proprietary-information TLV body, decoded by
//! [`crate::card_model`].

use crate::card_model::{find_simple_tlv, ProprietaryInformation, PROPRIETARY_INFORMATION_LENGTH};
use crate::framing::{ApduRequest, ApduResponse};
use crate::instruction::{CalypsoCardClass, Instruction, ProductType};
use crate::status::{check_status, CalypsoCardError, ErrorKind, StatusProperties, StatusTable, SUCCESS};

const STATUS_TABLE: StatusTable = &[
    SUCCESS,
    (
        0x6700,
        StatusProperties::error("Lc value not supported.", ErrorKind::IllegalParameter),
    ),
    (
        0x6981,
        StatusProperties::error("Wrong file type.", ErrorKind::DataAccess),
    ),
    (
        0x6982,
        StatusProperties::error(
            "Security conditions not fulfilled.",
            ErrorKind::SecurityContext,
        ),
    ),
    (
        0x6986,
        StatusProperties::error("Command not allowed (no current EF).", ErrorKind::AccessForbidden),
    ),
    (
        0x6A82,
        StatusProperties::error("File not found.", ErrorKind::DataAccess),
    ),
    (
        0x6A86,
        StatusProperties::error("Incorrect P1 or P2.", ErrorKind::IllegalParameter),
    ),
];

pub const PROPRIETARY_INFORMATION_TAG: u8 = 0x85;

/// Navigation control, selected when no explicit LID is supplied.
pub use crate::card_model::SelectFileControl;

const P1_SELECT_BY_LID: u8 = 0x09;
const P1_FIRST_EF: u8 = 0x02;
const P1_NEXT_EF: u8 = 0x03;
const P1_CURRENT_DF: u8 = 0x09;

pub fn build_select_file_by_lid(card_class: CalypsoCardClass, lid: u16) -> ApduRequest {
    ApduRequest::new(
        card_class.value(),
        Instruction::SelectFile.byte(),
        P1_SELECT_BY_LID,
        0x00,
        Instruction::SelectFile.name(),
    )
    .with_data(vec![(lid >> 8) as u8, lid as u8])
    .with_le(0x00)
}

pub fn build_select_file_control(card_class: CalypsoCardClass, control: SelectFileControl) -> ApduRequest {
    let p1 = match control {
        SelectFileControl::FirstEf => P1_FIRST_EF,
        SelectFileControl::NextEf => P1_NEXT_EF,
        SelectFileControl::CurrentDf => P1_CURRENT_DF,
    };
    let data = match control {
        SelectFileControl::CurrentDf => vec![],
        _ => vec![0x00, 0x00],
    };
    ApduRequest::new(card_class.value(), Instruction::SelectFile.byte(), p1, 0x00, Instruction::SelectFile.name())
        .with_data(data)
        .with_le(0x00)
}

pub fn parse_select_file(
    response: &ApduResponse,
    product_type: ProductType,
) -> Result<ProprietaryInformation, CalypsoCardError> {
    check_status(Instruction::SelectFile.name(), STATUS_TABLE, response, None)?;
    let data = response.data_out();
    let tlv = find_simple_tlv(data, PROPRIETARY_INFORMATION_TAG).ok_or_else(|| {
        CalypsoCardError::IllegalArgument("SELECT_FILE response missing proprietary information (tag 0x85)".into())
    })?;
    if tlv.len() != PROPRIETARY_INFORMATION_LENGTH {
        return Err(CalypsoCardError::UnexpectedResponseLength {
            command: Instruction::SelectFile.name(),
            expected: PROPRIETARY_INFORMATION_LENGTH,
            actual: tlv.len(),
        });
    }
    ProprietaryInformation::decode(tlv, product_type).map_err(CalypsoCardError::IllegalArgument)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn builds_select_by_lid() {
        let req = build_select_file_by_lid(CalypsoCardClass::Iso, 0x3007);
        assert_eq!(req.data(), &[0x30, 0x07]);
        assert_eq!(req.p1, P1_SELECT_BY_LID);
    }

    #[test]
    fn current_df_control_sends_no_data() {
        let req = build_select_file_control(CalypsoCardClass::Iso, SelectFileControl::CurrentDf);
        assert!(req.data().is_empty());
    }
}

// Copyright (c) 2023-2024 Calypso Networks Association

//! GET_DATA (INS 0xCA). One command, four payloads selected by P1P2: the FCI
//! template, the FCP proprietary block (same shape SELECT_FILE returns), the
//! list of EFs under the current DF, and the card's traceability information.

use crate::card_model::{find_simple_tlv, ProprietaryInformation, PROPRIETARY_INFORMATION_LENGTH};
use crate::framing::{ApduRequest, ApduResponse};
use crate::instruction::{CalypsoCardClass, Instruction, ProductType};
use crate::status::{check_status, CalypsoCardError, ErrorKind, StatusProperties, StatusTable, SUCCESS};

const STATUS_TABLE: StatusTable = &[
    SUCCESS,
    (
        0x6A88,
        StatusProperties::error("Data object not found.", ErrorKind::DataAccess),
    ),
    (
        0x6A81,
        StatusProperties::error("Incorrect P1/P2 (unknown tag).", ErrorKind::IllegalParameter),
    ),
];

/// Tags GET_DATA understands (component C GET_DATA contract).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum GetDataTag {
    Fci,
    Fcp,
    EfList,
    TraceabilityInformation,
}

impl GetDataTag {
    pub const fn p1_p2(self) -> u16 {
        match self {
            GetDataTag::Fci => 0x006F,
            GetDataTag::Fcp => 0x0062,
            GetDataTag::EfList => 0x00C0,
            GetDataTag::TraceabilityInformation => 0x0185,
        }
    }
}

pub fn build_get_data(card_class: CalypsoCardClass, tag: GetDataTag) -> ApduRequest {
    let p1p2 = tag.p1_p2();
    ApduRequest::new(
        card_class.value(),
        Instruction::GetData.byte(),
        (p1p2 >> 8) as u8,
        p1p2 as u8,
        Instruction::GetData.name(),
    )
    .with_le(0x00)
}

fn check(response: &ApduResponse) -> Result<(), CalypsoCardError> {
    check_status(Instruction::GetData.name(), STATUS_TABLE, response, None)
}

/// Minimal FCI decode: DF name (tag `0x84`), startup info (tag `0xC7`),
/// full serial number (tag `0xC8`), whichever of those are present.
#[derive(Clone, Debug, Default)]
pub struct FciInfo {
    pub df_name: Option<Vec<u8>>,
    pub startup_info: Option<Vec<u8>>,
    pub serial_number: Option<Vec<u8>>,
}

pub fn parse_fci(response: &ApduResponse) -> Result<FciInfo, CalypsoCardError> {
    check(response)?;
    let data = response.data_out();
    Ok(FciInfo {
        df_name: find_simple_tlv(data, 0x84).map(|v| v.to_vec()),
        startup_info: find_simple_tlv(data, 0xC7).map(|v| v.to_vec()),
        serial_number: find_simple_tlv(data, 0xC8).map(|v| v.to_vec()),
    })
}

pub fn parse_fcp(response: &ApduResponse, product_type: ProductType) -> Result<ProprietaryInformation, CalypsoCardError> {
    check(response)?;
    let data = response.data_out();
    let tlv = find_simple_tlv(data, 0x85)
        .ok_or_else(|| CalypsoCardError::IllegalArgument("GET_DATA(FCP) response missing tag 0x85".into()))?;
    if tlv.len() != PROPRIETARY_INFORMATION_LENGTH {
        return Err(CalypsoCardError::UnexpectedResponseLength {
            command: Instruction::GetData.name(),
            expected: PROPRIETARY_INFORMATION_LENGTH,
            actual: tlv.len(),
        });
    }
    ProprietaryInformation::decode(tlv, product_type).map_err(CalypsoCardError::IllegalArgument)
}

/// A single 6-byte EF descriptor: `sfi(1) | ef_type(1) | record_size(1) |
/// records_number(1) | lid(2, big-endian)`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EfListEntry {
    pub sfi: u8,
    pub ef_type_raw: u8,
    pub record_size: u8,
    pub records_number: u8,
    pub lid: u16,
}

const EF_LIST_ENTRY_LENGTH: usize = 6;

pub fn parse_ef_list(response: &ApduResponse) -> Result<Vec<EfListEntry>, CalypsoCardError> {
    check(response)?;
    let data = response.data_out();
    if data.len() % EF_LIST_ENTRY_LENGTH != 0 {
        return Err(CalypsoCardError::IllegalArgument(format!(
            "GET_DATA(EF_LIST) response length {} is not a multiple of {EF_LIST_ENTRY_LENGTH}",
            data.len()
        )));
    }
    Ok(data
        .chunks(EF_LIST_ENTRY_LENGTH)
        .map(|c| EfListEntry {
            sfi: c[0],
            ef_type_raw: c[1],
            record_size: c[2],
            records_number: c[3],
            lid: ((c[4] as u16) << 8) | c[5] as u16,
        })
        .collect())
}

pub fn parse_traceability_information(response: &ApduResponse) -> Result<Vec<u8>, CalypsoCardError> {
    check(response)?;
    Ok(response.data_out().to_vec())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn encodes_tag_in_p1p2() {
        let req = build_get_data(CalypsoCardClass::Iso, GetDataTag::EfList);
        assert_eq!(req.p1, 0x00);
        assert_eq!(req.p2, 0xC0);
    }

    #[test]
    fn parses_ef_list_entries() {
        let mut bytes = vec![0x07, 0x01, 29, 3, 0x30, 0x07];
        bytes.extend_from_slice(&[0x90, 0x00]);
        let resp = ApduResponse::new(bytes).unwrap();
        let entries = parse_ef_list(&resp).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].lid, 0x3007);
    }
}

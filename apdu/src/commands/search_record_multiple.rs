// Copyright (c) 2023-2024 Calypso Networks Association

//! SEARCH_RECORD_MULTIPLE (INS 0xA2). Scans records of an EF for a pattern,
//! returning the matching record numbers and, optionally, the first match's
//! content.

use crate::framing::{ApduRequest, ApduResponse};
use crate::instruction::{CalypsoCardClass, Instruction};
use crate::status::{check_status, CalypsoCardError, ErrorKind, StatusProperties, StatusTable, SUCCESS};

const STATUS_TABLE: StatusTable = &[
    SUCCESS,
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
        StatusProperties::error("Incorrect P1 or P2.", ErrorKind::IllegalParameter),
    ),
];

const FLAG_REPEATED_OFFSET: u8 = 0x01;
const FLAG_FETCH_FIRST_MATCH: u8 = 0x02;

/// Search parameters. `mask`, when shorter than `search_data`, is
/// right-padded with `0xFF` (wildcard) before being sent.
#[derive(Clone, Debug)]
pub struct SearchRecordMultipleParams {
    pub sfi: u8,
    pub start_record: u8,
    pub offset: u8,
    pub search_data: Vec<u8>,
    pub mask: Option<Vec<u8>>,
    pub repeated_offset: bool,
    pub fetch_first_match: bool,
}

pub fn build_search_record_multiple(card_class: CalypsoCardClass, params: &SearchRecordMultipleParams) -> ApduRequest {
    let mut flags = 0u8;
    if params.repeated_offset {
        flags |= FLAG_REPEATED_OFFSET;
    }
    if params.fetch_first_match {
        flags |= FLAG_FETCH_FIRST_MATCH;
    }

    let mut data = vec![params.offset, flags, params.search_data.len() as u8];
    data.extend_from_slice(&params.search_data);
    if let Some(mask) = &params.mask {
        let mut padded = mask.clone();
        padded.resize(params.search_data.len(), 0xFF);
        data.extend_from_slice(&padded);
    }

    ApduRequest::new(
        card_class.value(),
        Instruction::SearchRecordMultiple.byte(),
        params.start_record,
        (params.sfi << 3) | 0x01,
        Instruction::SearchRecordMultiple.name(),
    )
    .with_data(data)
    .with_le(0x00)
}

#[derive(Clone, Debug, Default)]
pub struct SearchRecordMultipleResult {
    pub matching_records: Vec<u8>,
    pub first_match_content: Option<Vec<u8>>,
}

pub fn parse_search_record_multiple(
    response: &ApduResponse,
    fetch_first_match: bool,
) -> Result<SearchRecordMultipleResult, CalypsoCardError> {
    check_status(
        Instruction::SearchRecordMultiple.name(),
        STATUS_TABLE,
        response,
        None,
    )?;
    let data = response.data_out();
    if data.is_empty() {
        return Err(CalypsoCardError::IllegalArgument(
            "SEARCH_RECORD_MULTIPLE response missing match count".into(),
        ));
    }
    let count = data[0] as usize;
    if data.len() < 1 + count {
        return Err(CalypsoCardError::IllegalArgument(
            "SEARCH_RECORD_MULTIPLE response shorter than declared match count".into(),
        ));
    }
    let matching_records = data[1..1 + count].to_vec();
    let first_match_content = if fetch_first_match && data.len() > 1 + count {
        Some(data[1 + count..].to_vec())
    } else {
        None
    };
    Ok(SearchRecordMultipleResult {
        matching_records,
        first_match_content,
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn pads_short_mask_with_wildcards() {
        let params = SearchRecordMultipleParams {
            sfi: 1,
            start_record: 1,
            offset: 0,
            search_data: vec![0xAA, 0xBB, 0xCC],
            mask: Some(vec![0xFF]),
            repeated_offset: false,
            fetch_first_match: false,
        };
        let req = build_search_record_multiple(CalypsoCardClass::Iso, &params);
        assert_eq!(req.data(), &[0, 0, 3, 0xAA, 0xBB, 0xCC, 0xFF, 0xFF, 0xFF]);
    }

    #[test]
    fn parses_matches_and_first_content() {
        let mut bytes = vec![0x02, 0x01, 0x03, 0xAA, 0xBB];
        bytes.extend_from_slice(&[0x90, 0x00]);
        let resp = ApduResponse::new(bytes).unwrap();
        let parsed = parse_search_record_multiple(&resp, true).unwrap();
        assert_eq!(parsed.matching_records, vec![1, 3]);
        assert_eq!(parsed.first_match_content, Some(vec![0xAA, 0xBB]));
    }
}

// Copyright (c) 2023-2024 Calypso Networks Association

//! READ_RECORDS (INS 0xB2). Reads one record, or several records in TLV
//! form, from a linear/cyclic/counters EF.

use crate::framing::{ApduRequest, ApduResponse};
use crate::instruction::{CalypsoCardClass, Instruction};
use crate::status::{check_status, CalypsoCardError, ErrorKind, StatusProperties, StatusTable, SUCCESS};

const P2_ONE_RECORD: u8 = 0x04;
const P2_MULTIPLE_RECORD: u8 = 0x05;

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
];

/// One record read, case 2 (no data field). `Le` is `0x00` (card decides
/// the true length); the image update uses the raw returned bytes.
pub fn build_read_one_record(card_class: CalypsoCardClass, sfi: u8, record_number: u8) -> ApduRequest {
    ApduRequest::new(
        card_class.value(),
        Instruction::ReadRecords.byte(),
        record_number,
        (sfi << 3) | P2_ONE_RECORD,
        Instruction::ReadRecords.name(),
    )
    .with_le(0x00)
}

/// Multiple-record read: every record from `record_number` onward, up to
/// what fits in `Le`.
pub fn build_read_records_multiple(
    card_class: CalypsoCardClass,
    sfi: u8,
    record_number: u8,
    le: u8,
) -> ApduRequest {
    ApduRequest::new(
        card_class.value(),
        Instruction::ReadRecords.byte(),
        record_number,
        (sfi << 3) | P2_MULTIPLE_RECORD,
        Instruction::ReadRecords.name(),
    )
    .with_le(le)
}

/// Records recovered from a READ_RECORDS response, in card order.
#[derive(Clone, Debug, Default)]
pub struct ReadRecordsResult {
    pub records: Vec<(u8, Vec<u8>)>,
}

pub fn parse_read_one_record(
    response: &ApduResponse,
    record_number: u8,
) -> Result<ReadRecordsResult, CalypsoCardError> {
    check_status(Instruction::ReadRecords.name(), STATUS_TABLE, response, None)?;
    Ok(ReadRecordsResult {
        records: vec![(record_number, response.data_out().to_vec())],
    })
}

/// Multiple-record responses are TLV: `recNo(1) | len(1) | data(len)` repeated.
pub fn parse_read_records_multiple(response: &ApduResponse) -> Result<ReadRecordsResult, CalypsoCardError> {
    check_status(Instruction::ReadRecords.name(), STATUS_TABLE, response, None)?;
    let data = response.data_out();
    let mut records = Vec::new();
    let mut i = 0;
    while i + 2 <= data.len() {
        let rec_no = data[i];
        let len = data[i + 1] as usize;
        let start = i + 2;
        let end = start + len;
        if end > data.len() {
            return Err(CalypsoCardError::IllegalArgument(
                "malformed READ_RECORDS multiple-record response".into(),
            ));
        }
        records.push((rec_no, data[start..end].to_vec()));
        i = end;
    }
    Ok(ReadRecordsResult { records })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn one_record_request_encodes_sfi_and_mode() {
        let req = build_read_one_record(CalypsoCardClass::Iso, 7, 1);
        assert_eq!(req.p1, 1);
        assert_eq!(req.p2, (7 << 3) | P2_ONE_RECORD);
    }

    #[test]
    fn parses_multiple_records_tlv() {
        let mut bytes = vec![0x01, 0x02, 0xAA, 0xBB, 0x02, 0x02, 0xCC, 0xDD];
        bytes.extend_from_slice(&[0x90, 0x00]);
        let resp = ApduResponse::new(bytes).unwrap();
        let parsed = parse_read_records_multiple(&resp).unwrap();
        assert_eq!(parsed.records, vec![(1, vec![0xAA, 0xBB]), (2, vec![0xCC, 0xDD])]);
    }
}

// Copyright (c) 2023-2024 Calypso Networks Association

//! Shared file/directory header decoding used by SELECT_FILE, GET_DATA(FCP)
//! and GET_DATA(EF_LIST) -- the proprietary-information offset table from the
//! component design (normative for all three decoders).

use crate::instruction::ProductType;

/// Write-access level a key pair (KIF/KVC) is bound to.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum WriteAccessLevel {
    Personalization,
    Load,
    Debit,
}

/// Navigation control for the "no LID given" form of SELECT_FILE.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SelectFileControl {
    FirstEf,
    NextEf,
    CurrentDf,
}

/// Parent-file kind decoded from the proprietary information block.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FileType {
    Mf,
    Df,
    Ef,
}

/// Elementary file subtype.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EfType {
    Binary,
    Linear,
    Cyclic,
    Counters,
    SimulatedCounters,
}

impl EfType {
    pub fn from_card_value(value: u8) -> Result<Self, String> {
        match value {
            EF_TYPE_BINARY => Ok(EfType::Binary),
            EF_TYPE_LINEAR => Ok(EfType::Linear),
            EF_TYPE_CYCLIC => Ok(EfType::Cyclic),
            EF_TYPE_SIMULATED_COUNTERS => Ok(EfType::SimulatedCounters),
            EF_TYPE_COUNTERS => Ok(EfType::Counters),
            other => Err(format!("unknown EF type: {other:02X}h")),
        }
    }
}

pub const FILE_TYPE_MF: u8 = 1;
pub const FILE_TYPE_DF: u8 = 2;
pub const FILE_TYPE_EF: u8 = 4;

pub const EF_TYPE_LINEAR: u8 = 1;
pub const EF_TYPE_BINARY: u8 = 2;
pub const EF_TYPE_CYCLIC: u8 = 4;
pub const EF_TYPE_SIMULATED_COUNTERS: u8 = 8;
pub const EF_TYPE_COUNTERS: u8 = 9;

const SEL_SFI_OFFSET: usize = 0;
const SEL_TYPE_OFFSET: usize = 1;
const SEL_EF_TYPE_OFFSET: usize = 2;
const SEL_REC_SIZE_OFFSET: usize = 3;
const SEL_NUM_REC_OFFSET: usize = 4;
const SEL_AC_OFFSET: usize = 5;
const SEL_AC_LENGTH: usize = 4;
const SEL_NKEY_OFFSET: usize = 9;
const SEL_NKEY_LENGTH: usize = 4;
const SEL_DF_STATUS_OFFSET: usize = 13;
const SEL_KVCS_OFFSET: usize = 14;
const SEL_KIFS_OFFSET: usize = 17;
const SEL_DATA_REF_OFFSET: usize = 14;
const SEL_LID_OFFSET: usize = 21;
const SEL_LID_OFFSET_REV2: usize = 19;

pub const PROPRIETARY_INFORMATION_LENGTH: usize = 23;

/// Decoded form of the 23-byte proprietary-information TLV body (tag `0x85`)
/// returned by SELECT_FILE and GET_DATA(FCP).
#[derive(Clone, Debug)]
pub struct ProprietaryInformation {
    pub sfi: u8,
    pub file_type: FileType,
    pub ef_type_raw: u8,
    pub record_size: usize,
    pub records_number: usize,
    pub access_conditions: [u8; 4],
    pub key_indexes: [u8; 4],
    pub df_status: u8,
    pub kvc: [u8; 3],
    pub kif: [u8; 3],
    pub data_reference: u16,
    pub lid: u16,
}

impl ProprietaryInformation {
    pub fn decode(bytes: &[u8], product_type: ProductType) -> Result<Self, String> {
        if bytes.len() != PROPRIETARY_INFORMATION_LENGTH {
            return Err(format!(
                "proprietary information: expected {PROPRIETARY_INFORMATION_LENGTH} bytes, got {}",
                bytes.len()
            ));
        }

        let file_type = match bytes[SEL_TYPE_OFFSET] {
            FILE_TYPE_MF => FileType::Mf,
            FILE_TYPE_DF => FileType::Df,
            FILE_TYPE_EF => FileType::Ef,
            other => return Err(format!("unknown file type: {other:02X}h")),
        };

        let (record_size, records_number) = if file_type == FileType::Ef
            && bytes[SEL_EF_TYPE_OFFSET] == EF_TYPE_BINARY
        {
            let size = ((bytes[SEL_REC_SIZE_OFFSET] as usize) << 8)
                | bytes[SEL_REC_SIZE_OFFSET + 1] as usize;
            (size, 1)
        } else {
            (
                bytes[SEL_REC_SIZE_OFFSET] as usize,
                bytes[SEL_NUM_REC_OFFSET] as usize,
            )
        };

        let mut access_conditions = [0u8; 4];
        access_conditions.copy_from_slice(&bytes[SEL_AC_OFFSET..SEL_AC_OFFSET + SEL_AC_LENGTH]);

        let mut key_indexes = [0u8; 4];
        key_indexes.copy_from_slice(&bytes[SEL_NKEY_OFFSET..SEL_NKEY_OFFSET + SEL_NKEY_LENGTH]);

        let lid_offset = if product_type.is_rev2_or_older() {
            SEL_LID_OFFSET_REV2
        } else {
            SEL_LID_OFFSET
        };
        let lid = ((bytes[lid_offset] as u16) << 8) | bytes[lid_offset + 1] as u16;

        let data_reference =
            ((bytes[SEL_DATA_REF_OFFSET] as u16) << 8) | bytes[SEL_DATA_REF_OFFSET + 1] as u16;

        Ok(Self {
            sfi: bytes[SEL_SFI_OFFSET],
            file_type,
            ef_type_raw: bytes[SEL_EF_TYPE_OFFSET],
            record_size,
            records_number,
            access_conditions,
            key_indexes,
            df_status: bytes[SEL_DF_STATUS_OFFSET],
            kvc: [
                bytes[SEL_KVCS_OFFSET],
                bytes[SEL_KVCS_OFFSET + 1],
                bytes[SEL_KVCS_OFFSET + 2],
            ],
            kif: [
                bytes[SEL_KIFS_OFFSET],
                bytes[SEL_KIFS_OFFSET + 1],
                bytes[SEL_KIFS_OFFSET + 2],
            ],
            data_reference,
            lid,
        })
    }

    pub fn ef_type(&self) -> Result<EfType, String> {
        EfType::from_card_value(self.ef_type_raw)
    }

    pub fn kvc_for(&self, level: WriteAccessLevel) -> u8 {
        self.kvc[level as usize]
    }

    pub fn kif_for(&self, level: WriteAccessLevel) -> u8 {
        self.kif[level as usize]
    }
}

/// Find the first BER-TLV primitive value for `tag` in a simple (non-nested)
/// TLV stream, as used to locate tag `0x85` in SELECT_FILE/GET_DATA(FCP)
/// responses. Supports one-byte tags and one-byte lengths (`< 0x80`), which
/// covers every tag this driver decodes.
pub fn find_simple_tlv(data: &[u8], tag: u8) -> Option<&[u8]> {
    let mut i = 0;
    while i + 2 <= data.len() {
        let t = data[i];
        let len = data[i + 1] as usize;
        let value_start = i + 2;
        let value_end = value_start + len;
        if value_end > data.len() {
            break;
        }
        if t == tag {
            return Some(&data[value_start..value_end]);
        }
        i = value_end;
    }
    None
}

#[cfg(test)]
mod test {
    use super::*;

    fn sample_bytes() -> Vec<u8> {
        let mut b = vec![0u8; PROPRIETARY_INFORMATION_LENGTH];
        b[SEL_SFI_OFFSET] = 0x07;
        b[SEL_TYPE_OFFSET] = FILE_TYPE_EF;
        b[SEL_EF_TYPE_OFFSET] = EF_TYPE_LINEAR;
        b[SEL_REC_SIZE_OFFSET] = 29;
        b[SEL_NUM_REC_OFFSET] = 3;
        b[SEL_LID_OFFSET] = 0x30;
        b[SEL_LID_OFFSET + 1] = 0x07;
        b
    }

    #[test]
    fn decodes_linear_ef() {
        let info = ProprietaryInformation::decode(&sample_bytes(), ProductType::Rev3_2).unwrap();
        assert_eq!(info.sfi, 0x07);
        assert_eq!(info.file_type, FileType::Ef);
        assert_eq!(info.ef_type().unwrap(), EfType::Linear);
        assert_eq!(info.record_size, 29);
        assert_eq!(info.records_number, 3);
        assert_eq!(info.lid, 0x3007);
    }

    #[test]
    fn rejects_wrong_length() {
        assert!(ProprietaryInformation::decode(&[0u8; 4], ProductType::Rev3_2).is_err());
    }

    #[test]
    fn finds_proprietary_information_tag() {
        let mut tlv = vec![0x85, PROPRIETARY_INFORMATION_LENGTH as u8];
        tlv.extend(sample_bytes());
        let value = find_simple_tlv(&tlv, 0x85).unwrap();
        assert_eq!(value.len(), PROPRIETARY_INFORMATION_LENGTH);
    }
}

// Copyright (c) 2023-2024 Calypso Networks Association

//! Elementary-file and directory-header data model (component D): the
//! per-SFI record/counter store plus the mutators `setContent`,
//! `fillContent`, `setCounter` and `addCyclicContent` every command effect
//! funnels through.

use std::collections::BTreeMap;

pub use calypso_apdu::card_model::WriteAccessLevel;
use calypso_apdu::card_model::{EfType, ProprietaryInformation};

/// File header shared by every EF regardless of subtype.
#[derive(Clone, Debug)]
pub struct FileHeader {
    pub lid: u16,
    pub ef_type: EfType,
    pub record_size: usize,
    pub records_number: usize,
    pub access_conditions: [u8; 4],
    pub key_indexes: [u8; 4],
    pub df_status: u8,
    /// Present when this EF's content is shared with another (same
    /// `dataReference`).
    pub shared_reference: Option<u16>,
}

impl FileHeader {
    pub fn from_proprietary_information(info: &ProprietaryInformation) -> Self {
        Self {
            lid: info.lid,
            ef_type: info.ef_type().unwrap_or(EfType::Linear),
            record_size: info.record_size,
            records_number: info.records_number.max(1),
            access_conditions: info.access_conditions,
            key_indexes: info.key_indexes,
            df_status: info.df_status,
            shared_reference: if info.data_reference != 0 {
                Some(info.data_reference)
            } else {
                None
            },
        }
    }
}

/// MF/DF directory header: access conditions, key indexes and the
/// per-write-access-level KIF/KVC pairs used to authorize a session.
#[derive(Clone, Debug)]
pub struct DirectoryHeader {
    pub lid: u16,
    pub access_conditions: [u8; 4],
    pub key_indexes: [u8; 4],
    pub df_status: u8,
    pub kif: BTreeMap<WriteAccessLevel, u8>,
    pub kvc: BTreeMap<WriteAccessLevel, u8>,
}

impl DirectoryHeader {
    pub fn from_proprietary_information(info: &ProprietaryInformation) -> Self {
        let mut kif = BTreeMap::new();
        let mut kvc = BTreeMap::new();
        for level in [
            WriteAccessLevel::Personalization,
            WriteAccessLevel::Load,
            WriteAccessLevel::Debit,
        ] {
            kif.insert(level, info.kif_for(level));
            kvc.insert(level, info.kvc_for(level));
        }
        Self {
            lid: info.lid,
            access_conditions: info.access_conditions,
            key_indexes: info.key_indexes,
            df_status: info.df_status,
            kif,
            kvc,
        }
    }
}

/// A single elementary file: its header plus an ordered, 1-based
/// record-number -> bytes map.
#[derive(Clone, Debug)]
pub struct ElementaryFile {
    pub sfi: u8,
    pub header: FileHeader,
    records: BTreeMap<u8, Vec<u8>>,
}

impl PartialEq for ElementaryFile {
    fn eq(&self, other: &Self) -> bool {
        self.sfi == other.sfi
    }
}
impl Eq for ElementaryFile {}

impl ElementaryFile {
    pub fn new(sfi: u8, header: FileHeader) -> Self {
        Self {
            sfi,
            header,
            records: BTreeMap::new(),
        }
    }

    pub fn records(&self) -> &BTreeMap<u8, Vec<u8>> {
        &self.records
    }

    pub fn record(&self, record_number: u8) -> Option<&[u8]> {
        self.records.get(&record_number).map(Vec::as_slice)
    }

    /// Replace a full record.
    pub fn set_content(&mut self, record_number: u8, bytes: &[u8]) {
        self.records.insert(record_number, bytes.to_vec());
    }

    /// Write `bytes` at `offset` within the record, left-padding with zeros
    /// if the existing (or absent) record is shorter than `offset`.
    pub fn set_content_at_offset(&mut self, record_number: u8, bytes: &[u8], offset: usize) {
        let entry = self.records.entry(record_number).or_default();
        let needed = offset + bytes.len();
        if entry.len() < needed {
            entry.resize(needed, 0);
        }
        entry[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    /// Binary-OR `bytes` into the existing content starting at `offset`; any
    /// part of `bytes` beyond the current content length is taken verbatim
    /// (CL-invariant 7: `fill(a, b, off) = a[0..off] ⊕ OR-overlay(b) ⊕ tail(b)`).
    pub fn fill_content(&mut self, record_number: u8, bytes: &[u8], offset: usize) {
        let entry = self.records.entry(record_number).or_default();
        let needed = offset + bytes.len();
        if entry.len() < needed {
            entry.resize(needed, 0);
        }
        for (i, b) in bytes.iter().enumerate() {
            entry[offset + i] |= b;
        }
    }

    /// `setCounter(sfi, c, v)` is `setContent(sfi, 1, v, (c-1)*3)`: counters
    /// live packed as 3-byte big-endian values in record #1.
    pub fn set_counter(&mut self, counter_number: u8, value: u32) {
        let bytes = value.to_be_bytes();
        self.set_content_at_offset(1, &bytes[1..4], (counter_number as usize - 1) * 3);
    }

    pub fn counter_value(&self, counter_number: u8) -> Option<u32> {
        let record = self.records.get(&1)?;
        let offset = (counter_number as usize - 1) * 3;
        let slice = record.get(offset..offset + 3)?;
        Some(((slice[0] as u32) << 16) | ((slice[1] as u32) << 8) | slice[2] as u32)
    }

    /// Prepend `bytes` as the new record #1; every existing record shifts up
    /// by one. Explicitly non-idempotent (CL-invariant 8).
    pub fn add_cyclic_content(&mut self, bytes: &[u8]) {
        let shifted: Vec<(u8, Vec<u8>)> = self
            .records
            .iter()
            .filter_map(|(&rec_no, data)| rec_no.checked_add(1).map(|next| (next, data.clone())))
            .collect();
        self.records.clear();
        for (rec_no, data) in shifted {
            self.records.insert(rec_no, data);
        }
        self.records.insert(1, bytes.to_vec());
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use calypso_apdu::card_model::EfType;

    fn file() -> ElementaryFile {
        ElementaryFile::new(
            1,
            FileHeader {
                lid: 0x1000,
                ef_type: EfType::Linear,
                record_size: 29,
                records_number: 3,
                access_conditions: [0; 4],
                key_indexes: [0; 4],
                df_status: 0,
                shared_reference: None,
            },
        )
    }

    #[test]
    fn counter_round_trip() {
        let mut f = file();
        f.set_counter(1, 8);
        assert_eq!(f.counter_value(1), Some(8));
    }

    #[test]
    fn fill_content_is_or_with_tail_extension() {
        let mut f = file();
        f.set_content(1, &[0b0000_1111, 0b1111_0000]);
        f.fill_content(1, &[0b1111_0000, 0b0000_1111, 0xAA], 0);
        assert_eq!(f.record(1).unwrap(), &[0xFF, 0xFF, 0xAA]);
    }

    #[test]
    fn set_content_at_offset_left_pads_with_zeros() {
        let mut f = file();
        f.set_content_at_offset(1, &[0xAA], 2);
        assert_eq!(f.record(1).unwrap(), &[0x00, 0x00, 0xAA]);
    }

    #[test]
    fn cyclic_append_shifts_records_up() {
        let mut f = file();
        f.set_content(1, &[1]);
        f.set_content(2, &[2]);
        f.add_cyclic_content(&[9]);
        assert_eq!(f.record(1).unwrap(), &[9]);
        assert_eq!(f.record(2).unwrap(), &[1]);
        assert_eq!(f.record(3).unwrap(), &[2]);
    }
}

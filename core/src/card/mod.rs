// Copyright (c) 2023-2024 Calypso Networks Association

//! The reconstructed card image (component D): product attributes,
//! identity, directory header, elementary files and stored-value state,
//! with single-slot backup/restore around secure sessions.

pub mod file;
pub mod product;
pub mod sv_state;

use std::collections::BTreeMap;

use file::{DirectoryHeader, ElementaryFile, FileHeader};
use product::ProductInfo;
use sv_state::SvState;

/// The in-memory view of a selected Calypso application. Owned exclusively
/// by the [`crate::transaction_manager::CardTransactionManager`] driving it.
#[derive(Clone, Debug)]
pub struct CalypsoCard {
    pub product: ProductInfo,

    pub df_name: Vec<u8>,
    pub full_serial_number: Vec<u8>,
    pub power_on_data: Vec<u8>,
    pub selection_response: Vec<u8>,

    pub directory_header: Option<DirectoryHeader>,

    files_by_sfi: BTreeMap<u8, ElementaryFile>,
    lid_to_sfi: BTreeMap<u16, u8>,
    backup: Option<BTreeMap<u8, ElementaryFile>>,

    pub card_challenge: Vec<u8>,
    pub traceability_information: Option<Vec<u8>>,
    pub pin_attempts_remaining: Option<u8>,
    pub is_df_ratified: bool,
    pub transaction_counter: u32,

    pub sv: SvState,
}

impl CalypsoCard {
    pub fn new(
        product: ProductInfo,
        df_name: Vec<u8>,
        full_serial_number: Vec<u8>,
        power_on_data: Vec<u8>,
        selection_response: Vec<u8>,
    ) -> Self {
        Self {
            product,
            df_name,
            full_serial_number,
            power_on_data,
            selection_response,
            directory_header: None,
            files_by_sfi: BTreeMap::new(),
            lid_to_sfi: BTreeMap::new(),
            backup: None,
            card_challenge: Vec::new(),
            traceability_information: None,
            pin_attempts_remaining: None,
            is_df_ratified: false,
            transaction_counter: 0,
            sv: SvState::default(),
        }
    }

    /// `attemptsRemaining == 0` is the only source of truth for "blocked".
    pub fn is_pin_blocked(&self) -> bool {
        self.pin_attempts_remaining == Some(0)
    }

    pub fn get_file_by_sfi(&self, sfi: u8) -> Option<&ElementaryFile> {
        self.files_by_sfi.get(&sfi)
    }

    pub fn get_file_by_sfi_mut(&mut self, sfi: u8) -> Option<&mut ElementaryFile> {
        self.files_by_sfi.get_mut(&sfi)
    }

    pub fn get_file_by_lid(&self, lid: u16) -> Option<&ElementaryFile> {
        self.lid_to_sfi.get(&lid).and_then(|sfi| self.files_by_sfi.get(sfi))
    }

    pub fn get_files(&self) -> impl Iterator<Item = &ElementaryFile> {
        self.files_by_sfi.values()
    }

    /// Creates the file on first use (e.g. the OPEN_SESSION inline record
    /// read, which only knows the SFI) with a best-effort linear header;
    /// SELECT_FILE / GET_DATA(EF_LIST) will later call
    /// [`Self::put_file_header`] to install the real one.
    fn file_mut_or_default(&mut self, sfi: u8) -> &mut ElementaryFile {
        self.files_by_sfi.entry(sfi).or_insert_with(|| {
            ElementaryFile::new(
                sfi,
                FileHeader {
                    lid: 0,
                    ef_type: calypso_apdu::card_model::EfType::Linear,
                    record_size: 0,
                    records_number: 0,
                    access_conditions: [0; 4],
                    key_indexes: [0; 4],
                    df_status: 0,
                    shared_reference: None,
                },
            )
        })
    }

    /// Installs (or refreshes) a file header learned from SELECT_FILE or
    /// GET_DATA(FCP)/(EF_LIST). Both MF/DF directory headers and EF headers
    /// funnel through here when the file type is MF or DF (CL-source
    /// ambiguity noted in the design notes: treat MF and DF consistently).
    pub fn put_directory_header(&mut self, header: DirectoryHeader) {
        self.directory_header = Some(header);
    }

    pub fn put_file_header(&mut self, sfi: u8, header: FileHeader) {
        self.lid_to_sfi.insert(header.lid, sfi);
        match self.files_by_sfi.get_mut(&sfi) {
            Some(existing) => existing.header = header,
            None => {
                self.files_by_sfi.insert(sfi, ElementaryFile::new(sfi, header));
            }
        }
    }

    pub fn set_content(&mut self, sfi: u8, record_number: u8, bytes: &[u8]) {
        self.file_mut_or_default(sfi).set_content(record_number, bytes);
    }

    pub fn set_content_at_offset(&mut self, sfi: u8, record_number: u8, bytes: &[u8], offset: usize) {
        self.file_mut_or_default(sfi)
            .set_content_at_offset(record_number, bytes, offset);
    }

    pub fn fill_content(&mut self, sfi: u8, record_number: u8, bytes: &[u8], offset: usize) {
        self.file_mut_or_default(sfi).fill_content(record_number, bytes, offset);
    }

    pub fn set_counter(&mut self, sfi: u8, counter_number: u8, value: u32) {
        self.file_mut_or_default(sfi).set_counter(counter_number, value);
    }

    pub fn get_counter_value(&self, sfi: u8, counter_number: u8) -> Option<u32> {
        self.get_file_by_sfi(sfi).and_then(|f| f.counter_value(counter_number))
    }

    pub fn add_cyclic_content(&mut self, sfi: u8, bytes: &[u8]) {
        self.file_mut_or_default(sfi).add_cyclic_content(bytes);
    }

    /// Captures a deep copy of the files collection. Exactly one backup slot
    /// exists; a second `backup()` before a `restore()` overwrites the
    /// first, matching the single-session-at-a-time usage pattern.
    pub fn backup(&mut self) {
        self.backup = Some(self.files_by_sfi.clone());
    }

    /// Swaps the files collection back to the last backup, if any.
    pub fn restore(&mut self) {
        if let Some(backup) = self.backup.take() {
            self.files_by_sfi = backup;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use product::ProductInfo;

    fn card() -> CalypsoCard {
        CalypsoCard::new(ProductInfo::unknown(), vec![], vec![], vec![], vec![])
    }

    #[test]
    fn backup_then_restore_discards_mutations() {
        let mut card = card();
        card.set_content(1, 1, &[0xAA]);
        card.backup();
        card.set_content(1, 1, &[0xBB]);
        card.restore();
        assert_eq!(card.get_file_by_sfi(1).unwrap().record(1).unwrap(), &[0xAA]);
    }

    #[test]
    fn pin_blocked_iff_zero_attempts() {
        let mut card = card();
        card.pin_attempts_remaining = Some(0);
        assert!(card.is_pin_blocked());
        card.pin_attempts_remaining = Some(1);
        assert!(!card.is_pin_blocked());
    }

    #[test]
    fn counter_set_then_read_through_card_facade() {
        let mut card = card();
        card.set_counter(1, 1, 5);
        assert_eq!(card.get_counter_value(1, 1), Some(5));
    }
}

// Copyright (c) 2023-2024 Calypso Networks Association

//! The selection builder (component G): assembles the APDU batch used to
//! select a Calypso application and parses its responses into an initial
//! [`CalypsoCard`] image. Card-selection plumbing above "which AID, which
//! optional selection-time reads" is out of scope; this module only builds
//! and parses the APDUs the core itself issues.

use calypso_apdu::card_model::FileType;
use calypso_apdu::commands::get_data::{self, GetDataTag};
use calypso_apdu::commands::select_file;
use calypso_apdu::instruction::CalypsoCardClass;
use calypso_apdu::ApduRequest;
use log::debug;

use crate::card::file::{DirectoryHeader, FileHeader};
use crate::card::product::ProductInfo;
use crate::card::CalypsoCard;
use crate::error::{TransactionAuditData, TransactionManagerError, TransactionManagerErrorKind};
use crate::reader::CardRequest;

/// A queued selection-time read, folded into the selection's APDU batch
/// ahead of the trailing GET_DATA(FCI) the builder always issues.
#[derive(Clone, Debug)]
enum SelectionStep {
    SelectFileByLid(u16),
    ReadRecord { sfi: u8, record_number: u8 },
}

/// Builds a card-selection request and parses its response into an initial
/// [`CalypsoCard`]. One builder corresponds to one selection attempt.
#[derive(Clone, Debug, Default)]
pub struct SelectionBuilder {
    steps: Vec<SelectionStep>,
}

impl SelectionBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn prepare_select_file(&mut self, lid: u16) -> &mut Self {
        self.steps.push(SelectionStep::SelectFileByLid(lid));
        self
    }

    pub fn prepare_read_record(&mut self, sfi: u8, record_number: u8) -> &mut Self {
        self.steps.push(SelectionStep::ReadRecord { sfi, record_number });
        self
    }

    /// Legacy (Rev1/2) cards answer SELECT_FILE/READ_RECORDS/GET_DATA with
    /// CLA `0x94`; the builder doesn't know the product type yet (that's
    /// what it's about to discover), so it always selects with ISO class --
    /// the card's ATR/power-on data is what ultimately resolves the class
    /// for every subsequent exchange.
    pub fn build(&self) -> CardRequest {
        let mut requests: Vec<ApduRequest> = Vec::with_capacity(self.steps.len() + 1);
        for step in &self.steps {
            let request = match step {
                SelectionStep::SelectFileByLid(lid) => select_file::build_select_file_by_lid(CalypsoCardClass::Iso, *lid),
                SelectionStep::ReadRecord { sfi, record_number } => {
                    calypso_apdu::commands::read_records::build_read_one_record(CalypsoCardClass::Iso, *sfi, *record_number)
                }
            };
            requests.push(request);
        }
        requests.push(get_data::build_get_data(CalypsoCardClass::Iso, GetDataTag::Fci));
        CardRequest {
            apdu_requests: requests,
            stop_on_unsuccessful_status: true,
        }
    }

    /// Parses the responses to `build()`'s batch (in the same order) into
    /// the initial card image. `power_on_data` and the raw selection
    /// response APDU come from the transport-level card-selection plumbing
    /// that sits above this crate.
    pub fn parse(
        &self,
        apdu_responses: &[calypso_apdu::ApduResponse],
        power_on_data: Vec<u8>,
        selection_response: Vec<u8>,
    ) -> Result<CalypsoCard, TransactionManagerError> {
        if apdu_responses.len() != self.steps.len() + 1 {
            return Err(TransactionManagerError::new(
                TransactionManagerErrorKind::InconsistentData {
                    requests: self.steps.len() + 1,
                    responses: apdu_responses.len(),
                },
                TransactionAuditData::default(),
            ));
        }

        let fci_response = apdu_responses.last().expect("checked length above");
        let fci = get_data::parse_fci(fci_response).map_err(|source| {
            TransactionManagerError::new(
                TransactionManagerErrorKind::UnexpectedCommandStatus(source),
                TransactionAuditData::default(),
            )
        })?;

        let product = fci
            .startup_info
            .as_deref()
            .map(ProductInfo::decode_from_startup_info)
            .unwrap_or_else(ProductInfo::unknown);

        let mut card = CalypsoCard::new(
            product,
            fci.df_name.unwrap_or_default(),
            fci.serial_number.unwrap_or_default(),
            power_on_data,
            selection_response,
        );

        for (step, response) in self.steps.iter().zip(apdu_responses.iter()) {
            match step {
                SelectionStep::SelectFileByLid(_) => {
                    let info = select_file::parse_select_file(response, card.product.product_type).map_err(|source| {
                        TransactionManagerError::new(
                            TransactionManagerErrorKind::UnexpectedCommandStatus(source),
                            TransactionAuditData::default(),
                        )
                    })?;
                    match info.file_type {
                        FileType::Mf | FileType::Df => {
                            card.put_directory_header(DirectoryHeader::from_proprietary_information(&info));
                        }
                        FileType::Ef => {
                            card.put_file_header(info.sfi, FileHeader::from_proprietary_information(&info));
                        }
                    }
                }
                SelectionStep::ReadRecord { sfi, record_number } => {
                    let result = calypso_apdu::commands::read_records::parse_read_one_record(response, *record_number)
                        .map_err(|source| {
                            TransactionManagerError::new(
                                TransactionManagerErrorKind::UnexpectedCommandStatus(source),
                                TransactionAuditData::default(),
                            )
                        })?;
                    for (rec_no, bytes) in result.records {
                        card.set_content(*sfi, rec_no, &bytes);
                    }
                }
            }
        }

        debug!("selection parsed: df_name={:02x?}", card.df_name);
        Ok(card)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use calypso_apdu::ApduResponse;

    #[test]
    fn parses_fci_only_selection() {
        let builder = SelectionBuilder::new();
        let request = builder.build();
        assert_eq!(request.apdu_requests.len(), 1);

        let mut fci = vec![0x84, 0x02, 0xAA, 0xBB];
        fci.extend_from_slice(&[0x90, 0x00]);
        let responses = vec![ApduResponse::new(fci).unwrap()];
        let card = builder.parse(&responses, vec![], vec![]).unwrap();
        assert_eq!(card.df_name, vec![0xAA, 0xBB]);
    }
}

// Copyright (c) 2023-2024 Calypso Networks Association

//! The secure-session orchestrator (component F): command queue, session
//! state machine, atomic batching with automatic session splitting,
//! anticipated-response generation for the SAM digest, ratification and the
//! stored-value finalization path.

use std::collections::VecDeque;

use calypso_apdu::card_model::{SelectFileControl, WriteAccessLevel};
use calypso_apdu::commands::{
    append_record, close_session, counters, df_status, get_challenge, get_data, open_session, pin_and_key,
    read_binary, read_record_multiple, read_records, search_record_multiple, select_file, sv, write,
};
use calypso_apdu::instruction::{CalypsoCardClass, Instruction};
use calypso_apdu::{ApduRequest, ApduResponse, CalypsoCardError};
use log::{debug, trace, warn};

use crate::card::file::{DirectoryHeader, FileHeader};
use crate::card::product::ModificationCounterScheme;
use crate::card::CalypsoCard;
use crate::config::Config;
use crate::error::{TransactionAuditData, TransactionManagerError, TransactionManagerErrorKind};
use crate::reader::{CardProxyReader, CardRequest, CardResponse, ChannelControl, ReaderError};
use crate::sam::ControlSamTransactionManager;

type Result<T> = std::result::Result<T, TransactionManagerError>;

/// Stored-value log file SFIs, fixed by the Calypso SV application (not
/// discovered through selection).
const SV_RELOAD_LOG_FILE_SFI: u8 = 0x14;
const SV_DEBIT_LOG_FILE_SFI: u8 = 0x15;

/// One queued, not-yet-transmitted logical operation. Built into an
/// [`ApduRequest`] lazily (at transmit time) because several variants need
/// information only known once the card class/product type are resolved or
/// the SAM has supplied completion data (SV two-phase commands).
#[derive(Clone, Debug)]
enum PreparedCommand {
    SelectFileByLid(u16),
    SelectFileControl(SelectFileControl),
    ReadOneRecord { sfi: u8, record_number: u8 },
    ReadRecordsMultiple { sfi: u8, record_number: u8 },
    ReadRecordPartially { sfi: u8, record_number: u8, offset: u8, length: u8 },
    ReadBinary { sfi: u8, offset: u16, length: u8 },
    ReadCounter { sfi: u8, counter_number: u8 },
    SearchRecords(search_record_multiple::SearchRecordMultipleParams),
    AppendRecord { sfi: u8, data: Vec<u8> },
    UpdateRecord { sfi: u8, record_number: u8, data: Vec<u8> },
    WriteRecord { sfi: u8, record_number: u8, data: Vec<u8> },
    UpdateBinary { sfi: u8, offset: u16, data: Vec<u8> },
    WriteBinary { sfi: u8, offset: u16, data: Vec<u8> },
    IncreaseCounter { sfi: u8, counter_number: u8, amount: u32 },
    DecreaseCounter { sfi: u8, counter_number: u8, amount: u32 },
    IncreaseCounters { sfi: u8, counters: Vec<(u8, u32)> },
    DecreaseCounters { sfi: u8, counters: Vec<(u8, u32)> },
    CheckPinStatus,
    SvGet(sv::SvOperation),
    /// Built after finalize() is called with SAM complementary data, right
    /// before transmission (see `finalize_pending_sv`).
    SvModifying { template: sv::SvCommandTemplate, finalized: Option<ApduRequest> },
    Invalidate,
    Rehabilitate,
    GetData(get_data::GetDataTag),
    ReleaseCardChannel,
}

impl PreparedCommand {
    /// Session-buffer-using ("modifying") classification (component C).
    fn uses_session_buffer(&self) -> bool {
        matches!(
            self,
            PreparedCommand::AppendRecord { .. }
                | PreparedCommand::UpdateRecord { .. }
                | PreparedCommand::WriteRecord { .. }
                | PreparedCommand::UpdateBinary { .. }
                | PreparedCommand::WriteBinary { .. }
                | PreparedCommand::IncreaseCounter { .. }
                | PreparedCommand::DecreaseCounter { .. }
                | PreparedCommand::IncreaseCounters { .. }
                | PreparedCommand::DecreaseCounters { .. }
                | PreparedCommand::SvModifying { .. }
                | PreparedCommand::Invalidate
                | PreparedCommand::Rehabilitate
        )
    }

    fn name(&self) -> &'static str {
        match self {
            PreparedCommand::SelectFileByLid(_) | PreparedCommand::SelectFileControl(_) => Instruction::SelectFile.name(),
            PreparedCommand::ReadOneRecord { .. } | PreparedCommand::ReadRecordsMultiple { .. } => Instruction::ReadRecords.name(),
            PreparedCommand::ReadRecordPartially { .. } => Instruction::ReadRecordMultiple.name(),
            PreparedCommand::ReadBinary { .. } => Instruction::ReadBinary.name(),
            PreparedCommand::ReadCounter { .. } => Instruction::ReadRecords.name(),
            PreparedCommand::SearchRecords(_) => Instruction::SearchRecordMultiple.name(),
            PreparedCommand::AppendRecord { .. } => Instruction::AppendRecord.name(),
            PreparedCommand::UpdateRecord { .. } => Instruction::UpdateRecord.name(),
            PreparedCommand::WriteRecord { .. } => Instruction::WriteRecord.name(),
            PreparedCommand::UpdateBinary { .. } => Instruction::UpdateBinary.name(),
            PreparedCommand::WriteBinary { .. } => Instruction::WriteBinary.name(),
            PreparedCommand::IncreaseCounter { .. } => Instruction::Increase.name(),
            PreparedCommand::DecreaseCounter { .. } => Instruction::Decrease.name(),
            PreparedCommand::IncreaseCounters { .. } => Instruction::IncreaseMultiple.name(),
            PreparedCommand::DecreaseCounters { .. } => Instruction::DecreaseMultiple.name(),
            PreparedCommand::CheckPinStatus => Instruction::VerifyPin.name(),
            PreparedCommand::SvGet(_) => Instruction::SvGet.name(),
            PreparedCommand::SvModifying { template, .. } => template.ins.name(),
            PreparedCommand::Invalidate => Instruction::Invalidate.name(),
            PreparedCommand::Rehabilitate => Instruction::Rehabilitate.name(),
            PreparedCommand::GetData(_) => Instruction::GetData.name(),
            PreparedCommand::ReleaseCardChannel => "RELEASE_CHANNEL",
        }
    }

    /// Builds the wire request. Panics if called on an unfinalized
    /// `SvModifying` -- the orchestrator always finalizes pending SV
    /// commands before building a batch (`finalize_pending_sv`).
    fn to_apdu_request(&self, class: CalypsoCardClass) -> Option<ApduRequest> {
        Some(match self {
            PreparedCommand::SelectFileByLid(lid) => select_file::build_select_file_by_lid(class, *lid),
            PreparedCommand::SelectFileControl(control) => select_file::build_select_file_control(class, *control),
            PreparedCommand::ReadOneRecord { sfi, record_number } => read_records::build_read_one_record(class, *sfi, *record_number),
            PreparedCommand::ReadRecordsMultiple { sfi, record_number } => {
                read_records::build_read_records_multiple(class, *sfi, *record_number, 0x00)
            }
            PreparedCommand::ReadRecordPartially { sfi, record_number, offset, length } => {
                read_record_multiple::build_read_record_multiple(class, *sfi, *record_number, *offset, *length, *length)
            }
            PreparedCommand::ReadBinary { sfi, offset, length } => read_binary::build_read_binary(class, *sfi, *offset, *length),
            PreparedCommand::ReadCounter { sfi, .. } => read_records::build_read_one_record(class, *sfi, 1),
            PreparedCommand::SearchRecords(params) => search_record_multiple::build_search_record_multiple(class, params),
            PreparedCommand::AppendRecord { sfi, data } => append_record::build_append_record(class, *sfi, data.clone()),
            PreparedCommand::UpdateRecord { sfi, record_number, data } => {
                write::build_update_record(class, *sfi, *record_number, data.clone())
            }
            PreparedCommand::WriteRecord { sfi, record_number, data } => {
                write::build_write_record(class, *sfi, *record_number, data.clone())
            }
            PreparedCommand::UpdateBinary { sfi, offset, data } => write::build_update_binary(class, *sfi, *offset, data.clone()),
            PreparedCommand::WriteBinary { sfi, offset, data } => write::build_write_binary(class, *sfi, *offset, data.clone()),
            PreparedCommand::IncreaseCounter { sfi, counter_number, amount } => {
                counters::build_increase(class, *sfi, *counter_number, *amount)
            }
            PreparedCommand::DecreaseCounter { sfi, counter_number, amount } => {
                counters::build_decrease(class, *sfi, *counter_number, *amount)
            }
            PreparedCommand::IncreaseCounters { sfi, counters: c } => counters::build_increase_multiple(class, *sfi, c),
            PreparedCommand::DecreaseCounters { sfi, counters: c } => counters::build_decrease_multiple(class, *sfi, c),
            PreparedCommand::CheckPinStatus => pin_and_key::build_verify_pin_read_counter(class),
            PreparedCommand::SvGet(op) => sv::build_sv_get(class, *op, false),
            PreparedCommand::SvModifying { finalized, .. } => finalized.clone()?,
            PreparedCommand::Invalidate => df_status::build_invalidate(class),
            PreparedCommand::Rehabilitate => df_status::build_rehabilitate(class),
            PreparedCommand::GetData(tag) => get_data::build_get_data(class, *tag),
            PreparedCommand::ReleaseCardChannel => return None,
        })
    }

    /// CL-CSS-MCL: byte-mode cost is `|apdu|+6-5`; operation-mode cost is 1.
    fn cost(&self, apdu: &ApduRequest, scheme: ModificationCounterScheme) -> i64 {
        match scheme {
            ModificationCounterScheme::Operations => 1,
            ModificationCounterScheme::Bytes => apdu.to_bytes().len() as i64 + 1,
        }
    }
}

/// Stateful coordinator driving one Calypso secure session. Owns the card
/// image and the reader/SAM collaborators for the session's duration.
pub struct CardTransactionManager<R: CardProxyReader, S: ControlSamTransactionManager> {
    card: CalypsoCard,
    reader: R,
    sam: Option<S>,
    config: Config,

    queue: VecDeque<PreparedCommand>,
    write_access_level: Option<WriteAccessLevel>,
    session_open: bool,
    modifications_buffer_remaining: i64,

    sv_last_command_ref: Option<sv::SvOperation>,
    sv_operation_pending: bool,
    sv_used_this_session: bool,

    channel_control_override: Option<ChannelControl>,
    audit: TransactionAuditData,
}

impl<R: CardProxyReader, S: ControlSamTransactionManager> CardTransactionManager<R, S> {
    pub fn new(card: CalypsoCard, reader: R, sam: Option<S>, config: Config) -> Self {
        Self {
            card,
            reader,
            sam,
            config,
            queue: VecDeque::new(),
            write_access_level: None,
            session_open: false,
            modifications_buffer_remaining: 0,
            sv_last_command_ref: None,
            sv_operation_pending: false,
            sv_used_this_session: false,
            channel_control_override: None,
            audit: TransactionAuditData::default(),
        }
    }

    pub fn card(&self) -> &CalypsoCard {
        &self.card
    }

    pub fn into_card(self) -> CalypsoCard {
        self.card
    }

    fn card_class(&self) -> CalypsoCardClass {
        if self.card.product.product_type.is_rev2_or_older() {
            CalypsoCardClass::Legacy
        } else {
            CalypsoCardClass::Iso
        }
    }

    // ---- Queueing (host-visible prepare* surface) -------------------------

    pub fn prepare_select_file(&mut self, lid: u16) -> &mut Self {
        self.queue.push_back(PreparedCommand::SelectFileByLid(lid));
        self
    }

    pub fn prepare_select_file_control(&mut self, control: SelectFileControl) -> &mut Self {
        self.queue.push_back(PreparedCommand::SelectFileControl(control));
        self
    }

    pub fn prepare_read_record(&mut self, sfi: u8, record_number: u8) -> &mut Self {
        self.queue.push_back(PreparedCommand::ReadOneRecord { sfi, record_number });
        self
    }

    pub fn prepare_read_records(&mut self, sfi: u8, from_record_number: u8) -> &mut Self {
        self.queue.push_back(PreparedCommand::ReadRecordsMultiple {
            sfi,
            record_number: from_record_number,
        });
        self
    }

    pub fn prepare_read_record_partially(&mut self, sfi: u8, record_number: u8, offset: u8, length: u8) -> &mut Self {
        self.queue.push_back(PreparedCommand::ReadRecordPartially {
            sfi,
            record_number,
            offset,
            length,
        });
        self
    }

    pub fn prepare_read_binary(&mut self, sfi: u8, offset: u16, length: u8) -> &mut Self {
        self.queue.push_back(PreparedCommand::ReadBinary { sfi, offset, length });
        self
    }

    pub fn prepare_read_counter(&mut self, sfi: u8, counter_number: u8) -> &mut Self {
        self.queue.push_back(PreparedCommand::ReadCounter { sfi, counter_number });
        self
    }

    pub fn prepare_search_records(&mut self, params: search_record_multiple::SearchRecordMultipleParams) -> &mut Self {
        self.queue.push_back(PreparedCommand::SearchRecords(params));
        self
    }

    pub fn prepare_append_record(&mut self, sfi: u8, data: Vec<u8>) -> &mut Self {
        self.queue.push_back(PreparedCommand::AppendRecord { sfi, data });
        self
    }

    pub fn prepare_update_record(&mut self, sfi: u8, record_number: u8, data: Vec<u8>) -> &mut Self {
        self.queue.push_back(PreparedCommand::UpdateRecord { sfi, record_number, data });
        self
    }

    pub fn prepare_write_record(&mut self, sfi: u8, record_number: u8, data: Vec<u8>) -> &mut Self {
        self.queue.push_back(PreparedCommand::WriteRecord { sfi, record_number, data });
        self
    }

    pub fn prepare_update_binary(&mut self, sfi: u8, offset: u16, data: Vec<u8>) -> &mut Self {
        self.queue.push_back(PreparedCommand::UpdateBinary { sfi, offset, data });
        self
    }

    pub fn prepare_write_binary(&mut self, sfi: u8, offset: u16, data: Vec<u8>) -> &mut Self {
        self.queue.push_back(PreparedCommand::WriteBinary { sfi, offset, data });
        self
    }

    pub fn prepare_increase_counter(&mut self, sfi: u8, counter_number: u8, amount: u32) -> &mut Self {
        self.queue.push_back(PreparedCommand::IncreaseCounter { sfi, counter_number, amount });
        self
    }

    pub fn prepare_decrease_counter(&mut self, sfi: u8, counter_number: u8, amount: u32) -> &mut Self {
        self.queue.push_back(PreparedCommand::DecreaseCounter { sfi, counter_number, amount });
        self
    }

    pub fn prepare_increase_counters(&mut self, sfi: u8, counters: Vec<(u8, u32)>) -> &mut Self {
        self.queue.push_back(PreparedCommand::IncreaseCounters { sfi, counters });
        self
    }

    pub fn prepare_decrease_counters(&mut self, sfi: u8, counters: Vec<(u8, u32)>) -> &mut Self {
        self.queue.push_back(PreparedCommand::DecreaseCounters { sfi, counters });
        self
    }

    /// Translated at prepare-time into an increase or decrease against the
    /// counter's *currently known* image value, per CL-CSS §4.D.
    pub fn prepare_set_counter(&mut self, sfi: u8, counter_number: u8, new_value: u32) -> Result<&mut Self> {
        let current = self.card.get_counter_value(sfi, counter_number).ok_or_else(|| {
            TransactionManagerError::new(
                TransactionManagerErrorKind::IllegalState(format!(
                    "counter {counter_number} of SFI {sfi:02X} has no known current value"
                )),
                self.audit.clone(),
            )
        })?;
        if new_value >= current {
            self.prepare_increase_counter(sfi, counter_number, new_value - current);
        } else {
            self.prepare_decrease_counter(sfi, counter_number, current - new_value);
        }
        Ok(self)
    }

    pub fn prepare_check_pin_status(&mut self) -> &mut Self {
        self.queue.push_back(PreparedCommand::CheckPinStatus);
        self
    }

    pub fn prepare_sv_get(&mut self, operation: sv::SvOperation) -> &mut Self {
        self.queue.push_back(PreparedCommand::SvGet(operation));
        self
    }

    /// CL-SV-1PCSS/CL-SV-GET-NUMBER: at most one SV modifying command per
    /// session, and it must be the first command in its batch, immediately
    /// preceded by a matching SV_GET.
    fn prepare_sv_modifying(&mut self, operation: sv::SvOperation, template: sv::SvCommandTemplate) -> Result<&mut Self> {
        if self.sv_used_this_session {
            return Err(self.illegal_state("only one SV modifying command is allowed per secure session (CL-SV-1PCSS)"));
        }
        if !self.queue.is_empty() {
            return Err(self.illegal_state("an SV modifying command must be the first command in its batch"));
        }
        if self.sv_last_command_ref != Some(operation) {
            return Err(self.illegal_state("an SV modifying command must immediately follow a matching SV_GET"));
        }
        self.sv_used_this_session = true;
        self.sv_operation_pending = true;
        self.queue.push_back(PreparedCommand::SvModifying { template, finalized: None });
        Ok(self)
    }

    pub fn prepare_sv_reload(&mut self, amount: i32, date: [u8; 2], time: [u8; 2], kvc: u8) -> Result<&mut Self> {
        let template = sv::SvCommandTemplate::new(Instruction::SvReload, amount, date, time, kvc, self.card.product.extended_mode_supported)
            .map_err(|source| self.unexpected_status(source))?;
        self.prepare_sv_modifying(sv::SvOperation::Reload, template)
    }

    pub fn prepare_sv_debit(&mut self, amount: i32, date: [u8; 2], time: [u8; 2], kvc: u8) -> Result<&mut Self> {
        let template = sv::SvCommandTemplate::new(Instruction::SvDebit, amount, date, time, kvc, self.card.product.extended_mode_supported)
            .map_err(|source| self.unexpected_status(source))?;
        self.prepare_sv_modifying(sv::SvOperation::DebitOrUndebit, template)
    }

    pub fn prepare_sv_undebit(&mut self, amount: i32, date: [u8; 2], time: [u8; 2], kvc: u8) -> Result<&mut Self> {
        let template = sv::SvCommandTemplate::new(Instruction::SvUndebit, amount, date, time, kvc, self.card.product.extended_mode_supported)
            .map_err(|source| self.unexpected_status(source))?;
        self.prepare_sv_modifying(sv::SvOperation::DebitOrUndebit, template)
    }

    /// Reads both stored-value log files: the one-record reload log and the
    /// three-record debit/undebit log.
    pub fn prepare_sv_read_all_logs(&mut self) -> &mut Self {
        self.queue
            .push_back(PreparedCommand::ReadRecordsMultiple { sfi: SV_RELOAD_LOG_FILE_SFI, record_number: 1 });
        self.queue
            .push_back(PreparedCommand::ReadRecordsMultiple { sfi: SV_DEBIT_LOG_FILE_SFI, record_number: 1 });
        self
    }

    pub fn prepare_invalidate(&mut self) -> &mut Self {
        self.queue.push_back(PreparedCommand::Invalidate);
        self
    }

    pub fn prepare_rehabilitate(&mut self) -> &mut Self {
        self.queue.push_back(PreparedCommand::Rehabilitate);
        self
    }

    pub fn prepare_get_data(&mut self, tag: get_data::GetDataTag) -> &mut Self {
        self.queue.push_back(PreparedCommand::GetData(tag));
        self
    }

    pub fn prepare_release_card_channel(&mut self) -> &mut Self {
        self.queue.push_back(PreparedCommand::ReleaseCardChannel);
        self.channel_control_override = Some(ChannelControl::CloseAfter);
        self
    }

    // ---- Error helpers ------------------------------------------------

    fn illegal_state(&self, message: impl Into<String>) -> TransactionManagerError {
        TransactionManagerError::new(TransactionManagerErrorKind::IllegalState(message.into()), self.audit.clone())
    }

    fn unexpected_status(&self, source: CalypsoCardError) -> TransactionManagerError {
        TransactionManagerError::new(TransactionManagerErrorKind::UnexpectedCommandStatus(source), self.audit.clone())
    }

    // ---- Transmission ---------------------------------------------------

    fn channel_control(&mut self) -> ChannelControl {
        self.channel_control_override.take().unwrap_or(self.config.default_channel_control)
    }

    /// Transmits `requests` as one batch, recording every exchange in the
    /// audit trail regardless of outcome (§7 propagation policy).
    fn transmit(&mut self, requests: Vec<ApduRequest>, channel_control: ChannelControl) -> Result<CardResponse> {
        let request_bytes: Vec<Vec<u8>> = requests.iter().map(|r| r.to_bytes()).collect();
        let card_request = CardRequest {
            apdu_requests: requests,
            stop_on_unsuccessful_status: self.session_open,
        };
        match self.reader.transmit(card_request, channel_control) {
            Ok(response) => {
                for (req, resp) in request_bytes.iter().zip(response.apdu_responses.iter()) {
                    self.audit.record(req, resp.apdu());
                }
                Ok(response)
            }
            Err(ReaderError::UnexpectedStatus { partial_response }) => {
                for (req, resp) in request_bytes.iter().zip(partial_response.apdu_responses.iter()) {
                    self.audit.record(req, resp.apdu());
                }
                Err(TransactionManagerError::new(
                    TransactionManagerErrorKind::Reader(ReaderError::UnexpectedStatus { partial_response }),
                    self.audit.clone(),
                ))
            }
            Err(other) => Err(TransactionManagerError::new(TransactionManagerErrorKind::Reader(other), self.audit.clone())),
        }
    }

    // ---- processOpening ---------------------------------------------------

    pub fn process_opening(&mut self, access_level: WriteAccessLevel) -> Result<()> {
        if self.session_open {
            return Err(self.illegal_state("a secure session is already open"));
        }
        self.card.backup();
        self.write_access_level = Some(access_level);
        self.modifications_buffer_remaining = self.buffer_capacity();

        // CL-CSS-OSSS / scenario S2: inline a leading ONE_RECORD READ_RECORDS
        // into OPEN_SESSION and drop it from the queue.
        let sfi_record = match self.queue.front() {
            Some(PreparedCommand::ReadOneRecord { sfi, record_number }) => {
                let pair = (*sfi, *record_number);
                self.queue.pop_front();
                Some(pair)
            }
            _ => None,
        };

        let result = self.process_opening_inner(access_level, sfi_record);
        if result.is_err() {
            self.abort_secure_session_silently();
        }
        result
    }

    fn process_opening_inner(&mut self, access_level: WriteAccessLevel, sfi_record: Option<(u8, u8)>) -> Result<()> {
        let sam = self.sam.as_mut().ok_or_else(|| {
            TransactionManagerError::new(
                TransactionManagerErrorKind::IllegalState("non-secure mode: no SAM manager configured".into()),
                self.audit.clone(),
            )
        })?;
        sam.prepare_get_challenge().map_err(|e| TransactionManagerError::new(e.into(), self.audit.clone()))?;
        sam.process_commands().map_err(|e| TransactionManagerError::new(e.into(), self.audit.clone()))?;
        let challenge = sam.challenge().ok_or_else(|| {
            TransactionManagerError::new(TransactionManagerErrorKind::IllegalState("SAM returned no challenge".into()), self.audit.clone())
        })?;

        let key_index = access_level as u8;
        let open_request = open_session::build_open_session(
            self.card_class(),
            self.card.product.product_type,
            key_index,
            sfi_record,
            self.card.product.extended_mode_supported,
        );

        let mut batch = vec![open_request];
        let sent = self.drain_queue_into_batch(&mut batch)?;

        let channel_control = self.channel_control();
        let response = self.transmit(batch, channel_control)?;

        if response.apdu_responses.len() != sent.len() + 1 {
            return Err(TransactionManagerError::new(
                TransactionManagerErrorKind::InconsistentData { requests: sent.len() + 1, responses: response.apdu_responses.len() },
                self.audit.clone(),
            ));
        }
        let open_response = response.apdu_responses.first().ok_or_else(|| {
            TransactionManagerError::new(
                TransactionManagerErrorKind::InconsistentData { requests: 1, responses: 0 },
                self.audit.clone(),
            )
        })?;
        let parsed = open_session::parse_open_session(open_response, self.card.product.product_type, sfi_record.is_some())
            .map_err(|source| self.unexpected_status(source))?;

        self.card.card_challenge = parsed.challenge.clone();
        self.card.transaction_counter = parsed.transaction_counter;
        self.card.is_df_ratified = parsed.previous_session_ratified;
        if let (Some((sfi, rec)), Some(record)) = (sfi_record, parsed.record.clone()) {
            self.card.set_content(sfi, rec, &record);
        }

        // Any commands piggy-backed onto OPEN_SESSION beyond the inlined
        // leading record read still need their responses folded in.
        if !sent.is_empty() {
            self.absorb_responses(&sent, &response.apdu_responses[1..])?;
        }

        let directory_header = self.card.directory_header.clone();
        let card_kif = parsed.kif.or_else(|| directory_header.as_ref().and_then(|h| h.kif.get(&access_level).copied())).unwrap_or(0);
        let card_kvc = parsed.kvc.or_else(|| directory_header.as_ref().and_then(|h| h.kvc.get(&access_level).copied())).unwrap_or(0);

        let sam = self.sam.as_mut().expect("checked above");
        let effective_kif = sam.compute_kif(access_level, card_kif, card_kvc);
        let effective_kvc = sam.compute_kvc(access_level, card_kvc);
        if !sam.is_session_key_authorized(effective_kif, effective_kvc) {
            return Err(TransactionManagerError::new(TransactionManagerErrorKind::UnauthorizedKey, self.audit.clone()));
        }

        sam.initialize_session(open_response.data_out(), effective_kif, effective_kvc, false, false)
            .map_err(|e| TransactionManagerError::new(e.into(), self.audit.clone()))?;

        // Feed every exchange after OPEN_SESSION into the digest.
        if response.apdu_responses.len() > 1 {
            let requests: Vec<Vec<u8>> = self.audit.requests[self.audit.requests.len() - (response.apdu_responses.len() - 1)..].to_vec();
            let responses: Vec<Vec<u8>> = self.audit.responses[self.audit.responses.len() - (response.apdu_responses.len() - 1)..].to_vec();
            sam.update_session(&requests, &responses, 0)
                .map_err(|e| TransactionManagerError::new(e.into(), self.audit.clone()))?;
        }

        self.session_open = true;
        debug!("session opened at access level {access_level:?}");
        Ok(())
    }

    fn buffer_capacity(&self) -> i64 {
        self.card.product.modifications_buffer_capacity as i64
    }

    /// Builds the pending queue into `batch`, splitting (closing and
    /// reopening) when the modifications-buffer budget would overflow and
    /// multi-session mode is enabled. Consumes the queue. Returns the
    /// finalized commands that actually produced an entry in `batch`, in the
    /// same order -- callers must line these up with `batch`'s responses
    /// rather than re-deriving the sent set from the original queue, since
    /// wire-less commands (`ReleaseCardChannel`) and a mid-batch split both
    /// leave `batch` shorter than the queue captured before draining.
    fn drain_queue_into_batch(&mut self, batch: &mut Vec<ApduRequest>) -> Result<Vec<PreparedCommand>> {
        let mut sent = Vec::new();
        while let Some(command) = self.queue.pop_front() {
            let command = self.finalize_if_sv(command)?;
            let class = self.card_class();
            let Some(apdu) = command.to_apdu_request(class) else {
                continue; // ReleaseCardChannel carries no wire request
            };

            if command.uses_session_buffer() {
                let cost = command.cost(&apdu, self.card.product.modification_counter_scheme);
                if self.modifications_buffer_remaining - cost < 0 {
                    if !self.config.multiple_session_mode {
                        return Err(TransactionManagerError::new(TransactionManagerErrorKind::SessionBufferOverflow, self.audit.clone()));
                    }
                    // Split: close with what's queued so far, reopen, continue.
                    self.queue.push_front(command);
                    return Ok(sent);
                }
                self.modifications_buffer_remaining -= cost;
            }
            batch.push(apdu);
            sent.push(command);
        }
        Ok(sent)
    }

    /// Closes the current session to make room under the modifications
    /// buffer, then reopens a fresh one, continuing the same overarching
    /// multi-session transaction. The commands left over from the failed
    /// drain must NOT ride along in the close batch -- closing always sends
    /// whatever is in `self.queue`, so it's emptied first and restored only
    /// once [`Self::process_opening`] is ready to drain it again (with the
    /// budget back at full capacity, and still eligible for the leading
    /// ONE_RECORD-read inlining).
    fn split_close_and_reopen(&mut self) -> Result<()> {
        let level = self.write_access_level.expect("session open implies a write access level");
        let leftover = std::mem::take(&mut self.queue);
        self.process_closing_inner(true)?;
        self.queue = leftover;
        self.process_opening(level)
    }

    fn finalize_if_sv(&mut self, command: PreparedCommand) -> Result<PreparedCommand> {
        if let PreparedCommand::SvModifying { template, finalized: None } = &command {
            let sam = self.sam.as_mut().ok_or_else(|| {
                TransactionManagerError::new(TransactionManagerErrorKind::IllegalState("SV finalize needs a SAM manager".into()), self.audit.clone())
            })?;
            match template.ins {
                Instruction::SvReload => sam
                    .prepare_sv_prepare_load(&self.card.sv.sv_get_header, &self.card.sv.last_sv_get_response)
                    .map_err(|e| TransactionManagerError::new(e.into(), self.audit.clone()))?,
                _ => sam
                    .prepare_sv_prepare_debit_or_undebit(&self.card.sv.sv_get_header, &self.card.sv.last_sv_get_response)
                    .map_err(|e| TransactionManagerError::new(e.into(), self.audit.clone()))?,
            }
            sam.process_commands().map_err(|e| TransactionManagerError::new(e.into(), self.audit.clone()))?;
            let complementary = sam.sv_complementary_data().ok_or_else(|| {
                TransactionManagerError::new(TransactionManagerErrorKind::IllegalState("SAM returned no SV complementary data".into()), self.audit.clone())
            })?;
            let finalized = template
                .finalize(self.card_class(), complementary.sam_id, complementary.signature_hi)
                .map_err(|source| self.unexpected_status(source))?;
            return Ok(PreparedCommand::SvModifying { template: template.clone(), finalized: Some(finalized) });
        }
        Ok(command)
    }

    // ---- processCommands ---------------------------------------------------

    pub fn process_commands(&mut self) -> Result<()> {
        let result = self.process_commands_inner();
        if result.is_err() && self.session_open {
            self.abort_secure_session_silently();
        }
        result
    }

    fn process_commands_inner(&mut self) -> Result<()> {
        if self.queue.is_empty() {
            return Ok(());
        }
        let mut batch = Vec::new();
        let sent = self.drain_queue_into_batch(&mut batch)?;
        if batch.is_empty() {
            if self.queue.is_empty() {
                return Ok(());
            }
            // The very first queued command already overflows the remaining
            // budget (multi-session mode, or this call runs right after a
            // split left nothing transmittable): close and reopen to reset
            // the budget, then retry, rather than silently leaving the
            // queue stuck.
            if !self.session_open {
                return Err(self.illegal_state("no secure session is open for the modifications buffer split"));
            }
            self.split_close_and_reopen()?;
            return self.process_commands_inner();
        }

        let channel_control = self.channel_control();
        let responses_before = self.audit.responses.len();
        let response = self.transmit(batch, channel_control)?;

        if self.session_open {
            if let Some(sam) = self.sam.as_mut() {
                let requests = self.audit.requests[responses_before..].to_vec();
                let responses = self.audit.responses[responses_before..].to_vec();
                sam.update_session(&requests, &responses, 0).map_err(|e| TransactionManagerError::new(e.into(), self.audit.clone()))?;
            }
        }

        self.absorb_responses(&sent, &response.apdu_responses)?;

        // A split occurred if commands remain: close and reopen transparently.
        if !self.queue.is_empty() && self.session_open {
            self.split_close_and_reopen()?;
            return self.process_commands_inner();
        }
        Ok(())
    }

    /// Parses each response in order and applies its effect to the card
    /// image, matching `remembered` (the commands as queued, before any
    /// finalize rewriting) one-for-one.
    fn absorb_responses(&mut self, remembered: &[PreparedCommand], responses: &[ApduResponse]) -> Result<()> {
        if remembered.len() != responses.len() {
            return Err(TransactionManagerError::new(
                TransactionManagerErrorKind::InconsistentData { requests: remembered.len(), responses: responses.len() },
                self.audit.clone(),
            ));
        }
        for (command, response) in remembered.iter().zip(responses.iter()) {
            self.absorb_one(command, response)?;
        }
        Ok(())
    }

    fn absorb_one(&mut self, command: &PreparedCommand, response: &ApduResponse) -> Result<()> {
        let best_effort = !self.session_open;
        let swallow = |sw: u16| {
            best_effort
                && matches!(
                    command,
                    PreparedCommand::ReadOneRecord { .. }
                        | PreparedCommand::ReadRecordsMultiple { .. }
                        | PreparedCommand::SearchRecords(_)
                        | PreparedCommand::ReadRecordPartially { .. }
                        | PreparedCommand::ReadBinary { .. }
                )
                && matches!(sw, 0x6A82 | 0x6A83)
        };

        macro_rules! try_or_swallow {
            ($expr:expr) => {
                match $expr {
                    Ok(v) => v,
                    Err(source) => {
                        let sw = response.status_word();
                        if swallow(sw) {
                            trace!("swallowed best-effort failure sw={sw:04X}");
                            return Ok(());
                        }
                        return Err(self.unexpected_status(source));
                    }
                }
            };
        }

        match command {
            PreparedCommand::SelectFileByLid(_) | PreparedCommand::SelectFileControl(_) => {
                let info = try_or_swallow!(select_file::parse_select_file(response, self.card.product.product_type));
                use calypso_apdu::card_model::FileType;
                match info.file_type {
                    FileType::Mf | FileType::Df => self.card.put_directory_header(DirectoryHeader::from_proprietary_information(&info)),
                    FileType::Ef => self.card.put_file_header(info.sfi, FileHeader::from_proprietary_information(&info)),
                }
            }
            PreparedCommand::ReadOneRecord { sfi, record_number } => {
                let result = try_or_swallow!(read_records::parse_read_one_record(response, *record_number));
                for (rec_no, bytes) in result.records {
                    self.card.set_content(*sfi, rec_no, &bytes);
                }
            }
            PreparedCommand::ReadRecordsMultiple { sfi, .. } => {
                let result = try_or_swallow!(read_records::parse_read_records_multiple(response));
                for (rec_no, bytes) in result.records {
                    self.card.set_content(*sfi, rec_no, &bytes);
                }
            }
            PreparedCommand::ReadRecordPartially { sfi, record_number, length, .. } => {
                let result = try_or_swallow!(read_record_multiple::parse_read_record_multiple(response, *record_number, *length as usize));
                for (i, slice) in result.slices.iter().enumerate() {
                    self.card.set_content(*sfi, record_number + i as u8, slice);
                }
            }
            PreparedCommand::ReadBinary { sfi, offset, length } => {
                let bytes = try_or_swallow!(read_binary::parse_read_binary(response, *length as usize));
                self.card.set_content_at_offset(*sfi, 1, &bytes, *offset as usize);
            }
            PreparedCommand::ReadCounter { sfi, .. } => {
                let result = try_or_swallow!(read_records::parse_read_one_record(response, 1));
                for (rec_no, bytes) in result.records {
                    self.card.set_content(*sfi, rec_no, &bytes);
                }
            }
            PreparedCommand::SearchRecords(params) => {
                let _ = try_or_swallow!(search_record_multiple::parse_search_record_multiple(response, params.fetch_first_match));
            }
            PreparedCommand::AppendRecord { sfi, data } => {
                calypso_apdu::status::check_status(Instruction::AppendRecord.name(), append_record::status_table(), response, None)
                    .map_err(|source| self.unexpected_status(source))?;
                self.card.add_cyclic_content(*sfi, data);
            }
            PreparedCommand::UpdateRecord { sfi, record_number, data } => {
                calypso_apdu::status::check_status(Instruction::UpdateRecord.name(), write::record_status_table(), response, None)
                    .map_err(|source| self.unexpected_status(source))?;
                self.card.set_content(*sfi, *record_number, data);
            }
            PreparedCommand::WriteRecord { sfi, record_number, data } => {
                calypso_apdu::status::check_status(Instruction::WriteRecord.name(), write::record_status_table(), response, None)
                    .map_err(|source| self.unexpected_status(source))?;
                self.card.fill_content(*sfi, *record_number, data, 0);
            }
            PreparedCommand::UpdateBinary { sfi, offset, data } => {
                calypso_apdu::status::check_status(Instruction::UpdateBinary.name(), write::binary_status_table(), response, None)
                    .map_err(|source| self.unexpected_status(source))?;
                self.card.set_content_at_offset(*sfi, 1, data, *offset as usize);
            }
            PreparedCommand::WriteBinary { sfi, offset, data } => {
                calypso_apdu::status::check_status(Instruction::WriteBinary.name(), write::binary_status_table(), response, None)
                    .map_err(|source| self.unexpected_status(source))?;
                self.card.fill_content(*sfi, 1, data, *offset as usize);
            }
            PreparedCommand::IncreaseCounter { sfi, counter_number, amount } => {
                if let Some(value) = counters::parse_single(response, Instruction::Increase).map_err(|source| self.unexpected_status(source))? {
                    self.card.set_counter(*sfi, *counter_number, value);
                } else {
                    let current = self.card.get_counter_value(*sfi, *counter_number).unwrap_or(0);
                    self.card.set_counter(*sfi, *counter_number, current + amount);
                }
            }
            PreparedCommand::DecreaseCounter { sfi, counter_number, amount } => {
                if let Some(value) = counters::parse_single(response, Instruction::Decrease).map_err(|source| self.unexpected_status(source))? {
                    self.card.set_counter(*sfi, *counter_number, value);
                } else {
                    let current = self.card.get_counter_value(*sfi, *counter_number).unwrap_or(0);
                    self.card.set_counter(*sfi, *counter_number, current.saturating_sub(*amount));
                }
            }
            PreparedCommand::IncreaseCounters { sfi, .. } => {
                let results = counters::parse_multiple(response, Instruction::IncreaseMultiple).map_err(|source| self.unexpected_status(source))?;
                for (counter_number, value) in results {
                    self.card.set_counter(*sfi, counter_number, value);
                }
            }
            PreparedCommand::DecreaseCounters { sfi, .. } => {
                let results = counters::parse_multiple(response, Instruction::DecreaseMultiple).map_err(|source| self.unexpected_status(source))?;
                for (counter_number, value) in results {
                    self.card.set_counter(*sfi, counter_number, value);
                }
            }
            PreparedCommand::CheckPinStatus => {
                let outcome = pin_and_key::parse_verify_pin(response, true).map_err(|source| self.unexpected_status(source))?;
                self.card.pin_attempts_remaining = Some(match outcome {
                    pin_and_key::VerifyPinOutcome::Accepted => 3,
                    pin_and_key::VerifyPinOutcome::Rejected { attempts_remaining } => attempts_remaining,
                    pin_and_key::VerifyPinOutcome::Blocked => 0,
                });
            }
            PreparedCommand::SvGet(operation) => {
                let parsed = sv::parse_sv_get(response, *operation, self.card.product.extended_mode_supported)
                    .map_err(|source| self.unexpected_status(source))?;
                self.card.sv.kvc = Some(parsed.kvc);
                self.card.sv.sv_get_header = response.apdu()[..4].to_vec();
                self.card.sv.last_sv_get_response = response.data_out().to_vec();
                self.card.sv.balance = Some(parsed.balance);
                self.card.sv.last_transaction_number = Some(parsed.transaction_number);
                if let Some(load_log) = parsed.load_log {
                    self.card.sv.load_log = Some(load_log);
                }
                if let Some(debit_log) = parsed.debit_log {
                    self.card.sv.debit_log = Some(debit_log);
                }
                self.sv_last_command_ref = Some(*operation);
            }
            PreparedCommand::SvModifying { template, .. } => {
                let signature = sv::parse_sv_modifying(response, template.ins).map_err(|source| self.unexpected_status(source))?;
                if let Some(signature) = signature {
                    self.card.sv.last_signature = Some(signature);
                }
                // Balance is only committed on a successful close + SAM check
                // (scenario S4); see `process_closing_inner`.
            }
            PreparedCommand::Invalidate => {
                calypso_apdu::status::check_status(Instruction::Invalidate.name(), df_status::status_table(), response, None)
                    .map_err(|source| self.unexpected_status(source))?;
            }
            PreparedCommand::Rehabilitate => {
                calypso_apdu::status::check_status(Instruction::Rehabilitate.name(), df_status::status_table(), response, None)
                    .map_err(|source| self.unexpected_status(source))?;
            }
            PreparedCommand::GetData(tag) => match tag {
                get_data::GetDataTag::Fci => {
                    let _ = get_data::parse_fci(response).map_err(|source| self.unexpected_status(source))?;
                }
                get_data::GetDataTag::Fcp => {
                    let info = get_data::parse_fcp(response, self.card.product.product_type).map_err(|source| self.unexpected_status(source))?;
                    use calypso_apdu::card_model::FileType;
                    match info.file_type {
                        FileType::Mf | FileType::Df => self.card.put_directory_header(DirectoryHeader::from_proprietary_information(&info)),
                        FileType::Ef => self.card.put_file_header(info.sfi, FileHeader::from_proprietary_information(&info)),
                    }
                }
                get_data::GetDataTag::EfList => {
                    let entries = get_data::parse_ef_list(response).map_err(|source| self.unexpected_status(source))?;
                    for entry in entries {
                        trace!("EF list entry sfi={:02X} lid={:04X}", entry.sfi, entry.lid);
                    }
                }
                get_data::GetDataTag::TraceabilityInformation => {
                    let bytes = get_data::parse_traceability_information(response).map_err(|source| self.unexpected_status(source))?;
                    self.card.traceability_information = Some(bytes);
                }
            },
            PreparedCommand::ReleaseCardChannel => {}
        }
        Ok(())
    }

    // ---- processClosing -----------------------------------------------

    pub fn process_closing(&mut self) -> Result<()> {
        let result = self.process_closing_inner(false);
        if result.is_err() {
            self.abort_secure_session_silently();
        }
        result
    }

    fn process_closing_inner(&mut self, splitting: bool) -> Result<()> {
        if !self.session_open {
            return Err(self.illegal_state("no secure session is open"));
        }

        let remembered: Vec<PreparedCommand> = self.queue.iter().cloned().collect();
        let mut finalized = Vec::with_capacity(remembered.len());
        for command in &remembered {
            finalized.push(self.finalize_if_sv(command.clone())?);
        }

        let mut anticipated_requests = Vec::new();
        let mut anticipated_responses = Vec::new();
        let mut batch: Vec<ApduRequest> = Vec::with_capacity(finalized.len() + 2);
        let mut sent: Vec<PreparedCommand> = Vec::with_capacity(finalized.len());
        for (original, command) in remembered.iter().zip(finalized.iter()) {
            let class = self.card_class();
            if let Some(apdu) = command.to_apdu_request(class) {
                let anticipated = self.anticipated_response(original)?;
                anticipated_requests.push(apdu.to_bytes());
                anticipated_responses.push(anticipated);
                batch.push(apdu);
                sent.push(command.clone());
            }
        }

        let sam = self.sam.as_mut().ok_or_else(|| {
            TransactionManagerError::new(TransactionManagerErrorKind::IllegalState("no SAM manager configured".into()), self.audit.clone())
        })?;
        if !anticipated_requests.is_empty() {
            sam.update_session(&anticipated_requests, &anticipated_responses, 0)
                .map_err(|e| TransactionManagerError::new(e.into(), self.audit.clone()))?;
        }
        sam.prepare_session_closing().map_err(|e| TransactionManagerError::new(e.into(), self.audit.clone()))?;
        sam.process_commands().map_err(|e| TransactionManagerError::new(e.into(), self.audit.clone()))?;
        let terminal_signature = sam.terminal_signature().ok_or_else(|| {
            TransactionManagerError::new(TransactionManagerErrorKind::IllegalState("SAM produced no terminal signature".into()), self.audit.clone())
        })?;

        let ratification_requested = self.config.ratification_mechanism_enabled && !self.reader.is_contactless();
        let close_request = close_session::build_close_session(self.card_class(), ratification_requested, &terminal_signature);

        batch.push(close_request);

        let needs_ratification_apdu = self.config.ratification_mechanism_enabled && self.reader.is_contactless();
        if needs_ratification_apdu {
            batch.push(ApduRequest::new(self.card_class().value(), 0x1E, 0x00, 0x00, "RATIFICATION"));
        }

        let channel_control = self.channel_control();
        let transmit_result = self.transmit(batch, channel_control);

        let response = match transmit_result {
            Ok(r) => r,
            Err(e) if needs_ratification_apdu => {
                // §7: an IO error on the trailing ratification APDU is
                // swallowed -- the session is known closed card-side.
                warn!("IO error after ratification APDU, treating session as closed: {e}");
                CardResponse { apdu_responses: Vec::new() }
            }
            Err(e) => return Err(e),
        };

        let mut responses = response.apdu_responses;
        if needs_ratification_apdu && responses.len() == sent.len() + 2 {
            responses.pop(); // drop the ratification response
        }

        if responses.len() != sent.len() + 1 {
            return Err(TransactionManagerError::new(
                TransactionManagerErrorKind::InconsistentData { requests: sent.len() + 1, responses: responses.len() },
                self.audit.clone(),
            ));
        }

        let close_response = responses.last().expect("checked length above");
        self.absorb_responses(&sent, &responses[..sent.len()])?;

        let parsed_close = close_session::parse_close_session(close_response, self.card.product.extended_mode_supported).map_err(|source| {
            TransactionManagerError::new(
                TransactionManagerErrorKind::UnexpectedCommandStatus(source),
                self.audit.clone(),
            )
        })?;

        let sam = self.sam.as_mut().expect("checked above");
        sam.prepare_digest_authenticate(&parsed_close.signature_lo)
            .map_err(|e| TransactionManagerError::new(e.into(), self.audit.clone()))?;
        sam.process_commands().map_err(|e| TransactionManagerError::new(e.into(), self.audit.clone()))?;
        if sam.digest_authenticated() != Some(true) {
            return Err(TransactionManagerError::new(
                TransactionManagerErrorKind::CardSignatureNotVerifiable("card signature Lo did not match the SAM digest".into()),
                self.audit.clone(),
            ));
        }

        if self.sv_operation_pending {
            let sv_operation_data = parsed_close.postponed_data.first().cloned().unwrap_or_default();
            sam.prepare_sv_check(&sv_operation_data).map_err(|e| TransactionManagerError::new(e.into(), self.audit.clone()))?;
            sam.process_commands().map_err(|e| TransactionManagerError::new(e.into(), self.audit.clone()))?;
            if sam.sv_checked() != Some(true) {
                return Err(TransactionManagerError::new(
                    TransactionManagerErrorKind::CardSignatureNotVerifiable("SV postponed signature did not verify".into()),
                    self.audit.clone(),
                ));
            }
            self.sv_operation_pending = false;
        }

        self.queue.clear();
        // Even when splitting, the card-side session really is closed: the
        // next step is always a fresh OPEN_SESSION, which refuses to run
        // while `session_open` is still set. Only the SV one-per-session
        // bookkeeping survives a split, since CL-SV-1PCSS is scoped to the
        // whole multi-session transaction, not to a single open/close pair.
        self.session_open = false;
        if !splitting {
            self.write_access_level = None;
            self.sv_last_command_ref = None;
            self.sv_used_this_session = false;
        }
        debug!("session closed (ratified={ratification_requested})");
        Ok(())
    }

    fn anticipated_response(&self, command: &PreparedCommand) -> Result<Vec<u8>> {
        match command {
            PreparedCommand::IncreaseCounter { sfi, counter_number, amount } => {
                let current = self.card.get_counter_value(*sfi, *counter_number).ok_or_else(|| {
                    TransactionManagerError::new(
                        TransactionManagerErrorKind::IllegalState(format!("no known value for counter {counter_number} of SFI {sfi:02X}")),
                        self.audit.clone(),
                    )
                })?;
                let new_value = (current + amount).to_be_bytes();
                Ok(vec![new_value[1], new_value[2], new_value[3], 0x90, 0x00])
            }
            PreparedCommand::DecreaseCounter { sfi, counter_number, amount } => {
                let current = self.card.get_counter_value(*sfi, *counter_number).ok_or_else(|| {
                    TransactionManagerError::new(
                        TransactionManagerErrorKind::IllegalState(format!("no known value for counter {counter_number} of SFI {sfi:02X}")),
                        self.audit.clone(),
                    )
                })?;
                let new_value = current.saturating_sub(*amount).to_be_bytes();
                Ok(vec![new_value[1], new_value[2], new_value[3], 0x90, 0x00])
            }
            PreparedCommand::IncreaseCounters { sfi, counters } | PreparedCommand::DecreaseCounters { sfi, counters } => {
                let increasing = matches!(command, PreparedCommand::IncreaseCounters { .. });
                let mut out = Vec::with_capacity(counters.len() * 4 + 2);
                for (counter_number, amount) in counters {
                    let current = self.card.get_counter_value(*sfi, *counter_number).ok_or_else(|| {
                        TransactionManagerError::new(
                            TransactionManagerErrorKind::IllegalState(format!("no known value for counter {counter_number} of SFI {sfi:02X}")),
                            self.audit.clone(),
                        )
                    })?;
                    let new_value = if increasing { current + amount } else { current.saturating_sub(*amount) };
                    let bytes = new_value.to_be_bytes();
                    out.push(*counter_number);
                    out.extend_from_slice(&bytes[1..4]);
                }
                out.extend_from_slice(&[0x90, 0x00]);
                Ok(out)
            }
            PreparedCommand::SvModifying { .. } => Ok(vec![0x62, 0x00]),
            _ => Ok(vec![0x90, 0x00]),
        }
    }

    // ---- processCancel ------------------------------------------------

    pub fn process_cancel(&mut self) -> Result<()> {
        if !self.session_open {
            return Ok(());
        }
        let abort_request = close_session::build_close_session_abort(self.card_class());
        let channel_control = self.channel_control();
        let _ = self.transmit(vec![abort_request], channel_control);
        self.card.restore();
        self.queue.clear();
        self.session_open = false;
        self.write_access_level = None;
        self.sv_last_command_ref = None;
        self.sv_operation_pending = false;
        self.sv_used_this_session = false;
        debug!("session cancelled, card image restored");
        Ok(())
    }

    /// Best-effort cancel used when any `process*` call fails mid-session:
    /// restores the files backup and force-closes the session, then lets
    /// the original error propagate.
    fn abort_secure_session_silently(&mut self) {
        if !self.session_open {
            return;
        }
        let abort_request = close_session::build_close_session_abort(self.card_class());
        let _ = self.reader.transmit(
            CardRequest { apdu_requests: vec![abort_request], stop_on_unsuccessful_status: false },
            ChannelControl::KeepOpen,
        );
        self.card.restore();
        self.queue.clear();
        self.session_open = false;
        self.write_access_level = None;
        self.sv_last_command_ref = None;
        self.sv_operation_pending = false;
        self.sv_used_this_session = false;
        warn!("secure session aborted silently after a processing failure");
    }

    // ---- PIN / key flows ------------------------------------------------

    pub fn process_verify_pin(&mut self, pin: &[u8]) -> Result<()> {
        let result = self.process_verify_pin_inner(pin);
        if result.is_err() {
            self.abort_secure_session_silently();
        }
        result
    }

    fn process_verify_pin_inner(&mut self, pin: &[u8]) -> Result<()> {
        let class = self.card_class();
        let request = if self.config.pin_plain_transmission_allowed {
            pin_and_key::build_verify_pin_presentation(class, pin.to_vec())
        } else {
            let sam = self.sam.as_mut().ok_or_else(|| {
                TransactionManagerError::new(TransactionManagerErrorKind::IllegalState("ciphered PIN requires a SAM manager".into()), self.audit.clone())
            })?;
            let challenge_request = get_challenge::build_get_challenge(class);
            let channel_control = self.channel_control();
            let response = self.transmit(vec![challenge_request], channel_control)?;
            let challenge = get_challenge::parse_get_challenge(response.apdu_responses.first().expect("one request, one response"))
                .map_err(|source| self.unexpected_status(source))?;
            let sam = self.sam.as_mut().expect("checked above");
            sam.prepare_card_cipher_pin(&challenge, None).map_err(|e| TransactionManagerError::new(e.into(), self.audit.clone()))?;
            sam.process_commands().map_err(|e| TransactionManagerError::new(e.into(), self.audit.clone()))?;
            let ciphered = sam.ciphered_data().ok_or_else(|| {
                TransactionManagerError::new(TransactionManagerErrorKind::IllegalState("SAM returned no ciphered PIN".into()), self.audit.clone())
            })?;
            let _ = pin;
            pin_and_key::build_verify_pin_presentation(class, ciphered)
        };

        let channel_control = self.channel_control();
        let response = self.transmit(vec![request], channel_control)?;
        let outcome = pin_and_key::parse_verify_pin(response.apdu_responses.first().expect("one request, one response"), false)
            .map_err(|source| self.unexpected_status(source))?;
        self.card.pin_attempts_remaining = Some(match outcome {
            pin_and_key::VerifyPinOutcome::Accepted => 3,
            pin_and_key::VerifyPinOutcome::Rejected { attempts_remaining } => attempts_remaining,
            pin_and_key::VerifyPinOutcome::Blocked => 0,
        });
        Ok(())
    }

    pub fn process_change_pin(&mut self, new_pin: &[u8]) -> Result<()> {
        let result = self.process_change_pin_inner(new_pin);
        if result.is_err() {
            self.abort_secure_session_silently();
        }
        result
    }

    fn process_change_pin_inner(&mut self, new_pin: &[u8]) -> Result<()> {
        let class = self.card_class();
        let challenge_request = get_challenge::build_get_challenge(class);
        let channel_control = self.channel_control();
        let response = self.transmit(vec![challenge_request], channel_control)?;
        let challenge = get_challenge::parse_get_challenge(response.apdu_responses.first().expect("one request, one response"))
            .map_err(|source| self.unexpected_status(source))?;

        let sam = self.sam.as_mut().ok_or_else(|| {
            TransactionManagerError::new(TransactionManagerErrorKind::IllegalState("CHANGE_PIN requires a SAM manager".into()), self.audit.clone())
        })?;
        sam.prepare_card_cipher_pin(&challenge, Some(new_pin)).map_err(|e| TransactionManagerError::new(e.into(), self.audit.clone()))?;
        sam.process_commands().map_err(|e| TransactionManagerError::new(e.into(), self.audit.clone()))?;
        let ciphered = sam.ciphered_data().ok_or_else(|| {
            TransactionManagerError::new(TransactionManagerErrorKind::IllegalState("SAM returned no ciphered PIN block".into()), self.audit.clone())
        })?;

        let request = pin_and_key::build_change_pin(class, ciphered);
        let channel_control = self.channel_control();
        let response = self.transmit(vec![request], channel_control)?;
        pin_and_key::parse_change_pin_or_key(response.apdu_responses.first().expect("one request, one response"), "CHANGE_PIN")
            .map_err(|source| self.unexpected_status(source))?;
        Ok(())
    }

    pub fn process_change_key(&mut self, key_index: u8, new_kif: u8, new_kvc: u8, issuer_kif: u8, issuer_kvc: u8) -> Result<()> {
        let result = self.process_change_key_inner(key_index, new_kif, new_kvc, issuer_kif, issuer_kvc);
        if result.is_err() {
            self.abort_secure_session_silently();
        }
        result
    }

    fn process_change_key_inner(&mut self, key_index: u8, new_kif: u8, new_kvc: u8, issuer_kif: u8, issuer_kvc: u8) -> Result<()> {
        let sam = self.sam.as_mut().ok_or_else(|| {
            TransactionManagerError::new(TransactionManagerErrorKind::IllegalState("CHANGE_KEY requires a SAM manager".into()), self.audit.clone())
        })?;
        sam.prepare_card_generate_key(issuer_kif, issuer_kvc, new_kif, new_kvc)
            .map_err(|e| TransactionManagerError::new(e.into(), self.audit.clone()))?;
        sam.process_commands().map_err(|e| TransactionManagerError::new(e.into(), self.audit.clone()))?;
        let cryptogram = sam.ciphered_data().ok_or_else(|| {
            TransactionManagerError::new(TransactionManagerErrorKind::IllegalState("SAM returned no key cryptogram".into()), self.audit.clone())
        })?;

        let class = self.card_class();
        let request = pin_and_key::build_change_key(class, key_index, cryptogram);
        let channel_control = self.channel_control();
        let response = self.transmit(vec![request], channel_control)?;
        pin_and_key::parse_change_pin_or_key(response.apdu_responses.first().expect("one request, one response"), "CHANGE_KEY")
            .map_err(|source| self.unexpected_status(source))?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::card::product::{ModificationCounterScheme, ProductInfo};

    /// A reader collaborator that is never actually called: the unit tests
    /// in this module only exercise private helpers (`cost`,
    /// `anticipated_response`) that don't transmit. Full session lifecycles
    /// are covered by the scripted-reader integration tests under
    /// `core/tests/`.
    struct UnusedReader;

    impl CardProxyReader for UnusedReader {
        fn transmit(&mut self, _request: CardRequest, _channel_control: ChannelControl) -> std::result::Result<CardResponse, ReaderError> {
            panic!("UnusedReader::transmit should never be called by these unit tests")
        }

        fn is_contactless(&self) -> bool {
            false
        }
    }

    #[derive(Default)]
    struct UnusedSam;

    impl ControlSamTransactionManager for UnusedSam {
        fn prepare_get_challenge(&mut self) -> std::result::Result<(), crate::sam::SamError> {
            unimplemented!()
        }
        fn challenge(&self) -> Option<Vec<u8>> {
            unimplemented!()
        }
        fn initialize_session(&mut self, _: &[u8], _: u8, _: u8, _: bool, _: bool) -> std::result::Result<(), crate::sam::SamError> {
            unimplemented!()
        }
        fn update_session(&mut self, _: &[Vec<u8>], _: &[Vec<u8>], _: usize) -> std::result::Result<(), crate::sam::SamError> {
            unimplemented!()
        }
        fn prepare_session_closing(&mut self) -> std::result::Result<(), crate::sam::SamError> {
            unimplemented!()
        }
        fn terminal_signature(&self) -> Option<Vec<u8>> {
            unimplemented!()
        }
        fn prepare_digest_authenticate(&mut self, _: &[u8]) -> std::result::Result<(), crate::sam::SamError> {
            unimplemented!()
        }
        fn digest_authenticated(&self) -> Option<bool> {
            unimplemented!()
        }
        fn prepare_give_random(&mut self) -> std::result::Result<(), crate::sam::SamError> {
            unimplemented!()
        }
        fn prepare_card_cipher_pin(&mut self, _: &[u8], _: Option<&[u8]>) -> std::result::Result<(), crate::sam::SamError> {
            unimplemented!()
        }
        fn ciphered_data(&self) -> Option<Vec<u8>> {
            unimplemented!()
        }
        fn prepare_card_generate_key(&mut self, _: u8, _: u8, _: u8, _: u8) -> std::result::Result<(), crate::sam::SamError> {
            unimplemented!()
        }
        fn prepare_sv_prepare_load(&mut self, _: &[u8], _: &[u8]) -> std::result::Result<(), crate::sam::SamError> {
            unimplemented!()
        }
        fn prepare_sv_prepare_debit_or_undebit(&mut self, _: &[u8], _: &[u8]) -> std::result::Result<(), crate::sam::SamError> {
            unimplemented!()
        }
        fn sv_complementary_data(&self) -> Option<crate::sam::SvComplementaryData> {
            unimplemented!()
        }
        fn prepare_sv_check(&mut self, _: &[u8]) -> std::result::Result<(), crate::sam::SamError> {
            unimplemented!()
        }
        fn sv_checked(&self) -> Option<bool> {
            unimplemented!()
        }
        fn compute_kif(&self, _: WriteAccessLevel, _: u8, _: u8) -> u8 {
            unimplemented!()
        }
        fn compute_kvc(&self, _: WriteAccessLevel, _: u8) -> u8 {
            unimplemented!()
        }
        fn is_session_key_authorized(&self, _: u8, _: u8) -> bool {
            unimplemented!()
        }
        fn process_commands(&mut self) -> std::result::Result<(), crate::sam::SamError> {
            unimplemented!()
        }
    }

    fn rev3_card() -> CalypsoCard {
        let product = ProductInfo {
            product_type: calypso_apdu::ProductType::Rev3_2,
            modification_counter_scheme: ModificationCounterScheme::Bytes,
            modifications_buffer_capacity: 430,
            payload_capacity: 235,
            extended_mode_supported: false,
            has_sv_feature: true,
            has_pin_feature: true,
            has_pki_feature: false,
            application_subtype: 0,
            startup_info_raw: Vec::new(),
        };
        CalypsoCard::new(product, vec![0xAA], vec![0u8; 8], vec![], vec![])
    }

    fn manager(card: CalypsoCard) -> CardTransactionManager<UnusedReader, UnusedSam> {
        CardTransactionManager::new(card, UnusedReader, None, Config::default())
    }

    #[test]
    fn byte_mode_cost_is_apdu_length_plus_one() {
        let command = PreparedCommand::UpdateRecord { sfi: 1, record_number: 1, data: vec![0xAA; 10] };
        let apdu = write::build_update_record(CalypsoCardClass::Iso, 1, 1, vec![0xAA; 10]);
        assert_eq!(command.cost(&apdu, ModificationCounterScheme::Bytes), apdu.to_bytes().len() as i64 + 1);
        assert_eq!(command.cost(&apdu, ModificationCounterScheme::Operations), 1);
    }

    #[test]
    fn anticipated_response_for_increase_reflects_current_image_counter() {
        let mut card = rev3_card();
        card.set_content(1, 1, &[0x00, 0x00, 0x05]);
        let mgr = manager(card);

        let command = PreparedCommand::IncreaseCounter { sfi: 1, counter_number: 1, amount: 3 };
        let anticipated = mgr.anticipated_response(&command).unwrap();
        assert_eq!(anticipated, vec![0x00, 0x00, 0x08, 0x90, 0x00]);
    }
}

// Copyright (c) 2023-2024 Calypso Networks Association

//! The SAM collaborator interface (component E, consumed only): challenge,
//! digest session, PIN/key ciphering and stored-value certification
//! primitives. The core drives this trait's `prepare_*`/`process_commands`
//! rhythm the same way it drives its own command queue against the reader.

use calypso_apdu::card_model::WriteAccessLevel;

#[derive(Debug, thiserror::Error)]
pub enum SamError {
    #[error("SAM is not ready for this operation: {0}")]
    NotReady(String),
    #[error("SAM rejected the key as unauthorized")]
    UnauthorizedKey,
    #[error("SAM could not verify the signature: {0}")]
    SignatureNotVerifiable(String),
    #[error("SAM transport/communication failure: {0}")]
    Communication(String),
}

/// SAM-supplied completion data for a two-phase SV command: the 3-byte SAM
/// id and the signature-hi block (5 bytes non-extended, 10 extended).
#[derive(Clone, Debug)]
pub struct SvComplementaryData {
    pub sam_id: [u8; 3],
    pub signature_hi: Vec<u8>,
}

/// `ControlSamTransactionManager`: the SAM-side half of a secure session.
/// Every `prepare_*` queues a SAM-internal operation; [`Self::process_commands`]
/// flushes the queue against the physical SAM, after which the
/// corresponding accessor (`challenge`, `terminal_signature`, ...) becomes
/// available.
pub trait ControlSamTransactionManager {
    fn prepare_get_challenge(&mut self) -> Result<(), SamError>;
    fn challenge(&self) -> Option<Vec<u8>>;

    /// Seeds the digest session from the OPEN_SESSION response data plus the
    /// negotiated KIF/KVC; `is_session_aborted` primes an abort-only digest
    /// used solely to authorize `processCancel`'s empty-signature close.
    fn initialize_session(
        &mut self,
        open_session_response_data: &[u8],
        kif: u8,
        kvc: u8,
        is_confidential: bool,
        is_session_aborted: bool,
    ) -> Result<(), SamError>;

    /// Feeds `skip_first_n` fewer than `requests.len()` pairs into the
    /// running digest (the orchestrator skips the OPEN_SESSION pair, already
    /// folded in by `initialize_session`).
    fn update_session(&mut self, requests: &[Vec<u8>], responses: &[Vec<u8>], skip_first_n: usize) -> Result<(), SamError>;

    fn prepare_session_closing(&mut self) -> Result<(), SamError>;
    fn terminal_signature(&self) -> Option<Vec<u8>>;

    fn prepare_digest_authenticate(&mut self, card_signature_lo: &[u8]) -> Result<(), SamError>;
    fn digest_authenticated(&self) -> Option<bool>;

    fn prepare_give_random(&mut self) -> Result<(), SamError>;

    /// `new_pin` is `None` for a VERIFY_PIN cipher, `Some` for CHANGE_PIN.
    fn prepare_card_cipher_pin(&mut self, current_pin: &[u8], new_pin: Option<&[u8]>) -> Result<(), SamError>;
    fn ciphered_data(&self) -> Option<Vec<u8>>;

    fn prepare_card_generate_key(&mut self, issuer_kif: u8, issuer_kvc: u8, new_kif: u8, new_kvc: u8) -> Result<(), SamError>;

    fn prepare_sv_prepare_load(&mut self, sv_get_header: &[u8], sv_get_data: &[u8]) -> Result<(), SamError>;
    fn prepare_sv_prepare_debit_or_undebit(&mut self, sv_get_header: &[u8], sv_get_data: &[u8]) -> Result<(), SamError>;
    fn sv_complementary_data(&self) -> Option<SvComplementaryData>;

    fn prepare_sv_check(&mut self, sv_operation_data: &[u8]) -> Result<(), SamError>;
    fn sv_checked(&self) -> Option<bool>;

    fn compute_kif(&self, level: WriteAccessLevel, card_kif: u8, card_kvc: u8) -> u8;
    fn compute_kvc(&self, level: WriteAccessLevel, card_kvc: u8) -> u8;
    fn is_session_key_authorized(&self, kif: u8, kvc: u8) -> bool;

    /// Flushes every `prepare_*` call queued since the last flush against
    /// the physical SAM.
    fn process_commands(&mut self) -> Result<(), SamError>;
}

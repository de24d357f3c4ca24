// Copyright (c) 2023-2024 Calypso Networks Association

//! Stored-Value state mirrored onto the card image by SV_GET and finalized
//! by a successful SV_RELOAD/SV_DEBIT/SV_UNDEBIT close.

/// Snapshot of the card's stored-value subsystem, refreshed by SV_GET and
/// (for the balance) by a committed SV modifying operation.
#[derive(Clone, Debug, Default)]
pub struct SvState {
    pub kvc: Option<u8>,
    pub sv_get_header: Vec<u8>,
    pub last_sv_get_response: Vec<u8>,
    pub balance: Option<i32>,
    pub last_transaction_number: Option<u16>,
    pub load_log: Option<Vec<u8>>,
    pub debit_log: Option<Vec<u8>>,
    pub last_signature: Option<Vec<u8>>,
}

// Copyright (c) 2023-2024 Calypso Networks Association

//! Session-level error taxonomy (component H). Per-command failures live in
//! [`calypso_apdu::CalypsoCardError`]; everything the orchestrator itself
//! can raise is collected here, always carrying the accumulated transaction
//! audit trace so the caller can reconstruct what was sent and received.

use calypso_apdu::CalypsoCardError;

use crate::reader::ReaderError;
use crate::sam::SamError;

/// The ordered request/response trace accumulated across a `process*` call,
/// attached to every raised [`TransactionManagerError`] regardless of where
/// in the call it failed.
#[derive(Clone, Debug, Default)]
pub struct TransactionAuditData {
    pub requests: Vec<Vec<u8>>,
    pub responses: Vec<Vec<u8>>,
}

impl TransactionAuditData {
    pub fn record(&mut self, request: &[u8], response: &[u8]) {
        self.requests.push(request.to_vec());
        self.responses.push(response.to_vec());
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransactionManagerErrorKind {
    #[error("{requests} requests but {responses} responses")]
    InconsistentData { requests: usize, responses: usize },

    #[error("command failed during session processing: {0}")]
    UnexpectedCommandStatus(#[source] CalypsoCardError),

    #[error("card signature could not be verified: {0}")]
    CardSignatureNotVerifiable(String),

    #[error("key not authorized for this write access level")]
    UnauthorizedKey,

    #[error("modifications buffer overflow (single-session mode)")]
    SessionBufferOverflow,

    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error(transparent)]
    Reader(#[from] ReaderError),

    #[error(transparent)]
    Sam(#[from] SamError),
}

/// Raised by any `CardTransactionManager::process*` call. Always carries the
/// audit trace collected up to the point of failure.
#[derive(Debug, thiserror::Error)]
#[error("{kind}")]
pub struct TransactionManagerError {
    #[source]
    pub kind: TransactionManagerErrorKind,
    pub audit_data: TransactionAuditData,
}

impl TransactionManagerError {
    pub fn new(kind: TransactionManagerErrorKind, audit_data: TransactionAuditData) -> Self {
        Self { kind, audit_data }
    }
}

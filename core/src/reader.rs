// Copyright (c) 2023-2024 Calypso Networks Association

//! The reader collaborator interface (component external to the core):
//! `ProxyReader::transmit`. The core never touches bytes on a wire; it hands
//! a batch of [`ApduRequest`]s to whatever implements [`CardProxyReader`]
//! and gets back a batch of [`ApduResponse`]s.

use calypso_apdu::{ApduRequest, ApduResponse};

/// Whether the physical channel stays open after this batch, or is released.
/// `prepareReleaseCardChannel` selects `CloseAfter` for the next `process*`
/// call.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ChannelControl {
    KeepOpen,
    CloseAfter,
}

impl Default for ChannelControl {
    fn default() -> Self {
        ChannelControl::KeepOpen
    }
}

/// A batch of APDU requests to transmit as one exchange with the card.
#[derive(Clone, Debug, Default)]
pub struct CardRequest {
    pub apdu_requests: Vec<ApduRequest>,
    /// When set, the reader stops transmitting at the first APDU whose
    /// status word isn't in that request's successful set, and returns the
    /// partial response collected so far via [`ReaderError::UnexpectedStatus`].
    pub stop_on_unsuccessful_status: bool,
}

/// The responses collected for a [`CardRequest`], in request order.
#[derive(Clone, Debug, Default)]
pub struct CardResponse {
    pub apdu_responses: Vec<ApduResponse>,
}

/// Failures the reader collaborator can raise. `UnexpectedStatus` still
/// carries whatever partial response was collected before the failing APDU.
#[derive(Debug, thiserror::Error)]
pub enum ReaderError {
    #[error("reader is not usable: {0}")]
    ReaderBroken(String),
    #[error("card communication failed: {0}")]
    CardBroken(String),
    #[error("unexpected status word encountered mid-batch")]
    UnexpectedStatus { partial_response: CardResponse },
}

/// The external card-reader collaborator. Exactly one logical channel is
/// held open between `processOpening` and `processClosing`/`processCancel`.
pub trait CardProxyReader {
    fn transmit(&mut self, request: CardRequest, channel_control: ChannelControl) -> Result<CardResponse, ReaderError>;

    /// Whether this reader talks to the card over a contactless interface;
    /// gates the explicit ratification APDU on session close.
    fn is_contactless(&self) -> bool;
}

// Copyright (c) 2023-2024 Calypso Networks Association

//! Calypso / ISO-7816 APDU command and status-word definitions.
//!
//! This crate is the protocol vocabulary: request framing, the per-command
//! status-word tables, and the pure request-builder / response-decoder
//! functions for every Calypso instruction. It knows nothing about sessions,
//! digests, or the card image -- those live in `calypso-core`, which drives
//! this crate's builders/decoders against a reader and a SAM.

pub mod card_model;
pub mod commands;
pub mod framing;
pub mod instruction;
pub mod status;

pub use framing::{ApduRequest, ApduResponse};
pub use instruction::{CalypsoCardClass, Instruction, ProductType};
pub use status::{CalypsoCardError, ErrorKind, StatusProperties, StatusTable};

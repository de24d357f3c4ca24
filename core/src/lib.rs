// Copyright (c) 2023-2024 Calypso Networks Association

//! Calypso secure-session transaction manager and card image.
//!
//! This crate drives the application-layer state machine described by the
//! Calypso Networks Association's Basic Secure Session: it builds batches of
//! APDUs from [`calypso_apdu`] command vocabulary, hands them to a
//! [`reader::CardProxyReader`] collaborator, and folds the responses into a
//! reconstructed [`card::CalypsoCard`] image.
//!
//! ## Layout
//!
//! - [`card`] -- the reconstructed card image: product info, directory
//!   header, elementary files, stored-value state, and single-slot
//!   backup/restore around a secure session.
//! - [`selection`] -- builds the initial application-selection APDU batch
//!   and parses it into a starting [`card::CalypsoCard`].
//! - [`transaction_manager`] -- [`transaction_manager::CardTransactionManager`],
//!   the orchestrator: command queue, session open/close/cancel, the
//!   modifications-buffer budget and automatic session splitting, and
//!   anticipated-response generation for the SAM digest.
//! - [`reader`] -- the [`reader::CardProxyReader`] trait the orchestrator
//!   transmits batches through.
//! - [`sam`] -- the [`sam::ControlSamTransactionManager`] trait the
//!   orchestrator drives for digest/MAC tracking, PIN/key ciphering and
//!   stored-value certification.
//! - [`config`] -- session policy ([`config::Config`] / [`config::ConfigBuilder`]).
//! - [`error`] -- [`error::TransactionManagerError`], always carrying the
//!   accumulated [`error::TransactionAuditData`] trace.
//!
//! Wire framing, the APDU command vocabulary and status-word tables live in
//! the sibling [`calypso_apdu`] crate; this crate only consumes them.

pub mod card;
pub mod config;
pub mod error;
pub mod reader;
pub mod sam;
pub mod selection;
pub mod transaction_manager;

pub use calypso_apdu as apdu;

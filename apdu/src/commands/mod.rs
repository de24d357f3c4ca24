// Copyright (c) 2023-2024 Calypso Networks Association

//! One module per Calypso instruction (or closely related family). Each
//! module exposes a `build_*` function returning an [`crate::ApduRequest`]
//! and a `parse_*` function returning a small response DTO after checking
//! the status word via [`crate::status::check_status`]. `calypso-core`
//! applies the DTOs onto the card image.

pub mod append_record;
pub mod close_session;
pub mod counters;
pub mod df_status;
pub mod get_challenge;
pub mod get_data;
pub mod open_session;
pub mod pin_and_key;
pub mod read_binary;
pub mod read_record_multiple;
pub mod read_records;
pub mod search_record_multiple;
pub mod select_file;
pub mod sv;
pub mod write;

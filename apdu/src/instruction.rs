// Copyright (c) 2023-2024 Calypso Networks Association

//! Calypso instruction bytes and the card class (CLA) a command is framed with.

/// Calypso card instruction codes (component A/C vocabulary).
///
/// `ChangePin` and `ChangeKey` share instruction byte `0xD8`; they are
/// distinguished by P2 (`0xFF` selects the PIN form), not by INS.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Instruction {
    OpenSession = 0x8A,
    CloseSession = 0x8E,
    ReadRecords = 0xB2,
    ReadRecordMultiple = 0xB3,
    ReadBinary = 0xB0,
    UpdateRecord = 0xDC,
    WriteRecord = 0xD2,
    UpdateBinary = 0xD6,
    WriteBinary = 0xD0,
    AppendRecord = 0xE2,
    Increase = 0x32,
    Decrease = 0x30,
    IncreaseMultiple = 0x3A,
    DecreaseMultiple = 0x38,
    SearchRecordMultiple = 0xA2,
    SelectFile = 0xA4,
    GetData = 0xCA,
    GetChallenge = 0x84,
    VerifyPin = 0x20,
    ChangePinOrKey = 0xD8,
    SvGet = 0x7C,
    SvReload = 0xB8,
    SvDebit = 0xBA,
    SvUndebit = 0xBC,
    Invalidate = 0x04,
    /// Instruction byte for REHABILITATE. The reference implementation's
    /// debug label for this command reads "Invalidate" -- a naming bug in
    /// the source; the INS byte below is authoritative.
    Rehabilitate = 0x44,
}

impl Instruction {
    pub const fn byte(self) -> u8 {
        self as u8
    }

    pub const fn name(self) -> &'static str {
        match self {
            Instruction::OpenSession => "OPEN_SESSION",
            Instruction::CloseSession => "CLOSE_SESSION",
            Instruction::ReadRecords => "READ_RECORDS",
            Instruction::ReadRecordMultiple => "READ_RECORD_MULTIPLE",
            Instruction::ReadBinary => "READ_BINARY",
            Instruction::UpdateRecord => "UPDATE_RECORD",
            Instruction::WriteRecord => "WRITE_RECORD",
            Instruction::UpdateBinary => "UPDATE_BINARY",
            Instruction::WriteBinary => "WRITE_BINARY",
            Instruction::AppendRecord => "APPEND_RECORD",
            Instruction::Increase => "INCREASE",
            Instruction::Decrease => "DECREASE",
            Instruction::IncreaseMultiple => "INCREASE_MULTIPLE",
            Instruction::DecreaseMultiple => "DECREASE_MULTIPLE",
            Instruction::SearchRecordMultiple => "SEARCH_RECORD_MULTIPLE",
            Instruction::SelectFile => "SELECT_FILE",
            Instruction::GetData => "GET_DATA",
            Instruction::GetChallenge => "GET_CHALLENGE",
            Instruction::VerifyPin => "VERIFY_PIN",
            Instruction::ChangePinOrKey => "CHANGE_PIN_OR_KEY",
            Instruction::SvGet => "SV_GET",
            Instruction::SvReload => "SV_RELOAD",
            Instruction::SvDebit => "SV_DEBIT",
            Instruction::SvUndebit => "SV_UNDEBIT",
            Instruction::Invalidate => "INVALIDATE",
            Instruction::Rehabilitate => "REHABILITATE",
        }
    }
}

/// CLA byte family a card responds to; selected by product type.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CalypsoCardClass {
    /// Rev 1 / Rev 2 cards: CLA `0x94`.
    Legacy,
    /// Rev 3+ cards: CLA `0x00` (standard ISO).
    Iso,
}

impl CalypsoCardClass {
    pub const fn value(self) -> u8 {
        match self {
            CalypsoCardClass::Legacy => 0x94,
            CalypsoCardClass::Iso => 0x00,
        }
    }
}

/// Calypso product generation, drives CLA selection, response layout
/// branching (OPEN_SESSION, SELECT_FILE LID offset) and SV-class selection.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ProductType {
    Rev1_0,
    Rev2_4,
    Rev3_1,
    Rev3_2,
    Rev3_3,
    Light,
    Basic,
    Unknown,
}

impl ProductType {
    pub const fn is_rev2_or_older(self) -> bool {
        matches!(self, ProductType::Rev1_0 | ProductType::Rev2_4)
    }

    pub const fn is_rev1(self) -> bool {
        matches!(self, ProductType::Rev1_0)
    }
}

/// CLA used for SV commands: legacy (`0xFA`) when the card class is
/// `Legacy`, ISO (`0x00`) otherwise.
pub const fn sv_class(card_class: CalypsoCardClass) -> u8 {
    match card_class {
        CalypsoCardClass::Legacy => 0xFA,
        CalypsoCardClass::Iso => 0x00,
    }
}

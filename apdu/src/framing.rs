// Copyright (c) 2023-2024 Calypso Networks Association

//! ISO-7816 APDU request/response framing (component A).
//!
//! Request bytes: `CLA | INS | P1 | P2`, then `Lc | data...` when a body is
//! present (case 3/4), then `Le` when expected (case 2/4).
//! Response bytes: `dataOut... | SW1 | SW2`.

use crate::status::CalypsoCardError;

/// A built APDU request, ready to hand to a reader transport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ApduRequest {
    pub cla: u8,
    pub ins: u8,
    pub p1: u8,
    pub p2: u8,
    data: Vec<u8>,
    le: Option<u8>,
    /// Status words considered successful for this request beyond `0x9000`,
    /// e.g. SV-modifying commands accept `0x6200` ("data postponed").
    extra_successful_sw: Vec<u16>,
    /// Human-readable name, surfaced in logs and error messages.
    pub info: &'static str,
}

impl ApduRequest {
    pub fn new(cla: u8, ins: u8, p1: u8, p2: u8, info: &'static str) -> Self {
        Self {
            cla,
            ins,
            p1,
            p2,
            data: Vec::new(),
            le: None,
            extra_successful_sw: Vec::new(),
            info,
        }
    }

    pub fn with_data(mut self, data: Vec<u8>) -> Self {
        self.data = data;
        self
    }

    pub fn with_le(mut self, le: u8) -> Self {
        self.le = Some(le);
        self
    }

    pub fn with_extra_successful_sw(mut self, sw: u16) -> Self {
        self.extra_successful_sw.push(sw);
        self
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn extra_successful_sw(&self) -> &[u16] {
        &self.extra_successful_sw
    }

    /// Serialize to the wire bytes a reader transport would send.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + 1 + self.data.len() + 1);
        out.push(self.cla);
        out.push(self.ins);
        out.push(self.p1);
        out.push(self.p2);
        if !self.data.is_empty() {
            out.push(self.data.len() as u8);
            out.extend_from_slice(&self.data);
        }
        if let Some(le) = self.le {
            out.push(le);
        }
        out
    }
}

/// A parsed APDU response: the full bytes, with `dataOut`/`statusWord`
/// derived accessors.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ApduResponse {
    apdu: Vec<u8>,
}

impl ApduResponse {
    /// `apdu` must be at least 2 bytes (the trailing status word); a
    /// misbehaving reader transport that hands back fewer bytes is reported
    /// rather than allowed to panic the driver.
    pub fn new(apdu: Vec<u8>) -> Result<Self, CalypsoCardError> {
        if apdu.len() < 2 {
            return Err(CalypsoCardError::TruncatedResponse { actual: apdu.len() });
        }
        Ok(Self { apdu })
    }

    pub fn apdu(&self) -> &[u8] {
        &self.apdu
    }

    pub fn data_out(&self) -> &[u8] {
        &self.apdu[..self.apdu.len() - 2]
    }

    pub fn status_word(&self) -> u16 {
        let n = self.apdu.len();
        ((self.apdu[n - 2] as u16) << 8) | self.apdu[n - 1] as u16
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn builds_case_4_request() {
        let req = ApduRequest::new(0x00, 0xA4, 0x09, 0x00, "SELECT_FILE")
            .with_data(vec![0x30, 0x07])
            .with_le(0x00);
        assert_eq!(
            req.to_bytes(),
            vec![0x00, 0xA4, 0x09, 0x00, 0x02, 0x30, 0x07, 0x00]
        );
    }

    #[test]
    fn builds_case_1_request() {
        let req = ApduRequest::new(0x00, 0x84, 0x00, 0x00, "GET_CHALLENGE");
        assert_eq!(req.to_bytes(), vec![0x00, 0x84, 0x00, 0x00]);
    }

    #[test]
    fn response_splits_data_and_status_word() {
        let resp = ApduResponse::new(vec![0xAA, 0xBB, 0x90, 0x00]).unwrap();
        assert_eq!(resp.data_out(), &[0xAA, 0xBB]);
        assert_eq!(resp.status_word(), 0x9000);
    }

    #[test]
    fn truncated_response_is_an_error_not_a_panic() {
        let err = ApduResponse::new(vec![0x90]).unwrap_err();
        assert!(matches!(err, CalypsoCardError::TruncatedResponse { actual: 1 }));
    }
}

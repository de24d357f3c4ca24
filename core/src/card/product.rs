// Copyright (c) 2023-2024 Calypso Networks Association

//! Product-level (per-application) attributes decoded at selection time.
//! These never change over a card's lifetime and are consulted constantly by
//! the transaction manager (CLA selection, modifications-buffer budget,
//! extended-mode gating).

pub use calypso_apdu::ProductType;

/// Whether the card's modifications-buffer budget is tracked in bytes
/// (Rev3.2+) or in the number of modifying operations (older products).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ModificationCounterScheme {
    Bytes,
    Operations,
}

/// Product-declared characteristics of the selected Calypso application.
#[derive(Clone, Debug)]
pub struct ProductInfo {
    pub product_type: ProductType,
    pub modification_counter_scheme: ModificationCounterScheme,
    pub modifications_buffer_capacity: usize,
    pub payload_capacity: usize,
    pub extended_mode_supported: bool,
    pub has_sv_feature: bool,
    pub has_pin_feature: bool,
    pub has_pki_feature: bool,
    pub application_subtype: u8,
    pub startup_info_raw: Vec<u8>,
}

impl ProductInfo {
    /// Conservative defaults for an unrecognized product: byte-mode budget,
    /// no optional features. Callers overwrite fields once the real startup
    /// information has been decoded.
    pub fn unknown() -> Self {
        Self {
            product_type: ProductType::Unknown,
            modification_counter_scheme: ModificationCounterScheme::Bytes,
            modifications_buffer_capacity: 430,
            payload_capacity: 235,
            extended_mode_supported: false,
            has_sv_feature: false,
            has_pin_feature: false,
            has_pki_feature: false,
            application_subtype: 0,
            startup_info_raw: Vec::new(),
        }
    }

    /// Rev 1 products track the modifications buffer as a count of
    /// operations rather than bytes (CL-CSS-SCBYTES / CL-CSS-SCOPE).
    pub fn decode_from_startup_info(startup_info: &[u8]) -> Self {
        let mut info = Self::unknown();
        info.startup_info_raw = startup_info.to_vec();
        if startup_info.len() >= 7 {
            info.application_subtype = startup_info[0];
            let buffer_size_indicator = startup_info[2];
            let platform = startup_info[6];
            info.product_type = match platform {
                0x01 | 0x02 => ProductType::Rev1_0,
                0x03 | 0x04 => ProductType::Rev2_4,
                0x05 | 0x06 => ProductType::Rev3_1,
                0x07 => ProductType::Rev3_2,
                0x08 => ProductType::Rev3_3,
                0x09 => ProductType::Light,
                0x0A => ProductType::Basic,
                _ => ProductType::Unknown,
            };
            info.modification_counter_scheme = if info.product_type.is_rev1() {
                ModificationCounterScheme::Operations
            } else {
                ModificationCounterScheme::Bytes
            };
            info.modifications_buffer_capacity = match info.modification_counter_scheme {
                ModificationCounterScheme::Operations => buffer_size_indicator.max(1) as usize,
                ModificationCounterScheme::Bytes => {
                    modifications_buffer_capacity_from_indicator(buffer_size_indicator)
                }
            };
            info.extended_mode_supported = matches!(
                info.product_type,
                ProductType::Rev3_2 | ProductType::Rev3_3
            );
        }
        info
    }
}

/// Calypso startup information encodes buffer capacity as a small integer
/// indicator that selects among a fixed table of byte sizes.
fn modifications_buffer_capacity_from_indicator(indicator: u8) -> usize {
    const TABLE: [usize; 8] = [215, 235, 256, 304, 362, 430, 512, 608];
    TABLE
        .get(indicator as usize)
        .copied()
        .unwrap_or(TABLE[TABLE.len() - 1])
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn rev1_uses_operation_counting() {
        let info = ProductInfo::decode_from_startup_info(&[0, 0, 3, 0, 0, 0, 0x01]);
        assert_eq!(info.modification_counter_scheme, ModificationCounterScheme::Operations);
    }

    #[test]
    fn rev3_2_supports_extended_mode() {
        let info = ProductInfo::decode_from_startup_info(&[0, 0, 5, 0, 0, 0, 0x07]);
        assert!(info.extended_mode_supported);
        assert_eq!(info.modification_counter_scheme, ModificationCounterScheme::Bytes);
    }
}

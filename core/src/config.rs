// Copyright (c) 2023-2024 Calypso Networks Association

//! Session-policy knobs consumed by [`crate::transaction_manager::CardTransactionManager`].
//! Mirrors the teacher crate's small builder-style configuration surface.

use crate::reader::ChannelControl;

/// Transaction-manager session policy.
#[derive(Clone, Copy, Debug)]
pub struct Config {
    /// When the modifications-buffer budget overflows mid-batch: split into
    /// multiple sessions (`true`) or raise `SessionBufferOverflow` (`false`).
    pub multiple_session_mode: bool,
    /// Channel control applied to a batch unless `prepareReleaseCardChannel`
    /// overrides it for the next call.
    pub default_channel_control: ChannelControl,
    /// Whether VERIFY_PIN/CHANGE_PIN may send the PIN in plain form, or must
    /// always go through the GET_CHALLENGE + SAM-cipher flow.
    pub pin_plain_transmission_allowed: bool,
    /// Append an explicit RATIFICATION APDU after CLOSE_SESSION when the
    /// reader is contactless.
    pub ratification_mechanism_enabled: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            multiple_session_mode: false,
            default_channel_control: ChannelControl::KeepOpen,
            pin_plain_transmission_allowed: false,
            ratification_mechanism_enabled: true,
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ConfigBuilder(Config);

impl ConfigBuilder {
    pub fn new() -> Self {
        Self(Config::default())
    }

    pub fn multiple_session_mode(mut self, enabled: bool) -> Self {
        self.0.multiple_session_mode = enabled;
        self
    }

    pub fn default_channel_control(mut self, control: ChannelControl) -> Self {
        self.0.default_channel_control = control;
        self
    }

    pub fn pin_plain_transmission_allowed(mut self, allowed: bool) -> Self {
        self.0.pin_plain_transmission_allowed = allowed;
        self
    }

    pub fn ratification_mechanism_enabled(mut self, enabled: bool) -> Self {
        self.0.ratification_mechanism_enabled = enabled;
        self
    }

    pub fn build(self) -> Config {
        self.0
    }
}

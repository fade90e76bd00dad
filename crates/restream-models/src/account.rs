//! Destination account and channel configuration.

use serde::{Deserialize, Serialize};

use crate::ids::AccountId;

/// Static configuration of a destination account.
///
/// The mutable binding state (current lease, disabled flag) lives on the
/// runtime `Account` entity in the relay crate; this is the configured shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountConfig {
    /// Account identity
    pub account_id: AccountId,
    /// Target platform identifier (matched against destination services)
    pub platform: String,
    /// Room/channel identifier on the destination platform
    pub room_id: String,
    /// Whether the account starts disabled
    #[serde(default)]
    pub disabled: bool,
    /// Whether the account participates in auto-balancing
    #[serde(default)]
    pub join_auto_balance: bool,
    /// Whether the room title should be pushed from the video title
    #[serde(default)]
    pub auto_title: bool,
}

/// Source channel configuration.
///
/// A video with a channel association gets an automatic relay on proxy start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Human-readable channel name (logging only)
    pub channel_name: String,
    /// Preferred destination account, tried before the auto-balance pool
    #[serde(default)]
    pub default_account_id: Option<AccountId>,
    /// Whether relays for this channel may rotate across the account pool
    #[serde(default)]
    pub auto_balance: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_account_config_defaults() {
        let json = r#"{"account_id":"a1","platform":"rtmp","room_id":"room-1"}"#;
        let config: AccountConfig = serde_json::from_str(json).unwrap();
        assert!(!config.disabled);
        assert!(!config.join_auto_balance);
        assert!(!config.auto_title);
    }
}

use std::time::Duration;

use serde::Deserialize;

use crate::{
    abiencode::types::Address,
    error::{Error, Result},
};

/// Client configuration.
///
/// Every field has a default, so an empty document is a valid config.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Bound on every wait for a peer's message, in seconds.
    pub response_timeout_secs: u64,
    /// Start the adjudicator watcher of a channel once it is funded.
    pub auto_watch: bool,
    /// How often the watcher resubmits a failed refutation.
    pub refutation_retries: u32,
    /// On-chain receiver of withdrawals; the account address if unset.
    #[serde(deserialize_with = "deserialize_address")]
    pub withdraw_receiver: Option<Address>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            response_timeout_secs: 30,
            auto_watch: true,
            refutation_retries: 1,
            withdraw_receiver: None,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.response_timeout_secs == 0 {
            return Err(Error::Config("response_timeout_secs must be positive".into()));
        }
        Ok(())
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_secs(self.response_timeout_secs)
    }
}

/// Addresses are written as `0x`-prefixed hex strings.
fn deserialize_address<'de, D>(deserializer: D) -> Result<Option<Address>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error as _;

    let Some(s) = Option::<String>::deserialize(deserializer)? else {
        return Ok(None);
    };
    let hex = s.strip_prefix("0x").unwrap_or(&s);
    if hex.len() != 40 || !hex.is_ascii() {
        return Err(D::Error::custom(format!("address {:?} is not 20 bytes", s)));
    }
    let mut addr = [0u8; 20];
    for (i, byte) in addr.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&hex[2 * i..2 * i + 2], 16)
            .map_err(|_| D::Error::custom(format!("address {:?} is not hex", s)))?;
    }
    Ok(Some(Address(addr)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_gives_defaults() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(config, Config::default());
        assert!(config.validate().is_ok());
        assert_eq!(config.response_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn parses_fields() {
        let config: Config = serde_json::from_str(
            r#"{
                "response_timeout_secs": 5,
                "auto_watch": false,
                "withdraw_receiver": "0x7e5f4552091a69125d5dfcb7b8c2659029395bdf"
            }"#,
        )
        .unwrap();
        assert_eq!(config.response_timeout_secs, 5);
        assert!(!config.auto_watch);
        assert_eq!(config.refutation_retries, 1);
        let expected: [u8; 20] = hex::decode("7e5f4552091a69125d5dfcb7b8c2659029395bdf")
            .unwrap()
            .try_into()
            .unwrap();
        assert_eq!(config.withdraw_receiver, Some(Address(expected)));
    }

    #[test]
    fn rejects_bad_values() {
        let config: Config = serde_json::from_str(r#"{"response_timeout_secs": 0}"#).unwrap();
        assert!(matches!(config.validate(), Err(Error::Config(_))));
        assert!(serde_json::from_str::<Config>(r#"{"withdraw_receiver": "0x12"}"#).is_err());
        assert!(serde_json::from_str::<Config>(r#"{"retries": 3}"#).is_err());
    }
}

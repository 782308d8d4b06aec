//! Domain primitives: BlockHeight, UnixSecs, ChainId, PoolId, Denom, Address.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Block height, the logical clock used for all aggregation ordering.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct BlockHeight(pub i64);

impl BlockHeight {
    pub fn new(height: i64) -> Self {
        BlockHeight(height)
    }

    pub fn as_i64(&self) -> i64 {
        self.0
    }

    /// Height `n` blocks below this one, floored at genesis.
    pub fn saturating_sub(&self, n: i64) -> Self {
        BlockHeight(self.0.saturating_sub(n).max(0))
    }
}

impl fmt::Display for BlockHeight {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Wall-clock time in whole seconds since Unix epoch.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct UnixSecs(pub i64);

impl UnixSecs {
    pub fn new(secs: i64) -> Self {
        UnixSecs(secs)
    }

    pub fn as_i64(&self) -> i64 {
        self.0
    }

    pub fn now() -> Self {
        UnixSecs(chrono::Utc::now().timestamp())
    }
}

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                $name(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = IdParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let trimmed = s.trim();
                if trimmed.is_empty() || trimmed.chars().any(char::is_whitespace) {
                    return Err(IdParseError(stringify!($name)));
                }
                Ok($name(trimmed.to_string()))
            }
        }
    };
}

string_id!(
    /// Chain identifier (e.g. `phoenix-1`).
    ChainId
);
string_id!(
    /// Pool contract identifier.
    PoolId
);
string_id!(
    /// Token denomination (native denom or token contract address).
    Denom
);
string_id!(
    /// Wallet or contract address.
    Address
);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {0}: must be non-empty without whitespace")]
pub struct IdParseError(pub &'static str);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_id_parse_trims() {
        let pool = PoolId::from_str("  terra1pool  ").unwrap();
        assert_eq!(pool.as_str(), "terra1pool");
    }

    #[test]
    fn test_id_parse_rejects_blank_and_whitespace() {
        assert!(PoolId::from_str("   ").is_err());
        assert!(Address::from_str("terra1 abc").is_err());
    }

    #[test]
    fn test_ids_serialize_transparently() {
        let denom = Denom::new("uluna");
        assert_eq!(serde_json::to_string(&denom).unwrap(), "\"uluna\"");
    }

    #[test]
    fn test_height_saturating_sub_floors_at_zero() {
        assert_eq!(BlockHeight::new(50).saturating_sub(100), BlockHeight::new(0));
        assert_eq!(BlockHeight::new(500).saturating_sub(100), BlockHeight::new(400));
    }

    #[test]
    fn test_height_ordering() {
        assert!(BlockHeight::new(100) < BlockHeight::new(101));
    }
}

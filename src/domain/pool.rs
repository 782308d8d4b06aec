//! Pool metadata and derived pool/owner state.

use crate::domain::{Address, BlockHeight, Decimal, Denom, EventPosition, PoolId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Token denomination plus optional decimals, as announced at pool creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenMeta {
    pub denom: Denom,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decimals: Option<u32>,
}

impl TokenMeta {
    pub fn new(denom: Denom, decimals: Option<u32>) -> Self {
        TokenMeta { denom, decimals }
    }
}

/// Which side of the pair a denomination sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TokenRole {
    Token0,
    Token1,
}

/// Registered pool: its pair, its share token, and where it was created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolMeta {
    pub pool: PoolId,
    pub token0: TokenMeta,
    pub token1: TokenMeta,
    pub share_token: Denom,
    pub created_at: EventPosition,
}

impl PoolMeta {
    pub fn role_of(&self, denom: &Denom) -> Option<TokenRole> {
        if &self.token0.denom == denom {
            Some(TokenRole::Token0)
        } else if &self.token1.denom == denom {
            Some(TokenRole::Token1)
        } else {
            None
        }
    }

    pub fn token(&self, role: TokenRole) -> &TokenMeta {
        match role {
            TokenRole::Token0 => &self.token0,
            TokenRole::Token1 => &self.token1,
        }
    }

    /// Metadata for a pool token, or a bare entry for foreign denominations.
    pub fn meta_for(&self, denom: &Denom) -> TokenMeta {
        match self.role_of(denom) {
            Some(role) => self.token(role).clone(),
            None => TokenMeta::new(denom.clone(), None),
        }
    }
}

/// Decimal precision lookup for converting base units to display units.
///
/// Resolution order: configured override, then pool metadata, then the default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenDecimals {
    pub default: u32,
    pub overrides: BTreeMap<Denom, u32>,
}

impl Default for TokenDecimals {
    fn default() -> Self {
        TokenDecimals {
            default: 6,
            overrides: BTreeMap::new(),
        }
    }
}

impl TokenDecimals {
    pub fn new(default: u32, overrides: BTreeMap<Denom, u32>) -> Self {
        TokenDecimals { default, overrides }
    }

    pub fn resolve(&self, token: &TokenMeta) -> u32 {
        self.overrides
            .get(&token.denom)
            .copied()
            .or(token.decimals)
            .unwrap_or(self.default)
    }

    /// Convert a base-unit amount to display units; `None` if the scale overflows.
    pub fn to_display(&self, token: &TokenMeta, amount: Decimal) -> Option<Decimal> {
        let scale = Decimal::pow10(self.resolve(token))?;
        amount.checked_div(scale)
    }
}

/// Amount of one pool token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenBalance {
    pub token: Denom,
    pub amount: Decimal,
}

/// Reconstructed pool reserves and share supply at a height.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolState {
    pub pool: PoolId,
    pub height: BlockHeight,
    pub reserve0: TokenBalance,
    pub reserve1: TokenBalance,
    pub total_shares: Decimal,
    /// `reserve1 / reserve0` in display units; absent when reserve0 is zero.
    pub implied_price: Option<Decimal>,
}

/// Share position of one owner in one pool at a height.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerShareState {
    pub pool: PoolId,
    pub owner: Address,
    pub height: BlockHeight,
    pub total: Decimal,
    pub staked: Decimal,
    pub unstaked: Decimal,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta() -> PoolMeta {
        PoolMeta {
            pool: PoolId::new("pool"),
            token0: TokenMeta::new(Denom::new("uluna"), Some(6)),
            token1: TokenMeta::new(Denom::new("weth"), Some(18)),
            share_token: Denom::new("lp"),
            created_at: EventPosition::new(BlockHeight::new(100), 0, 0),
        }
    }

    #[test]
    fn test_role_of() {
        let meta = meta();
        assert_eq!(meta.role_of(&Denom::new("uluna")), Some(TokenRole::Token0));
        assert_eq!(meta.role_of(&Denom::new("weth")), Some(TokenRole::Token1));
        assert_eq!(meta.role_of(&Denom::new("uusd")), None);
    }

    #[test]
    fn test_decimals_resolution_order() {
        let mut overrides = BTreeMap::new();
        overrides.insert(Denom::new("weth"), 8);
        let decimals = TokenDecimals::new(6, overrides);
        let meta = meta();

        assert_eq!(decimals.resolve(&meta.token0), 6);
        assert_eq!(decimals.resolve(&meta.token1), 8);
        assert_eq!(decimals.resolve(&TokenMeta::new(Denom::new("astro"), None)), 6);
    }

    #[test]
    fn test_to_display() {
        let decimals = TokenDecimals::default();
        let token = TokenMeta::new(Denom::new("uluna"), None);
        let display = decimals
            .to_display(&token, Decimal::from_i64(2_500_000))
            .unwrap();
        assert_eq!(display.to_canonical_string(), "2.5");
    }
}

//! Normalized ledger events as read from the event store.

use crate::domain::{
    Address, BlockHeight, ChainId, Decimal, Denom, EventPosition, PoolId, PriceObservation,
    TokenMeta, UnixSecs,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Idempotency key of a stored event.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventKey {
    pub chain_id: ChainId,
    pub height: BlockHeight,
    pub tx_index: u32,
    pub event_index: u32,
}

impl EventKey {
    pub fn new(chain_id: ChainId, height: BlockHeight, tx_index: u32, event_index: u32) -> Self {
        EventKey {
            chain_id,
            height,
            tx_index,
            event_index,
        }
    }

    pub fn position(&self) -> EventPosition {
        EventPosition::new(self.height, self.tx_index, self.event_index)
    }
}

impl fmt::Display for EventKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.chain_id, self.position())
    }
}

/// A single immutable event from the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerEvent {
    pub key: EventKey,
    /// Block time of the event.
    pub timestamp: UnixSecs,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl LedgerEvent {
    pub fn new(key: EventKey, timestamp: UnixSecs, kind: EventKind) -> Self {
        LedgerEvent {
            key,
            timestamp,
            kind,
        }
    }

    pub fn position(&self) -> EventPosition {
        self.key.position()
    }

    pub fn height(&self) -> BlockHeight {
        self.key.height
    }

    pub fn pool(&self) -> Option<&PoolId> {
        self.kind.pool()
    }

    pub fn tag(&self) -> EventKindTag {
        self.kind.tag()
    }
}

/// Event payload, tagged by kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum EventKind {
    PoolCreated(PoolCreated),
    AddLiquidity(AddLiquidity),
    WithdrawLiquidity(WithdrawLiquidity),
    Swap(Swap),
    Stake(StakeChange),
    Unstake(StakeChange),
    IncentiveScheduled(IncentiveScheduled),
    PriceObserved(PriceObservation),
}

impl EventKind {
    /// Pool this event touches; `None` for pool-independent events (prices).
    pub fn pool(&self) -> Option<&PoolId> {
        match self {
            EventKind::PoolCreated(e) => Some(&e.pool),
            EventKind::AddLiquidity(e) => Some(&e.pool),
            EventKind::WithdrawLiquidity(e) => Some(&e.pool),
            EventKind::Swap(e) => Some(&e.pool),
            EventKind::Stake(e) | EventKind::Unstake(e) => Some(&e.pool),
            EventKind::IncentiveScheduled(e) => Some(&e.pool),
            EventKind::PriceObserved(_) => None,
        }
    }

    pub fn tag(&self) -> EventKindTag {
        match self {
            EventKind::PoolCreated(_) => EventKindTag::PoolCreated,
            EventKind::AddLiquidity(_) => EventKindTag::AddLiquidity,
            EventKind::WithdrawLiquidity(_) => EventKindTag::WithdrawLiquidity,
            EventKind::Swap(_) => EventKindTag::Swap,
            EventKind::Stake(_) => EventKindTag::Stake,
            EventKind::Unstake(_) => EventKindTag::Unstake,
            EventKind::IncentiveScheduled(_) => EventKindTag::IncentiveScheduled,
            EventKind::PriceObserved(_) => EventKindTag::PriceObserved,
        }
    }
}

/// Discriminant of [`EventKind`], stored in the event table's `kind` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventKindTag {
    PoolCreated,
    AddLiquidity,
    WithdrawLiquidity,
    Swap,
    Stake,
    Unstake,
    IncentiveScheduled,
    PriceObserved,
}

impl EventKindTag {
    pub const ALL: [EventKindTag; 8] = [
        EventKindTag::PoolCreated,
        EventKindTag::AddLiquidity,
        EventKindTag::WithdrawLiquidity,
        EventKindTag::Swap,
        EventKindTag::Stake,
        EventKindTag::Unstake,
        EventKindTag::IncentiveScheduled,
        EventKindTag::PriceObserved,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKindTag::PoolCreated => "poolCreated",
            EventKindTag::AddLiquidity => "addLiquidity",
            EventKindTag::WithdrawLiquidity => "withdrawLiquidity",
            EventKindTag::Swap => "swap",
            EventKindTag::Stake => "stake",
            EventKindTag::Unstake => "unstake",
            EventKindTag::IncentiveScheduled => "incentiveScheduled",
            EventKindTag::PriceObserved => "priceObserved",
        }
    }
}

impl fmt::Display for EventKindTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKindTag {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventKindTag::ALL
            .into_iter()
            .find(|tag| tag.as_str() == s)
            .ok_or_else(|| format!("unknown event kind: {}", s))
    }
}

/// Pool creation, registering the pair and its share token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolCreated {
    pub pool: PoolId,
    pub token0: TokenMeta,
    pub token1: TokenMeta,
    pub share_token: Denom,
}

/// Which identity was credited with a liquidity change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OwnerSource {
    /// The recorded liquidity receiver.
    Receiver,
    /// No receiver was recorded; the provider (transaction sender) is credited.
    ProviderFallback,
}

/// Resolve the share owner of a liquidity change.
pub fn resolve_owner<'a>(
    provider: &'a Address,
    receiver: Option<&'a Address>,
) -> (&'a Address, OwnerSource) {
    match receiver {
        Some(receiver) => (receiver, OwnerSource::Receiver),
        None => (provider, OwnerSource::ProviderFallback),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddLiquidity {
    pub pool: PoolId,
    /// Transaction sender.
    pub provider: Address,
    /// Liquidity receiver credited with the shares, when recorded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver: Option<Address>,
    pub token0_amount: Decimal,
    pub token1_amount: Decimal,
    pub shares_issued: Decimal,
}

impl AddLiquidity {
    pub fn owner(&self) -> (&Address, OwnerSource) {
        resolve_owner(&self.provider, self.receiver.as_ref())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WithdrawLiquidity {
    pub pool: PoolId,
    /// Transaction sender.
    pub provider: Address,
    /// Owner whose shares are burned, when recorded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver: Option<Address>,
    pub token0_amount: Decimal,
    pub token1_amount: Decimal,
    pub shares_burned: Decimal,
}

impl WithdrawLiquidity {
    pub fn owner(&self) -> (&Address, OwnerSource) {
        resolve_owner(&self.provider, self.receiver.as_ref())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Swap {
    pub pool: PoolId,
    pub offer_token: Denom,
    pub ask_token: Denom,
    pub offer_amount: Decimal,
    pub return_amount: Decimal,
    /// Commission in the ask token, paid out of the pool.
    pub commission_amount: Decimal,
    /// Protocol fee share in the ask token, paid out of the pool.
    #[serde(default)]
    pub fee_share_amount: Decimal,
}

impl Swap {
    /// Amount of the ask token leaving the reserves; `None` when it does not fit.
    pub fn ask_outflow(&self) -> Option<Decimal> {
        self.return_amount
            .checked_add(self.commission_amount)?
            .checked_add(self.fee_share_amount)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StakeChange {
    pub pool: PoolId,
    pub owner: Address,
    pub share_amount: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncentiveScheduled {
    pub pool: PoolId,
    pub reward_token: Denom,
    /// Emission rate in reward-token base units per second.
    pub rate_per_second: Decimal,
    pub start_time: UnixSecs,
    pub end_time: UnixSecs,
}

impl IncentiveScheduled {
    /// Seconds of `[start_time, end_time]` that fall inside `[from, to]`.
    pub fn overlap_secs(&self, from: UnixSecs, to: UnixSecs) -> i64 {
        let lo = self.start_time.max(from);
        let hi = self.end_time.min(to);
        (hi.as_i64() - lo.as_i64()).max(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> Decimal {
        Decimal::from_str_canonical(s).unwrap()
    }

    #[test]
    fn test_owner_prefers_receiver() {
        let add = AddLiquidity {
            pool: PoolId::new("pool"),
            provider: Address::new("sender"),
            receiver: Some(Address::new("receiver")),
            token0_amount: d("1"),
            token1_amount: d("1"),
            shares_issued: d("1"),
        };
        let (owner, source) = add.owner();
        assert_eq!(owner.as_str(), "receiver");
        assert_eq!(source, OwnerSource::Receiver);
    }

    #[test]
    fn test_owner_falls_back_to_provider() {
        let withdraw = WithdrawLiquidity {
            pool: PoolId::new("pool"),
            provider: Address::new("sender"),
            receiver: None,
            token0_amount: d("1"),
            token1_amount: d("1"),
            shares_burned: d("1"),
        };
        let (owner, source) = withdraw.owner();
        assert_eq!(owner.as_str(), "sender");
        assert_eq!(source, OwnerSource::ProviderFallback);
    }

    #[test]
    fn test_swap_ask_outflow_includes_fees() {
        let swap = Swap {
            pool: PoolId::new("pool"),
            offer_token: Denom::new("a"),
            ask_token: Denom::new("b"),
            offer_amount: d("100"),
            return_amount: d("190"),
            commission_amount: d("2"),
            fee_share_amount: d("1"),
        };
        assert_eq!(swap.ask_outflow(), Some(d("193")));
    }

    #[test]
    fn test_incentive_overlap() {
        let inc = IncentiveScheduled {
            pool: PoolId::new("pool"),
            reward_token: Denom::new("astro"),
            rate_per_second: d("10"),
            start_time: UnixSecs::new(100),
            end_time: UnixSecs::new(200),
        };
        assert_eq!(inc.overlap_secs(UnixSecs::new(50), UnixSecs::new(150)), 50);
        assert_eq!(inc.overlap_secs(UnixSecs::new(120), UnixSecs::new(130)), 10);
        assert_eq!(inc.overlap_secs(UnixSecs::new(250), UnixSecs::new(300)), 0);
    }

    #[test]
    fn test_event_json_is_kind_tagged() {
        let event = LedgerEvent::new(
            EventKey::new(ChainId::new("phoenix-1"), BlockHeight::new(110), 0, 1),
            UnixSecs::new(1_700_000_000),
            EventKind::Stake(StakeChange {
                pool: PoolId::new("pool"),
                owner: Address::new("x"),
                share_amount: d("1000"),
            }),
        );
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "stake");
        assert_eq!(json["shareAmount"], "1000");
        assert_eq!(json["key"]["height"], 110);

        let back: LedgerEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_kind_tag_parse() {
        assert_eq!(
            EventKindTag::from_str("withdrawLiquidity").unwrap(),
            EventKindTag::WithdrawLiquidity
        );
        assert!(EventKindTag::from_str("mint").is_err());
    }
}

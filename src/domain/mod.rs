//! Domain types and determinism layer for the pool ledger.
//!
//! This module provides:
//! - Lossless numeric handling via Decimal wrapper
//! - Domain primitives: BlockHeight, UnixSecs, ChainId, PoolId, Denom, Address
//! - Normalized ledger events with a kind-tagged JSON form
//! - Stable event positions for deterministic processing
//! - Pool metadata, derived state rows and USD valuations

pub mod decimal;
pub mod event;
pub mod ordering;
pub mod pool;
pub mod price;
pub mod primitives;
pub mod valuation;

pub use decimal::Decimal;
pub use event::{
    resolve_owner, AddLiquidity, EventKey, EventKind, EventKindTag, IncentiveScheduled,
    LedgerEvent, OwnerSource, PoolCreated, StakeChange, Swap, WithdrawLiquidity,
};
pub use ordering::{sort_events_deterministic, EventPosition};
pub use pool::{
    OwnerShareState, PoolMeta, PoolState, TokenBalance, TokenDecimals, TokenMeta, TokenRole,
};
pub use price::PriceObservation;
pub use primitives::{Address, BlockHeight, ChainId, Denom, IdParseError, PoolId, UnixSecs};
pub use valuation::Valuation;

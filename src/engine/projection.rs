//! Per-pool projection of the event log: ledgers, block clock, fee and incentive records.

use super::balance::{BalanceLedger, SwapError, UnpairedSwap};
use super::prices::{BlockClock, PriceBook};
use super::shares::ShareLedger;
use crate::domain::{
    Address, BlockHeight, Decimal, Denom, EventKey, EventKind, EventPosition, IncentiveScheduled,
    LedgerEvent, OwnerShareState, OwnerSource, PoolId, PoolMeta, PoolState, TokenBalance,
    TokenDecimals, TokenMeta, TokenRole, UnixSecs, Valuation,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::{debug, warn};

/// Why a pool's reconstruction cannot be trusted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum PoolFault {
    #[serde(rename_all = "camelCase")]
    NegativeBalance {
        token: Denom,
        at: EventPosition,
        balance: Decimal,
    },
    /// Total supply (owner `None`) or an owner's holding went negative.
    #[serde(rename_all = "camelCase")]
    NegativeShares {
        owner: Option<Address>,
        at: EventPosition,
        shares: Decimal,
    },
    #[serde(rename_all = "camelCase")]
    ForeignToken {
        event: EventKey,
        offer: Denom,
        ask: Denom,
    },
    /// An amount pushed a running total past the decimal range.
    #[serde(rename_all = "camelCase")]
    Overflow { event: EventKey },
}

/// Swap commission recorded for fee accrual.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeeRecord {
    pub position: EventPosition,
    pub token: Denom,
    pub amount: Decimal,
}

/// Incentive schedule and where it was announced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleRecord {
    pub position: EventPosition,
    pub schedule: IncentiveScheduled,
}

/// Converts base-unit amounts into USD valuations.
#[derive(Debug, Clone, Copy)]
pub struct Valuer<'a> {
    pub prices: &'a PriceBook,
    pub decimals: &'a TokenDecimals,
}

impl<'a> Valuer<'a> {
    pub fn new(prices: &'a PriceBook, decimals: &'a TokenDecimals) -> Self {
        Valuer { prices, decimals }
    }

    /// USD value of `amount` base units of `token` at time `at`.
    pub fn value(&self, token: &TokenMeta, amount: Decimal, at: Option<UnixSecs>) -> Valuation {
        let price = at.and_then(|at| self.prices.price_at(&token.denom, at));
        match self.decimals.to_display(token, amount) {
            Some(display) => Valuation::of(&token.denom, display, price),
            None => Valuation::unpriced(token.denom.clone()),
        }
    }
}

/// Latest state of a pool as listed by the query surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolSummary {
    pub pool: PoolId,
    pub share_token: Denom,
    pub state: PoolState,
    pub liquidity_usd: Valuation,
    pub degraded: bool,
}

/// Everything derived from one pool's events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolProjection {
    meta: PoolMeta,
    balances: BalanceLedger,
    shares: ShareLedger,
    clock: BlockClock,
    fees: Vec<FeeRecord>,
    schedules: Vec<ScheduleRecord>,
    unpaired: Vec<(EventKey, UnpairedSwap)>,
    #[serde(default)]
    overflowed: BTreeSet<EventKey>,
    applied: BTreeSet<EventKey>,
}

impl PoolProjection {
    /// Start a projection at the pool's creation event.
    pub fn new(meta: PoolMeta, created: &LedgerEvent) -> Self {
        let mut clock = BlockClock::new();
        clock.record(created.height(), created.timestamp);
        let mut applied = BTreeSet::new();
        applied.insert(created.key.clone());
        PoolProjection {
            meta,
            balances: BalanceLedger::new(),
            shares: ShareLedger::new(),
            clock,
            fees: Vec::new(),
            schedules: Vec::new(),
            unpaired: Vec::new(),
            overflowed: BTreeSet::new(),
            applied,
        }
    }

    pub fn meta(&self) -> &PoolMeta {
        &self.meta
    }

    pub fn pool(&self) -> &PoolId {
        &self.meta.pool
    }

    pub fn clock(&self) -> &BlockClock {
        &self.clock
    }

    pub fn balances(&self) -> &BalanceLedger {
        &self.balances
    }

    pub fn shares(&self) -> &ShareLedger {
        &self.shares
    }

    pub fn fees(&self) -> &[FeeRecord] {
        &self.fees
    }

    pub fn schedules(&self) -> &[ScheduleRecord] {
        &self.schedules
    }

    /// Distinct heights at which an event touched this pool.
    pub fn event_heights(&self) -> Vec<BlockHeight> {
        self.clock.heights().copied().collect()
    }

    /// Apply one event. Returns false when the event was already applied.
    ///
    /// Events may arrive in any order; every ledger slots them in by position.
    pub fn apply(&mut self, event: &LedgerEvent) -> bool {
        if !self.applied.insert(event.key.clone()) {
            return false;
        }
        let position = event.position();
        self.clock.record(event.height(), event.timestamp);

        let folded = match &event.kind {
            EventKind::AddLiquidity(add) => {
                let (owner, source) = add.owner();
                if source == OwnerSource::ProviderFallback {
                    debug!(pool = %self.meta.pool, event = %event.key, owner = %owner, "No receiver recorded, crediting provider");
                }
                self.balances
                    .apply_add(position, add)
                    .and_then(|()| self.shares.issue(position, owner, add.shares_issued))
            }
            EventKind::WithdrawLiquidity(withdraw) => {
                let (owner, source) = withdraw.owner();
                if source == OwnerSource::ProviderFallback {
                    debug!(pool = %self.meta.pool, event = %event.key, owner = %owner, "No receiver recorded, debiting provider");
                }
                self.balances
                    .apply_withdraw(position, withdraw)
                    .and_then(|()| self.shares.burn(position, owner, withdraw.shares_burned))
            }
            EventKind::Swap(swap) => match self.balances.apply_swap(&self.meta, position, swap) {
                Ok(()) => {
                    insert_sorted(
                        &mut self.fees,
                        FeeRecord {
                            position,
                            token: swap.ask_token.clone(),
                            amount: swap.commission_amount,
                        },
                        |r| r.position,
                    );
                    Ok(())
                }
                Err(SwapError::Unpaired(unpaired)) => {
                    self.unpaired.push((event.key.clone(), unpaired));
                    Ok(())
                }
                Err(SwapError::Overflow(overflow)) => Err(overflow),
            },
            EventKind::Stake(stake) => {
                self.shares
                    .stake(position, &stake.owner, stake.share_amount)
            }
            EventKind::Unstake(unstake) => {
                self.shares
                    .unstake(position, &unstake.owner, unstake.share_amount)
            }
            EventKind::IncentiveScheduled(schedule) => {
                insert_sorted(
                    &mut self.schedules,
                    ScheduleRecord {
                        position,
                        schedule: schedule.clone(),
                    },
                    |r| r.position,
                );
                Ok(())
            }
            EventKind::PoolCreated(_) | EventKind::PriceObserved(_) => Ok(()),
        };
        if let Err(overflow) = folded {
            warn!(pool = %self.meta.pool, event = %event.key, error = %overflow, "Event not folded");
            self.overflowed.insert(event.key.clone());
        }
        true
    }

    /// Forget applied keys at or below `height`; they will not be re-read.
    pub fn prune_applied(&mut self, height: BlockHeight) {
        self.applied.retain(|key| key.height > height);
    }

    /// Full scan for negative running totals and rejected swaps.
    pub fn faults(&self) -> Vec<PoolFault> {
        let mut faults = Vec::new();
        for role in [TokenRole::Token0, TokenRole::Token1] {
            if let Some((at, balance)) = self.balances.first_negative(role) {
                faults.push(PoolFault::NegativeBalance {
                    token: self.meta.token(role).denom.clone(),
                    at,
                    balance,
                });
            }
        }
        if let Some((at, shares)) = self.shares.supply().first_negative() {
            faults.push(PoolFault::NegativeShares {
                owner: None,
                at: *at,
                shares,
            });
        }
        for (owner, ledger) in self.shares.owners() {
            if let Some((at, shares)) = ledger.total.first_negative() {
                faults.push(PoolFault::NegativeShares {
                    owner: Some(owner.clone()),
                    at: *at,
                    shares,
                });
            }
        }
        let mut unpaired: Vec<&(EventKey, UnpairedSwap)> = self.unpaired.iter().collect();
        unpaired.sort_by(|a, b| a.0.cmp(&b.0));
        for (event, unpaired) in unpaired {
            faults.push(PoolFault::ForeignToken {
                event: event.clone(),
                offer: unpaired.offer.clone(),
                ask: unpaired.ask.clone(),
            });
        }
        faults.extend(
            self.overflowed
                .iter()
                .map(|event| PoolFault::Overflow { event: event.clone() }),
        );
        faults
    }

    pub fn state_at(&self, height: BlockHeight, decimals: &TokenDecimals) -> PoolState {
        let amount0 = self.balances.balance_at(TokenRole::Token0, height);
        let amount1 = self.balances.balance_at(TokenRole::Token1, height);
        let implied_price = if amount0.is_zero() {
            None
        } else {
            decimals
                .to_display(&self.meta.token1, amount1)
                .zip(decimals.to_display(&self.meta.token0, amount0))
                .and_then(|(r1, r0)| r1.checked_div(r0))
        };
        PoolState {
            pool: self.meta.pool.clone(),
            height,
            reserve0: TokenBalance {
                token: self.meta.token0.denom.clone(),
                amount: amount0,
            },
            reserve1: TokenBalance {
                token: self.meta.token1.denom.clone(),
                amount: amount1,
            },
            total_shares: self.shares.total_supply_at(height),
            implied_price,
        }
    }

    pub fn owner_at(&self, owner: &Address, height: BlockHeight) -> OwnerShareState {
        let (total, staked, unstaked) = self.shares.owner_at(owner, height);
        OwnerShareState {
            pool: self.meta.pool.clone(),
            owner: owner.clone(),
            height,
            total,
            staked,
            unstaked,
        }
    }

    /// USD value of both reserves at `height`, priced at time `at`.
    pub fn liquidity_at(&self, valuer: Valuer<'_>, height: BlockHeight, at: Option<UnixSecs>) -> Valuation {
        [TokenRole::Token0, TokenRole::Token1]
            .into_iter()
            .map(|role| {
                valuer.value(
                    self.meta.token(role),
                    self.balances.balance_at(role, height),
                    at,
                )
            })
            .sum()
    }

    pub fn summary(
        &self,
        valuer: Valuer<'_>,
        height: BlockHeight,
        at: Option<UnixSecs>,
        degraded: bool,
    ) -> PoolSummary {
        PoolSummary {
            pool: self.meta.pool.clone(),
            share_token: self.meta.share_token.clone(),
            state: self.state_at(height, valuer.decimals),
            liquidity_usd: self.liquidity_at(valuer, height, at),
            degraded,
        }
    }
}

fn insert_sorted<T>(items: &mut Vec<T>, item: T, key: impl Fn(&T) -> EventPosition) {
    let at = key(&item);
    let index = items.partition_point(|existing| key(existing) <= at);
    items.insert(index, item);
}

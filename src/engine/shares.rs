//! Share supply and per-owner share positions of one pool.

use super::step::{AmountOverflow, RunningTotal};
use crate::domain::{Address, BlockHeight, Decimal, EventPosition};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerLedger {
    /// Shares owned (issued minus burned).
    pub total: RunningTotal<EventPosition>,
    /// Shares held by the incentive contract on the owner's behalf.
    pub staked: RunningTotal<EventPosition>,
}

impl OwnerLedger {
    /// Owned minus staked. Not clamped: withdrawing shares still held by the incentive
    /// contract leaves this negative.
    pub fn unstaked_at(&self, position: &EventPosition) -> Decimal {
        self.total
            .value_at(position)
            .saturating_sub(self.staked.value_at(position))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareLedger {
    supply: RunningTotal<EventPosition>,
    owners: BTreeMap<Address, OwnerLedger>,
}

impl ShareLedger {
    pub fn new() -> Self {
        Self::default()
    }

    // An overflow degrades the pool, so a supply/owner pair left half-updated is never served.
    pub fn issue(
        &mut self,
        position: EventPosition,
        owner: &Address,
        shares: Decimal,
    ) -> Result<(), AmountOverflow> {
        self.supply.add_delta(position, shares)?;
        self.owner_mut(owner).total.add_delta(position, shares)
    }

    pub fn burn(
        &mut self,
        position: EventPosition,
        owner: &Address,
        shares: Decimal,
    ) -> Result<(), AmountOverflow> {
        self.supply.add_delta(position, -shares)?;
        self.owner_mut(owner).total.add_delta(position, -shares)
    }

    pub fn stake(
        &mut self,
        position: EventPosition,
        owner: &Address,
        shares: Decimal,
    ) -> Result<(), AmountOverflow> {
        self.owner_mut(owner).staked.add_delta(position, shares)
    }

    pub fn unstake(
        &mut self,
        position: EventPosition,
        owner: &Address,
        shares: Decimal,
    ) -> Result<(), AmountOverflow> {
        self.owner_mut(owner).staked.add_delta(position, -shares)
    }

    fn owner_mut(&mut self, owner: &Address) -> &mut OwnerLedger {
        self.owners.entry(owner.clone()).or_default()
    }

    pub fn total_supply_at(&self, height: BlockHeight) -> Decimal {
        self.supply.value_at(&EventPosition::end_of(height))
    }

    /// `(total, staked, unstaked)` for `owner`; zeros when nothing is recorded.
    pub fn owner_at(&self, owner: &Address, height: BlockHeight) -> (Decimal, Decimal, Decimal) {
        let position = EventPosition::end_of(height);
        match self.owners.get(owner) {
            Some(ledger) => {
                let total = ledger.total.value_at(&position);
                let staked = ledger.staked.value_at(&position);
                (total, staked, ledger.unstaked_at(&position))
            }
            None => (Decimal::zero(), Decimal::zero(), Decimal::zero()),
        }
    }

    pub fn owners(&self) -> impl Iterator<Item = (&Address, &OwnerLedger)> {
        self.owners.iter()
    }

    pub fn supply(&self) -> &RunningTotal<EventPosition> {
        &self.supply
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(v: i64) -> Decimal {
        Decimal::from_i64(v)
    }

    fn pos(h: i64) -> EventPosition {
        EventPosition::new(BlockHeight::new(h), 0, 0)
    }

    #[test]
    fn test_unknown_owner_is_zero() {
        let ledger = ShareLedger::new();
        let (total, staked, unstaked) =
            ledger.owner_at(&Address::new("nobody"), BlockHeight::new(10));
        assert!(total.is_zero() && staked.is_zero() && unstaked.is_zero());
    }

    #[test]
    fn test_stake_split_and_conservation() {
        let x = Address::new("x");
        let y = Address::new("y");
        let mut ledger = ShareLedger::new();
        ledger.issue(pos(101), &x, d(1000)).unwrap();
        ledger.issue(pos(102), &y, d(300)).unwrap();
        ledger.stake(pos(110), &x, d(1000)).unwrap();

        let (total, staked, unstaked) = ledger.owner_at(&x, BlockHeight::new(110));
        assert_eq!((total, staked, unstaked), (d(1000), d(1000), d(0)));

        ledger.unstake(pos(115), &x, d(500)).unwrap();
        ledger.burn(pos(120), &x, d(500)).unwrap();
        let (total, staked, unstaked) = ledger.owner_at(&x, BlockHeight::new(120));
        assert_eq!((total, staked, unstaked), (d(500), d(500), d(0)));

        for h in [100, 101, 102, 110, 120] {
            let h = BlockHeight::new(h);
            let owned = [&x, &y]
                .into_iter()
                .map(|owner| ledger.owner_at(owner, h).0)
                .try_fold(Decimal::zero(), |acc, v| acc.checked_add(v))
                .unwrap();
            assert_eq!(ledger.total_supply_at(h), owned);
        }
    }

    #[test]
    fn test_split_holds_when_staked_shares_are_burned() {
        let x = Address::new("x");
        let mut ledger = ShareLedger::new();
        ledger.issue(pos(101), &x, d(100)).unwrap();
        ledger.stake(pos(102), &x, d(100)).unwrap();
        ledger.burn(pos(103), &x, d(50)).unwrap();

        let (total, staked, unstaked) = ledger.owner_at(&x, BlockHeight::new(103));
        assert_eq!(total, d(50));
        assert_eq!(unstaked, d(-50));
        assert_eq!(staked.checked_add(unstaked), Some(total));
    }
}

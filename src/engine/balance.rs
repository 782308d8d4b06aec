//! Running per-token reserve balances of one pool.

use super::step::{AmountOverflow, RunningTotal};
use crate::domain::{
    AddLiquidity, BlockHeight, Decimal, Denom, EventPosition, PoolMeta, Swap, TokenRole,
    WithdrawLiquidity,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A swap whose offer/ask tokens are not the two distinct pool tokens.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[error("swap {offer} -> {ask} does not match the pool pair")]
pub struct UnpairedSwap {
    pub offer: Denom,
    pub ask: Denom,
}

/// Why a swap could not be folded into the reserves.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SwapError {
    #[error(transparent)]
    Unpaired(#[from] UnpairedSwap),
    #[error(transparent)]
    Overflow(#[from] AmountOverflow),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceLedger {
    token0: RunningTotal<EventPosition>,
    token1: RunningTotal<EventPosition>,
}

impl BalanceLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn side_mut(&mut self, role: TokenRole) -> &mut RunningTotal<EventPosition> {
        match role {
            TokenRole::Token0 => &mut self.token0,
            TokenRole::Token1 => &mut self.token1,
        }
    }

    pub fn side(&self, role: TokenRole) -> &RunningTotal<EventPosition> {
        match role {
            TokenRole::Token0 => &self.token0,
            TokenRole::Token1 => &self.token1,
        }
    }

    pub fn apply_add(
        &mut self,
        position: EventPosition,
        add: &AddLiquidity,
    ) -> Result<(), AmountOverflow> {
        self.token0.add_delta(position, add.token0_amount)?;
        self.token1.add_delta(position, add.token1_amount)
    }

    pub fn apply_withdraw(
        &mut self,
        position: EventPosition,
        withdraw: &WithdrawLiquidity,
    ) -> Result<(), AmountOverflow> {
        self.token0.add_delta(position, -withdraw.token0_amount)?;
        self.token1.add_delta(position, -withdraw.token1_amount)
    }

    /// Offer side gains `offer_amount`; ask side loses return + commission + fee share.
    ///
    /// # Errors
    /// Returns `SwapError::Unpaired` without touching the ledger when the tokens don't match
    /// the pair, and `SwapError::Overflow` when a reserve total leaves the decimal range.
    pub fn apply_swap(
        &mut self,
        meta: &PoolMeta,
        position: EventPosition,
        swap: &Swap,
    ) -> Result<(), SwapError> {
        let unpaired = || UnpairedSwap {
            offer: swap.offer_token.clone(),
            ask: swap.ask_token.clone(),
        };
        let offer = meta.role_of(&swap.offer_token).ok_or_else(unpaired)?;
        let ask = meta.role_of(&swap.ask_token).ok_or_else(unpaired)?;
        if offer == ask {
            return Err(unpaired().into());
        }

        let outflow = swap.ask_outflow().ok_or(AmountOverflow)?;
        self.side_mut(offer).add_delta(position, swap.offer_amount)?;
        self.side_mut(ask).add_delta(position, -outflow)?;
        Ok(())
    }

    /// Balance of `role` after every event at or before `height`.
    pub fn balance_at(&self, role: TokenRole, height: BlockHeight) -> Decimal {
        self.side(role).value_at(&EventPosition::end_of(height))
    }

    pub fn first_negative(&self, role: TokenRole) -> Option<(EventPosition, Decimal)> {
        self.side(role).first_negative().map(|(k, v)| (*k, v))
    }
}

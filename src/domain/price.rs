use crate::domain::{Decimal, Denom, UnixSecs};
use serde::{Deserialize, Serialize};

/// A USD price of one display unit of `token`, observed at `observed_at`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceObservation {
    pub token: Denom,
    pub price: Decimal,
    pub observed_at: UnixSecs,
}

impl PriceObservation {
    pub fn new(token: Denom, price: Decimal, observed_at: UnixSecs) -> Self {
        PriceObservation {
            token,
            price,
            observed_at,
        }
    }
}

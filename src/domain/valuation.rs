//! USD valuations that stay explicit about missing prices.

use crate::domain::{Decimal, Denom};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A USD amount, or the set of tokens that could not be priced.
///
/// An unpriced token never contributes zero: any sum touching an unknown stays unknown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "ValuationRepr", from = "ValuationRepr")]
pub enum Valuation {
    Known(Decimal),
    Unknown { unpriced: BTreeSet<Denom> },
}

impl Default for Valuation {
    fn default() -> Self {
        Valuation::Known(Decimal::zero())
    }
}

impl Valuation {
    pub fn zero() -> Self {
        Valuation::default()
    }

    pub fn unpriced(token: Denom) -> Self {
        let mut unpriced = BTreeSet::new();
        unpriced.insert(token);
        Valuation::Unknown { unpriced }
    }

    /// `amount * price`, or unknown for `token` when there is no price.
    pub fn of(token: &Denom, amount: Decimal, price: Option<Decimal>) -> Self {
        match price.and_then(|p| amount.checked_mul(p)) {
            Some(usd) => Valuation::Known(usd),
            None => Valuation::unpriced(token.clone()),
        }
    }

    pub fn usd(&self) -> Option<Decimal> {
        match self {
            Valuation::Known(usd) => Some(*usd),
            Valuation::Unknown { .. } => None,
        }
    }

    pub fn is_known(&self) -> bool {
        matches!(self, Valuation::Known(_))
    }

    /// Sum of two valuations. A known sum that leaves the decimal range is unknown with no
    /// unpriced token named.
    pub fn add(&self, other: &Valuation) -> Valuation {
        match (self, other) {
            (Valuation::Known(a), Valuation::Known(b)) => match a.checked_add(*b) {
                Some(sum) => Valuation::Known(sum),
                None => Valuation::Unknown {
                    unpriced: BTreeSet::new(),
                },
            },
            (Valuation::Known(_), Valuation::Unknown { unpriced })
            | (Valuation::Unknown { unpriced }, Valuation::Known(_)) => Valuation::Unknown {
                unpriced: unpriced.clone(),
            },
            (Valuation::Unknown { unpriced: a }, Valuation::Unknown { unpriced: b }) => {
                Valuation::Unknown {
                    unpriced: a.union(b).cloned().collect(),
                }
            }
        }
    }
}

impl std::iter::Sum for Valuation {
    fn sum<I: Iterator<Item = Valuation>>(iter: I) -> Self {
        iter.fold(Valuation::zero(), |acc, v| acc.add(&v))
    }
}

/// Wire shape: `{"usd": "1.5" | null, "unpricedTokens": [...]}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ValuationRepr {
    usd: Option<Decimal>,
    #[serde(default)]
    unpriced_tokens: Vec<Denom>,
}

impl From<Valuation> for ValuationRepr {
    fn from(value: Valuation) -> Self {
        match value {
            Valuation::Known(usd) => ValuationRepr {
                usd: Some(usd),
                unpriced_tokens: Vec::new(),
            },
            Valuation::Unknown { unpriced } => ValuationRepr {
                usd: None,
                unpriced_tokens: unpriced.into_iter().collect(),
            },
        }
    }
}

impl From<ValuationRepr> for Valuation {
    fn from(repr: ValuationRepr) -> Self {
        match repr.usd {
            Some(usd) => Valuation::Known(usd),
            None => Valuation::Unknown {
                unpriced: repr.unpriced_tokens.into_iter().collect(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> Decimal {
        Decimal::from_str_canonical(s).unwrap()
    }

    #[test]
    fn test_unknown_is_sticky() {
        let total = Valuation::Known(d("10"))
            .add(&Valuation::unpriced(Denom::new("astro")))
            .add(&Valuation::Known(d("5")));
        assert!(!total.is_known());
        assert_eq!(total.usd(), None);
    }

    #[test]
    fn test_unknowns_union_tokens() {
        let total: Valuation = vec![
            Valuation::unpriced(Denom::new("b")),
            Valuation::Known(d("1")),
            Valuation::unpriced(Denom::new("a")),
        ]
        .into_iter()
        .sum();
        match total {
            Valuation::Unknown { unpriced } => {
                let tokens: Vec<&str> = unpriced.iter().map(|d| d.as_str()).collect();
                assert_eq!(tokens, vec!["a", "b"]);
            }
            Valuation::Known(_) => panic!("expected unknown"),
        }
    }

    #[test]
    fn test_sum_out_of_range_is_unknown() {
        let max = Valuation::Known(Decimal::from(rust_decimal::Decimal::MAX));
        let total = max.add(&Valuation::Known(d("1")));
        assert_eq!(
            total,
            Valuation::Unknown {
                unpriced: BTreeSet::new()
            }
        );
    }

    #[test]
    fn test_of_without_price_is_unknown_not_zero() {
        let v = Valuation::of(&Denom::new("astro"), d("100"), None);
        assert_eq!(v, Valuation::unpriced(Denom::new("astro")));
        let v = Valuation::of(&Denom::new("uluna"), d("100"), Some(d("0.5")));
        assert_eq!(v.usd(), Some(d("50")));
    }

    #[test]
    fn test_json_shape() {
        let known = serde_json::to_value(Valuation::Known(d("12.5"))).unwrap();
        assert_eq!(known["usd"], "12.5");
        assert_eq!(known["unpricedTokens"].as_array().unwrap().len(), 0);

        let unknown = serde_json::to_value(Valuation::unpriced(Denom::new("astro"))).unwrap();
        assert!(unknown["usd"].is_null());
        assert_eq!(unknown["unpricedTokens"][0], "astro");

        let back: Valuation = serde_json::from_value(unknown).unwrap();
        assert_eq!(back, Valuation::unpriced(Denom::new("astro")));
    }
}

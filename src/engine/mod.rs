//! Pure computation engine(s) for deterministic pool accounting.
//!
//! Nothing in here touches I/O. Every structure is keyed by ordered maps so the same set of
//! events produces the same state regardless of arrival order.

pub mod balance;
pub mod prices;
pub mod projection;
pub mod registry;
pub mod shares;
pub mod step;
pub mod yields;

pub use balance::{BalanceLedger, SwapError, UnpairedSwap};
pub use prices::{BlockClock, PriceBook};
pub use projection::{FeeRecord, PoolFault, PoolProjection, PoolSummary, ScheduleRecord, Valuer};
pub use registry::{DuplicatePool, PoolRegistry};
pub use shares::{OwnerLedger, ShareLedger};
pub use step::{AmountOverflow, RunningTotal, StepFunction};
pub use yields::{compute_yields, daily_yields, reclose_last, DailyYield, IntervalClose, YieldSnapshot};

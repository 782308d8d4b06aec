pub mod api;
pub mod compile;
pub mod config;
pub mod datasource;
pub mod db;
pub mod domain;
pub mod engine;
pub mod error;
pub mod orchestration;
pub mod query;

pub use compile::{EngineSnapshot, RefreshSettings, Refresher, SnapshotHandle};
pub use config::Config;
pub use datasource::{EventFeed, EventSource, EventSourceError, MockEventSource, PriceSource};
pub use db::{init_db, Repository};
pub use domain::{
    Address, BlockHeight, ChainId, Decimal, Denom, EventKey, LedgerEvent, PoolId, UnixSecs,
    Valuation,
};
pub use error::AppError;
pub use query::{Answer, QueryError, QuerySurface};

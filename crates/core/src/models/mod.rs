//! Shared data models for the trading agent

mod candidate;
mod market;
mod order;
mod position;

pub use candidate::{Candidate, Verdict};
pub use market::{Candle, Fundamentals, IndicatorSnapshot, Interval, PriceSource, Quote};
pub use order::{
    BrokerOrder, Holding, OrderAck, OrderRequest, OrderSide, OrderStatus, OrderType, OrderVariety,
};
pub use position::{
    EntryKind, ExitDetail, ExitReason, FailedOrder, Fill, LevelState, Position, PositionStatus,
    RsiLevel,
};

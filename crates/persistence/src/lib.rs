//! Neodip Persistence - position ledger, scrip-master day cache, fundamentals cache

pub mod fundamentals;
pub mod ledger;
pub mod scrip;

pub use fundamentals::FundamentalsCache;
pub use ledger::TradeStore;
pub use scrip::ScripMasterStore;

//! Neodip Engine - trade lifecycle: entries, exits, reconciliation, scheduling

pub mod candidates;
pub mod entry;
pub mod exit;
pub mod reconcile;
pub mod runtime;
pub mod scheduler;

#[cfg(test)]
pub(crate) mod testutil;

pub use entry::EntryEngine;
pub use exit::ExitEngine;
pub use reconcile::Reconciler;
pub use runtime::Runtime;
pub use scheduler::{DayTask, TradingCalendar};

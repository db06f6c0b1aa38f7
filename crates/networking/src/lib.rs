//! Neodip Networking - broker client, session guard, call pipeline, live prices

pub mod api;
pub mod history;
pub mod http;
pub mod live;
pub mod market;
pub mod paper;
pub mod pipeline;
pub mod session;

pub use api::{BrokerApi, SessionToken};
pub use http::KotakNeoClient;
pub use market::{MarketData, MarketDataService};
pub use paper::PaperBroker;
pub use pipeline::{CallPipeline, CircuitBreaker, RateLimiter, RetryPolicy};
pub use session::SessionGuard;

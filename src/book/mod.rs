//! Order book replication: the scaled-price primitive, the per-symbol
//! replication state, and the engine driving both.

pub mod engine;
pub mod price;
pub mod state;

pub use engine::LoaderService;
pub use price::ScaledPrice;
pub use state::{BookState, DepthLedger};

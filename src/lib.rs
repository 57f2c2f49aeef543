pub mod backfill;
pub mod book;
pub mod config;
pub mod error;
pub mod exchange;
pub mod record;
pub mod sink;

pub use book::{BookState, DepthLedger, LoaderService, ScaledPrice};
pub use config::AppConfig;
pub use error::{DepthcastError, Result};
pub use sink::SinkDispatcher;

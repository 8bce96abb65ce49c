pub mod connection;
pub mod error;
pub mod pool_manager;
pub mod stats;

pub use connection::*;
pub use error::*;
pub use pool_manager::{PoolHandle, PoolManager, PoolState, PooledConnectionEntry, SweepReport};
pub use stats::{ESTIMATED_BYTES_PER_POOL, PoolStatsSnapshot};

pub mod eviction;
pub mod pool;

pub use pool::{Mempool, MempoolEntry, MempoolStats};

pub mod block;
pub mod chain;
pub mod consensus;
pub mod contracts;
pub mod producer;
pub mod validation;

pub use block::{Block, BlockHeader};
pub use chain::{BlockDisposition, BlockRef, Blockchain, ChainStats};
pub use producer::CancelToken;

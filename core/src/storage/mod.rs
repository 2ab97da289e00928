pub mod files;
pub mod index;

pub use files::{BlockStore, PersistedState};
pub use index::{BlockIndex, IndexEntry, IndexStats};

//! Configuration for a mirror run.

mod types;

pub use types::{MirrorConfig, QuiescenceSettings};

//! Resource and API capture.
//!
//! Both capture paths feed the shared registries: assets passively from
//! observed responses and actively through out-of-band downloads, API traffic
//! from programmatic requests.

pub mod api;
pub mod assets;

pub use assets::AssetFetcher;

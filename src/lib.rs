pub mod backend;
pub mod capture;
pub mod cli;
pub mod config;
pub mod frontier;
pub mod mirror;
pub mod output;
pub mod registry;
pub mod replace;
pub mod replay;
pub mod rewrite;
pub mod scheduler;
pub mod utils;

pub use backend::{BrowserBackend, NetworkEvent, PageSession};
pub use capture::api::{ApiRecord, ApiRegistry, StoreApiSpec};
pub use config::MirrorConfig;
pub use frontier::{Frontier, Scope};
pub use mirror::{MirrorSummary, run};
pub use registry::Registries;
pub use replace::ReplacementRule;

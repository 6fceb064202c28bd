pub mod alerts;
pub mod api;
pub mod cache;
pub mod config;
pub mod notifiers;
pub mod policy;
pub mod probes;
pub mod scheduler;
pub mod storage;
pub mod supervisor;
pub mod util;

pub use config::{Chunk, RunOptions, Settings};
pub use probes::ProbeResult;
pub use storage::schema::MonitorItem;

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

pub mod common;
pub mod config;
pub mod error;
pub mod geometry;
pub mod geoparquet;
pub mod key;
pub mod merge;
pub mod pipeline;
pub mod population;
pub mod schema;
pub mod spatial;
pub mod storage;
pub mod validate;

pub use common::{RegionCode, RegionLookup};
pub use config::PipelineConfig;
pub use error::{ErrorKind, PipelineError};
pub use pipeline::{Pipeline, PipelineReport};

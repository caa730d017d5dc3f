//! Multiresolution pyramids of 3-D volumes, written into zarr stores by pools
//! of worker processes.
pub mod aggregate;
pub mod chunk;
pub mod codec;
pub mod config;
pub mod convert;
mod error;
pub mod metadata;
pub mod pool;
pub mod precomputed;
pub mod pyramid;
pub mod source;
pub mod storage;
pub mod writer;

pub use zarrs;

pub use error::{Error, Result, WorkerFailure};

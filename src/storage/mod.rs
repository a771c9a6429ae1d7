//! Object-store backends

pub mod memory;
pub mod plan;
pub mod retry;
pub mod s3;
pub mod traits;

pub use memory::MemoryStore;
pub use plan::UploadPlan;
pub use s3::S3Store;
pub use traits::{ObjectStore, PayloadReader, StoreError};

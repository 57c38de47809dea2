//! On-demand firmware builds: request dedup, trusted toolchain bootstrap and
//! content-addressed image storage.

pub mod catalog;
pub mod config;
pub mod error;
pub mod executor;
pub mod hashing;
pub mod imagebuilder;
pub mod jobs;
pub mod orchestrator;
pub mod provenance;
pub mod request;
pub mod service;
pub mod singleflight;
pub mod toolchain;
pub mod upstream;
pub mod usign;

pub use catalog::{Catalog, Target, VersionCatalog};
pub use config::Config;
pub use error::{BuildFailure, ValidationError};
pub use executor::{BuildArtifact, BuildExecutor, BuildRunner};
pub use jobs::{Job, JobFailure, JobQueue, JobState, MemoryQueue, Retention};
pub use orchestrator::{spawn_workers, Orchestrator, Submission};
pub use request::{fingerprint, normalize, BuildRequest, NormalizedRequest, RequestFingerprint};
pub use service::Service;
pub use toolchain::{Bootstrapper, Toolchain, ToolchainKey, ToolchainSource};

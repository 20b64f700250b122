// ABOUTME: Type-safe identifiers and validated domain types.
// ABOUTME: Workload IDs, revisions, artifact references, and phantom-typed IDs.

mod artifact;
mod id;
mod workload_id;

pub use artifact::{ArtifactError, ArtifactRef, Digest, Revision};
pub(crate) use artifact::validate_repository;
pub use id::{Id, ReplicaId, RunId};
pub use workload_id::{WorkloadId, WorkloadIdError};

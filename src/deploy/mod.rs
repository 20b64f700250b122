// ABOUTME: Deployment runs: the resumable state machine, its persisted records, and locking.
// ABOUTME: Exports the run model, the store, the per-workload lock, and the error taxonomy.

mod error;
mod lock;
mod machine;
mod run;
mod store;

pub use error::{DeployError, DeployErrorKind, FailureReason};
pub use lock::{LockHolderInfo, WorkloadLock, WorkloadLocks, holder_is_dead};
pub use machine::{MachineConfig, StateMachine, request_abort};
pub use run::{DeploymentRun, RunState, RunStatus, StateChange, settled_artifact};
pub use store::{FileRunStore, MemoryRunStore, Rejection, RunStore, StoreError};

pub mod archive;
pub mod capture;
pub mod coordinator;
pub mod job;
pub mod locks;
pub mod models;
pub mod notifications;
pub mod orchestrator;
pub mod progress;
pub mod registry;
pub mod retention;
pub mod retry;
pub mod runtime;
pub mod scheduler;
pub mod storage;
pub mod verifier;

pub use archive::ArchiveBuilder;
pub use coordinator::{Admission, JobCoordinator, RejectReason, ShutdownReport, TriggerSource};
pub use job::JobRunner;
pub use locks::TargetLocks;
pub use models::{Archive, BackupTarget, ContainerRef, ContainerState, Job, JobOutcome, JobPhase};
pub use orchestrator::Orchestrator;
pub use progress::{ActiveJob, JobTracker};
pub use registry::TargetRegistry;
pub use runtime::ContainerRuntime;
pub use scheduler::{Scheduler, UpcomingFire};
pub use storage::StorageSink;
pub use verifier::{VerifyResult, verify_archive};

pub mod exchange;
pub mod job;
pub mod progress;
pub mod queue;

pub use exchange::{ClaimState, ClaimStateHandle, ClaimedPackage, ExchangeClaimer};
pub use job::{ExecutionResult, JobStatus, WorkItem};
pub use progress::{CompletionTracker, PackageProgress};
pub use queue::WorkQueue;

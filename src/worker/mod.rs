//! Local execution of claimed jobs.
//!
//! - [`TaskExecutor`]: runs one simulated job and reports progress to the store
//! - [`WorkerPool`]: supervisor that starts and cancels consumer loops
//! - [`ScaleSignals`]: store-driven add/cancel requests for the pool
//!
//! # Execution Flow
//!
//! 1. The claim protocol enqueues work items and calls
//!    [`WorkerPoolHandle::request_add`]
//! 2. Each consumer loop waits on the work queue
//! 3. [`TaskExecutor::execute`] sleeps one step per cycle, writing the remaining count
//! 4. The progress field is deleted and the result goes to the optional observer

pub mod executor;
pub mod pool;
pub mod signals;

pub use executor::TaskExecutor;
pub use pool::{compute_workers, WorkerPool, WorkerPoolHandle};
pub use signals::ScaleSignals;

//! Job scheduling on a pool of worker threads.
//!
//! Jobs are pushed into a [`Pipeline`] and consumed by the workers of a
//! [`MainLoop`]. A failing job is retried at the tail of the pipeline
//! until its attempt budget is exhausted.
//!
//! # Main Components
//!
//! - [`Job`] - A named action with an attempt budget and optional data
//! - [`Pipeline`] - Bounded FIFO with priority insertion, pause and drain
//! - [`MainLoop`] - Resizable worker pool with progress counters
//! - [`LoopHandle`] - Cloneable submission handle, also given to running jobs
//!
//! # Example
//!
//! ```rust,no_run
//! use rnfleet::workqueue::{Job, MainLoop};
//!
//! let main_loop = MainLoop::new(2);
//! let id = main_loop
//!     .enqueue(Job::new(|ctx| {
//!         println!("running {}", ctx.name());
//!         Ok(())
//!     }))
//!     .unwrap();
//! main_loop.wait_for(id);
//! main_loop.shutdown(false);
//! ```

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock};
use std::thread::{self, JoinHandle};

use log::{debug, error, info, trace, warn};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::FleetError;
use crate::logger::JobEvent;

pub use job::{Job, JobAction, JobContext, JobData, JobStatus};
pub use mainloop::{FailureReport, JobObserver, LoopHandle, MainLoop, Progress};
pub use pipeline::Pipeline;

/// Process-unique job identifier.
pub type JobId = u64;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

mod job;
mod mainloop;
mod pipeline;

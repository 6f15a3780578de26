//! # rnfleet - Concurrent Session Automation for Network Device Fleets
//!
//! `rnfleet` runs scripted sessions against many network devices at once.
//! Jobs are scheduled on a pool of worker threads, each job borrows an
//! account from a shared credential pool, and every session recognizes the
//! device it talks to from its banner and prompts.
//!
//! ## Features
//!
//! - **Worker Pool**: Resizable thread pool with retries, priorities and pausing
//! - **Credential Pools**: Exclusive, round-robin account checkout with owner tags
//! - **Device Recognition**: Scored drivers and a confidence-based OS guesser
//! - **Prompt Matching**: Regex monitors over a streaming receive buffer
//! - **Event Recording**: Per-job lifecycle events and transcripts, exportable as JSONL
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use rnfleet::account::Account;
//! use rnfleet::config::QueueConfig;
//! use rnfleet::connection::{VirtualConnector, VirtualDevice};
//! use rnfleet::queue::Queue;
//!
//! fn main() -> Result<(), rnfleet::error::FleetError> {
//!     // Any `Connector` works here; the virtual one emulates a device.
//!     let connector = VirtualConnector::new(|host| {
//!         let mut device = VirtualDevice::new(host.name()).with_strict(false);
//!         device.add_response("^show version$", "Virtual IOS 15.2")?;
//!         Ok(device)
//!     });
//!
//!     let queue = Queue::new(connector, QueueConfig::default().with_max_threads(4))?;
//!     queue.add_account(Account::new("admin", "secret"));
//!
//!     queue.run(["r1", "r2", "r3"], |_, host, session| {
//!         let output = session.execute("show version")?;
//!         println!("{}: {}", host.name(), output);
//!         Ok(())
//!     }, Some(3))?;
//!
//!     queue.join();
//!     println!("{:?}", queue.progress());
//!     Ok(())
//! }
//! ```
//!
//! ## Main Components
//!
//! - [`queue::Queue`] - Runs actions against hosts on a worker pool
//! - [`workqueue::MainLoop`] - The worker pool and its [`workqueue::Pipeline`]
//! - [`account::AccountPool`] - Thread-safe credential pool
//! - [`session::Session`] - Login, prompt detection and command execution
//! - [`driver::DriverRegistry`] - Device family drivers ranked by banner score
//! - [`guesser::OsGuesser`] - Confidence-scored OS detection
//! - [`buffer::MonitoredBuffer`] - Receive buffer with regex monitors
//! - [`error::FleetError`] - Error types for all operations
//! - [`config`] - Defaults and queue configuration

pub mod account;
pub mod buffer;
pub mod config;
pub mod connection;
pub mod driver;
pub mod error;
pub mod guesser;
pub mod host;
pub mod logger;
pub mod queue;
pub mod session;
pub mod templates;
pub mod workqueue;

pub use account::{Account, AccountPool};
pub use error::FleetError;
pub use host::Host;
pub use queue::{Queue, Task};
pub use session::Session;

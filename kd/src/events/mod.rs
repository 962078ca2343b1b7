//! Run events
//!
//! A run (one BuildTarget or InvokeAction request) publishes [`ActionEvent`]s
//! into its own [`ActionRun`] history. Observers replay that history in order;
//! the [`EventBus`] fans every event out to daemon-wide consumers such as the
//! JSONL [`EventLogger`].
//!
//! ```text
//!   rule bodies ──ProgressLogger──▶ ActionRun ──▶ RunObserver (stream clients)
//!                                       │
//!                                       └──▶ EventBus ──▶ EventLogger (.jsonl)
//! ```

mod bus;
mod logger;
mod run;
mod types;

pub use bus::{DEFAULT_CHANNEL_CAPACITY, EventBus};
pub use logger::{EventLogger, read_run_events, spawn_event_logger};
pub use run::{ActionRun, ProgressLogger, RunObserver};
pub use types::{ActionEvent, EventLogEntry, ProgressLevel};

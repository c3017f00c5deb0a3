//! `chronik-scheduler` — persistent recurring-job scheduler on Tokio and SQLite.
//!
//! # Overview
//!
//! Jobs are stored in a SQLite `jobs` table and armed in an in-process
//! [`engine::RecurrenceEngine`]. The [`Controller`] keeps the two in
//! agreement: every mutation either lands in both or in neither, and a
//! restarted process re-arms every active job from the store.
//!
//! # Recurrence forms
//!
//! | Form                  | Example            | Fires                          |
//! |-----------------------|--------------------|--------------------------------|
//! | `@every <duration>`   | `@every 1h30m`     | Fixed interval, at least 1s    |
//! | Descriptor            | `@daily`           | Start of each period (UTC)     |
//! | 5-field cron          | `*/5 * * * *`      | Minute granularity, second 0   |
//! | 6/7-field cron        | `0 30 9 * * Mon`   | Second granularity             |
//!
//! # Behaviors
//!
//! What a job does is a [`Behavior`]: a serde type with a stable tag,
//! registered in a [`BehaviorRegistry`] so stored jobs can be rebuilt after
//! a restart.

pub mod codec;
pub mod controller;
pub mod db;
pub mod engine;
pub mod error;
pub mod recurrence;
pub mod repository;
pub mod scheduler;
pub mod types;

pub use codec::{Behavior, BehaviorRegistry, Codec, InputValue};
pub use controller::Controller;
pub use error::{Result, SchedulerError};
pub use recurrence::Recurrence;
pub use repository::{JobRepository, SqliteJobRepository};
pub use types::{
    EngineHandle, ExtraInput, JobDefinition, JobId, JobInfo, PersistedRecord, RunInput,
    ScheduleUpdate,
};

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::codec::behavior::{Behavior, DynBehavior};
use crate::codec::value::InputValue;
use crate::recurrence::Recurrence;

/// Caller-chosen job identity. Also used for group and super-group ids.
pub type JobId = i64;

/// Open keyed input handed to a behavior at every firing.
pub type ExtraInput = BTreeMap<String, InputValue>;

/// Opaque token naming one registration inside the recurrence engine.
///
/// UUIDs rather than counters: a handle persisted by an earlier process can
/// never alias a live registration in this one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EngineHandle(Uuid);

impl EngineHandle {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EngineHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EngineHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for EngineHandle {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// What a caller submits to [`crate::Controller::add_jobs`].
#[derive(Clone)]
pub struct JobDefinition {
    pub id: JobId,
    pub group_id: JobId,
    pub super_group_id: JobId,
    /// Canonical recurrence expression, see [`Recurrence::parse`].
    pub recurrence: String,
    pub behavior: Arc<dyn DynBehavior>,
    pub extra: ExtraInput,
}

impl JobDefinition {
    pub fn new<B: Behavior>(id: JobId, recurrence: impl Into<String>, behavior: B) -> Self {
        Self {
            id,
            group_id: 0,
            super_group_id: 0,
            recurrence: recurrence.into(),
            behavior: Arc::new(behavior),
            extra: ExtraInput::new(),
        }
    }

    /// Integer form of the recurrence, lowered to `@every Ns`.
    pub fn every_secs<B: Behavior>(id: JobId, secs: u64, behavior: B) -> Self {
        Self::new(id, Recurrence::every_secs_expression(secs), behavior)
    }

    pub fn with_group(mut self, group_id: JobId, super_group_id: JobId) -> Self {
        self.group_id = group_id;
        self.super_group_id = super_group_id;
        self
    }

    pub fn with_input(mut self, key: impl Into<String>, value: impl Into<InputValue>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }
}

impl fmt::Debug for JobDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobDefinition")
            .field("id", &self.id)
            .field("group_id", &self.group_id)
            .field("super_group_id", &self.super_group_id)
            .field("recurrence", &self.recurrence)
            .field("behavior", &self.behavior.tag())
            .field("extra", &self.extra)
            .finish()
    }
}

/// Durable projection of a job, one row of the `jobs` table.
#[derive(Debug, Clone, PartialEq)]
pub struct PersistedRecord {
    pub id: JobId,
    pub group_id: JobId,
    pub super_group_id: JobId,
    pub recurrence: String,
    pub paused: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Informational only: the scheduler overwrites it on every (re)arm.
    pub engine_handle: Option<EngineHandle>,
    pub behavior_payload: Vec<u8>,
    pub input_payload: Vec<u8>,
}

/// Value passed to [`Behavior::run`] at every firing.
#[derive(Debug, Clone, PartialEq)]
pub struct RunInput {
    pub job_id: JobId,
    pub group_id: JobId,
    pub super_group_id: JobId,
    pub extra: ExtraInput,
}

impl RunInput {
    pub fn get(&self, key: &str) -> Option<&InputValue> {
        self.extra.get(key)
    }
}

/// A record plus everything needed to arm it: parsed rule, live behavior
/// and the input it fires with. Transient, never persisted.
#[derive(Clone)]
pub struct RunnableJob {
    pub(crate) record: PersistedRecord,
    pub(crate) recurrence: Recurrence,
    pub(crate) behavior: Arc<dyn DynBehavior>,
    pub(crate) input: Arc<RunInput>,
}

impl RunnableJob {
    pub fn id(&self) -> JobId {
        self.record.id
    }

    pub fn record(&self) -> &PersistedRecord {
        &self.record
    }

    pub fn into_record(self) -> PersistedRecord {
        self.record
    }

    pub fn recurrence(&self) -> &Recurrence {
        &self.recurrence
    }

    pub fn input(&self) -> &RunInput {
        &self.input
    }

    pub fn behavior_tag(&self) -> &'static str {
        self.behavior.tag()
    }

    pub fn handle(&self) -> Option<EngineHandle> {
        self.record.engine_handle
    }
}

impl fmt::Debug for RunnableJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunnableJob")
            .field("record", &self.record)
            .field("recurrence", &self.recurrence)
            .field("behavior", &self.behavior.tag())
            .field("input", &self.input)
            .finish()
    }
}

/// New recurrence for one job, see [`crate::Controller::update_schedule`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleUpdate {
    pub job_id: JobId,
    pub recurrence: String,
}

impl ScheduleUpdate {
    pub fn new(job_id: JobId, recurrence: impl Into<String>) -> Self {
        Self {
            job_id,
            recurrence: recurrence.into(),
        }
    }
}

/// Read-only, decoded view of a stored job.
#[derive(Debug, Clone, PartialEq)]
pub struct JobInfo {
    pub id: JobId,
    pub group_id: JobId,
    pub super_group_id: JobId,
    pub recurrence: String,
    pub paused: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub engine_handle: Option<EngineHandle>,
    pub behavior: String,
    pub extra: ExtraInput,
}

pub(crate) fn ids_of(records: &[PersistedRecord]) -> Vec<JobId> {
    records.iter().map(|r| r.id).collect()
}

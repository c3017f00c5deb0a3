//! Conversion between stored records and runnable jobs.

pub mod behavior;
pub mod value;

use std::sync::Arc;

use chrono::Utc;

use crate::error::Result;
use crate::recurrence::Recurrence;
use crate::types::{JobDefinition, JobInfo, PersistedRecord, RunInput, RunnableJob};

pub use behavior::{Behavior, BehaviorRegistry, DynBehavior};
pub use value::InputValue;

/// Encodes and decodes jobs against a fixed set of registered behaviors.
///
/// Cheap to clone; the registry is shared.
#[derive(Clone)]
pub struct Codec {
    registry: Arc<BehaviorRegistry>,
}

impl Codec {
    pub fn new(registry: BehaviorRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
        }
    }

    pub fn registry(&self) -> &BehaviorRegistry {
        &self.registry
    }

    /// Build a runnable job from a fresh definition: parse its recurrence and
    /// fill in both payloads. The record is unpaused and carries no handle.
    pub fn prepare(&self, def: JobDefinition) -> Result<RunnableJob> {
        let recurrence = Recurrence::parse(&def.recurrence)?;
        let behavior_payload = self.registry.encode(def.behavior.as_ref())?;
        let input_payload = value::encode_input(&def.extra)?;
        let now = Utc::now();

        Ok(RunnableJob {
            record: PersistedRecord {
                id: def.id,
                group_id: def.group_id,
                super_group_id: def.super_group_id,
                recurrence: recurrence.expression().to_string(),
                paused: false,
                created_at: now,
                updated_at: now,
                engine_handle: None,
                behavior_payload,
                input_payload,
            },
            recurrence,
            behavior: def.behavior,
            input: Arc::new(RunInput {
                job_id: def.id,
                group_id: def.group_id,
                super_group_id: def.super_group_id,
                extra: def.extra,
            }),
        })
    }

    /// Serialize the live behavior and input back into a record.
    pub fn encode(&self, job: &RunnableJob) -> Result<PersistedRecord> {
        let mut record = job.record.clone();
        record.recurrence = job.recurrence.expression().to_string();
        record.behavior_payload = self.registry.encode(job.behavior.as_ref())?;
        record.input_payload = value::encode_input(&job.input.extra)?;
        Ok(record)
    }

    /// Rebuild a runnable job from a stored record.
    pub fn decode(&self, record: &PersistedRecord) -> Result<RunnableJob> {
        let recurrence = Recurrence::parse(&record.recurrence)?;
        let behavior = self.registry.decode(&record.behavior_payload)?;
        let extra = value::decode_input(&record.input_payload)?;

        Ok(RunnableJob {
            record: record.clone(),
            recurrence,
            behavior,
            input: Arc::new(RunInput {
                job_id: record.id,
                group_id: record.group_id,
                super_group_id: record.super_group_id,
                extra,
            }),
        })
    }

    /// Copy of `job` firing on a new recurrence. Behavior and input are
    /// shared with the original; the handle is carried over unchanged.
    pub fn reschedule(&self, job: &RunnableJob, expression: &str) -> Result<RunnableJob> {
        let recurrence = Recurrence::parse(expression)?;
        let mut record = job.record.clone();
        record.recurrence = recurrence.expression().to_string();
        record.updated_at = Utc::now();
        Ok(RunnableJob {
            record,
            recurrence,
            behavior: Arc::clone(&job.behavior),
            input: Arc::clone(&job.input),
        })
    }

    /// Decoded, read-only view of a record. The recurrence is not parsed,
    /// so a job stored with a bad expression can still be inspected.
    pub fn describe(&self, record: &PersistedRecord) -> Result<JobInfo> {
        let behavior = behavior::payload_tag(&record.behavior_payload)?;
        let extra = value::decode_input(&record.input_payload)?;
        Ok(JobInfo {
            id: record.id,
            group_id: record.group_id,
            super_group_id: record.super_group_id,
            recurrence: record.recurrence.clone(),
            paused: record.paused,
            created_at: record.created_at,
            updated_at: record.updated_at,
            engine_handle: record.engine_handle,
            behavior: behavior.to_string(),
            extra,
        })
    }
}

//! Durable store access. The only layer that touches storage.

mod sqlite;

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{JobId, PersistedRecord};

pub use sqlite::SqliteJobRepository;

/// Storage contract the controller relies on.
///
/// Every batch method is all-or-nothing: a failure part-way through leaves
/// the store exactly as it was before the call.
#[async_trait]
pub trait JobRepository: Send + Sync {
    /// All records with `paused = false`.
    async fn load_active(&self) -> Result<Vec<PersistedRecord>>;

    /// Every record, paused or not, ordered by id.
    async fn load_all(&self) -> Result<Vec<PersistedRecord>>;

    /// Records for `ids` in request order, duplicates collapsed. Fails with
    /// `NotFound` naming every missing id.
    async fn load_by_ids(&self, ids: &[JobId]) -> Result<Vec<PersistedRecord>>;

    async fn insert(&self, records: &[PersistedRecord]) -> Result<()>;

    async fn delete(&self, ids: &[JobId]) -> Result<()>;

    /// Set `paused` and bump `updated_at`. Fails with `NotFound` if any id
    /// is missing.
    async fn set_paused(&self, ids: &[JobId], paused: bool) -> Result<()>;

    /// Write each record's engine handle and recurrence, bumping
    /// `updated_at`. Fails with `NotFound` if any row is missing.
    async fn set_handle_and_schedule(&self, records: &[PersistedRecord]) -> Result<()>;
}

/// `ids` with duplicates removed, first occurrence kept.
pub(crate) fn dedup_ids(ids: &[JobId]) -> Vec<JobId> {
    let mut seen = std::collections::HashSet::with_capacity(ids.len());
    ids.iter().copied().filter(|id| seen.insert(*id)).collect()
}

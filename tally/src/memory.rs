//! Volatile in-memory metric store.
//!
//! Records live in an append-only vector with a `(kind, id) -> position`
//! index. One mutex guards both and is held for the whole of every
//! operation, so operations never interleave. Every record handed out is a
//! clone.
//!
//! [`crate::file::FileStore`] builds on this type for its in-memory state.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::error::{Result, TallyError};
use crate::metric::{Metric, MetricKey, MetricRequest};
use crate::repository::Repository;

/// In-memory [`Repository`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    records: Vec<Metric>,
    index: HashMap<MetricKey, usize>,
}

impl MemoryState {
    fn get(&self, key: &MetricKey) -> Option<&Metric> {
        self.index.get(key).map(|&pos| &self.records[pos])
    }

    fn insert(&mut self, record: Metric) -> usize {
        let key = record.key();
        self.records.push(record);
        let pos = self.records.len() - 1;
        self.index.insert(key, pos);
        pos
    }

    fn replace_fields(&mut self, pos: usize, request: &MetricRequest) -> Metric {
        let record = &mut self.records[pos];
        record.apply(request);
        record.clone()
    }

    fn upsert(&mut self, request: &MetricRequest) -> Metric {
        match self.index.get(&request.key()) {
            Some(&pos) => self.replace_fields(pos, request),
            None => {
                let pos = self.insert(Metric::from(request));
                self.records[pos].clone()
            }
        }
    }
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the store's contents wholesale.
    ///
    /// This bypasses create/update semantics and is used when restoring a
    /// snapshot. If `records` holds the same key twice the later record wins.
    pub fn fill(&self, records: Vec<Metric>) {
        let mut state = self.lock();
        state.records.clear();
        state.index.clear();
        for record in records {
            let existing = state.index.get(&record.key()).copied();
            match existing {
                Some(pos) => state.records[pos] = record,
                None => {
                    state.insert(record);
                }
            }
        }
    }

    /// Drops every record.
    pub fn reset(&self) {
        let mut state = self.lock();
        state.records.clear();
        state.index.clear();
    }

    /// Returns the number of stored records.
    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    /// Returns `true` if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A panic while the lock is held cannot leave a half-written record:
    /// every mutation completes before anything fallible runs.
    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Repository for MemoryStore {
    fn find(&self, key: &MetricKey) -> Result<Metric> {
        self.lock()
            .get(key)
            .cloned()
            .ok_or_else(|| TallyError::NotFound { key: key.clone() })
    }

    fn find_all(&self) -> Result<Vec<Metric>> {
        Ok(self.lock().records.clone())
    }

    fn find_batch(&self, keys: &[MetricKey]) -> Result<Vec<Metric>> {
        let state = self.lock();
        Ok(keys.iter().filter_map(|key| state.get(key).cloned()).collect())
    }

    fn create(&self, request: &MetricRequest) -> Result<Metric> {
        let key = request.key();
        let mut state = self.lock();
        if state.index.contains_key(&key) {
            return Err(TallyError::AlreadyExists { key });
        }
        let pos = state.insert(Metric::from(request));
        Ok(state.records[pos].clone())
    }

    fn update(&self, request: &MetricRequest) -> Result<Metric> {
        let key = request.key();
        let mut state = self.lock();
        let pos = *state
            .index
            .get(&key)
            .ok_or(TallyError::NotFound { key: key.clone() })?;
        Ok(state.replace_fields(pos, request))
    }

    fn create_or_update_batch(&self, requests: &[MetricRequest]) -> Result<Vec<Metric>> {
        let mut state = self.lock();
        Ok(requests.iter().map(|request| state.upsert(request)).collect())
    }
}

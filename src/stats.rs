use std::sync::Arc;

use parking_lot::Mutex;

use crate::models::domain::BurstRecord;

/// Append-only store of burst records shared by every worker of one trial.
///
/// Cloning hands out another handle to the same store.
#[derive(Clone, Default)]
pub struct StatsAggregator {
    records: Arc<Mutex<Vec<BurstRecord>>>,
}

impl StatsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, record: BurstRecord) {
        self.records.lock().push(record);
    }

    /// Copies the records out; producers are blocked only for the copy.
    pub fn snapshot(&self) -> Vec<BurstRecord> {
        self.records.lock().clone()
    }

    pub fn clear(&self) {
        self.records.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

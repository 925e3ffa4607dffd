// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::BTreeMap;
use std::sync::Mutex;

use super::PoolError;

/// Backing storage for pooled objects, addressed by table and key.
pub trait ObjectStore: Send + Sync {
    fn put(&self, table: &str, key: &str, body: &str) -> Result<(), PoolError>;

    fn get(&self, table: &str, key: &str) -> Option<String>;

    fn delete(&self, table: &str, key: &str) -> Result<(), PoolError>;
}

/// An [`ObjectStore`] that keeps every row in memory.
#[derive(Default)]
pub struct MemoryStore {
    rows: Mutex<BTreeMap<(String, String), String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of rows in `table`.
    pub fn count(&self, table: &str) -> usize {
        self.rows.lock().unwrap().keys().filter(|(t, _)| t == table).count()
    }
}

impl ObjectStore for MemoryStore {
    fn put(&self, table: &str, key: &str, body: &str) -> Result<(), PoolError> {
        self.rows
            .lock()
            .unwrap()
            .insert((table.to_string(), key.to_string()), body.to_string());
        Ok(())
    }

    fn get(&self, table: &str, key: &str) -> Option<String> {
        self.rows
            .lock()
            .unwrap()
            .get(&(table.to_string(), key.to_string()))
            .cloned()
    }

    fn delete(&self, table: &str, key: &str) -> Result<(), PoolError> {
        self.rows
            .lock()
            .unwrap()
            .remove(&(table.to_string(), key.to_string()));
        Ok(())
    }
}

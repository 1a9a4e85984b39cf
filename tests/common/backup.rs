//! A simple, volatile, in-memory implementation of [`BackupStore`].
//!
//! Clones share the underlying map, so a "restarted" engine can be handed a clone of the
//! store its predecessor wrote through.

use std::{
    collections::HashMap,
    io,
    sync::{Arc, Mutex},
};

use pbft_rs::backup::BackupStore;

#[derive(Clone, Default)]
pub(crate) struct MemBackup(Arc<Mutex<HashMap<String, Vec<u8>>>>);

impl BackupStore for MemBackup {
    fn put(&mut self, key: &str, value: &[u8]) -> io::Result<()> {
        self.0
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn get(&self, key: &str) -> io::Result<Option<Vec<u8>>> {
        Ok(self.0.lock().unwrap().get(key).cloned())
    }
}

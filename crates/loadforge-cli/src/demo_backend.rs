//! A bare in-memory [`KvsBackend`] so the demo binary can run the
//! `random_rw` workload without a real database adapter (out of scope for
//! the core per §1 of the spec this binary wires up).

use std::collections::HashMap;
use std::sync::Mutex;

use loadforge_core::{KvsBackend, KvsError};

/// An in-process, `Mutex<HashMap>`-backed key-value store.
#[derive(Default)]
pub struct InMemoryKvs {
    data: Mutex<HashMap<Vec<u8>, Vec<u8>>>,
}

impl KvsBackend for InMemoryKvs {
    fn exists(&self, key: &[u8]) -> Result<bool, KvsError> {
        Ok(self.data.lock().expect("kvs mutex poisoned").contains_key(key))
    }

    fn set(&self, key: &[u8], value: &[u8]) -> Result<(), KvsError> {
        self.data.lock().expect("kvs mutex poisoned").insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, KvsError> {
        Ok(self.data.lock().expect("kvs mutex poisoned").get(key).cloned())
    }

    fn rename(&self, src: &[u8], dst: &[u8]) -> Result<(), KvsError> {
        let mut data = self.data.lock().expect("kvs mutex poisoned");
        let value = data.remove(src).ok_or_else(|| KvsError(format!("no such key: {src:?}")))?;
        data.insert(dst.to_vec(), value);
        Ok(())
    }

    fn delete_all(&self) -> Result<(), KvsError> {
        self.data.lock().expect("kvs mutex poisoned").clear();
        Ok(())
    }
}

use crate::error::{Error, Result};
use std::collections::HashMap;
use std::sync::Mutex;

/// Durable key/value pairs partitioned by location.
///
/// `add` is last-writer-wins for the same id. Implementations live behind
/// this trait so the location state machine never sees a concrete backend.
pub trait Storage: Send + Sync {
    fn load(&self, loc: &str) -> Result<Vec<(String, String)>>;
    fn add(&self, loc: &str, id: &str, value: &str) -> Result<()>;
    fn remove(&self, loc: &str, id: &str) -> Result<()>;
    fn clear(&self, loc: &str) -> Result<()>;
    fn delete(&self, loc: &str) -> Result<()>;
    fn health(&self) -> Result<()>;
    fn close(&self) -> Result<()>;
}

/// In-memory storage for tests and ephemeral locations.
#[derive(Default)]
pub struct MemStorage {
    pairs: Mutex<HashMap<String, HashMap<String, String>>>,
}

impl MemStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemStorage {
    fn load(&self, loc: &str) -> Result<Vec<(String, String)>> {
        let pairs = self.pairs.lock().map_err(|e| Error::Storage(e.to_string()))?;
        Ok(pairs
            .get(loc)
            .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    fn add(&self, loc: &str, id: &str, value: &str) -> Result<()> {
        let mut pairs = self.pairs.lock().map_err(|e| Error::Storage(e.to_string()))?;
        pairs
            .entry(loc.to_string())
            .or_default()
            .insert(id.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, loc: &str, id: &str) -> Result<()> {
        let mut pairs = self.pairs.lock().map_err(|e| Error::Storage(e.to_string()))?;
        if let Some(m) = pairs.get_mut(loc) {
            m.remove(id);
        }
        Ok(())
    }

    fn clear(&self, loc: &str) -> Result<()> {
        let mut pairs = self.pairs.lock().map_err(|e| Error::Storage(e.to_string()))?;
        if let Some(m) = pairs.get_mut(loc) {
            m.clear();
        }
        Ok(())
    }

    fn delete(&self, loc: &str) -> Result<()> {
        let mut pairs = self.pairs.lock().map_err(|e| Error::Storage(e.to_string()))?;
        pairs.remove(loc);
        Ok(())
    }

    fn health(&self) -> Result<()> {
        Ok(())
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }
}

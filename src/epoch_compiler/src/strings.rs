use epoch_bytecode::StringHandle;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Compile-time string pool. Handles are dense, start at 1 (handle 0 is
/// reserved), and are never reused; pooling the same text twice yields
/// the same handle.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(from = "Vec<String>", into = "Vec<String>")]
pub struct StringPool {
    entries: Vec<String>,
    reverse: HashMap<String, StringHandle>,
}

impl StringPool {
    pub fn new() -> StringPool {
        StringPool::default()
    }

    pub fn pool(&mut self, value: &str) -> StringHandle {
        if let Some(handle) = self.reverse.get(value) {
            return *handle;
        }
        self.entries.push(value.to_string());
        let handle = StringHandle(self.entries.len() as u32);
        self.reverse.insert(value.to_string(), handle);
        handle
    }

    pub fn get(&self, handle: StringHandle) -> Option<&str> {
        if handle.is_null() {
            return None;
        }
        self.entries
            .get(handle.0 as usize - 1)
            .map(String::as_str)
    }

    pub fn find(&self, value: &str) -> Option<StringHandle> {
        self.reverse.get(value).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in handle order, for deterministic `PoolString` emission.
    pub fn iter(&self) -> impl Iterator<Item = (StringHandle, &str)> {
        self.entries
            .iter()
            .enumerate()
            .map(|(i, s)| (StringHandle(i as u32 + 1), s.as_str()))
    }
}

impl From<Vec<String>> for StringPool {
    fn from(entries: Vec<String>) -> StringPool {
        let reverse = entries
            .iter()
            .enumerate()
            .map(|(i, s)| (s.clone(), StringHandle(i as u32 + 1)))
            .collect();
        StringPool { entries, reverse }
    }
}

impl From<StringPool> for Vec<String> {
    fn from(pool: StringPool) -> Vec<String> {
        pool.entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pooling_is_idempotent() {
        let mut pool = StringPool::new();
        let a = pool.pool("entrypoint");
        let b = pool.pool("debugwrite");
        assert_eq!(a, StringHandle(1));
        assert_eq!(b, StringHandle(2));
        assert_eq!(pool.pool("entrypoint"), a);
        assert_eq!(pool.get(a), Some("entrypoint"));
        assert_eq!(pool.get(StringHandle::NULL), None);
    }
}

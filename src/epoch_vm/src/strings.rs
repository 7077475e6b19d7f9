use crate::error::{VmError, VmResult};
use epoch_bytecode::StringHandle;
use std::collections::HashMap;

/// Runtime string pool. Static literals arrive through `PoolString`
/// instructions at program start and are immutable afterwards;
/// runtime-created strings obtain fresh handles. Handles are monotonic
/// and never reused within a process.
#[derive(Debug, Default)]
pub struct RuntimeStringPool {
    entries: HashMap<StringHandle, String>,
    reverse: HashMap<String, StringHandle>,
    next: u32,
}

impl RuntimeStringPool {
    pub fn new() -> RuntimeStringPool {
        RuntimeStringPool {
            entries: HashMap::new(),
            reverse: HashMap::new(),
            next: 1,
        }
    }

    /// Install a static literal at a fixed handle. Idempotent on the
    /// same `(handle, value)` pair; a conflicting re-pool is fatal.
    pub fn pool_at(&mut self, handle: StringHandle, value: &str) -> VmResult<()> {
        if handle.is_null() {
            return Err(VmError::StringPoolConflict(handle));
        }
        match self.entries.get(&handle) {
            Some(existing) if existing == value => return Ok(()),
            Some(_) => return Err(VmError::StringPoolConflict(handle)),
            None => {}
        }
        self.entries.insert(handle, value.to_string());
        self.reverse
            .entry(value.to_string())
            .or_insert(handle);
        self.next = self.next.max(handle.0 + 1);
        Ok(())
    }

    /// Pool a runtime-created string, reusing the handle of an
    /// identical pooled value when one exists.
    pub fn pool(&mut self, value: &str) -> StringHandle {
        if let Some(handle) = self.reverse.get(value) {
            return *handle;
        }
        let handle = StringHandle(self.next);
        self.next += 1;
        self.entries.insert(handle, value.to_string());
        self.reverse.insert(value.to_string(), handle);
        handle
    }

    pub fn get(&self, handle: StringHandle) -> VmResult<&str> {
        self.entries
            .get(&handle)
            .map(String::as_str)
            .ok_or(VmError::UnknownStringHandle(handle))
    }

    pub fn find(&self, value: &str) -> Option<StringHandle> {
        self.reverse.get(value).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_at_is_idempotent_and_conflict_checked() {
        let mut pool = RuntimeStringPool::new();
        pool.pool_at(StringHandle(5), "x").unwrap();
        pool.pool_at(StringHandle(5), "x").unwrap();
        assert!(pool.pool_at(StringHandle(5), "y").is_err());
        assert_eq!(pool.get(StringHandle(5)).unwrap(), "x");
    }

    #[test]
    fn runtime_strings_get_fresh_handles_past_statics() {
        let mut pool = RuntimeStringPool::new();
        pool.pool_at(StringHandle(7), "static").unwrap();
        let fresh = pool.pool("runtime");
        assert!(fresh.0 > 7);
        assert_eq!(pool.pool("runtime"), fresh);
        assert_eq!(pool.pool("static"), StringHandle(7));
    }
}

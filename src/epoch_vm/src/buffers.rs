use crate::error::{VmError, VmResult};
use epoch_bytecode::BufferHandle;
use std::collections::HashMap;

/// Freestore of mutable byte buffers. Buffers are GC-tracked and have
/// copy-on-use semantics: reading a buffer variable clones the
/// underlying bytes under a fresh handle.
#[derive(Debug, Default)]
pub struct BufferStore {
    buffers: HashMap<BufferHandle, Vec<u8>>,
    next: u32,
}

impl BufferStore {
    pub fn new() -> BufferStore {
        BufferStore {
            buffers: HashMap::new(),
            next: 1,
        }
    }

    pub fn allocate(&mut self, size: usize) -> BufferHandle {
        let handle = BufferHandle(self.next);
        self.next += 1;
        self.buffers.insert(handle, vec![0; size]);
        handle
    }

    pub fn clone_buffer(&mut self, handle: BufferHandle) -> VmResult<BufferHandle> {
        let data = self
            .buffers
            .get(&handle)
            .ok_or(VmError::InvalidBufferHandle(handle.0))?
            .clone();
        let clone = BufferHandle(self.next);
        self.next += 1;
        self.buffers.insert(clone, data);
        Ok(clone)
    }

    pub fn get(&self, handle: BufferHandle) -> VmResult<&[u8]> {
        self.buffers
            .get(&handle)
            .map(Vec::as_slice)
            .ok_or(VmError::InvalidBufferHandle(handle.0))
    }

    pub fn get_mut(&mut self, handle: BufferHandle) -> VmResult<&mut Vec<u8>> {
        self.buffers
            .get_mut(&handle)
            .ok_or(VmError::InvalidBufferHandle(handle.0))
    }

    pub fn contains(&self, handle: BufferHandle) -> bool {
        self.buffers.contains_key(&handle)
    }

    pub fn handles(&self) -> impl Iterator<Item = BufferHandle> + '_ {
        self.buffers.keys().copied()
    }

    pub fn free(&mut self, handle: BufferHandle) {
        self.buffers.remove(&handle);
    }
}

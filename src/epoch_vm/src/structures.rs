use crate::buffers::BufferStore;
use crate::error::{VmError, VmResult};
use crate::value::Value;
use epoch_bytecode::{StringHandle, StructureHandle, TypeId};
use std::collections::HashMap;

/// Member layout of a structure type, installed by `DefineStructure`.
#[derive(Debug, Clone, PartialEq)]
pub struct StructureDefinition {
    pub type_id: TypeId,
    pub members: Vec<(StringHandle, TypeId)>,
}

impl StructureDefinition {
    pub fn member_index(&self, member: StringHandle) -> Option<usize> {
        self.members.iter().position(|(name, _)| *name == member)
    }

    pub fn member_type(&self, member: StringHandle) -> Option<TypeId> {
        self.members
            .iter()
            .find(|(name, _)| *name == member)
            .map(|(_, type_id)| *type_id)
    }
}

/// One freestore-allocated record.
#[derive(Debug, Clone)]
pub struct ActiveStructure {
    pub type_id: TypeId,
    pub members: Vec<Value>,
}

/// The structure freestore. Records are GC-owned; handles are stable
/// identifiers and never reused within a process.
#[derive(Debug, Default)]
pub struct StructureStore {
    records: HashMap<StructureHandle, ActiveStructure>,
    next: u32,
}

impl StructureStore {
    pub fn new() -> StructureStore {
        StructureStore {
            records: HashMap::new(),
            next: 1,
        }
    }

    /// Allocate a record of the given layout with zeroed members.
    pub fn allocate(&mut self, definition: &StructureDefinition) -> StructureHandle {
        let handle = StructureHandle(self.next);
        self.next += 1;
        let members = definition
            .members
            .iter()
            .map(|(_, type_id)| Value::default_for(*type_id))
            .collect();
        self.records.insert(
            handle,
            ActiveStructure {
                type_id: definition.type_id,
                members,
            },
        );
        handle
    }

    pub fn get(&self, handle: StructureHandle) -> VmResult<&ActiveStructure> {
        self.records
            .get(&handle)
            .ok_or(VmError::InvalidStructureHandle(handle.0))
    }

    pub fn get_mut(&mut self, handle: StructureHandle) -> VmResult<&mut ActiveStructure> {
        self.records
            .get_mut(&handle)
            .ok_or(VmError::InvalidStructureHandle(handle.0))
    }

    pub fn contains(&self, handle: StructureHandle) -> bool {
        self.records.contains_key(&handle)
    }

    pub fn handles(&self) -> impl Iterator<Item = StructureHandle> + '_ {
        self.records.keys().copied()
    }

    pub fn free(&mut self, handle: StructureHandle) {
        self.records.remove(&handle);
    }
}

/// Deep-copy a record: structure-typed, buffer-typed, and sum-typed
/// members are copied by their declared rules; everything else is a
/// plain value copy.
pub fn deep_copy(
    structures: &mut StructureStore,
    buffers: &mut BufferStore,
    handle: StructureHandle,
) -> VmResult<StructureHandle> {
    let source = structures.get(handle)?.clone();
    let mut members = Vec::with_capacity(source.members.len());
    for member in &source.members {
        members.push(copy_member(structures, buffers, member)?);
    }
    let clone = StructureHandle(structures.next);
    structures.next += 1;
    structures.records.insert(
        clone,
        ActiveStructure {
            type_id: source.type_id,
            members,
        },
    );
    Ok(clone)
}

fn copy_member(
    structures: &mut StructureStore,
    buffers: &mut BufferStore,
    member: &Value,
) -> VmResult<Value> {
    let copied = match member {
        Value::Buffer(buffer) if buffer.0 != 0 => Value::Buffer(buffers.clone_buffer(*buffer)?),
        Value::Structure(nested, type_id) if nested.0 != 0 => {
            Value::Structure(deep_copy(structures, buffers, *nested)?, *type_id)
        }
        other => other.clone(),
    };
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use epoch_bytecode::BufferHandle;

    fn point_definition() -> StructureDefinition {
        StructureDefinition {
            type_id: TypeId::structure(0),
            members: vec![
                (StringHandle(1), TypeId::INTEGER),
                (StringHandle(2), TypeId::BUFFER),
            ],
        }
    }

    #[test]
    fn deep_copy_clones_nested_resources() {
        let mut structures = StructureStore::new();
        let mut buffers = BufferStore::new();
        let definition = point_definition();
        let original = structures.allocate(&definition);
        let buffer = buffers.allocate(8);
        {
            let record = structures.get_mut(original).unwrap();
            record.members[0] = Value::Integer(11);
            record.members[1] = Value::Buffer(buffer);
        }

        let clone = deep_copy(&mut structures, &mut buffers, original).unwrap();
        assert_ne!(clone, original);
        let cloned = structures.get(clone).unwrap();
        assert_eq!(cloned.members[0], Value::Integer(11));
        match cloned.members[1] {
            Value::Buffer(cloned_buffer) => assert_ne!(cloned_buffer, buffer),
            ref other => panic!("expected buffer member, found {:?}", other),
        }
    }

    #[test]
    fn null_handles_are_not_followed() {
        let mut structures = StructureStore::new();
        let mut buffers = BufferStore::new();
        let definition = point_definition();
        let original = structures.allocate(&definition);
        structures.get_mut(original).unwrap().members[1] = Value::Buffer(BufferHandle(0));
        let clone = deep_copy(&mut structures, &mut buffers, original).unwrap();
        assert_eq!(
            structures.get(clone).unwrap().members[1],
            Value::Buffer(BufferHandle(0))
        );
    }
}

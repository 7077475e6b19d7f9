use crate::context::ExecutionContext;
use crate::error::VmResult;
use crate::scope::{RefTarget, VarData};
use crate::value::Value;
use epoch_bytecode::{BufferHandle, StructureHandle, TypeFamily, TypeId};
use log::debug;
use std::collections::HashSet;

/// Mark-and-sweep over the structure and buffer freestores.
///
/// Roots: every activation-record variable, the return register, and
/// live reference bindings. Structure members are edges. Runs at
/// entity exit, a point where every live handle is reachable from a
/// scope; raw stack temporaries are never traced. Strings are monotonic
/// and not collected.
pub fn collect(context: &mut ExecutionContext) -> VmResult<()> {
    let mut live_structures: HashSet<StructureHandle> = HashSet::new();
    let mut live_buffers: HashSet<BufferHandle> = HashSet::new();
    let mut worklist: Vec<StructureHandle> = Vec::new();

    let mut root_structure = |handle: StructureHandle,
                              live: &mut HashSet<StructureHandle>,
                              worklist: &mut Vec<StructureHandle>| {
        if handle.0 != 0 && live.insert(handle) {
            worklist.push(handle);
        }
    };

    for index in 0..context.activations.len() {
        let scope = context.activations[index].scope.clone();
        for (var_index, variable) in scope.variables.iter().enumerate() {
            let declared = variable.type_id;
            match context.activations[index].data[var_index] {
                VarData::Value { offset } => {
                    root_from_slot(context, offset, declared, &mut live_buffers, |handle| {
                        root_structure(handle, &mut live_structures, &mut worklist)
                    })?;
                }
                VarData::SumValue { offset } => {
                    let actual = TypeId(context.stack.read_u32_at(offset - 4)?);
                    if actual != TypeId::NOTHING {
                        root_from_slot(context, offset, actual, &mut live_buffers, |handle| {
                            root_structure(handle, &mut live_structures, &mut worklist)
                        })?;
                    }
                }
                VarData::Reference { .. } => {}
            }
        }
    }

    for target in context.bindings.clone() {
        if let RefTarget::Member { structure, .. } = target {
            root_structure(structure, &mut live_structures, &mut worklist);
        }
    }

    match context.register.value {
        Value::Buffer(handle) if handle.0 != 0 => {
            live_buffers.insert(handle);
        }
        Value::Structure(handle, _) => {
            root_structure(handle, &mut live_structures, &mut worklist);
        }
        _ => {}
    }

    while let Some(handle) = worklist.pop() {
        if !context.structures.contains(handle) {
            continue;
        }
        let members = context.structures.get(handle)?.members.clone();
        for member in members {
            match member {
                Value::Buffer(buffer) if buffer.0 != 0 => {
                    live_buffers.insert(buffer);
                }
                Value::Structure(nested, _) => {
                    root_structure(nested, &mut live_structures, &mut worklist);
                }
                _ => {}
            }
        }
    }

    let dead_structures: Vec<StructureHandle> = context
        .structures
        .handles()
        .filter(|handle| !live_structures.contains(handle))
        .collect();
    let dead_buffers: Vec<BufferHandle> = context
        .buffers
        .handles()
        .filter(|handle| !live_buffers.contains(handle))
        .collect();
    if !dead_structures.is_empty() || !dead_buffers.is_empty() {
        debug!(
            "gc: reclaiming {} structures, {} buffers",
            dead_structures.len(),
            dead_buffers.len()
        );
    }
    for handle in dead_structures {
        context.structures.free(handle);
    }
    for handle in dead_buffers {
        context.buffers.free(handle);
    }
    Ok(())
}

fn root_from_slot(
    context: &ExecutionContext,
    offset: usize,
    type_id: TypeId,
    live_buffers: &mut HashSet<BufferHandle>,
    mut root_structure: impl FnMut(StructureHandle),
) -> VmResult<()> {
    if type_id == TypeId::BUFFER {
        let handle = BufferHandle(context.stack.read_u32_at(offset)?);
        if handle.0 != 0 {
            live_buffers.insert(handle);
        }
    } else if type_id.is_structure_like() {
        root_structure(StructureHandle(context.stack.read_u32_at(offset)?));
    } else if type_id.family() == TypeFamily::SumType {
        // A sum slot roots through its discriminator; handled by the
        // caller reading the actual tag.
    }
    Ok(())
}

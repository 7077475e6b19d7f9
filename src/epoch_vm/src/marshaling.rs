use crate::context::ExecutionContext;
use crate::error::{VmError, VmResult};
use crate::value::Value;
use epoch_bytecode::{StringHandle, StructureHandle, TypeId};
use log::{debug, warn};
use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

/// Registration record for an externally implemented function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DllBinding {
    pub dll: String,
    pub symbol: String,
    pub convention: CallingConvention,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallingConvention {
    StdCall,
    CDecl,
}

impl CallingConvention {
    pub fn parse(text: &str) -> CallingConvention {
        match text {
            "stdcall" | "winapi" | "pascal" => CallingConvention::StdCall,
            _ => CallingConvention::CDecl,
        }
    }
}

// The one intrinsically process-wide table: foreign binding metadata.
// Everything else the runtime touches is owned by a context.
fn registry() -> &'static Mutex<HashMap<String, DllBinding>> {
    static REGISTRY: OnceLock<Mutex<HashMap<String, DllBinding>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

pub fn register_external(alias: &str, binding: DllBinding) {
    debug!(
        "registering external '{}' -> {}!{}",
        alias, binding.dll, binding.symbol
    );
    registry()
        .lock()
        .expect("DLL registry poisoned")
        .insert(alias.to_string(), binding);
}

pub fn lookup_external(alias: &str) -> Option<DllBinding> {
    registry()
        .lock()
        .expect("DLL registry poisoned")
        .get(alias)
        .cloned()
}

pub fn is_external(alias: &str) -> bool {
    lookup_external(alias).is_some()
}

fn wide_zstring(text: &str) -> Box<[u16]> {
    let mut units: Vec<u16> = text.encode_utf16().collect();
    units.push(0);
    units.into_boxed_slice()
}

/// Stable pointer to the null-terminated wide image of a pooled
/// string. Cached per handle so repeated marshals hand foreign code
/// the same address and inbound pointer identity survives.
pub fn wide_string_ptr(context: &mut ExecutionContext, handle: StringHandle) -> VmResult<usize> {
    if handle.is_null() {
        return Ok(0);
    }
    if !context.wide_strings.contains_key(&handle) {
        let text = context.strings.get(handle)?.to_string();
        context.wide_strings.insert(handle, wide_zstring(&text));
    }
    Ok(context.wide_strings[&handle].as_ptr() as usize)
}

fn handle_for_wide_ptr(context: &ExecutionContext, pointer: usize) -> Option<StringHandle> {
    context
        .wide_strings
        .iter()
        .find(|(_, image)| image.as_ptr() as usize == pointer)
        .map(|(handle, _)| *handle)
}

/// Pinned record a JIT-generated trampoline hangs off. The core owns
/// the cache and the unmarshal/invoke/marshal sequence; turning the
/// record into executable code is the JIT collaborator's job.
#[derive(Debug)]
pub struct CallbackThunk {
    pub target: StringHandle,
}

/// Thunks are cached by target function: marshaling the same Epoch
/// callback twice hands out the same address.
pub fn callback_thunk(context: &mut ExecutionContext, target: StringHandle) -> usize {
    if let Some(address) = context.callback_thunks.get(&target) {
        return *address;
    }
    let address = Box::into_raw(Box::new(CallbackThunk { target })) as usize;
    context.callback_thunks.insert(target, address);
    address
}

pub fn thunk_target(context: &ExecutionContext, address: usize) -> Option<StringHandle> {
    context
        .callback_thunks
        .iter()
        .find(|(_, a)| **a == address)
        .map(|(target, _)| *target)
}

const PTR_SIZE: usize = std::mem::size_of::<usize>();

/// Size of a type's flat C-compatible image.
pub fn marshaled_size(context: &ExecutionContext, type_id: TypeId) -> VmResult<usize> {
    if type_id.is_structure_like() {
        let definition = context
            .structure_defs
            .get(&type_id)
            .ok_or(VmError::UnknownStructureType(type_id))?;
        let mut size = 0;
        for (_, member_type) in definition.members.clone() {
            size += marshaled_member_size(context, member_type)?;
        }
        return Ok(size);
    }
    marshaled_member_size(context, type_id)
}

fn marshaled_member_size(context: &ExecutionContext, type_id: TypeId) -> VmResult<usize> {
    let size = match type_id {
        TypeId::INTEGER => 4,
        TypeId::INTEGER16 => 2,
        // Widened to a full machine word for C interop.
        TypeId::BOOLEAN => 4,
        TypeId::STRING | TypeId::BUFFER | TypeId::FUNCTION => PTR_SIZE,
        other if other.is_structure_like() => marshaled_size(context, other)?,
        other => return Err(VmError::UnsupportedMarshalingType(other)),
    };
    Ok(size)
}

/// Write the flat C-compatible image of a structure into `out`,
/// recursing into nested structures. Strings become pointers to pooled
/// wide images, buffers raw data pointers, booleans widen to four
/// bytes, function members become callback thunk addresses.
pub fn marshal_structure_into_buffer(
    context: &mut ExecutionContext,
    handle: StructureHandle,
    out: &mut Vec<u8>,
) -> VmResult<()> {
    let record = context.structures.get(handle)?.clone();
    let definition = context
        .structure_defs
        .get(&record.type_id)
        .ok_or(VmError::UnknownStructureType(record.type_id))?
        .clone();
    for (index, (_, member_type)) in definition.members.iter().enumerate() {
        let member = &record.members[index];
        match (member, *member_type) {
            (Value::Integer(v), TypeId::INTEGER) => out.extend_from_slice(&v.to_le_bytes()),
            (Value::Integer16(v), TypeId::INTEGER16) => out.extend_from_slice(&v.to_le_bytes()),
            (Value::Boolean(v), TypeId::BOOLEAN) => {
                out.extend_from_slice(&(if *v { 1i32 } else { 0i32 }).to_le_bytes())
            }
            (Value::Str(string), TypeId::STRING) => {
                let pointer = wide_string_ptr(context, *string)?;
                out.extend_from_slice(&pointer.to_le_bytes());
            }
            (Value::Buffer(buffer), TypeId::BUFFER) => {
                let pointer = if buffer.0 == 0 {
                    0usize
                } else {
                    context.buffers.get_mut(*buffer)?.as_mut_ptr() as usize
                };
                out.extend_from_slice(&pointer.to_le_bytes());
            }
            (Value::Structure(nested, _), member_type) if member_type.is_structure_like() => {
                marshal_structure_into_buffer(context, *nested, out)?;
            }
            (Value::FunctionName(target), TypeId::FUNCTION) => {
                let pointer = callback_thunk(context, *target);
                out.extend_from_slice(&pointer.to_le_bytes());
            }
            (_, other) => return Err(VmError::UnsupportedMarshalingType(other)),
        }
    }
    Ok(())
}

/// Reparse a flat buffer by the inverse rules, writing mutated members
/// back into the structure record. Strings observed as pointers are
/// re-pooled as needed (null pools the empty string); buffers were
/// mutated in place and only advance the cursor; function pointers are
/// not marshaled back.
pub fn marshal_buffer_into_structure(
    context: &mut ExecutionContext,
    handle: StructureHandle,
    buffer: &[u8],
) -> VmResult<()> {
    let type_id = context.structures.get(handle)?.type_id;
    let definition = context
        .structure_defs
        .get(&type_id)
        .ok_or(VmError::UnknownStructureType(type_id))?
        .clone();
    let mut cursor = 0usize;
    for (index, (_, member_type)) in definition.members.iter().enumerate() {
        let remaining = buffer
            .get(cursor..)
            .ok_or(VmError::UnsupportedMarshalingType(*member_type))?;
        match *member_type {
            TypeId::INTEGER => {
                let value = i32::from_le_bytes(read_array(remaining)?);
                context.structures.get_mut(handle)?.members[index] = Value::Integer(value);
                cursor += 4;
            }
            TypeId::INTEGER16 => {
                let value = i16::from_le_bytes(read_array(remaining)?);
                context.structures.get_mut(handle)?.members[index] = Value::Integer16(value);
                cursor += 2;
            }
            TypeId::BOOLEAN => {
                let value = i32::from_le_bytes(read_array(remaining)?) != 0;
                context.structures.get_mut(handle)?.members[index] = Value::Boolean(value);
                cursor += 4;
            }
            TypeId::STRING => {
                let pointer = usize::from_le_bytes(read_array(remaining)?);
                let string = if pointer == 0 {
                    context.strings.pool("")
                } else if let Some(existing) = handle_for_wide_ptr(context, pointer) {
                    existing
                } else {
                    // A pointer we did not hand out: the external call
                    // substituted its own wide string. Reading it is the
                    // FFI boundary's irreducible unsafety.
                    let text = unsafe { read_foreign_wide(pointer) };
                    context.strings.pool(&text)
                };
                context.structures.get_mut(handle)?.members[index] = Value::Str(string);
                cursor += PTR_SIZE;
            }
            TypeId::BUFFER => {
                cursor += PTR_SIZE;
            }
            TypeId::FUNCTION => {
                cursor += PTR_SIZE;
            }
            other if other.is_structure_like() => {
                let nested = match context.structures.get(handle)?.members[index] {
                    Value::Structure(nested, _) => nested,
                    _ => return Err(VmError::UnsupportedMarshalingType(other)),
                };
                marshal_buffer_into_structure(context, nested, remaining)?;
                cursor += marshaled_size(context, other)?;
            }
            other => return Err(VmError::UnsupportedMarshalingType(other)),
        }
    }
    Ok(())
}

fn read_array<const N: usize>(bytes: &[u8]) -> VmResult<[u8; N]> {
    bytes
        .get(..N)
        .and_then(|slice| <[u8; N]>::try_from(slice).ok())
        .ok_or(VmError::StackUnderflow)
}

pub(crate) unsafe fn read_foreign_wide(pointer: usize) -> String {
    let mut units = Vec::new();
    let mut cursor = pointer as *const u16;
    loop {
        let unit = *cursor;
        if unit == 0 {
            break;
        }
        units.push(unit);
        cursor = cursor.add(1);
    }
    String::from_utf16_lossy(&units)
}

enum MarshaledArg {
    Word(u64),
    StructBuffer { record: usize },
}

/// Record of a structure argument's flat image, kept so by-reference
/// parameters can be written back after the call returns.
pub struct MarshaledStructureRecord {
    pub is_reference: bool,
    pub buffer: Vec<u8>,
    pub structure: StructureHandle,
}

/// A foreign call, marshaled and ready for the invoker: the binding
/// metadata, one machine word per argument, and the structure records
/// to reparse on return.
pub struct MarshaledCall {
    pub binding: DllBinding,
    args: Vec<MarshaledArg>,
    pub records: Vec<MarshaledStructureRecord>,
}

impl MarshaledCall {
    /// Argument words in declaration order. Computed on demand so the
    /// structure-buffer pointers reflect the records' current storage.
    pub fn argument_words(&self) -> Vec<u64> {
        self.args
            .iter()
            .map(|arg| match arg {
                MarshaledArg::Word(word) => *word,
                MarshaledArg::StructBuffer { record } => {
                    self.records[*record].buffer.as_ptr() as u64
                }
            })
            .collect()
    }
}

/// Marshal the outbound argument list of an external call: primitives
/// by value, strings as pooled wide pointers, buffers as raw data
/// pointers, structures as flat images, function values as callback
/// thunks.
pub fn prepare_external_call(
    context: &mut ExecutionContext,
    alias: &str,
    args: &[(Value, bool)],
) -> VmResult<MarshaledCall> {
    let binding = lookup_external(alias).ok_or_else(|| VmError::UnknownExternal(alias.to_string()))?;
    let mut words = Vec::with_capacity(args.len());
    let mut records = Vec::new();
    for (value, is_reference) in args {
        let arg = match value {
            Value::Integer(v) => MarshaledArg::Word(*v as u32 as u64),
            Value::Integer16(v) => MarshaledArg::Word(*v as u16 as u64),
            Value::Boolean(v) => MarshaledArg::Word(if *v { 1 } else { 0 }),
            Value::Real(v) => MarshaledArg::Word(v.to_bits() as u64),
            Value::Str(handle) => MarshaledArg::Word(wide_string_ptr(context, *handle)? as u64),
            Value::Buffer(handle) => {
                let pointer = context.buffers.get_mut(*handle)?.as_mut_ptr() as usize;
                MarshaledArg::Word(pointer as u64)
            }
            Value::Structure(handle, _) => {
                let mut buffer = Vec::new();
                marshal_structure_into_buffer(context, *handle, &mut buffer)?;
                records.push(MarshaledStructureRecord {
                    is_reference: *is_reference,
                    buffer,
                    structure: *handle,
                });
                MarshaledArg::StructBuffer {
                    record: records.len() - 1,
                }
            }
            Value::FunctionName(target) => {
                MarshaledArg::Word(callback_thunk(context, *target) as u64)
            }
            other => return Err(VmError::UnsupportedMarshalingType(other.type_id())),
        };
        words.push(arg);
    }
    Ok(MarshaledCall {
        binding,
        args: words,
        records,
    })
}

/// After the external call returns, reparse every by-reference
/// structure record back into its originating record.
pub fn complete_external_call(
    context: &mut ExecutionContext,
    call: MarshaledCall,
) -> VmResult<()> {
    for record in &call.records {
        if !record.is_reference {
            continue;
        }
        marshal_buffer_into_structure(context, record.structure, &record.buffer)?;
    }
    Ok(())
}

/// Loader hook for `Tag` metadata: `external` tags register their
/// binding in the process-wide registry.
pub fn apply_tag(
    context: &ExecutionContext,
    entity: StringHandle,
    key: &str,
    items: &[String],
) -> VmResult<()> {
    if key != "external" {
        debug!("ignoring tag '{}' on entity {}", key, entity);
        return Ok(());
    }
    if items.len() < 3 {
        warn!("malformed external tag on entity {}", entity);
        return Ok(());
    }
    let alias = context.strings.get(entity)?;
    register_external(
        alias,
        DllBinding {
            dll: items[0].clone(),
            symbol: items[1].clone(),
            convention: CallingConvention::parse(&items[2]),
        },
    );
    Ok(())
}

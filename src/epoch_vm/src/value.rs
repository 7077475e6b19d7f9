use crate::error::{VmError, VmResult};
use crate::stack::StackSpace;
use epoch_bytecode::{BufferHandle, StringHandle, StructureHandle, TypeId};

/// A runtime value: type tag plus payload. Handle-backed kinds carry
/// only their handle; the owning freestore resolves the rest.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Integer(i32),
    Integer16(i16),
    Real(f32),
    Boolean(bool),
    Str(StringHandle),
    Buffer(BufferHandle),
    Structure(StructureHandle, TypeId),
    FunctionName(StringHandle),
    Identifier(StringHandle),
    Nothing,
}

impl Value {
    pub fn type_id(&self) -> TypeId {
        match self {
            Value::Integer(_) => TypeId::INTEGER,
            Value::Integer16(_) => TypeId::INTEGER16,
            Value::Real(_) => TypeId::REAL,
            Value::Boolean(_) => TypeId::BOOLEAN,
            Value::Str(_) => TypeId::STRING,
            Value::Buffer(_) => TypeId::BUFFER,
            Value::Structure(_, type_id) => *type_id,
            Value::FunctionName(_) => TypeId::FUNCTION,
            Value::Identifier(_) => TypeId::IDENTIFIER,
            Value::Nothing => TypeId::NOTHING,
        }
    }

    /// Zero value for a freshly allocated slot of the given type. Sum
    /// types start as `Nothing` until their first assignment writes a
    /// discriminator.
    pub fn default_for(type_id: TypeId) -> Value {
        if type_id.is_structure_like() {
            return Value::Structure(StructureHandle(0), type_id);
        }
        match type_id {
            TypeId::INTEGER => Value::Integer(0),
            TypeId::INTEGER16 => Value::Integer16(0),
            TypeId::REAL => Value::Real(0.0),
            TypeId::BOOLEAN => Value::Boolean(false),
            TypeId::STRING => Value::Str(StringHandle::NULL),
            TypeId::BUFFER => Value::Buffer(BufferHandle(0)),
            TypeId::FUNCTION => Value::FunctionName(StringHandle::NULL),
            TypeId::IDENTIFIER => Value::Identifier(StringHandle::NULL),
            _ => Value::Nothing,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Value::Integer(v) => v.to_le_bytes().to_vec(),
            Value::Integer16(v) => v.to_le_bytes().to_vec(),
            Value::Real(v) => v.to_bits().to_le_bytes().to_vec(),
            Value::Boolean(v) => vec![if *v { 1 } else { 0 }],
            Value::Str(h) | Value::FunctionName(h) | Value::Identifier(h) => {
                h.0.to_le_bytes().to_vec()
            }
            Value::Buffer(h) => h.0.to_le_bytes().to_vec(),
            Value::Structure(h, _) => h.0.to_le_bytes().to_vec(),
            Value::Nothing => Vec::new(),
        }
    }

    pub fn from_bytes(type_id: TypeId, bytes: &[u8]) -> VmResult<Value> {
        let expected = type_id
            .storage_size()
            .ok_or(VmError::TypeMismatch(type_id))?;
        if bytes.len() != expected {
            return Err(VmError::TypeMismatch(type_id));
        }
        let u32_of = |b: &[u8]| u32::from_le_bytes([b[0], b[1], b[2], b[3]]);
        let value = if type_id.is_structure_like() {
            Value::Structure(StructureHandle(u32_of(bytes)), type_id)
        } else {
            match type_id {
                TypeId::INTEGER => Value::Integer(u32_of(bytes) as i32),
                TypeId::INTEGER16 => Value::Integer16(i16::from_le_bytes([bytes[0], bytes[1]])),
                TypeId::REAL => Value::Real(f32::from_bits(u32_of(bytes))),
                TypeId::BOOLEAN => Value::Boolean(bytes[0] != 0),
                TypeId::STRING => Value::Str(StringHandle(u32_of(bytes))),
                TypeId::BUFFER => Value::Buffer(BufferHandle(u32_of(bytes))),
                TypeId::FUNCTION => Value::FunctionName(StringHandle(u32_of(bytes))),
                TypeId::IDENTIFIER => Value::Identifier(StringHandle(u32_of(bytes))),
                TypeId::NOTHING => Value::Nothing,
                other => return Err(VmError::TypeMismatch(other)),
            }
        };
        Ok(value)
    }

    pub fn push_onto(&self, stack: &mut StackSpace) -> VmResult<()> {
        stack.push_bytes(&self.to_bytes())
    }

    pub fn pop_from(stack: &mut StackSpace, type_id: TypeId) -> VmResult<Value> {
        let size = type_id
            .storage_size()
            .ok_or(VmError::TypeMismatch(type_id))?;
        let bytes = stack.pop_bytes(size)?;
        Value::from_bytes(type_id, &bytes)
    }
}

/// The per-context return-value register: the last function's return
/// value with its type annotation. Pushed onto the caller's stack when
/// the producing activation exits.
#[derive(Debug, Clone)]
pub struct Register {
    pub value: Value,
    /// Set when the producing storage was sum-typed; the push then
    /// includes the discriminator above the payload.
    pub sum_type: bool,
}

impl Default for Register {
    fn default() -> Register {
        Register {
            value: Value::Nothing,
            sum_type: false,
        }
    }
}

impl Register {
    pub fn set(&mut self, value: Value) {
        self.value = value;
        self.sum_type = false;
    }

    pub fn set_sum(&mut self, value: Value) {
        self.value = value;
        self.sum_type = true;
    }

    /// Push the held value; sum-typed contents carry their
    /// discriminator on top of the payload.
    pub fn push_onto(&self, stack: &mut StackSpace) -> VmResult<()> {
        self.value.push_onto(stack)?;
        if self.sum_type {
            stack.push_u32(self.value.type_id().0)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_round_trip() {
        let samples = [
            Value::Integer(-5),
            Value::Integer16(300),
            Value::Real(2.5),
            Value::Boolean(true),
            Value::Str(StringHandle(3)),
            Value::Buffer(BufferHandle(9)),
            Value::Structure(StructureHandle(4), TypeId::structure(1)),
            Value::Nothing,
        ];
        for value in samples {
            let bytes = value.to_bytes();
            assert_eq!(Value::from_bytes(value.type_id(), &bytes).unwrap(), value);
        }
    }
}

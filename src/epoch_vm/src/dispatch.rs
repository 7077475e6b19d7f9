use crate::context::ExecutionContext;
use crate::error::{VmError, VmResult};
use epoch_bytecode::{PatternParam, PushValue, TypeFamily, TypeId, TypeMatchParam};
use log::debug;

fn literal_bytes(literal: &PushValue) -> Vec<u8> {
    match literal {
        PushValue::Integer(v) => v.to_le_bytes().to_vec(),
        PushValue::Integer16(v) => v.to_le_bytes().to_vec(),
        PushValue::Real(v) => v.to_bits().to_le_bytes().to_vec(),
        PushValue::Boolean(v) => vec![if *v { 1 } else { 0 }],
        PushValue::Handle(v) => v.to_le_bytes().to_vec(),
        PushValue::Nothing => Vec::new(),
    }
}

/// Compare the top `n` parameters on the stack against the embedded
/// literals of a `PatternMatch` record without consuming anything.
/// Parameters were pushed left to right, so the record is walked in
/// reverse from the top of the stack.
pub fn pattern_match(context: &ExecutionContext, params: &[PatternParam]) -> VmResult<bool> {
    let mut cursor = context.stack.top_offset();
    for param in params.iter().rev() {
        let size = param
            .type_id
            .storage_size()
            .ok_or(VmError::TypeMismatch(param.type_id))?;
        if let Some(literal) = &param.literal {
            let expected = literal_bytes(literal);
            let actual = context.stack.read_bytes(cursor, expected.len())?;
            if actual != expected.as_slice() {
                return Ok(false);
            }
        }
        cursor += size;
    }
    Ok(true)
}

/// Compare the top parameters against a `TypeMatch` record. Reference
/// parameters sit on the stack as `(target, type)` binding pairs;
/// value parameters as `(discriminator, payload)`. On a full match the
/// parameter region is rewritten in place: value targets of concrete
/// type get their discriminators stripped, sum-typed and reference
/// targets keep their form. Returns whether the record matched.
pub fn type_match(context: &mut ExecutionContext, params: &[TypeMatchParam]) -> VmResult<bool> {
    let top = context.stack.top_offset();
    let mut cursor = top;
    // Walk order is top-of-stack first, i.e. the last parameter first.
    let mut kept: Vec<Vec<u8>> = Vec::with_capacity(params.len());
    for param in params.iter().rev() {
        if param.is_reference {
            let bound_type = TypeId(context.stack.read_u32_at(cursor + 4)?);
            if bound_type != param.type_id {
                return Ok(false);
            }
            kept.push(context.stack.read_bytes(cursor, 8)?.to_vec());
            cursor += 8;
        } else {
            let actual = TypeId(context.stack.read_u32_at(cursor)?);
            let payload_size = actual
                .storage_size()
                .ok_or(VmError::MissingDiscriminator(param.type_id))?;
            let matches_concrete = actual == param.type_id;
            let matches_sum = param.type_id.family() == TypeFamily::SumType
                && context
                    .variant_defs
                    .get(&param.type_id)
                    .map(|def| def.has_base(actual))
                    .unwrap_or(false);
            if matches_concrete {
                // Unwrapped payload only.
                kept.push(context.stack.read_bytes(cursor + 4, payload_size)?.to_vec());
            } else if matches_sum {
                kept.push(context.stack.read_bytes(cursor, 4 + payload_size)?.to_vec());
            } else {
                return Ok(false);
            }
            cursor += 4 + payload_size;
        }
    }

    let rewritten: Vec<u8> = kept.concat();
    debug!(
        "type match: {} parameter bytes rewritten to {}",
        cursor - top,
        rewritten.len()
    );
    context.stack.set_top(cursor)?;
    context.stack.push_bytes(&rewritten)?;
    Ok(true)
}

use crate::error::{VmError, VmResult};
use epoch_bytecode::TypeId;

/// Layout of a sum type: the declared base types and the size of the
/// largest payload. Storage is the max base size plus the 4-byte
/// discriminator prefix.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VariantDefinition {
    bases: Vec<TypeId>,
    payload_size: usize,
}

impl VariantDefinition {
    pub fn from_bases(bases: &[TypeId]) -> VmResult<VariantDefinition> {
        let mut definition = VariantDefinition::default();
        for base in bases {
            definition.add_base(*base)?;
        }
        Ok(definition)
    }

    pub fn add_base(&mut self, base: TypeId) -> VmResult<()> {
        let size = base
            .storage_size()
            .ok_or(VmError::InvalidDiscriminator(base))?;
        if !self.bases.contains(&base) {
            self.bases.push(base);
        }
        self.payload_size = self.payload_size.max(size);
        Ok(())
    }

    pub fn has_base(&self, base: TypeId) -> bool {
        self.bases.contains(&base)
    }

    pub fn bases(&self) -> &[TypeId] {
        &self.bases
    }

    pub fn payload_size(&self) -> usize {
        self.payload_size
    }

    /// Full stack footprint: discriminator plus the widest payload.
    pub fn max_size(&self) -> usize {
        self.payload_size + 4
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_track_widest_base() {
        let def =
            VariantDefinition::from_bases(&[TypeId::BOOLEAN, TypeId::INTEGER, TypeId::INTEGER16])
                .unwrap();
        assert_eq!(def.payload_size(), 4);
        assert_eq!(def.max_size(), 8);
        assert!(def.has_base(TypeId::BOOLEAN));
        assert!(!def.has_base(TypeId::STRING));
    }

    #[test]
    fn sum_typed_base_is_rejected() {
        assert!(VariantDefinition::from_bases(&[TypeId::sum_type(1)]).is_err());
    }
}

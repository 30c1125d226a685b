use crate::virtual_machine::errors::VMError;

/// Largest number of conditions an `andor` block may combine.
pub const MAX_CONDITIONS: usize = 8;

/// How the conditions of a block combine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Combine {
    All,
    Any,
}

/// Result slots of the condition block being evaluated.
///
/// A block opens with a fixed capacity; conditional opcodes fill the first
/// empty slot in order, inverting their result when negated.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BranchConditions {
    block: Option<(Combine, Vec<Option<bool>>)>,
}

impl BranchConditions {
    pub fn open(&mut self, capacity: usize, combine: Combine) -> Result<(), VMError> {
        if capacity == 0 || capacity > MAX_CONDITIONS {
            return Err(VMError::BranchConditionMisuse {
                reason: "invalid condition count",
            });
        }
        self.block = Some((combine, vec![None; capacity]));
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.block.is_some()
    }

    pub fn slots(&self) -> Option<&[Option<bool>]> {
        self.block.as_ref().map(|(_, slots)| slots.as_slice())
    }

    /// Stores one condition result.
    pub fn push(&mut self, value: bool, negated: bool) -> Result<(), VMError> {
        let Some((_, slots)) = self.block.as_mut() else {
            return Err(VMError::BranchConditionMisuse {
                reason: "condition outside an if block",
            });
        };
        let slot = slots
            .iter_mut()
            .find(|s| s.is_none())
            .ok_or(VMError::BranchConditionMisuse {
                reason: "too many conditions",
            })?;
        *slot = Some(value != negated);
        Ok(())
    }

    /// Combines the block into one result and clears it.
    pub fn resolve(&mut self) -> Result<bool, VMError> {
        let (combine, slots) = self.block.take().ok_or(VMError::BranchConditionMisuse {
            reason: "no open if block",
        })?;
        let values: Option<Vec<bool>> = slots.into_iter().collect();
        let Some(values) = values else {
            return Err(VMError::BranchConditionMisuse {
                reason: "too few conditions",
            });
        };
        Ok(match combine {
            Combine::All => values.into_iter().all(|v| v),
            Combine::Any => values.into_iter().any(|v| v),
        })
    }
}

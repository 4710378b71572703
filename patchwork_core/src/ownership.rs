//! Global particle bookkeeping across all home patches.

use crate::atom::AtomId;
use crate::error::{PatchError, PatchResult};
use crate::patch::PatchId;
use std::collections::HashMap;

/// Checks that `owners` lists each atom exactly once and that the total
/// matches `expected`.
pub fn verify_ownership(owners: impl IntoIterator<Item = (PatchId, AtomId)>, expected: usize) -> PatchResult<()> {
    let mut seen: HashMap<AtomId, PatchId> = HashMap::with_capacity(expected);
    for (patch, atom) in owners {
        if let Some(first) = seen.insert(atom, patch) {
            return Err(PatchError::DuplicateOwnership {
                atom,
                first,
                second: patch,
            });
        }
    }
    if seen.len() != expected {
        return Err(PatchError::ParticleCountMismatch {
            before: expected,
            after: seen.len(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conserved() {
        let owners = vec![(PatchId(0), AtomId(1)), (PatchId(1), AtomId(2))];
        assert!(verify_ownership(owners, 2).is_ok());
    }

    #[test]
    fn test_lost_atom() {
        let err = verify_ownership(vec![(PatchId(0), AtomId(1))], 2).unwrap_err();
        assert_eq!(
            err.to_string(),
            "particle count mismatch after migration: before 2, after 1"
        );
    }

    #[test]
    fn test_duplicated_atom() {
        let owners = vec![(PatchId(0), AtomId(1)), (PatchId(3), AtomId(1))];
        assert!(matches!(
            verify_ownership(owners, 2),
            Err(PatchError::DuplicateOwnership { first: PatchId(0), second: PatchId(3), .. })
        ));
    }
}

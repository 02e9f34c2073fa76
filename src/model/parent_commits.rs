//! Parent commits record, grounded on
//! `original_source/eden/fs/model/ParentCommits.h`: one required hash,
//! one optional second hash for an in-progress merge.

use crate::hash::Hash;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ParentCommits {
    parent1: Hash,
    parent2: Option<Hash>,
}

impl ParentCommits {
    pub fn new(parent1: Hash, parent2: Option<Hash>) -> Self {
        Self { parent1, parent2 }
    }

    pub fn single(parent1: Hash) -> Self {
        Self {
            parent1,
            parent2: None,
        }
    }

    pub fn parent1(&self) -> Hash {
        self.parent1
    }

    pub fn parent2(&self) -> Option<Hash> {
        self.parent2
    }

    pub fn set_parents(&mut self, parent1: Hash, parent2: Option<Hash>) {
        self.parent1 = parent1;
        self.parent2 = parent2;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equality_is_componentwise() {
        let p1 = Hash::of(b"p1");
        let p2 = Hash::of(b"p2");
        assert_eq!(
            ParentCommits::new(p1, Some(p2)),
            ParentCommits::new(p1, Some(p2))
        );
        assert_ne!(ParentCommits::single(p1), ParentCommits::new(p1, Some(p2)));
    }

    #[test]
    fn ordering_is_componentwise_by_parent1_then_parent2() {
        let low = Hash::from_bytes(&[0u8; 20]).unwrap();
        let mut high_bytes = [0u8; 20];
        high_bytes[19] = 1;
        let high = Hash::from_bytes(&high_bytes).unwrap();

        assert!(ParentCommits::single(low) < ParentCommits::single(high));
        assert!(ParentCommits::single(low) < ParentCommits::new(low, Some(high)));
    }
}

//! # Process Group Module
//!
//! A group is an ordered set of global ranks supporting set algebra and
//! rank translation. Groups are pure data: constructing or combining them
//! creates no connections and touches no engine state. A communicator
//! holds a group describing its members; new groups are derived from
//! existing ones with `incl`/`excl`/`union`/... and can later seed new
//! communicators.
//!
//! Positions within a group ("local ranks") are the indices into its
//! ordered member list; the members themselves are global ranks.

use crate::error::MpiError;
use crate::wire::{Rank, UNDEFINED};

/// Result of comparing two groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupCompare {
    /// Same members in the same order.
    Ident,
    /// Same members, different order.
    Similar,
    /// Different membership.
    Unequal,
}

/// Ordered set of global ranks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Group {
    members: Vec<Rank>,
}

impl Group {
    /// Create a group from an explicit member list. Members must be
    /// non-negative and unique.
    pub fn new(members: Vec<Rank>) -> Result<Self, MpiError> {
        for (i, &r) in members.iter().enumerate() {
            if r < 0 {
                return Err(MpiError::NoSuchRank {
                    rank: r,
                    size: members.len(),
                });
            }
            if members[..i].contains(&r) {
                return Err(MpiError::Mpi(format!("duplicate rank {r} in group")));
            }
        }
        Ok(Group { members })
    }

    /// The world group `0..size`.
    pub fn world(size: usize) -> Self {
        Group {
            members: (0..size as Rank).collect(),
        }
    }

    /// The empty group.
    pub fn empty() -> Self {
        Group {
            members: Vec::new(),
        }
    }

    pub fn size(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Ordered member list (global ranks).
    pub fn members(&self) -> &[Rank] {
        &self.members
    }

    /// Local rank (position) of a global rank, if present.
    pub fn rank_of(&self, global: Rank) -> Option<usize> {
        self.members.iter().position(|&r| r == global)
    }

    /// Union: members of `self` in order, then members of `other` not
    /// already present, in `other`'s order.
    pub fn union(&self, other: &Group) -> Group {
        let mut members = self.members.clone();
        for &r in &other.members {
            if !members.contains(&r) {
                members.push(r);
            }
        }
        Group { members }
    }

    /// Intersection: members of `self`, in `self`'s order, also present in
    /// `other`.
    pub fn intersection(&self, other: &Group) -> Group {
        Group {
            members: self
                .members
                .iter()
                .copied()
                .filter(|r| other.members.contains(r))
                .collect(),
        }
    }

    /// Difference: members of `self`, in `self`'s order, absent from
    /// `other`.
    pub fn difference(&self, other: &Group) -> Group {
        Group {
            members: self
                .members
                .iter()
                .copied()
                .filter(|r| !other.members.contains(r))
                .collect(),
        }
    }

    /// New group holding the members at the given local ranks, in the given
    /// order.
    pub fn incl(&self, local_ranks: &[usize]) -> Result<Group, MpiError> {
        let mut members = Vec::with_capacity(local_ranks.len());
        for &i in local_ranks {
            let r = *self.members.get(i).ok_or(MpiError::NoSuchRank {
                rank: i as Rank,
                size: self.size(),
            })?;
            if members.contains(&r) {
                return Err(MpiError::Mpi(format!("duplicate rank {r} in incl list")));
            }
            members.push(r);
        }
        Ok(Group { members })
    }

    /// New group holding every member except those at the given local
    /// ranks, preserving order.
    pub fn excl(&self, local_ranks: &[usize]) -> Result<Group, MpiError> {
        for &i in local_ranks {
            if i >= self.size() {
                return Err(MpiError::NoSuchRank {
                    rank: i as Rank,
                    size: self.size(),
                });
            }
        }
        Ok(Group {
            members: self
                .members
                .iter()
                .enumerate()
                .filter(|(i, _)| !local_ranks.contains(i))
                .map(|(_, &r)| r)
                .collect(),
        })
    }

    /// `incl` over `(first, last, stride)` triplets of local ranks.
    pub fn range_incl(&self, triplets: &[(Rank, Rank, Rank)]) -> Result<Group, MpiError> {
        self.incl(&self.expand_ranges(triplets)?)
    }

    /// `excl` over `(first, last, stride)` triplets of local ranks.
    pub fn range_excl(&self, triplets: &[(Rank, Rank, Rank)]) -> Result<Group, MpiError> {
        self.excl(&self.expand_ranges(triplets)?)
    }

    fn expand_ranges(&self, triplets: &[(Rank, Rank, Rank)]) -> Result<Vec<usize>, MpiError> {
        let mut out = Vec::new();
        for &(first, last, stride) in triplets {
            if stride == 0 {
                return Err(MpiError::InvalidStride(stride));
            }
            // The stride must walk from first towards last.
            if (stride > 0 && first > last) || (stride < 0 && first < last) {
                return Err(MpiError::InvalidRange {
                    first,
                    last,
                    stride,
                });
            }
            if first < 0 || last < 0 {
                return Err(MpiError::InvalidRange {
                    first,
                    last,
                    stride,
                });
            }
            let mut i = first;
            while (stride > 0 && i <= last) || (stride < 0 && i >= last) {
                out.push(i as usize);
                i += stride;
            }
        }
        Ok(out)
    }

    /// Compare membership and order.
    pub fn compare(&self, other: &Group) -> GroupCompare {
        if self.members == other.members {
            return GroupCompare::Ident;
        }
        let mut a = self.members.clone();
        let mut b = other.members.clone();
        a.sort_unstable();
        b.sort_unstable();
        if a == b {
            GroupCompare::Similar
        } else {
            GroupCompare::Unequal
        }
    }

    /// Map local ranks of `self` to local ranks of `other`.
    ///
    /// Each entry of `ranks` must be a valid local rank in `self`; the
    /// result holds the corresponding local rank in `other`, or
    /// [`UNDEFINED`] when the member is absent there.
    pub fn translate_ranks(&self, ranks: &[Rank], other: &Group) -> Result<Vec<Rank>, MpiError> {
        let mut out = Vec::with_capacity(ranks.len());
        for &r in ranks {
            if r < 0 || r as usize >= self.size() {
                return Err(MpiError::NoSuchRank {
                    rank: r,
                    size: self.size(),
                });
            }
            let global = self.members[r as usize];
            out.push(match other.rank_of(global) {
                Some(i) => i as Rank,
                None => UNDEFINED,
            });
        }
        Ok(out)
    }
}

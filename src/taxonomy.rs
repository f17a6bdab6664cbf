// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! # Component-Type Taxonomy
//!
//! A directed "valid parent" relation over component-type identifiers:
//! type A may be nested as a sub-component under type B only when the
//! relation allows it. Parent candidates are filtered up front so that a
//! cycle or self-reference can never be established, rather than being
//! detected after insertion.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{Result, WearError};

/// One component-type entry: an identifier, a display name, and the set of
/// types it may be nested under.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentTypeDef {
    pub id: i64,
    pub name: String,
    /// Types this type may be a sub-component of
    pub valid_parent_ids: Vec<i64>,
}

/// The full valid-parent relation, loaded into memory for filtering and
/// reachability checks.
#[derive(Debug, Clone, Default)]
pub struct Taxonomy {
    types: HashMap<i64, ComponentTypeDef>,
}

impl Taxonomy {
    pub fn new(defs: Vec<ComponentTypeDef>) -> Self {
        let types = defs.into_iter().map(|d| (d.id, d)).collect();
        Self { types }
    }

    pub fn get(&self, id: i64) -> Option<&ComponentTypeDef> {
        self.types.get(&id)
    }

    pub fn type_name(&self, id: i64) -> Option<&str> {
        self.types.get(&id).map(|d| d.name.as_str())
    }

    /// All type ids, sorted for stable presentation.
    pub fn type_ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.types.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Every type reachable from `id` by following valid-parent edges.
    pub fn ancestors(&self, id: i64) -> HashSet<i64> {
        let mut seen = HashSet::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            let Some(def) = self.types.get(&current) else {
                continue;
            };
            for &parent in &def.valid_parent_ids {
                if seen.insert(parent) {
                    stack.push(parent);
                }
            }
        }
        seen
    }

    /// Whether `child` may nest directly under `parent`.
    pub fn allows_nesting(&self, child: i64, parent: i64) -> bool {
        self.types
            .get(&child)
            .map(|d| d.valid_parent_ids.contains(&parent))
            .unwrap_or(false)
    }

    /// Types that may appear as a direct parent category of `child`.
    pub fn parent_types_of(&self, child: i64) -> Vec<i64> {
        let mut ids = self
            .types
            .get(&child)
            .map(|d| d.valid_parent_ids.clone())
            .unwrap_or_default();
        ids.sort_unstable();
        ids
    }

    /// Types that list `parent` as a valid parent category.
    pub fn child_types_of(&self, parent: i64) -> Vec<i64> {
        let mut ids: Vec<i64> = self
            .types
            .values()
            .filter(|d| d.valid_parent_ids.contains(&parent))
            .map(|d| d.id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Candidate parent types to present when editing the relation for
    /// `exclude`. Three conditions filter the set: a type is never its own
    /// parent, a type already reachable from `exclude` upward is out
    /// (would close a loop), and so is any type that can reach `exclude`
    /// upward (it already nests below it).
    pub fn candidate_parent_types(&self, exclude: i64) -> Vec<i64> {
        let ancestors = self.ancestors(exclude);
        let mut ids: Vec<i64> = self
            .types
            .keys()
            .copied()
            .filter(|&id| id != exclude)
            .filter(|&id| !ancestors.contains(&id))
            .filter(|&id| !self.ancestors(id).contains(&exclude))
            .collect();
        ids.sort_unstable();
        ids
    }
}

/// Validate a proposed parent edge between two concrete components.
///
/// `tree` maps component id to parent id for the owning bike. The edge is
/// rejected when the candidate is the component itself, when the candidate
/// already sits below the component in the tree, or when the taxonomy does
/// not allow the component's type under the candidate's type.
pub fn validate_component_parent(
    component_id: Uuid,
    component_type: i64,
    candidate_id: Uuid,
    candidate_type: i64,
    tree: &HashMap<Uuid, Option<Uuid>>,
    taxonomy: &Taxonomy,
) -> Result<()> {
    if candidate_id == component_id {
        return Err(WearError::StructuralViolation(
            "a component cannot be its own parent".to_string(),
        ));
    }

    // Walk up from the candidate; hitting the component means the candidate
    // is a descendant and the edge would close a cycle.
    let mut cursor = Some(candidate_id);
    let mut hops = 0usize;
    while let Some(current) = cursor {
        if current == component_id {
            return Err(WearError::StructuralViolation(format!(
                "component {candidate_id} is a descendant of {component_id}"
            )));
        }
        hops += 1;
        if hops > tree.len() {
            break;
        }
        cursor = tree.get(&current).copied().flatten();
    }

    if !taxonomy.allows_nesting(component_type, candidate_type) {
        let name = taxonomy
            .type_name(candidate_type)
            .unwrap_or("unknown")
            .to_string();
        return Err(WearError::StructuralViolation(format!(
            "type {name} is not a valid parent category"
        )));
    }

    Ok(())
}

/// Well-known seed type ids, used by the default rule templates.
pub mod type_ids {
    pub const CHAIN: i64 = 0;
    pub const JOCKEY_WHEELS: i64 = 1;
    pub const CHAIN_RING: i64 = 2;
    pub const BRAKE_PADS: i64 = 3;
    pub const FRONT_WHEEL: i64 = 4;
    pub const REAR_WHEEL: i64 = 5;
    pub const CASSETTE: i64 = 6;
    pub const TYRE: i64 = 7;
    pub const DISC_ROTOR: i64 = 8;
    pub const CHAIN_LINK: i64 = 9;
    pub const BOTTOM_BRACKET: i64 = 10;
    pub const SHOCK: i64 = 11;
    pub const FORK: i64 = 12;
    pub const DROPPER_POST: i64 = 13;
    pub const SEALANT: i64 = 14;
    pub const FRONT_BRAKE: i64 = 15;
    pub const REAR_BRAKE: i64 = 16;
}

/// The default component-type set installed on first run.
pub fn default_types() -> Vec<ComponentTypeDef> {
    use type_ids::*;

    let def = |id: i64, name: &str, parents: &[i64]| ComponentTypeDef {
        id,
        name: name.to_string(),
        valid_parent_ids: parents.to_vec(),
    };

    vec![
        def(CHAIN, "Chain", &[]),
        def(JOCKEY_WHEELS, "Jockey Wheels", &[]),
        def(CHAIN_RING, "Chain Ring", &[]),
        def(BRAKE_PADS, "Brake Pads", &[FRONT_BRAKE, REAR_BRAKE]),
        def(FRONT_WHEEL, "Front Wheel", &[]),
        def(REAR_WHEEL, "Rear Wheel", &[]),
        def(CASSETTE, "Cassette", &[REAR_WHEEL]),
        def(TYRE, "Tyre", &[FRONT_WHEEL, REAR_WHEEL]),
        def(DISC_ROTOR, "Disc rotor", &[FRONT_WHEEL, REAR_WHEEL]),
        def(CHAIN_LINK, "Chain link", &[CHAIN]),
        def(BOTTOM_BRACKET, "Bottom Bracket", &[]),
        def(SHOCK, "Shock", &[]),
        def(FORK, "Fork", &[]),
        def(DROPPER_POST, "Dropper post", &[]),
        def(SEALANT, "Sealant", &[TYRE]),
        def(FRONT_BRAKE, "Front Brake", &[]),
        def(REAR_BRAKE, "Rear Brake", &[]),
    ]
}

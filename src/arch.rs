//! Process-wide architecture configuration (§9 "Global configuration").
//!
//! One `Architecture` is built before any function analysis and torn down
//! after all functions are processed; every function container holds its
//! handle explicitly (`Rc<Architecture>`), never through a mutable
//! singleton. Analysis is single-threaded per function (§5), so `Rc` rather
//! than `Arc` is the right handle here.

use std::collections::HashMap;

use crate::address::{SpaceId, SpaceKind};
use crate::lanedreg::LanedRegisterRegistry;

/// One entry of the address-space table.
#[derive(Debug, Clone)]
pub struct SpaceInfo {
    pub id: SpaceId,
    pub name: String,
    pub kind: SpaceKind,
    /// Word size in bytes used for scaling offsets in this space, as
    /// consulted by pointer-arithmetic typing rules (C9).
    pub word_size: u32,
}

/// Immutable, process-wide architecture description.
#[derive(Debug, Clone)]
pub struct Architecture {
    spaces: Vec<SpaceInfo>,
    by_name: HashMap<String, SpaceId>,
    /// Order in which heritage (C7) visits address spaces. Not necessarily
    /// the declaration order: the unique-temp space is always heritaged
    /// first since temporaries never alias, then code/data, stack last so
    /// that stack-relative loads see already-resolved frame offsets. This
    /// choice is documented in DESIGN.md (§9 open question).
    heritage_order: Vec<SpaceId>,
    pub laned_registers: LanedRegisterRegistry,
    pub default_code_space: SpaceId,
    pub default_unique_space: SpaceId,
    pub constant_space: SpaceId,
}

impl Architecture {
    pub fn builder() -> ArchitectureBuilder {
        ArchitectureBuilder::default()
    }

    pub fn space(&self, id: SpaceId) -> Option<&SpaceInfo> {
        self.spaces.iter().find(|s| s.id == id)
    }

    pub fn space_by_name(&self, name: &str) -> Option<SpaceId> {
        self.by_name.get(name).copied()
    }

    pub fn heritage_order(&self) -> &[SpaceId] {
        &self.heritage_order
    }
}

#[derive(Default)]
pub struct ArchitectureBuilder {
    spaces: Vec<SpaceInfo>,
    heritage_order: Vec<SpaceId>,
    laned_registers: LanedRegisterRegistry,
}

impl ArchitectureBuilder {
    pub fn add_space(mut self, id: SpaceId, name: impl Into<String>, kind: SpaceKind, word_size: u32) -> Self {
        self.spaces.push(SpaceInfo { id, name: name.into(), kind, word_size });
        self
    }

    pub fn heritage_order(mut self, order: Vec<SpaceId>) -> Self {
        self.heritage_order = order;
        self
    }

    pub fn laned_registers(mut self, registry: LanedRegisterRegistry) -> Self {
        self.laned_registers = registry;
        self
    }

    pub fn build(self) -> anyhow::Result<Architecture> {
        anyhow::ensure!(!self.spaces.is_empty(), "architecture must declare at least one space");
        let by_name = self.spaces.iter().map(|s| (s.name.clone(), s.id)).collect();
        let unique = self
            .spaces
            .iter()
            .find(|s| matches!(s.kind, SpaceKind::Unique))
            .ok_or_else(|| anyhow::anyhow!("architecture must declare a unique-temp space"))?
            .id;
        let code = self
            .spaces
            .iter()
            .find(|s| matches!(s.kind, SpaceKind::Code))
            .ok_or_else(|| anyhow::anyhow!("architecture must declare a code space"))?
            .id;
        let constant = self
            .spaces
            .iter()
            .find(|s| matches!(s.kind, SpaceKind::Constant))
            .ok_or_else(|| anyhow::anyhow!("architecture must declare a constant space"))?
            .id;
        let heritage_order = if self.heritage_order.is_empty() {
            // default: unique first, then declaration order of the rest.
            let mut order = vec![unique];
            order.extend(self.spaces.iter().map(|s| s.id).filter(|&id| id != unique));
            order
        } else {
            self.heritage_order
        };
        Ok(Architecture {
            spaces: self.spaces,
            by_name,
            heritage_order,
            laned_registers: self.laned_registers,
            default_code_space: code,
            default_unique_space: unique,
            constant_space: constant,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_defaults_heritage_order_to_unique_first() {
        let arch = Architecture::builder()
            .add_space(SpaceId(0), "ram", SpaceKind::Data, 1)
            .add_space(SpaceId(1), "unique", SpaceKind::Unique, 1)
            .add_space(SpaceId(2), "code", SpaceKind::Code, 1)
            .add_space(SpaceId(3), "const", SpaceKind::Constant, 1)
            .build()
            .unwrap();
        assert_eq!(arch.heritage_order()[0], SpaceId(1));
    }

    #[test]
    fn builder_requires_unique_space() {
        let result = Architecture::builder()
            .add_space(SpaceId(0), "ram", SpaceKind::Data, 1)
            .add_space(SpaceId(2), "code", SpaceKind::Code, 1)
            .add_space(SpaceId(3), "const", SpaceKind::Constant, 1)
            .build();
        assert!(result.is_err());
    }
}

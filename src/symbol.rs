//! Symbol table & nested scopes (C12).

use std::collections::HashMap;

use crate::address::{Address, AddressRange};
use crate::external::TypeId;
use crate::rangemap::SubRangeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct SymbolId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct ScopeId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolKind {
    /// Ordinary storage-backed local/global.
    Value,
    /// Keyed by `(code address, data-flow hash)` rather than storage
    /// address; used for temporaries with no stable storage.
    Dynamic { defining_hash: u64 },
    /// A printing override (e.g. an enum constant substituted for a
    /// literal).
    Equate,
    /// Forces a union facet for all edges referencing this symbol.
    UnionFacet { field: u32 },
    Function,
}

#[derive(Debug, Clone)]
pub struct Symbol {
    pub id: SymbolId,
    pub scope: ScopeId,
    pub name: String,
    pub data_type: Option<TypeId>,
    pub storage: Option<AddressRange>,
    pub kind: SymbolKind,
    pub type_locked: bool,
    pub name_locked: bool,
    /// Savable across a `purge`: subtable locals of unused macros and
    /// symbols belonging to now-empty scopes are marked unsavable and
    /// removed.
    pub savable: bool,
}

#[derive(Default)]
struct Scope {
    parent: Option<ScopeId>,
    children: Vec<ScopeId>,
    by_name: HashMap<String, SymbolId>,
    by_address: SubRangeMap<u64, SymbolId, u32>,
}

#[derive(Default)]
pub struct SymbolTable {
    symbols: Vec<Option<Symbol>>,
    scopes: Vec<Option<Scope>>,
    current: ScopeId,
    next_symbol: u32,
    next_hash_lookup: HashMap<(Address, u64), SymbolId>,
}

impl SymbolTable {
    pub fn new() -> Self {
        let mut table = SymbolTable { current: ScopeId(0), ..Self::default() };
        table.scopes.push(Some(Scope::default()));
        table
    }

    pub fn global_scope(&self) -> ScopeId {
        ScopeId(0)
    }

    pub fn current_scope(&self) -> ScopeId {
        self.current
    }

    pub fn add_scope(&mut self) -> ScopeId {
        let id = ScopeId(self.scopes.len() as u32);
        self.scopes.push(Some(Scope { parent: Some(self.current), ..Scope::default() }));
        self.scopes[self.current.0 as usize].as_mut().unwrap().children.push(id);
        self.current = id;
        id
    }

    pub fn pop_scope(&mut self) {
        if let Some(parent) = self.scopes[self.current.0 as usize].as_ref().and_then(|s| s.parent) {
            self.current = parent;
        }
    }

    pub fn declare(
        &mut self,
        scope: ScopeId,
        name: impl Into<String>,
        data_type: Option<TypeId>,
        storage: Option<AddressRange>,
        kind: SymbolKind,
    ) -> SymbolId {
        let id = SymbolId(self.next_symbol);
        self.next_symbol += 1;
        let name = name.into();
        let symbol = Symbol {
            id,
            scope,
            name: name.clone(),
            data_type,
            storage,
            kind,
            type_locked: false,
            name_locked: false,
            savable: true,
        };
        if let SymbolKind::Dynamic { defining_hash } = symbol.kind {
            if let Some(storage) = storage {
                self.next_hash_lookup.insert((storage.start(), defining_hash), id);
            }
        }
        let scope_rec = self.scopes[scope.0 as usize].as_mut().expect("unknown scope");
        scope_rec.by_name.insert(name, id);
        if let Some(range) = storage {
            scope_rec.by_address.insert(id, range.first, range.last, 0u32);
        }
        if id.0 as usize >= self.symbols.len() {
            self.symbols.resize(id.0 as usize + 1, None);
        }
        self.symbols[id.0 as usize] = Some(symbol);
        id
    }

    pub fn get(&self, id: SymbolId) -> Option<&Symbol> {
        self.symbols.get(id.0 as usize).and_then(|s| s.as_ref())
    }

    pub fn get_mut(&mut self, id: SymbolId) -> Option<&mut Symbol> {
        self.symbols.get_mut(id.0 as usize).and_then(|s| s.as_mut())
    }

    /// Looks up `name`, walking parent scopes on a miss.
    pub fn lookup_by_name(&self, start: ScopeId, name: &str) -> Option<SymbolId> {
        let mut cur = Some(start);
        while let Some(scope_id) = cur {
            let scope = self.scopes[scope_id.0 as usize].as_ref()?;
            if let Some(&id) = scope.by_name.get(name) {
                return Some(id);
            }
            cur = scope.parent;
        }
        None
    }

    pub fn lookup_by_address(&self, scope: ScopeId, address: Address) -> Option<SymbolId> {
        self.scopes[scope.0 as usize].as_ref()?.by_address.find(address.offset)?.records().next().copied()
    }

    pub fn lookup_dynamic(&self, address: Address, hash: u64) -> Option<SymbolId> {
        self.next_hash_lookup.get(&(address, hash)).copied()
    }

    /// Removes unsavable symbols and renumbers the remaining symbols and
    /// scopes so ids stay dense (§4.12).
    pub fn purge(&mut self) {
        let kept_symbols: Vec<Symbol> = self.symbols.drain(..).flatten().filter(|s| s.savable).collect();
        let remap: HashMap<SymbolId, SymbolId> =
            kept_symbols.iter().enumerate().map(|(i, s)| (s.id, SymbolId(i as u32))).collect();

        self.symbols = kept_symbols
            .into_iter()
            .enumerate()
            .map(|(i, mut s)| {
                s.id = SymbolId(i as u32);
                Some(s)
            })
            .collect();
        self.next_symbol = self.symbols.len() as u32;

        for scope in self.scopes.iter_mut().flatten() {
            for (_, id) in scope.by_name.iter_mut() {
                if let Some(&new_id) = remap.get(id) {
                    *id = new_id;
                }
            }
            scope.by_name.retain(|_, id| remap.values().any(|&v| v == *id) || remap.contains_key(id));
        }
        self.next_hash_lookup.retain(|_, id| remap.contains_key(id));
        for id in self.next_hash_lookup.values_mut() {
            if let Some(&new_id) = remap.get(id) {
                *id = new_id;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_scope_then_pop_returns_to_parent() {
        let mut table = SymbolTable::new();
        let global = table.current_scope();
        let child = table.add_scope();
        assert_ne!(global, child);
        table.pop_scope();
        assert_eq!(table.current_scope(), global);
    }

    #[test]
    fn lookup_by_name_walks_parent_scopes() {
        let mut table = SymbolTable::new();
        let global = table.global_scope();
        table.declare(global, "g_counter", None, None, SymbolKind::Value);
        let child = table.add_scope();
        assert_eq!(table.lookup_by_name(child, "g_counter"), table.lookup_by_name(global, "g_counter"));
    }

    #[test]
    fn purge_removes_unsavable_and_renumbers_densely() {
        let mut table = SymbolTable::new();
        let global = table.global_scope();
        let a = table.declare(global, "a", None, None, SymbolKind::Value);
        let b = table.declare(global, "b", None, None, SymbolKind::Value);
        table.get_mut(a).unwrap().savable = false;
        table.purge();
        assert!(table.get(a).is_none() || table.get(SymbolId(0)).unwrap().name != "a");
        assert_eq!(table.get(SymbolId(0)).unwrap().name, "b");
        let _ = b;
    }
}

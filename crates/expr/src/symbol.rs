use indexmap::IndexMap;

use crate::expr::Expr;
use crate::loc::SourceLoc;
use crate::ExprError;

/// Index of a section within an object, in creation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SectionId(pub u32);

/// Interned symbol handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SymbolId(u32);

impl SymbolId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone)]
pub enum SymbolBinding {
    /// Referenced but not yet given a meaning.
    Undefined,
    /// Compile-time constant definition, inline-expanded during
    /// simplification.
    Equ(Expr),
    /// A position: the byte offset of bytecode `bc_index` within `section`.
    /// An index equal to the section's bytecode count is the end of the
    /// section.
    Label { section: SectionId, bc_index: u32 },
}

#[derive(Debug, Clone)]
struct SymbolData {
    binding: SymbolBinding,
    loc: SourceLoc,
}

/// Symbol storage shared by expression simplification and bytecode
/// resolution. Insertion order is preserved so listings and object output
/// are deterministic.
#[derive(Debug, Clone, Default)]
pub struct SymbolTable {
    entries: IndexMap<String, SymbolData>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch or create a symbol by name; new symbols start `Undefined`.
    pub fn intern(&mut self, name: &str) -> SymbolId {
        if let Some(index) = self.entries.get_index_of(name) {
            return SymbolId(index as u32);
        }
        let (index, _) = self.entries.insert_full(
            name.to_string(),
            SymbolData {
                binding: SymbolBinding::Undefined,
                loc: SourceLoc::unknown(),
            },
        );
        SymbolId(index as u32)
    }

    pub fn lookup(&self, name: &str) -> Option<SymbolId> {
        self.entries.get_index_of(name).map(|i| SymbolId(i as u32))
    }

    pub fn define_equ(&mut self, id: SymbolId, def: Expr, loc: SourceLoc) -> Result<(), ExprError> {
        self.define(id, SymbolBinding::Equ(def), loc)
    }

    pub fn define_label(
        &mut self,
        id: SymbolId,
        section: SectionId,
        bc_index: u32,
        loc: SourceLoc,
    ) -> Result<(), ExprError> {
        self.define(id, SymbolBinding::Label { section, bc_index }, loc)
    }

    fn define(
        &mut self,
        id: SymbolId,
        binding: SymbolBinding,
        loc: SourceLoc,
    ) -> Result<(), ExprError> {
        let (name, data) = self
            .entries
            .get_index_mut(id.index())
            .expect("symbol id belongs to this table");
        if !matches!(data.binding, SymbolBinding::Undefined) {
            return Err(ExprError::Redefined {
                name: name.clone(),
                prev: data.loc.clone(),
                loc,
            });
        }
        data.binding = binding;
        data.loc = loc;
        Ok(())
    }

    pub fn binding(&self, id: SymbolId) -> &SymbolBinding {
        &self
            .entries
            .get_index(id.index())
            .expect("symbol id belongs to this table")
            .1
            .binding
    }

    pub fn name(&self, id: SymbolId) -> &str {
        self.entries
            .get_index(id.index())
            .expect("symbol id belongs to this table")
            .0
    }

    pub fn loc(&self, id: SymbolId) -> &SourceLoc {
        &self
            .entries
            .get_index(id.index())
            .expect("symbol id belongs to this table")
            .1
            .loc
    }

    pub fn is_label(&self, id: SymbolId) -> bool {
        matches!(self.binding(id), SymbolBinding::Label { .. })
    }

    pub fn iter(&self) -> impl Iterator<Item = (SymbolId, &str, &SymbolBinding)> {
        self.entries
            .iter()
            .enumerate()
            .map(|(index, (name, data))| (SymbolId(index as u32), name.as_str(), &data.binding))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::Expr;

    #[test]
    fn interning_is_idempotent() {
        let mut table = SymbolTable::new();
        let a = table.intern("start");
        let b = table.intern("start");
        assert_eq!(a, b);
        assert_eq!(table.name(a), "start");
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn rejects_redefinition() {
        let mut table = SymbolTable::new();
        let id = table.intern("width");
        table
            .define_equ(id, Expr::int(8, SourceLoc::unknown()), SourceLoc::new("a.asm", 1))
            .expect("first definition");
        let err = table
            .define_label(id, SectionId(0), 0, SourceLoc::new("a.asm", 9))
            .expect_err("second definition");
        assert!(matches!(err, ExprError::Redefined { .. }));
    }
}

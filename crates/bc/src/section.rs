use indexmap::IndexMap;

use girder_expr::{ExprError, SectionId, SourceLoc, SymbolId, SymbolTable};
use girder_num::IntNum;

use crate::bytecode::Bytecode;
use crate::error::BcError;

/// Resolution progress, strictly monotonic. `InProgress` marks a section the
/// optimizer has entered but not finished; a length query landing in such a
/// section from another one is a mutual dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SectionState {
    #[default]
    NotStarted,
    InProgress,
    Done,
}

/// An ordered run of bytecodes. `origin` present means the section is
/// absolute: its labels collapse to concrete addresses during expression
/// simplification.
#[derive(Debug)]
pub struct Section {
    pub name: String,
    pub origin: Option<IntNum>,
    pub(crate) bytecodes: Vec<Bytecode>,
    pub(crate) state: SectionState,
    /// Bytecodes below this index have a known offset and length.
    pub(crate) resolved: usize,
    pub(crate) total: u64,
}

impl Section {
    fn new(name: String, origin: Option<IntNum>) -> Self {
        Self {
            name,
            origin,
            bytecodes: Vec::new(),
            state: SectionState::NotStarted,
            resolved: 0,
            total: 0,
        }
    }

    pub fn bytecodes(&self) -> &[Bytecode] {
        &self.bytecodes
    }

    pub fn state(&self) -> SectionState {
        self.state
    }

    /// Total byte length; meaningful once the section is `Done`.
    pub fn len_bytes(&self) -> u64 {
        self.total
    }
}

/// A whole program being resolved: named sections plus the symbol table
/// their labels live in. Section identity is insertion order.
#[derive(Debug, Default)]
pub struct Object {
    pub symbols: SymbolTable,
    pub(crate) sections: IndexMap<String, Section>,
}

impl Object {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a section, or return the existing one of the same name.
    pub fn add_section(&mut self, name: &str, origin: Option<IntNum>) -> SectionId {
        if let Some(index) = self.sections.get_index_of(name) {
            return SectionId(index as u32);
        }
        let (index, _) = self
            .sections
            .insert_full(name.to_string(), Section::new(name.to_string(), origin));
        SectionId(index as u32)
    }

    pub fn section(&self, id: SectionId) -> &Section {
        self.sections
            .get_index(id.0 as usize)
            .map(|(_, section)| section)
            .unwrap_or_else(|| panic!("section id {} out of range", id.0))
    }

    pub(crate) fn section_mut(&mut self, id: SectionId) -> &mut Section {
        self.sections
            .get_index_mut(id.0 as usize)
            .map(|(_, section)| section)
            .unwrap_or_else(|| panic!("section id {} out of range", id.0))
    }

    pub fn section_count(&self) -> usize {
        self.sections.len()
    }

    pub fn sections(&self) -> impl Iterator<Item = (SectionId, &Section)> {
        self.sections
            .values()
            .enumerate()
            .map(|(index, section)| (SectionId(index as u32), section))
    }

    /// Append a bytecode; returns its index within the section.
    pub fn add_bytecode(&mut self, id: SectionId, bc: Bytecode) -> u32 {
        let section = self.section_mut(id);
        let index = section.bytecodes.len() as u32;
        section.bytecodes.push(bc);
        index
    }

    /// Bind a label to the current end of the section: the offset of the
    /// next bytecode added, or the section end if none follows.
    pub fn define_label(
        &mut self,
        id: SectionId,
        name: &str,
        loc: SourceLoc,
    ) -> Result<SymbolId, ExprError> {
        let index = self.section(id).bytecodes.len() as u32;
        let sym = self.symbols.intern(name);
        self.symbols.define_label(sym, id, index, loc)?;
        Ok(sym)
    }

    /// Finalize every bytecode, in section order. Runs once, between
    /// front-end construction and optimization.
    pub fn finalize(&mut self) -> Result<(), BcError> {
        let symbols = &self.symbols;
        for section in self.sections.values_mut() {
            for bc in &mut section.bytecodes {
                bc.finalize(symbols)?;
            }
        }
        Ok(())
    }
}

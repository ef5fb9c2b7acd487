use std::mem;

use girder_expr::{
    ExprError, LabelResolver, SectionId, SourceLoc, SymbolBinding, SymbolId, SymbolTable,
};
use girder_num::{IntNum, Op};

use crate::bytecode::Resolution;
use crate::error::BcError;
use crate::section::{Object, SectionState};

/// Resolve every bytecode length and offset in the object. On success the
/// returned `Positions` snapshot answers label queries for emission.
pub fn resolve_object(object: &mut Object) -> Result<Positions, BcError> {
    let symbols = mem::take(&mut object.symbols);
    let result = optimize(object, &symbols);
    object.symbols = symbols;
    result
}

fn optimize(object: &mut Object, symtab: &SymbolTable) -> Result<Positions, BcError> {
    let mut optimizer = Optimizer {
        object,
        symtab,
        chain: Vec::new(),
    };
    for index in 0..optimizer.object.section_count() {
        optimizer.pass1(SectionId(index as u32))?;
    }
    optimizer.pass2()?;
    Ok(Positions::from_object(optimizer.object))
}

/// Pass 1 walks sections lazily (a distance query into an untouched section
/// runs its walk first), assigning provisional offsets; pass 2 re-walks with
/// every position known and commits. Lengths never shrink between passes, so
/// pass-1 offsets are final.
struct Optimizer<'a> {
    object: &'a mut Object,
    symtab: &'a SymbolTable,
    /// Sections currently being walked, outermost first. A query landing in
    /// an `InProgress` section that is not the innermost entry is a mutual
    /// section dependency.
    chain: Vec<SectionId>,
}

impl Optimizer<'_> {
    fn pass1(&mut self, id: SectionId) -> Result<(), BcError> {
        match self.object.section(id).state {
            SectionState::Done => return Ok(()),
            SectionState::InProgress => {
                return Err(BcError::CircularReference {
                    what: format!(
                        "section `{}` depends on its own layout",
                        self.object.section(id).name
                    ),
                    loc: SourceLoc::unknown(),
                });
            }
            SectionState::NotStarted => {}
        }
        self.object.section_mut(id).state = SectionState::InProgress;
        self.chain.push(id);
        let walked = self.walk_pass1(id);
        self.chain.pop();
        walked?;
        self.object.section_mut(id).state = SectionState::Done;
        Ok(())
    }

    fn walk_pass1(&mut self, id: SectionId) -> Result<(), BcError> {
        let count = self.object.section(id).bytecodes.len();
        let mut running = 0u64;
        for i in 0..count {
            let mut bc = mem::take(&mut self.object.section_mut(id).bytecodes[i]);
            {
                // The placeholder keeps the slot answering offset queries
                // while the real bytecode is out being resolved; a bytecode
                // may reference a label bound to its own index.
                let section = self.object.section_mut(id);
                section.bytecodes[i].set_offset(running);
                section.resolved = i + 1;
            }
            let symtab = self.symtab;
            let outcome = bc.resolve(false, running, symtab, self);
            self.object.section_mut(id).bytecodes[i] = bc;
            outcome?;
            running += self.object.section(id).bytecodes[i].len();
        }
        self.object.section_mut(id).total = running;
        Ok(())
    }

    fn pass2(&mut self) -> Result<(), BcError> {
        for index in 0..self.object.section_count() {
            let id = SectionId(index as u32);
            let count = self.object.section(id).bytecodes.len();
            let mut running = 0u64;
            for i in 0..count {
                let expected = self.object.section(id).bytecodes[i].len();
                let confidence = self.object.section(id).bytecodes[i].resolution();
                let mut bc = mem::take(&mut self.object.section_mut(id).bytecodes[i]);
                self.object.section_mut(id).bytecodes[i].set_offset(running);
                let symtab = self.symtab;
                let outcome = bc.resolve(true, running, symtab, self);
                self.object.section_mut(id).bytecodes[i] = bc;
                outcome?;
                let actual = self.object.section(id).bytecodes[i].len();
                if actual != expected {
                    let loc = self.object.section(id).bytecodes[i].loc().clone();
                    let detail = match confidence {
                        Resolution::Minimum => "final length changed between passes",
                        Resolution::Estimate => "estimated length did not settle by the second pass",
                    };
                    return Err(BcError::Internal(format!(
                        "{detail} at {loc} ({expected} -> {actual})"
                    )));
                }
                running += actual;
            }
        }
        Ok(())
    }

    fn offset_at(&self, id: SectionId, bc_index: u32) -> u64 {
        let section = self.object.section(id);
        if bc_index as usize == section.bytecodes.len() {
            section.total
        } else {
            section.bytecodes[bc_index as usize].offset()
        }
    }
}

impl LabelResolver for Optimizer<'_> {
    fn label_offset(&mut self, sym: SymbolId) -> Result<Option<(SectionId, u64)>, ExprError> {
        let SymbolBinding::Label { section, bc_index } = *self.symtab.binding(sym) else {
            return Ok(None);
        };
        match self.object.section(section).state {
            SectionState::Done => Ok(Some((section, self.offset_at(section, bc_index)))),
            SectionState::InProgress => {
                if (bc_index as usize) < self.object.section(section).resolved {
                    Ok(Some((section, self.offset_at(section, bc_index))))
                } else if self.chain.last() == Some(&section) {
                    // Forward reference within the section being walked:
                    // unknown for now, pass 2 sees it.
                    Ok(None)
                } else {
                    Err(ExprError::CircularReference {
                        name: self.symtab.name(sym).to_string(),
                        loc: self.symtab.loc(sym).clone(),
                    })
                }
            }
            SectionState::NotStarted => {
                self.pass1(section).map_err(|err| match err {
                    BcError::Expr(inner) => inner,
                    other => ExprError::Resolver(other.to_string()),
                })?;
                Ok(Some((section, self.offset_at(section, bc_index))))
            }
        }
    }

    fn label_address(&mut self, sym: SymbolId) -> Result<Option<IntNum>, ExprError> {
        let Some((section, offset)) = self.label_offset(sym)? else {
            return Ok(None);
        };
        let Some(origin) = self.object.section(section).origin.clone() else {
            return Ok(None);
        };
        let mut address = origin;
        address
            .calc(Op::Add, Some(&IntNum::from(offset as i64)))
            .map_err(|source| ExprError::Arith {
                source,
                loc: self.symtab.loc(sym).clone(),
            })?;
        Ok(Some(address))
    }
}

/// Final offsets and lengths, detached from the object so emission can
/// borrow both independently.
#[derive(Debug, Clone)]
pub struct Positions {
    sections: Vec<SectionPos>,
}

#[derive(Debug, Clone)]
struct SectionPos {
    origin: Option<IntNum>,
    offsets: Vec<u64>,
    total: u64,
}

impl Positions {
    fn from_object(object: &Object) -> Self {
        let sections = object
            .sections
            .values()
            .map(|section| SectionPos {
                origin: section.origin.clone(),
                offsets: section.bytecodes.iter().map(|bc| bc.offset()).collect(),
                total: section.total,
            })
            .collect();
        Self { sections }
    }

    /// Offset of bytecode `bc_index`; an index one past the last bytecode is
    /// the section end.
    pub fn offset(&self, section: SectionId, bc_index: u32) -> u64 {
        let pos = &self.sections[section.0 as usize];
        if bc_index as usize == pos.offsets.len() {
            pos.total
        } else {
            pos.offsets[bc_index as usize]
        }
    }

    pub fn section_len(&self, section: SectionId) -> u64 {
        self.sections[section.0 as usize].total
    }

    pub fn origin(&self, section: SectionId) -> Option<&IntNum> {
        self.sections[section.0 as usize].origin.as_ref()
    }

    pub fn resolver<'a>(&'a self, symtab: &'a SymbolTable) -> PosResolver<'a> {
        PosResolver {
            positions: self,
            symtab,
        }
    }
}

/// `LabelResolver` over a finished layout; every label answers.
pub struct PosResolver<'a> {
    positions: &'a Positions,
    symtab: &'a SymbolTable,
}

impl LabelResolver for PosResolver<'_> {
    fn label_offset(&mut self, sym: SymbolId) -> Result<Option<(SectionId, u64)>, ExprError> {
        let SymbolBinding::Label { section, bc_index } = *self.symtab.binding(sym) else {
            return Ok(None);
        };
        Ok(Some((section, self.positions.offset(section, bc_index))))
    }

    fn label_address(&mut self, sym: SymbolId) -> Result<Option<IntNum>, ExprError> {
        let Some((section, offset)) = self.label_offset(sym)? else {
            return Ok(None);
        };
        let Some(origin) = self.positions.origin(section) else {
            return Ok(None);
        };
        let mut address = origin.clone();
        address
            .calc(Op::Add, Some(&IntNum::from(offset as i64)))
            .map_err(|source| ExprError::Arith {
                source,
                loc: self.symtab.loc(sym).clone(),
            })?;
        Ok(Some(address))
    }
}

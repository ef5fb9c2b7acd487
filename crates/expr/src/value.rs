use girder_num::IntNum;

use crate::ExprError;
use crate::expr::{Expr, ExprOp, ExprTerm, LabelResolver};
use crate::loc::SourceLoc;
use crate::symbol::{SectionId, SymbolBinding, SymbolId, SymbolTable};

/// A classified operand: an absolute remainder plus at most one relocatable
/// symbol, with the encoding attributes the emitter needs. Produced from a
/// raw `Expr` before any positions are known.
#[derive(Debug, Clone)]
pub struct Value {
    /// Absolute part; `None` means zero.
    pub abs: Option<Expr>,
    /// The single extracted relocatable symbol, if any.
    pub rel: Option<SymbolId>,
    /// Encoded width in bits.
    pub size: u32,
    /// Whether the encoded field is signed.
    pub sign: bool,
    /// Right shift applied to the final value before encoding.
    pub rshift: u32,
    /// Use the symbol's segment rather than its offset.
    pub seg_of: bool,
    /// Relative to the instruction pointer after this instruction.
    pub ip_rel: bool,
    /// The value is a jump target (candidates for short/near relaxation).
    pub jump_target: bool,
    /// Relative to the start of the symbol's section.
    pub section_rel: bool,
    pub loc: SourceLoc,
}

impl Value {
    /// Classify a raw expression for a field of `size` bits. The expression
    /// is simplified with no resolver, then relocatable symbols are
    /// extracted from the flattened additive form:
    ///
    /// - no symbols: purely absolute
    /// - each negated symbol pairs with a positive label in the same
    ///   section; the pair is a distance, kept in `abs` until positions are
    ///   known, and an unpaired negated symbol can never fold
    /// - one unpaired positive symbol: relocatable, remainder stays absolute
    /// - anything else: too complex to relocate
    pub fn finalize(
        mut expr: Expr,
        size: u32,
        symtab: &SymbolTable,
        used: SourceLoc,
    ) -> Result<Self, ExprError> {
        expr.simplify(symtab, None)?;
        let loc = expr.loc.clone();

        let mut value = Self {
            abs: None,
            rel: None,
            size,
            sign: false,
            rshift: 0,
            seg_of: false,
            ip_rel: false,
            jump_target: false,
            section_rel: false,
            loc,
        };

        match expr.op {
            ExprOp::Ident | ExprOp::Add => {
                let mut positive: Vec<usize> = Vec::new();
                let mut negated: Vec<SymbolId> = Vec::new();
                for (index, term) in expr.terms.iter().enumerate() {
                    match term {
                        ExprTerm::Int(_) | ExprTerm::Float(_) => {}
                        ExprTerm::Sym(_) => positive.push(index),
                        ExprTerm::Reg(_) => {
                            return Err(ExprError::InvalidValueKind { loc: used });
                        }
                        ExprTerm::Sub(sub) => {
                            if let Some(id) = negated_sym(sub) {
                                negated.push(id);
                            } else if contains_sym(sub) {
                                return Err(ExprError::TooComplex {
                                    loc: expr.loc.clone(),
                                    used,
                                });
                            }
                        }
                    }
                }
                // Pair each negated label with one positive label in the
                // same section; such a pair is a distance that folds once
                // positions are known. An unpaired negated symbol never
                // folds.
                let mut paired = vec![false; positive.len()];
                for &neg in &negated {
                    let Some(section) = label_section(symtab, neg) else {
                        return Err(ExprError::TooComplex {
                            loc: expr.loc.clone(),
                            used,
                        });
                    };
                    let mut mate = None;
                    for (slot, &index) in positive.iter().enumerate() {
                        if paired[slot] {
                            continue;
                        }
                        let ExprTerm::Sym(id) = expr.terms[index] else {
                            unreachable!("indexed a symbol term");
                        };
                        if label_section(symtab, id) == Some(section) {
                            mate = Some(slot);
                            break;
                        }
                    }
                    let Some(mate) = mate else {
                        return Err(ExprError::TooComplex {
                            loc: expr.loc.clone(),
                            used,
                        });
                    };
                    paired[mate] = true;
                }
                let unpaired: Vec<usize> = positive
                    .iter()
                    .enumerate()
                    .filter(|(slot, _)| !paired[*slot])
                    .map(|(_, &index)| index)
                    .collect();
                match unpaired.as_slice() {
                    [] => value.abs = non_zero(expr),
                    [index] => {
                        let ExprTerm::Sym(id) = expr.terms[*index] else {
                            unreachable!("indexed a symbol term");
                        };
                        value.rel = Some(id);
                        expr.terms.remove(*index);
                        if !expr.terms.is_empty() {
                            expr.simplify(symtab, None)?;
                            value.abs = non_zero(expr);
                        }
                    }
                    _ => {
                        return Err(ExprError::TooComplex {
                            loc: expr.loc.clone(),
                            used,
                        });
                    }
                }
            }
            _ => {
                if contains_sym(&expr) {
                    return Err(ExprError::TooComplex {
                        loc: expr.loc.clone(),
                        used,
                    });
                }
                if expr.terms.iter().any(|term| matches!(term, ExprTerm::Reg(_))) {
                    return Err(ExprError::InvalidValueKind { loc: used });
                }
                value.abs = non_zero(expr);
            }
        }

        Ok(value)
    }

    pub fn is_relocatable(&self) -> bool {
        self.rel.is_some()
    }

    /// Fold to a concrete integer, given final positions. `Ok(None)` means
    /// the value is still symbolic (unknown positions, or relocatable with
    /// no address).
    pub fn get_intnum(
        &self,
        symtab: &SymbolTable,
        mut resolver: Option<&mut dyn LabelResolver>,
    ) -> Result<Option<IntNum>, ExprError> {
        let mut total = match &self.abs {
            Some(abs) => {
                let mut abs = abs.clone();
                abs.simplify(symtab, resolver.as_deref_mut())?;
                if abs.contains_float() {
                    return Err(ExprError::InvalidValueKind {
                        loc: self.loc.clone(),
                    });
                }
                match abs.get_intnum() {
                    Some(value) => value.clone(),
                    None => return Ok(None),
                }
            }
            None => IntNum::zero(),
        };

        if let Some(rel) = self.rel {
            let Some(resolver) = resolver else {
                return Ok(None);
            };
            let Some(address) = resolver.label_address(rel)? else {
                return Ok(None);
            };
            total
                .calc(girder_num::Op::Add, Some(&address))
                .map_err(|source| ExprError::Arith {
                    source,
                    loc: self.loc.clone(),
                })?;
        }

        Ok(Some(total))
    }
}

/// Keep an absolute remainder only when it is not a plain zero.
fn non_zero(expr: Expr) -> Option<Expr> {
    match expr.get_intnum() {
        Some(value) if value.is_zero() => None,
        _ => Some(expr),
    }
}

fn label_section(symtab: &SymbolTable, sym: SymbolId) -> Option<SectionId> {
    match symtab.binding(sym) {
        SymbolBinding::Label { section, .. } => Some(*section),
        _ => None,
    }
}

/// Match the `(-1 * sym)` shape left by subtraction rewriting.
fn negated_sym(expr: &Expr) -> Option<SymbolId> {
    if expr.op != ExprOp::Mul || expr.terms.len() != 2 {
        return None;
    }
    match expr.terms.as_slice() {
        [ExprTerm::Int(minus1), ExprTerm::Sym(id)] | [ExprTerm::Sym(id), ExprTerm::Int(minus1)]
            if minus1.is_neg1() =>
        {
            Some(*id)
        }
        _ => None,
    }
}

fn contains_sym(expr: &Expr) -> bool {
    expr.terms.iter().any(|term| match term {
        ExprTerm::Sym(_) => true,
        ExprTerm::Sub(sub) => contains_sym(sub),
        _ => false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loc() -> SourceLoc {
        SourceLoc::unknown()
    }

    fn int(value: i64) -> Expr {
        Expr::int(value, loc())
    }

    /// Fixed label positions, with addresses for sections that have an
    /// origin listed.
    struct Table {
        offsets: Vec<(SymbolId, SectionId, u64)>,
        origins: Vec<(SectionId, i64)>,
    }

    impl LabelResolver for Table {
        fn label_offset(
            &mut self,
            sym: SymbolId,
        ) -> Result<Option<(SectionId, u64)>, ExprError> {
            Ok(self
                .offsets
                .iter()
                .find(|(id, _, _)| *id == sym)
                .map(|(_, section, offset)| (*section, *offset)))
        }

        fn label_address(&mut self, sym: SymbolId) -> Result<Option<IntNum>, ExprError> {
            let Some((section, offset)) = self.label_offset(sym)? else {
                return Ok(None);
            };
            Ok(self
                .origins
                .iter()
                .find(|(id, _)| *id == section)
                .map(|(_, origin)| IntNum::from(origin + offset as i64)))
        }
    }

    #[test]
    fn pure_constant_is_absolute() {
        let symtab = SymbolTable::new();
        let expr = Expr::binary(ExprOp::Mul, int(6), int(7), loc());
        let value = Value::finalize(expr, 16, &symtab, loc()).expect("finalize");
        assert!(value.rel.is_none());
        let folded = value.get_intnum(&symtab, None).expect("fold");
        assert_eq!(folded, Some(IntNum::from(42i64)));
    }

    #[test]
    fn single_label_is_extracted() {
        let mut symtab = SymbolTable::new();
        let start = symtab.intern("start");
        symtab
            .define_label(start, SectionId(0), 0, loc())
            .expect("label");

        let expr = Expr::binary(ExprOp::Add, Expr::sym(start, loc()), int(2), loc());
        let value = Value::finalize(expr, 16, &symtab, loc()).expect("finalize");
        assert_eq!(value.rel, Some(start));
        let abs = value.abs.as_ref().expect("remainder");
        assert_eq!(abs.get_intnum(), Some(&IntNum::from(2i64)));
    }

    #[test]
    fn two_labels_are_too_complex() {
        let mut symtab = SymbolTable::new();
        let a = symtab.intern("a");
        let b = symtab.intern("b");
        symtab.define_label(a, SectionId(0), 0, loc()).expect("label");
        symtab.define_label(b, SectionId(0), 1, loc()).expect("label");

        let expr = Expr::binary(
            ExprOp::Add,
            Expr::sym(a, loc()),
            Expr::sym(b, loc()),
            loc(),
        );
        let err = Value::finalize(expr, 16, &symtab, loc()).expect_err("too complex");
        assert!(matches!(err, ExprError::TooComplex { .. }));
    }

    #[test]
    fn label_under_multiply_is_too_complex() {
        let mut symtab = SymbolTable::new();
        let a = symtab.intern("a");
        symtab.define_label(a, SectionId(0), 0, loc()).expect("label");

        let expr = Expr::binary(ExprOp::Mul, Expr::sym(a, loc()), int(2), loc());
        let err = Value::finalize(expr, 16, &symtab, loc()).expect_err("too complex");
        assert!(matches!(err, ExprError::TooComplex { .. }));
    }

    #[test]
    fn pending_distance_stays_absolute() {
        let mut symtab = SymbolTable::new();
        let start = symtab.intern("start");
        let end = symtab.intern("end");
        symtab
            .define_label(start, SectionId(0), 0, loc())
            .expect("label");
        symtab
            .define_label(end, SectionId(0), 3, loc())
            .expect("label");

        let expr = Expr::binary(
            ExprOp::Sub,
            Expr::sym(end, loc()),
            Expr::sym(start, loc()),
            loc(),
        );
        let value = Value::finalize(expr, 16, &symtab, loc()).expect("finalize");
        assert!(value.rel.is_none());
        assert!(value.abs.is_some());
        // Without positions it cannot fold yet.
        let folded = value.get_intnum(&symtab, None).expect("fold attempt");
        assert!(folded.is_none());
    }

    #[test]
    fn label_beside_a_distance_pair_is_extracted() {
        let mut symtab = SymbolTable::new();
        let ext = symtab.intern("ext");
        let start = symtab.intern("start");
        let end = symtab.intern("end");
        symtab
            .define_label(ext, SectionId(1), 0, loc())
            .expect("label");
        symtab
            .define_label(start, SectionId(0), 0, loc())
            .expect("label");
        symtab
            .define_label(end, SectionId(0), 2, loc())
            .expect("label");

        // ext + (end - start): the pair is a distance, ext relocates.
        let distance = Expr::binary(
            ExprOp::Sub,
            Expr::sym(end, loc()),
            Expr::sym(start, loc()),
            loc(),
        );
        let expr = Expr::binary(ExprOp::Add, Expr::sym(ext, loc()), distance, loc());
        let value = Value::finalize(expr, 16, &symtab, loc()).expect("finalize");
        assert_eq!(value.rel, Some(ext));
        assert!(value.abs.is_some());

        let mut resolver = Table {
            offsets: vec![
                (ext, SectionId(1), 4),
                (start, SectionId(0), 6),
                (end, SectionId(0), 16),
            ],
            origins: vec![(SectionId(1), 0x200)],
        };
        let folded = value
            .get_intnum(&symtab, Some(&mut resolver))
            .expect("fold");
        assert_eq!(folded, Some(IntNum::from(0x200i64 + 4 + 10)));
    }

    #[test]
    fn extra_label_beyond_a_distance_is_too_complex() {
        let mut symtab = SymbolTable::new();
        let a = symtab.intern("a");
        let b = symtab.intern("b");
        let c = symtab.intern("c");
        symtab.define_label(a, SectionId(0), 0, loc()).expect("label");
        symtab.define_label(b, SectionId(0), 1, loc()).expect("label");
        symtab.define_label(c, SectionId(1), 0, loc()).expect("label");

        // a + b - c: nothing shares a section with c, so no pair forms and
        // two relocatable symbols would remain.
        let sum = Expr::binary(ExprOp::Add, Expr::sym(a, loc()), Expr::sym(b, loc()), loc());
        let expr = Expr::binary(ExprOp::Sub, sum, Expr::sym(c, loc()), loc());
        let err = Value::finalize(expr, 16, &symtab, loc()).expect_err("too complex");
        assert!(matches!(err, ExprError::TooComplex { .. }));
    }

    #[test]
    fn register_term_is_invalid() {
        let symtab = SymbolTable::new();
        let expr = Expr::binary(ExprOp::Add, Expr::reg(3, loc()), int(1), loc());
        let err = Value::finalize(expr, 16, &symtab, loc()).expect_err("register");
        assert!(matches!(err, ExprError::InvalidValueKind { .. }));
    }
}

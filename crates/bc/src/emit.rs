use girder_expr::{LabelResolver, SectionId, SymbolTable, Value};
use girder_num::{IntNum, Op};

use crate::bytecode::encode_const_le;
use crate::error::BcError;
use crate::optimize::Positions;
use crate::section::Object;

/// Where an encoded field lands: section and byte offset within it.
#[derive(Debug, Clone, Copy)]
pub struct EmitSite {
    pub section: SectionId,
    pub offset: u64,
}

/// Output-side callbacks handed to every bytecode at emit time. Container
/// formats implement this to record relocations; the built-in
/// `AbsoluteEmitter` folds everything to bytes instead.
pub trait EmitHandler {
    /// Encode a finalized value into `buf` (already sized to the field
    /// width).
    fn encode_value(
        &mut self,
        value: &Value,
        buf: &mut [u8],
        site: &EmitSite,
        symtab: &SymbolTable,
        resolver: &mut dyn LabelResolver,
    ) -> Result<(), BcError>;

    /// A reserve span: no bytes, the handler tracks the gap.
    fn reserve_gap(&mut self, len: u64, site: &EmitSite) -> Result<(), BcError>;
}

/// Folds every value to a concrete little-endian constant using final label
/// positions. No relocation support: a value that cannot fold is an error.
#[derive(Debug, Default)]
pub struct AbsoluteEmitter;

impl EmitHandler for AbsoluteEmitter {
    fn encode_value(
        &mut self,
        value: &Value,
        buf: &mut [u8],
        _site: &EmitSite,
        symtab: &SymbolTable,
        resolver: &mut dyn LabelResolver,
    ) -> Result<(), BcError> {
        if value.seg_of || value.section_rel || value.ip_rel {
            return Err(BcError::NotAbsolute {
                loc: value.loc.clone(),
            });
        }
        let Some(mut folded) = value.get_intnum(symtab, Some(resolver))? else {
            return Err(BcError::NotAbsolute {
                loc: value.loc.clone(),
            });
        };
        if value.rshift > 0 {
            folded.calc(Op::Shr, Some(&IntNum::from(value.rshift)))?;
        }
        encode_const_le(&folded, buf, value.sign, &value.loc)
    }

    fn reserve_gap(&mut self, _len: u64, _site: &EmitSite) -> Result<(), BcError> {
        Ok(())
    }
}

/// One section's flat byte image.
#[derive(Debug)]
pub struct SectionOutput {
    pub name: String,
    pub origin: Option<IntNum>,
    pub bytes: Vec<u8>,
}

/// Emit every bytecode exactly once, in section order, checking that each
/// one writes exactly the length it resolved to.
pub fn emit_object(
    object: &mut Object,
    positions: &Positions,
    handler: &mut dyn EmitHandler,
) -> Result<Vec<SectionOutput>, BcError> {
    let symtab = &object.symbols;
    let mut resolver = positions.resolver(symtab);
    let mut outputs = Vec::with_capacity(object.sections.len());
    for (index, section) in object.sections.values_mut().enumerate() {
        let id = SectionId(index as u32);
        let mut bytes = Vec::with_capacity(section.total as usize);
        for bc in &mut section.bytecodes {
            let before = bytes.len() as u64;
            bc.emit(&mut bytes, id, symtab, &mut resolver, handler)?;
            let written = bytes.len() as u64 - before;
            if written != bc.len() {
                return Err(BcError::Internal(format!(
                    "emitted {written} bytes where {expected} were resolved at {loc}",
                    expected = bc.len(),
                    loc = bc.loc()
                )));
            }
        }
        outputs.push(SectionOutput {
            name: section.name.clone(),
            origin: section.origin.clone(),
            bytes,
        });
    }
    Ok(outputs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{Bytecode, Data};
    use crate::optimize::resolve_object;
    use girder_expr::{Expr, ExprError, ExprOp, SourceLoc, SymbolId};

    fn loc() -> SourceLoc {
        SourceLoc::unknown()
    }

    fn int(value: i64) -> Expr {
        Expr::int(value, loc())
    }

    struct NoResolver;

    impl LabelResolver for NoResolver {
        fn label_offset(
            &mut self,
            _sym: SymbolId,
        ) -> Result<Option<(SectionId, u64)>, ExprError> {
            Ok(None)
        }

        fn label_address(&mut self, _sym: SymbolId) -> Result<Option<IntNum>, ExprError> {
            Ok(None)
        }
    }

    #[test]
    fn emits_distances_and_fill() {
        let mut object = Object::new();
        let text = object.add_section("text", None);

        let start = object.define_label(text, "start", loc()).expect("label");
        let mut head = Data::new();
        head.push_raw(vec![0xEA, 0xEA, 0xEA]);
        object.add_bytecode(text, Bytecode::data(head, loc()));
        let end = object.define_label(text, "end", loc()).expect("label");

        // 16-bit length field: end - start.
        let mut tail = Data::new();
        tail.push_expr(
            Expr::binary(
                ExprOp::Sub,
                Expr::sym(end, loc()),
                Expr::sym(start, loc()),
                loc(),
            ),
            2,
        );
        object.add_bytecode(text, Bytecode::data(tail, loc()));
        object.add_bytecode(text, Bytecode::align(8, Some(0xFF), loc()));
        object.finalize().expect("finalize");

        let positions = resolve_object(&mut object).expect("resolve");
        let outputs =
            emit_object(&mut object, &positions, &mut AbsoluteEmitter).expect("emit");
        assert_eq!(outputs.len(), 1);
        assert_eq!(
            outputs[0].bytes,
            vec![0xEA, 0xEA, 0xEA, 0x03, 0x00, 0xFF, 0xFF, 0xFF]
        );
    }

    #[test]
    fn absolute_label_encodes_its_address() {
        let mut object = Object::new();
        let vectors = object.add_section("vectors", Some(IntNum::from(0xFF00i64)));
        object.add_bytecode(vectors, Bytecode::align(4, None, loc()));
        let entry = object.define_label(vectors, "entry", loc()).expect("label");
        let mut code = Data::new();
        code.push_raw(vec![0x60]);
        object.add_bytecode(vectors, Bytecode::data(code, loc()));

        let mut pointer = Data::new();
        pointer.push_expr(Expr::sym(entry, loc()), 2);
        object.add_bytecode(vectors, Bytecode::data(pointer, loc()));
        object.finalize().expect("finalize");

        let positions = resolve_object(&mut object).expect("resolve");
        let outputs =
            emit_object(&mut object, &positions, &mut AbsoluteEmitter).expect("emit");
        assert_eq!(outputs[0].bytes, vec![0x60, 0x00, 0xFF]);
    }

    #[test]
    fn relocatable_value_without_address_is_not_absolute() {
        let mut object = Object::new();
        let text = object.add_section("text", None);
        let target = object.define_label(text, "target", loc()).expect("label");
        let mut data = Data::new();
        data.push_expr(Expr::sym(target, loc()), 2);
        object.add_bytecode(text, Bytecode::data(data, loc()));
        object.finalize().expect("finalize");

        let positions = resolve_object(&mut object).expect("resolve");
        let err = emit_object(&mut object, &positions, &mut AbsoluteEmitter)
            .expect_err("no origin, no address");
        assert!(matches!(err, BcError::NotAbsolute { .. }));
    }

    #[test]
    fn out_of_range_field_is_rejected() {
        let mut object = Object::new();
        let text = object.add_section("text", None);
        let mut data = Data::new();
        data.push_expr(int(0x1FF), 1);
        object.add_bytecode(text, Bytecode::data(data, loc()));
        object.finalize().expect("finalize");

        let positions = resolve_object(&mut object).expect("resolve");
        let err = emit_object(&mut object, &positions, &mut AbsoluteEmitter)
            .expect_err("256+ in one byte");
        assert!(matches!(err, BcError::OutOfRange { bits: 8, .. }));
    }

    #[test]
    fn encoder_applies_rshift_and_rejects_segment_flags() {
        let symtab = SymbolTable::new();
        let site = EmitSite {
            section: SectionId(0),
            offset: 0,
        };
        let mut handler = AbsoluteEmitter;

        // High byte of a 16-bit constant.
        let mut value = Value::finalize(int(0x1234), 8, &symtab, loc()).expect("finalize");
        value.rshift = 8;
        let mut buf = [0u8; 1];
        handler
            .encode_value(&value, &mut buf, &site, &symtab, &mut NoResolver)
            .expect("encode");
        assert_eq!(buf, [0x12]);

        // Segment-of and ip-relative values have no absolute rendition.
        value.rshift = 0;
        value.seg_of = true;
        let err = handler
            .encode_value(&value, &mut buf, &site, &symtab, &mut NoResolver)
            .expect_err("segment of");
        assert!(matches!(err, BcError::NotAbsolute { .. }));

        value.seg_of = false;
        value.ip_rel = true;
        let err = handler
            .encode_value(&value, &mut buf, &site, &symtab, &mut NoResolver)
            .expect_err("ip relative");
        assert!(matches!(err, BcError::NotAbsolute { .. }));
    }

    #[test]
    fn reserve_emits_a_zero_gap() {
        let mut object = Object::new();
        let bss = object.add_section("bss", None);
        object.add_bytecode(bss, Bytecode::reserve(int(4), 1, loc()));
        let mut data = Data::new();
        data.push_raw(vec![0xAB]);
        object.add_bytecode(bss, Bytecode::data(data, loc()));
        object.finalize().expect("finalize");

        let positions = resolve_object(&mut object).expect("resolve");
        let outputs =
            emit_object(&mut object, &positions, &mut AbsoluteEmitter).expect("emit");
        assert_eq!(outputs[0].bytes, vec![0, 0, 0, 0, 0xAB]);
    }
}

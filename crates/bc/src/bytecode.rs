use std::fmt;
use std::mem;

use girder_expr::{Expr, LabelResolver, SectionId, SourceLoc, SymbolTable, Value};
use girder_num::{IntNum, RangeKind};

use crate::emit::{EmitHandler, EmitSite};
use crate::error::BcError;

/// How trustworthy a resolved length is. `Minimum` lengths are final for
/// their offset; `Estimate` lengths may still grow on a later call. The
/// optimizer classifies a cross-pass length change by the last reported
/// confidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Resolution {
    #[default]
    Minimum,
    Estimate,
}

/// The extension point for instruction encoders and other content kinds
/// defined outside this crate. Implementations get the same lifecycle as the
/// built-in kinds; teardown is `Drop`.
pub trait SpecialContents: fmt::Debug {
    /// Convert operand expressions to classified values. Runs exactly once.
    fn finalize(&mut self, symtab: &SymbolTable, loc: &SourceLoc) -> Result<(), BcError>;

    /// Compute the byte length at `offset`. Calls with `save` false must
    /// leave no trace beyond the returned length; the one `save` call may
    /// commit payload choices.
    fn resolve(
        &mut self,
        save: bool,
        offset: u64,
        symtab: &SymbolTable,
        resolver: &mut dyn LabelResolver,
    ) -> Result<(u64, Resolution), BcError>;

    /// Append the encoded bytes. Runs exactly once.
    fn emit(
        &mut self,
        buf: &mut Vec<u8>,
        site: &EmitSite,
        symtab: &SymbolTable,
        resolver: &mut dyn LabelResolver,
        handler: &mut dyn EmitHandler,
    ) -> Result<(), BcError>;

    fn print(&self, symtab: &SymbolTable) -> String;
}

/// Fixed data: raw byte runs interleaved with sized symbolic values. The
/// total length is known as soon as the items are, so it is fixed at
/// finalize time.
#[derive(Debug, Default)]
pub struct Data {
    items: Vec<DataItem>,
}

#[derive(Debug)]
enum DataItem {
    Raw(Vec<u8>),
    Pending { expr: Expr, size_bytes: u32 },
    Value(DataValue),
}

#[derive(Debug)]
pub struct DataValue {
    pub value: Value,
    pub size_bytes: u32,
}

impl Data {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_raw(&mut self, bytes: impl Into<Vec<u8>>) {
        self.items.push(DataItem::Raw(bytes.into()));
    }

    pub fn push_expr(&mut self, expr: Expr, size_bytes: u32) {
        self.items.push(DataItem::Pending { expr, size_bytes });
    }

    fn finalize(&mut self, symtab: &SymbolTable, loc: &SourceLoc) -> Result<(), BcError> {
        for item in &mut self.items {
            if matches!(item, DataItem::Pending { .. }) {
                let DataItem::Pending { expr, size_bytes } =
                    mem::replace(item, DataItem::Raw(Vec::new()))
                else {
                    unreachable!("just matched a pending item");
                };
                let value = Value::finalize(expr, size_bytes * 8, symtab, loc.clone())?;
                *item = DataItem::Value(DataValue { value, size_bytes });
            }
        }
        Ok(())
    }

    fn len_bytes(&self) -> u64 {
        self.items
            .iter()
            .map(|item| match item {
                DataItem::Raw(bytes) => bytes.len() as u64,
                DataItem::Pending { size_bytes, .. } => u64::from(*size_bytes),
                DataItem::Value(dv) => u64::from(dv.size_bytes),
            })
            .sum()
    }

    fn emit(
        &self,
        buf: &mut Vec<u8>,
        site: &EmitSite,
        symtab: &SymbolTable,
        resolver: &mut dyn LabelResolver,
        handler: &mut dyn EmitHandler,
    ) -> Result<(), BcError> {
        let mut intra = 0u64;
        for item in &self.items {
            match item {
                DataItem::Raw(bytes) => {
                    buf.extend_from_slice(bytes);
                    intra += bytes.len() as u64;
                }
                DataItem::Pending { .. } => {
                    return Err(BcError::Internal(
                        "data item emitted before finalize".to_string(),
                    ));
                }
                DataItem::Value(dv) => {
                    let start = buf.len();
                    buf.resize(start + dv.size_bytes as usize, 0);
                    let item_site = EmitSite {
                        section: site.section,
                        offset: site.offset + intra,
                    };
                    handler.encode_value(
                        &dv.value,
                        &mut buf[start..],
                        &item_site,
                        symtab,
                        resolver,
                    )?;
                    intra += u64::from(dv.size_bytes);
                }
            }
        }
        Ok(())
    }
}

/// Uninitialized space: `numitems` x `itemsize` bytes. The count must fold
/// to a non-negative constant by resolve time; reserved space cannot be
/// forward-referenced into existence.
#[derive(Debug)]
pub struct Reserve {
    pub numitems: Expr,
    pub itemsize: u64,
}

/// Pad to a byte boundary from the current offset, optionally with a fill
/// byte (zero otherwise). The length depends on the offset and is recomputed
/// on every resolve call.
#[derive(Debug)]
pub struct Align {
    pub boundary: u64,
    pub fill: Option<u8>,
}

impl Align {
    fn pad(&self, offset: u64) -> u64 {
        if self.boundary <= 1 {
            0
        } else {
            (self.boundary - offset % self.boundary) % self.boundary
        }
    }
}

#[derive(Debug, Default)]
pub enum Contents {
    #[default]
    Empty,
    Data(Data),
    Reserve(Reserve),
    Align(Align),
    Special(Box<dyn SpecialContents>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum State {
    #[default]
    Created,
    Finalized,
    Resolved,
    Emitted,
}

/// One unit of section content. `len` and `offset` start at zero meaning
/// "not yet known" and are filled in by resolution.
#[derive(Debug, Default)]
pub struct Bytecode {
    contents: Contents,
    len: u64,
    multiple: Option<Expr>,
    offset: u64,
    loc: SourceLoc,
    state: State,
    resolution: Resolution,
}

impl Bytecode {
    pub fn new(contents: Contents, loc: SourceLoc) -> Self {
        Self {
            contents,
            len: 0,
            multiple: None,
            offset: 0,
            loc,
            state: State::Created,
            resolution: Resolution::Minimum,
        }
    }

    pub fn data(data: Data, loc: SourceLoc) -> Self {
        Self::new(Contents::Data(data), loc)
    }

    pub fn reserve(numitems: Expr, itemsize: u64, loc: SourceLoc) -> Self {
        Self::new(Contents::Reserve(Reserve { numitems, itemsize }), loc)
    }

    pub fn align(boundary: u64, fill: Option<u8>, loc: SourceLoc) -> Self {
        Self::new(Contents::Align(Align { boundary, fill }), loc)
    }

    pub fn special(contents: Box<dyn SpecialContents>, loc: SourceLoc) -> Self {
        Self::new(Contents::Special(contents), loc)
    }

    /// Repeat the whole content; the count must fold to a non-negative
    /// constant at resolve time.
    pub fn with_multiple(mut self, count: Expr) -> Self {
        self.multiple = Some(count);
        self
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn loc(&self) -> &SourceLoc {
        &self.loc
    }

    pub fn contents(&self) -> &Contents {
        &self.contents
    }

    /// Confidence of the most recent resolve.
    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    pub(crate) fn set_offset(&mut self, offset: u64) {
        self.offset = offset;
    }

    pub fn print(&self, symtab: &SymbolTable) -> String {
        match &self.contents {
            Contents::Empty => "empty".to_string(),
            Contents::Data(data) => format!("data[{} bytes]", data.len_bytes()),
            Contents::Reserve(res) => {
                format!("reserve {} x {}", res.numitems.display(symtab), res.itemsize)
            }
            Contents::Align(align) => format!("align {}", align.boundary),
            Contents::Special(special) => special.print(symtab),
        }
    }

    /// Convert operand expressions to classified values. Runs exactly once,
    /// after construction.
    pub fn finalize(&mut self, symtab: &SymbolTable) -> Result<(), BcError> {
        if self.state != State::Created {
            return Err(BcError::Internal(format!(
                "bytecode at {} finalized twice",
                self.loc
            )));
        }
        match &mut self.contents {
            Contents::Data(data) => data.finalize(symtab, &self.loc)?,
            Contents::Special(special) => special.finalize(symtab, &self.loc)?,
            Contents::Empty | Contents::Reserve(_) | Contents::Align(_) => {}
        }
        self.state = State::Finalized;
        Ok(())
    }

    /// Compute the byte length at `offset` and store it. Repeated calls with
    /// `save` false are how the optimizer probes; they touch nothing beyond
    /// the stored length, offset, and resolution confidence. The final call
    /// passes `save` true.
    pub fn resolve(
        &mut self,
        save: bool,
        offset: u64,
        symtab: &SymbolTable,
        resolver: &mut dyn LabelResolver,
    ) -> Result<Resolution, BcError> {
        match self.state {
            State::Finalized | State::Resolved => {}
            State::Created | State::Emitted => {
                return Err(BcError::Internal(format!(
                    "bytecode at {} resolved in the wrong state",
                    self.loc
                )));
            }
        }
        self.offset = offset;
        let (unit, resolution) = match &mut self.contents {
            Contents::Empty => (0, Resolution::Minimum),
            Contents::Data(data) => (data.len_bytes(), Resolution::Minimum),
            Contents::Reserve(res) => {
                let count = fold_count(&res.numitems, symtab, resolver, &self.loc)?;
                let len = count
                    .checked_mul(res.itemsize)
                    .ok_or_else(|| BcError::OutOfRange {
                        bits: 64,
                        loc: self.loc.clone(),
                    })?;
                (len, Resolution::Minimum)
            }
            Contents::Align(align) => (align.pad(offset), Resolution::Minimum),
            Contents::Special(special) => special.resolve(save, offset, symtab, resolver)?,
        };
        let total = match &self.multiple {
            Some(count) => {
                let count = fold_count(count, symtab, resolver, &self.loc)?;
                unit.checked_mul(count).ok_or_else(|| BcError::OutOfRange {
                    bits: 64,
                    loc: self.loc.clone(),
                })?
            }
            None => unit,
        };
        self.len = total;
        self.resolution = resolution;
        if save {
            self.state = State::Resolved;
        }
        Ok(resolution)
    }

    /// Append the encoded bytes. Runs exactly once, after the saving
    /// resolve.
    pub fn emit(
        &mut self,
        buf: &mut Vec<u8>,
        section: SectionId,
        symtab: &SymbolTable,
        resolver: &mut dyn LabelResolver,
        handler: &mut dyn EmitHandler,
    ) -> Result<(), BcError> {
        if self.state != State::Resolved {
            return Err(BcError::Internal(format!(
                "bytecode at {} emitted before resolution",
                self.loc
            )));
        }
        let times = match &self.multiple {
            Some(count) => fold_count(count, symtab, resolver, &self.loc)?,
            None => 1,
        };
        let unit = if times == 0 { 0 } else { self.len / times };
        match &mut self.contents {
            Contents::Empty => {}
            Contents::Data(data) => {
                for rep in 0..times {
                    let site = EmitSite {
                        section,
                        offset: self.offset + rep * unit,
                    };
                    data.emit(buf, &site, symtab, resolver, handler)?;
                }
            }
            Contents::Reserve(_) => {
                // A gap: the handler is told the span, the flat image gets
                // zeros so later offsets stay aligned.
                let site = EmitSite {
                    section,
                    offset: self.offset,
                };
                handler.reserve_gap(self.len, &site)?;
                buf.resize(buf.len() + self.len as usize, 0);
            }
            Contents::Align(align) => {
                let fill = align.fill.unwrap_or(0);
                buf.resize(buf.len() + self.len as usize, fill);
            }
            Contents::Special(special) => {
                for rep in 0..times {
                    let site = EmitSite {
                        section,
                        offset: self.offset + rep * unit,
                    };
                    special.emit(buf, &site, symtab, resolver, handler)?;
                }
            }
        }
        self.state = State::Emitted;
        Ok(())
    }
}

/// Fold a repeat or reserve count to a non-negative integer.
fn fold_count(
    expr: &Expr,
    symtab: &SymbolTable,
    resolver: &mut dyn LabelResolver,
    loc: &SourceLoc,
) -> Result<u64, BcError> {
    let mut folded = expr.clone();
    folded.simplify(symtab, Some(resolver))?;
    let Some(value) = folded.get_intnum() else {
        return Err(BcError::NotConstant { loc: loc.clone() });
    };
    if value.sign() < 0 || !value.fits(64, RangeKind::Unsigned) {
        return Err(BcError::NotConstant { loc: loc.clone() });
    }
    Ok(value.as_u64())
}

/// Encode a little-endian constant field, checking the range first.
pub fn encode_const_le(
    value: &IntNum,
    buf: &mut [u8],
    sign: bool,
    loc: &SourceLoc,
) -> Result<(), BcError> {
    let bits = buf.len() as u32 * 8;
    let range = if sign {
        RangeKind::Signed
    } else {
        RangeKind::Either
    };
    if !value.fits(bits, range) {
        return Err(BcError::OutOfRange {
            bits,
            loc: loc.clone(),
        });
    }
    value.write_le(buf);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emit::AbsoluteEmitter;
    use girder_expr::ExprError;

    struct NoResolver;

    impl LabelResolver for NoResolver {
        fn label_offset(
            &mut self,
            _sym: girder_expr::SymbolId,
        ) -> Result<Option<(SectionId, u64)>, ExprError> {
            Ok(None)
        }

        fn label_address(
            &mut self,
            _sym: girder_expr::SymbolId,
        ) -> Result<Option<IntNum>, ExprError> {
            Ok(None)
        }
    }

    fn loc() -> SourceLoc {
        SourceLoc::unknown()
    }

    fn int(value: i64) -> Expr {
        Expr::int(value, loc())
    }

    #[test]
    fn data_length_is_fixed_at_finalize() {
        let symtab = SymbolTable::new();
        let mut data = Data::new();
        data.push_raw(vec![0xEA, 0xEA]);
        data.push_expr(Expr::binary(girder_expr::ExprOp::Add, int(1), int(2), loc()), 2);
        let mut bc = Bytecode::data(data, loc());
        bc.finalize(&symtab).expect("finalize");
        bc.resolve(false, 0, &symtab, &mut NoResolver)
            .expect("resolve");
        assert_eq!(bc.len(), 4);
    }

    #[test]
    fn reserve_count_must_be_constant() {
        let mut symtab = SymbolTable::new();
        let n = symtab.intern("n");
        // n is never defined, so the count cannot fold.
        let mut bc = Bytecode::reserve(Expr::sym(n, loc()), 2, loc());
        bc.finalize(&symtab).expect("finalize");
        let err = bc
            .resolve(false, 0, &symtab, &mut NoResolver)
            .expect_err("not constant");
        assert!(matches!(err, BcError::NotConstant { .. }));
    }

    #[test]
    fn reserve_length_scales_by_item_size() {
        let symtab = SymbolTable::new();
        let mut bc = Bytecode::reserve(int(6), 4, loc());
        bc.finalize(&symtab).expect("finalize");
        bc.resolve(false, 0, &symtab, &mut NoResolver)
            .expect("resolve");
        assert_eq!(bc.len(), 24);
    }

    #[test]
    fn negative_reserve_count_is_rejected() {
        let symtab = SymbolTable::new();
        let mut bc = Bytecode::reserve(int(-1), 1, loc());
        bc.finalize(&symtab).expect("finalize");
        let err = bc
            .resolve(false, 0, &symtab, &mut NoResolver)
            .expect_err("negative count");
        assert!(matches!(err, BcError::NotConstant { .. }));
    }

    #[test]
    fn align_pad_depends_on_offset() {
        let symtab = SymbolTable::new();
        let mut bc = Bytecode::align(16, None, loc());
        bc.finalize(&symtab).expect("finalize");
        bc.resolve(false, 5, &symtab, &mut NoResolver)
            .expect("resolve");
        assert_eq!(bc.len(), 11);
        bc.resolve(false, 16, &symtab, &mut NoResolver)
            .expect("resolve");
        assert_eq!(bc.len(), 0);
        bc.resolve(false, 17, &symtab, &mut NoResolver)
            .expect("resolve");
        assert_eq!(bc.len(), 15);
    }

    #[test]
    fn multiple_scales_any_kind() {
        let symtab = SymbolTable::new();
        let mut data = Data::new();
        data.push_raw(vec![0x00, 0x01]);
        let mut bc = Bytecode::data(data, loc()).with_multiple(int(3));
        bc.finalize(&symtab).expect("finalize");
        bc.resolve(false, 0, &symtab, &mut NoResolver)
            .expect("resolve");
        assert_eq!(bc.len(), 6);
    }

    #[test]
    fn repeated_probe_resolves_are_pure() {
        let symtab = SymbolTable::new();
        let mut data = Data::new();
        data.push_raw(vec![1, 2, 3]);
        let mut bc = Bytecode::data(data, loc());
        bc.finalize(&symtab).expect("finalize");
        for offset in [0u64, 8, 64] {
            bc.resolve(false, offset, &symtab, &mut NoResolver)
                .expect("resolve");
            assert_eq!(bc.len(), 3);
        }
    }

    #[test]
    fn finalize_twice_is_an_internal_error() {
        let symtab = SymbolTable::new();
        let mut bc = Bytecode::new(Contents::Empty, loc());
        bc.finalize(&symtab).expect("first finalize");
        let err = bc.finalize(&symtab).expect_err("second finalize");
        assert!(matches!(err, BcError::Internal(_)));
    }

    #[test]
    fn emit_writes_raw_and_encoded_values() {
        let symtab = SymbolTable::new();
        let mut data = Data::new();
        data.push_raw(vec![0xA9]);
        data.push_expr(int(0x1234), 2);
        let mut bc = Bytecode::data(data, loc());
        bc.finalize(&symtab).expect("finalize");
        bc.resolve(true, 0, &symtab, &mut NoResolver)
            .expect("resolve");
        let mut buf = Vec::new();
        bc.emit(
            &mut buf,
            SectionId(0),
            &symtab,
            &mut NoResolver,
            &mut AbsoluteEmitter,
        )
        .expect("emit");
        assert_eq!(buf, vec![0xA9, 0x34, 0x12]);
    }
}

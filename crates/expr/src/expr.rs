use std::fmt;
use std::mem;

use girder_num::{IntNum, NumError, Op as NumOp};

use crate::ExprError;
use crate::loc::SourceLoc;
use crate::symbol::{SectionId, SymbolBinding, SymbolId, SymbolTable};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExprOp {
    /// Wrapper around a single term; spliced away wherever it nests.
    Ident,
    Add,
    Sub,
    Mul,
    Div,
    SignDiv,
    Mod,
    SignMod,
    Neg,
    BitNot,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
    LogNot,
    LogAnd,
    LogOr,
    LogXor,
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
    Seg,
    Wrt,
    SegOff,
}

impl ExprOp {
    /// Operators that level (flatten) and reorder freely. These are exactly
    /// the commutative-associative ones; Sub, Div, shifts and comparisons
    /// keep their term order.
    fn is_associative(self) -> bool {
        matches!(
            self,
            Self::Add | Self::Mul | Self::BitAnd | Self::BitOr | Self::BitXor
        )
    }

    fn is_unary(self) -> bool {
        matches!(self, Self::Neg | Self::BitNot | Self::LogNot | Self::Seg)
    }

    fn num_op(self) -> Option<NumOp> {
        Some(match self {
            Self::Add => NumOp::Add,
            Self::Sub => NumOp::Sub,
            Self::Mul => NumOp::Mul,
            Self::Div => NumOp::Div,
            Self::SignDiv => NumOp::SignDiv,
            Self::Mod => NumOp::Mod,
            Self::SignMod => NumOp::SignMod,
            Self::Neg => NumOp::Neg,
            Self::BitNot => NumOp::BitNot,
            Self::BitAnd => NumOp::BitAnd,
            Self::BitOr => NumOp::BitOr,
            Self::BitXor => NumOp::BitXor,
            Self::Shl => NumOp::Shl,
            Self::Shr => NumOp::Shr,
            Self::LogNot => NumOp::LogNot,
            Self::LogAnd => NumOp::LogAnd,
            Self::LogOr => NumOp::LogOr,
            Self::LogXor => NumOp::LogXor,
            Self::Eq => NumOp::Eq,
            Self::Ne => NumOp::Ne,
            Self::Lt => NumOp::Lt,
            Self::Gt => NumOp::Gt,
            Self::Le => NumOp::Le,
            Self::Ge => NumOp::Ge,
            Self::Ident | Self::Seg | Self::Wrt | Self::SegOff => return None,
        })
    }

    fn symbol(self) -> &'static str {
        match self {
            Self::Ident => "",
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Div => "/",
            Self::SignDiv => "//",
            Self::Mod => "%",
            Self::SignMod => "%%",
            Self::Neg => "-",
            Self::BitNot => "~",
            Self::BitAnd => "&",
            Self::BitOr => "|",
            Self::BitXor => "^",
            Self::Shl => "<<",
            Self::Shr => ">>",
            Self::LogNot => "!",
            Self::LogAnd => "&&",
            Self::LogOr => "||",
            Self::LogXor => "^^",
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Gt => ">",
            Self::Le => "<=",
            Self::Ge => ">=",
            Self::Seg => "SEG ",
            Self::Wrt => " WRT ",
            Self::SegOff => ":",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExprTerm {
    Int(IntNum),
    Float(f64),
    Sym(SymbolId),
    Reg(u32),
    Sub(Box<Expr>),
}

/// N-ary expression node. Each node exclusively owns its child list; no
/// parent ever holds a pointer into a child's storage across a mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    pub op: ExprOp,
    pub terms: Vec<ExprTerm>,
    pub loc: SourceLoc,
}

impl Drop for Expr {
    fn drop(&mut self) {
        // Iterative teardown; the default recursive drop overflows the call
        // stack on pathologically deep trees.
        let mut stack: Vec<Expr> = Vec::new();
        for term in self.terms.drain(..) {
            if let ExprTerm::Sub(sub) = term {
                stack.push(*sub);
            }
        }
        while let Some(mut expr) = stack.pop() {
            for term in expr.terms.drain(..) {
                if let ExprTerm::Sub(sub) = term {
                    stack.push(*sub);
                }
            }
        }
    }
}

/// Callback into label/symbol storage. `Ok(None)` means "not known yet";
/// the simplifier leaves the symbolic term in place. Errors are reserved
/// for detected reference cycles and propagate unchanged.
pub trait LabelResolver {
    /// Section-relative byte offset of a label, when resolvable.
    fn label_offset(&mut self, sym: SymbolId) -> Result<Option<(SectionId, u64)>, ExprError>;

    /// Concrete address of a label in an absolute (fixed-origin) section.
    fn label_address(&mut self, sym: SymbolId) -> Result<Option<IntNum>, ExprError>;

    /// Closed-form byte distance `to - from` for two labels in the same
    /// section.
    fn label_distance(
        &mut self,
        from: SymbolId,
        to: SymbolId,
    ) -> Result<Option<IntNum>, ExprError> {
        let Some((from_sect, from_off)) = self.label_offset(from)? else {
            return Ok(None);
        };
        let Some((to_sect, to_off)) = self.label_offset(to)? else {
            return Ok(None);
        };
        if from_sect != to_sect {
            return Ok(None);
        }
        Ok(Some(IntNum::from(to_off as i64 - from_off as i64)))
    }
}

impl Expr {
    /// Build a node. Identity wrappers among the terms are spliced upward
    /// immediately so `Ident(Ident(x))` can never be constructed.
    pub fn new(op: ExprOp, terms: Vec<ExprTerm>, loc: SourceLoc) -> Self {
        let mut expr = Self { op, terms, loc };
        expr.splice_ident_terms();
        expr
    }

    pub fn int(value: impl Into<IntNum>, loc: SourceLoc) -> Self {
        Self::new(ExprOp::Ident, vec![ExprTerm::Int(value.into())], loc)
    }

    pub fn float(value: f64, loc: SourceLoc) -> Self {
        Self::new(ExprOp::Ident, vec![ExprTerm::Float(value)], loc)
    }

    pub fn sym(id: SymbolId, loc: SourceLoc) -> Self {
        Self::new(ExprOp::Ident, vec![ExprTerm::Sym(id)], loc)
    }

    pub fn reg(reg: u32, loc: SourceLoc) -> Self {
        Self::new(ExprOp::Ident, vec![ExprTerm::Reg(reg)], loc)
    }

    pub fn unary(op: ExprOp, operand: Expr, loc: SourceLoc) -> Self {
        debug_assert!(op.is_unary());
        Self::new(op, vec![operand.into_term()], loc)
    }

    pub fn binary(op: ExprOp, lhs: Expr, rhs: Expr, loc: SourceLoc) -> Self {
        Self::new(op, vec![lhs.into_term(), rhs.into_term()], loc)
    }

    /// Wrap as a term of a parent node, splicing a bare identity instead of
    /// nesting it.
    pub fn into_term(mut self) -> ExprTerm {
        if self.op == ExprOp::Ident && self.terms.len() == 1 {
            self.terms.pop().expect("single term")
        } else {
            ExprTerm::Sub(Box::new(self))
        }
    }

    /// The node's value as a single integer, if it has been fully folded.
    pub fn get_intnum(&self) -> Option<&IntNum> {
        match (&self.op, self.terms.as_slice()) {
            (ExprOp::Ident, [ExprTerm::Int(value)]) => Some(value),
            _ => None,
        }
    }

    pub fn contains_float(&self) -> bool {
        self.terms.iter().any(|term| match term {
            ExprTerm::Float(_) => true,
            ExprTerm::Sub(sub) => sub.contains_float(),
            _ => false,
        })
    }

    pub fn display<'a>(&'a self, symtab: &'a SymbolTable) -> ExprDisplay<'a> {
        ExprDisplay { expr: self, symtab }
    }

    /// Full simplification: equ expansion, leveling, constant folding,
    /// identity elimination, optional label-position substitution, canonical
    /// ordering. This is idempotent: re-running it on the result yields a
    /// structurally identical tree.
    pub fn simplify(
        &mut self,
        symtab: &SymbolTable,
        mut resolver: Option<&mut (dyn LabelResolver + '_)>,
    ) -> Result<(), ExprError> {
        let mut path = Vec::new();
        self.expand_equ(symtab, &mut path)?;
        self.level_tree(true, true, symtab, &mut resolver)
    }

    /// Inline-expand equ-bound symbols, bottoming out with a
    /// `CircularReference` error when a definition's expansion revisits
    /// itself.
    fn expand_equ(
        &mut self,
        symtab: &SymbolTable,
        path: &mut Vec<SymbolId>,
    ) -> Result<(), ExprError> {
        for term in &mut self.terms {
            match term {
                ExprTerm::Sym(id) => {
                    if let SymbolBinding::Equ(def) = symtab.binding(*id) {
                        if path.contains(id) {
                            return Err(ExprError::CircularReference {
                                name: symtab.name(*id).to_string(),
                                loc: symtab.loc(*id).clone(),
                            });
                        }
                        let mut expanded = def.clone();
                        path.push(*id);
                        expanded.expand_equ(symtab, path)?;
                        path.pop();
                        *term = expanded.into_term();
                    }
                }
                ExprTerm::Sub(sub) => sub.expand_equ(symtab, path)?,
                _ => {}
            }
        }
        Ok(())
    }

    /// One structural pass, children before parent.
    pub fn level_tree(
        &mut self,
        fold_const: bool,
        simplify_ident: bool,
        symtab: &SymbolTable,
        resolver: &mut Option<&mut (dyn LabelResolver + '_)>,
    ) -> Result<(), ExprError> {
        self.xform_neg();
        for term in &mut self.terms {
            if let ExprTerm::Sub(sub) = term {
                sub.level_tree(fold_const, simplify_ident, symtab, resolver)?;
            }
        }
        self.splice_ident_terms();
        self.level_and_fold(fold_const)?;
        if simplify_ident {
            self.simplify_identities();
        }
        if let Some(resolver) = resolver {
            // Position substitution can expose new constant-folding material,
            // so the folding passes run once more when it changed anything.
            if self.substitute_positions(symtab, &mut **resolver)? {
                self.splice_ident_terms();
                self.level_and_fold(fold_const)?;
                if simplify_ident {
                    self.simplify_identities();
                }
            }
        }
        self.canonical_order();
        Ok(())
    }

    /// Rewrite negation and subtraction into addition of multiply-by-minus-
    /// one terms, so later folding only handles Add/Mul uniformly.
    fn xform_neg(&mut self) {
        match self.op {
            ExprOp::Sub => {
                self.op = ExprOp::Add;
                for term in self.terms.iter_mut().skip(1) {
                    let inner = mem::replace(term, ExprTerm::Int(IntNum::zero()));
                    *term = ExprTerm::Sub(Box::new(Expr {
                        op: ExprOp::Mul,
                        terms: vec![inner, ExprTerm::Int(IntNum::from(-1i64))],
                        loc: self.loc.clone(),
                    }));
                }
            }
            ExprOp::Neg => {
                self.op = ExprOp::Mul;
                self.terms.push(ExprTerm::Int(IntNum::from(-1i64)));
            }
            _ => {}
        }
    }

    /// Splice single-term identity wrappers out of the term list.
    fn splice_ident_terms(&mut self) {
        for term in &mut self.terms {
            while let ExprTerm::Sub(sub) = term {
                if sub.op == ExprOp::Ident && sub.terms.len() == 1 {
                    let inner = sub.terms.pop().expect("single term");
                    *term = inner;
                } else {
                    break;
                }
            }
        }
    }

    /// Level associative operators (pull same-operator grandchildren into
    /// this node) while folding all integer terms encountered into one.
    fn level_and_fold(&mut self, fold_const: bool) -> Result<(), ExprError> {
        if self.op.is_associative() {
            let my_op = self.op;
            let num_op = my_op.num_op().expect("associative operators fold");
            let mut acc: Option<IntNum> = None;
            let mut out: Vec<ExprTerm> = Vec::with_capacity(self.terms.len());
            let loc = self.loc.clone();
            for term in self.terms.drain(..) {
                match term {
                    ExprTerm::Sub(mut sub) if sub.op == my_op => {
                        // Children are already leveled, so one layer is all
                        // there is to pull up.
                        for inner in mem::take(&mut sub.terms) {
                            match inner {
                                ExprTerm::Int(value) if fold_const => {
                                    fold_into(&mut acc, num_op, value, &loc)?;
                                }
                                other => out.push(other),
                            }
                        }
                    }
                    ExprTerm::Int(value) if fold_const => {
                        fold_into(&mut acc, num_op, value, &loc)?;
                    }
                    other => out.push(other),
                }
            }
            if let Some(acc) = acc {
                out.push(ExprTerm::Int(acc));
            }
            self.terms = out;
        } else if fold_const {
            self.fold_nonassociative()?;
        }
        Ok(())
    }

    fn fold_nonassociative(&mut self) -> Result<(), ExprError> {
        let Some(num_op) = self.op.num_op() else {
            return Ok(());
        };
        let folded = match self.terms.as_slice() {
            [ExprTerm::Int(lhs), ExprTerm::Int(rhs)] if !self.op.is_unary() => {
                let mut value = lhs.clone();
                value
                    .calc(num_op, Some(rhs))
                    .map_err(|source| arith(source, &self.loc))?;
                Some(value)
            }
            [ExprTerm::Int(operand)] if self.op.is_unary() => {
                let mut value = operand.clone();
                value
                    .calc(num_op, None)
                    .map_err(|source| arith(source, &self.loc))?;
                Some(value)
            }
            _ => None,
        };
        if let Some(value) = folded {
            self.op = ExprOp::Ident;
            self.terms.clear();
            self.terms.push(ExprTerm::Int(value));
        }
        Ok(())
    }

    /// Identity laws: `x+0`, `x*1`, `x*0`, `x&0`, `x&-1`, `x|0`, `x|-1`,
    /// `x^0`, shift by zero. A node left with one term becomes a bare
    /// identity of it.
    fn simplify_identities(&mut self) {
        match self.op {
            ExprOp::Add => {
                self.terms.retain(|term| !is_int_zero(term));
                if self.terms.is_empty() {
                    self.make_int(0);
                }
            }
            ExprOp::Mul => {
                if self.terms.iter().any(is_int_zero) {
                    self.make_int(0);
                } else {
                    self.terms.retain(|term| !is_int_one(term));
                    if self.terms.is_empty() {
                        self.make_int(1);
                    }
                }
            }
            ExprOp::BitAnd => {
                if self.terms.iter().any(is_int_zero) {
                    self.make_int(0);
                } else {
                    self.terms.retain(|term| !is_int_neg1(term));
                    if self.terms.is_empty() {
                        self.make_int(-1);
                    }
                }
            }
            ExprOp::BitOr => {
                if self.terms.iter().any(is_int_neg1) {
                    self.make_int(-1);
                } else {
                    self.terms.retain(|term| !is_int_zero(term));
                    if self.terms.is_empty() {
                        self.make_int(0);
                    }
                }
            }
            ExprOp::BitXor => {
                self.terms.retain(|term| !is_int_zero(term));
                if self.terms.is_empty() {
                    self.make_int(0);
                }
            }
            ExprOp::Shl | ExprOp::Shr => {
                if let [_, rhs] = self.terms.as_slice()
                    && is_int_zero(rhs)
                {
                    self.terms.pop();
                }
            }
            _ => {}
        }

        if self.terms.len() == 1
            && matches!(
                self.op,
                ExprOp::Add
                    | ExprOp::Mul
                    | ExprOp::BitAnd
                    | ExprOp::BitOr
                    | ExprOp::BitXor
                    | ExprOp::Shl
                    | ExprOp::Shr
            )
        {
            self.op = ExprOp::Ident;
        }
        self.splice_ident_self();
    }

    fn splice_ident_self(&mut self) {
        while self.op == ExprOp::Ident
            && self.terms.len() == 1
            && matches!(self.terms[0], ExprTerm::Sub(_))
        {
            let Some(ExprTerm::Sub(sub)) = self.terms.pop() else {
                unreachable!("just matched a sub-expression term");
            };
            *self = *sub;
        }
    }

    fn make_int(&mut self, value: i64) {
        self.op = ExprOp::Ident;
        self.terms.clear();
        self.terms.push(ExprTerm::Int(IntNum::from(value)));
    }

    /// Collapse label references to integers where positions are known: the
    /// `sym + (-1 * other_sym)` distance pattern among addition terms (all
    /// pairs tested), and lone labels in absolute-origin sections anywhere.
    fn substitute_positions(
        &mut self,
        symtab: &SymbolTable,
        resolver: &mut dyn LabelResolver,
    ) -> Result<bool, ExprError> {
        let mut changed = false;

        if self.op == ExprOp::Add {
            let len = self.terms.len();
            for pos in 0..len {
                let ExprTerm::Sym(pos_id) = self.terms[pos] else {
                    continue;
                };
                if !symtab.is_label(pos_id) {
                    continue;
                }
                for neg in 0..len {
                    if neg == pos {
                        continue;
                    }
                    let Some(neg_id) = negated_label(&self.terms[neg], symtab) else {
                        continue;
                    };
                    if let Some(distance) = resolver.label_distance(neg_id, pos_id)? {
                        self.terms[pos] = ExprTerm::Int(distance);
                        self.terms[neg] = ExprTerm::Int(IntNum::zero());
                        changed = true;
                        break;
                    }
                }
            }
        }

        for term in &mut self.terms {
            if let ExprTerm::Sym(id) = term
                && symtab.is_label(*id)
                && let Some(address) = resolver.label_address(*id)?
            {
                *term = ExprTerm::Int(address);
                changed = true;
            }
        }

        Ok(changed)
    }

    /// Deterministic sibling order for commutative operators; a stable sort
    /// by term kind only, so equal-kind terms keep their relative order.
    fn canonical_order(&mut self) {
        if self.op.is_associative() {
            self.terms.sort_by_key(term_rank);
        }
    }
}

fn fold_into(
    acc: &mut Option<IntNum>,
    op: NumOp,
    value: IntNum,
    loc: &SourceLoc,
) -> Result<(), ExprError> {
    match acc {
        None => *acc = Some(value),
        Some(acc) => acc.calc(op, Some(&value)).map_err(|source| arith(source, loc))?,
    }
    Ok(())
}

fn arith(source: NumError, loc: &SourceLoc) -> ExprError {
    ExprError::Arith {
        source,
        loc: loc.clone(),
    }
}

fn is_int_zero(term: &ExprTerm) -> bool {
    matches!(term, ExprTerm::Int(value) if value.is_zero())
}

fn is_int_one(term: &ExprTerm) -> bool {
    matches!(term, ExprTerm::Int(value) if value.is_pos1())
}

fn is_int_neg1(term: &ExprTerm) -> bool {
    matches!(term, ExprTerm::Int(value) if value.is_neg1())
}

/// Match the `(-1 * label)` wrapper produced by `xform_neg`.
fn negated_label(term: &ExprTerm, symtab: &SymbolTable) -> Option<SymbolId> {
    let ExprTerm::Sub(sub) = term else {
        return None;
    };
    if sub.op != ExprOp::Mul || sub.terms.len() != 2 {
        return None;
    }
    match sub.terms.as_slice() {
        [ExprTerm::Int(minus1), ExprTerm::Sym(id)] | [ExprTerm::Sym(id), ExprTerm::Int(minus1)]
            if minus1.is_neg1() && symtab.is_label(*id) =>
        {
            Some(*id)
        }
        _ => None,
    }
}

fn term_rank(term: &ExprTerm) -> u8 {
    match term {
        ExprTerm::Int(_) => 0,
        ExprTerm::Float(_) => 1,
        ExprTerm::Reg(_) => 2,
        ExprTerm::Sym(_) => 3,
        ExprTerm::Sub(_) => 4,
    }
}

/// Fully parenthesized dump: one operator symbol per kind, no precedence
/// elision. Not a wire format, but exact enough to test against literal
/// strings.
pub struct ExprDisplay<'a> {
    expr: &'a Expr,
    symtab: &'a SymbolTable,
}

impl fmt::Display for ExprDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_expr(f, self.expr, self.symtab)
    }
}

fn write_expr(f: &mut fmt::Formatter<'_>, expr: &Expr, symtab: &SymbolTable) -> fmt::Result {
    if expr.op == ExprOp::Ident {
        return match expr.terms.first() {
            Some(term) => write_term(f, term, symtab),
            None => f.write_str("<empty>"),
        };
    }
    f.write_str("(")?;
    if expr.op.is_unary() {
        f.write_str(expr.op.symbol())?;
        for term in &expr.terms {
            write_term(f, term, symtab)?;
        }
    } else {
        for (index, term) in expr.terms.iter().enumerate() {
            if index > 0 {
                f.write_str(expr.op.symbol())?;
            }
            write_term(f, term, symtab)?;
        }
    }
    f.write_str(")")
}

fn write_term(f: &mut fmt::Formatter<'_>, term: &ExprTerm, symtab: &SymbolTable) -> fmt::Result {
    match term {
        ExprTerm::Int(value) => write!(f, "{value}"),
        ExprTerm::Float(value) => write!(f, "{value:?}"),
        ExprTerm::Sym(id) => f.write_str(symtab.name(*id)),
        ExprTerm::Reg(reg) => write!(f, "%r{reg}"),
        ExprTerm::Sub(sub) => write_expr(f, sub, symtab),
    }
}

//! Symbolic expression engine: n-ary expression trees with a canonicalizing
//! simplifier, a symbol table, and classification of raw expressions into
//! encodable values.

use thiserror::Error;

use girder_num::NumError;

mod expr;
mod loc;
mod symbol;
mod value;

pub use expr::{Expr, ExprDisplay, ExprOp, ExprTerm, LabelResolver};
pub use loc::SourceLoc;
pub use symbol::{SectionId, SymbolBinding, SymbolId, SymbolTable};
pub use value::Value;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExprError {
    #[error("expression too complex to relocate at {loc}, used here: {used}")]
    TooComplex { loc: SourceLoc, used: SourceLoc },

    #[error("invalid value kind at {loc}")]
    InvalidValueKind { loc: SourceLoc },

    #[error("circular reference through `{name}` defined at {loc}")]
    CircularReference { name: String, loc: SourceLoc },

    #[error("`{name}` redefined at {loc}, previous definition at {prev}")]
    Redefined {
        name: String,
        prev: SourceLoc,
        loc: SourceLoc,
    },

    /// Failure reported by a `LabelResolver` implementation for reasons of
    /// its own (the trait lives here, resolvers live upstream).
    #[error("resolver error: {0}")]
    Resolver(String),

    #[error("arithmetic error at {loc}")]
    Arith {
        #[source]
        source: NumError,
        loc: SourceLoc,
    },
}

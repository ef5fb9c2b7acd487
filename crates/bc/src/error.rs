use thiserror::Error;

use girder_expr::{ExprError, SourceLoc};
use girder_num::NumError;

#[derive(Debug, Error)]
pub enum BcError {
    /// A count that must fold to a non-negative constant did not.
    #[error("expression does not fold to a constant at {loc}")]
    NotConstant { loc: SourceLoc },

    /// A context requiring a concrete value received a relocatable one.
    #[error("value is not absolute at {loc}")]
    NotAbsolute { loc: SourceLoc },

    #[error("value does not fit in a {bits}-bit field at {loc}")]
    OutOfRange { bits: u32, loc: SourceLoc },

    /// A bytecode size cycle or mutual section dependency.
    #[error("circular reference: {what} at {loc}")]
    CircularReference { what: String, loc: SourceLoc },

    /// Invariant violation. Always fatal, never caught.
    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Expr(#[from] ExprError),

    #[error(transparent)]
    Num(#[from] NumError),
}

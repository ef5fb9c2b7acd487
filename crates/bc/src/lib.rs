//! Bytecode containers and their resolution: sections of variable-length
//! content units, the two-pass optimizer that fixes every offset and length,
//! and emission of the final bytes.

mod bytecode;
mod emit;
mod error;
mod optimize;
mod section;

pub use bytecode::{
    Align, Bytecode, Contents, Data, DataValue, Reserve, Resolution, SpecialContents,
    encode_const_le,
};
pub use emit::{AbsoluteEmitter, EmitHandler, EmitSite, SectionOutput, emit_object};
pub use error::BcError;
pub use optimize::{PosResolver, Positions, resolve_object};
pub use section::{Object, Section, SectionState};

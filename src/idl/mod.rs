//! The APX text IDL: parsing node definitions into a typed tree.

pub mod parser;
pub mod types;

pub use parser::{finalize, parse};
pub use types::{
    ArrayLen, DataSignature, DataType, Direction, InitValue, Node, ParseError, Port,
    PortAttributes, TypeRefKind,
};

//! Parse-tree and resolved-tree types for the APX text IDL.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Require,
    Provide,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArrayLen {
    Fixed(u32),
    Dynamic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeRefKind {
    ById(u32),
    ByName(String),
}

/// Data signature: the shape and width of a port's or field's value.
/// `TypeRef` nodes are eliminated during [`crate::idl::finalize`].
#[derive(Debug, Clone, PartialEq)]
pub enum DataSignature {
    U8,
    U16,
    U32,
    U64,
    I8,
    I16,
    I32,
    I64,
    /// Fixed-length, NUL-padded character buffer (`a[N]`).
    Str(u32),
    Record(Vec<(String, DataSignature)>),
    Array {
        element: Box<DataSignature>,
        len: ArrayLen,
    },
    TypeRef(TypeRefKind),
}

impl DataSignature {
    pub fn is_scalar(&self) -> bool {
        matches!(
            self,
            DataSignature::U8
                | DataSignature::U16
                | DataSignature::U32
                | DataSignature::U64
                | DataSignature::I8
                | DataSignature::I16
                | DataSignature::I32
                | DataSignature::I64
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum InitValue {
    Int(i64),
    Str(String),
    Array(Vec<InitValue>),
    Record(Vec<(String, InitValue)>),
    /// Literal text whose interpretation depends on a typeref that had not
    /// yet been resolved when the line was first parsed.
    Raw(String),
}

#[derive(Debug, Clone, Default)]
pub struct PortAttributes {
    pub init_value: Option<InitValue>,
    pub range: Option<(i64, i64)>,
}

#[derive(Debug, Clone)]
pub struct Port {
    pub name: String,
    pub direction: Direction,
    pub dsg: DataSignature,
    pub attributes: PortAttributes,
    pub port_id: u32,
    pub line: usize,
}

#[derive(Debug, Clone)]
pub struct DataType {
    pub name: String,
    pub dsg: DataSignature,
    pub type_id: u32,
    pub line: usize,
}

#[derive(Debug, Clone)]
pub struct Node {
    pub name: String,
    pub version_major: u32,
    pub version_minor: u32,
    pub datatypes: Vec<DataType>,
    pub require_ports: Vec<Port>,
    pub provide_ports: Vec<Port>,
}

#[derive(Debug, Clone)]
pub struct ParseError {
    pub line: usize,
    pub message: String,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}: {}", self.line, self.message)
    }
}

impl std::error::Error for ParseError {}

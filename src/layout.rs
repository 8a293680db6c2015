//! Turns a finalized [`crate::idl::Node`] into concrete byte offsets, sizes,
//! routing signatures, and initial-value images for its ports.

use crate::idl::{ArrayLen, DataSignature, InitValue, Node, Port};
use std::fmt;

#[derive(Debug)]
pub enum LayoutError {
    UnsizedDynamicArray(String),
    StringLiteralTooLong(String),
    ArityMismatch(String),
    UnresolvedTypeRef(String),
}

impl fmt::Display for LayoutError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LayoutError::UnsizedDynamicArray(p) => {
                write!(f, "port '{p}' uses an unbounded dynamic array, which has no fixed byte layout")
            }
            LayoutError::StringLiteralTooLong(p) => {
                write!(f, "port '{p}' has an initial string value longer than its declared length")
            }
            LayoutError::ArityMismatch(p) => write!(f, "port '{p}' initial value arity does not match its declared shape"),
            LayoutError::UnresolvedTypeRef(p) => {
                write!(f, "port '{p}' reached layout with an unresolved type reference (parser bug)")
            }
        }
    }
}

impl std::error::Error for LayoutError {}

#[derive(Debug, Clone)]
pub struct PortDataProps {
    pub port_id: u32,
    pub name: String,
    pub offset: u32,
    pub data_size: u32,
    pub dsg: DataSignature,
    pub signature: String,
}

#[derive(Debug, Clone, Default)]
pub struct NodeLayout {
    pub require_props: Vec<PortDataProps>,
    pub provide_props: Vec<PortDataProps>,
    pub require_init_image: Vec<u8>,
    pub provide_init_image: Vec<u8>,
}

impl NodeLayout {
    pub fn require_signatures(&self) -> Vec<String> {
        self.require_props.iter().map(|p| p.signature.clone()).collect()
    }

    pub fn provide_signatures(&self) -> Vec<String> {
        self.provide_props.iter().map(|p| p.signature.clone()).collect()
    }
}

pub fn compute_layout(node: &Node) -> Result<NodeLayout, LayoutError> {
    let (require_props, require_init_image) = layout_ports(&node.require_ports)?;
    let (provide_props, provide_init_image) = layout_ports(&node.provide_ports)?;
    Ok(NodeLayout {
        require_props,
        provide_props,
        require_init_image,
        provide_init_image,
    })
}

fn layout_ports(ports: &[Port]) -> Result<(Vec<PortDataProps>, Vec<u8>), LayoutError> {
    let mut props = Vec::with_capacity(ports.len());
    let mut image = Vec::new();
    let mut offset = 0u32;
    for port in ports {
        let size = dsg_byte_size(&port.dsg, &port.name)?;
        let bytes = encode_init_value(port.attributes.init_value.as_ref(), &port.dsg, size, &port.name)?;
        debug_assert_eq!(bytes.len() as u32, size);
        image.extend_from_slice(&bytes);
        props.push(PortDataProps {
            port_id: port.port_id,
            name: port.name.clone(),
            offset,
            data_size: size,
            dsg: port.dsg.clone(),
            signature: port_signature(&port.name, &port.dsg),
        });
        offset += size;
    }
    Ok((props, image))
}

fn dsg_byte_size(dsg: &DataSignature, port_name: &str) -> Result<u32, LayoutError> {
    Ok(match dsg {
        DataSignature::U8 | DataSignature::I8 => 1,
        DataSignature::U16 | DataSignature::I16 => 2,
        DataSignature::U32 | DataSignature::I32 => 4,
        DataSignature::U64 | DataSignature::I64 => 8,
        DataSignature::Str(n) => *n,
        DataSignature::Record(fields) => {
            let mut total = 0u32;
            for (_, f) in fields {
                total += dsg_byte_size(f, port_name)?;
            }
            total
        }
        DataSignature::Array { element, len } => match len {
            ArrayLen::Fixed(n) => n * dsg_byte_size(element, port_name)?,
            ArrayLen::Dynamic => return Err(LayoutError::UnsizedDynamicArray(port_name.to_string())),
        },
        DataSignature::TypeRef(_) => return Err(LayoutError::UnresolvedTypeRef(port_name.to_string())),
    })
}

fn encode_init_value(
    value: Option<&InitValue>,
    dsg: &DataSignature,
    size: u32,
    port_name: &str,
) -> Result<Vec<u8>, LayoutError> {
    let Some(value) = value else {
        return Ok(vec![0u8; size as usize]);
    };
    Ok(match (value, dsg) {
        (InitValue::Int(n), DataSignature::U8 | DataSignature::I8) => vec![*n as u8],
        (InitValue::Int(n), DataSignature::U16 | DataSignature::I16) => (*n as u16).to_le_bytes().to_vec(),
        (InitValue::Int(n), DataSignature::U32 | DataSignature::I32) => (*n as u32).to_le_bytes().to_vec(),
        (InitValue::Int(n), DataSignature::U64 | DataSignature::I64) => (*n as u64).to_le_bytes().to_vec(),
        (InitValue::Str(s), DataSignature::Str(n)) => {
            if s.len() as u32 > *n {
                return Err(LayoutError::StringLiteralTooLong(port_name.to_string()));
            }
            let mut bytes = s.as_bytes().to_vec();
            bytes.resize(*n as usize, 0);
            bytes
        }
        (InitValue::Array(values), DataSignature::Array { element, len }) => {
            if let ArrayLen::Fixed(n) = len {
                if values.len() as u32 != *n {
                    return Err(LayoutError::ArityMismatch(port_name.to_string()));
                }
            }
            let elem_size = dsg_byte_size(element, port_name)?;
            let mut out = Vec::with_capacity((elem_size as usize) * values.len());
            for v in values {
                out.extend(encode_init_value(Some(v), element, elem_size, port_name)?);
            }
            out
        }
        (InitValue::Record(values), DataSignature::Record(fields)) => {
            if values.len() != fields.len() {
                return Err(LayoutError::ArityMismatch(port_name.to_string()));
            }
            let mut out = Vec::new();
            for ((_, field_dsg), (_, value)) in fields.iter().zip(values.iter()) {
                let field_size = dsg_byte_size(field_dsg, port_name)?;
                out.extend(encode_init_value(Some(value), field_dsg, field_size, port_name)?);
            }
            out
        }
        (InitValue::Raw(_), _) => {
            return Err(LayoutError::UnresolvedTypeRef(port_name.to_string()));
        }
        _ => return Err(LayoutError::ArityMismatch(port_name.to_string())),
    })
}

/// The routing key for a port: its name plus its typeref-free data
/// signature, so two ports only ever share a routing entry when both their
/// name and their resolved shape match (e.g. `"VehicleMode"C`). The optional
/// `(min,max)` value-range attribute is not part of a port's shape and never
/// enters this key.
fn port_signature(name: &str, dsg: &DataSignature) -> String {
    format!("\"{name}\"{}", dsg_signature(dsg))
}

/// A canonical, typeref-free textual signature for a data element's shape.
fn dsg_signature(dsg: &DataSignature) -> String {
    match dsg {
        DataSignature::U8 => "C".to_string(),
        DataSignature::U16 => "S".to_string(),
        DataSignature::U32 => "L".to_string(),
        DataSignature::U64 => "U".to_string(),
        DataSignature::I8 => "c".to_string(),
        DataSignature::I16 => "s".to_string(),
        DataSignature::I32 => "l".to_string(),
        DataSignature::I64 => "u".to_string(),
        DataSignature::Str(n) => format!("a[{n}]"),
        DataSignature::Record(fields) => {
            let body: String = fields
                .iter()
                .map(|(name, dsg)| format!("\"{name}\"{}", dsg_signature(dsg)))
                .collect();
            format!("{{{body}}}")
        }
        DataSignature::Array { element, len } => match len {
            ArrayLen::Fixed(n) => format!("{}[{n}]", dsg_signature(element)),
            ArrayLen::Dynamic => format!("{}[*]", dsg_signature(element)),
        },
        DataSignature::TypeRef(_) => "?".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::idl;

    fn layout_of(text: &str) -> NodeLayout {
        let mut node = idl::parse(text).unwrap();
        idl::finalize(&mut node).unwrap();
        compute_layout(&node).unwrap()
    }

    #[test]
    fn scalar_init_value_is_little_endian() {
        let layout = layout_of("APX/1.2\nN\"N\"\nR\"X\"S:=300\n");
        assert_eq!(layout.require_init_image, 300u16.to_le_bytes());
    }

    #[test]
    fn uninitialized_port_is_zero_filled() {
        let layout = layout_of("APX/1.2\nN\"N\"\nP\"X\"L\n");
        assert_eq!(layout.provide_init_image, vec![0u8; 4]);
    }

    #[test]
    fn string_literal_is_nul_padded() {
        let layout = layout_of("APX/1.2\nN\"N\"\nR\"X\"a[8]:=\"hi\"\n");
        let mut expected = b"hi".to_vec();
        expected.resize(8, 0);
        assert_eq!(layout.require_init_image, expected);
    }

    #[test]
    fn two_ports_lay_out_back_to_back() {
        let layout = layout_of("APX/1.2\nN\"N\"\nR\"A\"C\nR\"B\"S\n");
        assert_eq!(layout.require_props[0].offset, 0);
        assert_eq!(layout.require_props[1].offset, 1);
        assert_eq!(layout.require_init_image.len(), 3);
    }

    #[test]
    fn matching_signatures_require_same_name_and_shape() {
        let mut a = idl::parse("APX/1.2\nN\"A\"\nP\"X\"C(0,7)\n").unwrap();
        idl::finalize(&mut a).unwrap();
        let mut b = idl::parse("APX/1.2\nN\"B\"\nR\"X\"C(0,7)\n").unwrap();
        idl::finalize(&mut b).unwrap();
        let la = compute_layout(&a).unwrap();
        let lb = compute_layout(&b).unwrap();
        assert_eq!(la.provide_signatures(), lb.require_signatures());
    }

    #[test]
    fn same_shape_different_name_does_not_match() {
        let mut a = idl::parse("APX/1.2\nN\"A\"\nP\"X\"C(0,7)\n").unwrap();
        idl::finalize(&mut a).unwrap();
        let mut b = idl::parse("APX/1.2\nN\"B\"\nR\"Y\"C(0,7)\n").unwrap();
        idl::finalize(&mut b).unwrap();
        let la = compute_layout(&a).unwrap();
        let lb = compute_layout(&b).unwrap();
        assert_ne!(la.provide_signatures(), lb.require_signatures());
    }

    #[test]
    fn dynamic_array_without_bound_is_rejected() {
        let mut node = idl::parse("APX/1.2\nN\"N\"\nR\"X\"C[*]\n").unwrap();
        idl::finalize(&mut node).unwrap();
        assert!(compute_layout(&node).is_err());
    }

    #[test]
    fn oversize_string_literal_is_rejected() {
        let mut node = idl::parse("APX/1.2\nN\"N\"\nR\"X\"a[2]:=\"abc\"\n").unwrap();
        idl::finalize(&mut node).unwrap();
        assert!(compute_layout(&node).is_err());
    }
}

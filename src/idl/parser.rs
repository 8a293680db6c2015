//! A small hand-written, line-oriented recursive-descent parser for the APX
//! text IDL. Each non-blank line is one declaration (`N`, `T`, `R`, or `P`);
//! data signatures and literal attributes are parsed character-by-character
//! within a line.

use super::types::{
    ArrayLen, DataSignature, DataType, Direction, InitValue, Node, ParseError, Port,
    PortAttributes, TypeRefKind,
};

struct Cursor<'a> {
    s: &'a str,
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(s: &'a str) -> Self {
        Self { s, pos: 0 }
    }

    fn peek(&self) -> Option<char> {
        self.s[self.pos..].chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn eat(&mut self, expected: char) -> Result<(), String> {
        if self.peek() == Some(expected) {
            self.bump();
            Ok(())
        } else {
            Err(format!("expected '{expected}', found {:?}", self.peek()))
        }
    }
}

fn err(line: usize, message: String) -> ParseError {
    ParseError { line, message }
}

fn parse_until(c: &mut Cursor, stop: char) -> String {
    let start = c.pos;
    while let Some(ch) = c.peek() {
        if ch == stop {
            break;
        }
        c.bump();
    }
    c.s[start..c.pos].to_string()
}

fn parse_uint(c: &mut Cursor) -> Result<u32, String> {
    let start = c.pos;
    while matches!(c.peek(), Some(d) if d.is_ascii_digit()) {
        c.bump();
    }
    if c.pos == start {
        return Err("expected a number".to_string());
    }
    c.s[start..c.pos].parse::<u32>().map_err(|e| e.to_string())
}

fn parse_int(c: &mut Cursor) -> Result<i64, String> {
    let start = c.pos;
    if c.peek() == Some('-') {
        c.bump();
    }
    while matches!(c.peek(), Some(d) if d.is_ascii_digit()) {
        c.bump();
    }
    if c.pos == start {
        return Err("expected a number".to_string());
    }
    c.s[start..c.pos].parse::<i64>().map_err(|e| e.to_string())
}

fn parse_base_type(c: &mut Cursor) -> Result<DataSignature, String> {
    let ch = c
        .bump()
        .ok_or_else(|| "unexpected end of input while parsing a data signature".to_string())?;
    let head = match ch {
        'C' => DataSignature::U8,
        'S' => DataSignature::U16,
        'L' => DataSignature::U32,
        'c' => DataSignature::I8,
        's' => DataSignature::I16,
        'l' => DataSignature::I32,
        'U' => DataSignature::U64,
        'u' => DataSignature::I64,
        'a' => {
            c.eat('[')?;
            if c.peek() == Some('*') {
                c.bump();
                c.eat(']')?;
                return Err("dynamic-length strings ('a[*]') are not supported".to_string());
            }
            let n = parse_uint(c)?;
            c.eat(']')?;
            return Ok(DataSignature::Str(n));
        }
        '{' => {
            let mut fields = Vec::new();
            while c.peek() != Some('}') {
                c.eat('"')?;
                let name = parse_until(c, '"');
                c.eat('"')?;
                let field_ty = parse_type_with_suffix(c)?;
                fields.push((name, field_ty));
                if c.peek().is_none() {
                    return Err("unterminated record, missing '}'".to_string());
                }
            }
            c.eat('}')?;
            return Ok(DataSignature::Record(fields));
        }
        'T' => {
            c.eat('[')?;
            let r = if c.peek() == Some('"') {
                c.bump();
                let name = parse_until(c, '"');
                c.eat('"')?;
                TypeRefKind::ByName(name)
            } else {
                let id = parse_uint(c)?;
                TypeRefKind::ById(id)
            };
            c.eat(']')?;
            return Ok(DataSignature::TypeRef(r));
        }
        other => return Err(format!("unrecognized data signature character '{other}'")),
    };
    Ok(head)
}

fn parse_array_suffix(c: &mut Cursor, base: DataSignature) -> Result<DataSignature, String> {
    if c.peek() == Some('[') {
        c.bump();
        let len = if c.peek() == Some('*') {
            c.bump();
            ArrayLen::Dynamic
        } else {
            ArrayLen::Fixed(parse_uint(c)?)
        };
        c.eat(']')?;
        Ok(DataSignature::Array {
            element: Box::new(base),
            len,
        })
    } else {
        Ok(base)
    }
}

fn parse_type_with_suffix(c: &mut Cursor) -> Result<DataSignature, String> {
    let base = parse_base_type(c)?;
    parse_array_suffix(c, base)
}

fn parse_range(c: &mut Cursor) -> Result<(i64, i64), String> {
    c.eat('(')?;
    let min = parse_int(c)?;
    c.eat(',')?;
    let max = parse_int(c)?;
    c.eat(')')?;
    Ok((min, max))
}

fn parse_port_dsg(c: &mut Cursor) -> Result<(DataSignature, Option<(i64, i64)>), String> {
    let dsg = parse_type_with_suffix(c)?;
    let range = if dsg.is_scalar() && c.peek() == Some('(') {
        Some(parse_range(c)?)
    } else {
        None
    };
    Ok((dsg, range))
}

fn capture_balanced_literal(c: &mut Cursor) -> Result<String, String> {
    match c.peek() {
        Some('{') => {
            let start = c.pos;
            let mut depth = 0i32;
            loop {
                match c.bump() {
                    Some('{') => depth += 1,
                    Some('}') => {
                        depth -= 1;
                        if depth == 0 {
                            break;
                        }
                    }
                    Some(_) => {}
                    None => return Err("unterminated brace literal".to_string()),
                }
            }
            Ok(c.s[start..c.pos].to_string())
        }
        Some('"') => {
            c.bump();
            let s = parse_until(c, '"');
            c.eat('"')?;
            Ok(format!("\"{s}\""))
        }
        _ => {
            let start = c.pos;
            while c.peek().is_some() {
                c.bump();
            }
            Ok(c.s[start..c.pos].to_string())
        }
    }
}

/// Interprets a literal attribute value (`:=...`) in the context of `dsg`.
/// When `dsg` still contains an unresolved typeref the raw text is captured
/// for re-interpretation by [`super::finalize`].
fn parse_literal(c: &mut Cursor, dsg: &DataSignature) -> Result<InitValue, String> {
    match dsg {
        DataSignature::Str(_) => {
            c.eat('"')?;
            let s = parse_until(c, '"');
            c.eat('"')?;
            Ok(InitValue::Str(s))
        }
        DataSignature::Record(fields) => {
            c.eat('{')?;
            let mut values = Vec::with_capacity(fields.len());
            for (i, (name, field_dsg)) in fields.iter().enumerate() {
                if i > 0 {
                    c.eat(',')?;
                }
                values.push((name.clone(), parse_literal(c, field_dsg)?));
            }
            c.eat('}')?;
            Ok(InitValue::Record(values))
        }
        DataSignature::Array { element, len } => {
            c.eat('{')?;
            let mut values = Vec::new();
            let mut first = true;
            while c.peek() != Some('}') {
                if !first {
                    c.eat(',')?;
                }
                first = false;
                values.push(parse_literal(c, element)?);
            }
            c.eat('}')?;
            if let ArrayLen::Fixed(n) = len {
                if values.len() as u32 != *n {
                    return Err(format!(
                        "array literal has {} elements, expected {}",
                        values.len(),
                        n
                    ));
                }
            }
            Ok(InitValue::Array(values))
        }
        DataSignature::TypeRef(_) => Ok(InitValue::Raw(capture_balanced_literal(c)?)),
        _ => Ok(InitValue::Int(parse_int(c)?)),
    }
}

fn parse_header(line: &str) -> Result<(u32, u32), String> {
    let rest = line
        .strip_prefix("APX/")
        .ok_or_else(|| format!("expected an APX version header, found {line:?}"))?;
    let (maj, min) = rest
        .split_once('.')
        .ok_or_else(|| format!("malformed version string {rest:?}"))?;
    let major: u32 = maj
        .parse()
        .map_err(|_| format!("invalid major version {maj:?}"))?;
    let minor: u32 = min
        .parse()
        .map_err(|_| format!("invalid minor version {min:?}"))?;
    Ok((major, minor))
}

/// Parses a complete APX text document into an unfinalized [`Node`] (data
/// signatures may still contain unresolved [`DataSignature::TypeRef`]
/// nodes). Call [`super::finalize`] afterwards.
pub fn parse(text: &str) -> Result<Node, ParseError> {
    let mut lines = text.lines().enumerate().map(|(i, l)| (i + 1, l));

    let (header_line, major, minor) = loop {
        match lines.next() {
            Some((lineno, raw)) => {
                let line = raw.trim();
                if line.is_empty() {
                    continue;
                }
                let (major, minor) = parse_header(line).map_err(|m| err(lineno, m))?;
                break (lineno, major, minor);
            }
            None => return Err(err(0, "empty APX document".to_string())),
        }
    };

    let mut node_name = None;
    let mut datatypes = Vec::new();
    let mut require_ports = Vec::new();
    let mut provide_ports = Vec::new();
    let mut next_type_id = 0u32;
    let mut next_require_id = 0u32;
    let mut next_provide_id = 0u32;

    for (lineno, raw) in lines {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }
        let mut cursor = Cursor::new(line);
        let tag = cursor.bump().unwrap();
        match tag {
            'N' => {
                if node_name.is_some() {
                    return Err(err(lineno, "duplicate node name declaration".to_string()));
                }
                cursor.eat('"').map_err(|m| err(lineno, m))?;
                let name = parse_until(&mut cursor, '"');
                cursor.eat('"').map_err(|m| err(lineno, m))?;
                node_name = Some(name);
            }
            'T' => {
                cursor.eat('"').map_err(|m| err(lineno, m))?;
                let name = parse_until(&mut cursor, '"');
                cursor.eat('"').map_err(|m| err(lineno, m))?;
                let dsg = parse_type_with_suffix(&mut cursor).map_err(|m| err(lineno, m))?;
                let type_id = next_type_id;
                next_type_id += 1;
                datatypes.push(DataType {
                    name,
                    dsg,
                    type_id,
                    line: lineno,
                });
            }
            'R' | 'P' => {
                cursor.eat('"').map_err(|m| err(lineno, m))?;
                let name = parse_until(&mut cursor, '"');
                cursor.eat('"').map_err(|m| err(lineno, m))?;
                let (dsg, range) = parse_port_dsg(&mut cursor).map_err(|m| err(lineno, m))?;
                let mut attributes = PortAttributes {
                    init_value: None,
                    range,
                };
                if cursor.peek() == Some(':') {
                    cursor.bump();
                    cursor.eat('=').map_err(|m| err(lineno, m))?;
                    attributes.init_value =
                        Some(parse_literal(&mut cursor, &dsg).map_err(|m| err(lineno, m))?);
                }
                let direction = if tag == 'R' {
                    Direction::Require
                } else {
                    Direction::Provide
                };
                let port_id = if tag == 'R' {
                    let id = next_require_id;
                    next_require_id += 1;
                    id
                } else {
                    let id = next_provide_id;
                    next_provide_id += 1;
                    id
                };
                let port = Port {
                    name,
                    direction,
                    dsg,
                    attributes,
                    port_id,
                    line: lineno,
                };
                if tag == 'R' {
                    require_ports.push(port);
                } else {
                    provide_ports.push(port);
                }
            }
            other => {
                return Err(err(
                    lineno,
                    format!("unexpected line starting with '{other}'"),
                ))
            }
        }
    }

    let name = node_name.ok_or_else(|| {
        err(
            header_line,
            "missing node name (N\"...\") declaration".to_string(),
        )
    })?;

    Ok(Node {
        name,
        version_major: major,
        version_minor: minor,
        datatypes,
        require_ports,
        provide_ports,
    })
}

fn resolve_dsg(
    dsg: &DataSignature,
    node: &Node,
    cache: &mut [Option<DataSignature>],
    visiting: &mut [bool],
    line: usize,
) -> Result<DataSignature, ParseError> {
    Ok(match dsg {
        DataSignature::TypeRef(kind) => {
            let idx = match kind {
                TypeRefKind::ById(id) => node.datatypes.iter().position(|d| d.type_id == *id),
                TypeRefKind::ByName(name) => node.datatypes.iter().position(|d| &d.name == name),
            }
            .ok_or_else(|| err(line, format!("unresolved type reference {kind:?}")))?;
            if visiting[idx] {
                return Err(err(
                    line,
                    format!(
                        "cyclic type reference involving '{}'",
                        node.datatypes[idx].name
                    ),
                ));
            }
            if let Some(done) = &cache[idx] {
                return Ok(done.clone());
            }
            visiting[idx] = true;
            let inner = node.datatypes[idx].dsg.clone();
            let resolved = resolve_dsg(&inner, node, cache, visiting, node.datatypes[idx].line)?;
            visiting[idx] = false;
            cache[idx] = Some(resolved.clone());
            resolved
        }
        DataSignature::Array { element, len } => DataSignature::Array {
            element: Box::new(resolve_dsg(element, node, cache, visiting, line)?),
            len: *len,
        },
        DataSignature::Record(fields) => {
            let mut out = Vec::with_capacity(fields.len());
            for (name, field) in fields {
                out.push((name.clone(), resolve_dsg(field, node, cache, visiting, line)?));
            }
            DataSignature::Record(out)
        }
        other => other.clone(),
    })
}

/// Eliminates typeref indirection from every datatype and port, then
/// re-interprets any literal attribute that had been deferred because its
/// port referenced a not-yet-resolved type.
pub fn finalize(node: &mut Node) -> Result<(), ParseError> {
    let mut cache: Vec<Option<DataSignature>> = vec![None; node.datatypes.len()];
    for i in 0..node.datatypes.len() {
        if cache[i].is_some() {
            continue;
        }
        let mut visiting = vec![false; node.datatypes.len()];
        let dsg = node.datatypes[i].dsg.clone();
        let line = node.datatypes[i].line;
        let resolved = resolve_dsg(&dsg, node, &mut cache, &mut visiting, line)?;
        cache[i] = Some(resolved);
    }
    for (i, dt) in node.datatypes.iter_mut().enumerate() {
        dt.dsg = cache[i].clone().unwrap();
    }

    for port in node.require_ports.iter_mut().chain(node.provide_ports.iter_mut()) {
        let mut visiting = vec![false; node.datatypes.len()];
        let dsg = port.dsg.clone();
        port.dsg = resolve_dsg(&dsg, node, &mut cache, &mut visiting, port.line)?;
    }

    for port in node.require_ports.iter_mut().chain(node.provide_ports.iter_mut()) {
        if let Some(InitValue::Raw(text)) = port.attributes.init_value.clone() {
            let mut cursor = Cursor::new(&text);
            let value = parse_literal(&mut cursor, &port.dsg).map_err(|m| err(port.line, m))?;
            port.attributes.init_value = Some(value);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_vehicle_mode_node() {
        let text = "APX/1.2\nN\"TestNode\"\nR\"VehicleMode\"C(0,7):=7\nP\"VehicleSpeed\"S:=0\n";
        let mut node = parse(text).unwrap();
        finalize(&mut node).unwrap();
        assert_eq!(node.name, "TestNode");
        assert_eq!(node.require_ports.len(), 1);
        assert_eq!(node.provide_ports.len(), 1);
        let mode = &node.require_ports[0];
        assert_eq!(mode.dsg, DataSignature::U8);
        assert_eq!(mode.attributes.range, Some((0, 7)));
        assert_eq!(mode.attributes.init_value, Some(InitValue::Int(7)));
    }

    #[test]
    fn resolves_named_typeref() {
        let text = "APX/1.2\nN\"N2\"\nT\"Percent\"C(0,100)\nR\"Level\"T[\"Percent\"]:=50\n";
        let mut node = parse(text).unwrap();
        finalize(&mut node).unwrap();
        let level = &node.require_ports[0];
        assert_eq!(level.dsg, DataSignature::U8);
        assert_eq!(level.attributes.init_value, Some(InitValue::Int(50)));
    }

    #[test]
    fn resolves_typeref_by_id() {
        let text = "APX/1.2\nN\"N3\"\nT\"Byte\"C\nR\"X\"T[0]\n";
        let mut node = parse(text).unwrap();
        finalize(&mut node).unwrap();
        assert_eq!(node.require_ports[0].dsg, DataSignature::U8);
    }

    #[test]
    fn detects_unresolved_typeref() {
        let text = "APX/1.2\nN\"N4\"\nR\"X\"T[\"Missing\"]\n";
        let mut node = parse(text).unwrap();
        assert!(finalize(&mut node).is_err());
    }

    #[test]
    fn detects_cyclic_typeref() {
        let text = "APX/1.2\nN\"N5\"\nT\"A\"T[\"B\"]\nT\"B\"T[\"A\"]\n";
        let mut node = parse(text).unwrap();
        assert!(finalize(&mut node).is_err());
    }

    #[test]
    fn parses_record_and_array() {
        let text = "APX/1.2\nN\"N6\"\nR\"Pos\"{\"X\"S\"Y\"S}\nP\"Samples\"C[4]:={1,2,3,4}\n";
        let mut node = parse(text).unwrap();
        finalize(&mut node).unwrap();
        match &node.require_ports[0].dsg {
            DataSignature::Record(fields) => assert_eq!(fields.len(), 2),
            other => panic!("expected record, got {other:?}"),
        }
        match &node.provide_ports[0].attributes.init_value {
            Some(InitValue::Array(v)) => assert_eq!(v.len(), 4),
            other => panic!("expected array literal, got {other:?}"),
        }
    }

    #[test]
    fn rejects_missing_node_name() {
        let text = "APX/1.2\nR\"X\"C\n";
        assert!(parse(text).is_err());
    }

    #[test]
    fn rejects_dynamic_string_length() {
        let text = "APX/1.2\nN\"N7\"\nR\"X\"a[*]\n";
        assert!(parse(text).is_err());
    }
}

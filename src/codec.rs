//! Value codec for flattened context records.
//!
//! Context trees are stored as flat string fields in a hash. Paths use
//! dot-notation with base-10 integer segments denoting array indices. Values
//! are type-tagged strings: a leading `__TYPE__` token introduces `boolean`,
//! `number`, `null`, or `undefined`; an untagged value is a plain string, so
//! ambiguous strings like `"true"` are stored unchanged.

use serde_json::{Map, Number, Value};

/// A leaf value of a context tree.
#[derive(Clone, Debug, PartialEq)]
pub enum Scalar {
    /// A boolean, stored as `__boolean__true` / `__boolean__false`.
    Bool(bool),
    /// A finite number, stored as `__number__{n}`.
    Number(Number),
    /// A plain string, stored untagged.
    String(String),
    /// JSON null, stored as `__null__`.
    Null,
    /// An absent value, stored as `__undefined__`. Reconstructed trees
    /// represent it as JSON null, since the tree type has no distinct
    /// undefined.
    Undefined,
}

impl Scalar {
    /// Converts the scalar into a JSON tree leaf.
    pub fn into_value(self) -> Value {
        match self {
            Self::Bool(b) => Value::Bool(b),
            Self::Number(n) => Value::Number(n),
            Self::String(s) => Value::String(s),
            Self::Null | Self::Undefined => Value::Null,
        }
    }
}

/// Encodes a scalar into its stored representation.
pub fn encode(scalar: &Scalar) -> String {
    match scalar {
        Scalar::Bool(b) => format!("__boolean__{b}"),
        Scalar::Number(n) => format!("__number__{n}"),
        Scalar::String(s) => s.clone(),
        Scalar::Null => "__null__".into(),
        Scalar::Undefined => "__undefined__".into(),
    }
}

/// Decodes a stored representation back into a scalar.
///
/// An unknown tag falls back to the raw post-tag content, and malformed tagged
/// content decodes as the content string, so decoding never fails.
pub fn decode(raw: &str) -> Scalar {
    let Some((tag, rest)) = split_tag(raw) else {
        return Scalar::String(raw.into());
    };
    match tag {
        "boolean" if rest == "true" => Scalar::Bool(true),
        "boolean" if rest == "false" => Scalar::Bool(false),
        "number" => serde_json::from_str::<Number>(rest)
            .map(Scalar::Number)
            .unwrap_or_else(|_| Scalar::String(rest.into())),
        "null" if rest.is_empty() => Scalar::Null,
        "undefined" if rest.is_empty() => Scalar::Undefined,
        _ => Scalar::String(rest.into()),
    }
}

fn split_tag(raw: &str) -> Option<(&str, &str)> {
    let body = raw.strip_prefix("__")?;
    let end = body.find("__")?;
    Some((&body[..end], &body[end + 2..]))
}

/// Flattens a JSON tree rooted at `path` into `(dotted-path, scalar)` leaves.
///
/// Scalars and null map to one entry; objects recurse with `.{field}`; arrays
/// recurse with `.{index}`. An empty object or array contributes no entries.
pub fn flatten(path: &str, value: &Value, out: &mut Vec<(String, Scalar)>) {
    match value {
        Value::Null => out.push((path.into(), Scalar::Null)),
        Value::Bool(b) => out.push((path.into(), Scalar::Bool(*b))),
        Value::Number(n) => out.push((path.into(), Scalar::Number(n.clone()))),
        Value::String(s) => out.push((path.into(), Scalar::String(s.clone()))),
        Value::Array(items) => {
            for (index, item) in items.iter().enumerate() {
                flatten(&format!("{path}.{index}"), item, out);
            }
        }
        Value::Object(fields) => {
            for (field, item) in fields {
                flatten(&format!("{path}.{field}"), item, out);
            }
        }
    }
}

/// Rebuilds one leaf of a tree from its dotted path.
///
/// Purely numeric segments navigate arrays, expanding sparsely with null
/// placeholders; other segments navigate objects. Containers are created on
/// demand, and a leaf standing where a container is needed is replaced.
pub fn insert(root: &mut Value, segments: &[&str], scalar: Scalar) {
    replace(root, segments, scalar.into_value());
}

/// Assigns `value` (leaf or subtree) at the given path, with the same
/// navigation rules as [`insert`].
pub fn replace(root: &mut Value, segments: &[&str], value: Value) {
    let Some((head, rest)) = segments.split_first() else {
        *root = value;
        return;
    };

    match head.parse::<usize>() {
        Ok(index) => {
            if !root.is_array() {
                *root = Value::Array(Vec::new());
            }
            let items = root.as_array_mut().unwrap();
            if items.len() <= index {
                items.resize(index + 1, Value::Null);
            }
            replace(&mut items[index], rest, value);
        }
        Err(_) => {
            if !root.is_object() {
                *root = Value::Object(Map::new());
            }
            let fields = root.as_object_mut().unwrap();
            let slot = fields.entry(head.to_string()).or_insert(Value::Null);
            replace(slot, rest, value);
        }
    }
}

/// Splits a dotted path into its segments, dropping empty segments produced
/// by doubled dots.
pub fn segments(path: &str) -> Vec<&str> {
    path.split('.').filter(|s| !s.is_empty()).collect()
}

//! # Record Codec
//!
//! Converts between nested, schema-typed records and the flat,
//! position-indexed property maps a graph node can store.
//!
//! - `dehydrate` joins the string segments of every leaf path with
//!   `KEY_SEPARATOR` and drops the single permitted list index, placing the
//!   leaf at that index of a list-valued flat entry.
//! - `hydrate` is the inverse and needs a `Shape` to know which branches are
//!   lists.
//!
//! Both directions are exact inverses for well-formed records: at most one
//! list axis per path, no empty objects, and list elements that carry the same
//! keys. `null` leaves are stored as `NULL_SENTINEL`.

use crate::primitives::{KEY_SEPARATOR, NULL_SENTINEL};
use crate::types::{CodecError, Record};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use std::collections::BTreeMap;

// =============================================================================
// FLAT VALUES
// =============================================================================

/// A storable leaf value.
///
/// Numbers outside `i64` keep their decimal rendering so no float
/// arithmetic ever touches them.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Scalar {
    /// Text; the empty text is the null sentinel.
    Text(String),
    /// Integer number.
    Integer(i64),
    /// Any other JSON number, in its decimal rendering.
    Number(String),
    /// Boolean.
    Boolean(bool),
}

impl Scalar {
    /// The sentinel standing in for `null`.
    #[must_use]
    pub fn null() -> Self {
        Self::Text(NULL_SENTINEL.to_string())
    }

    /// Create a text scalar.
    #[must_use]
    pub fn text(value: impl Into<String>) -> Self {
        Self::Text(value.into())
    }

    /// Whether this scalar is the null sentinel.
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Text(s) if s == NULL_SENTINEL)
    }

    /// Borrow the text content, if this is non-null text.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) if s != NULL_SENTINEL => Some(s),
            _ => None,
        }
    }

    /// Encode a JSON leaf. Arrays and objects are not leaves.
    fn from_leaf(value: &Value) -> Option<Self> {
        match value {
            Value::Null => Some(Self::null()),
            Value::Bool(b) => Some(Self::Boolean(*b)),
            Value::Number(n) => Some(
                n.as_i64()
                    .map(Self::Integer)
                    .unwrap_or_else(|| Self::Number(n.to_string())),
            ),
            Value::String(s) => Some(Self::Text(s.clone())),
            Value::Array(_) | Value::Object(_) => None,
        }
    }

    /// Decode back into a JSON leaf.
    #[must_use]
    pub fn to_json(&self) -> Value {
        match self {
            Self::Text(s) if s == NULL_SENTINEL => Value::Null,
            Self::Text(s) => Value::String(s.clone()),
            Self::Integer(i) => Value::from(*i),
            Self::Number(s) => s
                .parse::<Number>()
                .map(Value::Number)
                .unwrap_or_else(|_| Value::String(s.clone())),
            Self::Boolean(b) => Value::Bool(*b),
        }
    }
}

/// One flat property: a single scalar, or the scalars of the list axis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlatValue {
    /// A path without a list index.
    Single(Scalar),
    /// A path through the list axis, in index order.
    Many(Vec<Scalar>),
}

impl FlatValue {
    /// Iterate over the contained scalars.
    pub fn scalars(&self) -> impl Iterator<Item = &Scalar> {
        let slice = match self {
            Self::Single(s) => std::slice::from_ref(s),
            Self::Many(list) => list.as_slice(),
        };
        slice.iter()
    }
}

/// Flat, graph-storable state of a record.
pub type Properties = BTreeMap<String, FlatValue>;

// =============================================================================
// SHAPE
// =============================================================================

/// The structure `hydrate` rebuilds a record into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Shape {
    /// A scalar value.
    Leaf,
    /// A substructure with named branches.
    Object(BTreeMap<String, Shape>),
    /// A list of the inner shape.
    List(Box<Shape>),
}

impl Shape {
    /// An object shape from `(name, shape)` pairs.
    #[must_use]
    pub fn object<K: Into<String>>(branches: impl IntoIterator<Item = (K, Shape)>) -> Self {
        Self::Object(branches.into_iter().map(|(k, s)| (k.into(), s)).collect())
    }

    /// An object shape whose branches are all leaves.
    #[must_use]
    pub fn leaves<K: Into<String>>(names: impl IntoIterator<Item = K>) -> Self {
        Self::object(names.into_iter().map(|n| (n, Self::Leaf)))
    }

    /// A list of the given shape.
    #[must_use]
    pub fn list(inner: Shape) -> Self {
        Self::List(Box::new(inner))
    }
}

/// The values of a field, treating `null` as none and a scalar as one.
#[must_use]
pub fn values_of(value: &Value) -> Vec<&Value> {
    match value {
        Value::Null => Vec::new(),
        Value::Array(items) => items.iter().collect(),
        other => vec![other],
    }
}

// =============================================================================
// DEHYDRATE
// =============================================================================

/// Flatten a nested record into graph-storable properties.
///
/// # Errors
///
/// `CodecError::MultipleListsPerPath` if a path crosses two list axes.
pub fn dehydrate(record: &Record) -> Result<Properties, CodecError> {
    let mut out = Properties::new();
    let mut path = Vec::new();
    for (key, value) in record {
        path.push(key.as_str());
        walk(value, &mut path, None, &mut out)?;
        path.pop();
    }
    Ok(out)
}

fn walk<'a>(
    value: &'a Value,
    path: &mut Vec<&'a str>,
    index: Option<usize>,
    out: &mut Properties,
) -> Result<(), CodecError> {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                path.push(key.as_str());
                walk(child, path, index, out)?;
                path.pop();
            }
            Ok(())
        }
        Value::Array(items) => {
            if index.is_some() {
                return Err(CodecError::MultipleListsPerPath {
                    path: path.join(KEY_SEPARATOR),
                });
            }
            if items.is_empty() {
                out.insert(path.join(KEY_SEPARATOR), FlatValue::Many(Vec::new()));
            }
            for (i, item) in items.iter().enumerate() {
                walk(item, path, Some(i), out)?;
            }
            Ok(())
        }
        leaf => {
            let key = path.join(KEY_SEPARATOR);
            let scalar = Scalar::from_leaf(leaf).unwrap_or_else(Scalar::null);
            match index {
                None => {
                    out.insert(key, FlatValue::Single(scalar));
                }
                Some(i) => {
                    let entry = out
                        .entry(key.clone())
                        .or_insert_with(|| FlatValue::Many(Vec::new()));
                    let FlatValue::Many(list) = entry else {
                        return Err(CodecError::ShapeMismatch {
                            key,
                            expected: "list",
                        });
                    };
                    if list.len() <= i {
                        list.resize(i + 1, Scalar::null());
                    }
                    list[i] = scalar;
                }
            }
            Ok(())
        }
    }
}

// =============================================================================
// HYDRATE
// =============================================================================

/// Rebuild a nested record from flat properties.
///
/// # Errors
///
/// - `CodecError::UnknownKey` if a key has no branch in the shape
/// - `CodecError::MultipleListsPerPath` if the shape stacks two lists on a path
/// - `CodecError::ShapeMismatch` if a scalar is stored where a list is
///   expected or vice versa
pub fn hydrate(properties: &Properties, shape: &Shape) -> Result<Record, CodecError> {
    if !matches!(shape, Shape::Object(_)) {
        return Err(CodecError::ShapeMismatch {
            key: String::new(),
            expected: "object",
        });
    }

    let mut root = Record::new();
    for (key, flat) in properties {
        let segments: Vec<&str> = key.split(KEY_SEPARATOR).collect();
        let (terminal, list_axis) = resolve(key, &segments, shape)?;
        let last = segments.len() - 1;

        match (list_axis, flat) {
            (None, FlatValue::Single(scalar)) if *terminal == Shape::Leaf => {
                object_at(&mut root, &segments[..last], key)?
                    .insert(segments[last].to_string(), scalar.to_json());
            }
            (Some(axis), FlatValue::Many(list)) if axis == last => {
                // A list of leaves, or an empty / all-null list of objects.
                if *terminal != Shape::Leaf && list.iter().any(|s| !s.is_null()) {
                    return Err(CodecError::ShapeMismatch {
                        key: key.clone(),
                        expected: "leaf",
                    });
                }
                object_at(&mut root, &segments[..last], key)?.insert(
                    segments[last].to_string(),
                    Value::Array(list.iter().map(Scalar::to_json).collect()),
                );
            }
            (Some(axis), FlatValue::Many(list)) if *terminal == Shape::Leaf => {
                let parent = object_at(&mut root, &segments[..axis], key)?;
                let branch = parent
                    .entry(segments[axis].to_string())
                    .or_insert_with(|| Value::Array(Vec::new()));
                let Value::Array(elements) = branch else {
                    return Err(CodecError::ShapeMismatch {
                        key: key.clone(),
                        expected: "list",
                    });
                };
                if elements.len() < list.len() {
                    elements.resize_with(list.len(), || Value::Object(Map::new()));
                }
                for (element, scalar) in elements.iter_mut().zip(list) {
                    let Value::Object(object) = element else {
                        return Err(CodecError::ShapeMismatch {
                            key: key.clone(),
                            expected: "object",
                        });
                    };
                    object_at(object, &segments[axis + 1..last], key)?
                        .insert(segments[last].to_string(), scalar.to_json());
                }
            }
            (None, _) => {
                return Err(CodecError::ShapeMismatch {
                    key: key.clone(),
                    expected: "scalar",
                });
            }
            (Some(_), _) => {
                return Err(CodecError::ShapeMismatch {
                    key: key.clone(),
                    expected: "list",
                });
            }
        }
    }
    Ok(root)
}

/// Walk the shape along `segments`; return the terminal shape and the
/// segment index carrying the list axis, if any.
fn resolve<'s>(
    key: &str,
    segments: &[&str],
    shape: &'s Shape,
) -> Result<(&'s Shape, Option<usize>), CodecError> {
    let mut current = shape;
    let mut list_axis = None;
    for (i, segment) in segments.iter().enumerate() {
        let Shape::Object(branches) = current else {
            return Err(CodecError::ShapeMismatch {
                key: key.to_string(),
                expected: "leaf",
            });
        };
        let mut branch = branches
            .get(*segment)
            .ok_or_else(|| CodecError::UnknownKey(key.to_string()))?;
        if let Shape::List(inner) = branch {
            if list_axis.is_some() {
                return Err(CodecError::MultipleListsPerPath {
                    path: key.to_string(),
                });
            }
            list_axis = Some(i);
            branch = inner.as_ref();
        }
        if matches!(branch, Shape::List(_)) {
            return Err(CodecError::MultipleListsPerPath {
                path: key.to_string(),
            });
        }
        current = branch;
    }
    Ok((current, list_axis))
}

/// Borrow (creating as needed) the object reached by `segments`.
fn object_at<'r>(
    root: &'r mut Record,
    segments: &[&str],
    key: &str,
) -> Result<&'r mut Record, CodecError> {
    let mut current = root;
    for segment in segments {
        let child = current
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        current = match child {
            Value::Object(object) => object,
            _ => {
                return Err(CodecError::ShapeMismatch {
                    key: key.to_string(),
                    expected: "object",
                });
            }
        };
    }
    Ok(current)
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: Value) -> Record {
        match value {
            Value::Object(map) => map,
            _ => Record::new(),
        }
    }

    fn contact_shape() -> Shape {
        Shape::object([
            ("name", Shape::Leaf),
            ("email", Shape::list(Shape::Leaf)),
            ("address", Shape::leaves(["street", "city"])),
            ("contact", Shape::list(Shape::leaves(["kind", "value"]))),
        ])
    }

    #[test]
    fn dehydrate_joins_paths_and_drops_index() {
        let flat = dehydrate(&record(json!({
            "name": "Ada",
            "address": {"street": "Main St", "city": null},
            "contact": [{"kind": "mail", "value": "a@b"}, {"kind": "fax", "value": "123"}]
        })))
        .expect("dehydrate");

        assert_eq!(flat["name"], FlatValue::Single(Scalar::text("Ada")));
        assert_eq!(flat["address.city"], FlatValue::Single(Scalar::null()));
        assert_eq!(
            flat["contact.kind"],
            FlatValue::Many(vec![Scalar::text("mail"), Scalar::text("fax")])
        );
    }

    #[test]
    fn dehydrate_rejects_two_list_axes() {
        let result = dehydrate(&record(json!({"contact": [{"tags": ["a", "b"]}]})));
        assert_eq!(
            result,
            Err(CodecError::MultipleListsPerPath {
                path: "contact.tags".into()
            })
        );
    }

    #[test]
    fn dehydrate_pads_sparse_lists_with_sentinels() {
        let flat = dehydrate(&record(json!({
            "contact": [{"kind": "mail"}, {"value": "x"}]
        })))
        .expect("dehydrate");

        assert_eq!(flat["contact.kind"], FlatValue::Many(vec![Scalar::text("mail")]));
        assert_eq!(
            flat["contact.value"],
            FlatValue::Many(vec![Scalar::null(), Scalar::text("x")])
        );
    }

    #[test]
    fn round_trip_nested_record() {
        let original = record(json!({
            "name": "Ada",
            "email": ["a@b", null],
            "address": {"street": "Main St", "city": "Berlin"},
            "contact": [{"kind": "mail", "value": "a@b"}, {"kind": "fax", "value": 42}]
        }));

        let flat = dehydrate(&original).expect("dehydrate");
        let back = hydrate(&flat, &contact_shape()).expect("hydrate");
        assert_eq!(back, original);
    }

    #[test]
    fn round_trip_empty_lists() {
        let original = record(json!({"email": [], "contact": []}));
        let back = hydrate(&dehydrate(&original).expect("dehydrate"), &contact_shape())
            .expect("hydrate");
        assert_eq!(back, original);
    }

    #[test]
    fn sentinel_only_list_hydrates_to_nulls() {
        let mut flat = Properties::new();
        flat.insert(
            "email".into(),
            FlatValue::Many(vec![Scalar::null(), Scalar::null()]),
        );
        let back = hydrate(&flat, &contact_shape()).expect("hydrate");
        assert_eq!(Value::Object(back), json!({"email": [null, null]}));
    }

    #[test]
    fn hydrate_rejects_list_where_scalar_expected() {
        let mut flat = Properties::new();
        flat.insert("name".into(), FlatValue::Many(vec![Scalar::text("Ada")]));
        assert!(matches!(
            hydrate(&flat, &contact_shape()),
            Err(CodecError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn hydrate_rejects_scalar_where_list_expected() {
        let mut flat = Properties::new();
        flat.insert("contact.kind".into(), FlatValue::Single(Scalar::text("mail")));
        assert!(matches!(
            hydrate(&flat, &contact_shape()),
            Err(CodecError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn hydrate_rejects_unknown_keys_and_stacked_lists() {
        let mut flat = Properties::new();
        flat.insert("nickname".into(), FlatValue::Single(Scalar::text("A")));
        assert_eq!(
            hydrate(&flat, &contact_shape()),
            Err(CodecError::UnknownKey("nickname".into()))
        );

        let stacked = Shape::object([("matrix", Shape::list(Shape::list(Shape::Leaf)))]);
        let mut flat = Properties::new();
        flat.insert("matrix".into(), FlatValue::Many(vec![Scalar::Integer(1)]));
        assert!(matches!(
            hydrate(&flat, &stacked),
            Err(CodecError::MultipleListsPerPath { .. })
        ));
    }

    #[test]
    fn large_numbers_keep_their_rendering() {
        let original = record(json!({"name": 18446744073709551615u64}));
        let flat = dehydrate(&original).expect("dehydrate");
        assert!(matches!(flat["name"], FlatValue::Single(Scalar::Number(_))));
        assert_eq!(hydrate(&flat, &contact_shape()).expect("hydrate"), original);
    }
}

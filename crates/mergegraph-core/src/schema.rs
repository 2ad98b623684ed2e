//! # Entity Schema Registry
//!
//! Per entity stem type: which fields are plain values, references to other
//! groups, or nested values, whether they are lists, and whether they are
//! required. The codec derives its hydration shapes from here and the merge
//! engine its strict-mode cardinality.
//!
//! Registries are TOML documents:
//!
//! ```toml
//! [nested.Text]
//! fields = ["value", "language"]
//!
//! [types.Person]
//! fields = [
//!     { name = "email", list = true },
//!     { name = "memberOf", kind = "reference", list = true },
//! ]
//! ```

use crate::codec::Shape;
use crate::primitives::RESERVED_FIELDS;
use crate::types::{EntityType, MergeGraphError, RuleKind};
use serde::Deserialize;
use std::collections::BTreeMap;

/// The registry compiled into the engine.
const BUILTIN_SCHEMA: &str = include_str!("../schema/default.toml");

// =============================================================================
// FIELD CLASSIFICATION
// =============================================================================

/// How a field is stored in the graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldKind {
    /// Dehydrated directly onto the node.
    Plain,
    /// An edge to the anchor of another group identity.
    Reference,
    /// Position-indexed child nodes of the named nested type.
    Nested(String),
}

/// One field of an entity type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSpec {
    /// The field name.
    pub name: String,
    /// How the field is stored.
    pub kind: FieldKind,
    /// Whether the field holds a list of values.
    pub list: bool,
    /// Whether strict merges must produce at least one value.
    pub required: bool,
}

/// The schema of one entity stem type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeSchema {
    /// The stem type.
    pub stem: EntityType,
    /// Restricted types cannot be re-assigned to another group.
    pub restricted: bool,
    /// Fields by name.
    pub fields: BTreeMap<String, FieldSpec>,
}

impl TypeSchema {
    /// Look up a field.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.get(name)
    }

    /// Fields of the given kind class, in name order.
    pub fn fields_where(
        &self,
        pred: impl Fn(&FieldKind) -> bool,
    ) -> impl Iterator<Item = &FieldSpec> {
        self.fields.values().filter(move |spec| pred(&spec.kind))
    }

    /// The hydration shape of the plain fields.
    #[must_use]
    pub fn plain_shape(&self) -> Shape {
        Shape::object(self.fields_where(|kind| *kind == FieldKind::Plain).map(|spec| {
            let shape = if spec.list {
                Shape::list(Shape::Leaf)
            } else {
                Shape::Leaf
            };
            (spec.name.clone(), shape)
        }))
    }

    /// The schema a rule component of this type is stored under.
    ///
    /// Every rule field is an optional list. Preventive fields list primary
    /// source references regardless of the field's own kind.
    #[must_use]
    pub fn rule_view(&self, kind: RuleKind) -> Self {
        let fields = self
            .fields
            .values()
            .map(|spec| {
                let field_kind = match kind {
                    RuleKind::Preventive => FieldKind::Reference,
                    RuleKind::Additive | RuleKind::Subtractive => spec.kind.clone(),
                };
                let view = FieldSpec {
                    name: spec.name.clone(),
                    kind: field_kind,
                    list: true,
                    required: false,
                };
                (spec.name.clone(), view)
            })
            .collect();
        Self {
            stem: self.stem.clone(),
            restricted: self.restricted,
            fields,
        }
    }
}

// =============================================================================
// ENTITY SCHEMA CAPABILITY
// =============================================================================

/// Field classification supplied to the codec and the merge engine.
pub trait EntitySchema {
    /// The schema of a stem type.
    fn type_schema(&self, stem: &EntityType) -> Option<&TypeSchema>;

    /// The hydration shape of a nested value type.
    fn nested_shape(&self, name: &str) -> Option<&Shape>;

    /// The schema of a stem type, or `InvalidRequest` if it is unknown.
    fn require(&self, stem: &EntityType) -> Result<&TypeSchema, MergeGraphError> {
        self.type_schema(stem)
            .ok_or_else(|| MergeGraphError::InvalidRequest(format!("unknown entity type: {stem}")))
    }
}

/// A static registry of entity types and nested value types.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaRegistry {
    types: BTreeMap<EntityType, TypeSchema>,
    nested: BTreeMap<String, Shape>,
}

impl EntitySchema for SchemaRegistry {
    fn type_schema(&self, stem: &EntityType) -> Option<&TypeSchema> {
        self.types.get(stem)
    }

    fn nested_shape(&self, name: &str) -> Option<&Shape> {
        self.nested.get(name)
    }
}

impl SchemaRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The registry shipped with the engine.
    pub fn builtin() -> Result<Self, MergeGraphError> {
        Self::from_toml(BUILTIN_SCHEMA)
    }

    /// Load a registry from a TOML document.
    pub fn from_toml(source: &str) -> Result<Self, MergeGraphError> {
        let document: SchemaDocument = toml::from_str(source)
            .map_err(|e| MergeGraphError::InvalidRequest(format!("invalid schema: {e}")))?;
        document.into_registry()
    }

    /// Register a nested value type whose branches are all leaves.
    #[must_use]
    pub fn with_nested(mut self, name: impl Into<String>, fields: &[&str]) -> Self {
        self.nested
            .insert(name.into(), Shape::leaves(fields.iter().copied()));
        self
    }

    /// Register an entity type.
    #[must_use]
    pub fn with_type(mut self, stem: &str, restricted: bool, fields: Vec<FieldSpec>) -> Self {
        let stem = EntityType::new(stem);
        let fields = fields.into_iter().map(|f| (f.name.clone(), f)).collect();
        self.types.insert(
            stem.clone(),
            TypeSchema {
                stem,
                restricted,
                fields,
            },
        );
        self
    }

    /// All registered stem types, in name order.
    pub fn entity_types(&self) -> impl Iterator<Item = &EntityType> {
        self.types.keys()
    }
}

impl FieldSpec {
    /// A plain field.
    #[must_use]
    pub fn plain(name: &str, list: bool) -> Self {
        Self {
            name: name.to_string(),
            kind: FieldKind::Plain,
            list,
            required: false,
        }
    }

    /// A reference field.
    #[must_use]
    pub fn reference(name: &str, list: bool) -> Self {
        Self {
            kind: FieldKind::Reference,
            ..Self::plain(name, list)
        }
    }

    /// A nested value field.
    #[must_use]
    pub fn nested(name: &str, nested: &str, list: bool) -> Self {
        Self {
            kind: FieldKind::Nested(nested.to_string()),
            ..Self::plain(name, list)
        }
    }

    /// Mark the field as required.
    #[must_use]
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }
}

// =============================================================================
// TOML DOCUMENT
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SchemaDocument {
    #[serde(default)]
    nested: BTreeMap<String, NestedDocument>,
    #[serde(default)]
    types: BTreeMap<String, TypeDocument>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct NestedDocument {
    fields: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct TypeDocument {
    #[serde(default)]
    restricted: bool,
    fields: Vec<FieldDocument>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FieldDocument {
    name: String,
    #[serde(default)]
    kind: KindDocument,
    #[serde(default)]
    list: bool,
    #[serde(default)]
    required: bool,
    nested: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
enum KindDocument {
    #[default]
    Plain,
    Reference,
    Nested,
}

impl SchemaDocument {
    fn into_registry(self) -> Result<SchemaRegistry, MergeGraphError> {
        let mut registry = SchemaRegistry::new();
        for (name, nested) in self.nested {
            registry
                .nested
                .insert(name, Shape::leaves(nested.fields));
        }

        for (stem, document) in self.types {
            let mut fields = Vec::with_capacity(document.fields.len());
            for field in document.fields {
                if RESERVED_FIELDS.contains(&field.name.as_str()) {
                    return Err(MergeGraphError::InvalidRequest(format!(
                        "{stem}.{} is managed by the engine",
                        field.name
                    )));
                }
                let kind = match (field.kind, field.nested) {
                    (KindDocument::Plain, None) => FieldKind::Plain,
                    (KindDocument::Reference, None) => FieldKind::Reference,
                    (KindDocument::Nested, Some(nested))
                        if registry.nested.contains_key(&nested) =>
                    {
                        FieldKind::Nested(nested)
                    }
                    (KindDocument::Nested, other) => {
                        return Err(MergeGraphError::InvalidRequest(format!(
                            "{stem}.{} names unknown nested type {other:?}",
                            field.name
                        )));
                    }
                    (_, Some(_)) => {
                        return Err(MergeGraphError::InvalidRequest(format!(
                            "{stem}.{} sets `nested` without kind = \"nested\"",
                            field.name
                        )));
                    }
                };
                fields.push(FieldSpec {
                    name: field.name,
                    kind,
                    list: field.list,
                    required: field.required,
                });
            }
            registry = registry.with_type(&stem, document.restricted, fields);
        }
        Ok(registry)
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_registry_loads() {
        let registry = SchemaRegistry::builtin().expect("builtin schema");
        let person = registry
            .type_schema(&EntityType::new("Person"))
            .expect("person");

        assert_eq!(
            person.field("memberOf").map(|f| &f.kind),
            Some(&FieldKind::Reference)
        );
        assert!(registry.nested_shape("Text").is_some());
        assert!(
            registry
                .type_schema(&EntityType::new("PrimarySource"))
                .expect("primary source")
                .restricted
        );
    }

    #[test]
    fn reserved_fields_are_rejected() {
        let source = r#"
            [types.Person]
            fields = [{ name = "identifier" }]
        "#;
        assert!(SchemaRegistry::from_toml(source).is_err());
    }

    #[test]
    fn nested_fields_need_a_known_nested_type() {
        let source = r#"
            [types.Person]
            fields = [{ name = "bio", kind = "nested", nested = "Markdown" }]
        "#;
        assert!(SchemaRegistry::from_toml(source).is_err());
    }

    #[test]
    fn rule_views_are_optional_lists() {
        let registry = SchemaRegistry::new().with_type(
            "Person",
            false,
            vec![
                FieldSpec::plain("fullName", false).required(),
                FieldSpec::reference("memberOf", true),
            ],
        );
        let person = registry.require(&EntityType::new("Person")).expect("person");

        let additive = person.rule_view(RuleKind::Additive);
        let full_name = additive.field("fullName").expect("field");
        assert!(full_name.list);
        assert!(!full_name.required);
        assert_eq!(full_name.kind, FieldKind::Plain);

        let preventive = person.rule_view(RuleKind::Preventive);
        assert_eq!(
            preventive.field("fullName").map(|f| &f.kind),
            Some(&FieldKind::Reference)
        );
    }

    #[test]
    fn unknown_type_is_an_invalid_request() {
        let registry = SchemaRegistry::new();
        assert!(matches!(
            registry.require(&EntityType::new("Ghost")),
            Err(MergeGraphError::InvalidRequest(_))
        ));
    }

    #[test]
    fn plain_shape_follows_cardinality() {
        let registry = SchemaRegistry::new().with_type(
            "Person",
            false,
            vec![
                FieldSpec::plain("fullName", false),
                FieldSpec::plain("email", true),
                FieldSpec::reference("memberOf", true),
            ],
        );
        let shape = registry
            .require(&EntityType::new("Person"))
            .expect("person")
            .plain_shape();
        assert_eq!(
            shape,
            Shape::object([
                ("email", Shape::list(Shape::Leaf)),
                ("fullName", Shape::Leaf),
            ])
        );
    }
}

//! # Merge Engine
//!
//! Folds every extracted item of a group and its rule set into one merged
//! item. Per field, in this order:
//!
//! 1. Union of the items' values in identifier order, skipping items whose
//!    primary source the preventive component blocks for that field
//! 2. Additive values appended
//! 3. Subtractive values removed; absent ones are ignored
//!
//! Values are deduplicated by structural equality as they are appended.
//! Strict mode then applies the schema's cardinality; preview mode returns
//! every field as a list and never fails on cardinality.

use crate::codec::values_of;
use crate::schema::TypeSchema;
use crate::types::{
    ExtractedItem, Identifier, MergeGraphError, MergeMode, MergedItem, Record, RuleSet,
};
use serde_json::Value;
use std::collections::BTreeSet;

fn push_unique(values: &mut Vec<Value>, value: &Value) {
    if !values.contains(value) {
        values.push(value.clone());
    }
}

fn rule_values<'r>(
    rule_set: Option<&'r RuleSet>,
    pick: fn(&RuleSet) -> &Record,
    field: &str,
) -> Vec<&'r Value> {
    rule_set
        .and_then(|rules| pick(rules).get(field))
        .map(values_of)
        .unwrap_or_default()
}

/// Merge a group's extracted items with its rule set.
///
/// # Errors
///
/// - `NothingToMerge` if there are neither items nor a rule set
/// - `InconsistentStore` if an item or the rule set is of another type
/// - `Cardinality` in strict mode if a required field is empty or a
///   single-valued field ends up with several values
pub fn build_entity(
    group: &Identifier,
    items: &[ExtractedItem],
    rule_set: Option<&RuleSet>,
    schema: &TypeSchema,
    mode: MergeMode,
) -> Result<MergedItem, MergeGraphError> {
    if items.is_empty() && rule_set.is_none() {
        return Err(MergeGraphError::NothingToMerge(group.clone()));
    }
    let stems = items
        .iter()
        .map(|item| &item.entity_type)
        .chain(rule_set.map(|rules| &rules.entity_type));
    for stem in stems {
        if *stem != schema.stem {
            return Err(MergeGraphError::InconsistentStore(format!(
                "group {group} mixes {stem} with {}",
                schema.stem
            )));
        }
    }

    let mut ordered: Vec<&ExtractedItem> = items.iter().collect();
    ordered.sort_by(|a, b| a.identifier.cmp(&b.identifier));

    let mut fields = Record::new();
    for (name, spec) in &schema.fields {
        let blocked: BTreeSet<&str> = rule_values(rule_set, |r| &r.preventive, name)
            .into_iter()
            .filter_map(Value::as_str)
            .collect();

        let mut values = Vec::new();
        for item in &ordered {
            if blocked.contains(item.primary_source.as_str()) {
                continue;
            }
            if let Some(value) = item.fields.get(name) {
                for element in values_of(value) {
                    push_unique(&mut values, element);
                }
            }
        }
        for element in rule_values(rule_set, |r| &r.additive, name) {
            push_unique(&mut values, element);
        }
        let subtract = rule_values(rule_set, |r| &r.subtractive, name);
        values.retain(|value| !subtract.contains(&value));

        match mode {
            MergeMode::Preview => {
                fields.insert(name.clone(), Value::Array(values));
            }
            MergeMode::Strict => {
                if spec.required && values.is_empty() {
                    return Err(MergeGraphError::Cardinality {
                        field: name.clone(),
                        reason: "required field has no value".to_string(),
                    });
                }
                if spec.list {
                    fields.insert(name.clone(), Value::Array(values));
                } else if values.len() > 1 {
                    return Err(MergeGraphError::Cardinality {
                        field: name.clone(),
                        reason: format!("{} values for a single-valued field", values.len()),
                    });
                } else if let Some(value) = values.pop() {
                    fields.insert(name.clone(), value);
                }
            }
        }
    }

    Ok(MergedItem {
        entity_type: schema.stem.clone(),
        identifier: group.clone(),
        fields,
    })
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{EntitySchema, FieldSpec, SchemaRegistry};
    use crate::types::{EntityType, Identity, RuleKind};
    use serde_json::json;

    fn person_schema() -> TypeSchema {
        SchemaRegistry::new()
            .with_type(
                "Person",
                false,
                vec![
                    FieldSpec::plain("email", true),
                    FieldSpec::plain("fullName", true),
                    FieldSpec::plain("givenName", true),
                    FieldSpec::reference("memberOf", true),
                    FieldSpec::plain("orcidId", false),
                ],
            )
            .require(&EntityType::new("Person"))
            .expect("person")
            .clone()
    }

    fn item(id: &str, source: &str) -> ExtractedItem {
        let identity = Identity {
            identifier: Identifier::new(id),
            group_identity: Identifier::new("g1"),
            primary_source: Identifier::new(source),
            source_local_id: id.to_string(),
        };
        ExtractedItem::new(EntityType::new("Person"), &identity)
    }

    fn person_rules() -> RuleSet {
        RuleSet::new(EntityType::new("Person"))
    }

    #[test]
    fn person_merge_scenario() {
        let a = item("a", "9")
            .with_field("email", json!(["z@x"]))
            .with_field("fullName", json!(["Dr. Zoidberg"]));
        let b = item("b", "11")
            .with_field("email", json!(["m@y"]))
            .with_field("fullName", json!(["Mr. Krabs"]))
            .with_field("memberOf", json!(["500", "750"]));
        let rules = person_rules()
            .with_rule(RuleKind::Preventive, "email", json!(["9"]))
            .with_rule(RuleKind::Preventive, "fullName", json!(["9"]))
            .with_rule(RuleKind::Additive, "givenName", json!(["Eugene", "Harold", "John"]))
            .with_rule(RuleKind::Additive, "memberOf", json!(["500"]))
            .with_rule(RuleKind::Subtractive, "email", json!(["m@y"]))
            .with_rule(RuleKind::Subtractive, "givenName", json!(["John"]));

        let merged = build_entity(
            &Identifier::new("g1"),
            &[a, b],
            Some(&rules),
            &person_schema(),
            MergeMode::Strict,
        )
        .expect("merge");

        assert_eq!(merged.field("email"), Some(&json!([])));
        assert_eq!(merged.field("fullName"), Some(&json!(["Mr. Krabs"])));
        assert_eq!(merged.field("givenName"), Some(&json!(["Eugene", "Harold"])));
        assert_eq!(merged.field("memberOf"), Some(&json!(["500", "750"])));
        assert_eq!(merged.field("orcidId"), None);
    }

    #[test]
    fn set_algebra_ignores_submission_order() {
        let x = item("a", "p1").with_field("email", json!(["x", "y"]));
        let y = item("b", "p2").with_field("email", json!(["y"]));
        let rules = person_rules()
            .with_rule(RuleKind::Additive, "email", json!(["y", "z"]))
            .with_rule(RuleKind::Subtractive, "email", json!(["x", "absent"]));
        let schema = person_schema();

        for items in [vec![x.clone(), y.clone()], vec![y, x]] {
            let merged = build_entity(
                &Identifier::new("g1"),
                &items,
                Some(&rules),
                &schema,
                MergeMode::Strict,
            )
            .expect("merge");
            assert_eq!(merged.field("email"), Some(&json!(["y", "z"])));
        }
    }

    #[test]
    fn preventive_blocks_by_source_not_value() {
        let blocked = item("a", "p1").with_field("email", json!(["only@p1"]));
        let kept = item("b", "p2").with_field("fullName", json!(["Kept"]));
        let rules = person_rules().with_rule(RuleKind::Preventive, "email", json!(["p1"]));

        let merged = build_entity(
            &Identifier::new("g1"),
            &[blocked, kept],
            Some(&rules),
            &person_schema(),
            MergeMode::Preview,
        )
        .expect("merge");
        assert_eq!(merged.field("email"), Some(&json!([])));
        assert_eq!(merged.field("fullName"), Some(&json!(["Kept"])));
    }

    #[test]
    fn subtractive_retracts_additive() {
        let rules = person_rules()
            .with_rule(RuleKind::Additive, "givenName", json!(["John"]))
            .with_rule(RuleKind::Subtractive, "givenName", json!(["John"]));
        let merged = build_entity(
            &Identifier::new("g1"),
            &[],
            Some(&rules),
            &person_schema(),
            MergeMode::Strict,
        )
        .expect("merge");
        assert_eq!(merged.field("givenName"), Some(&json!([])));
    }

    #[test]
    fn nothing_to_merge() {
        assert!(matches!(
            build_entity(
                &Identifier::new("g1"),
                &[],
                None,
                &person_schema(),
                MergeMode::Preview
            ),
            Err(MergeGraphError::NothingToMerge(_))
        ));
    }

    #[test]
    fn strict_collapses_single_valued_fields() {
        let schema = person_schema();
        let one = item("a", "p1").with_field("orcidId", json!("0001"));
        let merged = build_entity(
            &Identifier::new("g1"),
            &[one.clone()],
            None,
            &schema,
            MergeMode::Strict,
        )
        .expect("merge");
        assert_eq!(merged.field("orcidId"), Some(&json!("0001")));

        let two = item("b", "p2").with_field("orcidId", json!("0002"));
        let items = [one, two];
        assert!(matches!(
            build_entity(&Identifier::new("g1"), &items, None, &schema, MergeMode::Strict),
            Err(MergeGraphError::Cardinality { .. })
        ));

        let preview = build_entity(
            &Identifier::new("g1"),
            &items,
            None,
            &schema,
            MergeMode::Preview,
        )
        .expect("preview");
        assert_eq!(preview.field("orcidId"), Some(&json!(["0001", "0002"])));
    }

    #[test]
    fn strict_enforces_required_fields() {
        let schema = SchemaRegistry::new()
            .with_type(
                "ContactPoint",
                false,
                vec![FieldSpec::plain("email", true).required()],
            )
            .require(&EntityType::new("ContactPoint"))
            .expect("contact point")
            .clone();
        let identity = Identity {
            identifier: Identifier::new("c1"),
            group_identity: Identifier::new("g1"),
            primary_source: Identifier::new("p1"),
            source_local_id: "c1".to_string(),
        };
        let empty = ExtractedItem::new(EntityType::new("ContactPoint"), &identity);

        assert!(matches!(
            build_entity(
                &Identifier::new("g1"),
                &[empty.clone()],
                None,
                &schema,
                MergeMode::Strict
            ),
            Err(MergeGraphError::Cardinality { .. })
        ));
        assert!(
            build_entity(&Identifier::new("g1"), &[empty], None, &schema, MergeMode::Preview)
                .is_ok()
        );
    }

    #[test]
    fn nested_values_dedupe_structurally() {
        let schema = SchemaRegistry::new()
            .with_nested("Text", &["value", "language"])
            .with_type("Resource", false, vec![FieldSpec::nested("title", "Text", true)])
            .require(&EntityType::new("Resource"))
            .expect("resource")
            .clone();
        let identity = |id: &str| Identity {
            identifier: Identifier::new(id),
            group_identity: Identifier::new("g1"),
            primary_source: Identifier::new(id),
            source_local_id: id.to_string(),
        };
        let a = ExtractedItem::new(EntityType::new("Resource"), &identity("a"))
            .with_field("title", json!([{"value": "T", "language": "en"}]));
        let b = ExtractedItem::new(EntityType::new("Resource"), &identity("b"))
            .with_field("title", json!([{"language": "en", "value": "T"}]));

        let merged = build_entity(&Identifier::new("g1"), &[a, b], None, &schema, MergeMode::Strict)
            .expect("merge");
        assert_eq!(merged.field("title").and_then(Value::as_array).map(Vec::len), Some(1));
    }

    #[test]
    fn mixed_types_are_inconsistent() {
        let rules = RuleSet::new(EntityType::new("Organization"));
        assert!(matches!(
            build_entity(
                &Identifier::new("g1"),
                &[],
                Some(&rules),
                &person_schema(),
                MergeMode::Strict
            ),
            Err(MergeGraphError::InconsistentStore(_))
        ));
    }
}

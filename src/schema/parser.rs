use std::path::Path;

use serde::Deserialize;

use super::types::{
    DefaultRule, FieldDescriptor, FieldKind, ModelDescriptor, RelationDescriptor, SchemaDefinition,
    UniqueConstraint,
};
use crate::error::{MirrorDbError, Result};

/// Parse a schema YAML file into a SchemaDefinition.
pub fn parse_schema(path: &Path) -> Result<SchemaDefinition> {
    let content = std::fs::read_to_string(path)?;
    parse_schema_str(&content)
}

/// Parse a schema YAML string into a SchemaDefinition.
/// Model and field declaration order is preserved.
pub fn parse_schema_str(content: &str) -> Result<SchemaDefinition> {
    let raw: RawSchema = serde_yaml::from_str(content)?;

    let mut models = Vec::new();
    for (name, value) in raw.models {
        let name = string_key(&name, "model")?;
        let raw_model: RawModel = serde_yaml::from_value(value)?;
        models.push(build_model(name, raw_model)?);
    }

    let schema = SchemaDefinition { models };
    check_relations(&schema)?;
    Ok(schema)
}

#[derive(Debug, Deserialize)]
struct RawSchema {
    models: serde_yaml::Mapping,
}

#[derive(Debug, Deserialize)]
struct RawModel {
    fields: serde_yaml::Mapping,
    #[serde(default)]
    uniques: serde_yaml::Mapping,
}

#[derive(Debug, Deserialize)]
struct RawField {
    #[serde(rename = "type")]
    kind: FieldKind,
    #[serde(default)]
    required: bool,
    #[serde(default)]
    list: bool,
    #[serde(default)]
    id: bool,
    #[serde(default)]
    unique: bool,
    #[serde(default)]
    default: Option<DefaultRule>,
    #[serde(default)]
    target: Option<String>,
    #[serde(default)]
    fields: Vec<String>,
    #[serde(default)]
    references: Vec<String>,
    #[serde(default)]
    relation_name: Option<String>,
}

fn build_model(name: String, raw: RawModel) -> Result<ModelDescriptor> {
    let mut fields = Vec::new();
    for (field_name, value) in raw.fields {
        let field_name = string_key(&field_name, "field")?;
        let spec: RawField = serde_yaml::from_value(value)
            .map_err(|e| MirrorDbError::Schema(format!("Field '{name}.{field_name}': {e}")))?;
        fields.push(build_field(&name, field_name, spec)?);
    }

    let mut uniques = Vec::new();
    for (constraint_name, value) in raw.uniques {
        let constraint_name = string_key(&constraint_name, "unique constraint")?;
        let constraint_fields: Vec<String> = serde_yaml::from_value(value)
            .map_err(|e| MirrorDbError::Schema(format!("Unique '{name}.{constraint_name}': {e}")))?;
        for f in &constraint_fields {
            if !fields.iter().any(|fd| &fd.name == f) {
                return Err(MirrorDbError::Schema(format!(
                    "Unique constraint '{constraint_name}' on '{name}' references unknown field '{f}'"
                )));
            }
        }
        uniques.push(UniqueConstraint {
            name: constraint_name,
            fields: constraint_fields,
        });
    }

    Ok(ModelDescriptor { name, fields, uniques })
}

fn build_field(model: &str, name: String, spec: RawField) -> Result<FieldDescriptor> {
    let relation = if spec.kind == FieldKind::Relation {
        let target = spec.target.ok_or_else(|| {
            MirrorDbError::Schema(format!("Relation field '{model}.{name}' is missing 'target'"))
        })?;
        if spec.fields.len() != spec.references.len() {
            return Err(MirrorDbError::Schema(format!(
                "Relation field '{model}.{name}' has {} foreign keys but {} references",
                spec.fields.len(),
                spec.references.len()
            )));
        }
        Some(RelationDescriptor {
            target,
            fields: spec.fields,
            references: spec.references,
            name: spec.relation_name,
        })
    } else {
        if spec.target.is_some() || !spec.fields.is_empty() {
            return Err(MirrorDbError::Schema(format!(
                "Field '{model}.{name}' declares relation metadata but is not of type 'relation'"
            )));
        }
        None
    };

    Ok(FieldDescriptor {
        name,
        kind: spec.kind,
        required: spec.required,
        list: spec.list,
        id: spec.id,
        unique: spec.unique,
        default: spec.default,
        relation,
    })
}

/// Every relation target must exist, and foreign-key fields must be declared
/// scalars on the owning model.
fn check_relations(schema: &SchemaDefinition) -> Result<()> {
    for model in &schema.models {
        for field in model.relation_fields() {
            let relation = field.relation.as_ref().expect("relation field");
            if schema.model(&relation.target).is_none() {
                return Err(MirrorDbError::Schema(format!(
                    "Relation '{}.{}' targets unknown model '{}'",
                    model.name, field.name, relation.target
                )));
            }
            for fk in &relation.fields {
                match model.field(fk) {
                    Some(f) if f.relation.is_none() => {}
                    _ => {
                        return Err(MirrorDbError::Schema(format!(
                            "Relation '{}.{}' uses '{}' as a foreign key, but it is not a scalar field",
                            model.name, field.name, fk
                        )));
                    }
                }
            }
        }
    }
    Ok(())
}

fn string_key(key: &serde_yaml::Value, what: &str) -> Result<String> {
    key.as_str()
        .map(|s| s.to_string())
        .ok_or_else(|| MirrorDbError::Schema(format!("Expected a string {what} name, got {key:?}")))
}

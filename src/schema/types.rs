use serde::{Deserialize, Serialize};

use crate::error::{MirrorDbError, Result};

/// The full declarative data model: one descriptor per entity.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchemaDefinition {
    pub models: Vec<ModelDescriptor>,
}

impl SchemaDefinition {
    pub fn model(&self, name: &str) -> Option<&ModelDescriptor> {
        self.models.iter().find(|m| m.name == name)
    }

    pub fn expect_model(&self, name: &str) -> Result<&ModelDescriptor> {
        self.model(name)
            .ok_or_else(|| MirrorDbError::Validation(format!("Unknown model '{name}'")))
    }

    /// Resolve the owning side of a relation seen from its non-owning end.
    /// Returns the target model together with the relation field on it that
    /// carries the foreign keys pointing back at `model`.
    pub fn inverse_relation<'a>(
        &'a self,
        model: &ModelDescriptor,
        field: &FieldDescriptor,
    ) -> Result<(&'a ModelDescriptor, &'a FieldDescriptor)> {
        let relation = field.relation.as_ref().ok_or_else(|| {
            MirrorDbError::Schema(format!("Field '{}.{}' is not a relation", model.name, field.name))
        })?;
        let target = self.model(&relation.target).ok_or_else(|| {
            MirrorDbError::Schema(format!(
                "Relation '{}.{}' targets unknown model '{}'",
                model.name, field.name, relation.target
            ))
        })?;

        let inverse = target
            .fields
            .iter()
            .find(|f| {
                let Some(r) = f.relation.as_ref() else {
                    return false;
                };
                if r.target != model.name || r.fields.is_empty() {
                    return false;
                }
                match (&relation.name, &r.name) {
                    (Some(a), Some(b)) => a == b,
                    _ => true,
                }
            })
            .ok_or_else(|| {
                MirrorDbError::Schema(format!(
                    "No owning relation on '{}' pointing back to '{}.{}'",
                    target.name, model.name, field.name
                ))
            })?;

        Ok((target, inverse))
    }
}

/// Static per-entity metadata: fields, unique constraints, relations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub name: String,
    pub fields: Vec<FieldDescriptor>,
    #[serde(default)]
    pub uniques: Vec<UniqueConstraint>,
}

impl ModelDescriptor {
    pub fn field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn scalar_fields(&self) -> impl Iterator<Item = &FieldDescriptor> {
        self.fields.iter().filter(|f| f.relation.is_none())
    }

    pub fn relation_fields(&self) -> impl Iterator<Item = &FieldDescriptor> {
        self.fields.iter().filter(|f| f.relation.is_some())
    }

    /// Names of the id field(s).
    pub fn primary_key(&self) -> Vec<&str> {
        self.fields.iter().filter(|f| f.id).map(|f| f.name.as_str()).collect()
    }

    /// Every unique constraint on this model: single-field constraints for
    /// id/unique fields plus the declared compound constraints.
    pub fn unique_constraints(&self) -> Vec<UniqueConstraint> {
        let mut constraints: Vec<UniqueConstraint> = self
            .fields
            .iter()
            .filter(|f| f.id || f.unique)
            .map(|f| UniqueConstraint {
                name: f.name.clone(),
                fields: vec![f.name.clone()],
            })
            .collect();
        constraints.extend(self.uniques.iter().cloned());
        constraints
    }
}

/// A named unique constraint over an ordered set of fields.
/// Compound constraints default to the fields joined by '_', which is also
/// the selector key accepted by `findUnique`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UniqueConstraint {
    pub name: String,
    pub fields: Vec<String>,
}

/// Definition of a single field on a model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldDescriptor {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: FieldKind,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub list: bool,
    #[serde(default)]
    pub id: bool,
    #[serde(default)]
    pub unique: bool,
    #[serde(default)]
    pub default: Option<DefaultRule>,
    #[serde(default)]
    pub relation: Option<RelationDescriptor>,
}

impl FieldDescriptor {
    pub fn is_relation(&self) -> bool {
        self.relation.is_some()
    }

    /// Owning side of a relation carries the foreign keys.
    pub fn is_owning_relation(&self) -> bool {
        self.relation.as_ref().is_some_and(|r| !r.fields.is_empty())
    }
}

/// Scalar kind enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    String,
    Int,
    Float,
    Boolean,
    Datetime,
    Json,
    Relation,
}

/// Default rule applied once at record creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefaultRule {
    Autoincrement,
    Uuid,
    Ulid,
    Nanoid,
    Now,
    #[serde(untagged)]
    Literal(serde_json::Value),
}

/// Relation metadata attached to a relation field. The owning side lists the
/// foreign-key fields on its own model and the referenced fields on the
/// target; the non-owning side leaves both empty and is resolved through
/// `SchemaDefinition::inverse_relation`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationDescriptor {
    pub target: String,
    #[serde(default)]
    pub fields: Vec<String>,
    #[serde(default)]
    pub references: Vec<String>,
    #[serde(default)]
    pub name: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::parse_schema_str;

    fn blog_schema() -> SchemaDefinition {
        parse_schema_str(
            r#"
models:
  User:
    fields:
      id: { type: int, id: true, default: autoincrement }
      email: { type: string, unique: true, required: true }
      posts: { type: relation, target: Post, list: true }
  Post:
    fields:
      id: { type: int, id: true, default: autoincrement }
      title: { type: string, required: true }
      authorId: { type: int }
      author: { type: relation, target: User, fields: [authorId], references: [id] }
"#,
        )
        .unwrap()
    }

    #[test]
    fn test_model_lookup() {
        let schema = blog_schema();
        assert!(schema.model("User").is_some());
        assert!(schema.model("user").is_none());
        assert!(schema.expect_model("Missing").is_err());
    }

    #[test]
    fn test_unique_constraints_include_id_fields() {
        let schema = blog_schema();
        let user = schema.model("User").unwrap();
        let constraints = user.unique_constraints();
        let names: Vec<&str> = constraints.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["id", "email"]);
    }

    #[test]
    fn test_inverse_relation_resolution() {
        let schema = blog_schema();
        let user = schema.model("User").unwrap();
        let posts = user.field("posts").unwrap();

        let (target, inverse) = schema.inverse_relation(user, posts).unwrap();
        assert_eq!(target.name, "Post");
        assert_eq!(inverse.name, "author");
        assert_eq!(inverse.relation.as_ref().unwrap().fields, vec!["authorId"]);
    }

    #[test]
    fn test_owning_side_detection() {
        let schema = blog_schema();
        let post = schema.model("Post").unwrap();
        assert!(post.field("author").unwrap().is_owning_relation());
        let user = schema.model("User").unwrap();
        assert!(!user.field("posts").unwrap().is_owning_relation());
    }
}

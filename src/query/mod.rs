//! Predicate evaluation against stored records, including relation
//! traversals, plus the ordering and unique-selector helpers shared by the
//! delegate and the write resolver. Nothing in this module mutates the store.

use std::cmp::Ordering;

use serde_json::Value;

use crate::error::{MirrorDbError, Result};
use crate::schema::{FieldDescriptor, ModelDescriptor, SchemaDefinition};
use crate::store::{Record, StoreInner};

const SCALAR_OPERATORS: &[&str] = &[
    "equals", "not", "in", "notIn", "lt", "lte", "gt", "gte", "contains", "startsWith", "endsWith",
    "mode",
];

/// Evaluate a filter-predicate tree against one record. An absent (null)
/// predicate matches everything.
pub fn matches(
    schema: &SchemaDefinition,
    model: &ModelDescriptor,
    record: &Record,
    predicate: &Value,
    store: &StoreInner,
) -> Result<bool> {
    let map = match predicate {
        Value::Null => return Ok(true),
        Value::Object(map) => map,
        _ => {
            return Err(MirrorDbError::Validation(format!(
                "Filter for '{}' must be an object",
                model.name
            )))
        }
    };

    for (key, cond) in map {
        let ok = match key.as_str() {
            "AND" => {
                let mut all = true;
                for sub in group(cond) {
                    if !matches(schema, model, record, sub, store)? {
                        all = false;
                        break;
                    }
                }
                all
            }
            "OR" => {
                let mut any = false;
                for sub in group(cond) {
                    if matches(schema, model, record, sub, store)? {
                        any = true;
                        break;
                    }
                }
                any
            }
            "NOT" => {
                let mut none = true;
                for sub in group(cond) {
                    if matches(schema, model, record, sub, store)? {
                        none = false;
                        break;
                    }
                }
                none
            }
            name => {
                let field = model.field(name).ok_or_else(|| {
                    MirrorDbError::Validation(format!(
                        "Unknown field '{}' in filter for '{}'",
                        name, model.name
                    ))
                })?;
                if field.is_relation() {
                    relation_matches(schema, model, record, field, cond, store)?
                } else {
                    scalar_condition(record.get(name), cond)?
                }
            }
        };
        if !ok {
            return Ok(false);
        }
    }

    Ok(true)
}

fn group(cond: &Value) -> Vec<&Value> {
    match cond {
        Value::Array(items) => items.iter().collect(),
        other => vec![other],
    }
}

/// Evaluate a relation filter: `some`/`every`/`none` for to-many relations,
/// `is`/`isNot` for to-one.
pub fn relation_matches(
    schema: &SchemaDefinition,
    model: &ModelDescriptor,
    record: &Record,
    field: &FieldDescriptor,
    cond: &Value,
    store: &StoreInner,
) -> Result<bool> {
    let related = related_indices(schema, model, record, field, store)?;
    let relation = field.relation.as_ref().expect("relation field");
    let target = schema.expect_model(&relation.target)?;
    let records = store.records(&target.name);

    if field.list {
        let map = cond.as_object().ok_or_else(|| {
            MirrorDbError::Validation(format!(
                "Relation filter on '{}.{}' must use some/every/none",
                model.name, field.name
            ))
        })?;
        for (op, sub) in map {
            let ok = match op.as_str() {
                "some" => {
                    let mut any = false;
                    for &i in &related {
                        if matches(schema, target, &records[i], sub, store)? {
                            any = true;
                            break;
                        }
                    }
                    any
                }
                // Vacuously true when no related records exist.
                "every" => {
                    let mut all = true;
                    for &i in &related {
                        if !matches(schema, target, &records[i], sub, store)? {
                            all = false;
                            break;
                        }
                    }
                    all
                }
                "none" => {
                    let mut any = false;
                    for &i in &related {
                        if matches(schema, target, &records[i], sub, store)? {
                            any = true;
                            break;
                        }
                    }
                    !any
                }
                other => {
                    return Err(MirrorDbError::Validation(format!(
                        "Unknown relation operator '{other}' on '{}.{}'",
                        model.name, field.name
                    )))
                }
            };
            if !ok {
                return Ok(false);
            }
        }
        return Ok(true);
    }

    // To-one: filtering against null means "no related record".
    if cond.is_null() {
        return Ok(related.is_empty());
    }
    let map = cond.as_object().ok_or_else(|| {
        MirrorDbError::Validation(format!(
            "Relation filter on '{}.{}' must be an object",
            model.name, field.name
        ))
    })?;

    let has_is = map.contains_key("is") || map.contains_key("isNot");
    if !has_is {
        // Bare nested predicate is shorthand for `is`.
        return match related.first() {
            Some(&i) => matches(schema, target, &records[i], cond, store),
            None => Ok(false),
        };
    }

    for (op, sub) in map {
        let ok = match op.as_str() {
            "is" => match (sub, related.first()) {
                (Value::Null, found) => found.is_none(),
                (_, Some(&i)) => matches(schema, target, &records[i], sub, store)?,
                (_, None) => false,
            },
            "isNot" => match (sub, related.first()) {
                (Value::Null, found) => found.is_some(),
                (_, Some(&i)) => !matches(schema, target, &records[i], sub, store)?,
                (_, None) => true,
            },
            other => {
                return Err(MirrorDbError::Validation(format!(
                    "Unknown relation operator '{other}' on '{}.{}'",
                    model.name, field.name
                )))
            }
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Resolve the records related to `record` through `field`, as indices into
/// the target model's collection. The owning side follows its foreign keys;
/// the non-owning side scans the target for foreign keys pointing back.
pub fn related_indices(
    schema: &SchemaDefinition,
    model: &ModelDescriptor,
    record: &Record,
    field: &FieldDescriptor,
    store: &StoreInner,
) -> Result<Vec<usize>> {
    let relation = field.relation.as_ref().ok_or_else(|| {
        MirrorDbError::Schema(format!("Field '{}.{}' is not a relation", model.name, field.name))
    })?;

    if field.is_owning_relation() {
        let target = schema.expect_model(&relation.target)?;
        let fks: Vec<&Value> = relation
            .fields
            .iter()
            .map(|f| record.get(f).unwrap_or(&Value::Null))
            .collect();
        if fks.iter().any(|v| v.is_null()) {
            return Ok(Vec::new());
        }
        Ok(store
            .records(&target.name)
            .iter()
            .enumerate()
            .filter(|(_, r)| {
                relation
                    .references
                    .iter()
                    .zip(&fks)
                    .all(|(rf, fk)| r.get(rf).is_some_and(|v| values_equal(v, fk)))
            })
            .map(|(i, _)| i)
            .collect())
    } else {
        let (target, inverse) = schema.inverse_relation(model, field)?;
        let inv = inverse.relation.as_ref().expect("owning relation");
        let refs: Vec<&Value> = inv
            .references
            .iter()
            .map(|f| record.get(f).unwrap_or(&Value::Null))
            .collect();
        if refs.iter().any(|v| v.is_null()) {
            return Ok(Vec::new());
        }
        Ok(store
            .records(&target.name)
            .iter()
            .enumerate()
            .filter(|(_, r)| {
                inv.fields
                    .iter()
                    .zip(&refs)
                    .all(|(fk, rv)| r.get(fk).is_some_and(|v| values_equal(v, rv)))
            })
            .map(|(i, _)| i)
            .collect())
    }
}

/// Evaluate a scalar condition: either an operator object or a literal
/// equality. Equality against null matches only null/absent values; every
/// other operator against null never matches.
pub fn scalar_condition(actual: Option<&Value>, cond: &Value) -> Result<bool> {
    let actual = actual.unwrap_or(&Value::Null);

    let ops = match cond {
        Value::Object(map) if map.keys().any(|k| SCALAR_OPERATORS.contains(&k.as_str())) => map,
        other => return Ok(values_equal(actual, other)),
    };

    let insensitive = ops.get("mode").and_then(Value::as_str) == Some("insensitive");

    for (op, operand) in ops {
        let ok = match op.as_str() {
            "mode" => true,
            "equals" => equals_with_mode(actual, operand, insensitive),
            "not" => {
                if actual.is_null() {
                    false
                } else {
                    !scalar_condition(Some(actual), operand)?
                }
            }
            "in" => {
                let list = operand.as_array().ok_or_else(|| {
                    MirrorDbError::Validation("'in' expects an array".into())
                })?;
                !actual.is_null() && list.iter().any(|v| equals_with_mode(actual, v, insensitive))
            }
            "notIn" => {
                let list = operand.as_array().ok_or_else(|| {
                    MirrorDbError::Validation("'notIn' expects an array".into())
                })?;
                !actual.is_null() && !list.iter().any(|v| equals_with_mode(actual, v, insensitive))
            }
            "lt" => compare_values(actual, operand) == Some(Ordering::Less),
            "lte" => matches!(
                compare_values(actual, operand),
                Some(Ordering::Less) | Some(Ordering::Equal)
            ),
            "gt" => compare_values(actual, operand) == Some(Ordering::Greater),
            "gte" => matches!(
                compare_values(actual, operand),
                Some(Ordering::Greater) | Some(Ordering::Equal)
            ),
            "contains" => string_op(actual, operand, insensitive, |a, b| a.contains(b)),
            "startsWith" => string_op(actual, operand, insensitive, |a, b| a.starts_with(b)),
            "endsWith" => string_op(actual, operand, insensitive, |a, b| a.ends_with(b)),
            other => {
                return Err(MirrorDbError::Validation(format!(
                    "Unknown filter operator '{other}'"
                )))
            }
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

fn string_op(actual: &Value, operand: &Value, insensitive: bool, f: impl Fn(&str, &str) -> bool) -> bool {
    match (actual.as_str(), operand.as_str()) {
        (Some(a), Some(b)) => {
            if insensitive {
                f(&a.to_lowercase(), &b.to_lowercase())
            } else {
                f(a, b)
            }
        }
        _ => false,
    }
}

fn equals_with_mode(a: &Value, b: &Value, insensitive: bool) -> bool {
    if insensitive {
        if let (Some(a), Some(b)) = (a.as_str(), b.as_str()) {
            return a.to_lowercase() == b.to_lowercase();
        }
    }
    values_equal(a, b)
}

/// Value equality with numeric coercion (1 equals 1.0).
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

/// Standard ordering for comparable scalar values. Datetimes are RFC 3339
/// strings, so string ordering matches chronological ordering.
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// Comparison used for sorting: nulls sort before every other value, and
/// incomparable pairs keep their insertion order.
fn compare_for_sort(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    let a = a.unwrap_or(&Value::Null);
    let b = b.unwrap_or(&Value::Null);
    match (a.is_null(), b.is_null()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (false, false) => compare_values(a, b).unwrap_or(Ordering::Equal),
    }
}

/// Parsed orderBy entries: field name plus ascending flag.
pub fn order_entries(order_by: &Value) -> Result<Vec<(String, bool)>> {
    let mut entries = Vec::new();
    let items: Vec<&Value> = match order_by {
        Value::Null => return Ok(entries),
        Value::Array(items) => items.iter().collect(),
        other => vec![other],
    };
    for item in items {
        let map = item.as_object().ok_or_else(|| {
            MirrorDbError::Validation("orderBy entries must be objects".into())
        })?;
        for (field, dir) in map {
            entries.push((field.clone(), parse_direction(dir)?));
        }
    }
    Ok(entries)
}

pub fn parse_direction(dir: &Value) -> Result<bool> {
    match dir.as_str() {
        Some("asc") => Ok(true),
        Some("desc") => Ok(false),
        _ => Err(MirrorDbError::Validation(format!(
            "Sort direction must be 'asc' or 'desc', got {dir}"
        ))),
    }
}

/// Stable multi-key sort; ties keep insertion order.
pub fn apply_order_by(records: &mut [Record], order_by: &Value) -> Result<()> {
    let entries = order_entries(order_by)?;
    if entries.is_empty() {
        return Ok(());
    }
    records.sort_by(|a, b| {
        for (field, asc) in &entries {
            let ordering = compare_for_sort(a.get(field), b.get(field));
            if ordering != Ordering::Equal {
                return if *asc { ordering } else { ordering.reverse() };
            }
        }
        Ordering::Equal
    });
    Ok(())
}

/// Reduce a `findUnique`-style selector to an equality map covering exactly
/// one unique constraint. Accepts a single unique/id field, a compound
/// constraint keyed by its name, or all fields of a compound given directly.
pub fn unique_filter(
    model: &ModelDescriptor,
    selector: &Value,
) -> Result<serde_json::Map<String, Value>> {
    let obj = selector.as_object().ok_or_else(|| {
        MirrorDbError::Validation(format!("Unique selector for '{}' must be an object", model.name))
    })?;

    for constraint in model.unique_constraints() {
        if constraint.fields.len() > 1 {
            if let Some(Value::Object(values)) = obj.get(&constraint.name) {
                if constraint.fields.iter().all(|f| values.contains_key(f)) {
                    let mut filter = serde_json::Map::new();
                    for f in &constraint.fields {
                        filter.insert(f.clone(), values[f].clone());
                    }
                    return Ok(filter);
                }
            }
            if constraint.fields.iter().all(|f| {
                obj.get(f).is_some_and(|v| !v.is_null() && !v.is_object())
            }) {
                let mut filter = serde_json::Map::new();
                for f in &constraint.fields {
                    filter.insert(f.clone(), obj[f].clone());
                }
                return Ok(filter);
            }
        } else {
            let field = &constraint.fields[0];
            if let Some(v) = obj.get(field) {
                if !v.is_null() && !v.is_object() {
                    let mut filter = serde_json::Map::new();
                    filter.insert(field.clone(), v.clone());
                    return Ok(filter);
                }
            }
        }
    }

    Err(MirrorDbError::Validation(format!(
        "Selector for '{}' must fully specify a unique constraint",
        model.name
    )))
}

/// Find the single record matched by a unique selector, if any.
pub fn find_by_unique(
    model: &ModelDescriptor,
    selector: &Value,
    store: &StoreInner,
) -> Result<Option<usize>> {
    let filter = unique_filter(model, selector)?;
    Ok(store.records(&model.name).iter().position(|r| {
        filter
            .iter()
            .all(|(f, v)| values_equal(r.get(f).unwrap_or(&Value::Null), v))
    }))
}

/// Indices of all records matching an optional predicate, in insertion order.
pub fn find_indices(
    schema: &SchemaDefinition,
    model: &ModelDescriptor,
    predicate: &Value,
    store: &StoreInner,
) -> Result<Vec<usize>> {
    let mut indices = Vec::new();
    for (i, record) in store.records(&model.name).iter().enumerate() {
        if matches(schema, model, record, predicate, store)? {
            indices.push(i);
        }
    }
    Ok(indices)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::parse_schema_str;
    use serde_json::json;

    fn schema() -> SchemaDefinition {
        parse_schema_str(
            r#"
models:
  User:
    fields:
      id: { type: int, id: true, default: autoincrement }
      email: { type: string, unique: true }
      role: { type: string, default: USER }
      warnings: { type: int, default: 0 }
      posts: { type: relation, target: Post, list: true }
  Post:
    fields:
      id: { type: int, id: true, default: autoincrement }
      title: { type: string }
      authorId: { type: int }
      author: { type: relation, target: User, fields: [authorId], references: [id] }
"#,
        )
        .unwrap()
    }

    fn store_with(users: Vec<Value>, posts: Vec<Value>) -> StoreInner {
        let mut store = StoreInner::default();
        for user in users {
            store
                .records_mut("User")
                .push(user.as_object().unwrap().clone());
        }
        for post in posts {
            store
                .records_mut("Post")
                .push(post.as_object().unwrap().clone());
        }
        store
    }

    fn fixture() -> (SchemaDefinition, StoreInner) {
        let schema = schema();
        let store = store_with(
            vec![
                json!({"id": 1, "email": "alice@test.com", "role": "ADMIN", "warnings": 0}),
                json!({"id": 2, "email": "bob@test.com", "role": "USER", "warnings": 5}),
                json!({"id": 3, "email": "carol@test.com", "role": "USER", "warnings": null}),
            ],
            vec![
                json!({"id": 1, "title": "Hello", "authorId": 1}),
                json!({"id": 2, "title": "World", "authorId": 2}),
            ],
        );
        (schema, store)
    }

    fn user_matches(predicate: Value) -> Vec<i64> {
        let (schema, store) = fixture();
        let model = schema.model("User").unwrap();
        find_indices(&schema, model, &predicate, &store)
            .unwrap()
            .into_iter()
            .map(|i| store.records("User")[i]["id"].as_i64().unwrap())
            .collect()
    }

    #[test]
    fn test_equality_and_operators() {
        assert_eq!(user_matches(json!({"role": "USER"})), vec![2, 3]);
        assert_eq!(user_matches(json!({"warnings": {"gt": 0}})), vec![2]);
        assert_eq!(user_matches(json!({"warnings": {"lte": 0}})), vec![1]);
        assert_eq!(user_matches(json!({"email": {"contains": "bob"}})), vec![2]);
        assert_eq!(
            user_matches(json!({"email": {"startsWith": "ALICE", "mode": "insensitive"}})),
            vec![1]
        );
    }

    #[test]
    fn test_null_semantics() {
        // Equality against null matches only null/absent values.
        assert_eq!(user_matches(json!({"warnings": null})), vec![3]);
        // Any other operator against null never matches.
        assert_eq!(user_matches(json!({"warnings": {"gte": 0}})), vec![1, 2]);
        assert_eq!(user_matches(json!({"warnings": {"not": 0}})), vec![2]);
        assert_eq!(user_matches(json!({"warnings": {"in": [null, 5]}})), vec![2]);
    }

    #[test]
    fn test_in_empty_set() {
        assert!(user_matches(json!({"id": {"in": []}})).is_empty());
        assert_eq!(user_matches(json!({"id": {"notIn": []}})), vec![1, 2, 3]);
    }

    #[test]
    fn test_logical_combinators() {
        assert_eq!(
            user_matches(json!({"AND": [{"role": "USER"}, {"warnings": 5}]})),
            vec![2]
        );
        assert_eq!(
            user_matches(json!({"OR": [{"id": 1}, {"id": 3}]})),
            vec![1, 3]
        );
        assert_eq!(user_matches(json!({"NOT": {"role": "USER"}})), vec![1]);
        // Empty OR matches nothing.
        assert!(user_matches(json!({"OR": []})).is_empty());
    }

    #[test]
    fn test_relation_some_every_none() {
        assert_eq!(
            user_matches(json!({"posts": {"some": {"title": "Hello"}}})),
            vec![1]
        );
        // Vacuously true with zero related records.
        assert_eq!(
            user_matches(json!({"posts": {"every": {"title": "Hello"}}})),
            vec![1, 3]
        );
        assert_eq!(
            user_matches(json!({"posts": {"none": {}}})),
            vec![3]
        );
    }

    #[test]
    fn test_to_one_relation_filter() {
        let (schema, store) = fixture();
        let model = schema.model("Post").unwrap();
        let hits = find_indices(
            &schema,
            model,
            &json!({"author": {"is": {"role": "ADMIN"}}}),
            &store,
        )
        .unwrap();
        assert_eq!(hits, vec![0]);

        let miss = find_indices(
            &schema,
            model,
            &json!({"author": {"isNot": {"role": "ADMIN"}}}),
            &store,
        )
        .unwrap();
        assert_eq!(miss, vec![1]);
    }

    #[test]
    fn test_order_by_multi_key_stable() {
        let (_, store) = fixture();
        let mut records: Vec<Record> = store.records("User").to_vec();
        apply_order_by(
            &mut records,
            &json!([{"role": "asc"}, {"warnings": "desc"}]),
        )
        .unwrap();
        let ids: Vec<i64> = records.iter().map(|r| r["id"].as_i64().unwrap()).collect();
        // ADMIN first, then USER by warnings desc with null last... nulls sort
        // first ascending, last descending.
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn test_unique_filter_validation() {
        let schema = schema();
        let model = schema.model("User").unwrap();

        assert!(unique_filter(model, &json!({"email": "alice@test.com"})).is_ok());
        assert!(unique_filter(model, &json!({"id": 1})).is_ok());
        // role is not unique.
        let err = unique_filter(model, &json!({"role": "USER"})).unwrap_err();
        assert_eq!(err.code(), "P2009");
    }

    #[test]
    fn test_find_by_unique() {
        let (_, store) = fixture();
        let schema = schema();
        let model = schema.model("User").unwrap();

        let found = find_by_unique(model, &json!({"email": "bob@test.com"}), &store).unwrap();
        assert_eq!(found, Some(1));
        let missing = find_by_unique(model, &json!({"email": "nobody@test.com"}), &store).unwrap();
        assert_eq!(missing, None);
    }
}

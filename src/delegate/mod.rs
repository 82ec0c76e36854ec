//! Per-model operation surface. A `Delegate` executes option-object calls
//! against one model: lookups, list queries with the full
//! filter/order/paginate/distinct pipeline, writes, counting, aggregation and
//! grouping. Every call takes the store lock exactly once; write operations
//! snapshot the store first and restore it on any error, so a failing nested
//! write never leaves a partial mutation behind.

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::error::{MirrorDbError, Result};
use crate::query;
use crate::schema::{FieldDescriptor, ModelDescriptor, SchemaDefinition};
use crate::store::{Record, Store, StoreInner};
use crate::write::WriteResolver;

/// Every operation a delegate understands, by its client-facing name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    FindUnique,
    FindUniqueOrThrow,
    FindFirst,
    FindFirstOrThrow,
    FindMany,
    Create,
    CreateMany,
    CreateManyAndReturn,
    Update,
    UpdateMany,
    Upsert,
    Delete,
    DeleteMany,
    Count,
    Aggregate,
    GroupBy,
}

impl Operation {
    pub fn parse(name: &str) -> Option<Operation> {
        let operation = match name {
            "findUnique" => Operation::FindUnique,
            "findUniqueOrThrow" => Operation::FindUniqueOrThrow,
            "findFirst" => Operation::FindFirst,
            "findFirstOrThrow" => Operation::FindFirstOrThrow,
            "findMany" => Operation::FindMany,
            "create" => Operation::Create,
            "createMany" => Operation::CreateMany,
            "createManyAndReturn" => Operation::CreateManyAndReturn,
            "update" => Operation::Update,
            "updateMany" => Operation::UpdateMany,
            "upsert" => Operation::Upsert,
            "delete" => Operation::Delete,
            "deleteMany" => Operation::DeleteMany,
            "count" => Operation::Count,
            "aggregate" => Operation::Aggregate,
            "groupBy" => Operation::GroupBy,
            _ => return None,
        };
        Some(operation)
    }

    pub fn name(self) -> &'static str {
        match self {
            Operation::FindUnique => "findUnique",
            Operation::FindUniqueOrThrow => "findUniqueOrThrow",
            Operation::FindFirst => "findFirst",
            Operation::FindFirstOrThrow => "findFirstOrThrow",
            Operation::FindMany => "findMany",
            Operation::Create => "create",
            Operation::CreateMany => "createMany",
            Operation::CreateManyAndReturn => "createManyAndReturn",
            Operation::Update => "update",
            Operation::UpdateMany => "updateMany",
            Operation::Upsert => "upsert",
            Operation::Delete => "delete",
            Operation::DeleteMany => "deleteMany",
            Operation::Count => "count",
            Operation::Aggregate => "aggregate",
            Operation::GroupBy => "groupBy",
        }
    }

    pub fn is_write(self) -> bool {
        matches!(
            self,
            Operation::Create
                | Operation::CreateMany
                | Operation::CreateManyAndReturn
                | Operation::Update
                | Operation::UpdateMany
                | Operation::Upsert
                | Operation::Delete
                | Operation::DeleteMany
        )
    }

    /// Operations whose result is a single record object (or null).
    pub fn returns_record(self) -> bool {
        matches!(
            self,
            Operation::FindUnique
                | Operation::FindUniqueOrThrow
                | Operation::FindFirst
                | Operation::FindFirstOrThrow
                | Operation::Create
                | Operation::Update
                | Operation::Upsert
                | Operation::Delete
        )
    }

    /// Operations whose result is an array of record objects.
    pub fn returns_record_list(self) -> bool {
        matches!(self, Operation::FindMany | Operation::CreateManyAndReturn)
    }
}

/// Handle bound to one model of one store.
#[derive(Clone)]
pub struct Delegate {
    store: Store,
    model: String,
}

impl Delegate {
    pub(crate) fn new(store: Store, model: String) -> Self {
        Delegate { store, model }
    }

    pub fn model_name(&self) -> &str {
        &self.model
    }

    /// Run one operation. This is the single entry point every convenience
    /// method funnels through, which keeps the lock discipline and the
    /// all-or-nothing write guarantee in one place.
    pub fn execute(&self, operation: Operation, args: &Value) -> Result<Value> {
        let schema = self.store.schema();
        let model = schema.expect_model(&self.model)?;
        let mut inner = self.store.lock();

        if operation.is_write() {
            let snapshot = inner.clone();
            let result = dispatch(schema, model, &mut inner, operation, args);
            if result.is_err() {
                *inner = snapshot;
            }
            result
        } else {
            dispatch(schema, model, &mut inner, operation, args)
        }
    }

    pub fn find_unique(&self, args: &Value) -> Result<Value> {
        self.execute(Operation::FindUnique, args)
    }

    pub fn find_unique_or_throw(&self, args: &Value) -> Result<Value> {
        self.execute(Operation::FindUniqueOrThrow, args)
    }

    pub fn find_first(&self, args: &Value) -> Result<Value> {
        self.execute(Operation::FindFirst, args)
    }

    pub fn find_first_or_throw(&self, args: &Value) -> Result<Value> {
        self.execute(Operation::FindFirstOrThrow, args)
    }

    pub fn find_many(&self, args: &Value) -> Result<Value> {
        self.execute(Operation::FindMany, args)
    }

    pub fn create(&self, args: &Value) -> Result<Value> {
        self.execute(Operation::Create, args)
    }

    pub fn create_many(&self, args: &Value) -> Result<Value> {
        self.execute(Operation::CreateMany, args)
    }

    pub fn create_many_and_return(&self, args: &Value) -> Result<Value> {
        self.execute(Operation::CreateManyAndReturn, args)
    }

    pub fn update(&self, args: &Value) -> Result<Value> {
        self.execute(Operation::Update, args)
    }

    pub fn update_many(&self, args: &Value) -> Result<Value> {
        self.execute(Operation::UpdateMany, args)
    }

    pub fn upsert(&self, args: &Value) -> Result<Value> {
        self.execute(Operation::Upsert, args)
    }

    pub fn delete(&self, args: &Value) -> Result<Value> {
        self.execute(Operation::Delete, args)
    }

    pub fn delete_many(&self, args: &Value) -> Result<Value> {
        self.execute(Operation::DeleteMany, args)
    }

    pub fn count(&self, args: &Value) -> Result<Value> {
        self.execute(Operation::Count, args)
    }

    pub fn aggregate(&self, args: &Value) -> Result<Value> {
        self.execute(Operation::Aggregate, args)
    }

    pub fn group_by(&self, args: &Value) -> Result<Value> {
        self.execute(Operation::GroupBy, args)
    }

    /// Typed variant of `find_many`: deserializes each result row.
    pub fn find_many_as<T: DeserializeOwned>(&self, args: &Value) -> Result<Vec<T>> {
        Ok(serde_json::from_value(self.find_many(args)?)?)
    }

    /// Typed variant of `find_unique`.
    pub fn find_unique_as<T: DeserializeOwned>(&self, args: &Value) -> Result<Option<T>> {
        match self.find_unique(args)? {
            Value::Null => Ok(None),
            found => Ok(Some(serde_json::from_value(found)?)),
        }
    }

    /// Typed variant of `create`.
    pub fn create_as<T: DeserializeOwned>(&self, args: &Value) -> Result<T> {
        Ok(serde_json::from_value(self.create(args)?)?)
    }
}

fn dispatch(
    schema: &SchemaDefinition,
    model: &ModelDescriptor,
    inner: &mut StoreInner,
    operation: Operation,
    args: &Value,
) -> Result<Value> {
    match operation {
        Operation::FindUnique | Operation::FindUniqueOrThrow => {
            let selector = required_arg(model, args, "where")?;
            match query::find_by_unique(model, selector, inner)? {
                Some(index) => {
                    let record = inner.records(&model.name)[index].clone();
                    project(schema, model, inner, &record, args)
                }
                None if operation == Operation::FindUniqueOrThrow => Err(MirrorDbError::NotFound {
                    model: model.name.clone(),
                    operation: "a query".into(),
                }),
                None => Ok(Value::Null),
            }
        }
        Operation::FindFirst | Operation::FindFirstOrThrow => {
            let records = find_list(schema, model, inner, args)?;
            match records.into_iter().next() {
                Some(record) => project(schema, model, inner, &record, args),
                None if operation == Operation::FindFirstOrThrow => Err(MirrorDbError::NotFound {
                    model: model.name.clone(),
                    operation: "a query".into(),
                }),
                None => Ok(Value::Null),
            }
        }
        Operation::FindMany => {
            let records = find_list(schema, model, inner, args)?;
            let projected: Vec<Value> = records
                .iter()
                .map(|r| project(schema, model, inner, r, args))
                .collect::<Result<_>>()?;
            Ok(Value::Array(projected))
        }
        Operation::Create => {
            let data = required_arg(model, args, "data")?;
            let record = WriteResolver::new(schema, inner).create(model, data)?;
            project(schema, model, inner, &record, args)
        }
        Operation::CreateMany => {
            let count = create_each(schema, model, inner, args)?.len();
            Ok(count_result(count))
        }
        Operation::CreateManyAndReturn => {
            let records = create_each(schema, model, inner, args)?;
            let projected: Vec<Value> = records
                .iter()
                .map(|r| project(schema, model, inner, r, args))
                .collect::<Result<_>>()?;
            Ok(Value::Array(projected))
        }
        Operation::Update => {
            let selector = required_arg(model, args, "where")?;
            let data = required_arg(model, args, "data")?;
            let index = query::find_by_unique(model, selector, inner)?.ok_or_else(|| {
                MirrorDbError::NotFound {
                    model: model.name.clone(),
                    operation: "an update".into(),
                }
            })?;
            let record = WriteResolver::new(schema, inner).update(model, index, data)?;
            project(schema, model, inner, &record, args)
        }
        Operation::UpdateMany => {
            let data = required_arg(model, args, "data")?;
            let filter = args.get("where").cloned().unwrap_or(Value::Null);
            let indices = query::find_indices(schema, model, &filter, inner)?;
            let count = indices.len();
            let mut resolver = WriteResolver::new(schema, inner);
            for index in indices {
                resolver.update(model, index, data)?;
            }
            Ok(count_result(count))
        }
        Operation::Upsert => {
            let selector = required_arg(model, args, "where")?;
            let record = match query::find_by_unique(model, selector, inner)? {
                Some(index) => {
                    let data = required_arg(model, args, "update")?;
                    WriteResolver::new(schema, inner).update(model, index, data)?
                }
                None => {
                    let data = required_arg(model, args, "create")?;
                    WriteResolver::new(schema, inner).create(model, data)?
                }
            };
            project(schema, model, inner, &record, args)
        }
        Operation::Delete => {
            let selector = required_arg(model, args, "where")?;
            let index = query::find_by_unique(model, selector, inner)?.ok_or_else(|| {
                MirrorDbError::NotFound {
                    model: model.name.clone(),
                    operation: "a delete".into(),
                }
            })?;
            let record = WriteResolver::new(schema, inner).delete(model, index);
            project(schema, model, inner, &record, args)
        }
        Operation::DeleteMany => {
            let filter = args.get("where").cloned().unwrap_or(Value::Null);
            let mut indices = query::find_indices(schema, model, &filter, inner)?;
            let count = indices.len();
            indices.sort_unstable_by(|a, b| b.cmp(a));
            let mut resolver = WriteResolver::new(schema, inner);
            for index in indices {
                resolver.delete(model, index);
            }
            Ok(count_result(count))
        }
        Operation::Count => {
            let records = find_list(schema, model, inner, args)?;
            match args.get("select").and_then(Value::as_object) {
                Some(select) => {
                    let mut out = Map::new();
                    for (key, enabled) in select {
                        if !truthy(enabled) {
                            continue;
                        }
                        let count = if key == "_all" {
                            records.len()
                        } else {
                            model.field(key).ok_or_else(|| {
                                MirrorDbError::Validation(format!(
                                    "Unknown field '{}' in count select for '{}'",
                                    key, model.name
                                ))
                            })?;
                            records
                                .iter()
                                .filter(|r| r.get(key).is_some_and(|v| !v.is_null()))
                                .count()
                        };
                        out.insert(key.clone(), Value::from(count));
                    }
                    Ok(Value::Object(out))
                }
                None => Ok(Value::from(records.len())),
            }
        }
        Operation::Aggregate => {
            let records = find_list(schema, model, inner, args)?;
            let spec = args.as_object().cloned().unwrap_or_default();
            let mut out = Map::new();
            for (key, selection) in &spec {
                if matches!(key.as_str(), "where" | "orderBy" | "skip" | "take" | "cursor") {
                    continue;
                }
                out.insert(key.clone(), aggregate_entry(model, &records, key, selection)?);
            }
            Ok(Value::Object(out))
        }
        Operation::GroupBy => group_by(schema, model, inner, args),
    }
}

fn required_arg<'v>(model: &ModelDescriptor, args: &'v Value, key: &str) -> Result<&'v Value> {
    args.get(key).ok_or_else(|| {
        MirrorDbError::Validation(format!("Argument '{key}' is required on '{}'", model.name))
    })
}

fn count_result(count: usize) -> Value {
    let mut out = Map::new();
    out.insert("count".into(), Value::from(count));
    Value::Object(out)
}

fn truthy(value: &Value) -> bool {
    !matches!(value, Value::Bool(false) | Value::Null)
}

/// Shared create loop for createMany and createManyAndReturn. With
/// skipDuplicates, a unique violation rolls back just that item and moves on.
fn create_each(
    schema: &SchemaDefinition,
    model: &ModelDescriptor,
    inner: &mut StoreInner,
    args: &Value,
) -> Result<Vec<Record>> {
    let data = match required_arg(model, args, "data")? {
        Value::Array(items) => items.clone(),
        single => vec![single.clone()],
    };
    let skip_duplicates = args
        .get("skipDuplicates")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    let mut created = Vec::new();
    for item in &data {
        let snapshot = inner.clone();
        match WriteResolver::new(schema, inner).create(model, item) {
            Ok(record) => created.push(record),
            Err(MirrorDbError::UniqueConstraint { .. }) if skip_duplicates => {
                *inner = snapshot;
            }
            Err(e) => return Err(e),
        }
    }
    Ok(created)
}

/// The list pipeline: filter, order, paginate, then distinct.
fn find_list(
    schema: &SchemaDefinition,
    model: &ModelDescriptor,
    inner: &StoreInner,
    args: &Value,
) -> Result<Vec<Record>> {
    let records: Vec<Record> = inner.records(&model.name).to_vec();
    apply_pipeline(schema, model, inner, records, args)
}

fn apply_pipeline(
    schema: &SchemaDefinition,
    model: &ModelDescriptor,
    inner: &StoreInner,
    records: Vec<Record>,
    args: &Value,
) -> Result<Vec<Record>> {
    let filter = args.get("where").cloned().unwrap_or(Value::Null);
    let mut out = Vec::new();
    for record in records {
        if query::matches(schema, model, &record, &filter, inner)? {
            out.push(record);
        }
    }

    if let Some(order_by) = args.get("orderBy") {
        query::apply_order_by(&mut out, order_by)?;
    }

    if let Some(skip) = args.get("skip").and_then(Value::as_u64) {
        let skip = (skip as usize).min(out.len());
        out.drain(..skip);
    }
    if let Some(take) = args.get("take").and_then(Value::as_i64) {
        if take >= 0 {
            out.truncate(take as usize);
        } else {
            // Negative take reads from the end of the result.
            let keep = (-take) as usize;
            if out.len() > keep {
                out.drain(..out.len() - keep);
            }
        }
    }

    if let Some(distinct) = args.get("distinct") {
        let fields: Vec<String> = match distinct {
            Value::String(field) => vec![field.clone()],
            Value::Array(items) => items
                .iter()
                .map(|v| {
                    v.as_str().map(str::to_string).ok_or_else(|| {
                        MirrorDbError::Validation("'distinct' expects field names".into())
                    })
                })
                .collect::<Result<_>>()?,
            _ => {
                return Err(MirrorDbError::Validation(
                    "'distinct' expects a field name or an array of field names".into(),
                ))
            }
        };
        let mut seen: Vec<Vec<Value>> = Vec::new();
        out.retain(|record| {
            let key: Vec<Value> = fields
                .iter()
                .map(|f| record.get(f).cloned().unwrap_or(Value::Null))
                .collect();
            if seen.contains(&key) {
                false
            } else {
                seen.push(key);
                true
            }
        });
    }

    Ok(out)
}

/// Shape one record for the caller: `select` picks named fields (and resolves
/// named relations), otherwise all scalar fields are returned and `include`
/// adds relations on top.
fn project(
    schema: &SchemaDefinition,
    model: &ModelDescriptor,
    inner: &StoreInner,
    record: &Record,
    args: &Value,
) -> Result<Value> {
    if let Some(select) = args.get("select").and_then(Value::as_object) {
        let mut out = Map::new();
        for (key, selection) in select {
            if !truthy(selection) {
                continue;
            }
            match model.field(key) {
                Some(field) if field.is_relation() => {
                    out.insert(
                        key.clone(),
                        resolve_relation(schema, model, inner, record, field, selection)?,
                    );
                }
                Some(_) => {
                    out.insert(key.clone(), record.get(key).cloned().unwrap_or(Value::Null));
                }
                None => {
                    return Err(MirrorDbError::Validation(format!(
                        "Unknown field '{}' in select for '{}'",
                        key, model.name
                    )))
                }
            }
        }
        return Ok(Value::Object(out));
    }

    let mut out = record.clone();
    if let Some(include) = args.get("include").and_then(Value::as_object) {
        for (key, selection) in include {
            if !truthy(selection) {
                continue;
            }
            let field = model
                .field(key)
                .filter(|f| f.is_relation())
                .ok_or_else(|| {
                    MirrorDbError::Validation(format!(
                        "Unknown relation '{}' in include for '{}'",
                        key, model.name
                    ))
                })?;
            out.insert(
                key.clone(),
                resolve_relation(schema, model, inner, record, field, selection)?,
            );
        }
    }
    Ok(Value::Object(out))
}

/// Materialize one relation for projection. To-many relations accept their
/// own nested args (where/orderBy/skip/take/distinct/select/include).
fn resolve_relation(
    schema: &SchemaDefinition,
    model: &ModelDescriptor,
    inner: &StoreInner,
    record: &Record,
    field: &FieldDescriptor,
    selection: &Value,
) -> Result<Value> {
    let relation = field.relation.as_ref().expect("relation field");
    let target = schema.expect_model(&relation.target)?;
    let indices = query::related_indices(schema, model, record, field, inner)?;
    let related: Vec<Record> = indices
        .iter()
        .map(|&i| inner.records(&target.name)[i].clone())
        .collect();

    let nested = if selection.is_object() {
        selection.clone()
    } else {
        Value::Object(Map::new())
    };

    if field.list {
        let related = apply_pipeline(schema, target, inner, related, &nested)?;
        let projected: Vec<Value> = related
            .iter()
            .map(|r| project(schema, target, inner, r, &nested))
            .collect::<Result<_>>()?;
        Ok(Value::Array(projected))
    } else {
        match related.first() {
            Some(record) => project(schema, target, inner, record, &nested),
            None => Ok(Value::Null),
        }
    }
}

/// One aggregate selection (`_count`, `_avg`, `_sum`, `_min`, `_max`)
/// computed over a record set.
fn aggregate_entry(
    model: &ModelDescriptor,
    records: &[Record],
    key: &str,
    selection: &Value,
) -> Result<Value> {
    if key == "_count" {
        // `_count: true` is shorthand for the bare row count.
        if selection.as_bool() == Some(true) {
            return Ok(Value::from(records.len()));
        }
        let select = selection.as_object().ok_or_else(|| {
            MirrorDbError::Validation("'_count' expects true or a field selection".into())
        })?;
        let mut out = Map::new();
        for (field, enabled) in select {
            if !truthy(enabled) {
                continue;
            }
            let count = if field == "_all" {
                records.len()
            } else {
                records
                    .iter()
                    .filter(|r| r.get(field).is_some_and(|v| !v.is_null()))
                    .count()
            };
            out.insert(field.clone(), Value::from(count));
        }
        return Ok(Value::Object(out));
    }

    let select = selection.as_object().ok_or_else(|| {
        MirrorDbError::Validation(format!("'{key}' expects a field selection object"))
    })?;
    let mut out = Map::new();
    for (field, enabled) in select {
        if !truthy(enabled) {
            continue;
        }
        model.field(field).ok_or_else(|| {
            MirrorDbError::Validation(format!(
                "Unknown field '{}' in '{}' for '{}'",
                field, key, model.name
            ))
        })?;
        out.insert(field.clone(), aggregate_field(records, key, field)?);
    }
    Ok(Value::Object(out))
}

fn aggregate_field(records: &[Record], key: &str, field: &str) -> Result<Value> {
    let values: Vec<&Value> = records
        .iter()
        .filter_map(|r| r.get(field))
        .filter(|v| !v.is_null())
        .collect();

    let result = match key {
        "_sum" => {
            // An empty set sums to 0, not null.
            let sum: f64 = values.iter().filter_map(|v| v.as_f64()).sum();
            number(sum)
        }
        "_avg" => {
            let numbers: Vec<f64> = values.iter().filter_map(|v| v.as_f64()).collect();
            if numbers.is_empty() {
                Value::Null
            } else {
                number(numbers.iter().sum::<f64>() / numbers.len() as f64)
            }
        }
        "_min" | "_max" => {
            let mut best: Option<&Value> = None;
            for value in &values {
                best = match best {
                    None => Some(value),
                    Some(current) => match query::compare_values(value, current) {
                        Some(std::cmp::Ordering::Less) if key == "_min" => Some(value),
                        Some(std::cmp::Ordering::Greater) if key == "_max" => Some(value),
                        _ => Some(current),
                    },
                };
            }
            best.cloned().unwrap_or(Value::Null)
        }
        other => {
            return Err(MirrorDbError::Validation(format!(
                "Unknown aggregate selection '{other}'"
            )))
        }
    };
    Ok(result)
}

/// Render an integral float back as an integer so sums and averages over
/// integer columns stay integers.
fn number(value: f64) -> Value {
    if value.fract() == 0.0 && value.abs() < i64::MAX as f64 {
        Value::from(value as i64)
    } else {
        Value::from(value)
    }
}

fn group_by(
    schema: &SchemaDefinition,
    model: &ModelDescriptor,
    inner: &StoreInner,
    args: &Value,
) -> Result<Value> {
    let by: Vec<String> = match required_arg(model, args, "by")? {
        Value::String(field) => vec![field.clone()],
        Value::Array(items) => items
            .iter()
            .map(|v| {
                v.as_str().map(str::to_string).ok_or_else(|| {
                    MirrorDbError::Validation("'by' expects field names".into())
                })
            })
            .collect::<Result<_>>()?,
        _ => {
            return Err(MirrorDbError::Validation(
                "'by' expects a field name or an array of field names".into(),
            ))
        }
    };
    for field in &by {
        model.field(field).ok_or_else(|| {
            MirrorDbError::Validation(format!(
                "Unknown field '{}' in groupBy for '{}'",
                field, model.name
            ))
        })?;
    }

    let filter = args.get("where").cloned().unwrap_or(Value::Null);
    let mut partitions: Vec<(Vec<Value>, Vec<Record>)> = Vec::new();
    for record in inner.records(&model.name) {
        if !query::matches(schema, model, record, &filter, inner)? {
            continue;
        }
        let key: Vec<Value> = by
            .iter()
            .map(|f| record.get(f).cloned().unwrap_or(Value::Null))
            .collect();
        match partitions.iter_mut().find(|(k, _)| k == &key) {
            Some((_, members)) => members.push(record.clone()),
            // Groups appear in first-appearance order of their key.
            None => partitions.push((key, vec![record.clone()])),
        }
    }

    let spec = args.as_object().cloned().unwrap_or_default();
    let mut groups: Vec<(Map<String, Value>, Vec<Record>)> = Vec::new();
    for (key, members) in partitions {
        let mut group = Map::new();
        for (field, value) in by.iter().zip(key) {
            group.insert(field.clone(), value);
        }
        for (selection_key, selection) in &spec {
            if !selection_key.starts_with('_') {
                continue;
            }
            group.insert(
                selection_key.clone(),
                aggregate_entry(model, &members, selection_key, selection)?,
            );
        }
        groups.push((group, members));
    }

    if let Some(order_by) = args.get("orderBy") {
        order_groups(&mut groups, &by, order_by)?;
    }

    Ok(Value::Array(
        groups.into_iter().map(|(g, _)| Value::Object(g)).collect(),
    ))
}

/// Order groups by their key fields or by an aggregate over their members,
/// e.g. `{"_count": {"id": "desc"}}`. The sort is stable, so ties keep
/// first-appearance order.
fn order_groups(
    groups: &mut [(Map<String, Value>, Vec<Record>)],
    by: &[String],
    order_by: &Value,
) -> Result<()> {
    let entries = match order_by {
        Value::Array(items) => items.iter().collect(),
        single => vec![single],
    };

    // Precompute one sort key vector per entry so comparisons stay cheap.
    let mut keys: Vec<(Vec<Value>, bool)> = Vec::new();
    for entry in entries {
        let obj = entry.as_object().ok_or_else(|| {
            MirrorDbError::Validation("'orderBy' expects objects".into())
        })?;
        for (key, direction) in obj {
            if key.starts_with('_') {
                let inner_spec = direction.as_object().ok_or_else(|| {
                    MirrorDbError::Validation(format!("'{key}' ordering expects a field object"))
                })?;
                for (field, dir) in inner_spec {
                    let ascending = query::parse_direction(dir)?;
                    let values = groups
                        .iter()
                        .map(|(_, members)| group_order_value(members, key, field))
                        .collect::<Result<Vec<_>>>()?;
                    keys.push((values, ascending));
                }
            } else {
                if !by.iter().any(|f| f == key) {
                    return Err(MirrorDbError::Validation(format!(
                        "groupBy can only order by grouped fields or aggregates, got '{key}'"
                    )));
                }
                let ascending = query::parse_direction(direction)?;
                let values = groups
                    .iter()
                    .map(|(group, _)| Ok(group.get(key).cloned().unwrap_or(Value::Null)))
                    .collect::<Result<Vec<_>>>()?;
                keys.push((values, ascending));
            }
        }
    }

    let mut order: Vec<usize> = (0..groups.len()).collect();
    order.sort_by(|&a, &b| {
        for (values, ascending) in &keys {
            let ordering = query::compare_values(&values[a], &values[b])
                .unwrap_or(std::cmp::Ordering::Equal);
            let ordering = if *ascending { ordering } else { ordering.reverse() };
            if ordering != std::cmp::Ordering::Equal {
                return ordering;
            }
        }
        std::cmp::Ordering::Equal
    });

    let mut reordered: Vec<(Map<String, Value>, Vec<Record>)> =
        order.into_iter().map(|i| groups[i].clone()).collect();
    groups.swap_with_slice(&mut reordered);
    Ok(())
}

fn group_order_value(members: &[Record], aggregate: &str, field: &str) -> Result<Value> {
    match aggregate {
        "_count" => {
            if field == "_all" {
                Ok(Value::from(members.len()))
            } else {
                Ok(Value::from(
                    members
                        .iter()
                        .filter(|r| r.get(field).is_some_and(|v| !v.is_null()))
                        .count(),
                ))
            }
        }
        "_sum" | "_avg" | "_min" | "_max" => aggregate_field(members, aggregate, field),
        other => Err(MirrorDbError::Validation(format!(
            "Unknown aggregate '{other}' in orderBy"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::parse_schema_str;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::Arc;

    fn store() -> Store {
        let schema = parse_schema_str(
            r#"
models:
  User:
    fields:
      id: { type: int, id: true, default: autoincrement }
      email: { type: string, unique: true, required: true }
      role: { type: string, default: USER }
      age: { type: int }
      posts: { type: relation, target: Post, list: true }
  Post:
    fields:
      id: { type: int, id: true, default: autoincrement }
      title: { type: string, required: true }
      views: { type: int, default: 0 }
      authorId: { type: int }
      author: { type: relation, target: User, fields: [authorId], references: [id] }
"#,
        )
        .unwrap();
        Store::new(Arc::new(schema))
    }

    fn delegate(store: &Store, model: &str) -> Delegate {
        Delegate::new(store.clone(), model.to_string())
    }

    fn seed_users(users: &Delegate) {
        for (email, role, age) in [
            ("a@test.com", "USER", 20),
            ("b@test.com", "ADMIN", 30),
            ("c@test.com", "USER", 40),
            ("d@test.com", "USER", 50),
        ] {
            users
                .create(&json!({"data": {"email": email, "role": role, "age": age}}))
                .unwrap();
        }
    }

    #[test]
    fn test_create_then_find_unique_roundtrip() {
        let store = store();
        let users = delegate(&store, "User");

        let created = users
            .create(&json!({"data": {"email": "a@test.com", "age": 20}}))
            .unwrap();
        let found = users
            .find_unique(&json!({"where": {"email": "a@test.com"}}))
            .unwrap();

        assert_eq!(created, found);
        assert_eq!(found["id"], json!(1));
        assert_eq!(found["role"], json!("USER"));
    }

    #[test]
    fn test_find_unique_miss_is_null_and_or_throw_fails() {
        let store = store();
        let users = delegate(&store, "User");

        let found = users.find_unique(&json!({"where": {"id": 99}})).unwrap();
        assert_eq!(found, Value::Null);

        let err = users
            .find_unique_or_throw(&json!({"where": {"id": 99}}))
            .unwrap_err();
        assert_eq!(err.code(), "P2025");
    }

    #[test]
    fn test_find_many_matches_count() {
        let store = store();
        let users = delegate(&store, "User");
        seed_users(&users);

        let args = json!({"where": {"role": "USER"}});
        let found = users.find_many(&args).unwrap();
        let count = users.count(&args).unwrap();

        assert_eq!(found.as_array().unwrap().len(), 3);
        assert_eq!(count, json!(3));
    }

    #[test]
    fn test_find_many_pipeline_order_skip_take() {
        let store = store();
        let users = delegate(&store, "User");
        seed_users(&users);

        let found = users
            .find_many(&json!({
                "orderBy": {"age": "desc"},
                "skip": 1,
                "take": 2
            }))
            .unwrap();

        let ages: Vec<i64> = found
            .as_array()
            .unwrap()
            .iter()
            .map(|u| u["age"].as_i64().unwrap())
            .collect();
        assert_eq!(ages, vec![40, 30]);
    }

    #[test]
    fn test_negative_take_reads_from_the_end() {
        let store = store();
        let users = delegate(&store, "User");
        seed_users(&users);

        let found = users.find_many(&json!({"take": -2})).unwrap();
        let emails: Vec<&str> = found
            .as_array()
            .unwrap()
            .iter()
            .map(|u| u["email"].as_str().unwrap())
            .collect();
        assert_eq!(emails, vec!["c@test.com", "d@test.com"]);
    }

    #[test]
    fn test_distinct_keeps_first_occurrence() {
        let store = store();
        let users = delegate(&store, "User");
        seed_users(&users);

        let found = users.find_many(&json!({"distinct": ["role"]})).unwrap();
        let emails: Vec<&str> = found
            .as_array()
            .unwrap()
            .iter()
            .map(|u| u["email"].as_str().unwrap())
            .collect();
        assert_eq!(emails, vec!["a@test.com", "b@test.com"]);
    }

    #[test]
    fn test_select_projects_named_fields_only() {
        let store = store();
        let users = delegate(&store, "User");
        seed_users(&users);

        let found = users
            .find_first(&json!({
                "where": {"email": "b@test.com"},
                "select": {"email": true, "role": true}
            }))
            .unwrap();

        assert_eq!(found, json!({"email": "b@test.com", "role": "ADMIN"}));
    }

    #[test]
    fn test_include_resolves_relations() {
        let store = store();
        let users = delegate(&store, "User");
        let posts = delegate(&store, "Post");

        users
            .create(&json!({"data": {"email": "a@test.com"}}))
            .unwrap();
        posts
            .create(&json!({"data": {"title": "One", "views": 5, "authorId": 1}}))
            .unwrap();
        posts
            .create(&json!({"data": {"title": "Two", "views": 9, "authorId": 1}}))
            .unwrap();

        let found = users
            .find_unique(&json!({
                "where": {"id": 1},
                "include": {"posts": {"orderBy": {"views": "desc"}, "select": {"title": true}}}
            }))
            .unwrap();

        assert_eq!(found["posts"], json!([{"title": "Two"}, {"title": "One"}]));

        let with_author = posts
            .find_unique(&json!({"where": {"id": 1}, "include": {"author": true}}))
            .unwrap();
        assert_eq!(with_author["author"]["email"], json!("a@test.com"));
    }

    #[test]
    fn test_create_many_skip_duplicates() {
        let store = store();
        let users = delegate(&store, "User");

        let result = users
            .create_many(&json!({
                "data": [
                    {"email": "a@test.com"},
                    {"email": "a@test.com"},
                    {"email": "b@test.com"}
                ],
                "skipDuplicates": true
            }))
            .unwrap();

        assert_eq!(result, json!({"count": 2}));
    }

    #[test]
    fn test_create_many_and_return() {
        let store = store();
        let users = delegate(&store, "User");

        let result = users
            .create_many_and_return(&json!({
                "data": [{"email": "a@test.com"}, {"email": "b@test.com"}]
            }))
            .unwrap();

        let ids: Vec<i64> = result
            .as_array()
            .unwrap()
            .iter()
            .map(|u| u["id"].as_i64().unwrap())
            .collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn test_update_missing_record_is_p2025() {
        let store = store();
        let users = delegate(&store, "User");

        let err = users
            .update(&json!({"where": {"id": 1}, "data": {"role": "ADMIN"}}))
            .unwrap_err();

        assert_eq!(err.code(), "P2025");
        assert_eq!(
            err.to_string(),
            "No record was found for an update on User"
        );
    }

    #[test]
    fn test_failed_nested_write_leaves_store_unchanged() {
        let store = store();
        let users = delegate(&store, "User");
        users
            .create(&json!({"data": {"email": "a@test.com"}}))
            .unwrap();

        // The nested instruction connects a post that does not exist.
        let err = users
            .update(&json!({
                "where": {"id": 1},
                "data": {
                    "role": "ADMIN",
                    "posts": {"connect": [{"id": 42}]}
                }
            }))
            .unwrap_err();

        assert_eq!(err.code(), "P2018");
        let after = users.find_unique(&json!({"where": {"id": 1}})).unwrap();
        assert_eq!(after["role"], json!("USER"));
    }

    #[test]
    fn test_upsert_creates_then_updates() {
        let store = store();
        let users = delegate(&store, "User");

        let args = json!({
            "where": {"email": "a@test.com"},
            "create": {"email": "a@test.com", "age": 20},
            "update": {"age": 21}
        });

        let first = users.upsert(&args).unwrap();
        assert_eq!(first["age"], json!(20));

        let second = users.upsert(&args).unwrap();
        assert_eq!(second["age"], json!(21));
        assert_eq!(users.count(&json!({})).unwrap(), json!(1));
    }

    #[test]
    fn test_delete_returns_the_removed_record() {
        let store = store();
        let users = delegate(&store, "User");
        seed_users(&users);

        let removed = users.delete(&json!({"where": {"id": 2}})).unwrap();
        assert_eq!(removed["email"], json!("b@test.com"));
        assert_eq!(users.count(&json!({})).unwrap(), json!(3));

        let err = users.delete(&json!({"where": {"id": 2}})).unwrap_err();
        assert_eq!(err.code(), "P2025");
    }

    #[test]
    fn test_delete_many_counts_removals() {
        let store = store();
        let users = delegate(&store, "User");
        seed_users(&users);

        let result = users
            .delete_many(&json!({"where": {"role": "USER"}}))
            .unwrap();
        assert_eq!(result, json!({"count": 3}));
        assert_eq!(users.count(&json!({})).unwrap(), json!(1));
    }

    #[test]
    fn test_count_select_form() {
        let store = store();
        let users = delegate(&store, "User");
        seed_users(&users);
        users
            .update(&json!({"where": {"id": 4}, "data": {"age": null}}))
            .unwrap();

        let result = users
            .count(&json!({"select": {"_all": true, "age": true}}))
            .unwrap();
        assert_eq!(result, json!({"_all": 4, "age": 3}));
    }

    #[test]
    fn test_aggregate_over_empty_set() {
        let store = store();
        let users = delegate(&store, "User");

        let result = users
            .aggregate(&json!({
                "_count": true,
                "_sum": {"age": true},
                "_avg": {"age": true},
                "_min": {"age": true},
                "_max": {"age": true}
            }))
            .unwrap();

        assert_eq!(
            result,
            json!({
                "_count": 0,
                "_sum": {"age": 0},
                "_avg": {"age": null},
                "_min": {"age": null},
                "_max": {"age": null}
            })
        );
    }

    #[test]
    fn test_aggregate_numbers() {
        let store = store();
        let users = delegate(&store, "User");
        users
            .create(&json!({"data": {"email": "a@test.com", "age": 0}}))
            .unwrap();
        users
            .create(&json!({"data": {"email": "b@test.com", "age": 10}}))
            .unwrap();

        let result = users
            .aggregate(&json!({
                "_count": {"_all": true},
                "_avg": {"age": true},
                "_sum": {"age": true},
                "_min": {"age": true},
                "_max": {"age": true}
            }))
            .unwrap();

        assert_eq!(result["_count"], json!({"_all": 2}));
        assert_eq!(result["_avg"], json!({"age": 5}));
        assert_eq!(result["_sum"], json!({"age": 10}));
        assert_eq!(result["_min"], json!({"age": 0}));
        assert_eq!(result["_max"], json!({"age": 10}));
    }

    #[test]
    fn test_group_by_partitions_and_orders_by_count() {
        let store = store();
        let users = delegate(&store, "User");
        for (email, role) in [
            ("a@test.com", "ADMIN"),
            ("b@test.com", "USER"),
            ("c@test.com", "USER"),
            ("d@test.com", "ADMIN"),
            ("e@test.com", "USER"),
            ("f@test.com", "USER"),
        ] {
            users
                .create(&json!({"data": {"email": email, "role": role}}))
                .unwrap();
        }

        let result = users
            .group_by(&json!({
                "by": ["role"],
                "_count": {"id": true},
                "orderBy": {"_count": {"id": "desc"}}
            }))
            .unwrap();

        assert_eq!(
            result,
            json!([
                {"role": "USER", "_count": {"id": 4}},
                {"role": "ADMIN", "_count": {"id": 2}}
            ])
        );
    }

    #[test]
    fn test_group_by_first_appearance_order() {
        let store = store();
        let users = delegate(&store, "User");
        for (email, role) in [
            ("a@test.com", "EDITOR"),
            ("b@test.com", "ADMIN"),
            ("c@test.com", "EDITOR"),
        ] {
            users
                .create(&json!({"data": {"email": email, "role": role}}))
                .unwrap();
        }

        let result = users
            .group_by(&json!({"by": "role", "_count": true}))
            .unwrap();

        assert_eq!(
            result,
            json!([
                {"role": "EDITOR", "_count": 2},
                {"role": "ADMIN", "_count": 1}
            ])
        );
    }

    #[test]
    fn test_typed_find_many() {
        #[derive(serde::Deserialize)]
        struct UserRow {
            email: String,
            age: Option<i64>,
        }

        let store = store();
        let users = delegate(&store, "User");
        seed_users(&users);

        let rows: Vec<UserRow> = users
            .find_many_as(&json!({"where": {"role": "ADMIN"}}))
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].email, "b@test.com");
        assert_eq!(rows[0].age, Some(30));
    }
}

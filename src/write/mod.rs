//! Nested-write resolution. The write resolver is the only component that
//! mutates the store: it applies scalar defaults, resolves relation
//! instructions (create/connect/connectOrCreate/update/delete/disconnect/set)
//! into foreign-key assignments, and revalidates unique constraints before a
//! record is committed.

use serde_json::Value;

use crate::error::{MirrorDbError, Result};
use crate::query;
use crate::schema::{DefaultRule, FieldDescriptor, ModelDescriptor, SchemaDefinition};
use crate::store::{Record, StoreInner};

const SCALAR_UPDATE_OPS: &[&str] = &["set", "push", "increment", "decrement"];

pub struct WriteResolver<'a> {
    schema: &'a SchemaDefinition,
    store: &'a mut StoreInner,
}

impl<'a> WriteResolver<'a> {
    pub fn new(schema: &'a SchemaDefinition, store: &'a mut StoreInner) -> Self {
        WriteResolver { schema, store }
    }

    /// Create one record from a (possibly nested) create payload and commit
    /// it to the store. Returns the stored record.
    pub fn create(&mut self, model: &ModelDescriptor, data: &Value) -> Result<Record> {
        let obj = data.as_object().ok_or_else(|| {
            MirrorDbError::Validation(format!("Create data for '{}' must be an object", model.name))
        })?;

        let mut scalars = serde_json::Map::new();
        let mut owning = Vec::new();
        let mut children = Vec::new();

        for (key, value) in obj {
            match model.field(key) {
                Some(field) if field.is_relation() => {
                    if field.is_owning_relation() && !field.list {
                        owning.push((field, value));
                    } else {
                        children.push((field, value));
                    }
                }
                Some(_) => {
                    scalars.insert(key.clone(), value.clone());
                }
                None => {
                    return Err(MirrorDbError::Validation(format!(
                        "Unknown field '{}' in create data for '{}'",
                        key, model.name
                    )))
                }
            }
        }

        // Owning to-one relations resolve first: the connected/created target
        // supplies this record's foreign keys.
        for (field, instruction) in owning {
            for (fk, value) in self.resolve_to_one(model, field, instruction)? {
                scalars.insert(fk, value);
            }
        }

        let mut pending_counters = Vec::new();
        let record = self.build_record(model, &scalars, &mut pending_counters)?;

        self.check_unique(model, &record, None)?;

        self.store.records_mut(&model.name).push(record.clone());
        for (field_name, value) in pending_counters {
            self.store.set_counter(&model.name, &field_name, value);
        }

        // Dependent records carry foreign keys pointing at this record, so
        // they resolve after the commit, preserving input order.
        for (field, instruction) in children {
            self.apply_child_instructions(model, &record, field, instruction)?;
        }

        Ok(record)
    }

    /// Apply an update payload to the record at `index` and commit it.
    pub fn update(&mut self, model: &ModelDescriptor, index: usize, data: &Value) -> Result<Record> {
        let obj = data.as_object().ok_or_else(|| {
            MirrorDbError::Validation(format!("Update data for '{}' must be an object", model.name))
        })?;

        let mut record = self.store.records(&model.name)[index].clone();
        let mut children = Vec::new();

        for (key, value) in obj {
            let field = model.field(key).ok_or_else(|| {
                MirrorDbError::Validation(format!(
                    "Unknown field '{}' in update data for '{}'",
                    key, model.name
                ))
            })?;
            if field.is_relation() {
                if field.is_owning_relation() && !field.list {
                    self.apply_owning_update(model, &mut record, field, value)?;
                } else {
                    children.push((field, value));
                }
            } else {
                apply_scalar_update(model, field, &mut record, value)?;
            }
        }

        self.check_unique(model, &record, Some(index))?;
        self.store.records_mut(&model.name)[index] = record.clone();

        for (field, instruction) in children {
            self.apply_child_instructions(model, &record, field, instruction)?;
        }

        Ok(record)
    }

    /// Remove the record at `index`. Counters are untouched, so
    /// auto-increment values are never reused.
    pub fn delete(&mut self, model: &ModelDescriptor, index: usize) -> Record {
        self.store.records_mut(&model.name).remove(index)
    }

    /// Validate every unique constraint of `record` against the collection.
    /// A constraint with a null component never conflicts.
    pub fn check_unique(
        &self,
        model: &ModelDescriptor,
        record: &Record,
        exclude: Option<usize>,
    ) -> Result<()> {
        for constraint in model.unique_constraints() {
            let values: Vec<&Value> = constraint
                .fields
                .iter()
                .map(|f| record.get(f).unwrap_or(&Value::Null))
                .collect();
            if values.iter().any(|v| v.is_null()) {
                continue;
            }
            for (i, other) in self.store.records(&model.name).iter().enumerate() {
                if Some(i) == exclude {
                    continue;
                }
                let conflict = constraint
                    .fields
                    .iter()
                    .zip(&values)
                    .all(|(f, v)| other.get(f).is_some_and(|o| query::values_equal(o, v)));
                if conflict {
                    return Err(MirrorDbError::UniqueConstraint {
                        model: model.name.clone(),
                        constraint: constraint.name.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Resolve a to-one owning-side instruction into foreign-key assignments.
    fn resolve_to_one(
        &mut self,
        model: &ModelDescriptor,
        field: &FieldDescriptor,
        instruction: &Value,
    ) -> Result<Vec<(String, Value)>> {
        let schema = self.schema;
        let relation = field.relation.as_ref().expect("relation field");
        let target = schema.expect_model(&relation.target)?;
        let obj = instruction.as_object().ok_or_else(|| {
            MirrorDbError::Validation(format!(
                "Relation '{}.{}' expects a write instruction object",
                model.name, field.name
            ))
        })?;

        if let Some(selector) = obj.get("connect") {
            let index = query::find_by_unique(target, selector, self.store)?.ok_or_else(|| {
                MirrorDbError::RelationNotFound {
                    model: model.name.clone(),
                    field: field.name.clone(),
                }
            })?;
            return Ok(self.foreign_keys_from(target, index, relation.fields.iter(), relation.references.iter()));
        }

        if let Some(inner) = obj.get("connectOrCreate") {
            let selector = inner.get("where").ok_or_else(|| {
                MirrorDbError::Validation("connectOrCreate requires 'where'".into())
            })?;
            let payload = inner.get("create").ok_or_else(|| {
                MirrorDbError::Validation("connectOrCreate requires 'create'".into())
            })?;
            if let Some(index) = query::find_by_unique(target, selector, self.store)? {
                return Ok(self.foreign_keys_from(target, index, relation.fields.iter(), relation.references.iter()));
            }
            let created = self.create(target, payload)?;
            return Ok(foreign_keys_of(&created, relation.fields.iter(), relation.references.iter()));
        }

        if let Some(payload) = obj.get("create") {
            let created = self.create(target, payload)?;
            return Ok(foreign_keys_of(&created, relation.fields.iter(), relation.references.iter()));
        }

        Err(MirrorDbError::Validation(format!(
            "Relation '{}.{}' expects create, connect or connectOrCreate",
            model.name, field.name
        )))
    }

    fn foreign_keys_from<'f>(
        &self,
        target: &ModelDescriptor,
        index: usize,
        fks: impl Iterator<Item = &'f String>,
        refs: impl Iterator<Item = &'f String>,
    ) -> Vec<(String, Value)> {
        foreign_keys_of(&self.store.records(&target.name)[index], fks, refs)
    }

    /// Update instructions targeting this record's own foreign keys.
    fn apply_owning_update(
        &mut self,
        model: &ModelDescriptor,
        record: &mut Record,
        field: &FieldDescriptor,
        instruction: &Value,
    ) -> Result<()> {
        let schema = self.schema;
        let relation = field.relation.as_ref().expect("relation field");
        let obj = instruction.as_object().ok_or_else(|| {
            MirrorDbError::Validation(format!(
                "Relation '{}.{}' expects a write instruction object",
                model.name, field.name
            ))
        })?;

        for (tag, payload) in obj {
            match tag.as_str() {
                "connect" | "connectOrCreate" | "create" => {
                    let mut single = serde_json::Map::new();
                    single.insert(tag.clone(), payload.clone());
                    for (fk, value) in self.resolve_to_one(model, field, &Value::Object(single))? {
                        record.insert(fk, value);
                    }
                }
                "disconnect" => {
                    for fk in &relation.fields {
                        record.insert(fk.clone(), Value::Null);
                    }
                }
                "update" => {
                    let target = schema.expect_model(&relation.target)?;
                    let index = query::related_indices(schema, model, record, field, self.store)?
                        .into_iter()
                        .next()
                        .ok_or_else(|| MirrorDbError::NotFound {
                            model: target.name.clone(),
                            operation: "an update".into(),
                        })?;
                    let data = payload.get("data").unwrap_or(payload);
                    self.update(target, index, data)?;
                }
                "delete" => {
                    let target = schema.expect_model(&relation.target)?;
                    if let Some(index) =
                        query::related_indices(schema, model, record, field, self.store)?
                            .into_iter()
                            .next()
                    {
                        self.delete(target, index);
                    }
                    for fk in &relation.fields {
                        record.insert(fk.clone(), Value::Null);
                    }
                }
                other => {
                    return Err(MirrorDbError::Validation(format!(
                        "Unknown relation instruction '{other}' on '{}.{}'",
                        model.name, field.name
                    )))
                }
            }
        }
        Ok(())
    }

    /// Instructions for relations whose foreign keys live on the related
    /// (child) records: to-many relations and the non-owning end of one-to-one.
    fn apply_child_instructions(
        &mut self,
        model: &ModelDescriptor,
        parent: &Record,
        field: &FieldDescriptor,
        instruction: &Value,
    ) -> Result<()> {
        let schema = self.schema;
        let (child_model, inverse) = schema.inverse_relation(model, field)?;
        let inv = inverse.relation.as_ref().expect("owning relation");
        let fk_pairs: Vec<(String, Value)> = inv
            .fields
            .iter()
            .zip(&inv.references)
            .map(|(fk, rf)| (fk.clone(), parent.get(rf).cloned().unwrap_or(Value::Null)))
            .collect();

        let obj = instruction.as_object().ok_or_else(|| {
            MirrorDbError::Validation(format!(
                "Relation '{}.{}' expects a write instruction object",
                model.name, field.name
            ))
        })?;

        for (tag, payload) in obj {
            match tag.as_str() {
                "create" => {
                    for item in list_or_one(payload) {
                        let data = with_foreign_keys(item, &fk_pairs)?;
                        self.create(child_model, &data)?;
                    }
                }
                "createMany" => {
                    let data = payload.get("data").and_then(Value::as_array).ok_or_else(|| {
                        MirrorDbError::Validation("createMany requires a 'data' array".into())
                    })?;
                    let skip_duplicates = payload
                        .get("skipDuplicates")
                        .and_then(Value::as_bool)
                        .unwrap_or(false);
                    for item in data {
                        let item = with_foreign_keys(item, &fk_pairs)?;
                        match self.create(child_model, &item) {
                            Err(MirrorDbError::UniqueConstraint { .. }) if skip_duplicates => {}
                            other => {
                                other?;
                            }
                        }
                    }
                }
                "connect" => {
                    for selector in list_or_one(payload) {
                        let index = query::find_by_unique(child_model, selector, self.store)?
                            .ok_or_else(|| MirrorDbError::RelationNotFound {
                                model: model.name.clone(),
                                field: field.name.clone(),
                            })?;
                        self.attach_child(child_model, index, &fk_pairs)?;
                    }
                }
                "connectOrCreate" => {
                    for item in list_or_one(payload) {
                        let selector = item.get("where").ok_or_else(|| {
                            MirrorDbError::Validation("connectOrCreate requires 'where'".into())
                        })?;
                        let create = item.get("create").ok_or_else(|| {
                            MirrorDbError::Validation("connectOrCreate requires 'create'".into())
                        })?;
                        match query::find_by_unique(child_model, selector, self.store)? {
                            Some(index) => self.attach_child(child_model, index, &fk_pairs)?,
                            None => {
                                let data = with_foreign_keys(create, &fk_pairs)?;
                                self.create(child_model, &data)?;
                            }
                        }
                    }
                }
                "set" => {
                    let current =
                        query::related_indices(schema, model, parent, field, self.store)?;
                    let null_pairs: Vec<(String, Value)> = fk_pairs
                        .iter()
                        .map(|(fk, _)| (fk.clone(), Value::Null))
                        .collect();
                    for index in current {
                        self.attach_child(child_model, index, &null_pairs)?;
                    }
                    for selector in list_or_one(payload) {
                        let index = query::find_by_unique(child_model, selector, self.store)?
                            .ok_or_else(|| MirrorDbError::RelationNotFound {
                                model: model.name.clone(),
                                field: field.name.clone(),
                            })?;
                        self.attach_child(child_model, index, &fk_pairs)?;
                    }
                }
                "disconnect" => {
                    let null_pairs: Vec<(String, Value)> = fk_pairs
                        .iter()
                        .map(|(fk, _)| (fk.clone(), Value::Null))
                        .collect();
                    if payload.as_bool() == Some(true) {
                        // To-one: detach whatever is currently related.
                        for index in
                            query::related_indices(schema, model, parent, field, self.store)?
                        {
                            self.attach_child(child_model, index, &null_pairs)?;
                        }
                    } else {
                        for selector in list_or_one(payload) {
                            if let Some(index) =
                                self.find_related(model, parent, field, child_model, selector)?
                            {
                                self.attach_child(child_model, index, &null_pairs)?;
                            }
                        }
                    }
                }
                "update" => {
                    for item in list_or_one(payload) {
                        let (selector, data) = match (item.get("where"), item.get("data")) {
                            (Some(w), Some(d)) => (Some(w), d),
                            // To-one non-owning side: payload is the data itself.
                            _ => (None, item),
                        };
                        let index = match selector {
                            Some(selector) => self
                                .find_related(model, parent, field, child_model, selector)?,
                            None => query::related_indices(schema, model, parent, field, self.store)?
                                .into_iter()
                                .next(),
                        }
                        .ok_or_else(|| MirrorDbError::NotFound {
                            model: child_model.name.clone(),
                            operation: "an update".into(),
                        })?;
                        self.update(child_model, index, data)?;
                    }
                }
                "updateMany" => {
                    for item in list_or_one(payload) {
                        let filter = item.get("where").cloned().unwrap_or(Value::Null);
                        let data = item.get("data").ok_or_else(|| {
                            MirrorDbError::Validation("updateMany requires 'data'".into())
                        })?;
                        let related =
                            query::related_indices(schema, model, parent, field, self.store)?;
                        for index in related {
                            let record = &self.store.records(&child_model.name)[index];
                            if query::matches(schema, child_model, record, &filter, self.store)? {
                                self.update(child_model, index, data)?;
                            }
                        }
                    }
                }
                "delete" => {
                    if payload.as_bool() == Some(true) {
                        let mut related =
                            query::related_indices(schema, model, parent, field, self.store)?;
                        related.sort_unstable_by(|a, b| b.cmp(a));
                        for index in related {
                            self.delete(child_model, index);
                        }
                    } else {
                        for selector in list_or_one(payload) {
                            let index = self
                                .find_related(model, parent, field, child_model, selector)?
                                .ok_or_else(|| MirrorDbError::NotFound {
                                    model: child_model.name.clone(),
                                    operation: "a delete".into(),
                                })?;
                            self.delete(child_model, index);
                        }
                    }
                }
                "deleteMany" => {
                    for item in list_or_one(payload) {
                        let related =
                            query::related_indices(schema, model, parent, field, self.store)?;
                        let mut doomed = Vec::new();
                        for index in related {
                            let record = &self.store.records(&child_model.name)[index];
                            if query::matches(schema, child_model, record, item, self.store)? {
                                doomed.push(index);
                            }
                        }
                        doomed.sort_unstable_by(|a, b| b.cmp(a));
                        for index in doomed {
                            self.delete(child_model, index);
                        }
                    }
                }
                other => {
                    return Err(MirrorDbError::Validation(format!(
                        "Unknown relation instruction '{other}' on '{}.{}'",
                        model.name, field.name
                    )))
                }
            }
        }
        Ok(())
    }

    /// Point a child record's foreign keys at new values, revalidating its
    /// unique constraints (a one-to-one foreign key is typically unique).
    fn attach_child(
        &mut self,
        child_model: &ModelDescriptor,
        index: usize,
        fk_pairs: &[(String, Value)],
    ) -> Result<()> {
        let mut record = self.store.records(&child_model.name)[index].clone();
        for (fk, value) in fk_pairs {
            record.insert(fk.clone(), value.clone());
        }
        self.check_unique(child_model, &record, Some(index))?;
        self.store.records_mut(&child_model.name)[index] = record;
        Ok(())
    }

    /// Find, among the records related to `parent` through `field`, the one
    /// matching a unique selector.
    fn find_related(
        &self,
        model: &ModelDescriptor,
        parent: &Record,
        field: &FieldDescriptor,
        child_model: &ModelDescriptor,
        selector: &Value,
    ) -> Result<Option<usize>> {
        let filter = query::unique_filter(child_model, selector)?;
        let related = query::related_indices(self.schema, model, parent, field, self.store)?;
        Ok(related.into_iter().find(|&i| {
            let record = &self.store.records(&child_model.name)[i];
            filter
                .iter()
                .all(|(f, v)| query::values_equal(record.get(f).unwrap_or(&Value::Null), v))
        }))
    }

    /// Assemble a record from explicit scalar values and field defaults.
    /// Auto-increment values are reserved here but only committed by the
    /// caller once the whole create has validated.
    fn build_record(
        &self,
        model: &ModelDescriptor,
        scalars: &serde_json::Map<String, Value>,
        pending_counters: &mut Vec<(String, i64)>,
    ) -> Result<Record> {
        let mut record = Record::new();
        for field in model.scalar_fields() {
            if let Some(value) = scalars.get(&field.name) {
                record.insert(field.name.clone(), value.clone());
                continue;
            }
            let value = match &field.default {
                Some(DefaultRule::Autoincrement) => {
                    let base = pending_counters
                        .iter()
                        .find(|(name, _)| name == &field.name)
                        .map(|(_, v)| *v)
                        .unwrap_or_else(|| self.store.counter(&model.name, &field.name));
                    let next = base + 1;
                    pending_counters.retain(|(name, _)| name != &field.name);
                    pending_counters.push((field.name.clone(), next));
                    Value::from(next)
                }
                Some(DefaultRule::Uuid) => Value::from(uuid::Uuid::new_v4().to_string()),
                Some(DefaultRule::Ulid) => Value::from(ulid::Ulid::new().to_string().to_lowercase()),
                Some(DefaultRule::Nanoid) => Value::from(nanoid::nanoid!()),
                Some(DefaultRule::Now) => Value::from(chrono::Utc::now().to_rfc3339()),
                Some(DefaultRule::Literal(v)) => v.clone(),
                None => {
                    if field.list {
                        Value::Array(Vec::new())
                    } else if field.required {
                        return Err(MirrorDbError::Validation(format!(
                            "Missing required field '{}.{}'",
                            model.name, field.name
                        )));
                    } else {
                        Value::Null
                    }
                }
            };
            record.insert(field.name.clone(), value);
        }
        Ok(record)
    }
}

/// Apply one scalar update: a plain value, or an operator object
/// ({set}, {push}, {increment}, {decrement}).
fn apply_scalar_update(
    model: &ModelDescriptor,
    field: &FieldDescriptor,
    record: &mut Record,
    value: &Value,
) -> Result<()> {
    use crate::schema::FieldKind;

    let ops = match value {
        Value::Object(map)
            if field.kind != FieldKind::Json
                && map.keys().any(|k| SCALAR_UPDATE_OPS.contains(&k.as_str())) =>
        {
            map
        }
        other => {
            record.insert(field.name.clone(), other.clone());
            return Ok(());
        }
    };

    for (op, operand) in ops {
        match op.as_str() {
            "set" => {
                record.insert(field.name.clone(), operand.clone());
            }
            "push" => {
                if !field.list {
                    return Err(MirrorDbError::Validation(format!(
                        "'push' requires a list field, '{}.{}' is scalar",
                        model.name, field.name
                    )));
                }
                let mut list = match record.get(&field.name) {
                    Some(Value::Array(items)) => items.clone(),
                    _ => Vec::new(),
                };
                match operand {
                    Value::Array(items) => list.extend(items.iter().cloned()),
                    single => list.push(single.clone()),
                }
                record.insert(field.name.clone(), Value::Array(list));
            }
            "increment" | "decrement" => {
                let delta = operand.as_f64().ok_or_else(|| {
                    MirrorDbError::Validation(format!("'{op}' expects a number"))
                })?;
                let delta = if op == "decrement" { -delta } else { delta };
                if let Some(current) = record.get(&field.name).and_then(Value::as_f64) {
                    let next = current + delta;
                    let value = if next.fract() == 0.0 {
                        Value::from(next as i64)
                    } else {
                        Value::from(next)
                    };
                    record.insert(field.name.clone(), value);
                }
            }
            other => {
                return Err(MirrorDbError::Validation(format!(
                    "Unknown update operator '{other}' on '{}.{}'",
                    model.name, field.name
                )))
            }
        }
    }
    Ok(())
}

fn list_or_one(value: &Value) -> Vec<&Value> {
    match value {
        Value::Array(items) => items.iter().collect(),
        other => vec![other],
    }
}

fn with_foreign_keys(payload: &Value, fk_pairs: &[(String, Value)]) -> Result<Value> {
    let mut obj = payload
        .as_object()
        .ok_or_else(|| MirrorDbError::Validation("Nested create payload must be an object".into()))?
        .clone();
    for (fk, value) in fk_pairs {
        obj.insert(fk.clone(), value.clone());
    }
    Ok(Value::Object(obj))
}

fn foreign_keys_of<'f>(
    record: &Record,
    fks: impl Iterator<Item = &'f String>,
    refs: impl Iterator<Item = &'f String>,
) -> Vec<(String, Value)> {
    fks.zip(refs)
        .map(|(fk, rf)| (fk.clone(), record.get(rf).cloned().unwrap_or(Value::Null)))
        .collect()
}

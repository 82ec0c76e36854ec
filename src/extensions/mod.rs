//! Client extension layers. A layer can add computed result fields, wrap
//! operations with query middleware, or register model-level methods.
//! Extending never mutates the base client: it returns a new handle sharing
//! the same store, and an extended client can itself be extended again.
//!
//! Composition order per call: computed result fields run innermost (right
//! after the base operation), query middleware wraps around that with the
//! last-added layer outermost, and model methods sit on top of the whole
//! extended surface.

use std::sync::Arc;

use serde_json::Value;

use crate::client::Client;
use crate::delegate::{Delegate, Operation};
use crate::error::{MirrorDbError, Result};
use crate::store::Record;

/// Which models an extension applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelScope {
    All,
    Model(String),
}

impl ModelScope {
    pub fn model(name: impl Into<String>) -> ModelScope {
        ModelScope::Model(name.into())
    }

    fn applies_to(&self, model: &str) -> bool {
        match self {
            ModelScope::All => true,
            ModelScope::Model(name) => name == model,
        }
    }
}

/// Context handed to query middleware.
#[derive(Debug, Clone)]
pub struct QueryInfo {
    pub model: String,
    pub operation: Operation,
}

pub type ComputeFn = Arc<dyn Fn(&Record) -> Value + Send + Sync>;
pub type QueryFn =
    Arc<dyn Fn(&QueryInfo, &Value, &dyn Fn(&Value) -> Result<Value>) -> Result<Value> + Send + Sync>;
pub type ModelMethodFn = Arc<dyn Fn(&ExtendedDelegate, &Value) -> Result<Value> + Send + Sync>;

#[derive(Clone)]
struct ResultExtension {
    scope: ModelScope,
    field: String,
    compute: ComputeFn,
}

#[derive(Clone)]
struct QueryExtension {
    scope: ModelScope,
    handler: QueryFn,
}

#[derive(Clone)]
struct ModelMethod {
    scope: ModelScope,
    name: String,
    call: ModelMethodFn,
}

/// One extension layer, built with the chained constructor methods.
#[derive(Clone, Default)]
pub struct ExtensionSpec {
    results: Vec<ResultExtension>,
    queries: Vec<QueryExtension>,
    methods: Vec<ModelMethod>,
}

impl ExtensionSpec {
    pub fn new() -> ExtensionSpec {
        ExtensionSpec::default()
    }

    /// Add a computed field to every record-shaped result. The closure sees
    /// the record as the operation produced it, so a computed field may
    /// shadow a stored field and still read the stored value.
    pub fn result_field(
        mut self,
        scope: ModelScope,
        field: impl Into<String>,
        compute: impl Fn(&Record) -> Value + Send + Sync + 'static,
    ) -> Self {
        self.results.push(ResultExtension {
            scope,
            field: field.into(),
            compute: Arc::new(compute),
        });
        self
    }

    /// Wrap operations with middleware. The handler receives the call
    /// context, the args, and a `next` continuation; it may rewrite args,
    /// rewrite the result, short-circuit, or skip `next` entirely.
    pub fn query(
        mut self,
        scope: ModelScope,
        handler: impl Fn(&QueryInfo, &Value, &dyn Fn(&Value) -> Result<Value>) -> Result<Value>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        self.queries.push(QueryExtension {
            scope,
            handler: Arc::new(handler),
        });
        self
    }

    /// Register a named model-level method, callable through
    /// `ExtendedClient::call`.
    pub fn model_method(
        mut self,
        scope: ModelScope,
        name: impl Into<String>,
        call: impl Fn(&ExtendedDelegate, &Value) -> Result<Value> + Send + Sync + 'static,
    ) -> Self {
        self.methods.push(ModelMethod {
            scope,
            name: name.into(),
            call: Arc::new(call),
        });
        self
    }
}

/// A client with one or more extension layers applied.
#[derive(Clone)]
pub struct ExtendedClient {
    base: Client,
    layers: Arc<Vec<ExtensionSpec>>,
}

impl ExtendedClient {
    pub(crate) fn new(base: Client, layers: Vec<ExtensionSpec>) -> ExtendedClient {
        ExtendedClient {
            base,
            layers: Arc::new(layers),
        }
    }

    /// Stack another layer on top. The existing handle stays valid and
    /// unextended.
    pub fn extends(&self, spec: ExtensionSpec) -> ExtendedClient {
        let mut layers = (*self.layers).clone();
        layers.push(spec);
        ExtendedClient::new(self.base.clone(), layers)
    }

    pub fn base(&self) -> &Client {
        &self.base
    }

    pub fn model(&self, name: &str) -> Result<ExtendedDelegate> {
        Ok(ExtendedDelegate {
            inner: self.base.model(name)?,
            layers: self.layers.clone(),
        })
    }

    /// Invoke a registered model method. When several layers register the
    /// same name, the last-added layer wins.
    pub fn call(&self, model: &str, method: &str, args: &Value) -> Result<Value> {
        for layer in self.layers.iter().rev() {
            for candidate in layer.methods.iter().rev() {
                if candidate.name == method && candidate.scope.applies_to(model) {
                    return (candidate.call)(&self.model(model)?, args);
                }
            }
        }
        Err(MirrorDbError::Validation(format!(
            "Unknown method '{method}' on model '{model}'"
        )))
    }
}

/// Delegate wrapped with the client's extension layers.
#[derive(Clone)]
pub struct ExtendedDelegate {
    inner: Delegate,
    layers: Arc<Vec<ExtensionSpec>>,
}

impl ExtendedDelegate {
    pub fn model_name(&self) -> &str {
        self.inner.model_name()
    }

    pub fn execute(&self, operation: Operation, args: &Value) -> Result<Value> {
        let handlers: Vec<&QueryExtension> = self
            .layers
            .iter()
            .flat_map(|layer| layer.queries.iter())
            .filter(|q| q.scope.applies_to(self.inner.model_name()))
            .collect();
        let info = QueryInfo {
            model: self.inner.model_name().to_string(),
            operation,
        };
        self.invoke(&handlers, handlers.len(), &info, args)
    }

    /// Peel middleware off the chain from the outside in; depth 0 is the
    /// base operation plus computed-field attachment.
    fn invoke(
        &self,
        handlers: &[&QueryExtension],
        depth: usize,
        info: &QueryInfo,
        args: &Value,
    ) -> Result<Value> {
        if depth == 0 {
            let value = self.inner.execute(info.operation, args)?;
            return Ok(self.attach_computed(info.operation, value));
        }
        let handler = &handlers[depth - 1].handler;
        let next = |next_args: &Value| self.invoke(handlers, depth - 1, info, next_args);
        handler(info, args, &next)
    }

    fn attach_computed(&self, operation: Operation, value: Value) -> Value {
        let fields: Vec<&ResultExtension> = self
            .layers
            .iter()
            .flat_map(|layer| layer.results.iter())
            .filter(|r| r.scope.applies_to(self.inner.model_name()))
            .collect();
        if fields.is_empty() {
            return value;
        }

        if operation.returns_record() {
            attach_fields(&fields, value)
        } else if operation.returns_record_list() {
            match value {
                Value::Array(items) => Value::Array(
                    items
                        .into_iter()
                        .map(|item| attach_fields(&fields, item))
                        .collect(),
                ),
                other => other,
            }
        } else {
            value
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

    pub fn find_many(&self, args: &Value) -> Result<Value> {
        self.execute(Operation::FindMany, args)
    }

    pub fn create(&self, args: &Value) -> Result<Value> {
        self.execute(Operation::Create, args)
    }

    pub fn update(&self, args: &Value) -> Result<Value> {
        self.execute(Operation::Update, args)
    }

    pub fn upsert(&self, args: &Value) -> Result<Value> {
        self.execute(Operation::Upsert, args)
    }

    pub fn delete(&self, args: &Value) -> Result<Value> {
        self.execute(Operation::Delete, args)
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
}

/// Computed fields see the record as produced by the operation, before any
/// of them is attached, so shadowing a stored field keeps its original value
/// visible to the closure.
fn attach_fields(fields: &[&ResultExtension], value: Value) -> Value {
    let Value::Object(map) = value else {
        return value;
    };
    let original = map.clone();
    let mut out = map;
    for ext in fields {
        out.insert(ext.field.clone(), (ext.compute)(&original));
    }
    Value::Object(out)
}

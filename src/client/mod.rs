//! The top-level client handle: one shared in-memory store behind per-model
//! delegates, plus lifecycle helpers (reset, data export/import),
//! transactions, raw-query stand-ins, and extension layering.

use std::path::Path;
use std::sync::Arc;

use serde_json::Value;

use crate::delegate::{Delegate, Operation};
use crate::error::Result;
use crate::extensions::{ExtendedClient, ExtensionSpec};
use crate::schema::{parse_schema, parse_schema_str, SchemaDefinition};
use crate::store::{Store, StoreData};

/// One step of a batch transaction.
#[derive(Debug, Clone)]
pub struct TransactionOp {
    pub model: String,
    pub operation: Operation,
    pub args: Value,
}

impl TransactionOp {
    pub fn new(model: impl Into<String>, operation: Operation, args: Value) -> TransactionOp {
        TransactionOp {
            model: model.into(),
            operation,
            args,
        }
    }
}

/// Cheap to clone; every clone shares the same store.
#[derive(Clone)]
pub struct Client {
    store: Store,
}

impl Client {
    pub fn new(schema: SchemaDefinition) -> Client {
        Client {
            store: Store::new(Arc::new(schema)),
        }
    }

    pub fn from_schema_str(content: &str) -> Result<Client> {
        Ok(Client::new(parse_schema_str(content)?))
    }

    pub fn from_schema_path(path: &Path) -> Result<Client> {
        Ok(Client::new(parse_schema(path)?))
    }

    pub fn schema(&self) -> &SchemaDefinition {
        self.store.schema()
    }

    /// Delegate for one model. Fails early on unknown model names rather
    /// than deferring to the first operation.
    pub fn model(&self, name: &str) -> Result<Delegate> {
        self.store.schema().expect_model(name)?;
        Ok(Delegate::new(self.store.clone(), name.to_string()))
    }

    /// Drop every record and reset auto-increment counters.
    pub fn reset(&self) {
        self.store.reset();
    }

    /// Deep copy of all stored records, keyed by model name.
    pub fn get_data(&self) -> StoreData {
        self.store.export()
    }

    /// Replace the whole store contents. Counters are re-derived so
    /// `set_data(get_data())` is an identity.
    pub fn set_data(&self, data: StoreData) {
        self.store.import(data);
    }

    /// Run a batch of operations strictly in order, collecting results
    /// positionally. The first failure aborts the remaining operations and
    /// propagates; steps already applied stay applied. Each individual step
    /// keeps its own all-or-nothing guarantee.
    pub fn transaction(&self, operations: Vec<TransactionOp>) -> Result<Vec<Value>> {
        let mut results = Vec::with_capacity(operations.len());
        for op in operations {
            let value = self
                .model(&op.model)
                .and_then(|d| d.execute(op.operation, &op.args))?;
            results.push(value);
        }
        Ok(results)
    }

    /// Callback-style transaction. The closure receives a view without the
    /// transaction entry points, so transactions cannot nest.
    pub fn transaction_with<T>(&self, f: impl FnOnce(&TransactionClient<'_>) -> Result<T>) -> Result<T> {
        f(&TransactionClient { inner: self })
    }

    /// Connection lifecycle is meaningless for an in-memory store; kept as
    /// no-ops so callers can drive the same code paths they use in
    /// production.
    pub fn connect(&self) {}

    pub fn disconnect(&self) {}

    /// Event registration stand-in; no engine events are ever emitted.
    pub fn on(&self, event: &str) {
        log::debug!("event registration is a stand-in, ignoring '{event}'");
    }

    /// Raw statements are not interpreted; reports zero affected rows.
    pub fn execute_raw(&self, query: &str) -> i64 {
        log::debug!("execute_raw is a stand-in, ignoring statement: {query}");
        0
    }

    /// Raw queries are not interpreted; reports an empty result set.
    pub fn query_raw(&self, query: &str) -> Value {
        log::debug!("query_raw is a stand-in, ignoring query: {query}");
        Value::Array(Vec::new())
    }

    /// Middleware registration is accepted and discarded; query extensions
    /// are the supported interception point.
    pub fn use_middleware<F>(&self, _middleware: F)
    where
        F: Fn(&str, &Value) + Send + Sync + 'static,
    {
        log::debug!("middleware registration is a stand-in and has no effect");
    }

    /// Layer an extension on top of this client. The base client keeps
    /// working unchanged; both handles share the store.
    pub fn extends(&self, spec: ExtensionSpec) -> ExtendedClient {
        ExtendedClient::new(self.clone(), vec![spec])
    }

    /// Factory form of `extends`: the closure receives the client and builds
    /// the layer, which lets extension methods capture their own handles.
    pub fn extends_with(&self, factory: impl FnOnce(&Client) -> ExtensionSpec) -> ExtendedClient {
        self.extends(factory(self))
    }
}

/// Client view handed to callback transactions. It exposes the operation
/// surface but not the transaction entry points.
pub struct TransactionClient<'a> {
    inner: &'a Client,
}

impl TransactionClient<'_> {
    pub fn model(&self, name: &str) -> Result<Delegate> {
        self.inner.model(name)
    }

    pub fn schema(&self) -> &SchemaDefinition {
        self.inner.schema()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn client() -> Client {
        Client::from_schema_str(
            r#"
models:
  User:
    fields:
      id: { type: int, id: true, default: autoincrement }
      email: { type: string, unique: true, required: true }
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
    fn test_unknown_model_is_rejected() {
        let client = client();
        assert!(client.model("User").is_ok());
        assert!(client.model("Ghost").is_err());
    }

    #[test]
    fn test_clones_share_the_store() {
        let client = client();
        let clone = client.clone();

        client
            .model("User")
            .unwrap()
            .create(&json!({"data": {"email": "a@test.com"}}))
            .unwrap();

        let count = clone.model("User").unwrap().count(&json!({})).unwrap();
        assert_eq!(count, json!(1));
    }

    #[test]
    fn test_reset_clears_records_and_counters() {
        let client = client();
        let users = client.model("User").unwrap();
        users.create(&json!({"data": {"email": "a@test.com"}})).unwrap();

        client.reset();

        assert_eq!(users.count(&json!({})).unwrap(), json!(0));
        let recreated = users
            .create(&json!({"data": {"email": "a@test.com"}}))
            .unwrap();
        assert_eq!(recreated["id"], json!(1));
    }

    #[test]
    fn test_set_data_of_get_data_is_identity() {
        let client = client();
        let users = client.model("User").unwrap();
        users.create(&json!({"data": {"email": "a@test.com"}})).unwrap();
        users.create(&json!({"data": {"email": "b@test.com"}})).unwrap();

        let data = client.get_data();
        client.set_data(data.clone());

        assert_eq!(client.get_data(), data);
        // Counters pick up from the imported maximum.
        let next = users
            .create(&json!({"data": {"email": "c@test.com"}}))
            .unwrap();
        assert_eq!(next["id"], json!(3));
    }

    #[test]
    fn test_transaction_applies_in_order() {
        let client = client();

        let results = client
            .transaction(vec![
                TransactionOp::new(
                    "User",
                    Operation::Create,
                    json!({"data": {"email": "a@test.com"}}),
                ),
                TransactionOp::new(
                    "Post",
                    Operation::Create,
                    json!({"data": {"title": "Hello", "authorId": 1}}),
                ),
                TransactionOp::new("Post", Operation::Count, json!({})),
            ])
            .unwrap();

        assert_eq!(results.len(), 3);
        assert_eq!(results[2], json!(1));
    }

    #[test]
    fn test_failed_transaction_keeps_applied_steps() {
        let client = client();
        let users = client.model("User").unwrap();

        let err = client
            .transaction(vec![
                TransactionOp::new(
                    "User",
                    Operation::Create,
                    json!({"data": {"email": "a@test.com"}}),
                ),
                TransactionOp::new(
                    "User",
                    Operation::Update,
                    json!({"where": {"id": 99}, "data": {"email": "x@test.com"}}),
                ),
                TransactionOp::new(
                    "User",
                    Operation::Create,
                    json!({"data": {"email": "b@test.com"}}),
                ),
            ])
            .unwrap_err();

        // The failing step aborts the rest but the first create stays.
        assert_eq!(err.code(), "P2025");
        assert_eq!(users.count(&json!({})).unwrap(), json!(1));
    }

    #[test]
    fn test_callback_transaction_propagates_errors() {
        let client = client();

        let result: Result<()> = client.transaction_with(|tx| {
            tx.model("User")?
                .create(&json!({"data": {"email": "a@test.com"}}))?;
            Err(crate::error::MirrorDbError::Other("abort".into()))
        });

        assert!(result.is_err());
    }

    #[test]
    fn test_callback_transaction_returns_its_result() {
        let client = client();

        let created = client
            .transaction_with(|tx| {
                tx.model("User")?
                    .create(&json!({"data": {"email": "a@test.com"}}))
            })
            .unwrap();

        assert_eq!(created["email"], json!("a@test.com"));
        assert_eq!(
            client.model("User").unwrap().count(&json!({})).unwrap(),
            json!(1)
        );
    }

    #[test]
    fn test_raw_stand_ins() {
        let client = client();
        client.connect();
        assert_eq!(client.execute_raw("DELETE FROM users"), 0);
        assert_eq!(client.query_raw("SELECT 1"), json!([]));
        client.disconnect();
    }
}

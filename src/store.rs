use async_trait::async_trait;
use serde_json::Value;

use crate::error::AppResult;

#[cfg(test)]
pub use memory::MemoryStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    /// Teacher allow-list keyed by email. Managed outside the app.
    Teachers,
    Users,
    Assignments,
    TestResults,
}

impl Collection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Collection::Teachers => "teachers",
            Collection::Users => "users",
            Collection::Assignments => "assignments",
            Collection::TestResults => "testResults",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: String,
    pub body: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Eq(String, Value),
    ArrayContains(String, Value),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    Asc,
    Desc,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    pub filter: Option<Predicate>,
    pub order_by: Option<(String, Order)>,
    pub limit: Option<usize>,
}

impl Query {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn where_eq(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.filter = Some(Predicate::Eq(field.to_string(), value.into()));
        self
    }

    pub fn array_contains(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.filter = Some(Predicate::ArrayContains(field.to_string(), value.into()));
        self
    }

    pub fn order_by(mut self, field: &str, order: Order) -> Self {
        self.order_by = Some((field.to_string(), order));
        self
    }
}

/// The managed document database, reduced to the operations the app relies on.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, collection: Collection, id: &str) -> AppResult<Option<Document>>;
    async fn query(&self, collection: Collection, query: &Query) -> AppResult<Vec<Document>>;
    /// Create or replace the whole body.
    async fn set(&self, collection: Collection, id: &str, body: Value) -> AppResult<()>;
    /// Shallow-merge `fields` into an existing document.
    async fn update(&self, collection: Collection, id: &str, fields: Value) -> AppResult<()>;
    /// Insert under a generated id and return it.
    async fn add(&self, collection: Collection, body: Value) -> AppResult<String>;
    async fn delete(&self, collection: Collection, id: &str) -> AppResult<()>;
}

#[cfg(test)]
mod memory {
    use std::cmp::Ordering;
    use std::collections::{BTreeMap, HashMap};

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::Value;
    use uuid::Uuid;

    use super::{Collection, Document, DocumentStore, Order, Predicate, Query};
    use crate::error::{AppError, AppResult};

    #[derive(Default)]
    struct MemoryState {
        collections: HashMap<Collection, BTreeMap<String, Value>>,
        fail_reads: bool,
        fail_writes: bool,
    }

    /// In-process store with the same query semantics as the Postgres one.
    #[derive(Default)]
    pub struct MemoryStore {
        state: Mutex<MemoryState>,
    }

    impl MemoryStore {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn fail_reads(&self, fail: bool) {
            self.state.lock().fail_reads = fail;
        }

        pub fn fail_writes(&self, fail: bool) {
            self.state.lock().fail_writes = fail;
        }

        pub fn len(&self, collection: Collection) -> usize {
            self.state
                .lock()
                .collections
                .get(&collection)
                .map(|docs| docs.len())
                .unwrap_or(0)
        }

        fn check_write(state: &MemoryState, collection: Collection) -> AppResult<()> {
            if state.fail_writes {
                return Err(AppError::StoreWrite(format!(
                    "{} is unavailable",
                    collection.as_str()
                )));
            }
            Ok(())
        }

        fn check_read(state: &MemoryState, collection: Collection) -> AppResult<()> {
            if state.fail_reads {
                return Err(AppError::StoreRead(format!(
                    "{} is unavailable",
                    collection.as_str()
                )));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl DocumentStore for MemoryStore {
        async fn get(&self, collection: Collection, id: &str) -> AppResult<Option<Document>> {
            let state = self.state.lock();
            Self::check_read(&state, collection)?;
            Ok(state
                .collections
                .get(&collection)
                .and_then(|docs| docs.get(id))
                .map(|body| Document {
                    id: id.to_string(),
                    body: body.clone(),
                }))
        }

        async fn query(&self, collection: Collection, query: &Query) -> AppResult<Vec<Document>> {
            let state = self.state.lock();
            Self::check_read(&state, collection)?;

            let mut docs: Vec<Document> = state
                .collections
                .get(&collection)
                .map(|docs| {
                    docs.iter()
                        .filter(|(_, body)| matches_predicate(body, query.filter.as_ref()))
                        .map(|(id, body)| Document {
                            id: id.clone(),
                            body: body.clone(),
                        })
                        .collect()
                })
                .unwrap_or_default();

            if let Some((field, order)) = &query.order_by {
                docs.sort_by(|a, b| {
                    let ordering = compare_values(a.body.get(field), b.body.get(field));
                    match order {
                        Order::Asc => ordering,
                        Order::Desc => ordering.reverse(),
                    }
                });
            }
            if let Some(limit) = query.limit {
                docs.truncate(limit);
            }
            Ok(docs)
        }

        async fn set(&self, collection: Collection, id: &str, body: Value) -> AppResult<()> {
            let mut state = self.state.lock();
            Self::check_write(&state, collection)?;
            state
                .collections
                .entry(collection)
                .or_default()
                .insert(id.to_string(), body);
            Ok(())
        }

        async fn update(&self, collection: Collection, id: &str, fields: Value) -> AppResult<()> {
            let mut state = self.state.lock();
            Self::check_write(&state, collection)?;
            let existing = state
                .collections
                .get_mut(&collection)
                .and_then(|docs| docs.get_mut(id))
                .ok_or_else(|| {
                    AppError::StoreWrite(format!("{}/{} does not exist", collection.as_str(), id))
                })?;
            merge_fields(existing, fields);
            Ok(())
        }

        async fn add(&self, collection: Collection, body: Value) -> AppResult<String> {
            let mut state = self.state.lock();
            Self::check_write(&state, collection)?;
            let id = Uuid::new_v4().to_string();
            state
                .collections
                .entry(collection)
                .or_default()
                .insert(id.clone(), body);
            Ok(id)
        }

        async fn delete(&self, collection: Collection, id: &str) -> AppResult<()> {
            let mut state = self.state.lock();
            Self::check_write(&state, collection)?;
            if let Some(docs) = state.collections.get_mut(&collection) {
                docs.remove(id);
            }
            Ok(())
        }
    }

    fn merge_fields(target: &mut Value, fields: Value) {
        match (target, fields) {
            (Value::Object(existing), Value::Object(updates)) => {
                for (key, value) in updates {
                    existing.insert(key, value);
                }
            }
            (target, fields) => *target = fields,
        }
    }

    fn matches_predicate(body: &Value, predicate: Option<&Predicate>) -> bool {
        match predicate {
            None => true,
            Some(Predicate::Eq(field, expected)) => body.get(field) == Some(expected),
            Some(Predicate::ArrayContains(field, expected)) => body
                .get(field)
                .and_then(Value::as_array)
                .is_some_and(|items| items.contains(expected)),
        }
    }

    /// Missing and null sort first; numbers before strings.
    fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
        fn rank(value: Option<&Value>) -> u8 {
            match value {
                None | Some(Value::Null) => 0,
                Some(Value::Bool(_)) => 1,
                Some(Value::Number(_)) => 2,
                Some(Value::String(_)) => 3,
                Some(_) => 4,
            }
        }

        match (a, b) {
            (Some(Value::Number(x)), Some(Value::Number(y))) => {
                let x = x.as_f64().unwrap_or(0.0);
                let y = y.as_f64().unwrap_or(0.0);
                x.partial_cmp(&y).unwrap_or(Ordering::Equal)
            }
            (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
            (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
            _ => rank(a).cmp(&rank(b)),
        }
    }
}

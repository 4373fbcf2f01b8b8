use std::sync::Arc;

use crate::firestore::core::{
    Bound, Direction, FilterOperator, LimitType, ListenOptions, ListenerRegistration, Query as CoreQuery,
    QueryObserver, Source, ViewSnapshot,
};
use crate::firestore::error::{invalid_argument, FirestoreResult};
use crate::firestore::model::IntoFieldPath;
use crate::firestore::value::FirestoreValue;

use super::database::Firestore;
use super::snapshot::QuerySnapshot;

/// A query bound to a database handle. Builders return new queries; the
/// original is left untouched.
#[derive(Clone, Debug)]
pub struct Query {
    firestore: Firestore,
    query: CoreQuery,
}

impl Query {
    pub(crate) fn from_core(firestore: Firestore, query: CoreQuery) -> Self {
        Self { firestore, query }
    }

    pub(crate) fn collection_group(firestore: Firestore, collection_id: &str) -> FirestoreResult<Self> {
        Ok(Self::from_core(firestore, CoreQuery::collection_group(collection_id)?))
    }

    pub fn firestore(&self) -> &Firestore {
        &self.firestore
    }

    /// The engine-level query this handle wraps.
    pub fn core_query(&self) -> &CoreQuery {
        &self.query
    }

    fn with(&self, query: CoreQuery) -> Self {
        Self::from_core(self.firestore.clone(), query)
    }

    pub fn where_field(
        &self,
        field: impl IntoFieldPath,
        operator: FilterOperator,
        value: impl Into<FirestoreValue>,
    ) -> FirestoreResult<Self> {
        Ok(self.with(self.query.clone().filter(field, operator, value)?))
    }

    pub fn order_by(&self, field: impl IntoFieldPath, direction: Direction) -> FirestoreResult<Self> {
        Ok(self.with(self.query.clone().order_by(field, direction)?))
    }

    pub fn limit(&self, limit: u32) -> FirestoreResult<Self> {
        if limit == 0 {
            return Err(invalid_argument("Function limit() requires a positive number."));
        }
        Ok(self.with(self.query.clone().limit_to_first(limit)))
    }

    /// Keeps the last `limit` documents. Needs at least one explicit
    /// `order_by` by the time the query runs.
    pub fn limit_to_last(&self, limit: u32) -> FirestoreResult<Self> {
        if limit == 0 {
            return Err(invalid_argument("Function limitToLast() requires a positive number."));
        }
        Ok(self.with(self.query.clone().limit_to_last(limit)))
    }

    /// Starts at the documents matching `values` in order-by order.
    pub fn start_at(&self, values: Vec<FirestoreValue>) -> FirestoreResult<Self> {
        self.with_bound(values, true, true)
    }

    pub fn start_after(&self, values: Vec<FirestoreValue>) -> FirestoreResult<Self> {
        self.with_bound(values, false, true)
    }

    pub fn end_at(&self, values: Vec<FirestoreValue>) -> FirestoreResult<Self> {
        self.with_bound(values, true, false)
    }

    pub fn end_before(&self, values: Vec<FirestoreValue>) -> FirestoreResult<Self> {
        self.with_bound(values, false, false)
    }

    fn with_bound(&self, values: Vec<FirestoreValue>, inclusive: bool, start: bool) -> FirestoreResult<Self> {
        if values.len() > self.query.normalized_order_by().len() {
            return Err(invalid_argument(
                "Too many arguments provided to a cursor. The number of arguments must be less than or equal to the number of orderBy() clauses.",
            ));
        }
        let bound = Bound::new(values, inclusive);
        let query = if start {
            self.query.clone().start_at(bound)
        } else {
            self.query.clone().end_at(bound)
        };
        Ok(self.with(query))
    }

    fn validate_has_explicit_order_by_for_limit_to_last(&self) -> FirestoreResult<()> {
        if self.query.limit_type() == LimitType::Last && self.query.explicit_order_by().is_empty() {
            return Err(invalid_argument(
                "limitToLast() queries require specifying at least one orderBy() clause",
            ));
        }
        Ok(())
    }

    /// Runs the query against `source`.
    pub async fn get(&self, source: Source) -> FirestoreResult<QuerySnapshot> {
        self.validate_has_explicit_order_by_for_limit_to_last()?;
        let snapshot = self
            .firestore
            .client()
            .get_documents(&self.query, source)
            .await?;
        Ok(QuerySnapshot::new(self.clone(), snapshot))
    }

    /// Listens to the query. `observer` runs on the client's queue and must
    /// not block.
    pub async fn on_snapshot<O>(&self, options: ListenOptions, observer: O) -> FirestoreResult<ListenerRegistration>
    where
        O: Fn(FirestoreResult<QuerySnapshot>) + Send + Sync + 'static,
    {
        self.validate_has_explicit_order_by_for_limit_to_last()?;
        let query = self.clone();
        let observer: QueryObserver = Arc::new(move |result: FirestoreResult<ViewSnapshot>| {
            observer(result.map(|snapshot| QuerySnapshot::new(query.clone(), snapshot)));
        });
        self.firestore
            .client()
            .listen(self.query.clone(), options, observer)
            .await
    }
}

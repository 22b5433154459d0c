use parking_lot::Mutex;
use tracing::debug;

use crate::error::AppResult;
use crate::models::{Assignment, TestResult, UserProfile};
use crate::repo;
use crate::store::DocumentStore;

/// Read-through cache for one view's lifetime. Every write path must call the
/// matching `invalidate_*` before the next read.
pub struct ViewCache<'a> {
    store: &'a dyn DocumentStore,
    results: Mutex<Option<Vec<TestResult>>>,
    assignments: Mutex<Option<Vec<Assignment>>>,
    users: Mutex<Option<Vec<UserProfile>>>,
}

impl<'a> ViewCache<'a> {
    pub fn new(store: &'a dyn DocumentStore) -> Self {
        Self {
            store,
            results: Mutex::new(None),
            assignments: Mutex::new(None),
            users: Mutex::new(None),
        }
    }

    pub async fn results(&self) -> AppResult<Vec<TestResult>> {
        let cached = self.results.lock().clone();
        if let Some(cached) = cached {
            return Ok(cached);
        }
        let fresh = repo::list_results(self.store).await?;
        debug!(count = fresh.len(), "results cached");
        *self.results.lock() = Some(fresh.clone());
        Ok(fresh)
    }

    pub async fn assignments(&self) -> AppResult<Vec<Assignment>> {
        let cached = self.assignments.lock().clone();
        if let Some(cached) = cached {
            return Ok(cached);
        }
        let fresh = repo::list_assignments(self.store).await?;
        debug!(count = fresh.len(), "assignments cached");
        *self.assignments.lock() = Some(fresh.clone());
        Ok(fresh)
    }

    pub async fn users(&self) -> AppResult<Vec<UserProfile>> {
        let cached = self.users.lock().clone();
        if let Some(cached) = cached {
            return Ok(cached);
        }
        let fresh = repo::list_users(self.store).await?;
        debug!(count = fresh.len(), "users cached");
        *self.users.lock() = Some(fresh.clone());
        Ok(fresh)
    }

    pub fn invalidate_results(&self) {
        *self.results.lock() = None;
    }

    pub fn invalidate_assignments(&self) {
        *self.assignments.lock() = None;
    }

    pub fn invalidate_users(&self) {
        *self.users.lock() = None;
    }
}

use std::collections::{BTreeSet, HashSet};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::error::{AppError, AppResult};
use crate::models::{
    iso_timestamp, Assignment, Cohort, RetakePolicy, Role, TestResult, UserProfile,
};
use crate::store::{Collection, Document, DocumentStore, Order, Query};

fn decode<T: DeserializeOwned>(collection: Collection, doc: Document) -> AppResult<T> {
    serde_json::from_value(doc.body).map_err(|e| {
        AppError::StoreRead(format!("{}/{} is malformed: {e}", collection.as_str(), doc.id))
    })
}

/// Malformed documents are logged and skipped so one bad row cannot blank a view.
fn decode_all<T: DeserializeOwned>(collection: Collection, docs: Vec<Document>) -> Vec<T> {
    docs.into_iter()
        .filter_map(|doc| match decode(collection, doc) {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(error = %err, "skipping malformed document");
                None
            }
        })
        .collect()
}

fn to_body<T: serde::Serialize>(value: &T) -> AppResult<Value> {
    serde_json::to_value(value).map_err(|e| AppError::StoreWrite(e.to_string()))
}

// ---- users -------------------------------------------------------------

pub async fn is_teacher(store: &dyn DocumentStore, email: &str) -> AppResult<bool> {
    Ok(store.get(Collection::Teachers, email).await?.is_some())
}

/// `users` documents are keyed by email; older ones omit it from the body.
fn user_from_doc(mut doc: Document) -> AppResult<UserProfile> {
    if let Value::Object(fields) = &mut doc.body {
        if !fields.contains_key("email") {
            fields.insert("email".to_string(), Value::String(doc.id.clone()));
        }
    }
    decode(Collection::Users, doc)
}

pub async fn get_user(store: &dyn DocumentStore, email: &str) -> AppResult<Option<UserProfile>> {
    store
        .get(Collection::Users, email)
        .await?
        .map(user_from_doc)
        .transpose()
}

pub async fn create_user(
    store: &dyn DocumentStore,
    profile: &UserProfile,
    now: DateTime<Utc>,
) -> AppResult<()> {
    let mut body = to_body(profile)?;
    body["createdAt"] = json!(iso_timestamp(&now));
    store.set(Collection::Users, &profile.email, body).await?;
    info!(email = %profile.email, role = ?profile.role, "user profile created");
    Ok(())
}

/// Role and roster fields the profile form may change. Teachers always clear grade/class/number.
#[derive(Debug, Clone, PartialEq)]
pub struct ProfileUpdate {
    pub role: Role,
    pub grade: Option<u32>,
    pub class: Option<u32>,
    pub student_number: Option<u32>,
}

impl ProfileUpdate {
    pub fn apply(&self, profile: &mut UserProfile) {
        profile.role = Some(self.role);
        profile.grade = self.grade;
        profile.class = self.class;
        profile.student_number = self.student_number;
    }
}

pub async fn update_user(
    store: &dyn DocumentStore,
    email: &str,
    update: &ProfileUpdate,
    now: DateTime<Utc>,
) -> AppResult<()> {
    let fields = json!({
        "role": update.role,
        "grade": update.grade,
        "class": update.class,
        "studentNumber": update.student_number,
        "updatedAt": iso_timestamp(&now),
    });
    store.update(Collection::Users, email, fields).await?;
    info!(email, role = %update.role, "user profile updated");
    Ok(())
}

pub async fn list_users(store: &dyn DocumentStore) -> AppResult<Vec<UserProfile>> {
    let docs = store
        .query(Collection::Users, &Query::all().order_by("name", Order::Asc))
        .await?;
    Ok(decode_users(docs))
}

fn decode_users(docs: Vec<Document>) -> Vec<UserProfile> {
    docs.into_iter()
        .filter_map(|doc| match user_from_doc(doc) {
            Ok(user) => Some(user),
            Err(err) => {
                warn!(error = %err, "skipping malformed user");
                None
            }
        })
        .collect()
}

pub async fn list_students(store: &dyn DocumentStore) -> AppResult<Vec<UserProfile>> {
    let docs = store
        .query(Collection::Users, &Query::all().where_eq("role", "student"))
        .await?;
    Ok(decode_users(docs))
}

/// Distinct `"{grade}-{class}"` strings among students, sorted as strings.
pub fn derive_cohorts(profiles: &[UserProfile]) -> Vec<String> {
    profiles
        .iter()
        .filter(|p| p.is_student())
        .filter_map(UserProfile::cohort)
        .map(|cohort| cohort.to_string())
        .collect::<BTreeSet<String>>()
        .into_iter()
        .collect()
}

pub async fn fetch_student_cohorts(store: &dyn DocumentStore) -> AppResult<Vec<String>> {
    let students = list_students(store).await?;
    Ok(derive_cohorts(&students))
}

// ---- assignments -------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Default)]
pub struct AssignmentDraft {
    pub title: String,
    pub description: String,
    pub questions: Vec<String>,
    pub assigned_classes: Vec<String>,
    pub retake_policy: RetakePolicy,
}

impl AssignmentDraft {
    /// Trims text fields and checks the save invariants before any write.
    pub fn validate(mut self) -> AppResult<Self> {
        self.title = self.title.trim().to_string();
        self.description = self.description.trim().to_string();
        if self.title.is_empty() {
            return Err(AppError::Validation("title is required".into()));
        }
        if self.assigned_classes.is_empty() {
            return Err(AppError::Validation("select at least one class".into()));
        }
        for class in &self.assigned_classes {
            class
                .parse::<Cohort>()
                .map_err(AppError::Validation)?;
        }
        if self.questions.iter().all(|q| q.trim().is_empty()) {
            return Err(AppError::Validation("select at least one question".into()));
        }
        self.questions.retain(|q| !q.trim().is_empty());
        Ok(self)
    }
}

fn assignment_from_doc(doc: Document) -> AppResult<Assignment> {
    let id = doc.id.clone();
    let mut assignment: Assignment = decode(Collection::Assignments, doc)?;
    assignment.id = id;
    Ok(assignment)
}

fn assignments_from_docs(docs: Vec<Document>) -> Vec<Assignment> {
    docs.into_iter()
        .filter_map(|doc| match assignment_from_doc(doc) {
            Ok(assignment) => Some(assignment),
            Err(err) => {
                warn!(error = %err, "skipping malformed assignment");
                None
            }
        })
        .collect()
}

pub async fn list_assignments(store: &dyn DocumentStore) -> AppResult<Vec<Assignment>> {
    let docs = store
        .query(
            Collection::Assignments,
            &Query::all().order_by("updatedAt", Order::Desc),
        )
        .await?;
    Ok(assignments_from_docs(docs))
}

pub async fn list_assignments_for_cohort(
    store: &dyn DocumentStore,
    cohort: Cohort,
) -> AppResult<Vec<Assignment>> {
    let docs = store
        .query(
            Collection::Assignments,
            &Query::all().array_contains("assignedClasses", cohort.to_string()),
        )
        .await?;
    Ok(assignments_from_docs(docs))
}

/// Creates when `editing_id` is `None`, otherwise updates in place. Returns the document id.
pub async fn save_assignment(
    store: &dyn DocumentStore,
    editing_id: Option<&str>,
    draft: AssignmentDraft,
    creator: &UserProfile,
    now: DateTime<Utc>,
) -> AppResult<String> {
    let draft = draft.validate()?;
    let stamp = iso_timestamp(&now);
    let mut fields = json!({
        "title": draft.title,
        "description": draft.description,
        "questions": draft.questions,
        "assignedClasses": draft.assigned_classes,
        "retakePolicy": draft.retake_policy,
        "updatedAt": stamp,
    });

    match editing_id {
        Some(id) => {
            store.update(Collection::Assignments, id, fields).await?;
            info!(id, "assignment updated");
            Ok(id.to_string())
        }
        None => {
            fields["createdAt"] = json!(stamp);
            fields["creatorName"] = json!(creator.name);
            fields["creatorEmail"] = json!(creator.email);
            let id = store.add(Collection::Assignments, fields).await?;
            info!(id = %id, "assignment created");
            Ok(id)
        }
    }
}

pub async fn delete_assignment(store: &dyn DocumentStore, id: &str) -> AppResult<()> {
    store.delete(Collection::Assignments, id).await?;
    info!(id, "assignment deleted");
    Ok(())
}

// ---- results -----------------------------------------------------------

pub async fn list_results(store: &dyn DocumentStore) -> AppResult<Vec<TestResult>> {
    let docs = store
        .query(
            Collection::TestResults,
            &Query::all().order_by("completedAt", Order::Desc),
        )
        .await?;
    Ok(decode_all(Collection::TestResults, docs))
}

pub async fn list_results_for_student(
    store: &dyn DocumentStore,
    email: &str,
) -> AppResult<Vec<TestResult>> {
    let docs = store
        .query(
            Collection::TestResults,
            &Query::all().where_eq("studentEmail", email),
        )
        .await?;
    Ok(decode_all(Collection::TestResults, docs))
}

pub async fn submit_result(store: &dyn DocumentStore, result: &TestResult) -> AppResult<String> {
    let id = store.add(Collection::TestResults, to_body(result)?).await?;
    info!(
        id = %id,
        student = %result.student_email,
        title = %result.test_title,
        "test result stored"
    );
    Ok(id)
}

// ---- retake policy -----------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AssignmentBoard {
    pub available: Vec<Assignment>,
    pub completed: Vec<Assignment>,
}

/// Splits a student's assignments by prior attempts, joined on title.
/// `once` assignments with a prior result only show as completed; `multiple`
/// ones stay available and also show as completed once attempted.
pub fn partition_by_retake(assignments: &[Assignment], history: &[TestResult]) -> AssignmentBoard {
    let attempted: HashSet<&str> = history.iter().map(|r| r.test_title.as_str()).collect();
    let mut board = AssignmentBoard::default();

    for assignment in assignments {
        let done = attempted.contains(assignment.title.as_str());
        match (assignment.retake_policy, done) {
            (_, false) => board.available.push(assignment.clone()),
            (RetakePolicy::Once, true) => board.completed.push(assignment.clone()),
            (RetakePolicy::Multiple, true) => {
                board.available.push(assignment.clone());
                board.completed.push(assignment.clone());
            }
        }
    }
    board
}

pub async fn student_board(
    store: &dyn DocumentStore,
    student: &UserProfile,
) -> AppResult<AssignmentBoard> {
    let Some(cohort) = student.cohort().filter(|_| student.is_student()) else {
        return Ok(AssignmentBoard::default());
    };
    let assignments = list_assignments_for_cohort(store, cohort).await?;
    let history = list_results_for_student(store, &student.email).await?;
    Ok(partition_by_retake(&assignments, &history))
}

use std::cmp::Ordering;
use std::str::FromStr;

use crate::error::AppError;
use crate::models::{Assignment, Cohort, Role, TestResult, UserProfile};

/// Filter value; `All` disables the filter. Built from an optional flag, so no
/// title or class name is reserved as a sentinel.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Selection<T> {
    #[default]
    All,
    Only(T),
}

impl<T> Selection<T> {
    pub fn matches(&self, predicate: impl FnOnce(&T) -> bool) -> bool {
        match self {
            Selection::All => true,
            Selection::Only(value) => predicate(value),
        }
    }
}

impl<T> From<Option<T>> for Selection<T> {
    fn from(value: Option<T>) -> Self {
        value.map_or(Selection::All, Selection::Only)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultFilters {
    pub assignment: Selection<String>,
    pub cohort: Selection<Cohort>,
    /// Matched against `creatorName` of assignments sharing the result's title.
    pub creator: Selection<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Asc,
    Desc,
}

impl SortDirection {
    pub fn flip(self) -> Self {
        match self {
            SortDirection::Asc => SortDirection::Desc,
            SortDirection::Desc => SortDirection::Asc,
        }
    }

    pub fn indicator(self) -> &'static str {
        match self {
            SortDirection::Asc => "▲",
            SortDirection::Desc => "▼",
        }
    }
}

impl FromStr for SortDirection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "asc" => Ok(SortDirection::Asc),
            "desc" => Ok(SortDirection::Desc),
            other => Err(format!("unknown sort direction '{other}'")),
        }
    }
}

pub const RESULTS_DEFAULT_DIRECTION: SortDirection = SortDirection::Desc;
pub const USERS_DEFAULT_DIRECTION: SortDirection = SortDirection::Asc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SortState<K> {
    pub key: K,
    pub direction: SortDirection,
}

impl<K: PartialEq + Copy> SortState<K> {
    pub fn new(key: K, direction: SortDirection) -> Self {
        Self { key, direction }
    }

    /// Same key flips direction; a new key starts at the table's default.
    pub fn toggle(&mut self, key: K, default_direction: SortDirection) {
        if self.key == key {
            self.direction = self.direction.flip();
        } else {
            self.key = key;
            self.direction = default_direction;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultSortKey {
    CompletedAt,
    StudentGrade,
    StudentClass,
    StudentNumber,
    StudentName,
    TestTitle,
    Pronunciation,
    Fluency,
    Intonation,
    Total,
}

impl FromStr for ResultSortKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim() {
            "completedAt" => ResultSortKey::CompletedAt,
            "studentGrade" => ResultSortKey::StudentGrade,
            "studentClass" => ResultSortKey::StudentClass,
            "studentNumber" => ResultSortKey::StudentNumber,
            "studentName" => ResultSortKey::StudentName,
            "testTitle" => ResultSortKey::TestTitle,
            "pronunciation" => ResultSortKey::Pronunciation,
            "fluency" => ResultSortKey::Fluency,
            "intonation" => ResultSortKey::Intonation,
            "total" => ResultSortKey::Total,
            other => return Err(format!("unknown sort key '{other}'")),
        })
    }
}

impl Default for SortState<ResultSortKey> {
    fn default() -> Self {
        SortState::new(ResultSortKey::CompletedAt, RESULTS_DEFAULT_DIRECTION)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum SortValue {
    Number(f64),
    Text(String),
}

impl SortValue {
    fn compare(&self, other: &SortValue) -> Ordering {
        match (self, other) {
            (SortValue::Number(a), SortValue::Number(b)) => {
                a.partial_cmp(b).unwrap_or(Ordering::Equal)
            }
            (SortValue::Text(a), SortValue::Text(b)) => a.cmp(b),
            (SortValue::Number(_), SortValue::Text(_)) => Ordering::Less,
            (SortValue::Text(_), SortValue::Number(_)) => Ordering::Greater,
        }
    }
}

fn number(value: Option<u32>) -> SortValue {
    SortValue::Number(value.map(f64::from).unwrap_or(0.0))
}

fn result_sort_value(result: &TestResult, key: ResultSortKey) -> SortValue {
    match key {
        ResultSortKey::CompletedAt => {
            SortValue::Number(result.completed_at.timestamp_millis() as f64)
        }
        ResultSortKey::StudentGrade => number(result.student_grade),
        ResultSortKey::StudentClass => number(result.student_class),
        ResultSortKey::StudentNumber => number(result.student_number),
        ResultSortKey::StudentName => SortValue::Text(result.student_name.clone()),
        ResultSortKey::TestTitle => SortValue::Text(result.test_title.clone()),
        ResultSortKey::Pronunciation => SortValue::Number(result.scores.pronunciation),
        ResultSortKey::Fluency => SortValue::Number(result.scores.fluency),
        ResultSortKey::Intonation => SortValue::Number(result.scores.intonation),
        ResultSortKey::Total => SortValue::Number(result.total()),
    }
}

fn directed(ordering: Ordering, direction: SortDirection) -> Ordering {
    match direction {
        SortDirection::Asc => ordering,
        SortDirection::Desc => ordering.reverse(),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResultRow {
    pub result: TestResult,
    pub total: f64,
}

pub fn filter_results<'a>(
    results: &'a [TestResult],
    filters: &ResultFilters,
    assignments: &[Assignment],
) -> Vec<&'a TestResult> {
    results
        .iter()
        .filter(|r| filters.assignment.matches(|title| &r.test_title == title))
        .filter(|r| filters.cohort.matches(|cohort| r.cohort() == Some(*cohort)))
        .filter(|r| {
            filters.creator.matches(|creator| {
                assignments.iter().any(|a| {
                    a.title == r.test_title && a.creator_name.as_deref() == Some(creator.as_str())
                })
            })
        })
        .collect()
}

/// Filtered, stably sorted projection with the derived total.
pub fn render_results(
    results: &[TestResult],
    filters: &ResultFilters,
    sort: &SortState<ResultSortKey>,
    assignments: &[Assignment],
) -> Vec<ResultRow> {
    let mut rows: Vec<ResultRow> = filter_results(results, filters, assignments)
        .into_iter()
        .map(|r| ResultRow {
            result: r.clone(),
            total: r.total(),
        })
        .collect();

    rows.sort_by(|a, b| {
        let ordering = result_sort_value(&a.result, sort.key)
            .compare(&result_sort_value(&b.result, sort.key));
        directed(ordering, sort.direction)
    });
    rows
}

/// What a table region shows. `Loading` is the state before the first fetch resolves.
#[derive(Debug, Clone, PartialEq)]
pub enum TableView<T> {
    Loading,
    Failed(String),
    Empty,
    Rows(Vec<T>),
}

impl<T> TableView<T> {
    pub fn from_load(loaded: Result<Vec<T>, AppError>) -> Self {
        match loaded {
            Ok(rows) if rows.is_empty() => TableView::Empty,
            Ok(rows) => TableView::Rows(rows),
            Err(err) => TableView::Failed(err.to_string()),
        }
    }
}

// ---- users table -------------------------------------------------------

const MISSING_ROSTER_NUMBER: u32 = 99;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserSortKey {
    Name,
    Email,
    Role,
    Grade,
    Class,
    StudentNumber,
}

impl FromStr for UserSortKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim() {
            "name" => UserSortKey::Name,
            "email" => UserSortKey::Email,
            "role" => UserSortKey::Role,
            "grade" => UserSortKey::Grade,
            "class" => UserSortKey::Class,
            "studentNumber" => UserSortKey::StudentNumber,
            other => return Err(format!("unknown sort key '{other}'")),
        })
    }
}

/// Case-insensitive first, then exact, so "abe" and "Abe" sit together.
fn collate(a: &str, b: &str) -> Ordering {
    a.to_lowercase()
        .cmp(&b.to_lowercase())
        .then_with(|| a.cmp(b))
}

/// Default roster order: teachers first, then grade, class, number, name.
pub fn roster_order(a: &UserProfile, b: &UserProfile) -> Ordering {
    let is_teacher = |u: &UserProfile| u.role == Some(Role::Teacher);
    let slot = |v: Option<u32>| v.unwrap_or(MISSING_ROSTER_NUMBER);

    is_teacher(b)
        .cmp(&is_teacher(a))
        .then_with(|| slot(a.grade).cmp(&slot(b.grade)))
        .then_with(|| slot(a.class).cmp(&slot(b.class)))
        .then_with(|| slot(a.student_number).cmp(&slot(b.student_number)))
        .then_with(|| collate(&a.name, &b.name))
}

fn user_sort_value(user: &UserProfile, key: UserSortKey) -> SortValue {
    match key {
        UserSortKey::Name => SortValue::Text(user.name.clone()),
        UserSortKey::Email => SortValue::Text(user.email.clone()),
        UserSortKey::Role => SortValue::Text(user.role.map(|r| r.to_string()).unwrap_or_default()),
        UserSortKey::Grade => number(user.grade),
        UserSortKey::Class => number(user.class),
        UserSortKey::StudentNumber => number(user.student_number),
    }
}

pub fn sort_users(users: &mut [UserProfile], sort: Option<&SortState<UserSortKey>>) {
    match sort {
        None => users.sort_by(roster_order),
        Some(state) => users.sort_by(|a, b| {
            let ordering = match state.key {
                UserSortKey::Name => collate(&a.name, &b.name),
                key => user_sort_value(a, key).compare(&user_sort_value(b, key)),
            };
            directed(ordering, state.direction)
        }),
    }
}

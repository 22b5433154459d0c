use anyhow::Context;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde_json::{json, Value};
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use tracing::{error, info};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::models::{Assignment, RetakePolicy, Role, Scores, TestResult, UserProfile};
use crate::store::{Collection, Document, DocumentStore, Order, Predicate, Query};

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Documents live in one JSONB table keyed by (collection, id).
#[derive(Clone)]
pub struct PgDocumentStore {
    pool: PgPool,
}

impl PgDocumentStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn read_error(collection: Collection, err: sqlx::Error) -> AppError {
    error!(collection = collection.as_str(), error = %err, "document read failed");
    AppError::StoreRead(err.to_string())
}

fn write_error(collection: Collection, err: sqlx::Error) -> AppError {
    error!(collection = collection.as_str(), error = %err, "document write failed");
    AppError::StoreWrite(err.to_string())
}

#[async_trait]
impl DocumentStore for PgDocumentStore {
    async fn get(&self, collection: Collection, id: &str) -> AppResult<Option<Document>> {
        let row = sqlx::query(
            "SELECT id, body FROM speakup.documents WHERE collection = $1 AND id = $2",
        )
        .bind(collection.as_str())
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| read_error(collection, e))?;

        Ok(row.map(|row| Document {
            id: row.get("id"),
            body: row.get("body"),
        }))
    }

    async fn query(&self, collection: Collection, query: &Query) -> AppResult<Vec<Document>> {
        let mut builder: QueryBuilder<Postgres> =
            QueryBuilder::new("SELECT id, body FROM speakup.documents WHERE collection = ");
        builder.push_bind(collection.as_str());

        match &query.filter {
            Some(Predicate::Eq(field, value)) => {
                builder.push(" AND body -> ");
                builder.push_bind(field.clone());
                builder.push(" = ");
                builder.push_bind(value.clone());
            }
            Some(Predicate::ArrayContains(field, value)) => {
                builder.push(" AND body -> ");
                builder.push_bind(field.clone());
                builder.push(" @> ");
                builder.push_bind(json!([value]));
            }
            None => {}
        }

        match &query.order_by {
            Some((field, order)) => {
                builder.push(" ORDER BY body -> ");
                builder.push_bind(field.clone());
                builder.push(match order {
                    Order::Asc => " ASC NULLS FIRST, id",
                    Order::Desc => " DESC NULLS LAST, id",
                });
            }
            None => {
                builder.push(" ORDER BY id");
            }
        }

        if let Some(limit) = query.limit {
            builder.push(" LIMIT ");
            builder.push_bind(limit as i64);
        }

        let rows = builder
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| read_error(collection, e))?;

        Ok(rows
            .into_iter()
            .map(|row| Document {
                id: row.get("id"),
                body: row.get("body"),
            })
            .collect())
    }

    async fn set(&self, collection: Collection, id: &str, body: Value) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO speakup.documents (collection, id, body)
            VALUES ($1, $2, $3)
            ON CONFLICT (collection, id) DO UPDATE
            SET body = EXCLUDED.body, updated_at = now()
            "#,
        )
        .bind(collection.as_str())
        .bind(id)
        .bind(body)
        .execute(&self.pool)
        .await
        .map_err(|e| write_error(collection, e))?;
        Ok(())
    }

    async fn update(&self, collection: Collection, id: &str, fields: Value) -> AppResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE speakup.documents
            SET body = body || $3, updated_at = now()
            WHERE collection = $1 AND id = $2
            "#,
        )
        .bind(collection.as_str())
        .bind(id)
        .bind(fields)
        .execute(&self.pool)
        .await
        .map_err(|e| write_error(collection, e))?;

        if result.rows_affected() == 0 {
            return Err(AppError::StoreWrite(format!(
                "{}/{} does not exist",
                collection.as_str(),
                id
            )));
        }
        Ok(())
    }

    async fn add(&self, collection: Collection, body: Value) -> AppResult<String> {
        let id = Uuid::new_v4().to_string();
        self.set(collection, &id, body).await?;
        Ok(id)
    }

    async fn delete(&self, collection: Collection, id: &str) -> AppResult<()> {
        sqlx::query("DELETE FROM speakup.documents WHERE collection = $1 AND id = $2")
            .bind(collection.as_str())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| write_error(collection, e))?;
        Ok(())
    }
}

pub async fn seed(store: &dyn DocumentStore) -> anyhow::Result<()> {
    let now = Utc::now();

    store
        .set(
            Collection::Teachers,
            "yamada.sensei@school.example.jp",
            json!({ "name": "山田 先生" }),
        )
        .await?;

    let teacher = UserProfile {
        email: "yamada.sensei@school.example.jp".to_string(),
        name: "山田 先生".to_string(),
        picture: String::new(),
        role: Some(Role::Teacher),
        grade: None,
        class: None,
        student_number: None,
    };
    store
        .set(Collection::Users, &teacher.email, serde_json::to_value(&teacher)?)
        .await?;

    let students = vec![
        ("Aoi Tanaka", "aoi.tanaka@school.example.jp", 2, 3, 1),
        ("Haruto Sato", "haruto.sato@school.example.jp", 2, 3, 2),
        ("Mei Suzuki", "mei.suzuki@school.example.jp", 2, 4, 1),
        ("Ren Ito", "ren.ito@school.example.jp", 1, 1, 5),
    ];
    for (name, email, grade, class, number) in &students {
        let profile = UserProfile {
            email: email.to_string(),
            name: name.to_string(),
            picture: String::new(),
            role: Some(Role::Student),
            grade: Some(*grade),
            class: Some(*class),
            student_number: Some(*number),
        };
        store
            .set(Collection::Users, email, serde_json::to_value(&profile)?)
            .await?;
    }

    let assignments = vec![
        (
            "seed-lesson-1",
            "Lesson 1",
            "Greetings and introductions",
            vec!["Nice to meet you.", "My name is Aoi."],
            vec!["2-3", "2-4"],
            RetakePolicy::Once,
        ),
        (
            "seed-lesson-2",
            "Lesson 2",
            "Talking about your hometown",
            vec!["My hometown today is different from what it was 15 years ago."],
            vec!["2-3"],
            RetakePolicy::Multiple,
        ),
    ];
    for (id, title, description, questions, classes, policy) in assignments {
        let assignment = Assignment {
            id: id.to_string(),
            title: title.to_string(),
            description: description.to_string(),
            questions: questions.into_iter().map(String::from).collect(),
            assigned_classes: classes.into_iter().map(String::from).collect(),
            retake_policy: policy,
            creator_name: Some(teacher.name.clone()),
            creator_email: Some(teacher.email.clone()),
            created_at: Some(now - Duration::days(14)),
            updated_at: Some(now - Duration::days(14)),
        };
        store
            .set(Collection::Assignments, id, serde_json::to_value(&assignment)?)
            .await?;
    }

    let results = vec![
        ("seed-result-001", 0, "Lesson 1", (8.0, 7.0, 6.0), Duration::hours(2)),
        ("seed-result-002", 2, "Lesson 1", (6.5, 5.0, 5.5), Duration::days(3)),
        ("seed-result-003", 0, "Lesson 2", (8.5, 8.0, 7.5), Duration::days(10)),
    ];
    for (id, student_index, title, (p, f, i), ago) in results {
        let (name, email, grade, class, number) = students
            .get(student_index)
            .context("seed result references an unknown student")?;
        let result = TestResult {
            student_email: email.to_string(),
            student_name: name.to_string(),
            student_grade: Some(*grade),
            student_class: Some(*class),
            student_number: Some(*number),
            test_title: title.to_string(),
            completed_at: now - ago,
            scores: Scores {
                pronunciation: p,
                fluency: f,
                intonation: i,
            },
        };
        store
            .set(Collection::TestResults, id, serde_json::to_value(&result)?)
            .await?;
    }

    info!(students = students.len(), "seed data written");
    Ok(())
}

pub async fn import_roster(
    store: &dyn DocumentStore,
    csv_path: &std::path::Path,
) -> anyhow::Result<usize> {
    #[derive(serde::Deserialize)]
    struct CsvRow {
        name: String,
        email: String,
        grade: u32,
        class: u32,
        student_number: u32,
    }

    let mut reader = csv::Reader::from_path(csv_path)?;
    let mut imported = 0usize;

    for result in reader.deserialize::<CsvRow>() {
        let row = result?;
        let email = row.email.trim().to_ascii_lowercase();
        if email.is_empty() || row.grade == 0 || row.class == 0 || row.student_number == 0 {
            anyhow::bail!("roster row for '{}' has an empty email or a zero number", row.name);
        }

        let existing = store.get(Collection::Users, &email).await?;
        let picture = existing
            .as_ref()
            .and_then(|doc| doc.body.get("picture"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let profile = UserProfile {
            email: email.clone(),
            name: row.name.trim().to_string(),
            picture,
            role: Some(Role::Student),
            grade: Some(row.grade),
            class: Some(row.class),
            student_number: Some(row.student_number),
        };
        store
            .set(Collection::Users, &email, serde_json::to_value(&profile)?)
            .await?;
        imported += 1;
    }

    Ok(imported)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::io::Write;

    #[tokio::test]
    async fn seed_is_idempotent() {
        let store = MemoryStore::new();
        seed(&store).await.unwrap();
        seed(&store).await.unwrap();
        assert_eq!(store.len(Collection::Users), 5);
        assert_eq!(store.len(Collection::Assignments), 2);
        assert_eq!(store.len(Collection::TestResults), 3);
        assert_eq!(store.len(Collection::Teachers), 1);
    }

    #[tokio::test]
    async fn roster_import_upserts_students() {
        let store = MemoryStore::new();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "name,email,grade,class,student_number").unwrap();
        writeln!(file, "Aoi Tanaka,Aoi.Tanaka@school.example.jp,2,3,1").unwrap();
        writeln!(file, "Haruto Sato,haruto.sato@school.example.jp,2,3,2").unwrap();
        file.flush().unwrap();

        let imported = import_roster(&store, file.path()).await.unwrap();
        assert_eq!(imported, 2);
        let doc = store
            .get(Collection::Users, "aoi.tanaka@school.example.jp")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(doc.body["role"], "student");
        assert_eq!(doc.body["studentNumber"], 1);
    }

    #[tokio::test]
    async fn roster_import_rejects_zero_numbers() {
        let store = MemoryStore::new();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "name,email,grade,class,student_number").unwrap();
        writeln!(file, "Aoi Tanaka,aoi@school.example.jp,0,3,1").unwrap();
        file.flush().unwrap();

        assert!(import_roster(&store, file.path()).await.is_err());
    }
}

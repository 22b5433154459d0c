use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Student,
    Teacher,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Student => write!(f, "student"),
            Role::Teacher => write!(f, "teacher"),
        }
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "student" => Ok(Role::Student),
            "teacher" => Ok(Role::Teacher),
            other => Err(format!("unknown role '{other}'")),
        }
    }
}

/// Stored under `users/{email}`. Students carry grade, class and number together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub email: String,
    pub name: String,
    #[serde(default)]
    pub picture: String,
    #[serde(default)]
    pub role: Option<Role>,
    #[serde(default)]
    pub grade: Option<u32>,
    #[serde(default)]
    pub class: Option<u32>,
    #[serde(default)]
    pub student_number: Option<u32>,
}

impl UserProfile {
    pub fn is_student(&self) -> bool {
        self.role == Some(Role::Student)
    }

    pub fn cohort(&self) -> Option<Cohort> {
        Cohort::from_parts(self.grade, self.class)
    }
}

/// A (grade, class) pair, serialized as `"{grade}-{class}"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Cohort {
    pub grade: u32,
    pub class: u32,
}

impl Cohort {
    /// Zero counts as unset, matching how stored profiles treat blank numbers.
    pub fn from_parts(grade: Option<u32>, class: Option<u32>) -> Option<Self> {
        match (grade, class) {
            (Some(grade), Some(class)) if grade > 0 && class > 0 => Some(Self { grade, class }),
            _ => None,
        }
    }

    pub fn label(&self) -> String {
        format!("{}年{}組", self.grade, self.class)
    }
}

impl fmt::Display for Cohort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.grade, self.class)
    }
}

impl FromStr for Cohort {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (grade, class) = s
            .trim()
            .split_once('-')
            .ok_or_else(|| format!("cohort '{s}' must look like GRADE-CLASS"))?;
        let grade: u32 = grade
            .parse()
            .map_err(|_| format!("invalid grade in cohort '{s}'"))?;
        let class: u32 = class
            .parse()
            .map_err(|_| format!("invalid class in cohort '{s}'"))?;
        Cohort::from_parts(Some(grade), Some(class))
            .ok_or_else(|| format!("cohort '{s}' needs positive grade and class"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetakePolicy {
    #[default]
    Once,
    Multiple,
}

impl FromStr for RetakePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "once" => Ok(RetakePolicy::Once),
            "multiple" => Ok(RetakePolicy::Multiple),
            other => Err(format!("unknown retake policy '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Assignment {
    /// Document id; never part of the stored body.
    #[serde(skip)]
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub questions: Vec<String>,
    #[serde(default)]
    pub assigned_classes: Vec<String>,
    #[serde(default)]
    pub retake_policy: RetakePolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creator_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creator_email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "iso_millis::option")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "iso_millis::option")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Per-dimension scores on a 0–10 scale. Missing dimensions read as 0.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Scores {
    #[serde(default)]
    pub pronunciation: f64,
    #[serde(default)]
    pub fluency: f64,
    #[serde(default)]
    pub intonation: f64,
}

impl Scores {
    pub fn total(&self) -> f64 {
        self.pronunciation + self.fluency + self.intonation
    }

    /// Per-dimension mean, each rounded to one decimal. `None` for an empty slice.
    pub fn rounded_mean(samples: &[Scores]) -> Option<Scores> {
        if samples.is_empty() {
            return None;
        }
        let n = samples.len() as f64;
        let sum = samples.iter().fold(Scores::default(), |acc, s| Scores {
            pronunciation: acc.pronunciation + s.pronunciation,
            fluency: acc.fluency + s.fluency,
            intonation: acc.intonation + s.intonation,
        });
        Some(Scores {
            pronunciation: round1(sum.pronunciation / n),
            fluency: round1(sum.fluency / n),
            intonation: round1(sum.intonation / n),
        })
    }
}

/// One row of `testResults`: the averaged outcome of a single test session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestResult {
    pub student_email: String,
    pub student_name: String,
    #[serde(default)]
    pub student_grade: Option<u32>,
    #[serde(default)]
    pub student_class: Option<u32>,
    #[serde(default)]
    pub student_number: Option<u32>,
    pub test_title: String,
    #[serde(with = "iso_millis")]
    pub completed_at: DateTime<Utc>,
    #[serde(default)]
    pub scores: Scores,
}

impl TestResult {
    pub fn total(&self) -> f64 {
        self.scores.total()
    }

    pub fn cohort(&self) -> Option<Cohort> {
        Cohort::from_parts(self.student_grade, self.student_class)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActivityEntry {
    pub student_name: String,
    pub test_title: String,
    pub total: f64,
    pub completed_at: DateTime<Utc>,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CohortPerformance {
    pub cohort: String,
    pub result_count: usize,
    pub pronunciation: f64,
    pub fluency: f64,
    pub intonation: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StudentAverage {
    pub student_email: String,
    pub student_name: String,
    pub average_total: f64,
    pub result_count: usize,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct DashboardMetrics {
    pub total_students: usize,
    pub total_assignments: usize,
    pub today_submissions: usize,
    pub weekly_active_students: usize,
    pub recent_average_score: f64,
    pub recent_activity: Vec<ActivityEntry>,
    pub class_performance: Vec<CohortPerformance>,
    pub struggling_students: Vec<StudentAverage>,
}

pub fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

pub fn iso_timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Fixed-width `YYYY-MM-DDTHH:MM:SS.mmmZ` so stored timestamps order as strings.
pub mod iso_millis {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(at: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::iso_timestamp(at))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|at| at.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }

    pub mod option {
        use chrono::{DateTime, Utc};
        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(
            at: &Option<DateTime<Utc>>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match at {
                Some(at) => serializer.serialize_str(&super::super::iso_timestamp(at)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<DateTime<Utc>>, D::Error> {
            let raw: Option<String> = Option::deserialize(deserializer)?;
            raw.map(|raw| {
                DateTime::parse_from_rfc3339(&raw)
                    .map(|at| at.with_timezone(&Utc))
                    .map_err(serde::de::Error::custom)
            })
            .transpose()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cohort_parses_and_formats() {
        let cohort: Cohort = "2-3".parse().unwrap();
        assert_eq!(cohort, Cohort { grade: 2, class: 3 });
        assert_eq!(cohort.to_string(), "2-3");
        assert_eq!(cohort.label(), "2年3組");
        assert!("2".parse::<Cohort>().is_err());
        assert!("0-3".parse::<Cohort>().is_err());
        assert!("a-b".parse::<Cohort>().is_err());
    }

    #[test]
    fn rounded_mean_averages_each_dimension() {
        let samples = [
            Scores { pronunciation: 8.0, fluency: 7.0, intonation: 6.0 },
            Scores { pronunciation: 7.0, fluency: 6.0, intonation: 6.5 },
            Scores { pronunciation: 9.0, fluency: 6.0, intonation: 6.0 },
        ];
        let mean = Scores::rounded_mean(&samples).unwrap();
        assert_eq!(mean.pronunciation, 8.0);
        assert_eq!(mean.fluency, 6.3);
        assert_eq!(mean.intonation, 6.2);
        assert!(Scores::rounded_mean(&[]).is_none());
    }

    #[test]
    fn result_document_uses_camel_case_and_defaults_missing_scores() {
        let raw = serde_json::json!({
            "studentEmail": "a@example.jp",
            "studentName": "A",
            "studentGrade": 2,
            "studentClass": 3,
            "testTitle": "Lesson 1",
            "completedAt": "2026-05-01T09:00:00Z",
            "scores": { "pronunciation": 8.0 }
        });
        let result: TestResult = serde_json::from_value(raw).unwrap();
        assert_eq!(result.student_number, None);
        assert_eq!(result.scores.fluency, 0.0);
        assert_eq!(result.total(), 8.0);
        assert_eq!(result.cohort(), Some(Cohort { grade: 2, class: 3 }));

        let stored = serde_json::to_value(&result).unwrap();
        assert_eq!(stored["completedAt"], "2026-05-01T09:00:00.000Z");
    }

    #[test]
    fn assignment_defaults_to_single_attempt() {
        let raw = serde_json::json!({ "title": "Lesson 1", "questions": ["Hello."] });
        let assignment: Assignment = serde_json::from_value(raw).unwrap();
        assert_eq!(assignment.retake_policy, RetakePolicy::Once);
        assert!(assignment.assigned_classes.is_empty());
    }
}

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use csv::{QuoteStyle, Terminator, WriterBuilder};
use tracing::info;

use crate::error::{AppError, AppResult};
use crate::models::{round1, Cohort, TestResult, UserProfile};

pub const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";
const FIXED_HEADERS: [&str; 4] = ["生徒名", "学年", "クラス", "番号"];
const MISSING_NUMBER: u32 = 99;

pub fn pivot_filename(now: DateTime<Utc>) -> String {
    format!("speakup_grades_pivot_{}.csv", now.format("%Y%m%d%H%M"))
}

fn quoted(text: &str) -> String {
    format!("\"{}\"", text.replace('"', "\"\""))
}

fn optional_number(value: Option<u32>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

/// Students of the selected cohorts, by student number with missing numbers last.
pub fn target_students<'a>(roster: &'a [UserProfile], cohorts: &[Cohort]) -> Vec<&'a UserProfile> {
    let mut students: Vec<&UserProfile> = roster
        .iter()
        .filter(|u| u.is_student())
        .filter(|u| u.cohort().is_some_and(|c| cohorts.contains(&c)))
        .collect();
    students.sort_by_key(|u| u.student_number.filter(|n| *n > 0).unwrap_or(MISSING_NUMBER));
    students
}

/// `(email, title) -> total`, keeping the most recent result when a key repeats.
fn latest_totals(results: &[TestResult]) -> HashMap<(&str, &str), (DateTime<Utc>, f64)> {
    let mut totals: HashMap<(&str, &str), (DateTime<Utc>, f64)> = HashMap::new();
    for result in results {
        let key = (result.student_email.as_str(), result.test_title.as_str());
        let candidate = (result.completed_at, round1(result.total()));
        totals
            .entry(key)
            .and_modify(|current| {
                if candidate.0 >= current.0 {
                    *current = candidate;
                }
            })
            .or_insert(candidate);
    }
    totals
}

/// Student × assignment grade sheet: BOM, header, one row per student, blank cells where no result exists.
pub fn build_pivot(
    roster: &[UserProfile],
    results: &[TestResult],
    cohorts: &[Cohort],
    titles: &[String],
) -> AppResult<Vec<u8>> {
    if cohorts.is_empty() || titles.is_empty() {
        return Err(AppError::Validation(
            "select at least one class and one assignment".into(),
        ));
    }
    let students = target_students(roster, cohorts);
    if students.is_empty() {
        return Err(AppError::Validation("no students found in the selected classes".into()));
    }
    let totals = latest_totals(results);

    let mut writer = WriterBuilder::new()
        .quote_style(QuoteStyle::Never)
        .terminator(Terminator::Any(b'\n'))
        .from_writer(UTF8_BOM.to_vec());

    let header: Vec<String> = FIXED_HEADERS
        .iter()
        .map(|h| h.to_string())
        .chain(titles.iter().map(|t| quoted(t)))
        .collect();
    writer.write_record(&header).map_err(csv_error)?;

    for student in &students {
        let mut row = vec![
            quoted(&student.name),
            optional_number(student.grade),
            optional_number(student.class),
            optional_number(student.student_number),
        ];
        for title in titles {
            let cell = totals
                .get(&(student.email.as_str(), title.as_str()))
                .map(|(_, total)| total.to_string())
                .unwrap_or_default();
            row.push(cell);
        }
        writer.write_record(&row).map_err(csv_error)?;
    }

    let bytes = writer
        .into_inner()
        .map_err(|e| AppError::Export(e.to_string()))?;
    info!(students = students.len(), assignments = titles.len(), "grade sheet built");
    Ok(bytes)
}

fn csv_error(err: csv::Error) -> AppError {
    AppError::Export(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Role, Scores};
    use chrono::TimeZone;

    fn student(name: &str, grade: u32, class: u32, number: Option<u32>) -> UserProfile {
        UserProfile {
            email: format!("{}@school.example.jp", name.to_lowercase()),
            name: name.to_string(),
            picture: String::new(),
            role: Some(Role::Student),
            grade: Some(grade),
            class: Some(class),
            student_number: number,
        }
    }

    fn result(email: &str, title: &str, scores: (f64, f64, f64), minute: u32) -> TestResult {
        TestResult {
            student_email: email.to_string(),
            student_name: String::new(),
            student_grade: Some(2),
            student_class: Some(3),
            student_number: None,
            test_title: title.to_string(),
            completed_at: Utc.with_ymd_and_hms(2026, 5, 1, 9, minute, 0).unwrap(),
            scores: Scores {
                pronunciation: scores.0,
                fluency: scores.1,
                intonation: scores.2,
            },
        }
    }

    fn body(bytes: &[u8]) -> String {
        assert!(bytes.starts_with(UTF8_BOM));
        String::from_utf8(bytes[UTF8_BOM.len()..].to_vec()).unwrap()
    }

    #[test]
    fn pivot_matches_reference_layout() {
        let roster = vec![student("B", 2, 3, Some(2)), student("A", 2, 3, Some(1))];
        let results = vec![result("a@school.example.jp", "Lesson 1", (8.0, 7.0, 6.0), 0)];
        let cohorts = vec![Cohort { grade: 2, class: 3 }];
        let titles = vec!["Lesson 1".to_string()];

        let csv = body(&build_pivot(&roster, &results, &cohorts, &titles).unwrap());
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(
            lines,
            vec!["生徒名,学年,クラス,番号,\"Lesson 1\"", "\"A\",2,3,1,21", "\"B\",2,3,2,"]
        );
    }

    #[test]
    fn other_cohorts_and_teachers_are_left_out() {
        let mut teacher = student("T", 2, 3, Some(1));
        teacher.role = Some(Role::Teacher);
        let roster = vec![
            student("Mei", 2, 4, None),
            student("Ren", 1, 1, Some(5)),
            student("Aoi", 2, 4, Some(3)),
            teacher,
        ];
        let cohorts = vec![Cohort { grade: 2, class: 4 }];
        let names: Vec<&str> = target_students(&roster, &cohorts)
            .iter()
            .map(|u| u.name.as_str())
            .collect();
        assert_eq!(names, vec!["Aoi", "Mei"]);
    }

    #[test]
    fn most_recent_duplicate_wins_and_quotes_are_escaped() {
        let roster = vec![student("A", 2, 3, Some(1))];
        let results = vec![
            result("a@school.example.jp", "Say \"Hi\"", (9.0, 9.0, 9.0), 30),
            result("a@school.example.jp", "Say \"Hi\"", (5.0, 5.0, 5.5), 10),
        ];
        let titles = vec!["Say \"Hi\"".to_string()];
        let csv = body(
            &build_pivot(&roster, &results, &[Cohort { grade: 2, class: 3 }], &titles).unwrap(),
        );
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines[0], "生徒名,学年,クラス,番号,\"Say \"\"Hi\"\"\"");
        assert_eq!(lines[1], "\"A\",2,3,1,27");
    }

    #[test]
    fn empty_selection_or_roster_produces_no_file() {
        let roster = vec![student("A", 2, 3, Some(1))];
        let titles = vec!["Lesson 1".to_string()];
        let cohort = [Cohort { grade: 2, class: 3 }];
        assert!(matches!(build_pivot(&roster, &[], &[], &titles), Err(AppError::Validation(_))));
        assert!(matches!(build_pivot(&roster, &[], &cohort, &[]), Err(AppError::Validation(_))));
        assert!(matches!(
            build_pivot(&roster, &[], &[Cohort { grade: 9, class: 9 }], &titles),
            Err(AppError::Validation(_))
        ));
    }

    #[test]
    fn filename_uses_compact_minute_timestamp() {
        let now = Utc.with_ymd_and_hms(2026, 5, 1, 9, 7, 59).unwrap();
        assert_eq!(pivot_filename(now), "speakup_grades_pivot_202605010907.csv");
    }
}

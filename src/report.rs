use std::fmt::Write;

use crate::evaluator::Evaluation;
use crate::models::{iso_timestamp, Assignment, Cohort, DashboardMetrics, RetakePolicy, Scores, UserProfile};
use crate::repo::AssignmentBoard;
use crate::table::{ResultRow, ResultSortKey, SortState, TableView};

fn cohort_label(grade: Option<u32>, class: Option<u32>) -> String {
    Cohort::from_parts(grade, class)
        .map(|c| c.label())
        .unwrap_or_else(|| "-".to_string())
}

fn number_or_dash(value: Option<u32>) -> String {
    value.map(|v| v.to_string()).unwrap_or_else(|| "-".to_string())
}

fn status_line<T>(view: &TableView<T>, output: &mut String, empty: &str) -> bool {
    match view {
        TableView::Loading => {
            let _ = writeln!(output, "Loading...");
            true
        }
        TableView::Failed(err) => {
            let _ = writeln!(output, "Failed to load: {err}");
            true
        }
        TableView::Empty => {
            let _ = writeln!(output, "{empty}");
            true
        }
        TableView::Rows(_) => false,
    }
}

pub fn build_dashboard(metrics: &DashboardMetrics) -> String {
    let mut output = String::new();

    let _ = writeln!(output, "# Speak Up Dashboard");
    let _ = writeln!(output, "- Students: {}", metrics.total_students);
    let _ = writeln!(output, "- Assignments: {}", metrics.total_assignments);
    let _ = writeln!(output, "- Submissions today: {}", metrics.today_submissions);
    let _ = writeln!(
        output,
        "- Active students (7 days): {}",
        metrics.weekly_active_students
    );
    let _ = writeln!(
        output,
        "- Recent average score: {:.1} / 30",
        metrics.recent_average_score
    );

    let _ = writeln!(output);
    let _ = writeln!(output, "## Recent Activity");
    if metrics.recent_activity.is_empty() {
        let _ = writeln!(output, "No submissions yet.");
    } else {
        for entry in &metrics.recent_activity {
            let _ = writeln!(
                output,
                "- {} completed {} ({:.1}) {}",
                entry.student_name, entry.test_title, entry.total, entry.label
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Class Performance");
    if metrics.class_performance.is_empty() {
        let _ = writeln!(output, "No class data yet.");
    } else {
        for class in &metrics.class_performance {
            let _ = writeln!(
                output,
                "- {}: pronunciation {:.1}, fluency {:.1}, intonation {:.1} across {} results",
                class.cohort, class.pronunciation, class.fluency, class.intonation, class.result_count
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Students Needing Support");
    if metrics.struggling_students.is_empty() {
        let _ = writeln!(output, "No results to compare yet.");
    } else {
        for student in &metrics.struggling_students {
            let _ = writeln!(
                output,
                "- {} ({}) average {:.1} over {} tests",
                student.student_name, student.student_email, student.average_total, student.result_count
            );
        }
    }

    output
}

pub fn build_results_table(view: &TableView<ResultRow>, sort: &SortState<ResultSortKey>) -> String {
    let mut output = String::new();
    let _ = writeln!(output, "Sorted by {:?} {}", sort.key, sort.direction.indicator());
    if status_line(view, &mut output, "No results match these filters.") {
        return output;
    }
    let TableView::Rows(rows) = view else {
        return output;
    };

    let _ = writeln!(output, "| Completed | Class | No. | Student | Test | P | F | I | Total |");
    let _ = writeln!(output, "|---|---|---|---|---|---|---|---|---|");
    for row in rows {
        let r = &row.result;
        let _ = writeln!(
            output,
            "| {} | {} | {} | {} | {} | {:.1} | {:.1} | {:.1} | {:.1} / 30 |",
            r.completed_at.format("%Y-%m-%d %H:%M"),
            cohort_label(r.student_grade, r.student_class),
            number_or_dash(r.student_number),
            r.student_name,
            r.test_title,
            r.scores.pronunciation,
            r.scores.fluency,
            r.scores.intonation,
            row.total
        );
    }
    output
}

pub fn build_users_table(view: &TableView<UserProfile>) -> String {
    let mut output = String::new();
    if status_line(view, &mut output, "No users registered.") {
        return output;
    }
    let TableView::Rows(users) = view else {
        return output;
    };

    let _ = writeln!(output, "| Name | Email | Role | Class | No. |");
    let _ = writeln!(output, "|---|---|---|---|---|");
    for user in users {
        let role = user.role.map(|r| r.to_string()).unwrap_or_else(|| "-".to_string());
        let _ = writeln!(
            output,
            "| {} | {} | {} | {} | {} |",
            user.name,
            user.email,
            role,
            cohort_label(user.grade, user.class),
            number_or_dash(user.student_number)
        );
    }
    output
}

fn retake_label(policy: RetakePolicy) -> &'static str {
    match policy {
        RetakePolicy::Once => "1回のみ",
        RetakePolicy::Multiple => "複数回可",
    }
}

fn assignment_line(output: &mut String, assignment: &Assignment) {
    let classes: Vec<String> = assignment
        .assigned_classes
        .iter()
        .map(|c| c.parse::<Cohort>().map(|c| c.label()).unwrap_or_else(|_| c.clone()))
        .collect();
    let _ = writeln!(
        output,
        "- [{}] {} ({} questions, {}, {})",
        assignment.id,
        assignment.title,
        assignment.questions.len(),
        classes.join(" / "),
        retake_label(assignment.retake_policy)
    );
}

pub fn build_assignment_list(view: &TableView<Assignment>) -> String {
    let mut output = String::new();
    if status_line(view, &mut output, "No assignments yet.") {
        return output;
    }
    if let TableView::Rows(assignments) = view {
        for assignment in assignments {
            assignment_line(&mut output, assignment);
            if let Some(updated) = &assignment.updated_at {
                let creator = assignment.creator_name.as_deref().unwrap_or("-");
                let _ = writeln!(output, "  by {creator}, updated {}", iso_timestamp(updated));
            }
        }
    }
    output
}

pub fn build_board(board: &AssignmentBoard) -> String {
    let mut output = String::new();
    let _ = writeln!(output, "## Assignments To Do");
    if board.available.is_empty() {
        let _ = writeln!(output, "Nothing assigned right now.");
    }
    for assignment in &board.available {
        assignment_line(&mut output, assignment);
    }
    let _ = writeln!(output);
    let _ = writeln!(output, "## Completed");
    if board.completed.is_empty() {
        let _ = writeln!(output, "No completed assignments yet.");
    }
    for assignment in &board.completed {
        assignment_line(&mut output, assignment);
    }
    output
}

pub fn build_feedback(index: usize, count: usize, reference: &str, evaluation: &Evaluation) -> String {
    let mut output = String::new();
    let s = &evaluation.scores;
    let _ = writeln!(output, "Question {}/{}: {}", index + 1, count, reference);
    let _ = writeln!(
        output,
        "  pronunciation {:.1}/10, fluency {:.1}/10, intonation {:.1}/10",
        s.pronunciation, s.fluency, s.intonation
    );
    let _ = writeln!(output, "  heard: {}", evaluation.transcription);
    if !evaluation.incorrect_words.is_empty() {
        let _ = writeln!(output, "  check: {}", evaluation.incorrect_words.join(", "));
    }
    let _ = writeln!(output, "  {}", evaluation.advice);
    output
}

pub fn build_summary(title: &str, scores: &Scores) -> String {
    format!(
        "{title}: pronunciation {:.1}/10, fluency {:.1}/10, intonation {:.1}/10 (total {:.1}/30)",
        scores.pronunciation,
        scores.fluency,
        scores.intonation,
        scores.total()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ActivityEntry, CohortPerformance, Role, TestResult};
    use chrono::{TimeZone, Utc};

    #[test]
    fn dashboard_lists_every_section() {
        let metrics = DashboardMetrics {
            total_students: 31,
            total_assignments: 4,
            today_submissions: 2,
            weekly_active_students: 1,
            recent_average_score: 20.26,
            recent_activity: vec![ActivityEntry {
                student_name: "Aoi".into(),
                test_title: "Lesson 1".into(),
                total: 21.0,
                completed_at: Utc::now(),
                label: "3分前".into(),
            }],
            class_performance: vec![CohortPerformance {
                cohort: "2-3".into(),
                result_count: 2,
                pronunciation: 8.0,
                fluency: 7.0,
                intonation: 6.0,
            }],
            struggling_students: Vec::new(),
        };
        let report = build_dashboard(&metrics);
        assert!(report.contains("- Students: 31\n- Assignments: 4\n"));
        assert!(report.contains("Submissions today: 2"));
        assert!(report.contains("Recent average score: 20.3 / 30"));
        assert!(report.contains("- Aoi completed Lesson 1 (21.0) 3分前"));
        assert!(report.contains("- 2-3: pronunciation 8.0"));
        assert!(report.contains("No results to compare yet."));
    }

    #[test]
    fn tables_render_status_rows() {
        let sort = SortState::default();
        assert!(build_results_table(&TableView::Empty, &sort).contains("No results match"));
        assert!(build_results_table(&TableView::Failed("offline".into()), &sort).contains("Failed to load: offline"));
        assert!(build_users_table(&TableView::Loading).contains("Loading"));
    }

    #[test]
    fn result_rows_show_class_label_and_total() {
        let result = TestResult {
            student_email: "a@x.jp".into(),
            student_name: "Aoi".into(),
            student_grade: Some(2),
            student_class: Some(3),
            student_number: None,
            test_title: "Lesson 1".into(),
            completed_at: Utc.with_ymd_and_hms(2026, 5, 1, 9, 0, 0).unwrap(),
            scores: Scores { pronunciation: 8.0, fluency: 7.0, intonation: 6.0 },
        };
        let view = TableView::Rows(vec![ResultRow { total: result.total(), result }]);
        let table = build_results_table(&view, &SortState::default());
        assert!(table.contains("| 2026-05-01 09:00 | 2年3組 | - | Aoi | Lesson 1 | 8.0 | 7.0 | 6.0 | 21.0 / 30 |"));

        let user = UserProfile {
            email: "t@x.jp".into(),
            name: "T".into(),
            picture: String::new(),
            role: Some(Role::Teacher),
            grade: None,
            class: None,
            student_number: None,
        };
        assert!(build_users_table(&TableView::Rows(vec![user])).contains("| T | t@x.jp | teacher | - | - |"));
    }
}

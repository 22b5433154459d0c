use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Duration, TimeZone, Utc};

use crate::models::{
    ActivityEntry, Assignment, CohortPerformance, DashboardMetrics, StudentAverage, TestResult,
    UserProfile,
};

pub const RECENT_SCORE_WINDOW: usize = 50;
pub const ACTIVITY_FEED_SIZE: usize = 5;
pub const STRUGGLING_LIST_SIZE: usize = 5;
pub const ACTIVE_WINDOW_DAYS: i64 = 7;

const YEAR_SECS: i64 = 31_536_000;
const MONTH_SECS: i64 = 2_592_000;
const DAY_SECS: i64 = 86_400;
const HOUR_SECS: i64 = 3_600;
const MINUTE_SECS: i64 = 60;

pub fn start_of_day<Tz: TimeZone>(now: &DateTime<Tz>) -> DateTime<Utc> {
    let Some(midnight) = now.date_naive().and_hms_opt(0, 0, 0) else {
        return now.with_timezone(&Utc);
    };
    now.timezone()
        .from_local_datetime(&midnight)
        .earliest()
        .map(|at| at.with_timezone(&Utc))
        .unwrap_or_else(|| Utc.from_utc_datetime(&midnight))
}

pub fn relative_time_label(elapsed_secs: i64) -> String {
    let elapsed = elapsed_secs.max(0);
    let tiers = [
        (YEAR_SECS, "年前"),
        (MONTH_SECS, "ヶ月前"),
        (DAY_SECS, "日前"),
        (HOUR_SECS, "時間前"),
        (MINUTE_SECS, "分前"),
    ];
    for (unit, suffix) in tiers {
        let count = elapsed / unit;
        if count >= 1 {
            return format!("{count}{suffix}");
        }
    }
    "たった今".to_string()
}

fn newest_first(results: &[TestResult]) -> Vec<&TestResult> {
    let mut sorted: Vec<&TestResult> = results.iter().collect();
    sorted.sort_by(|a, b| b.completed_at.cmp(&a.completed_at));
    sorted
}

/// Mean of `total` over the newest `RECENT_SCORE_WINDOW` results, 0 when empty.
pub fn recent_average_score(results: &[TestResult]) -> f64 {
    let window: Vec<&TestResult> = newest_first(results)
        .into_iter()
        .take(RECENT_SCORE_WINDOW)
        .collect();
    if window.is_empty() {
        return 0.0;
    }
    window.iter().map(|r| r.total()).sum::<f64>() / window.len() as f64
}

/// All-time per-cohort means; results without grade and class are skipped.
pub fn class_performance(results: &[TestResult]) -> Vec<CohortPerformance> {
    let mut groups: BTreeMap<String, (usize, f64, f64, f64)> = BTreeMap::new();
    for result in results {
        let Some(cohort) = result.cohort() else {
            continue;
        };
        let entry = groups.entry(cohort.to_string()).or_insert((0, 0.0, 0.0, 0.0));
        entry.0 += 1;
        entry.1 += result.scores.pronunciation;
        entry.2 += result.scores.fluency;
        entry.3 += result.scores.intonation;
    }

    groups
        .into_iter()
        .map(|(cohort, (count, p, f, i))| {
            let n = count as f64;
            CohortPerformance {
                cohort,
                result_count: count,
                pronunciation: p / n,
                fluency: f / n,
                intonation: i / n,
            }
        })
        .collect()
}

/// Lowest all-time mean totals, ascending.
pub fn struggling_students(results: &[TestResult], limit: usize) -> Vec<StudentAverage> {
    let mut groups: HashMap<&str, StudentAverage> = HashMap::new();
    for result in newest_first(results) {
        let entry = groups
            .entry(result.student_email.as_str())
            .or_insert_with(|| StudentAverage {
                student_email: result.student_email.clone(),
                student_name: result.student_name.clone(),
                average_total: 0.0,
                result_count: 0,
            });
        entry.average_total += result.total();
        entry.result_count += 1;
    }

    let mut averages: Vec<StudentAverage> = groups
        .into_values()
        .map(|mut student| {
            student.average_total /= student.result_count as f64;
            student
        })
        .collect();
    averages.sort_by(|a, b| {
        a.average_total
            .partial_cmp(&b.average_total)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.student_email.cmp(&b.student_email))
    });
    averages.truncate(limit);
    averages
}

/// `users` may hold every profile; only students are counted.
pub fn summarize<Tz: TimeZone>(
    results: &[TestResult],
    users: &[UserProfile],
    assignments: &[Assignment],
    now: DateTime<Tz>,
) -> DashboardMetrics {
    let now_utc = now.with_timezone(&Utc);
    let day_start = start_of_day(&now);
    let active_cutoff = now_utc - Duration::days(ACTIVE_WINDOW_DAYS);

    let today_submissions = results.iter().filter(|r| r.completed_at >= day_start).count();
    let weekly_active_students = results
        .iter()
        .filter(|r| r.completed_at >= active_cutoff)
        .map(|r| r.student_email.as_str())
        .collect::<HashSet<&str>>()
        .len();

    let recent_activity = newest_first(results)
        .into_iter()
        .take(ACTIVITY_FEED_SIZE)
        .map(|r| ActivityEntry {
            student_name: r.student_name.clone(),
            test_title: r.test_title.clone(),
            total: r.total(),
            completed_at: r.completed_at,
            label: relative_time_label((now_utc - r.completed_at).num_seconds()),
        })
        .collect();

    DashboardMetrics {
        total_students: users.iter().filter(|u| u.is_student()).count(),
        total_assignments: assignments.len(),
        today_submissions,
        weekly_active_students,
        recent_average_score: recent_average_score(results),
        recent_activity,
        class_performance: class_performance(results),
        struggling_students: struggling_students(results, STRUGGLING_LIST_SIZE),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{RetakePolicy, Role, Scores};
    use chrono::FixedOffset;
    use proptest::prelude::*;

    fn jst_now() -> DateTime<FixedOffset> {
        FixedOffset::east_opt(9 * 3600)
            .unwrap()
            .with_ymd_and_hms(2026, 5, 10, 15, 0, 0)
            .unwrap()
    }

    fn result_at(email: &str, grade: u32, class: u32, total_each: f64, at: DateTime<Utc>) -> TestResult {
        TestResult {
            student_email: email.to_string(),
            student_name: email.split('@').next().unwrap_or_default().to_string(),
            student_grade: Some(grade),
            student_class: Some(class),
            student_number: Some(1),
            test_title: "Lesson 1".to_string(),
            completed_at: at,
            scores: Scores {
                pronunciation: total_each,
                fluency: total_each,
                intonation: total_each,
            },
        }
    }

    #[test]
    fn labels_follow_floor_thresholds() {
        assert_eq!(relative_time_label(0), "たった今");
        assert_eq!(relative_time_label(59), "たった今");
        assert_eq!(relative_time_label(60), "1分前");
        assert_eq!(relative_time_label(3_599), "59分前");
        assert_eq!(relative_time_label(7_200), "2時間前");
        assert_eq!(relative_time_label(86_400 * 3), "3日前");
        assert_eq!(relative_time_label(2_592_000 * 2 + 5), "2ヶ月前");
        assert_eq!(relative_time_label(31_536_000), "1年前");
        assert_eq!(relative_time_label(-30), "たった今");
    }

    #[test]
    fn today_counts_from_local_midnight() {
        let now = jst_now();
        let now_utc = now.with_timezone(&Utc);
        // 2026-05-10 00:00 JST is 2026-05-09 15:00 UTC.
        let results = vec![
            result_at("a@x.jp", 2, 3, 5.0, now_utc - Duration::hours(14)),
            result_at("b@x.jp", 2, 3, 5.0, now_utc - Duration::hours(16)),
        ];
        let metrics = summarize(&results, &[], &[], now);
        assert_eq!(metrics.today_submissions, 1);
        assert_eq!(metrics.weekly_active_students, 2);
    }

    #[test]
    fn weekly_active_counts_distinct_students() {
        let now = jst_now();
        let now_utc = now.with_timezone(&Utc);
        let results = vec![
            result_at("a@x.jp", 2, 3, 5.0, now_utc - Duration::days(1)),
            result_at("a@x.jp", 2, 3, 5.0, now_utc - Duration::days(2)),
            result_at("b@x.jp", 2, 3, 5.0, now_utc - Duration::days(6)),
            result_at("c@x.jp", 2, 3, 5.0, now_utc - Duration::days(8)),
        ];
        assert_eq!(summarize(&results, &[], &[], now).weekly_active_students, 2);
    }

    #[test]
    fn class_performance_and_struggling_students_use_all_history() {
        let now = jst_now();
        let old = now.with_timezone(&Utc) - Duration::days(400);
        let results = vec![
            result_at("a@x.jp", 2, 3, 8.0, old),
            result_at("b@x.jp", 2, 3, 4.0, old),
            result_at("c@x.jp", 10, 1, 6.0, old),
            result_at("b@x.jp", 2, 3, 2.0, old),
        ];
        let metrics = summarize(&results, &[], &[], now);

        let cohorts: Vec<&str> = metrics.class_performance.iter().map(|c| c.cohort.as_str()).collect();
        assert_eq!(cohorts, vec!["10-1", "2-3"]);
        let second = &metrics.class_performance[1];
        assert_eq!(second.result_count, 3);
        assert!((second.pronunciation - 14.0 / 3.0).abs() < 1e-9);

        let struggling: Vec<&str> = metrics.struggling_students.iter().map(|s| s.student_email.as_str()).collect();
        assert_eq!(struggling, vec!["b@x.jp", "c@x.jp", "a@x.jp"]);
        assert_eq!(metrics.struggling_students[0].average_total, 9.0);
        assert_eq!(metrics.recent_activity[0].label, "1年前");
    }

    #[test]
    fn feed_and_struggling_list_stop_at_five() {
        let now = jst_now();
        let now_utc = now.with_timezone(&Utc);
        let results: Vec<TestResult> = (0..8)
            .map(|i| {
                let email = format!("s{i}@x.jp");
                result_at(&email, 2, 3, i as f64, now_utc - Duration::minutes(i as i64 + 1))
            })
            .collect();
        let mut shuffled = results.clone();
        shuffled.rotate_left(3);
        let metrics = summarize(&shuffled, &[], &[], now);

        let feed: Vec<&str> = metrics.recent_activity.iter().map(|e| e.student_name.as_str()).collect();
        assert_eq!(feed, vec!["s0", "s1", "s2", "s3", "s4"]);
        assert!(metrics
            .recent_activity
            .windows(2)
            .all(|pair| pair[0].completed_at >= pair[1].completed_at));
        assert_eq!(metrics.recent_activity[0].label, "1分前");

        let struggling: Vec<&str> = metrics.struggling_students.iter().map(|s| s.student_name.as_str()).collect();
        assert_eq!(struggling, vec!["s0", "s1", "s2", "s3", "s4"]);
    }

    #[test]
    fn totals_count_students_and_assignments() {
        let person = |email: &str, role: Role| UserProfile {
            email: email.to_string(),
            name: email.to_string(),
            picture: String::new(),
            role: Some(role),
            grade: Some(2),
            class: Some(3),
            student_number: None,
        };
        let users = vec![
            person("a@x.jp", Role::Student),
            person("b@x.jp", Role::Student),
            person("t@x.jp", Role::Teacher),
        ];
        let assignment = Assignment {
            id: "a1".to_string(),
            title: "Lesson 1".to_string(),
            description: String::new(),
            questions: vec!["Hello.".to_string()],
            assigned_classes: vec!["2-3".to_string()],
            retake_policy: RetakePolicy::Once,
            creator_name: None,
            creator_email: None,
            created_at: None,
            updated_at: None,
        };
        let metrics = summarize(&[], &users, &[assignment], jst_now());
        assert_eq!(metrics.total_students, 2);
        assert_eq!(metrics.total_assignments, 1);
    }

    #[test]
    fn empty_results_give_zeroed_metrics() {
        let metrics = summarize(&[], &[], &[], jst_now());
        assert_eq!(metrics, DashboardMetrics::default());
    }

    proptest! {
        #[test]
        fn recent_average_uses_only_newest_fifty(totals in proptest::collection::vec(0u32..=30, 1..120)) {
            let base = jst_now().with_timezone(&Utc);
            let results: Vec<TestResult> = totals
                .iter()
                .enumerate()
                .map(|(i, t)| result_at("a@x.jp", 2, 3, *t as f64 / 3.0, base - Duration::minutes(i as i64)))
                .collect();

            let window = totals.len().min(RECENT_SCORE_WINDOW);
            let expected = results[..window].iter().map(|r| r.total()).sum::<f64>() / window as f64;

            let mut shuffled = results.clone();
            shuffled.reverse();
            prop_assert!((recent_average_score(&shuffled) - expected).abs() < 1e-9);
        }
    }
}

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::error::{AppError, AppResult};
use crate::evaluator::{AudioClip, Evaluation, SpeechEvaluator};
use crate::models::{Scores, TestResult, UserProfile};
use crate::repo::{self, AssignmentBoard};
use crate::store::DocumentStore;

pub const PENDING_FILE: &str = "pending_results.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    InProgress,
    Recording,
    Evaluating,
    Feedback,
    Summarizing,
    Submitted,
}

/// How a finished session left the client.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionOutcome {
    /// No question was answered; nothing was written.
    Discarded,
    Submitted { id: String, scores: Scores },
    /// The write failed; the result waits in the local queue.
    Queued { scores: Scores, pending: usize },
}

#[derive(Debug, Clone)]
pub struct TestSession {
    title: String,
    questions: Vec<String>,
    current: usize,
    phase: Phase,
    scores: Vec<Scores>,
    feedback: Option<Evaluation>,
    last_error: Option<String>,
}

impl TestSession {
    pub fn start(title: &str, questions: Vec<String>) -> AppResult<Self> {
        let questions: Vec<String> = questions
            .into_iter()
            .map(|q| q.trim().to_string())
            .filter(|q| !q.is_empty())
            .collect();
        if questions.is_empty() {
            return Err(AppError::Validation("a test needs at least one question".into()));
        }
        if title.trim().is_empty() {
            return Err(AppError::Validation("a test needs a title".into()));
        }
        Ok(Self {
            title: title.trim().to_string(),
            questions,
            current: 0,
            phase: Phase::InProgress,
            scores: Vec::new(),
            feedback: None,
            last_error: None,
        })
    }

    /// Enters an assignment only if the retake policy leaves it available.
    pub fn start_assignment(board: &AssignmentBoard, assignment_id: &str) -> AppResult<Self> {
        if let Some(assignment) = board.available.iter().find(|a| a.id == assignment_id) {
            return Self::start(&assignment.title, assignment.questions.clone());
        }
        if board.completed.iter().any(|a| a.id == assignment_id) {
            return Err(AppError::Validation(format!(
                "assignment {assignment_id} is already completed and cannot be retaken"
            )));
        }
        Err(AppError::Validation(format!(
            "assignment {assignment_id} is not assigned to you"
        )))
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn current_index(&self) -> usize {
        self.current
    }

    pub fn question_count(&self) -> usize {
        self.questions.len()
    }

    pub fn current_question(&self) -> Option<&str> {
        match self.phase {
            Phase::InProgress | Phase::Recording | Phase::Evaluating | Phase::Feedback => {
                self.questions.get(self.current).map(String::as_str)
            }
            _ => None,
        }
    }

    pub fn answered(&self) -> usize {
        self.scores.len()
    }

    pub fn feedback(&self) -> Option<&Evaluation> {
        self.feedback.as_ref()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Model audio and navigation are locked while recording or evaluating.
    pub fn can_play_model(&self) -> bool {
        matches!(self.phase, Phase::InProgress | Phase::Feedback)
    }

    fn illegal(&self, action: &str) -> AppError {
        AppError::Session(format!("cannot {action} while {:?}", self.phase))
    }

    pub fn start_recording(&mut self) -> AppResult<()> {
        match self.phase {
            Phase::Recording => Ok(()),
            Phase::InProgress => {
                self.phase = Phase::Recording;
                self.last_error = None;
                Ok(())
            }
            _ => Err(self.illegal("start recording")),
        }
    }

    /// Returns the reference sentence the captured audio is scored against.
    pub fn stop_recording(&mut self) -> AppResult<String> {
        if self.phase != Phase::Recording {
            return Err(self.illegal("stop recording"));
        }
        self.phase = Phase::Evaluating;
        Ok(self.questions[self.current].clone())
    }

    /// A failed evaluation leaves the question unanswered and open for another attempt.
    pub fn apply_evaluation(&mut self, outcome: AppResult<Evaluation>) -> AppResult<()> {
        if self.phase != Phase::Evaluating {
            return Err(self.illegal("apply an evaluation"));
        }
        match outcome {
            Ok(evaluation) => {
                self.scores.push(evaluation.scores);
                self.feedback = Some(evaluation);
                self.last_error = None;
                self.phase = Phase::Feedback;
            }
            Err(err) => {
                warn!(question = self.current, error = %err, "evaluation failed");
                self.last_error = Some(err.to_string());
                self.phase = Phase::InProgress;
            }
        }
        Ok(())
    }

    /// Advances past the last question into `Summarizing`.
    pub fn next(&mut self) -> AppResult<()> {
        if self.phase != Phase::Feedback {
            return Err(self.illegal("move to the next question"));
        }
        self.feedback = None;
        if self.current + 1 >= self.questions.len() {
            self.phase = Phase::Summarizing;
        } else {
            self.current += 1;
            self.phase = Phase::InProgress;
        }
        Ok(())
    }

    pub fn end(&mut self) -> AppResult<()> {
        match self.phase {
            Phase::InProgress | Phase::Feedback => {
                self.feedback = None;
                self.phase = Phase::Summarizing;
                Ok(())
            }
            _ => Err(self.illegal("end the test")),
        }
    }

    pub fn summary(&self) -> Option<Scores> {
        Scores::rounded_mean(&self.scores)
    }

    pub fn build_result(&self, student: &UserProfile, now: DateTime<Utc>) -> Option<TestResult> {
        let scores = self.summary()?;
        Some(TestResult {
            student_email: student.email.clone(),
            student_name: student.name.clone(),
            student_grade: student.grade,
            student_class: student.class,
            student_number: student.student_number,
            test_title: self.title.clone(),
            completed_at: now,
            scores,
        })
    }

    /// Writes the result. `Submitted` is reached only once the store acknowledges;
    /// a failed write is parked in `queue` and the session returns to `Idle`.
    pub async fn finish(
        &mut self,
        store: &dyn DocumentStore,
        queue: &SubmissionQueue,
        student: &UserProfile,
        now: DateTime<Utc>,
    ) -> AppResult<SessionOutcome> {
        if self.phase != Phase::Summarizing {
            return Err(self.illegal("submit"));
        }
        let Some(result) = self.build_result(student, now) else {
            info!(title = %self.title, "session ended without answers, nothing submitted");
            self.phase = Phase::Idle;
            return Ok(SessionOutcome::Discarded);
        };

        match repo::submit_result(store, &result).await {
            Ok(id) => {
                self.phase = Phase::Submitted;
                Ok(SessionOutcome::Submitted {
                    id,
                    scores: result.scores,
                })
            }
            Err(err) => {
                warn!(error = %err, title = %self.title, "submission failed, queueing locally");
                let pending = queue.enqueue(&result).await?;
                self.phase = Phase::Idle;
                Ok(SessionOutcome::Queued {
                    scores: result.scores,
                    pending,
                })
            }
        }
    }

    pub fn close(&mut self) {
        self.phase = Phase::Idle;
        self.feedback = None;
    }
}

/// Free practice on a single sentence. The evaluation is only shown; nothing is stored or queued.
pub async fn practice_sentence(
    evaluator: &dyn SpeechEvaluator,
    sentence: &str,
    audio: &AudioClip,
) -> AppResult<Evaluation> {
    let sentence = sentence.trim();
    if sentence.is_empty() {
        return Err(AppError::Validation("enter a sentence to practice".into()));
    }
    let evaluation = evaluator.evaluate(sentence, audio).await?;
    info!(total = evaluation.scores.total(), "practice sentence scored");
    Ok(evaluation)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushReport {
    pub submitted: usize,
    pub remaining: usize,
}

/// Results whose write failed, kept as a JSON array on local disk until flushed.
#[derive(Debug, Clone)]
pub struct SubmissionQueue {
    path: PathBuf,
}

impl SubmissionQueue {
    pub fn new(session_dir: &Path) -> Self {
        Self {
            path: session_dir.join(PENDING_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn pending(&self) -> AppResult<Vec<TestResult>> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(self.io_error("read", err)),
        };
        serde_json::from_str(&raw).map_err(|e| {
            AppError::Session(format!("{} is corrupt: {e}", self.path.display()))
        })
    }

    /// Returns the queue length after appending.
    pub async fn enqueue(&self, result: &TestResult) -> AppResult<usize> {
        let mut pending = self.pending().await?;
        pending.push(result.clone());
        self.save(&pending).await?;
        Ok(pending.len())
    }

    async fn save(&self, pending: &[TestResult]) -> AppResult<()> {
        if pending.is_empty() {
            return match tokio::fs::remove_file(&self.path).await {
                Ok(()) => Ok(()),
                Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
                Err(err) => Err(self.io_error("clear", err)),
            };
        }
        if let Some(dir) = self.path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| self.io_error("create directory for", e))?;
        }
        let body = serde_json::to_string_pretty(pending)
            .map_err(|e| AppError::Session(e.to_string()))?;
        tokio::fs::write(&self.path, body)
            .await
            .map_err(|e| self.io_error("write", e))
    }

    /// Retries every queued result in order; failures stay queued.
    pub async fn flush(&self, store: &dyn DocumentStore) -> AppResult<FlushReport> {
        let pending = self.pending().await?;
        let mut remaining = Vec::new();
        let mut submitted = 0;

        for result in pending {
            match repo::submit_result(store, &result).await {
                Ok(_) => submitted += 1,
                Err(err) => {
                    warn!(error = %err, title = %result.test_title, "queued submission still failing");
                    remaining.push(result);
                }
            }
        }

        self.save(&remaining).await?;
        info!(submitted, remaining = remaining.len(), "submission queue flushed");
        Ok(FlushReport {
            submitted,
            remaining: remaining.len(),
        })
    }

    fn io_error(&self, action: &str, err: std::io::Error) -> AppError {
        AppError::Session(format!("cannot {action} {}: {err}", self.path.display()))
    }
}

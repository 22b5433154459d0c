use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use chrono::{Local, Utc};
use clap::{ArgGroup, Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;

mod auth;
mod cache;
mod config;
mod content;
mod dashboard;
mod db;
mod error;
mod evaluator;
mod export;
mod logging;
mod models;
mod report;
mod repo;
mod session;
mod store;
mod table;

use crate::auth::{AccessPolicy, GateOutcome, LocalSession, ProfileForm, SessionUser};
use crate::cache::ViewCache;
use crate::config::AppConfig;
use crate::content::{ContentNode, Library, PickerAction};
use crate::db::PgDocumentStore;
use crate::error::AppError;
use crate::evaluator::{AudioClip, GeminiEvaluator, SpeechEvaluator};
use crate::models::{Cohort, RetakePolicy, Role};
use crate::repo::AssignmentDraft;
use crate::session::{Phase, SessionOutcome, SubmissionQueue, TestSession};
use crate::store::DocumentStore;
use crate::table::{
    ResultFilters, ResultSortKey, Selection, SortDirection, SortState, TableView, UserSortKey,
    RESULTS_DEFAULT_DIRECTION, USERS_DEFAULT_DIRECTION,
};

#[derive(Parser)]
#[command(name = "speakup-admin")]
#[command(about = "Speak Up assignments, results and speaking tests", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args, Default)]
struct ProfileArgs {
    #[arg(long)]
    role: Option<Role>,
    #[arg(long)]
    grade: Option<String>,
    #[arg(long)]
    class: Option<String>,
    #[arg(long)]
    student_number: Option<String>,
}

impl ProfileArgs {
    fn is_empty(&self) -> bool {
        self.role.is_none()
            && self.grade.is_none()
            && self.class.is_none()
            && self.student_number.is_none()
    }

    fn into_form(self) -> ProfileForm {
        ProfileForm {
            role: self.role,
            grade: self.grade,
            class: self.class,
            student_number: self.student_number,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Load realistic seed data
    Seed,
    /// Import students from a CSV roster (name,email,grade,class,student_number)
    ImportRoster {
        #[arg(long)]
        csv: PathBuf,
    },
    /// Sign in with an identity-provider ID token, completing the profile if needed
    SignIn {
        #[arg(long)]
        id_token: String,
        #[command(flatten)]
        profile: ProfileArgs,
    },
    /// Forget the locally cached user
    SignOut,
    /// Update role, grade, class and number of the signed-in user
    Profile {
        #[command(flatten)]
        profile: ProfileArgs,
    },
    /// List student classes
    Cohorts,
    /// List registered users
    Users {
        #[arg(long)]
        sort: Option<UserSortKey>,
        #[arg(long)]
        direction: Option<SortDirection>,
    },
    /// List assignments
    Assignments,
    /// Create an assignment, or update one with --id
    AssignmentSave {
        #[arg(long)]
        id: Option<String>,
        #[arg(long)]
        title: String,
        #[arg(long, default_value = "")]
        description: String,
        #[arg(long = "question")]
        questions: Vec<String>,
        /// Content JSON used with --pick
        #[arg(long)]
        content: Option<PathBuf>,
        /// Content node to select, as "Book/Unit/Section[/Sentence]"
        #[arg(long = "pick", requires = "content")]
        picks: Vec<String>,
        #[arg(long = "class")]
        classes: Vec<String>,
        #[arg(long, default_value = "once")]
        retake: RetakePolicy,
    },
    /// Delete an assignment
    AssignmentDelete {
        #[arg(long)]
        id: String,
    },
    /// Show the signed-in student's assignments
    MyAssignments,
    /// Show test results; omit a filter to include everything. Repeat --sort
    /// to toggle like clicking a column header
    Results {
        #[arg(long)]
        assignment: Option<String>,
        #[arg(long)]
        cohort: Option<Cohort>,
        #[arg(long)]
        creator: Option<String>,
        #[arg(long = "sort")]
        sort: Vec<ResultSortKey>,
    },
    /// Summarize recent activity and class performance
    Dashboard,
    /// Write the student × assignment grade sheet
    ExportCsv {
        #[arg(long = "class", required = true)]
        classes: Vec<Cohort>,
        #[arg(long = "assignment", required = true)]
        titles: Vec<String>,
        #[arg(long, default_value = ".")]
        out_dir: PathBuf,
    },
    /// Take a speaking test, one audio file per question
    #[command(group(
        ArgGroup::new("source")
            .args(["assignment", "content"])
            .required(true)
            .multiple(false)
    ))]
    TakeTest {
        #[arg(long)]
        assignment: Option<String>,
        #[arg(long)]
        content: Option<PathBuf>,
        #[arg(long, requires = "content")]
        book: Option<String>,
        #[arg(long = "unit")]
        units: Vec<String>,
        #[arg(long)]
        section: Option<String>,
        #[arg(long, default_value_t = 10)]
        count: usize,
        #[arg(long = "audio", required = true)]
        audio: Vec<PathBuf>,
        #[arg(long, default_value_t = 3)]
        attempts: usize,
    },
    /// Score one sentence for practice; nothing is saved
    Practice {
        #[arg(long)]
        sentence: String,
        #[arg(long)]
        audio: PathBuf,
    },
    /// Retry results that failed to submit
    FlushSubmissions,
}

fn evaluator(config: &AppConfig) -> anyhow::Result<GeminiEvaluator> {
    let api_key = config
        .gemini_api_key
        .clone()
        .context("GEMINI_API_KEY must be set to evaluate recordings")?;
    Ok(GeminiEvaluator::new(
        api_key,
        config.gemini_model.clone(),
        config.evaluation_timeout,
    )?)
}

async fn connect(config: &AppConfig) -> anyhow::Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(5)
        .connect(config.database_url()?)
        .await
        .context("failed to connect to Postgres")
}

/// Admin commands re-check the teacher allow-list; a refusal signs the user out.
async fn require_admin(
    local: &LocalSession,
    store: &dyn DocumentStore,
) -> anyhow::Result<SessionUser> {
    let user = local.require().await?;
    if let Err(err) = auth::require_teacher(store, &user).await {
        if matches!(err, AppError::Authorization(_)) {
            local.clear().await?;
        }
        return Err(err.into());
    }
    Ok(user)
}

fn picked_sentences(library: &Library, picks: &[String]) -> anyhow::Result<Vec<String>> {
    let mut tree = ContentNode::from_library(library);
    for pick in picks {
        let labels: Vec<&str> = pick.split('/').map(str::trim).collect();
        let path = tree
            .path_by_labels(&labels)
            .with_context(|| format!("no content node at '{pick}'"))?;
        tree = content::reduce(&tree, &PickerAction::SetChecked { path, checked: true });
    }
    Ok(tree.selected_sentences())
}

async fn practice_session(
    path: &Path,
    book: Option<String>,
    units: &[String],
    section: Option<String>,
    count: usize,
) -> anyhow::Result<TestSession> {
    let library = Library::load(path).await?;
    let book = match book {
        Some(book) => book,
        None => library
            .books
            .first()
            .map(|b| b.title.clone())
            .context("content file has no books")?,
    };
    let test = match section {
        Some(section) => {
            let [unit] = units else {
                bail!("--section needs exactly one --unit");
            };
            content::section_test(&library, &book, unit, &section)?
        }
        None => content::unit_review(&library, &book, units, count, &mut rand::rng())?,
    };
    Ok(TestSession::start(&test.title, test.questions)?)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::from_env()?;
    logging::init_tracing(&config.log_level);

    let local = LocalSession::new(&config.session_dir);
    // These never open a database connection.
    match &cli.command {
        Commands::SignOut => {
            local.clear().await?;
            println!("Signed out.");
            return Ok(());
        }
        Commands::Practice { sentence, audio } => {
            let clip = AudioClip::from_file(audio)
                .await
                .with_context(|| format!("failed to read {}", audio.display()))?;
            let evaluator = evaluator(&config)?;
            let evaluation = session::practice_sentence(&evaluator, sentence, &clip).await?;
            print!("{}", report::build_feedback(0, 1, sentence.trim(), &evaluation));
            return Ok(());
        }
        _ => {}
    }

    let pool = connect(&config).await?;
    let store = PgDocumentStore::new(pool.clone());
    let cache = ViewCache::new(&store);

    match cli.command {
        Commands::SignOut | Commands::Practice { .. } => {}
        Commands::InitDb => {
            db::init_db(&pool).await?;
            println!("Schema ready.");
        }
        Commands::Seed => {
            db::seed(&store).await?;
            println!("Seed data inserted.");
        }
        Commands::ImportRoster { csv } => {
            let imported = db::import_roster(&store, &csv).await?;
            println!("Imported {imported} students from {}.", csv.display());
        }
        Commands::SignIn { id_token, profile } => {
            let claims = match auth::decode_id_token(&id_token) {
                Ok(claims) => claims,
                Err(err) => {
                    local.clear().await?;
                    return Err(err.into());
                }
            };
            let policy = AccessPolicy::from_config(&config);
            let outcome = match auth::resolve(&store, &policy, &claims).await {
                Ok(outcome) => outcome,
                Err(err) => {
                    if matches!(err, AppError::Authorization(_)) {
                        local.clear().await?;
                    }
                    return Err(err.into());
                }
            };

            let user = match outcome {
                GateOutcome::Ready(user) => user,
                GateOutcome::NeedsProfile(draft) if profile.is_empty() => {
                    println!(
                        "Profile required for {} (default role: {}).",
                        draft.email, draft.default_role
                    );
                    println!("Re-run with --role and, for students, --grade --class --student-number.");
                    return Ok(());
                }
                GateOutcome::NeedsProfile(draft) => {
                    auth::complete_profile(&store, &draft, &profile.into_form(), Utc::now())
                        .await
                        .context("profile was not saved; try again")?
                }
            };
            cache.invalidate_users();
            local.save(&user).await?;
            let role = user.profile.role.map(|r| r.to_string()).unwrap_or_default();
            println!("Signed in as {} <{}> ({role}).", user.profile.name, user.profile.email);
        }
        Commands::Profile { profile } => {
            let user = local.require().await?;
            let updated =
                auth::update_profile(&store, &user, &profile.into_form(), Utc::now()).await?;
            cache.invalidate_users();
            local.save(&updated).await?;
            println!("Profile updated.");
        }
        Commands::Cohorts => {
            require_admin(&local, &store).await?;
            let cohorts = repo::fetch_student_cohorts(&store).await?;
            if cohorts.is_empty() {
                println!("No classes found.");
            }
            for cohort in cohorts {
                let label = cohort
                    .parse::<Cohort>()
                    .map(|c| c.label())
                    .unwrap_or_else(|_| cohort.clone());
                println!("{cohort}\t{label}");
            }
        }
        Commands::Users { sort, direction } => {
            require_admin(&local, &store).await?;
            let sort_state = sort.map(|key| {
                SortState::new(key, direction.unwrap_or(USERS_DEFAULT_DIRECTION))
            });
            eprint!("{}", report::build_users_table(&TableView::Loading));
            let view = match TableView::from_load(cache.users().await) {
                TableView::Rows(mut users) => {
                    table::sort_users(&mut users, sort_state.as_ref());
                    TableView::Rows(users)
                }
                other => other,
            };
            print!("{}", report::build_users_table(&view));
        }
        Commands::Assignments => {
            require_admin(&local, &store).await?;
            eprint!("{}", report::build_assignment_list(&TableView::Loading));
            let view = TableView::from_load(cache.assignments().await);
            print!("{}", report::build_assignment_list(&view));
        }
        Commands::AssignmentSave {
            id,
            title,
            description,
            mut questions,
            content,
            picks,
            classes,
            retake,
        } => {
            let user = require_admin(&local, &store).await?;
            if let Some(path) = content {
                let library = Library::load(&path).await?;
                questions.extend(picked_sentences(&library, &picks)?);
            }
            let draft = AssignmentDraft {
                title,
                description,
                questions,
                assigned_classes: classes,
                retake_policy: retake,
            };
            let saved = repo::save_assignment(&store, id.as_deref(), draft, &user.profile, Utc::now())
                .await?;
            cache.invalidate_assignments();
            println!("Assignment {saved} saved.");
            let view = TableView::from_load(cache.assignments().await);
            print!("{}", report::build_assignment_list(&view));
        }
        Commands::AssignmentDelete { id } => {
            require_admin(&local, &store).await?;
            repo::delete_assignment(&store, &id).await?;
            cache.invalidate_assignments();
            println!("Assignment {id} deleted.");
        }
        Commands::MyAssignments => {
            let user = local.require().await?;
            if !user.profile.is_student() {
                bail!("my-assignments is only available to students");
            }
            let board = repo::student_board(&store, &user.profile).await?;
            print!("{}", report::build_board(&board));
        }
        Commands::Results {
            assignment,
            cohort,
            creator,
            sort,
        } => {
            require_admin(&local, &store).await?;
            let filters = ResultFilters {
                assignment: Selection::from(assignment),
                cohort: Selection::from(cohort),
                creator: Selection::from(creator),
            };
            let mut sort_state = SortState::default();
            for key in sort {
                sort_state.toggle(key, RESULTS_DEFAULT_DIRECTION);
            }

            eprint!("{}", report::build_results_table(&TableView::Loading, &sort_state));
            let loaded = tokio::try_join!(cache.results(), cache.assignments()).map(
                |(results, assignments)| {
                    table::render_results(&results, &filters, &sort_state, &assignments)
                },
            );
            let view = TableView::from_load(loaded);
            print!("{}", report::build_results_table(&view, &sort_state));
        }
        Commands::Dashboard => {
            require_admin(&local, &store).await?;
            let (results, users, assignments) =
                tokio::try_join!(cache.results(), cache.users(), cache.assignments())?;
            let metrics = dashboard::summarize(&results, &users, &assignments, Local::now());
            print!("{}", report::build_dashboard(&metrics));
        }
        Commands::ExportCsv {
            classes,
            titles,
            out_dir,
        } => {
            require_admin(&local, &store).await?;
            let (users, results) = tokio::try_join!(cache.users(), cache.results())?;
            let bytes = export::build_pivot(&users, &results, &classes, &titles)?;
            let out = out_dir.join(export::pivot_filename(Utc::now()));
            tokio::fs::write(&out, bytes)
                .await
                .with_context(|| format!("failed to write {}", out.display()))?;
            println!("Grade sheet written to {}.", out.display());
        }
        Commands::TakeTest {
            assignment,
            content,
            book,
            units,
            section,
            count,
            audio,
            attempts,
        } => {
            let user = local.require().await?;
            let mut session = match (assignment, content) {
                (Some(id), _) => {
                    let board = repo::student_board(&store, &user.profile).await?;
                    TestSession::start_assignment(&board, &id)?
                }
                (None, Some(path)) => practice_session(&path, book, &units, section, count).await?,
                (None, None) => bail!("pass --assignment or --content"),
            };
            let evaluator = evaluator(&config)?;
            info!(title = %session.title(), questions = session.question_count(), "test started");

            for path in &audio {
                if session.phase() != Phase::InProgress {
                    break;
                }
                if session.can_play_model() {
                    if let Some(question) = session.current_question() {
                        println!(
                            "Question {}/{}: {question}",
                            session.current_index() + 1,
                            session.question_count()
                        );
                    }
                }
                let clip = AudioClip::from_file(path)
                    .await
                    .with_context(|| format!("failed to read {}", path.display()))?;

                for _ in 0..attempts.max(1) {
                    session.start_recording()?;
                    let reference = session.stop_recording()?;
                    let outcome = evaluator.evaluate(&reference, &clip).await;
                    session.apply_evaluation(outcome)?;
                    if let Some(feedback) = session.feedback() {
                        print!(
                            "{}",
                            report::build_feedback(
                                session.current_index(),
                                session.question_count(),
                                &reference,
                                feedback
                            )
                        );
                        break;
                    }
                    if let Some(err) = session.last_error() {
                        eprintln!("Evaluation failed: {err}");
                    }
                }

                if session.phase() == Phase::Feedback {
                    session.next()?;
                } else {
                    break;
                }
            }
            if session.phase() != Phase::Summarizing {
                session.end()?;
            }
            println!(
                "Answered {} of {} questions.",
                session.answered(),
                session.question_count()
            );

            let queue = SubmissionQueue::new(&config.session_dir);
            match session
                .finish(&store, &queue, &user.profile, Utc::now())
                .await?
            {
                SessionOutcome::Discarded => println!("No answers recorded; nothing submitted."),
                SessionOutcome::Submitted { id, scores } => {
                    cache.invalidate_results();
                    println!("{}", report::build_summary(session.title(), &scores));
                    println!("Result {id} submitted.");
                    session.close();
                }
                SessionOutcome::Queued { scores, pending } => {
                    println!("{}", report::build_summary(session.title(), &scores));
                    println!(
                        "Submission failed; {pending} result(s) waiting in {}. Run flush-submissions to retry.",
                        queue.path().display()
                    );
                }
            }
        }
        Commands::FlushSubmissions => {
            let queue = SubmissionQueue::new(&config.session_dir);
            let report = queue.flush(&store).await?;
            if report.submitted > 0 {
                cache.invalidate_results();
            }
            println!(
                "Submitted {} queued result(s); {} still pending.",
                report.submitted, report.remaining
            );
        }
    }

    Ok(())
}

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::error::{AppError, AppResult};
use crate::models::{Role, UserProfile};
use crate::repo::{self, ProfileUpdate};
use crate::store::DocumentStore;

pub const SESSION_FILE: &str = "userProfile.json";

/// Claims read from the identity provider's ID token. The signature is not checked here.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct IdentityClaims {
    pub email: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub picture: String,
    /// Hosted domain of a workspace account.
    #[serde(default)]
    pub hd: Option<String>,
}

pub fn decode_id_token(token: &str) -> AppResult<IdentityClaims> {
    let malformed = || AppError::Authorization("malformed identity token".into());
    let mut segments = token.trim().split('.');
    let (Some(_header), Some(payload), Some(_signature), None) =
        (segments.next(), segments.next(), segments.next(), segments.next())
    else {
        return Err(malformed());
    };
    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|_| malformed())?;
    let mut claims: IdentityClaims = serde_json::from_slice(&bytes).map_err(|_| malformed())?;
    claims.email = claims.email.trim().to_ascii_lowercase();
    if claims.email.is_empty() {
        return Err(malformed());
    }
    Ok(claims)
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AccessPolicy {
    pub allowed_domain: Option<String>,
    pub allowed_emails: Vec<String>,
}

impl AccessPolicy {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            allowed_domain: config.allowed_domain.clone(),
            allowed_emails: config.allowed_emails.clone(),
        }
    }

    pub fn check(&self, claims: &IdentityClaims) -> AppResult<()> {
        let domain_ok = match (&self.allowed_domain, &claims.hd) {
            (Some(allowed), Some(hd)) => allowed.eq_ignore_ascii_case(hd),
            _ => false,
        };
        if domain_ok || self.allowed_emails.iter().any(|e| *e == claims.email) {
            return Ok(());
        }
        warn!(email = %claims.email, hd = ?claims.hd, "sign-in rejected by access policy");
        Err(AppError::Authorization(format!(
            "{} is not permitted to use this app",
            claims.email
        )))
    }
}

/// The signed-in user as cached on the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionUser {
    #[serde(flatten)]
    pub profile: UserProfile,
    #[serde(default)]
    pub is_teacher: bool,
}

/// Identity with no stored profile yet.
#[derive(Debug, Clone, PartialEq)]
pub struct ProfileDraft {
    pub email: String,
    pub name: String,
    pub picture: String,
    pub default_role: Role,
    pub is_teacher: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum GateOutcome {
    Ready(SessionUser),
    NeedsProfile(ProfileDraft),
}

/// Identity fields win over stored ones; role and roster fields come from the store.
pub async fn resolve(
    store: &dyn DocumentStore,
    policy: &AccessPolicy,
    claims: &IdentityClaims,
) -> AppResult<GateOutcome> {
    policy.check(claims)?;
    let is_teacher = repo::is_teacher(store, &claims.email).await?;

    match repo::get_user(store, &claims.email).await? {
        Some(stored) => {
            let profile = UserProfile {
                email: claims.email.clone(),
                name: claims.name.clone(),
                picture: claims.picture.clone(),
                ..stored
            };
            info!(email = %profile.email, is_teacher, "signed in");
            Ok(GateOutcome::Ready(SessionUser {
                profile,
                is_teacher,
            }))
        }
        None => Ok(GateOutcome::NeedsProfile(ProfileDraft {
            email: claims.email.clone(),
            name: claims.name.clone(),
            picture: claims.picture.clone(),
            default_role: if is_teacher {
                Role::Teacher
            } else {
                Role::Student
            },
            is_teacher,
        })),
    }
}

/// Raw profile form input.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProfileForm {
    pub role: Option<Role>,
    pub grade: Option<String>,
    pub class: Option<String>,
    pub student_number: Option<String>,
}

fn parse_positive(label: &str, raw: Option<&str>) -> AppResult<u32> {
    let raw = raw.map(str::trim).unwrap_or_default();
    match raw.parse::<u32>() {
        Ok(value) if value > 0 => Ok(value),
        _ => Err(AppError::Validation(format!(
            "{label} must be a positive whole number"
        ))),
    }
}

impl ProfileForm {
    pub fn validate(&self, default_role: Role, is_teacher: bool) -> AppResult<ProfileUpdate> {
        let role = self.role.unwrap_or(default_role);
        match role {
            Role::Teacher if !is_teacher => Err(AppError::Authorization(
                "only allow-listed teachers can take the teacher role".into(),
            )),
            Role::Teacher => Ok(ProfileUpdate {
                role,
                grade: None,
                class: None,
                student_number: None,
            }),
            Role::Student => Ok(ProfileUpdate {
                role,
                grade: Some(parse_positive("grade", self.grade.as_deref())?),
                class: Some(parse_positive("class", self.class.as_deref())?),
                student_number: Some(parse_positive(
                    "student number",
                    self.student_number.as_deref(),
                )?),
            }),
        }
    }
}

/// Persists the first profile. A store failure leaves the caller on the form.
pub async fn complete_profile(
    store: &dyn DocumentStore,
    draft: &ProfileDraft,
    form: &ProfileForm,
    now: DateTime<Utc>,
) -> AppResult<SessionUser> {
    let update = form.validate(draft.default_role, draft.is_teacher)?;
    let mut profile = UserProfile {
        email: draft.email.clone(),
        name: draft.name.clone(),
        picture: draft.picture.clone(),
        role: None,
        grade: None,
        class: None,
        student_number: None,
    };
    update.apply(&mut profile);
    repo::create_user(store, &profile, now).await?;
    Ok(SessionUser {
        profile,
        is_teacher: draft.is_teacher,
    })
}

pub async fn update_profile(
    store: &dyn DocumentStore,
    user: &SessionUser,
    form: &ProfileForm,
    now: DateTime<Utc>,
) -> AppResult<SessionUser> {
    let current = user.profile.role.unwrap_or(Role::Student);
    let update = form.validate(current, user.is_teacher)?;
    repo::update_user(store, &user.profile.email, &update, now).await?;
    let mut updated = user.clone();
    update.apply(&mut updated.profile);
    Ok(updated)
}

/// Admin views re-check the allow-list rather than trusting the cached flag.
pub async fn require_teacher(store: &dyn DocumentStore, user: &SessionUser) -> AppResult<()> {
    if repo::is_teacher(store, &user.profile.email).await? {
        return Ok(());
    }
    warn!(email = %user.profile.email, "admin access denied");
    Err(AppError::Authorization(format!(
        "{} is not a registered teacher",
        user.profile.email
    )))
}

/// The signed-in user, kept on local disk between commands.
#[derive(Debug, Clone)]
pub struct LocalSession {
    path: PathBuf,
}

impl LocalSession {
    pub fn new(session_dir: &Path) -> Self {
        Self {
            path: session_dir.join(SESSION_FILE),
        }
    }

    pub async fn save(&self, user: &SessionUser) -> AppResult<()> {
        if let Some(dir) = self.path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| AppError::Session(format!("cannot create {}: {e}", dir.display())))?;
        }
        let body = serde_json::to_string_pretty(user).map_err(|e| AppError::Session(e.to_string()))?;
        tokio::fs::write(&self.path, body)
            .await
            .map_err(|e| AppError::Session(format!("cannot write {}: {e}", self.path.display())))
    }

    /// A missing or unreadable file means nobody is signed in.
    pub async fn load(&self) -> Option<SessionUser> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return None,
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "cannot read local session");
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(user) => Some(user),
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "discarding corrupt local session");
                None
            }
        }
    }

    pub async fn require(&self) -> AppResult<SessionUser> {
        self.load()
            .await
            .ok_or_else(|| AppError::Session("not signed in; run sign-in first".into()))
    }

    pub async fn clear(&self) -> AppResult<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(AppError::Session(format!(
                "cannot remove {}: {err}",
                self.path.display()
            ))),
        }
    }
}

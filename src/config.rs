use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};

const DEFAULT_MODEL: &str = "gemini-2.5-flash";
const DEFAULT_EVALUATION_TIMEOUT_SECS: u64 = 60;
const DEFAULT_SESSION_DIR: &str = "./.speakup";

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database_url: Option<String>,
    pub allowed_domain: Option<String>,
    pub allowed_emails: Vec<String>,
    pub gemini_api_key: Option<String>,
    pub gemini_model: String,
    pub evaluation_timeout: Duration,
    pub session_dir: PathBuf,
    pub log_level: String,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let allowed_emails = env_string("ALLOWED_EMAILS")
            .map(|raw| parse_email_list(&raw))
            .unwrap_or_default();
        let evaluation_timeout = match env_string("EVALUATION_TIMEOUT_SECS") {
            Some(raw) => raw
                .parse::<u64>()
                .with_context(|| format!("EVALUATION_TIMEOUT_SECS must be an integer, got '{raw}'"))?,
            None => DEFAULT_EVALUATION_TIMEOUT_SECS,
        };
        if evaluation_timeout == 0 {
            bail!("EVALUATION_TIMEOUT_SECS must be greater than zero");
        }

        Ok(Self {
            database_url: env_string("DATABASE_URL"),
            allowed_domain: env_string("ALLOWED_DOMAIN"),
            allowed_emails,
            gemini_api_key: env_string("GEMINI_API_KEY"),
            gemini_model: env_string("GEMINI_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            evaluation_timeout: Duration::from_secs(evaluation_timeout),
            session_dir: env_string("SESSION_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_SESSION_DIR)),
            log_level: env_string("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
        })
    }

    pub fn database_url(&self) -> Result<&str> {
        self.database_url
            .as_deref()
            .context("DATABASE_URL must be set to a production Postgres instance")
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_email_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|email| email.trim().to_ascii_lowercase())
        .filter(|email| !email.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn email_list_is_trimmed_and_lowercased() {
        let emails = parse_email_list(" Teacher@Example.com, ,other@example.com ");
        assert_eq!(emails, vec!["teacher@example.com", "other@example.com"]);
    }
}

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, bail};

/// Placeholder JWT secrets that MUST NOT be used.
const PLACEHOLDER_SECRETS: &[&str] = &[
    "change-me-to-a-random-string",
    "dev-secret-change-me",
];

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    pub jwt_secret: String,
    pub token_ttl_days: i64,
    pub gemini_api_key: Option<String>,
    pub gemini_model: String,
    pub generation_timeout: Duration,
    pub daily_ideas: i64,
    pub rate_limit_window: Duration,
    pub rate_limit_max: i64,
    pub job_concurrency: usize,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let var = |key: &str, default: &str| {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| default.to_string())
        };
        let parsed = |key: &str, default: &str| -> anyhow::Result<u64> {
            var(key, default)
                .parse()
                .with_context(|| format!("{} must be a non-negative integer", key))
        };
        let signed = |key: &str, default: &str| -> anyhow::Result<i64> {
            i64::try_from(parsed(key, default)?)
                .with_context(|| format!("{} is out of range", key))
        };

        let jwt_secret = lookup("IDEASPARK_JWT_SECRET").unwrap_or_default();
        if jwt_secret.is_empty() || PLACEHOLDER_SECRETS.contains(&jwt_secret.as_str()) {
            bail!("IDEASPARK_JWT_SECRET is unset or still a placeholder; set it in your .env file");
        }

        let port = var("IDEASPARK_PORT", "4888")
            .parse()
            .context("IDEASPARK_PORT must be a port number")?;
        let job_concurrency = usize::try_from(parsed("IDEASPARK_JOB_CONCURRENCY", "5")?.max(1))
            .context("IDEASPARK_JOB_CONCURRENCY is out of range")?;

        Ok(Self {
            host: var("IDEASPARK_HOST", "0.0.0.0"),
            port,
            db_path: var("IDEASPARK_DB_PATH", "ideaspark.db").into(),
            jwt_secret,
            token_ttl_days: signed("IDEASPARK_TOKEN_TTL_DAYS", "30")?,
            gemini_api_key: lookup("GEMINI_API_KEY").filter(|k| !k.trim().is_empty()),
            gemini_model: var("GEMINI_MODEL", "gemini-1.5-flash"),
            generation_timeout: Duration::from_secs(parsed(
                "IDEASPARK_GENERATION_TIMEOUT_SECS",
                "30",
            )?),
            daily_ideas: signed("IDEASPARK_DAILY_IDEAS", "10")?,
            rate_limit_window: Duration::from_secs(parsed(
                "IDEASPARK_RATE_LIMIT_WINDOW_SECS",
                "900",
            )?),
            rate_limit_max: signed("IDEASPARK_RATE_LIMIT_MAX", "100")?,
            job_concurrency,
        })
    }
}

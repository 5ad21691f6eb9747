//! Backend configuration parsed from environment variables.

pub const DEFAULT_PROFILES_TABLE: &str = "profiles";
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required env var {0}")]
    Missing(&'static str),

    #[error("invalid value for {var}: {value}")]
    Invalid { var: &'static str, value: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub request_secs: u64,
    pub connect_secs: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self { request_secs: DEFAULT_REQUEST_TIMEOUT_SECS, connect_secs: DEFAULT_CONNECT_TIMEOUT_SECS }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendConfig {
    /// Project base URL, without trailing slash.
    pub url: String,
    /// Public (anon) API key sent with every request.
    pub anon_key: String,
    /// Landing URL embedded in magic-link and confirmation emails.
    pub redirect_url: Option<String>,
    pub profiles_table: String,
    pub timeouts: Timeouts,
}

impl BackendConfig {
    #[must_use]
    pub fn new(url: impl Into<String>, anon_key: impl Into<String>) -> Self {
        Self {
            url: url.into().trim_end_matches('/').to_owned(),
            anon_key: anon_key.into(),
            redirect_url: None,
            profiles_table: DEFAULT_PROFILES_TABLE.to_owned(),
            timeouts: Timeouts::default(),
        }
    }

    /// Build config from environment variables.
    ///
    /// Required:
    /// - `SONGBOOK_URL`
    /// - `SONGBOOK_ANON_KEY`
    ///
    /// Optional:
    /// - `SONGBOOK_REDIRECT_URL`
    /// - `SONGBOOK_PROFILES_TABLE`: default `profiles`
    /// - `SONGBOOK_REQUEST_TIMEOUT_SECS`: default 30
    /// - `SONGBOOK_CONNECT_TIMEOUT_SECS`: default 10
    ///
    /// # Errors
    ///
    /// Returns an error if a required variable is missing or a URL/number is malformed.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_with(None, None)
    }

    /// [`BackendConfig::from_env`] where an explicit URL or key (from the
    /// command line) takes precedence over the environment.
    ///
    /// # Errors
    ///
    /// Same as [`BackendConfig::from_env`].
    pub fn from_env_with(url: Option<String>, anon_key: Option<String>) -> Result<Self, ConfigError> {
        let url = match url {
            Some(url) => url,
            None => required("SONGBOOK_URL")?,
        };
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(ConfigError::Invalid { var: "SONGBOOK_URL", value: url });
        }
        let anon_key = match anon_key {
            Some(key) => key,
            None => required("SONGBOOK_ANON_KEY")?,
        };

        let mut config = Self::new(url, anon_key);
        config.redirect_url = optional("SONGBOOK_REDIRECT_URL");
        if let Some(table) = optional("SONGBOOK_PROFILES_TABLE") {
            config.profiles_table = table;
        }
        config.timeouts = Timeouts {
            request_secs: env_parse_u64("SONGBOOK_REQUEST_TIMEOUT_SECS", DEFAULT_REQUEST_TIMEOUT_SECS)?,
            connect_secs: env_parse_u64("SONGBOOK_CONNECT_TIMEOUT_SECS", DEFAULT_CONNECT_TIMEOUT_SECS)?,
        };
        Ok(config)
    }
}

fn optional(var: &str) -> Option<String> {
    std::env::var(var).ok().map(|v| v.trim().to_owned()).filter(|v| !v.is_empty())
}

fn required(var: &'static str) -> Result<String, ConfigError> {
    optional(var).ok_or(ConfigError::Missing(var))
}

fn env_parse_u64(var: &'static str, default: u64) -> Result<u64, ConfigError> {
    match optional(var) {
        None => Ok(default),
        Some(value) => value.parse::<u64>().map_err(|_| ConfigError::Invalid { var, value }),
    }
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;

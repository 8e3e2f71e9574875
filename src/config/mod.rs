//! Configuration loading.
//!
//! Configuration lives in `config.toml` or `config.json` under
//! `$XDG_CONFIG_HOME/pr-maildir/` (or `~/.config/pr-maildir/`):
//!
//! ```toml
//! maildir = "/home/me/Mail/bitbucket"
//! state_db = "/home/me/.local/state/pr-maildir/state.db"   # optional
//! message_id_domain = "bitbucket.example.com"             # optional
//! comment_threads = "nested"                              # or "top-level"
//!
//! [api]
//! endpoint = "https://bitbucket.example.com/rest/api/1.0"
//! token_file = "/home/me/.config/pr-maildir/token"        # or token = "..."
//! ```
//!
//! The file is parsed into [`Config`], command line overrides are applied, and
//! the result is resolved into [`Settings`], where every value is present.

use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::reconcile::CommentThreads;

/// Directory name under the user configuration directory.
pub const APP_DIR: &str = "pr-maildir";

/// Configuration file names, in the order they are tried.
pub const CANDIDATE_FILES: [&str; 2] = ["config.toml", "config.json"];

/// State database file name used when `state_db` is not configured.
pub const DEFAULT_STATE_DB: &str = ".pr-maildir.db";

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration: {0}")]
    Io(#[from] io::Error),

    #[error("invalid TOML configuration: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("invalid JSON configuration: {0}")]
    Json(#[from] serde_json::Error),

    #[error("no usable configuration file in {}", .0.display())]
    NotFound(PathBuf),

    #[error("api.token_file or api.token must be provided")]
    MissingToken,

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Result type for configuration operations.
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Configuration as written in the file. Every field may be overridden.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub maildir: Option<PathBuf>,

    #[serde(default)]
    pub state_db: Option<PathBuf>,

    #[serde(default)]
    pub message_id_domain: Option<String>,

    #[serde(default)]
    pub comment_threads: CommentThreads,

    #[serde(default)]
    pub api: ApiConfig,
}

/// The `[api]` section.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default)]
    pub endpoint: Option<String>,

    #[serde(default)]
    pub token: Option<String>,

    #[serde(default, alias = "tokenFile")]
    pub token_file: Option<PathBuf>,
}

/// Values given on the command line or in the environment.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub maildir: Option<PathBuf>,
    pub state_db: Option<PathBuf>,
    pub endpoint: Option<String>,
    pub token: Option<String>,
}

/// Fully resolved configuration.
#[derive(Clone)]
pub struct Settings {
    pub maildir: PathBuf,
    pub state_db: PathBuf,
    pub message_id_domain: String,
    pub comment_threads: CommentThreads,
    pub endpoint: String,
    pub token: String,
}

impl std::fmt::Debug for Settings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Settings")
            .field("maildir", &self.maildir)
            .field("state_db", &self.state_db)
            .field("message_id_domain", &self.message_id_domain)
            .field("comment_threads", &self.comment_threads)
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

impl Config {
    /// Parses configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Parses configuration from a JSON string.
    pub fn from_json(content: &str) -> Result<Self> {
        Ok(serde_json::from_str(content)?)
    }

    /// Loads one file, choosing the parser by extension (`.json` or TOML).
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        if path.extension().is_some_and(|ext| ext == "json") {
            Self::from_json(&content)
        } else {
            Self::from_toml(&content)
        }
    }

    /// Loads the first usable candidate file in `dir`.
    ///
    /// Missing candidates and candidates that fail to parse are skipped. A
    /// candidate that exists but is not a regular file is an error.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::NotFound` if no candidate could be loaded.
    pub fn discover(dir: &Path) -> Result<(Self, PathBuf)> {
        for name in CANDIDATE_FILES {
            let path = dir.join(name);
            let metadata = match fs::metadata(&path) {
                Ok(metadata) => metadata,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            if !metadata.is_file() {
                return Err(ConfigError::Invalid(format!(
                    "{} is not a regular file",
                    path.display()
                )));
            }

            match Self::from_file(&path) {
                Ok(config) => {
                    debug!(path = %path.display(), "Loaded configuration");
                    return Ok((config, path));
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unusable configuration file");
                }
            }
        }

        Err(ConfigError::NotFound(dir.to_path_buf()))
    }

    /// Loads `explicit` if given, otherwise discovers a file in the user
    /// configuration directory.
    ///
    /// # Errors
    ///
    /// Errors from an explicit file are returned as is. Discovery fails with
    /// `ConfigError::NotFound` if no configuration directory can be determined.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::from_file(path);
        }

        let dir = config_dir(std::env::var_os("XDG_CONFIG_HOME"), std::env::var_os("HOME"))
            .ok_or_else(|| ConfigError::NotFound(PathBuf::from(APP_DIR)))?;
        Self::discover(&dir).map(|(config, _)| config)
    }

    /// Returns the mailbox root and state database path, which is all the
    /// commands that never contact upstream need.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` when no mailbox is configured.
    pub fn mailbox_paths(&self, overrides: &Overrides) -> Result<(PathBuf, PathBuf)> {
        let maildir = overrides
            .maildir
            .clone()
            .or_else(|| self.maildir.clone())
            .ok_or_else(|| ConfigError::Invalid("maildir is not set".to_string()))?;
        let state_db = overrides
            .state_db
            .clone()
            .or_else(|| self.state_db.clone())
            .unwrap_or_else(|| maildir.join(DEFAULT_STATE_DB));
        Ok((maildir, state_db))
    }

    /// Applies `overrides` and fills in defaults.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` when the mailbox or endpoint is unset or
    /// the endpoint is not a URL, and `ConfigError::MissingToken` when no
    /// token source is available.
    pub fn resolve(self, overrides: Overrides) -> Result<Settings> {
        let (maildir, state_db) = self.mailbox_paths(&overrides)?;

        let token = match overrides.token {
            Some(token) => token,
            None => self.api.resolve_token()?,
        };
        if token.trim().is_empty() {
            return Err(ConfigError::MissingToken);
        }

        let endpoint = overrides
            .endpoint
            .or(self.api.endpoint)
            .map(|e| e.trim().to_string())
            .filter(|e| !e.is_empty())
            .ok_or_else(|| ConfigError::Invalid("api.endpoint is not set".to_string()))?;

        let message_id_domain = match self.message_id_domain {
            Some(domain) => domain,
            None => endpoint_host(&endpoint)?,
        };

        Ok(Settings {
            maildir,
            state_db,
            message_id_domain,
            comment_threads: self.comment_threads,
            endpoint,
            token,
        })
    }
}

impl ApiConfig {
    /// Returns the API token. `token_file` takes precedence over `token`; its
    /// content is trimmed.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the token file cannot be read, and
    /// `ConfigError::MissingToken` if neither source is set.
    pub fn resolve_token(&self) -> Result<String> {
        if let Some(path) = &self.token_file {
            return Ok(fs::read_to_string(path)?.trim().to_string());
        }
        match &self.token {
            Some(token) if !token.is_empty() => Ok(token.clone()),
            _ => Err(ConfigError::MissingToken),
        }
    }
}

/// `$XDG_CONFIG_HOME/pr-maildir`, falling back to `$HOME/.config/pr-maildir`.
pub fn config_dir(xdg_config_home: Option<OsString>, home: Option<OsString>) -> Option<PathBuf> {
    let base = match xdg_config_home.filter(|v| !v.is_empty()) {
        Some(xdg) => PathBuf::from(xdg),
        None => PathBuf::from(home.filter(|v| !v.is_empty())?).join(".config"),
    };
    Some(base.join(APP_DIR))
}

fn endpoint_host(endpoint: &str) -> Result<String> {
    let url = reqwest::Url::parse(endpoint)
        .map_err(|e| ConfigError::Invalid(format!("api.endpoint {endpoint:?}: {e}")))?;
    url.host_str()
        .map(str::to_string)
        .ok_or_else(|| ConfigError::Invalid(format!("api.endpoint {endpoint:?} has no host")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const TOML: &str = r#"
        maildir = "/mail/bitbucket"
        comment_threads = "top-level"

        [api]
        endpoint = "https://bitbucket.example.com/rest/api/1.0"
        token = "abc"
    "#;

    #[test]
    fn parses_toml() {
        let config = Config::from_toml(TOML).unwrap();

        assert_eq!(config.maildir, Some(PathBuf::from("/mail/bitbucket")));
        assert_eq!(config.comment_threads, CommentThreads::TopLevel);
        assert_eq!(config.api.token.as_deref(), Some("abc"));
    }

    #[test]
    fn parses_json_with_camel_case_token_file() {
        let config = Config::from_json(
            r#"{ "maildir": "/m", "api": { "endpoint": "https://bb", "tokenFile": "/t" } }"#,
        )
        .unwrap();

        assert_eq!(config.api.token_file, Some(PathBuf::from("/t")));
        assert_eq!(config.comment_threads, CommentThreads::Nested);
    }

    #[test]
    fn resolve_fills_defaults() {
        let settings = Config::from_toml(TOML)
            .unwrap()
            .resolve(Overrides::default())
            .unwrap();

        assert_eq!(settings.state_db, PathBuf::from("/mail/bitbucket/.pr-maildir.db"));
        assert_eq!(settings.message_id_domain, "bitbucket.example.com");
        assert_eq!(settings.token, "abc");
    }

    #[test]
    fn resolve_uses_configured_endpoint_and_token_file() {
        let dir = tempdir().unwrap();
        let token_path = dir.path().join("token");
        fs::write(&token_path, "from-file\n").unwrap();

        let mut config = Config::from_toml(TOML).unwrap();
        config.api.token = None;
        config.api.token_file = Some(token_path);
        let settings = config.resolve(Overrides::default()).unwrap();

        assert_eq!(settings.endpoint, "https://bitbucket.example.com/rest/api/1.0");
        assert_eq!(settings.token, "from-file");
    }

    #[test]
    fn overrides_win() {
        let settings = Config::from_toml(TOML)
            .unwrap()
            .resolve(Overrides {
                maildir: Some(PathBuf::from("/elsewhere")),
                state_db: Some(PathBuf::from("/state.db")),
                endpoint: Some("https://other.example.org".to_string()),
                token: Some("from-env".to_string()),
            })
            .unwrap();

        assert_eq!(settings.maildir, PathBuf::from("/elsewhere"));
        assert_eq!(settings.state_db, PathBuf::from("/state.db"));
        assert_eq!(settings.endpoint, "https://other.example.org");
        assert_eq!(settings.message_id_domain, "other.example.org");
        assert_eq!(settings.token, "from-env");
    }

    #[test]
    fn token_file_wins_and_is_trimmed() {
        let dir = tempdir().unwrap();
        let token_path = dir.path().join("token");
        fs::write(&token_path, "  s3cret\n").unwrap();

        let api = ApiConfig {
            endpoint: None,
            token: Some("inline".to_string()),
            token_file: Some(token_path),
        };
        assert_eq!(api.resolve_token().unwrap(), "s3cret");
    }

    #[test]
    fn missing_token_is_an_error() {
        let config = Config::from_toml(
            "maildir = \"/m\"\n[api]\nendpoint = \"https://bb.example.com\"\n",
        )
        .unwrap();

        assert!(matches!(
            config.resolve(Overrides::default()),
            Err(ConfigError::MissingToken)
        ));
    }

    #[test]
    fn mailbox_paths_need_no_api_section() {
        let config = Config::from_toml("maildir = \"/m\"\n").unwrap();
        let (maildir, state_db) = config.mailbox_paths(&Overrides::default()).unwrap();

        assert_eq!(maildir, PathBuf::from("/m"));
        assert_eq!(state_db, PathBuf::from("/m/.pr-maildir.db"));
    }

    #[test]
    fn missing_maildir_is_an_error() {
        let config = Config::from_toml("[api]\nendpoint = \"https://bb\"\ntoken = \"t\"\n").unwrap();
        assert!(matches!(
            config.resolve(Overrides::default()),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn discover_skips_unparsable_candidate() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("config.toml"), "this is = = not toml").unwrap();
        fs::write(
            dir.path().join("config.json"),
            r#"{ "maildir": "/m", "api": { "token": "t" } }"#,
        )
        .unwrap();

        let (config, path) = Config::discover(dir.path()).unwrap();

        assert_eq!(path, dir.path().join("config.json"));
        assert_eq!(config.maildir, Some(PathBuf::from("/m")));
    }

    #[test]
    fn discover_rejects_non_regular_candidate() {
        let dir = tempdir().unwrap();
        fs::create_dir(dir.path().join("config.toml")).unwrap();

        assert!(matches!(
            Config::discover(dir.path()),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn discover_without_files_is_not_found() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            Config::discover(dir.path()),
            Err(ConfigError::NotFound(_))
        ));
    }

    #[test]
    fn explicit_file_errors_are_not_skipped() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        fs::write(&path, "maildir = [").unwrap();

        assert!(matches!(Config::load(Some(&path)), Err(ConfigError::Toml(_))));
    }

    #[test]
    fn config_dir_prefers_xdg() {
        assert_eq!(
            config_dir(Some("/xdg".into()), Some("/home/me".into())),
            Some(PathBuf::from("/xdg/pr-maildir"))
        );
        assert_eq!(
            config_dir(Some("".into()), Some("/home/me".into())),
            Some(PathBuf::from("/home/me/.config/pr-maildir"))
        );
        assert_eq!(config_dir(None, None), None);
    }

    #[test]
    fn settings_debug_hides_token() {
        let settings = Config::from_toml(TOML)
            .unwrap()
            .resolve(Overrides::default())
            .unwrap();
        assert!(!format!("{settings:?}").contains("abc"));
    }
}

//! # Application Configuration
//!
//! Persistent settings for the `bulkmail` command-line tool: the SMTP account,
//! where templates live, and the throttling/retry behaviour of bulk sends.
//!
//! The file is pretty-printed JSON at `<config dir>/bulkmail/config.json`
//! (for example `~/.config/bulkmail/config.json` on Linux). A missing file
//! yields [`AppConfig::default`].
//!
//! ## Environment
//!
//! - `BULKMAIL_SMTP_PASSWORD` replaces `smtp.password` after loading, so the
//!   secret does not have to be stored on disk.

use std::path::{Path, PathBuf};

use bulkmail_smtp::{BulkSendOptions, SmtpConfig};
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};

/// Directory name under the platform config dir.
pub const APP_DIR_NAME: &str = "bulkmail";
/// Config file name inside [`APP_DIR_NAME`].
pub const CONFIG_FILE_NAME: &str = "config.json";
/// Environment variable overriding the SMTP password.
pub const PASSWORD_ENV: &str = "BULKMAIL_SMTP_PASSWORD";

/// All persistent settings of the tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// SMTP account used for every send.
    pub smtp: SmtpConfig,
    /// Template directory. `None` means `<config dir>/bulkmail/templates`.
    pub templates_dir: Option<PathBuf>,
    /// Lower bound of the pause between recipients, in seconds.
    pub delay_min_secs: f64,
    /// Upper bound of the pause between recipients, in seconds.
    pub delay_max_secs: f64,
    /// Retry each failed recipient once.
    pub retry_failed: bool,
    /// Probe the SMTP account before starting a bulk send.
    pub validate_before_send: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        let options = BulkSendOptions::default();
        Self {
            smtp: SmtpConfig::default(),
            templates_dir: None,
            delay_min_secs: options.delay_range.0,
            delay_max_secs: options.delay_range.1,
            retry_failed: options.retry_failed,
            validate_before_send: true,
        }
    }
}

impl AppConfig {
    /// Default location of the config file.
    ///
    /// # Errors
    ///
    /// [`AppError::NoConfigDir`] when the platform has no per-user config
    /// directory.
    pub fn default_path() -> AppResult<PathBuf> {
        Ok(app_dir()?.join(CONFIG_FILE_NAME))
    }

    /// Loads the configuration from `path`, falling back to defaults when the
    /// file does not exist, then applies environment overrides.
    ///
    /// # Arguments
    ///
    /// * `path` - Location of the JSON config file
    ///
    /// # Errors
    ///
    /// Fails when the file exists but cannot be read or is not valid JSON.
    pub fn load(path: &Path) -> AppResult<Self> {
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(path).map_err(|source| AppError::ConfigRead {
                path: path.to_path_buf(),
                source,
            })?;
            debug!("[config] loaded {}", path.display());
            serde_json::from_str(&text)?
        } else {
            debug!("[config] {} not found, using defaults", path.display());
            Self::default()
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Writes the configuration as pretty JSON, creating parent directories.
    pub fn save(&self, path: &Path) -> AppResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        info!("[config] saved {}", path.display());
        Ok(())
    }

    /// Applies environment overrides read through `lookup`.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(password) = lookup(PASSWORD_ENV).filter(|p| !p.is_empty()) {
            debug!("[config] SMTP password taken from {}", PASSWORD_ENV);
            self.smtp.password = password;
        }
    }

    /// Rejects settings no send could succeed with.
    pub fn validate(&self) -> AppResult<()> {
        if self.smtp.host.trim().is_empty() {
            return Err(AppError::InvalidConfig("smtp.server is empty".into()));
        }
        if self.smtp.port == 0 {
            return Err(AppError::InvalidConfig("smtp.port must not be 0".into()));
        }
        self.send_options()
            .validate()
            .map_err(|e| AppError::InvalidConfig(e.message))
    }

    /// Bulk-send options derived from these settings.
    pub fn send_options(&self) -> BulkSendOptions {
        BulkSendOptions {
            delay_range: (self.delay_min_secs, self.delay_max_secs),
            retry_failed: self.retry_failed,
            ..BulkSendOptions::default()
        }
    }

    /// Effective template directory.
    pub fn templates_dir(&self) -> AppResult<PathBuf> {
        match &self.templates_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(app_dir()?.join("templates")),
        }
    }
}

fn app_dir() -> AppResult<PathBuf> {
    dirs::config_dir()
        .map(|d| d.join(APP_DIR_NAME))
        .ok_or(AppError::NoConfigDir)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> AppConfig {
        AppConfig {
            smtp: SmtpConfig::for_port("smtp.example.com", 587),
            ..AppConfig::default()
        }
    }

    #[test]
    fn defaults_match_send_options() {
        let config = AppConfig::default();
        assert_eq!(config.send_options(), BulkSendOptions::default());
        assert!(config.validate_before_send);
    }

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::load(&dir.path().join("none.json")).unwrap();
        assert_eq!(config.delay_min_secs, 2.0);
        assert!(config.smtp.host.is_empty());
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(CONFIG_FILE_NAME);
        let mut config = valid();
        config.smtp.username = "me@example.com".into();
        config.retry_failed = false;
        config.save(&path).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("\"server\": \"smtp.example.com\""));

        let loaded = AppConfig::load(&path).unwrap();
        assert_eq!(loaded.smtp.host, "smtp.example.com");
        assert_eq!(loaded.smtp.username, "me@example.com");
        assert!(!loaded.retry_failed);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, r#"{"smtp": {"server": "mx.example.org", "port": 465}}"#).unwrap();
        let config = AppConfig::load(&path).unwrap();
        assert_eq!(config.smtp.port, 465);
        assert_eq!(config.delay_max_secs, 5.0);
        assert!(config.retry_failed);
    }

    #[test]
    fn malformed_file_is_json_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, "{oops").unwrap();
        assert!(matches!(AppConfig::load(&path), Err(AppError::Json(_))));
    }

    #[test]
    fn env_password_override() {
        let mut config = valid();
        config.smtp.password = "from-file".into();
        config.apply_env_overrides(|k| (k == PASSWORD_ENV).then(|| "from-env".to_string()));
        assert_eq!(config.smtp.password, "from-env");
        config.apply_env_overrides(|_| Some(String::new()));
        assert_eq!(config.smtp.password, "from-env");
    }

    #[test]
    fn validation_rules() {
        assert!(valid().validate().is_ok());
        assert!(AppConfig::default().validate().is_err());

        let mut c = valid();
        c.smtp.port = 0;
        assert!(c.validate().is_err());

        let mut c = valid();
        c.delay_min_secs = 6.0;
        assert!(matches!(c.validate(), Err(AppError::InvalidConfig(_))));

        let mut c = valid();
        c.delay_min_secs = 1e30;
        c.delay_max_secs = 1e30;
        assert!(matches!(c.validate(), Err(AppError::InvalidConfig(_))));
    }

    #[test]
    fn explicit_templates_dir_wins() {
        let mut c = valid();
        c.templates_dir = Some(PathBuf::from("/srv/templates"));
        assert_eq!(c.templates_dir().unwrap(), PathBuf::from("/srv/templates"));
    }
}

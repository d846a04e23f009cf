use regex::Regex;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

/// Default location of the config file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/keeper.toml";

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid restart timing '{0}' (expected HH:MM, 24h UTC)")]
    InvalidTiming(String),

    #[error("Invalid countdown step #{0}: delay_seconds must be a number of seconds >= 0 that fits a duration")]
    InvalidCountdown(usize),

    #[error("auto_backup_interval_minutes must be a positive duration (at least one nanosecond) when auto_backup is enabled")]
    InvalidBackupInterval,

    #[error("ipc.token is required")]
    MissingToken,
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct KeeperConfig {
    /// Echo the managed server's stdout/stderr to our own console.
    pub show_console: bool,
    pub paths: PathsConfig,
    pub server: ServerConfig,
    pub maintenance: MaintenanceConfig,
    pub backup: BackupConfig,
    pub restart: RestartConfig,
    pub ipc: IpcConfig,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct PathsConfig {
    pub data_dir: PathBuf,
    pub scripts_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            scripts_dir: PathBuf::from("scripts"),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ServerConfig {
    /// Executable, resolved relative to the server directory.
    pub executable: String,
    pub args: Vec<String>,
    pub log_buffer_size: usize,
    pub stop_poll_secs: u64,
    pub stop_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            executable: "./bedrock_server".to_string(),
            args: Vec::new(),
            log_buffer_size: 10_000,
            stop_poll_secs: 1,
            stop_timeout_secs: 30,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct MaintenanceConfig {
    pub script_timeout_secs: u64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            script_timeout_secs: 30 * 60,
        }
    }
}

/// Automatic backup and retention settings.
#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct BackupConfig {
    pub auto_backup: bool,
    pub auto_backup_interval_minutes: f64,
    /// Maximum number of unprotected backups kept.
    pub auto_backup_retention: usize,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            auto_backup: false,
            auto_backup_interval_minutes: 60.0,
            auto_backup_retention: 10,
        }
    }
}

impl BackupConfig {
    /// Zero when the configured value is not a representable duration;
    /// `validate` rejects that while auto backup is on.
    pub fn interval(&self) -> Duration {
        Duration::try_from_secs_f64(self.auto_backup_interval_minutes * 60.0).unwrap_or(Duration::ZERO)
    }
}

/// Daily restart schedule.
#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct RestartConfig {
    pub auto_restart: bool,
    /// "HH:MM" in UTC.
    pub timings: Vec<String>,
    pub countdown: Vec<CountdownStep>,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct CountdownStep {
    pub delay_seconds: f64,
    #[serde(default)]
    pub commands: Option<Vec<String>>,
}

impl CountdownStep {
    pub fn delay(&self) -> Duration {
        Duration::try_from_secs_f64(self.delay_seconds).unwrap_or(Duration::ZERO)
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct IpcConfig {
    pub listen_addr: String,
    pub token: Option<String>,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:57475".to_string(),
            token: None,
        }
    }
}

/// Concrete locations derived from `paths.data_dir` and `paths.scripts_dir`.
#[derive(Debug, Clone)]
pub struct DataPaths {
    pub server_dir: PathBuf,
    pub backup_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub catalog_file: PathBuf,
    pub install_script: PathBuf,
    pub backup_script: PathBuf,
    pub restore_script: PathBuf,
}

impl DataPaths {
    pub fn new(data_dir: &Path, scripts_dir: &Path) -> Self {
        Self {
            server_dir: data_dir.join("server"),
            backup_dir: data_dir.join("backups"),
            cache_dir: data_dir.join("cache"),
            catalog_file: data_dir.join("backups.json"),
            install_script: scripts_dir.join("install.sh"),
            backup_script: scripts_dir.join("backup.sh"),
            restore_script: scripts_dir.join("restore.sh"),
        }
    }

    /// Create the backup directory and an empty catalog if they are missing.
    /// The server and cache directories are owned by the scripts.
    ///
    /// A missing catalog next to existing artifacts is left missing: an empty
    /// one would turn every artifact into an orphan.
    pub fn ensure(&self) -> std::io::Result<()> {
        if !self.backup_dir.exists() {
            tracing::debug!("Creating backup directory {}", self.backup_dir.display());
            std::fs::create_dir_all(&self.backup_dir)?;
        }
        if !self.catalog_file.exists() {
            if std::fs::read_dir(&self.backup_dir)?.next().is_some() {
                tracing::error!(
                    "Catalog {} is missing but {} is not empty; restore the catalog before backups are cleaned up",
                    self.catalog_file.display(),
                    self.backup_dir.display()
                );
                return Ok(());
            }
            tracing::debug!("Initializing catalog {}", self.catalog_file.display());
            std::fs::write(&self.catalog_file, "[]")?;
        }
        Ok(())
    }
}

impl KeeperConfig {
    /// Load from `KEEPER_CONFIG` or [`DEFAULT_CONFIG_PATH`]. A missing file
    /// yields the defaults; an unreadable or malformed one is an error.
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var("KEEPER_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(Path::new(&path))
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("Config file {} not found, using defaults", path.display());
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let cfg: Self = toml::from_str(content)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Checks that do not depend on the control API being enabled.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let timing = timing_regex();
        if let Some(bad) = self.restart.timings.iter().find(|t| !timing.is_match(t)) {
            return Err(ConfigError::InvalidTiming(bad.clone()));
        }
        if let Some(idx) = self
            .restart
            .countdown
            .iter()
            .position(|s| Duration::try_from_secs_f64(s.delay_seconds).is_err())
        {
            return Err(ConfigError::InvalidCountdown(idx));
        }
        if self.backup.auto_backup {
            match Duration::try_from_secs_f64(self.backup.auto_backup_interval_minutes * 60.0) {
                Ok(interval) if !interval.is_zero() => {}
                _ => return Err(ConfigError::InvalidBackupInterval),
            }
        }
        Ok(())
    }

    /// The control API token; its absence is a fatal startup condition.
    pub fn require_token(&self) -> Result<&str, ConfigError> {
        match self.ipc.token.as_deref() {
            Some(t) if !t.trim().is_empty() => Ok(t),
            _ => Err(ConfigError::MissingToken),
        }
    }

    pub fn data_paths(&self) -> DataPaths {
        DataPaths::new(&self.paths.data_dir, &self.paths.scripts_dir)
    }
}

fn timing_regex() -> &'static Regex {
    static TIMING: OnceLock<Regex> = OnceLock::new();
    TIMING.get_or_init(|| Regex::new(r"^([01]\d|2[0-3]):[0-5]\d$").expect("static timing pattern"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_when_empty() {
        let cfg = KeeperConfig::parse("").unwrap();
        assert!(!cfg.show_console);
        assert!(!cfg.backup.auto_backup);
        assert_eq!(cfg.backup.auto_backup_retention, 10);
        assert_eq!(cfg.server.executable, "./bedrock_server");
        assert_eq!(cfg.server.stop_timeout_secs, 30);
        assert_eq!(cfg.ipc.listen_addr, "127.0.0.1:57475");
        assert!(cfg.ipc.token.is_none());
    }

    #[test]
    fn test_full_config() {
        let cfg = KeeperConfig::parse(
            r#"
            show_console = true

            [backup]
            auto_backup = true
            auto_backup_interval_minutes = 30
            auto_backup_retention = 3

            [restart]
            auto_restart = true
            timings = ["04:00", "16:30"]

            [[restart.countdown]]
            delay_seconds = 50
            commands = ["say 1 minute"]

            [[restart.countdown]]
            delay_seconds = 10

            [ipc]
            token = "secret"
            "#,
        )
        .unwrap();

        assert!(cfg.show_console);
        assert_eq!(cfg.backup.interval(), Duration::from_secs(30 * 60));
        assert_eq!(cfg.restart.timings, vec!["04:00", "16:30"]);
        assert_eq!(cfg.restart.countdown.len(), 2);
        assert_eq!(cfg.restart.countdown[0].commands.as_deref(), Some(&["say 1 minute".to_string()][..]));
        assert!(cfg.restart.countdown[1].commands.is_none());
        assert_eq!(cfg.restart.countdown[1].delay(), Duration::from_secs(10));
        assert_eq!(cfg.require_token().unwrap(), "secret");
    }

    #[test]
    fn test_invalid_timing_rejected() {
        for bad in ["4:00", "24:00", "12:60", "noon", "12:00:00"] {
            let toml = format!("[restart]\ntimings = [\"{}\"]\n", bad);
            assert!(
                matches!(KeeperConfig::parse(&toml), Err(ConfigError::InvalidTiming(_))),
                "timing {} should be rejected",
                bad
            );
        }
    }

    #[test]
    fn test_negative_countdown_rejected() {
        let res = KeeperConfig::parse("[[restart.countdown]]\ndelay_seconds = -1\n");
        assert!(matches!(res, Err(ConfigError::InvalidCountdown(0))));
    }

    #[test]
    fn test_zero_interval_rejected_only_when_enabled() {
        assert!(KeeperConfig::parse("[backup]\nauto_backup_interval_minutes = 0\n").is_ok());
        let res = KeeperConfig::parse("[backup]\nauto_backup = true\nauto_backup_interval_minutes = 0\n");
        assert!(matches!(res, Err(ConfigError::InvalidBackupInterval)));
    }

    #[test]
    fn test_unrepresentable_durations_rejected() {
        // rounds down to zero nanoseconds
        let res = KeeperConfig::parse("[backup]\nauto_backup = true\nauto_backup_interval_minutes = 1e-12\n");
        assert!(matches!(res, Err(ConfigError::InvalidBackupInterval)));
        let res = KeeperConfig::parse("[backup]\nauto_backup = true\nauto_backup_interval_minutes = 1e300\n");
        assert!(matches!(res, Err(ConfigError::InvalidBackupInterval)));

        let res = KeeperConfig::parse("[[restart.countdown]]\ndelay_seconds = 0\n\n[[restart.countdown]]\ndelay_seconds = 1e30\n");
        assert!(matches!(res, Err(ConfigError::InvalidCountdown(1))));
    }

    #[test]
    fn test_duration_accessors_do_not_panic() {
        let step = CountdownStep { delay_seconds: f64::NAN, commands: None };
        assert_eq!(step.delay(), Duration::ZERO);
        let backup = BackupConfig { auto_backup_interval_minutes: 1e300, ..BackupConfig::default() };
        assert_eq!(backup.interval(), Duration::ZERO);
    }

    #[test]
    fn test_missing_or_blank_token() {
        let cfg = KeeperConfig::default();
        assert!(matches!(cfg.require_token(), Err(ConfigError::MissingToken)));
        let cfg = KeeperConfig::parse("[ipc]\ntoken = \"  \"\n").unwrap();
        assert!(matches!(cfg.require_token(), Err(ConfigError::MissingToken)));
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = KeeperConfig::load_from(&dir.path().join("nope.toml")).unwrap();
        assert_eq!(cfg.paths.data_dir, PathBuf::from("data"));
    }

    #[test]
    fn test_data_paths_layout_and_ensure() {
        let dir = tempfile::tempdir().unwrap();
        let paths = DataPaths::new(&dir.path().join("data"), Path::new("scripts"));
        assert!(paths.server_dir.ends_with("data/server"));
        assert!(paths.install_script.ends_with("scripts/install.sh"));

        paths.ensure().unwrap();
        assert!(paths.backup_dir.is_dir());
        assert_eq!(std::fs::read_to_string(&paths.catalog_file).unwrap(), "[]");

        // existing catalog is left alone
        std::fs::write(&paths.catalog_file, "[ ]").unwrap();
        paths.ensure().unwrap();
        assert_eq!(std::fs::read_to_string(&paths.catalog_file).unwrap(), "[ ]");
    }

    #[test]
    fn test_ensure_keeps_catalog_missing_next_to_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let paths = DataPaths::new(&dir.path().join("data"), Path::new("scripts"));
        std::fs::create_dir_all(&paths.backup_dir).unwrap();
        let artifact = paths.backup_dir.join("2f1c0f6e-9d7a-4b7e-8a51-0c6f3f1d2e11.tar.gz");
        std::fs::write(&artifact, b"tarball").unwrap();

        paths.ensure().unwrap();
        assert!(!paths.catalog_file.exists());
        assert!(artifact.is_file());
    }
}

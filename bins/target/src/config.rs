use std::path::{Path, PathBuf};

use clap::{Parser, ValueEnum};
use serde::Deserialize;

use storage_google_sheets::DEFAULT_CREDENTIALS_PATH;
use sync_engine::SyncConfig;

use crate::error::TargetError;

const CREDENTIALS_HELP: &str = "\
Credentials: an OAuth bearer token is read from GOOGLE_SHEETS_ACCESS_TOKEN, or from the
'access_token' / 'token' field of credentials_path (default .secrets/google_sheets.json,
then $HOME/.secrets/google_sheets.json). Service-account key files are not exchanged for
tokens here: mint the token beforehand (e.g. `gcloud auth print-access-token`).";

#[derive(Parser, Debug)]
#[command(
    name = "target-google-sheets",
    version,
    about = "Singer target: реплицирует записи из stdin в Google Sheets",
    after_help = CREDENTIALS_HELP
)]
pub struct Cli {
    /// Путь к конфиг файлу (JSON, или TOML по расширению .toml)
    #[arg(short, long, env = "TARGET_SHEETS_CONFIG")]
    pub config: PathBuf,

    /// Читать сообщения из файла вместо stdin
    #[arg(long)]
    pub input: Option<PathBuf>,

    /// Писать в память вместо Google Sheets (без сети)
    #[arg(long)]
    pub dry_run: bool,

    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

// ---- Config file ----

#[derive(Debug, Deserialize)]
pub struct TargetConfig {
    #[serde(default)]
    pub spreadsheet_url: String,
    #[serde(default = "default_credentials_path")]
    pub credentials_path: PathBuf,
    #[serde(flatten)]
    pub sync: SyncConfig,
}

fn default_credentials_path() -> PathBuf {
    PathBuf::from(DEFAULT_CREDENTIALS_PATH)
}

impl TargetConfig {
    pub fn load(path: &Path) -> Result<Self, TargetError> {
        let shown = path.display();
        let content = std::fs::read_to_string(path).map_err(|e| TargetError::Config {
            context: "read",
            detail: format!("'{shown}': {e}"),
        })?;

        let is_toml = path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
        let parsed = if is_toml {
            toml::from_str(&content).map_err(|e| e.to_string())
        } else {
            serde_json::from_str(&content).map_err(|e| e.to_string())
        };
        parsed.map_err(|detail| TargetError::Config {
            context: "parse",
            detail: format!("'{shown}': {detail}"),
        })
    }

    /// `require_spreadsheet = false` для `--dry-run`: удалённая таблица не нужна.
    pub fn validate(&self, require_spreadsheet: bool) -> Result<(), TargetError> {
        if require_spreadsheet && self.spreadsheet_url.trim().is_empty() {
            return Err(TargetError::Config {
                context: "validate",
                detail: "spreadsheet_url is required".into(),
            });
        }
        self.sync
            .validate()
            .map_err(|detail| TargetError::Config { context: "validate", detail })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn write(dir: &tempfile::TempDir, name: &str, body: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn json_config_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            &dir,
            "config.json",
            r#"{"spreadsheet_url": "https://docs.google.com/spreadsheets/d/abc/edit"}"#,
        );
        let cfg = TargetConfig::load(&path).unwrap();
        cfg.validate(true).unwrap();
        assert_eq!(cfg.credentials_path, PathBuf::from(".secrets/google_sheets.json"));
        assert_eq!(cfg.sync.batch_size, 50);
        assert_eq!(cfg.sync.flush_interval, None);
    }

    #[test]
    fn toml_config_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            &dir,
            "target.toml",
            "spreadsheet_url = \"abc\"\nbatch_size = 10\nflush_interval = 15\nsheet_prefix = \"raw_\"\n",
        );
        let cfg = TargetConfig::load(&path).unwrap();
        cfg.validate(true).unwrap();
        let engine = cfg.sync.engine_config();
        assert_eq!(engine.buffer.batch_size, 10);
        assert_eq!(engine.flush_interval, Some(Duration::from_secs(15)));
        assert_eq!(engine.sheet_prefix, "raw_");
    }

    #[test]
    fn missing_file_names_the_path() {
        let err = TargetConfig::load(Path::new("/nonexistent/target.json")).unwrap_err();
        let msg = err.to_string();
        assert!(msg.starts_with("config (read)"), "{msg}");
        assert!(msg.contains("/nonexistent/target.json"), "{msg}");
    }

    #[test]
    fn unparseable_content_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, "config.json", "{ batch_size: ");
        let msg = TargetConfig::load(&path).unwrap_err().to_string();
        assert!(msg.starts_with("config (parse)"), "{msg}");
    }

    #[test]
    fn spreadsheet_url_required_unless_dry_run() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, "config.json", r#"{"batch_size": 5}"#);
        let cfg = TargetConfig::load(&path).unwrap();
        assert!(cfg.validate(true).unwrap_err().to_string().contains("spreadsheet_url"));
        cfg.validate(false).unwrap();
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, "config.json", r#"{"spreadsheet_url": "abc", "batch_size": 0}"#);
        let cfg = TargetConfig::load(&path).unwrap();
        let msg = cfg.validate(true).unwrap_err().to_string();
        assert!(msg.contains("batch_size"), "{msg}");
    }

    #[test]
    fn help_explains_token_only_credentials() {
        use clap::CommandFactory;

        let help = Cli::command().render_long_help().to_string();
        assert!(help.contains("GOOGLE_SHEETS_ACCESS_TOKEN"), "{help}");
        assert!(help.contains("Service-account key files are not exchanged"), "{help}");
    }

    #[test]
    fn cli_flags() {
        let cli = Cli::try_parse_from([
            "target-google-sheets",
            "-c",
            "config.json",
            "--dry-run",
            "--log-format",
            "json",
        ])
        .unwrap();
        assert_eq!(cli.config, PathBuf::from("config.json"));
        assert!(cli.dry_run);
        assert_eq!(cli.log_format, LogFormat::Json);
        assert!(cli.input.is_none());
    }
}

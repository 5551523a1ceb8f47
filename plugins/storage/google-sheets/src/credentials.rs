//! Поиск и чтение credentials для Google Sheets API.
//!
//! Файл ищется сначала по пути как есть (относительно cwd), затем
//! относительно домашнего каталога. Токен берётся из поля `access_token`
//! (или `token`, формат authorized-user файлов). Переменная окружения
//! `GOOGLE_SHEETS_ACCESS_TOKEN` имеет приоритет над файлом.

use std::path::{Path, PathBuf};

use serde::Deserialize;

pub const DEFAULT_CREDENTIALS_PATH: &str = ".secrets/google_sheets.json";
pub const ACCESS_TOKEN_ENV: &str = "GOOGLE_SHEETS_ACCESS_TOKEN";

#[derive(Debug, thiserror::Error)]
pub enum CredentialsError {
    #[error("credentials file not found (tried: {})", display_paths(.tried))]
    NotFound { tried: Vec<PathBuf> },

    #[error("read credentials {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parse credentials {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error(
        "credentials {} carry no access token: expected 'access_token' or 'token', \
         or set {ACCESS_TOKEN_ENV}",
        .path.display()
    )]
    NoToken { path: PathBuf },
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Deserialize)]
struct CredentialsFile {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    token: Option<String>,
}

/// Resolve the access token: environment first, then the credentials file.
pub fn access_token(configured: &Path) -> Result<String, CredentialsError> {
    if let Ok(token) = std::env::var(ACCESS_TOKEN_ENV) {
        let token = token.trim();
        if !token.is_empty() {
            tracing::debug!(source = ACCESS_TOKEN_ENV, "access token from environment");
            return Ok(token.to_string());
        }
    }
    let path = locate(configured)?;
    read_access_token(&path)
}

/// Найти файл credentials: путь как есть, затем `$HOME/<path>`.
pub fn locate(configured: &Path) -> Result<PathBuf, CredentialsError> {
    locate_in(configured, dirs::home_dir().as_deref())
}

fn locate_in(configured: &Path, home: Option<&Path>) -> Result<PathBuf, CredentialsError> {
    let mut tried = vec![configured.to_path_buf()];
    if configured.is_file() {
        return Ok(configured.to_path_buf());
    }
    if configured.is_relative() {
        if let Some(home) = home {
            let candidate = home.join(configured);
            if candidate.is_file() {
                return Ok(candidate);
            }
            tried.push(candidate);
        }
    }
    Err(CredentialsError::NotFound { tried })
}

pub fn read_access_token(path: &Path) -> Result<String, CredentialsError> {
    let raw = std::fs::read_to_string(path).map_err(|source| CredentialsError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let file: CredentialsFile =
        serde_json::from_str(&raw).map_err(|source| CredentialsError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
    file.access_token
        .or(file.token)
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .ok_or_else(|| CredentialsError::NoToken { path: path.to_path_buf() })
}

use std::time::Duration;

use serde::Deserialize;

use crate::buffer::BufferPolicy;
use crate::retry::RetryPolicy;

// ═══════════════════════════════════════════════════════════════
//  Sync Config (файл конфигурации)
// ═══════════════════════════════════════════════════════════════

/// Настройки движка из конфиг файла. Все поля опциональны.
#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    /// Порог flush'а по числу строк.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Периодический flush непустых буферов, в секундах.
    #[serde(default)]
    pub flush_interval: Option<u64>,
    /// Префикс имени листа для каждого потока.
    #[serde(default)]
    pub sheet_prefix: String,
    /// Порог flush'а по объёму строк в буфере (байты JSON).
    #[serde(default = "default_max_batch_bytes")]
    pub max_batch_bytes: usize,
    /// Потолок, до которого растёт batch после rate limit.
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    #[serde(default = "default_batch_size_increment")]
    pub batch_size_increment: usize,
    /// Сколько строк потока может ждать, пока его flush в полёте.
    #[serde(default = "default_max_buffered_rows")]
    pub max_buffered_rows: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
    /// Таймаут одного вызова store.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_batch_size() -> usize {
    50
}
fn default_max_batch_bytes() -> usize {
    1024 * 1024
}
fn default_max_batch_size() -> usize {
    250
}
fn default_batch_size_increment() -> usize {
    20
}
fn default_max_buffered_rows() -> usize {
    5000
}
fn default_max_retries() -> u32 {
    5
}
fn default_retry_base_delay_ms() -> u64 {
    500
}
fn default_retry_max_delay_ms() -> u64 {
    30_000
}
fn default_request_timeout_secs() -> u64 {
    30
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            flush_interval: None,
            sheet_prefix: String::new(),
            max_batch_bytes: default_max_batch_bytes(),
            max_batch_size: default_max_batch_size(),
            batch_size_increment: default_batch_size_increment(),
            max_buffered_rows: default_max_buffered_rows(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl SyncConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.batch_size == 0 {
            return Err("batch_size must be greater than 0".into());
        }
        if self.max_batch_bytes == 0 {
            return Err("max_batch_bytes must be greater than 0".into());
        }
        if self.flush_interval == Some(0) {
            return Err("flush_interval must be at least 1 second".into());
        }
        if self.request_timeout_secs == 0 {
            return Err("request_timeout_secs must be greater than 0".into());
        }
        if self.max_buffered_rows < self.batch_size.max(self.max_batch_size) {
            return Err(format!(
                "max_buffered_rows ({}) must be at least max(batch_size, max_batch_size) ({})",
                self.max_buffered_rows,
                self.batch_size.max(self.max_batch_size)
            ));
        }
        Ok(())
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            buffer: BufferPolicy {
                batch_size: self.batch_size,
                max_batch_bytes: self.max_batch_bytes,
                batch_size_increment: self.batch_size_increment,
                max_batch_size: self.max_batch_size.max(self.batch_size),
            },
            retry: RetryPolicy {
                max_retries: self.max_retries,
                base_delay: Duration::from_millis(self.retry_base_delay_ms),
                max_delay: Duration::from_millis(self.retry_max_delay_ms),
                call_timeout: Duration::from_secs(self.request_timeout_secs),
            },
            flush_interval: self.flush_interval.map(Duration::from_secs),
            max_buffered_rows: self.max_buffered_rows,
            sheet_prefix: self.sheet_prefix.clone(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════
//  Engine Config (runtime)
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub buffer: BufferPolicy,
    pub retry: RetryPolicy,
    pub flush_interval: Option<Duration>,
    pub max_buffered_rows: usize,
    pub sheet_prefix: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        SyncConfig::default().engine_config()
    }
}

//! 日志模块 - 控制台输出和按大小轮转的文件日志

use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing_subscriber::fmt::MakeWriter;

const LOG_FILE_NAME: &str = "s3sync.log";

/// 日志配置（配置文件中的 `log` 字段）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogConfig {
    /// 是否写日志文件
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// 最大日志文件大小（MB）
    #[serde(default = "default_max_size_mb")]
    pub max_size_mb: u32,
    /// 日志级别: "error", "warn", "info", "debug", "trace"
    #[serde(default = "default_level")]
    pub level: String,
    /// 日志目录，未设置时只输出到控制台
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory: Option<PathBuf>,
}

fn default_enabled() -> bool {
    true
}

fn default_max_size_mb() -> u32 {
    5 // 默认 5MB
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            max_size_mb: default_max_size_mb(),
            level: default_level(),
            directory: None,
        }
    }
}

impl LogConfig {
    /// 将配置的日志级别转换为 tracing Level
    pub fn tracing_level(&self) -> tracing::Level {
        match self.level.to_lowercase().as_str() {
            "error" => tracing::Level::ERROR,
            "warn" => tracing::Level::WARN,
            "debug" => tracing::Level::DEBUG,
            "trace" => tracing::Level::TRACE,
            _ => tracing::Level::INFO,
        }
    }

    /// 启用文件日志时的日志目录
    pub fn file_directory(&self) -> Option<&Path> {
        self.directory.as_deref().filter(|_| self.enabled)
    }
}

struct LogFile {
    writer: Option<BufWriter<File>>,
    written: u64,
}

/// 带大小限制的日志写入器，超过上限时把当前文件改名为 `.log.old`
#[derive(Clone)]
pub struct SizeRotatingWriter {
    file_path: PathBuf,
    max_size: u64,
    state: Arc<Mutex<LogFile>>,
}

impl SizeRotatingWriter {
    pub fn new(log_dir: &Path, max_size_mb: u32) -> io::Result<Self> {
        fs::create_dir_all(log_dir)?;
        let file_path = log_dir.join(LOG_FILE_NAME);
        Self::with_limit(file_path, u64::from(max_size_mb) * 1024 * 1024)
    }

    fn with_limit(file_path: PathBuf, max_size: u64) -> io::Result<Self> {
        let existing = fs::metadata(&file_path).map(|m| m.len()).unwrap_or(0);
        if existing > max_size {
            rotate_log(&file_path)?;
        }
        let (writer, written) = open_file(&file_path)?;

        Ok(Self {
            file_path,
            max_size,
            state: Arc::new(Mutex::new(LogFile {
                writer: Some(writer),
                written,
            })),
        })
    }

    pub fn path(&self) -> &Path {
        &self.file_path
    }

    fn lock(&self) -> MutexGuard<'_, LogFile> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn open_file(file_path: &Path) -> io::Result<(BufWriter<File>, u64)> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(file_path)?;
    let written = file.metadata().map(|m| m.len()).unwrap_or(0);
    Ok((BufWriter::new(file), written))
}

/// 轮转日志文件：s3sync.log -> s3sync.log.old
fn rotate_log(file_path: &Path) -> io::Result<()> {
    let backup_path = file_path.with_extension("log.old");
    if backup_path.exists() {
        fs::remove_file(&backup_path)?;
    }
    fs::rename(file_path, &backup_path)
}

/// 单次日志写入
pub struct LogWriter {
    owner: SizeRotatingWriter,
}

impl Write for LogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.owner.lock();

        if state.written > self.owner.max_size {
            if let Some(mut w) = state.writer.take() {
                let _ = w.flush();
            }
            rotate_log(&self.owner.file_path)?;
            let (writer, written) = open_file(&self.owner.file_path)?;
            state.writer = Some(writer);
            state.written = written;
        }

        let writer = state
            .writer
            .as_mut()
            .ok_or_else(|| io::Error::other("日志文件不可用"))?;
        let n = writer.write(buf)?;
        writer.flush()?;
        state.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.owner.lock().writer.as_mut() {
            Some(w) => w.flush(),
            None => Ok(()),
        }
    }
}

impl<'a> MakeWriter<'a> for SizeRotatingWriter {
    type Writer = LogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        LogWriter {
            owner: self.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_config_defaults() {
        let config: LogConfig = serde_json::from_str(r#"{"level": "DEBUG"}"#).unwrap();
        assert!(config.enabled);
        assert_eq!(config.max_size_mb, 5);
        assert_eq!(config.tracing_level(), tracing::Level::DEBUG);
        assert!(config.file_directory().is_none());

        let config: LogConfig =
            serde_json::from_str(r#"{"enabled": false, "directory": "/tmp/logs"}"#).unwrap();
        assert!(config.file_directory().is_none());
        assert_eq!(config.tracing_level(), tracing::Level::INFO);
    }

    #[test]
    fn test_rotates_when_over_limit() {
        let dir = tempfile::tempdir().unwrap();
        let writer = SizeRotatingWriter::with_limit(dir.path().join(LOG_FILE_NAME), 16).unwrap();

        let mut w = writer.make_writer();
        w.write_all(b"0123456789abcdefXYZ").unwrap();
        w.write_all(b"second line").unwrap();

        let backup = dir.path().join("s3sync.log.old");
        assert_eq!(fs::read(&backup).unwrap(), b"0123456789abcdefXYZ");
        assert_eq!(fs::read(writer.path()).unwrap(), b"second line");
    }
}

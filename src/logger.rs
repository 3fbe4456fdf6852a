use chrono::Local;
use log::{Level, LevelFilter, Log, Metadata, Record};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::config::LogConfigFile;

const DEFAULT_LOG_FILE: &str = "logs/tunnel-router.log";

/// 日志输出目标
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogOutput {
    Stdout,
    File(PathBuf),
    /// 同时输出到标准输出和文件
    Both(PathBuf),
}

/// 日志配置
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: LevelFilter,
    pub show_timestamp: bool,
    pub show_module: bool,
    /// 仅对终端输出生效
    pub use_color: bool,
    pub output: LogOutput,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LevelFilter::Info,
            show_timestamp: true,
            show_module: true,
            use_color: true,
            output: LogOutput::Stdout,
        }
    }
}

impl LogConfig {
    pub fn new(level: LevelFilter) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }

    /// 从配置文件中的日志段构造
    pub fn from_file_config(file: &LogConfigFile) -> Self {
        let path = || {
            PathBuf::from(
                file.file_path
                    .clone()
                    .unwrap_or_else(|| DEFAULT_LOG_FILE.to_string()),
            )
        };
        let output = match file.output.as_str() {
            "file" => LogOutput::File(path()),
            "both" => LogOutput::Both(path()),
            _ => LogOutput::Stdout,
        };

        Self {
            level: parse_level(&file.level).unwrap_or(LevelFilter::Info),
            show_timestamp: file.show_timestamp,
            show_module: file.show_module,
            use_color: file.use_color,
            output,
        }
    }

    pub fn with_timestamp(mut self, show: bool) -> Self {
        self.show_timestamp = show;
        self
    }

    pub fn with_module(mut self, show: bool) -> Self {
        self.show_module = show;
        self
    }

    pub fn with_color(mut self, use_color: bool) -> Self {
        self.use_color = use_color;
        self
    }

    pub fn with_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.output = LogOutput::File(path.as_ref().to_path_buf());
        self
    }

    pub fn with_both<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.output = LogOutput::Both(path.as_ref().to_path_buf());
        self
    }
}

/// 解析日志级别字符串，大小写不敏感
pub fn parse_level(s: &str) -> Option<LevelFilter> {
    match s.trim().to_lowercase().as_str() {
        "off" => Some(LevelFilter::Off),
        "error" => Some(LevelFilter::Error),
        "warn" | "warning" => Some(LevelFilter::Warn),
        "info" => Some(LevelFilter::Info),
        "debug" => Some(LevelFilter::Debug),
        "trace" => Some(LevelFilter::Trace),
        _ => None,
    }
}

struct Logger {
    config: LogConfig,
    file: Option<Mutex<File>>,
}

impl Logger {
    fn format(&self, record: &Record, color: bool) -> String {
        let mut line = String::new();

        if self.config.show_timestamp {
            line.push_str(&format!("[{}] ", Local::now().format("%Y-%m-%d %H:%M:%S%.3f")));
        }

        let level = match (record.level(), color) {
            (Level::Error, true) => "\x1b[31mERROR\x1b[0m",
            (Level::Warn, true) => "\x1b[33mWARN \x1b[0m",
            (Level::Info, true) => "\x1b[32mINFO \x1b[0m",
            (Level::Debug, true) => "\x1b[36mDEBUG\x1b[0m",
            (Level::Trace, true) => "\x1b[35mTRACE\x1b[0m",
            (Level::Error, false) => "ERROR",
            (Level::Warn, false) => "WARN ",
            (Level::Info, false) => "INFO ",
            (Level::Debug, false) => "DEBUG",
            (Level::Trace, false) => "TRACE",
        };
        line.push_str(level);
        line.push(' ');

        if self.config.show_module {
            if let Some(module) = record.module_path() {
                line.push_str(&format!("[{}] ", module));
            }
        }

        line.push_str(&record.args().to_string());
        line
    }
}

impl Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.config.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        if matches!(self.config.output, LogOutput::Stdout | LogOutput::Both(_)) {
            println!("{}", self.format(record, self.config.use_color));
        }

        // 文件中不使用颜色
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = writeln!(file, "{}", self.format(record, false));
            }
        }
    }

    fn flush(&self) {
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.flush();
            }
        }
    }
}

/// 初始化日志系统，只能调用一次
pub fn init_logger(config: LogConfig) -> Result<(), String> {
    let file = match &config.output {
        LogOutput::File(path) | LogOutput::Both(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(|e| format!("无法创建日志目录: {}", e))?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| format!("无法创建日志文件: {}", e))?;
            Some(Mutex::new(file))
        }
        LogOutput::Stdout => None,
    };

    let level = config.level;
    log::set_boxed_logger(Box::new(Logger { config, file }))
        .map_err(|e| format!("设置日志器失败: {}", e))?;
    log::set_max_level(level);

    Ok(())
}

/// 从 RUST_LOG 环境变量读取日志级别并初始化
pub fn init_from_env() -> Result<(), String> {
    let level = std::env::var("RUST_LOG")
        .ok()
        .and_then(|s| parse_level(&s))
        .unwrap_or(LevelFilter::Info);
    init_logger(LogConfig::new(level))
}

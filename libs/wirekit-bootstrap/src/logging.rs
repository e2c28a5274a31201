//! Logging initialization: human-readable console output plus optional
//! per-subsystem JSON files with rotation.
//!
//! Each `logging` section maps a target prefix to its own levels and an
//! optional file; the `default` section is the fallback for everything
//! else. `RUST_LOG`, when set, acts as a global upper bound on top of the
//! configured targets.

use std::collections::HashMap;
use std::io::{IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};

use file_rotate::compression::Compression;
use file_rotate::suffix::{AppendTimestamp, FileLimit};
use file_rotate::{ContentLimit, FileRotate};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer, Registry};

use crate::config::{LogSection, LoggingConfig};

// Dropping the guard would lose buffered console output.
static CONSOLE_GUARD: OnceLock<tracing_appender::non_blocking::WorkerGuard> = OnceLock::new();

fn parse_level(s: &str) -> Option<LevelFilter> {
    match s.to_ascii_lowercase().as_str() {
        "trace" => Some(LevelFilter::TRACE),
        "debug" => Some(LevelFilter::DEBUG),
        "info" => Some(LevelFilter::INFO),
        "warn" => Some(LevelFilter::WARN),
        "error" => Some(LevelFilter::ERROR),
        "off" | "none" => None,
        _ => Some(LevelFilter::INFO),
    }
}

/// target == prefix, or target starts with "prefix::"
fn matches_prefix(target: &str, prefix: &str) -> bool {
    target == prefix
        || (target.starts_with(prefix) && target[prefix.len()..].starts_with("::"))
}

#[derive(Clone)]
struct RotatingWriter(Arc<Mutex<FileRotate<AppendTimestamp>>>);

impl RotatingWriter {
    fn open(
        path: &Path,
        section: &LogSection,
    ) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let limit = match section.max_backups {
            Some(n) => FileLimit::MaxFiles(n),
            None => FileLimit::Age(chrono::Duration::days(
                section.max_age_days.unwrap_or(1) as i64,
            )),
        };
        let max_bytes = section.max_size_mb.unwrap_or(100) as usize * 1024 * 1024;
        let rotate = FileRotate::new(
            path,
            AppendTimestamp::default(limit),
            ContentLimit::BytesSurpassed(max_bytes),
            Compression::None,
            None,
        );
        Ok(Self(Arc::new(Mutex::new(rotate))))
    }
}

#[derive(Clone)]
struct WriterHandle(Option<Arc<Mutex<FileRotate<AppendTimestamp>>>>);

impl Write for WriterHandle {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match &self.0 {
            Some(inner) => inner.lock().unwrap().write(buf),
            None => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match &self.0 {
            Some(inner) => inner.lock().unwrap().flush(),
            None => Ok(()),
        }
    }
}

/// Routes records to per-subsystem files by target prefix, falling back to
/// the default file (or discarding when there is none).
#[derive(Clone)]
struct FileRouter {
    default: Option<RotatingWriter>,
    by_prefix: HashMap<String, RotatingWriter>,
}

impl FileRouter {
    fn is_empty(&self) -> bool {
        self.default.is_none() && self.by_prefix.is_empty()
    }
}

impl<'a> fmt::MakeWriter<'a> for FileRouter {
    type Writer = WriterHandle;

    fn make_writer(&'a self) -> Self::Writer {
        WriterHandle(self.default.as_ref().map(|w| Arc::clone(&w.0)))
    }

    fn make_writer_for(&'a self, meta: &tracing::Metadata<'_>) -> Self::Writer {
        let target = meta.target();
        for (prefix, writer) in &self.by_prefix {
            if matches_prefix(target, prefix) {
                return WriterHandle(Some(Arc::clone(&writer.0)));
            }
        }
        WriterHandle(self.default.as_ref().map(|w| Arc::clone(&w.0)))
    }
}

fn resolve_path(file: &str, logs_dir: &Path) -> PathBuf {
    let p = Path::new(file);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        logs_dir.join(p)
    }
}

enum Sink {
    Console,
    File { has_default_file: bool },
}

fn build_targets(cfg: &LoggingConfig, sink: Sink) -> Targets {
    let default_section = cfg.get("default");
    let (default_level, fallback) = match &sink {
        Sink::Console => (
            default_section.and_then(|s| parse_level(&s.console_level)),
            LevelFilter::INFO,
        ),
        Sink::File { has_default_file } => (
            default_section.and_then(|s| parse_level(&s.file_level)),
            if *has_default_file {
                LevelFilter::INFO
            } else {
                LevelFilter::OFF
            },
        ),
    };
    let mut targets = Targets::new().with_default(default_level.unwrap_or(fallback));
    for (prefix, section) in cfg.iter().filter(|(k, _)| k.as_str() != "default") {
        let level = match &sink {
            Sink::Console => parse_level(&section.console_level),
            Sink::File { .. } => {
                if section.file.trim().is_empty() {
                    continue;
                }
                parse_level(&section.file_level)
            }
        };
        if let Some(level) = level {
            targets = targets.with_target(prefix.clone(), level);
        }
    }
    targets
}

fn build_router(cfg: &LoggingConfig, logs_dir: &Path) -> FileRouter {
    let mut router = FileRouter {
        default: None,
        by_prefix: HashMap::new(),
    };
    for (name, section) in cfg {
        if section.file.trim().is_empty() {
            continue;
        }
        let path = resolve_path(&section.file, logs_dir);
        match RotatingWriter::open(&path, section) {
            Ok(writer) => {
                if name == "default" {
                    router.default = Some(writer);
                } else {
                    router.by_prefix.insert(name.clone(), writer);
                }
            }
            Err(e) => eprintln!(
                "failed to open log file '{}' for '{name}': {e}",
                path.to_string_lossy()
            ),
        }
    }
    router
}

/// Install the global subscriber from the logging configuration.
pub fn init_logging(cfg: &LoggingConfig, logs_dir: &Path) {
    // bridge `log` records into `tracing` before installing the subscriber
    if let Err(e) = tracing_log::LogTracer::init() {
        eprintln!("log bridge init skipped: {e}");
    }

    let env: Option<EnvFilter> = EnvFilter::try_from_default_env().ok();

    let (stderr, guard) = tracing_appender::non_blocking(std::io::stderr());
    let _ = CONSOLE_GUARD.set(guard);
    let console_layer = fmt::layer()
        .with_writer(stderr)
        .with_ansi(std::io::stderr().is_terminal())
        .with_target(true)
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .with_filter(build_targets(cfg, Sink::Console));

    let router = build_router(cfg, logs_dir);
    let file_layer = if router.is_empty() {
        None
    } else {
        let targets = build_targets(
            cfg,
            Sink::File {
                has_default_file: router.default.is_some(),
            },
        );
        Some(
            fmt::layer()
                .json()
                .with_ansi(false)
                .with_target(true)
                .with_timer(fmt::time::UtcTime::rfc_3339())
                .with_writer(router)
                .with_filter(targets),
        )
    };

    let _ = Registry::default()
        .with(env)
        .with(console_layer)
        .with(file_layer)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_matching_requires_path_separator() {
        assert!(matches_prefix("wirekit::component", "wirekit"));
        assert!(matches_prefix("wirekit", "wirekit"));
        assert!(!matches_prefix("wirekitx::component", "wirekit"));
    }

    #[test]
    fn console_targets_honor_per_subsystem_levels() {
        let mut cfg = LoggingConfig::new();
        cfg.insert(
            "default".to_string(),
            LogSection {
                console_level: "warn".to_string(),
                ..LogSection::default()
            },
        );
        cfg.insert(
            "wirekit".to_string(),
            LogSection {
                console_level: "debug".to_string(),
                ..LogSection::default()
            },
        );
        let targets = build_targets(&cfg, Sink::Console);
        assert_eq!(targets.default_level(), Some(LevelFilter::WARN));
    }

    #[test]
    fn file_targets_are_off_without_any_file() {
        let mut cfg = LoggingConfig::new();
        cfg.insert("default".to_string(), LogSection::default());
        let targets = build_targets(&cfg, Sink::File {
            has_default_file: false,
        });
        assert_eq!(targets.default_level(), Some(LevelFilter::OFF));
    }
}

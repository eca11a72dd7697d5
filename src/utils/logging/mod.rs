use std::fmt;
use std::fmt::Write;
use std::path::PathBuf;

use tracing_appender::non_blocking::{NonBlocking, NonBlockingBuilder, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::time::FormatTime;
use tracing_subscriber::fmt::{format::FmtSpan, Layer as FmtLayer};
use tracing_subscriber::{prelude::*, registry::Registry, EnvFilter};

use super::app_config::config;
use super::error::Result;

pub mod prelude {
    pub use tracing::{debug, error, info, trace, warn};
    pub use tracing::{debug_span, error_span, info_span, trace_span, warn_span};
    pub use tracing::{event, field::Empty, instrument, span};
}

/// Install the global subscriber as described by the `logging` section of the loaded config.
/// Falls back to the built-in defaults when the section is missing.
///
/// The returned guard flushes the non-blocking writers when dropped, so it has to be held in main.
pub fn setup() -> Result<LoggingGuard> {
    let cfg: LoggingConfig = config().get("logging").unwrap_or_default();
    setup_with(&cfg)
}

/// This needs to be hold in main
pub struct LoggingGuard {
    _worker_guards: Vec<WorkerGuard>,
}

fn setup_with(cfg: &LoggingConfig) -> Result<LoggingGuard> {
    let mut worker_guards = vec![];
    let span_events = cfg
        .span_events
        .iter()
        .fold(FmtSpan::NONE, |f, e| f | (*e).into());

    let term = match &cfg.term {
        Some(term) if term.enabled => {
            let (writer, guard) = term.to_writer();
            worker_guards.push(guard);
            Some(
                FmtLayer::default()
                    .with_ansi(true)
                    .with_target(false)
                    .with_span_events(span_events.clone())
                    .with_timer(ISOTimeFormat)
                    .with_writer(writer),
            )
        }
        _ => None,
    };

    let file = match &cfg.file {
        Some(file) if file.enabled => {
            let (writer, guard) = file.to_writer();
            worker_guards.push(guard);
            Some(
                FmtLayer::default()
                    .with_ansi(false)
                    .with_target(true)
                    .with_span_events(span_events)
                    .with_timer(ISOTimeFormat)
                    .with_writer(writer),
            )
        }
        _ => None,
    };

    Registry::default()
        .with(cfg.filter.to_env_filter())
        .with(term)
        .with(file)
        .try_init()?;

    Ok(LoggingGuard {
        _worker_guards: worker_guards,
    })
}

struct ISOTimeFormat;

impl FormatTime for ISOTimeFormat {
    fn format_time(&self, w: &mut dyn Write) -> fmt::Result {
        write!(w, "{}", chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"))
    }
}

// ====== Config to Layer ======

impl FilterConfig {
    pub fn to_env_filter(&self) -> EnvFilter {
        let filter = match &self.from_env {
            Some(env) => EnvFilter::from_env(env),
            None => EnvFilter::default(),
        };

        match &self.directives {
            Some(dirs) => dirs
                .split(',')
                .filter(|s| !s.trim().is_empty())
                .filter_map(|s| match s.trim().parse() {
                    Ok(d) => Some(d),
                    Err(err) => {
                        eprintln!("ignoring log directive `{}`: {}", s, err);
                        None
                    }
                })
                .fold(filter, |f, dir| f.add_directive(dir)),
            None => filter,
        }
    }
}

impl TermOutput {
    fn to_writer(&self) -> (NonBlocking, WorkerGuard) {
        let builder = NonBlockingBuilder::default().lossy(false);
        match self.name {
            TermTarget::Stdout => builder.finish(std::io::stdout()),
            TermTarget::Stderr => builder.finish(std::io::stderr()),
        }
    }
}

impl FileOutput {
    fn to_writer(&self) -> (NonBlocking, WorkerGuard) {
        NonBlockingBuilder::default()
            .lossy(false)
            .finish(RollingFileAppender::new(Rotation::NEVER, &self.directory, &self.name))
    }
}

impl From<SpanEvent> for FmtSpan {
    fn from(e: SpanEvent) -> Self {
        match e {
            SpanEvent::New => FmtSpan::NEW,
            SpanEvent::Enter => FmtSpan::ENTER,
            SpanEvent::Exit => FmtSpan::EXIT,
            SpanEvent::Close => FmtSpan::CLOSE,
            SpanEvent::Active => FmtSpan::ACTIVE,
            SpanEvent::Full => FmtSpan::FULL,
        }
    }
}

// ====== Logging Config ======

#[derive(Debug, serde::Deserialize)]
struct LoggingConfig {
    #[serde(default)]
    filter: FilterConfig,
    #[serde(default)]
    span_events: Vec<SpanEvent>,
    #[serde(default = "TermOutput::stderr")]
    term: Option<TermOutput>,
    #[serde(default)]
    file: Option<FileOutput>,
}

#[derive(Debug, serde::Deserialize)]
struct FilterConfig {
    #[serde(default)]
    directives: Option<String>,
    #[serde(default, deserialize_with = "deserialize_filter_from_env")]
    from_env: Option<String>,
}

#[derive(Copy, Clone, Debug, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
enum SpanEvent {
    New,
    Enter,
    Exit,
    Close,
    Active,
    Full,
}

#[derive(Debug, serde::Deserialize)]
struct TermOutput {
    #[serde(default = "enabled")]
    enabled: bool,
    name: TermTarget,
}

#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
enum TermTarget {
    Stdout,
    Stderr,
}

#[derive(Debug, serde::Deserialize)]
struct FileOutput {
    #[serde(default = "enabled")]
    enabled: bool,
    directory: PathBuf,
    name: PathBuf,
}

fn enabled() -> bool {
    true
}

impl TermOutput {
    // stdout is left to command output, e.g. `config` dumps
    fn stderr() -> Option<Self> {
        Some(Self {
            enabled: true,
            name: TermTarget::Stderr,
        })
    }
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            directives: Some("info".into()),
            from_env: Some("RUST_LOG".into()),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: Default::default(),
            span_events: vec![],
            term: TermOutput::stderr(),
            file: None,
        }
    }
}

// ====== serde helpers ======

/// Deserialize `false` to `None`, `true` to `Some("RUST_LOG")`, and string to `Some(xxx)`
fn deserialize_filter_from_env<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    struct VisitFromEnv;

    impl<'de> serde::de::Visitor<'de> for VisitFromEnv {
        type Value = Option<String>;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("bool or env variable name")
        }

        fn visit_bool<E>(self, value: bool) -> std::result::Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            Ok(if value { Some("RUST_LOG".into()) } else { None })
        }

        fn visit_str<E>(self, value: &str) -> std::result::Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            Ok(Some(value.to_owned()))
        }
    }

    deserializer.deserialize_any(VisitFromEnv)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directives_are_merged_into_filter() {
        let filter = FilterConfig {
            directives: Some("warn, fogsched::gateway=debug,".into()),
            from_env: None,
        };
        let rendered = filter.to_env_filter().to_string();
        assert!(rendered.contains("warn"));
        assert!(rendered.contains("fogsched::gateway=debug"));
    }

    #[test]
    fn default_logs_to_stderr() {
        let cfg = LoggingConfig::default();
        assert!(matches!(
            cfg.term,
            Some(TermOutput {
                name: TermTarget::Stderr,
                ..
            })
        ));
        assert!(cfg.file.is_none());
    }
}

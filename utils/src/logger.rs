use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use std::env;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::Rotation;
use tracing_log::LogTracer;
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};
use tracing_subscriber::{EnvFilter, util::SubscriberInitExt};

#[derive(Debug)]
pub enum LogError {
    Io(std::io::Error),
    Init(tracing_appender::rolling::InitError),
}

impl From<std::io::Error> for LogError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<tracing_appender::rolling::InitError> for LogError {
    fn from(err: tracing_appender::rolling::InitError) -> Self {
        Self::Init(err)
    }
}

impl std::fmt::Display for LogError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogError::Io(err) => write!(f, "{err}"),
            LogError::Init(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for LogError {}

#[derive(Debug, Clone, Serialize)]
pub struct LogRecord {
    pub time: String,
    #[serde(skip)]
    pub level: Level,
    #[serde(rename = "level")]
    pub level_name: String,
    pub module: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy_group: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub asset_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<u32>,
}

impl LogRecord {
    fn new(level: Level, module: impl Into<String>, message: impl Into<String>) -> Self {
        let time = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let level_name = level.to_string();
        Self {
            time,
            level,
            level_name,
            module: module.into(),
            message: message.into(),
            event_type: None,
            session: None,
            proxy_group: None,
            error_kind: None,
            asset_id: None,
            retry_count: None,
        }
    }
}

pub trait LogSink: Send + Sync {
    fn name(&self) -> &'static str;
    fn enabled(&self) -> bool {
        true
    }
    fn min_level(&self) -> Level;
    fn emit(&self, record: &LogRecord) -> Result<(), LogError>;
    fn flush(&self) -> Result<(), LogError> {
        Ok(())
    }
}

struct LogDispatcher {
    sinks: Vec<Arc<dyn LogSink>>,
}

impl LogDispatcher {
    fn new(sinks: Vec<Arc<dyn LogSink>>) -> Self {
        Self { sinks }
    }

    fn emit(&self, record: LogRecord) {
        if self.sinks.is_empty() {
            return;
        }

        for sink in &self.sinks {
            if !sink.enabled() || record.level > sink.min_level() {
                continue;
            }
            if sink.emit(&record).is_err() {
                metrics::counter!("log_sink_errors_total", "sink" => sink.name()).increment(1);
            }
        }
    }
}

struct LogSinkLayer {
    dispatcher: Arc<LogDispatcher>,
}

impl<S> Layer<S> for LogSinkLayer
where
    S: Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        let mut visitor = LogVisitor::new();
        event.record(&mut visitor);

        let message = if visitor.message.is_empty() {
            metadata.name().to_string()
        } else {
            visitor.message
        };

        let mut record = LogRecord::new(*metadata.level(), metadata.target(), message);
        record.event_type = visitor.event_type;
        record.session = visitor.session;
        record.proxy_group = visitor.proxy_group;
        record.error_kind = visitor.error_kind;
        record.asset_id = visitor.asset_id;
        record.retry_count = visitor.retry_count;

        self.dispatcher.emit(record);
    }
}

struct ConsoleSink {
    min_level: Level,
    writer: Mutex<tracing_appender::non_blocking::NonBlocking>,
    _guard: WorkerGuard,
}

impl ConsoleSink {
    fn new(min_level: Level) -> Self {
        let (writer, guard) = tracing_appender::non_blocking(std::io::stderr());
        Self {
            min_level,
            writer: Mutex::new(writer),
            _guard: guard,
        }
    }
}

impl LogSink for ConsoleSink {
    fn name(&self) -> &'static str {
        "console"
    }

    fn min_level(&self) -> Level {
        self.min_level
    }

    fn emit(&self, record: &LogRecord) -> Result<(), LogError> {
        let line = format_log_record_text(record);
        if let Ok(mut writer) = self.writer.lock() {
            use std::io::Write;
            writeln!(writer, "{}", line)?;
        }
        metrics::counter!("log_events_total", "sink" => self.name(), "level" => record.level.as_str()).increment(1);
        Ok(())
    }
}

struct FileSink {
    min_level: Level,
    writer: Mutex<tracing_appender::non_blocking::NonBlocking>,
    _guard: WorkerGuard,
}

impl FileSink {
    fn new(path: &Path, min_level: Level, rotation: Rotation) -> Result<Self, LogError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file_prefix = path.file_name().and_then(|n| n.to_str()).unwrap_or("app");
        let file_appender = tracing_appender::rolling::Builder::new()
            .rotation(rotation)
            .filename_prefix(file_prefix)
            .filename_suffix("log")
            .build(path.parent().unwrap_or_else(|| Path::new(".")))?;
        let (writer, guard) = tracing_appender::non_blocking(file_appender);
        Ok(Self {
            min_level,
            writer: Mutex::new(writer),
            _guard: guard,
        })
    }
}

impl LogSink for FileSink {
    fn name(&self) -> &'static str {
        "file"
    }

    fn min_level(&self) -> Level {
        self.min_level
    }

    fn emit(&self, record: &LogRecord) -> Result<(), LogError> {
        let line = format_log_record_text(record);
        if let Ok(mut writer) = self.writer.lock() {
            use std::io::Write;
            writeln!(writer, "{}", line)?;
        }
        metrics::counter!("log_events_total", "sink" => self.name(), "level" => record.level.as_str()).increment(1);
        Ok(())
    }
}

struct PrometheusSink {
    min_level: Level,
}

impl LogSink for PrometheusSink {
    fn name(&self) -> &'static str {
        "prometheus"
    }

    fn min_level(&self) -> Level {
        self.min_level
    }

    fn emit(&self, record: &LogRecord) -> Result<(), LogError> {
        metrics::counter!("log_events_total", "sink" => self.name(), "level" => record.level.as_str()).increment(1);
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub enum LogOutputConfig {
    Console {},
    File {
        path: PathBuf,
        rotation: Option<String>,
    },
}

#[derive(Debug, Clone)]
pub struct PrometheusConfig {
    pub enabled: bool,
}

#[derive(Debug, Clone)]
pub struct LoggerConfig {
    pub enabled: bool,
    pub level: String,
    pub outputs: Vec<LogOutputConfig>,
    pub prometheus: Option<PrometheusConfig>,
}

impl LoggerConfig {
    pub fn init(self) -> Result<(), Box<dyn std::error::Error>> {
        init_logger(self)
    }

    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_level(mut self, level: impl AsRef<str>) -> Self {
        self.level = level.as_ref().into();
        self
    }

    pub fn with_output(mut self, output: LogOutputConfig) -> Self {
        self.outputs.push(output);
        self
    }

    pub fn for_app(namespace: &str) -> Self {
        let mut config = Self::default();
        config.outputs = vec![
            LogOutputConfig::Console {},
            LogOutputConfig::File {
                path: PathBuf::from("logs").join(format!("patina.{namespace}.log")),
                rotation: Some("daily".to_string()),
            },
        ];
        config
    }
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            level: DEFAULT_APP_LOG_LEVEL.to_string(),
            outputs: vec![LogOutputConfig::Console {}],
            prometheus: None,
        }
    }
}

const DEFAULT_APP_LOG_LEVEL: &str = "info,sqlx=warn,sea_orm=warn";

static LOGGER_INITIALIZED: AtomicBool = AtomicBool::new(false);

pub fn is_logging_disabled() -> bool {
    let value = env::var("DISABLE_LOGS")
        .or_else(|_| env::var("PATINA_DISABLE_LOGS"))
        .unwrap_or_default();
    matches!(
        value.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "y" | "on"
    )
}

pub fn init_app_logger(namespace: &str) -> Result<bool, Box<dyn std::error::Error>> {
    if is_logging_disabled() {
        return Ok(false);
    }

    let config = LoggerConfig::for_app(namespace);
    init_logger(config)?;
    Ok(true)
}

pub fn init_logger(config: LoggerConfig) -> Result<(), Box<dyn std::error::Error>> {
    if is_logging_disabled() {
        let _ = LOGGER_INITIALIZED.swap(true, Ordering::SeqCst);
        return Ok(());
    }
    if LOGGER_INITIALIZED.swap(true, Ordering::SeqCst) {
        tracing::warn!("Logger already initialized, skipping re-initialization");
        return Ok(());
    }

    let _ = LogTracer::builder()
        .with_max_level(log::LevelFilter::Trace)
        .init();

    let configured_filter = normalize_filter_string(&config.level);
    let filter = if configured_filter != DEFAULT_APP_LOG_LEVEL {
        EnvFilter::try_new(&configured_filter).unwrap_or_else(|_| EnvFilter::new("info"))
    } else {
        EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(&configured_filter))
            .unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let sinks = build_sinks(&config)?;
    let dispatcher = Arc::new(LogDispatcher::new(sinks));
    let layer = LogSinkLayer { dispatcher };

    let _ = tracing_subscriber::registry()
        .with(layer)
        .with(filter)
        .try_init();

    Ok(())
}

fn build_sinks(config: &LoggerConfig) -> Result<Vec<Arc<dyn LogSink>>, LogError> {
    if !config.enabled {
        return Ok(Vec::new());
    }

    let mut sinks: Vec<Arc<dyn LogSink>> = Vec::new();
    let base_level = base_level_from_filter(&config.level).unwrap_or(Level::INFO);

    for output in &config.outputs {
        match output {
            LogOutputConfig::Console {} => {
                sinks.push(Arc::new(ConsoleSink::new(base_level)));
            }
            LogOutputConfig::File { path, rotation } => {
                let rotation = match rotation.as_deref() {
                    Some("daily") | None => Rotation::DAILY,
                    Some("hourly") => Rotation::HOURLY,
                    Some("never") => Rotation::NEVER,
                    Some("minutely") => Rotation::MINUTELY,
                    _ => Rotation::DAILY,
                };
                sinks.push(Arc::new(FileSink::new(path.as_path(), base_level, rotation)?));
            }
        }
    }

    if let Some(prometheus) = &config.prometheus
        && prometheus.enabled
    {
        sinks.push(Arc::new(PrometheusSink {
            min_level: base_level,
        }));
    }

    Ok(sinks)
}

fn normalize_filter_string(filter: &str) -> String {
    let trimmed = filter.trim();
    if trimmed.contains('=') || trimmed.contains(',') || trimmed.contains(';') {
        return trimmed.to_string();
    }
    let lower = trimmed.to_lowercase();
    let normalized = match lower.as_str() {
        "all" => "trace",
        "fatal" => "error",
        "warning" => "warn",
        other => other,
    };
    build_allowlist_filter(normalized)
}

fn build_allowlist_filter(level: &str) -> String {
    format!(
        "off,common={level},engine={level},errors={level},patina={level},proxy={level},queue={level},session={level},storage={level},utils={level},sqlx=warn,sea_orm=warn"
    )
}

fn base_level_from_filter(level: &str) -> Option<Level> {
    let candidate = level
        .split(|ch| ch == ',' || ch == ';')
        .next()
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())?;
    candidate.parse::<Level>().ok()
}

fn format_log_record_text(record: &LogRecord) -> String {
    let mut line = format!(
        "{} [{}] {} - {}",
        record.time, record.level_name, record.module, record.message
    );

    if let Some(value) = &record.event_type {
        line.push_str(&format!(" event_type={value}"));
    }
    if let Some(value) = &record.session {
        line.push_str(&format!(" session={value}"));
    }
    if let Some(value) = &record.proxy_group {
        line.push_str(&format!(" proxy_group={value}"));
    }
    if let Some(value) = &record.error_kind {
        line.push_str(&format!(" error_kind={value}"));
    }
    if let Some(value) = &record.asset_id {
        line.push_str(&format!(" asset_id={value}"));
    }
    if let Some(value) = &record.retry_count {
        line.push_str(&format!(" retry.count={value}"));
    }

    line
}

struct LogVisitor {
    message: String,
    event_type: Option<String>,
    session: Option<String>,
    proxy_group: Option<String>,
    error_kind: Option<String>,
    asset_id: Option<String>,
    retry_count: Option<u32>,
}

impl LogVisitor {
    fn new() -> Self {
        Self {
            message: String::with_capacity(64),
            event_type: None,
            session: None,
            proxy_group: None,
            error_kind: None,
            asset_id: None,
            retry_count: None,
        }
    }
}

impl Visit for LogVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            use std::fmt::Write;
            let _ = write!(self.message, "{:?}", value);
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        match field.name() {
            "message" => self.message.push_str(value),
            "event_type" => self.event_type = Some(value.to_string()),
            "session" => self.session = Some(value.to_string()),
            "proxy_group" => self.proxy_group = Some(value.to_string()),
            "error_kind" => self.error_kind = Some(value.to_string()),
            "asset_id" => self.asset_id = Some(value.to_string()),
            _ => {}
        }
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        match field.name() {
            "retry_count" => self.retry_count = Some(value as u32),
            "session" => self.session = Some(value.to_string()),
            "proxy_group" => self.proxy_group = Some(value.to_string()),
            "asset_id" => self.asset_id = Some(value.to_string()),
            _ => {}
        }
    }
}

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Kinds of user-visible history entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    Unknown,
    Knock,
    ErrorNetwork,
    ErrorInvalidHost,
    ErrorResolveHost,
    ErrorEmptySequence,
    ErrorUnknown,
    SequenceSaved,
    SequenceDeleted,
    Export,
    Import,
    ErrorExport,
    ErrorImport,
    Cancelled,
}

impl EventKind {
    pub fn is_error(self) -> bool {
        matches!(
            self,
            EventKind::ErrorNetwork
                | EventKind::ErrorInvalidHost
                | EventKind::ErrorResolveHost
                | EventKind::ErrorEmptySequence
                | EventKind::ErrorUnknown
                | EventKind::ErrorExport
                | EventKind::ErrorImport
        )
    }

    pub fn describe(self) -> &'static str {
        match self {
            EventKind::Unknown => "event",
            EventKind::Knock => "knocked",
            EventKind::ErrorNetwork => "network error",
            EventKind::ErrorInvalidHost => "invalid host",
            EventKind::ErrorResolveHost => "cannot resolve host",
            EventKind::ErrorEmptySequence => "empty sequence",
            EventKind::ErrorUnknown => "error",
            EventKind::SequenceSaved => "sequence saved",
            EventKind::SequenceDeleted => "sequence deleted",
            EventKind::Export => "exported",
            EventKind::Import => "imported",
            EventKind::ErrorExport => "export failed",
            EventKind::ErrorImport => "import failed",
            EventKind::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEvent {
    pub kind: EventKind,
    pub args: Vec<String>,
    pub at: DateTime<Local>,
}

impl LogEvent {
    pub fn new<I, S>(kind: EventKind, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            kind,
            args: args.into_iter().map(Into::into).collect(),
            at: Local::now(),
        }
    }

    /// `[name, host, public IPs, resolved addresses]`
    pub fn knock(name: &str, host: &str, public_ips: &[String], addresses: &[String]) -> Self {
        Self::new(
            EventKind::Knock,
            [name.to_string(), host.to_string(), public_ips.join(", "), addresses.join(", ")],
        )
    }

    pub fn message(&self) -> String {
        let args: Vec<&str> = self
            .args
            .iter()
            .map(String::as_str)
            .filter(|a| !a.is_empty())
            .collect();
        if args.is_empty() {
            self.kind.describe().to_string()
        } else {
            format!("{}: {}", self.kind.describe(), args.join(" | "))
        }
    }
}

/// Sink for history events. `log` must return immediately.
pub trait EventLogger: Send + Sync {
    fn log(&self, event: LogEvent);
}

/// Forwards events to the `log` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogEventLogger;

impl EventLogger for LogEventLogger {
    fn log(&self, event: LogEvent) {
        if event.kind.is_error() {
            log::warn!("{}", event.message());
        } else {
            log::info!("{}", event.message());
        }
    }
}

/// Fan-out to several sinks.
#[derive(Default, Clone)]
pub struct EventLoggers(Vec<Arc<dyn EventLogger>>);

impl EventLoggers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, logger: Arc<dyn EventLogger>) -> Self {
        self.0.push(logger);
        self
    }
}

impl EventLogger for EventLoggers {
    fn log(&self, event: LogEvent) {
        for logger in &self.0 {
            logger.log(event.clone());
        }
    }
}

/// Appends events as JSON lines; the file is written by a background task.
pub struct HistoryFile {
    sender: Mutex<Option<mpsc::UnboundedSender<LogEvent>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl HistoryFile {
    /// Must be called inside a tokio runtime.
    pub fn open(path: &Path) -> std::io::Result<Self> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        let mut file = tokio::fs::File::from_std(file);
        let (sender, mut receiver) = mpsc::unbounded_channel::<LogEvent>();
        let path = path.display().to_string();

        let writer = tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                let mut line = match serde_json::to_string(&event) {
                    Ok(line) => line,
                    Err(e) => {
                        log::error!("Cannot serialize history event: {}", e);
                        continue;
                    }
                };
                line.push('\n');
                if let Err(e) = file.write_all(line.as_bytes()).await {
                    log::error!("Cannot write history file {}: {}", path, e);
                }
            }
            if let Err(e) = file.flush().await {
                log::error!("Cannot flush history file {}: {}", path, e);
            }
        });

        Ok(Self {
            sender: Mutex::new(Some(sender)),
            writer: Mutex::new(Some(writer)),
        })
    }

    /// Stops accepting events and waits until queued ones are on disk.
    pub async fn close(&self) {
        drop(self.sender.lock().unwrap_or_else(PoisonError::into_inner).take());
        let writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(writer) = writer {
            let _ = writer.await;
        }
    }
}

impl EventLogger for HistoryFile {
    fn log(&self, event: LogEvent) {
        let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        match sender.as_ref() {
            Some(sender) if sender.send(event).is_ok() => {}
            _ => log::debug!("History file closed, dropping event"),
        }
    }
}

/// Keeps events in memory, newest last.
#[derive(Debug, Default)]
pub struct MemoryEventLog {
    events: Mutex<Vec<LogEvent>>,
}

impl MemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<LogEvent> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn kinds(&self) -> Vec<EventKind> {
        self.events().iter().map(|e| e.kind).collect()
    }
}

impl EventLogger for MemoryEventLog {
    fn log(&self, event: LogEvent) {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).push(event);
    }
}

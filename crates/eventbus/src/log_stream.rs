//! The global Log Stream: a process-wide structured-logging sink that any
//! frontend can subscribe to without polling, independent of any single
//! world's event bus.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

use crate::topics::{LogLevel, LogRecord};

const LOG_STREAM_CAPACITY: usize = 1024;

pub struct LogStream {
    sender: broadcast::Sender<LogRecord>,
}

impl LogStream {
    fn new() -> Self {
        Self {
            sender: broadcast::channel(LOG_STREAM_CAPACITY).0,
        }
    }

    pub fn global() -> &'static LogStream {
        static INSTANCE: OnceLock<LogStream> = OnceLock::new();
        INSTANCE.get_or_init(LogStream::new)
    }

    pub fn publish(&self, record: LogRecord) {
        let _ = self.sender.send(record);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LogRecord> {
        self.sender.subscribe()
    }

    /// `addLogStreamCallback(cb) -> unsubscribe`: spawns a task that forwards
    /// every future record to `callback` until the returned handle is
    /// dropped or explicitly unsubscribed.
    pub fn add_callback<F>(&self, callback: F) -> LogStreamSubscription
    where
        F: Fn(LogRecord) + Send + Sync + 'static,
    {
        let mut rx = self.subscribe();
        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(record) => callback(record),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        LogStreamSubscription { handle }
    }
}

pub struct LogStreamSubscription {
    handle: JoinHandle<()>,
}

impl LogStreamSubscription {
    pub fn unsubscribe(self) {
        self.handle.abort();
    }
}

/// A `tracing_subscriber::Layer` that mirrors every formatted event onto the
/// global `LogStream`, so in-process subscribers and the process's own
/// stderr logging share one source of truth.
pub struct LogStreamLayer;

impl<S: Subscriber> Layer<S> for LogStreamLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        let record = LogRecord {
            level: map_level(event.metadata().level()),
            category: event.metadata().target().to_string(),
            message: visitor.message.unwrap_or_default(),
            timestamp: Utc::now(),
            data: visitor.to_data_value(),
            message_id: None,
        };
        LogStream::global().publish(record);
    }
}

fn map_level(level: &tracing::Level) -> LogLevel {
    match *level {
        tracing::Level::TRACE => LogLevel::Trace,
        tracing::Level::DEBUG => LogLevel::Debug,
        tracing::Level::INFO => LogLevel::Info,
        tracing::Level::WARN => LogLevel::Warn,
        tracing::Level::ERROR => LogLevel::Error,
    }
}

#[derive(Default)]
struct FieldVisitor {
    message: Option<String>,
    fields: BTreeMap<String, Value>,
}

impl FieldVisitor {
    fn to_data_value(self) -> Option<Value> {
        if self.fields.is_empty() {
            None
        } else {
            Some(Value::Object(self.fields.into_iter().collect()))
        }
    }
}

impl Visit for FieldVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = Some(value.to_string());
        } else {
            self.fields
                .insert(field.name().to_string(), Value::String(value.to_string()));
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.fields
            .insert(field.name().to_string(), Value::from(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.fields
            .insert(field.name().to_string(), Value::from(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.fields
            .insert(field.name().to_string(), Value::from(value));
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        let rendered = format!("{value:?}");
        if field.name() == "message" {
            self.message = Some(rendered);
        } else {
            self.fields.insert(field.name().to_string(), Value::String(rendered));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_subscriber() {
        let stream = LogStream::new();
        let mut rx = stream.subscribe();
        stream.publish(LogRecord {
            level: LogLevel::Info,
            category: "test".to_string(),
            message: "hello".to_string(),
            timestamp: Utc::now(),
            data: None,
            message_id: None,
        });
        let received = rx.recv().await.unwrap();
        assert_eq!(received.message, "hello");
    }

    #[tokio::test]
    async fn add_callback_invokes_on_publish() {
        use std::sync::{Arc, Mutex};

        let stream = LogStream::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let subscription = stream.add_callback(move |record| {
            seen_clone.lock().unwrap().push(record.message);
        });

        stream.publish(LogRecord {
            level: LogLevel::Warn,
            category: "test".to_string(),
            message: "watch out".to_string(),
            timestamp: Utc::now(),
            data: None,
            message_id: None,
        });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(seen.lock().unwrap().as_slice(), ["watch out".to_string()]);
        subscription.unsubscribe();
    }
}

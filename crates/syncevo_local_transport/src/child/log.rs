//! Forwarding of the helper's log output to the parent.

use std::fmt::{self, Write as _};

use syncevo_protocol::{LogRecord, Signal};
use syncevo_runtime::EventLoop;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

use crate::rpc::WeakRpcConnection;

/// A `tracing` layer that queues every event for the parent.
///
/// Events recorded before the parent connected are kept until
/// [`forward_logs`] runs.
#[derive(Debug, Clone)]
pub struct ChildLogLayer {
    sender: mpsc::UnboundedSender<LogRecord>,
}

/// Receiving end of a [`ChildLogLayer`].
#[derive(Debug)]
pub struct LogReceiver(mpsc::UnboundedReceiver<LogRecord>);

/// Creates a layer and the receiver for its records.
pub fn log_channel() -> (ChildLogLayer, LogReceiver) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (ChildLogLayer { sender }, LogReceiver(receiver))
}

#[derive(Default)]
struct RecordVisitor {
    message: String,
    prefix: String,
    fields: String,
}

impl RecordVisitor {
    fn finish(mut self) -> (String, String) {
        if !self.fields.is_empty() {
            if !self.message.is_empty() {
                self.message.push(' ');
            }
            self.message.push_str(&self.fields);
        }
        (self.prefix, self.message)
    }
}

impl Visit for RecordVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        match field.name() {
            "message" => self.message = value.to_string(),
            "prefix" => self.prefix = value.to_string(),
            _ => self.record_debug(field, &value),
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        match field.name() {
            "message" => self.message = format!("{value:?}"),
            "prefix" => self.prefix = format!("{value:?}"),
            name => {
                if !self.fields.is_empty() {
                    self.fields.push(' ');
                }
                let _ = write!(self.fields, "{name}={value:?}");
            }
        }
    }
}

impl<S: Subscriber> Layer<S> for ChildLogLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = RecordVisitor::default();
        event.record(&mut visitor);
        let (prefix, message) = visitor.finish();
        // nobody listens once the connection is gone
        let _ = self.sender.send(LogRecord {
            level: event.metadata().level().to_string(),
            prefix,
            message,
        });
    }
}

/// Sends queued log records to the parent until the connection closes.
pub fn forward_logs(
    receiver: LogReceiver,
    connection: WeakRpcConnection,
    event_loop: &EventLoop,
) -> JoinHandle<()> {
    let LogReceiver(mut receiver) = receiver;
    event_loop.spawn_local(async move {
        while let Some(record) = receiver.recv().await {
            let Some(connection) = connection.upgrade() else {
                break;
            };
            if connection.emit_signal(Signal::LogOutput(record)).is_err() {
                break;
            }
        }
    })
}

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

use super::tasks::{Consume, SinkTask};
use crate::error::Result;
use crate::message::Message;
use crate::queue::{Queue, QueueError};

/// Logs every message it receives
#[derive(Debug, Clone, Default)]
pub struct LogSink {
    label: String,
    count: usize,
}

impl LogSink {
    pub fn new(label: &str) -> Self {
        Self {
            label: label.to_string(),
            count: 0,
        }
    }
}

impl Consume for LogSink {
    fn consume(&mut self, msg: Message) -> Result<()> {
        if msg.is_eof() {
            tracing::info!("[{}] end of stream after {} records", self.label, self.count);
            return Ok(());
        }
        self.count += 1;
        tracing::info!("[{}] {}", self.label, msg.to_content());
        Ok(())
    }
}

/// Keeps every message, readable through a shared handle
#[derive(Debug, Clone, Default)]
pub struct CollectSink {
    items: Arc<Mutex<Vec<Message>>>,
}

impl CollectSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the messages received so far
    pub fn items(&self) -> Vec<Message> {
        self.items.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Consume for CollectSink {
    fn consume(&mut self, msg: Message) -> Result<()> {
        self.items.lock().push(msg);
        Ok(())
    }
}

/// Copies each message, the sentinel included, into several queues
#[derive(Debug, Clone, Default)]
pub struct Fanout {
    outputs: Vec<Queue>,
    put_timeout: Option<Duration>,
}

impl Fanout {
    pub fn new() -> Self {
        Self {
            outputs: Vec::new(),
            put_timeout: Some(Duration::from_secs(1)),
        }
    }

    /// Add an output; returns the queue downstream tasks should read.
    pub fn output(&mut self) -> Queue {
        let queue = Queue::new();
        self.outputs.push(queue.clone());
        queue
    }
}

impl Consume for Fanout {
    fn consume(&mut self, msg: Message) -> Result<()> {
        for output in &self.outputs {
            let sent = match self.put_timeout {
                Some(timeout) => output.put_timeout(msg.clone(), timeout).map_err(|(_, e)| e),
                None => output.put(msg.clone()),
            };
            if let Err(QueueError::Timeout) = sent {
                tracing::warn!("Broadcast output is full, dropping a message");
            }
        }
        Ok(())
    }
}

/// Sink task fanning one stream out to independent consumers
pub type Broadcast = SinkTask<Fanout>;

impl Broadcast {
    /// Broadcast over `outputs` fresh queues, returned in order.
    pub fn fan_out(name: &str, outputs: usize) -> (Self, Vec<Queue>) {
        let mut fanout = Fanout::new();
        let queues = (0..outputs).map(|_| fanout.output()).collect();
        (SinkTask::new(name, fanout), queues)
    }
}

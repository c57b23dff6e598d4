use std::time::Duration;

use super::{Runtime, Task, TaskKind};
use crate::error::{DataMuxError, Result};
use crate::message::Message;
use crate::queue::{Flag, Queue, DEFAULT_TIMEOUT};
use crate::reader::Emitter;
use crate::transform::Transform;

/// Step of a source task: push zero or more messages, `Some(code)` to end.
pub trait Produce: Send + 'static {
    fn produce(&mut self, out: &Emitter) -> Result<Option<i32>>;
}

/// Step of a pipe task: map one message to zero or one message.
pub trait Process: Send + 'static {
    fn process(&mut self, msg: Message) -> Result<Option<Message>>;
}

/// Step of a sink task; also receives the end-of-stream sentinel.
pub trait Consume: Send + 'static {
    fn consume(&mut self, msg: Message) -> Result<()>;
}

impl<F> Produce for F
where
    F: FnMut(&Emitter) -> Result<Option<i32>> + Send + 'static,
{
    fn produce(&mut self, out: &Emitter) -> Result<Option<i32>> {
        self(out)
    }
}

impl<F> Process for F
where
    F: FnMut(Message) -> Result<Option<Message>> + Send + 'static,
{
    fn process(&mut self, msg: Message) -> Result<Option<Message>> {
        self(msg)
    }
}

impl Process for Transform {
    fn process(&mut self, msg: Message) -> Result<Option<Message>> {
        Ok(Some(self.apply(msg)))
    }
}

impl<F> Consume for F
where
    F: FnMut(Message) -> Result<()> + Send + 'static,
{
    fn consume(&mut self, msg: Message) -> Result<()> {
        self(msg)
    }
}

/// Pause after a failed step so a persistent error does not spin.
fn backoff(flag: &Flag) {
    flag.wait(Some(DEFAULT_TIMEOUT));
}

/// Task without input; its `target` feeds downstream tasks.
pub struct SourceTask<P: Produce> {
    target: Queue,
    producer: Option<P>,
    runtime: Runtime,
}

impl<P: Produce> SourceTask<P> {
    pub fn new(name: &str, producer: P) -> Self {
        Self::with_target(name, producer, Queue::new())
    }

    pub fn with_target(name: &str, producer: P, target: Queue) -> Self {
        Self {
            target,
            producer: Some(producer),
            runtime: Runtime::new(name),
        }
    }
}

impl<P: Produce> Task for SourceTask<P> {
    fn name(&self) -> &str {
        &self.runtime.name
    }

    fn kind(&self) -> TaskKind {
        TaskKind::Source
    }

    fn target(&self) -> Option<&Queue> {
        Some(&self.target)
    }

    fn start(&mut self) -> Result<()> {
        let mut producer = self
            .producer
            .take()
            .ok_or_else(|| DataMuxError::Pipeline(format!("task '{}' was already started", self.name())))?;
        let target = self.target.clone();
        let name = self.name().to_string();
        self.runtime.spawn(move |flag| {
            let out = Emitter::new(target, Transform::Identity, flag);
            while !out.is_stopped() {
                match producer.produce(&out) {
                    Ok(None) => {}
                    Ok(Some(code)) => {
                        tracing::debug!("Source '{}' ended with code {}", name, code);
                        break;
                    }
                    Err(e) => {
                        tracing::warn!("Source '{}' failed, retrying: {}", name, e);
                        backoff(out.flag());
                    }
                }
            }
            out.emit_eof();
        })
    }

    fn stop(&mut self) -> Result<()> {
        self.runtime.stop()
    }
}

/// Task transforming messages from `source` into `target`
pub struct PipeTask<P: Process> {
    source: Queue,
    target: Queue,
    processor: Option<P>,
    runtime: Runtime,
}

impl<P: Process> PipeTask<P> {
    /// Pipe with an unassigned source, to be wired by a pipeline.
    pub fn new(name: &str, processor: P) -> Self {
        Self {
            source: Queue::empty(),
            target: Queue::new(),
            processor: Some(processor),
            runtime: Runtime::new(name),
        }
    }
}

/// Pipe applying `f` to every data message
pub fn map_pipe<F>(name: &str, mut f: F) -> PipeTask<impl Process>
where
    F: FnMut(Message) -> Message + Send + 'static,
{
    PipeTask::new(name, move |msg: Message| -> Result<Option<Message>> { Ok(Some(f(msg))) })
}

/// Pipe dropping data messages for which `keep` is false
pub fn filter_pipe<F>(name: &str, mut keep: F) -> PipeTask<impl Process>
where
    F: FnMut(&Message) -> bool + Send + 'static,
{
    PipeTask::new(name, move |msg: Message| -> Result<Option<Message>> {
        Ok(if keep(&msg) { Some(msg) } else { None })
    })
}

impl<P: Process> Task for PipeTask<P> {
    fn name(&self) -> &str {
        &self.runtime.name
    }

    fn kind(&self) -> TaskKind {
        TaskKind::Pipe
    }

    fn source(&self) -> Option<&Queue> {
        Some(&self.source)
    }

    fn source_mut(&mut self) -> Option<&mut Queue> {
        Some(&mut self.source)
    }

    fn target(&self) -> Option<&Queue> {
        Some(&self.target)
    }

    fn start(&mut self) -> Result<()> {
        if !self.source.is_assigned() {
            return Err(DataMuxError::Pipeline(format!("pipe '{}' has no source", self.name())));
        }
        let mut processor = self
            .processor
            .take()
            .ok_or_else(|| DataMuxError::Pipeline(format!("task '{}' was already started", self.name())))?;
        let source = self.source.clone();
        let target = self.target.clone();
        let name = self.name().to_string();
        self.runtime.spawn(move |flag| {
            let out = Emitter::new(target, Transform::Identity, flag);
            while !out.is_stopped() {
                let msg = match source.get() {
                    Some(msg) => msg,
                    None => continue,
                };
                if msg.is_eof() {
                    break;
                }
                match processor.process(msg) {
                    Ok(Some(result)) => {
                        out.emit(result);
                    }
                    Ok(None) => {}
                    Err(e) => {
                        tracing::warn!("Pipe '{}' dropped a message: {}", name, e);
                        backoff(out.flag());
                    }
                }
            }
            out.emit_eof();
        })
    }

    fn stop(&mut self) -> Result<()> {
        self.runtime.stop()
    }
}

/// Task consuming `source` until the end of the stream
pub struct SinkTask<C: Consume> {
    source: Queue,
    consumer: Option<C>,
    completed: Flag,
    runtime: Runtime,
}

impl<C: Consume> SinkTask<C> {
    pub fn new(name: &str, consumer: C) -> Self {
        Self {
            source: Queue::empty(),
            consumer: Some(consumer),
            completed: Flag::new(),
            runtime: Runtime::new(name),
        }
    }

    /// Sink reading from an existing queue.
    pub fn with_source(name: &str, consumer: C, source: &Queue) -> Self {
        let mut sink = Self::new(name, consumer);
        sink.source.assign(source);
        sink
    }

    /// Wait up to `timeout` for the end of the stream.
    pub fn wait(&self, timeout: Duration) -> bool {
        self.completed.wait(Some(timeout))
    }
}

impl<C: Consume> Task for SinkTask<C> {
    fn name(&self) -> &str {
        &self.runtime.name
    }

    fn kind(&self) -> TaskKind {
        TaskKind::Sink
    }

    fn source(&self) -> Option<&Queue> {
        Some(&self.source)
    }

    fn source_mut(&mut self) -> Option<&mut Queue> {
        Some(&mut self.source)
    }

    fn completed(&self) -> Option<&Flag> {
        Some(&self.completed)
    }

    fn start(&mut self) -> Result<()> {
        if !self.source.is_assigned() {
            return Err(DataMuxError::Pipeline(format!("sink '{}' has no source", self.name())));
        }
        let mut consumer = self
            .consumer
            .take()
            .ok_or_else(|| DataMuxError::Pipeline(format!("task '{}' was already started", self.name())))?;
        let source = self.source.clone();
        let completed = self.completed.clone();
        let name = self.name().to_string();
        self.runtime.spawn(move |flag| {
            while !flag.is_set() {
                let msg = match source.get() {
                    Some(msg) => msg,
                    None => continue,
                };
                let eof = msg.is_eof();
                if let Err(e) = consumer.consume(msg) {
                    tracing::error!("Sink '{}' failed: {}", name, e);
                    break;
                }
                if eof {
                    completed.set();
                    break;
                }
            }
        })
    }

    fn stop(&mut self) -> Result<()> {
        self.runtime.stop()
    }
}

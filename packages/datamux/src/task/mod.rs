// Task runtime
//
// Tasks are the nodes of a pipeline. Each running task owns one OS thread
// and one cancellation flag; tasks only share the queues that connect them.
//
//   SourceTask --target--> PipeTask --target--> SinkTask
//                 (source)             (source)
//
// A downstream task's source starts out as an empty placeholder and is
// pointed at the upstream target's channel when the pipeline is built.

mod consumers;
mod pipeline;
mod tasks;

use std::thread::JoinHandle;

use crate::error::{DataMuxError, Result};
use crate::queue::{Flag, Queue};
use crate::signals;

pub use consumers::{Broadcast, CollectSink, Fanout, LogSink};
pub use pipeline::Pipeline;
pub use tasks::{filter_pipe, map_pipe, Consume, PipeTask, Process, Produce, SinkTask, SourceTask};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Source,
    Pipe,
    Sink,
    Pipeline,
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TaskKind::Source => "source",
            TaskKind::Pipe => "pipe",
            TaskKind::Sink => "sink",
            TaskKind::Pipeline => "pipeline",
        };
        f.write_str(name)
    }
}

pub trait Task: Send {
    fn name(&self) -> &str;

    fn kind(&self) -> TaskKind;

    /// Input queue, if the task consumes one
    fn source(&self) -> Option<&Queue> {
        None
    }

    fn source_mut(&mut self) -> Option<&mut Queue> {
        None
    }

    /// Output queue, if the task produces one
    fn target(&self) -> Option<&Queue> {
        None
    }

    /// Set once the task has seen the end of its stream
    fn completed(&self) -> Option<&Flag> {
        None
    }

    fn start(&mut self) -> Result<()>;

    /// Request the task to stop and wait for its thread. Idempotent.
    fn stop(&mut self) -> Result<()>;
}

/// Thread and flag of one running task
pub(crate) struct Runtime {
    name: String,
    flag: Flag,
    handle: Option<JoinHandle<()>>,
    started: bool,
}

impl Runtime {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            flag: Flag::new(),
            handle: None,
            started: false,
        }
    }

    /// Run `body` on a dedicated thread with the flag registered for signals.
    pub(crate) fn spawn<F>(&mut self, body: F) -> Result<()>
    where
        F: FnOnce(Flag) + Send + 'static,
    {
        if self.started {
            return Err(DataMuxError::Pipeline(format!("task '{}' was already started", self.name)));
        }
        self.started = true;
        let flag = self.flag.clone();
        let name = self.name.clone();
        let handle = std::thread::Builder::new()
            .name(format!("task-{}", self.name))
            .spawn(move || {
                signals::register(&flag);
                tracing::info!("Task '{}' started", name);
                body(flag);
                tracing::info!("Task '{}' finished", name);
            })
            .map_err(DataMuxError::Io)?;
        self.handle = Some(handle);
        Ok(())
    }

    pub(crate) fn stop(&mut self) -> Result<()> {
        self.flag.set();
        if let Some(handle) = self.handle.take() {
            handle
                .join()
                .map_err(|_| DataMuxError::Pipeline(format!("task '{}' panicked", self.name)))?;
        }
        Ok(())
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        if self.handle.is_some() {
            if let Err(e) = self.stop() {
                tracing::warn!("{}", e);
            }
        }
    }
}

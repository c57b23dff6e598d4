use std::time::Duration;

use super::{Task, TaskKind};
use crate::error::{DataMuxError, Result};
use crate::queue::{Flag, Queue};

/// Chain of tasks connected by shared queues
///
/// Built with [`Pipeline::new`], the first task must produce without input
/// (a source, or a pipeline that starts with one). [`Pipeline::segment`]
/// builds a pipe-led chain that can itself be nested after a producer.
pub struct Pipeline {
    name: String,
    tasks: Vec<Box<dyn Task>>,
    started: bool,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stages: Vec<String> = self
            .tasks
            .iter()
            .map(|t| format!("{}:{}", t.kind(), t.name()))
            .collect();
        f.debug_struct("Pipeline")
            .field("name", &self.name)
            .field("tasks", &stages)
            .finish()
    }
}

impl Pipeline {
    pub fn new(name: &str, tasks: Vec<Box<dyn Task>>) -> Result<Self> {
        let first = tasks
            .first()
            .ok_or_else(|| DataMuxError::Pipeline("a pipeline needs at least one task".to_string()))?;
        let leads = match first.kind() {
            TaskKind::Source => true,
            TaskKind::Pipeline => first.source().is_none(),
            _ => false,
        };
        if !leads {
            return Err(DataMuxError::Pipeline(format!(
                "'{}' cannot start a pipeline: the first task must be a source",
                first.name()
            )));
        }
        Self::build(name, tasks)
    }

    /// Chain whose first task consumes an input, for nesting.
    pub fn segment(name: &str, tasks: Vec<Box<dyn Task>>) -> Result<Self> {
        match tasks.first() {
            None => Err(DataMuxError::Pipeline("a pipeline needs at least one task".to_string())),
            Some(first) if first.source().is_none() => Err(DataMuxError::Pipeline(format!(
                "'{}' cannot start a segment: it has no input",
                first.name()
            ))),
            Some(_) => Self::build(name, tasks),
        }
    }

    fn build(name: &str, mut tasks: Vec<Box<dyn Task>>) -> Result<Self> {
        let last = tasks.len() - 1;
        for (i, task) in tasks.iter().enumerate() {
            if i > 0 && i < last && !matches!(task.kind(), TaskKind::Pipe | TaskKind::Pipeline) {
                return Err(DataMuxError::Pipeline(format!(
                    "'{}' is a {}; only pipes may sit inside a pipeline",
                    task.name(),
                    task.kind()
                )));
            }
        }

        for i in 1..tasks.len() {
            let (upstream, downstream) = tasks.split_at_mut(i);
            let up = &upstream[i - 1];
            let down = &mut downstream[0];
            let target = up.target().cloned().ok_or_else(|| {
                DataMuxError::Pipeline(format!("'{}' has no output to feed '{}'", up.name(), down.name()))
            })?;
            let down_name = down.name().to_string();
            let source = down
                .source_mut()
                .ok_or_else(|| DataMuxError::Pipeline(format!("'{}' takes no input", down_name)))?;
            source.assign(&target);
        }

        Ok(Self {
            name: name.to_string(),
            tasks,
            started: false,
        })
    }

    pub fn tasks(&self) -> &[Box<dyn Task>] {
        &self.tasks
    }

    /// Start, wait up to `timeout` for completion, then stop every task.
    ///
    /// Returns whether the pipeline completed in time.
    pub fn run(&mut self, timeout: Duration) -> Result<bool> {
        self.start()?;
        let done = match self.completed() {
            Some(flag) => flag.wait(Some(timeout)),
            None => {
                // nothing signals completion without a sink; run for the whole timeout
                std::thread::sleep(timeout);
                false
            }
        };
        if !done {
            tracing::warn!("Pipeline '{}' did not complete within {:?}", self.name, timeout);
        }
        self.stop()?;
        Ok(done)
    }
}

impl Task for Pipeline {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> TaskKind {
        TaskKind::Pipeline
    }

    fn source(&self) -> Option<&Queue> {
        self.tasks.first().and_then(|t| t.source())
    }

    fn source_mut(&mut self) -> Option<&mut Queue> {
        self.tasks.first_mut().and_then(|t| t.source_mut())
    }

    fn target(&self) -> Option<&Queue> {
        self.tasks.last().and_then(|t| t.target())
    }

    fn completed(&self) -> Option<&Flag> {
        self.tasks.last().and_then(|t| t.completed())
    }

    fn start(&mut self) -> Result<()> {
        if self.started {
            return Err(DataMuxError::Pipeline(format!("pipeline '{}' was already started", self.name)));
        }
        self.started = true;
        // consumers first, so no producer runs ahead of an idle reader
        for task in self.tasks.iter_mut().rev() {
            task.start()?;
        }
        tracing::info!("Pipeline '{}' started with {} tasks", self.name, self.tasks.len());
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        let mut first_error = None;
        for task in self.tasks.iter_mut() {
            if let Err(e) = task.stop() {
                tracing::warn!("Stopping '{}' failed: {}", task.name(), e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

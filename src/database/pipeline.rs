//! Staged pipeline runner shared by the backup and restore workflows
//!
//! A [`Pipeline`] runs its stages strictly in order and stops at the first
//! error. Whatever happens, the cleanup callbacks registered on the context
//! run before `run` returns.

use async_trait::async_trait;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use crate::database::{DatabaseError, Result};

/// Deferred cleanup callbacks, executed in reverse registration order
#[derive(Default)]
pub struct Cleanup {
    hooks: Vec<(String, Box<dyn FnOnce() + Send + Sync>)>,
}

impl Cleanup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback to run during cleanup
    pub fn defer<F>(&mut self, label: impl Into<String>, hook: F)
    where
        F: FnOnce() + Send + Sync + 'static,
    {
        self.hooks.push((label.into(), Box::new(hook)));
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Run and drain every registered callback
    pub fn run(&mut self) {
        while let Some((label, hook)) = self.hooks.pop() {
            debug!(cleanup = %label, "running cleanup");
            hook();
        }
    }
}

impl Drop for Cleanup {
    fn drop(&mut self) {
        if !self.hooks.is_empty() {
            warn!(pending = self.hooks.len(), "cleanup dropped with pending callbacks, running them now");
            self.run();
        }
    }
}

/// State threaded through a pipeline
pub trait PipelineContext: Send {
    fn cleanup(&mut self) -> &mut Cleanup;
}

/// One step of a workflow
#[async_trait]
pub trait Stage<C: PipelineContext>: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(&self, ctx: &mut C) -> Result<()>;
}

/// Ordered list of stages with fail-fast semantics
pub struct Pipeline<C: PipelineContext> {
    name: &'static str,
    stages: Vec<Box<dyn Stage<C>>>,
}

impl<C: PipelineContext> Pipeline<C> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            stages: Vec::new(),
        }
    }

    pub fn stage<S: Stage<C> + 'static>(mut self, stage: S) -> Self {
        self.stages.push(Box::new(stage));
        self
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Run every stage in order; the first failure is returned wrapped with its stage name
    pub async fn run(&self, ctx: &mut C) -> Result<()> {
        let started = Instant::now();
        let mut outcome = Ok(());

        for stage in &self.stages {
            let stage_started = Instant::now();
            debug!(pipeline = self.name, stage = stage.name(), "stage starting");
            if let Err(source) = stage.run(ctx).await {
                error!(
                    pipeline = self.name,
                    stage = stage.name(),
                    error = %source,
                    "stage failed"
                );
                outcome = Err(DatabaseError::Stage {
                    stage: stage.name(),
                    source: Box::new(source),
                });
                break;
            }
            debug!(
                pipeline = self.name,
                stage = stage.name(),
                elapsed_ms = stage_started.elapsed().as_millis() as u64,
                "stage finished"
            );
        }

        ctx.cleanup().run();

        if outcome.is_ok() {
            info!(
                pipeline = self.name,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "pipeline completed"
            );
        }
        outcome
    }
}

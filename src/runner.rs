//! Drives one graph execution per task variant under a fixed concurrency ceiling.

use std::{fmt, path::PathBuf, sync::Arc, time::Duration};

use futures_util::{stream::FuturesUnordered, StreamExt};
use tokio::sync::Semaphore;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{
    checkpoint::{CheckpointBackend, CheckpointStore},
    config::{Config, ConfigError},
    error::RunError,
    graph::{build_for_task, CompiledGraph, RouterRegistry, RunOptions, RunReport},
    models::ModelRegistry,
    tasks::TaskVariant,
    transcript::{transcript_path, TranscriptRecord},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunStatus {
    Completed,
    DepthLimit,
    TimedOut,
    Failed(String),
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Completed => write!(f, "completed"),
            RunStatus::DepthLimit => write!(f, "depth limit"),
            RunStatus::TimedOut => write!(f, "timed out"),
            RunStatus::Failed(message) => write!(f, "failed: {message}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub index: usize,
    pub thread_id: String,
    pub status: RunStatus,
    pub transcript: Option<PathBuf>,
}

#[derive(Debug, Clone, Default)]
pub struct BatchSummary {
    /// One outcome per task variant, ordered by variant index.
    pub outcomes: Vec<RunOutcome>,
}

impl BatchSummary {
    pub fn completed(&self) -> usize {
        self.count(|s| matches!(s, RunStatus::Completed))
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.completed()
    }

    fn count(&self, predicate: impl Fn(&RunStatus) -> bool) -> usize {
        self.outcomes.iter().filter(|o| predicate(&o.status)).count()
    }
}

/// A variant with its graph already compiled.
#[derive(Debug, Clone)]
pub struct PreparedRun {
    pub thread_id: String,
    pub variant: TaskVariant,
    pub graph: CompiledGraph,
}

pub struct BatchRunner<'a> {
    config: &'a Config,
    models: ModelRegistry,
    routers: RouterRegistry,
    checkpoints: Option<CheckpointBackend>,
    transcript_dir: Option<PathBuf>,
}

impl<'a> BatchRunner<'a> {
    /// Routers come from the configuration; checkpoints and transcripts go under `memory.path`.
    pub fn new(config: &'a Config, models: ModelRegistry) -> Self {
        let memory = &config.globals.memory;
        Self {
            config,
            models,
            routers: RouterRegistry::from_specs(&config.routers),
            checkpoints: Some(CheckpointBackend::Directory(memory.checkpoint_dir())),
            transcript_dir: Some(memory.path.clone()),
        }
    }

    /// Adds statically registered routers on top of the configured ones.
    pub fn with_routers(mut self, routers: &RouterRegistry) -> Self {
        self.routers.merge(routers);
        self
    }

    pub fn with_checkpoints(mut self, backend: Option<CheckpointBackend>) -> Self {
        self.checkpoints = backend;
        self
    }

    pub fn with_transcript_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.transcript_dir = dir;
        self
    }

    /// Expands the tasks and compiles every graph. Any configuration error aborts the batch.
    pub fn prepare(&self) -> Result<Vec<PreparedRun>, ConfigError> {
        self.config
            .tasks
            .expand()?
            .into_iter()
            .map(|variant| {
                let graph =
                    build_for_task(self.config, &variant.variables, &self.models, &self.routers)?;
                let thread_id = thread_id_for(&graph, variant.index);
                Ok(PreparedRun {
                    thread_id,
                    variant,
                    graph,
                })
            })
            .collect()
    }

    pub async fn run(&self) -> Result<BatchSummary, ConfigError> {
        let prepared = self.prepare()?;
        Ok(self.run_prepared(prepared).await)
    }

    pub async fn run_prepared(&self, prepared: Vec<PreparedRun>) -> BatchSummary {
        let ceiling = self.config.globals.concurrency.max(1);
        let gate = Arc::new(Semaphore::new(ceiling));
        info!(runs = prepared.len(), concurrency = ceiling, "starting batch");

        let mut futures = FuturesUnordered::new();
        for run in prepared {
            let gate = Arc::clone(&gate);
            futures.push(async move {
                let _permit = gate.acquire_owned().await.ok();
                self.execute(run).await
            });
        }

        let mut outcomes = Vec::new();
        while let Some(outcome) = futures.next().await {
            outcomes.push(outcome);
        }
        outcomes.sort_by_key(|o| o.index);

        let summary = BatchSummary { outcomes };
        info!(
            total = summary.outcomes.len(),
            completed = summary.completed(),
            failed = summary.failed(),
            "batch finished"
        );
        summary
    }

    async fn execute(&self, run: PreparedRun) -> RunOutcome {
        let PreparedRun {
            thread_id,
            variant,
            graph,
        } = run;
        let index = variant.index;

        let store = match self.open_store(&graph, &thread_id).await {
            Ok(store) => store,
            Err(error) => return self.failure(index, thread_id, error),
        };

        let mut options = RunOptions::new(thread_id.clone(), self.config.globals.recursion_limit)
            .with_variables(variant.variables.clone());
        if let Some(store) = &store {
            options = options.with_store(Arc::clone(store));
        }

        let result = match self.config.globals.run_timeout_secs {
            Some(secs) => {
                let budget = Duration::from_secs(secs);
                tokio::time::timeout(budget, graph.run(&variant.start_prompt, options))
                    .await
                    .unwrap_or(Err(RunError::TimedOut(budget)))
            }
            None => graph.run(&variant.start_prompt, options).await,
        };

        if let Some(store) = &store {
            if let Err(error) = store.close().await {
                warn!(thread_id = %thread_id, error = %error, "failed to close checkpoint store");
            }
        }

        match result {
            Ok(report) => self.complete(index, &variant, report).await,
            Err(error) => self.failure(index, thread_id, error),
        }
    }

    async fn open_store(
        &self,
        graph: &CompiledGraph,
        thread_id: &str,
    ) -> Result<Option<Arc<dyn CheckpointStore>>, RunError> {
        match &self.checkpoints {
            Some(backend) if graph.checkpointed() => Ok(Some(backend.open(thread_id).await?)),
            _ => Ok(None),
        }
    }

    async fn complete(&self, index: usize, variant: &TaskVariant, report: RunReport) -> RunOutcome {
        let mut outcome = RunOutcome {
            index,
            thread_id: report.thread_id.clone(),
            status: RunStatus::Completed,
            transcript: None,
        };

        if let Some(dir) = &self.transcript_dir {
            let path = transcript_path(dir, &report.thread_id);
            let record = TranscriptRecord::from_state(&variant.variables, &report.state);
            match record.write(&path).await {
                Ok(()) => outcome.transcript = Some(path),
                Err(error) => {
                    error!(thread_id = %report.thread_id, error = %error, "failed to write transcript");
                    outcome.status = RunStatus::Failed(error.to_string());
                    return outcome;
                }
            }
        }

        info!(
            index,
            thread_id = %report.thread_id,
            steps = report.steps,
            reached_end = report.reached_end,
            "run completed"
        );
        outcome
    }

    fn failure(&self, index: usize, thread_id: String, error: RunError) -> RunOutcome {
        let status = match &error {
            RunError::DepthLimit { .. } => RunStatus::DepthLimit,
            RunError::TimedOut(_) => RunStatus::TimedOut,
            other => RunStatus::Failed(other.to_string()),
        };
        error!(index, thread_id = %thread_id, error = %error, "run did not complete");
        RunOutcome {
            index,
            thread_id,
            status,
            transcript: None,
        }
    }
}

/// `<memory id>-<index>` when an agent names its thread, otherwise a fresh uuid.
fn thread_id_for(graph: &CompiledGraph, index: usize) -> String {
    graph
        .node_ids()
        .iter()
        .filter_map(|id| graph.node(id))
        .filter(|node| node.memory_enabled())
        .find_map(|node| node.spec().memory.id.as_deref())
        .map(|id| format!("{id}-{index}"))
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

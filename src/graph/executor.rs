use std::{collections::VecDeque, sync::Arc};

use chrono::Utc;
use tracing::{debug, info, warn};

use super::{ordered, CompiledGraph, Target, Transition};
use crate::{
    checkpoint::{CheckpointStore, Snapshot},
    error::RunError,
    prompt::{Prompt, Variables},
    state::{ConversationState, StateMessage},
};

/// Per-execution inputs.
#[derive(Clone)]
pub struct RunOptions {
    pub thread_id: String,
    pub variables: Variables,
    pub recursion_limit: usize,
    pub store: Option<Arc<dyn CheckpointStore>>,
}

impl RunOptions {
    pub fn new(thread_id: impl Into<String>, recursion_limit: usize) -> Self {
        Self {
            thread_id: thread_id.into(),
            variables: Variables::new(),
            recursion_limit,
            store: None,
        }
    }

    pub fn with_variables(mut self, variables: Variables) -> Self {
        self.variables = variables;
        self
    }

    pub fn with_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.store = Some(store);
        self
    }
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub thread_id: String,
    pub state: ConversationState,
    pub steps: usize,
    pub reached_end: bool,
    /// True when the run continued from an earlier checkpoint.
    pub resumed: bool,
}

/// Position of an execution between node turns.
struct Cursor {
    state: ConversationState,
    step: usize,
    current: VecDeque<String>,
    next: Vec<String>,
    reached_end: bool,
}

impl Cursor {
    fn push_next(&mut self, target: Target) {
        match target {
            Target::End => self.reached_end = true,
            Target::Agent(id) => {
                if !self.next.contains(&id) {
                    self.next.push(id);
                }
            }
        }
    }

    fn snapshot(&self, options: &RunOptions, node: Option<&str>, finished: bool) -> Snapshot {
        Snapshot {
            thread_id: options.thread_id.clone(),
            step: self.step,
            node: node.map(str::to_string),
            task: options.variables.clone(),
            messages: self.state.messages().to_vec(),
            pending: self.current.iter().cloned().collect(),
            next: self.next.clone(),
            reached_end: self.reached_end,
            finished,
            created_at: Utc::now(),
        }
    }
}

impl CompiledGraph {
    /// Walks the graph step by step from `start` until the frontier empties.
    /// An unfinished checkpoint for the same thread is resumed instead.
    pub async fn run(&self, start: &Prompt, options: RunOptions) -> Result<RunReport, RunError> {
        let mut resumed = false;
        let latest = match &options.store {
            Some(store) => store.load_latest().await?,
            None => None,
        };

        let mut cursor = match latest {
            Some(snapshot) if snapshot.finished => {
                info!(thread_id = %options.thread_id, "thread already finished, skipping");
                return Ok(RunReport {
                    thread_id: options.thread_id,
                    state: ConversationState::with_messages(snapshot.messages),
                    steps: snapshot.step,
                    reached_end: snapshot.reached_end,
                    resumed: true,
                });
            }
            Some(snapshot) => {
                info!(thread_id = %options.thread_id, step = snapshot.step, "resuming from checkpoint");
                resumed = true;
                Cursor {
                    state: ConversationState::with_messages(snapshot.messages),
                    step: snapshot.step,
                    current: snapshot.pending.into(),
                    next: snapshot.next,
                    reached_end: snapshot.reached_end,
                }
            }
            None => {
                let mut cursor = Cursor {
                    state: ConversationState::new(),
                    step: 0,
                    current: VecDeque::new(),
                    next: Vec::new(),
                    reached_end: false,
                };
                cursor.state.push(StateMessage::from_prompt(start));
                for transition in ordered(&self.entry) {
                    let target = self.follow(transition, &cursor.state)?;
                    cursor.push_next(target);
                }
                cursor
            }
        };

        info!(thread_id = %options.thread_id, nodes = self.order.len(), "run started");

        loop {
            while let Some(id) = cursor.current.pop_front() {
                self.execute(&id, &mut cursor, &options).await?;
            }

            if cursor.next.is_empty() {
                break;
            }
            if cursor.step >= options.recursion_limit {
                return Err(RunError::DepthLimit {
                    limit: options.recursion_limit,
                });
            }
            cursor.step += 1;
            cursor.current = std::mem::take(&mut cursor.next).into();
            debug!(thread_id = %options.thread_id, step = cursor.step, frontier = ?cursor.current, "step");
        }

        if let Some(store) = &options.store {
            store.append(&cursor.snapshot(&options, None, true)).await?;
        }
        info!(
            thread_id = %options.thread_id,
            steps = cursor.step,
            messages = cursor.state.len(),
            reached_end = cursor.reached_end,
            "run finished"
        );

        Ok(RunReport {
            thread_id: options.thread_id,
            state: cursor.state,
            steps: cursor.step,
            reached_end: cursor.reached_end,
            resumed,
        })
    }

    async fn execute(
        &self,
        id: &str,
        cursor: &mut Cursor,
        options: &RunOptions,
    ) -> Result<(), RunError> {
        let Some(node) = self.nodes.get(id) else {
            warn!(thread_id = %options.thread_id, node = %id, "checkpoint names an unknown node, skipping");
            return Ok(());
        };

        let message = node.turn(&cursor.state).await.map_err(|source| RunError::Model {
            node: id.to_string(),
            source,
        })?;
        cursor.state.push(message);

        let transitions = self.transitions.get(id).map(Vec::as_slice).unwrap_or(&[]);
        for transition in ordered(transitions) {
            let target = self.follow(transition, &cursor.state)?;
            debug!(thread_id = %options.thread_id, from = %id, to = ?target, "transition");
            cursor.push_next(target);
        }

        if node.memory_enabled() {
            if let Some(store) = &options.store {
                store.append(&cursor.snapshot(options, Some(id), false)).await?;
            }
        }
        Ok(())
    }

    fn follow(&self, transition: &Transition, state: &ConversationState) -> Result<Target, RunError> {
        match transition {
            Transition::Direct(target) => Ok(target.clone()),
            Transition::Routed { router, route } => {
                let label = route.classify(state);
                route
                    .routes()
                    .get(&label)
                    .map(|target| Target::parse(target))
                    .ok_or_else(|| RunError::UnmappedLabel {
                        router: router.clone(),
                        label,
                    })
            }
        }
    }
}

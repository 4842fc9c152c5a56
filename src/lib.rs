pub mod error;
pub mod providers;
pub mod types;
pub mod functions;
pub mod retry;
pub mod prompt;
pub mod tasks;
pub mod config;
pub mod models;
pub mod state;
pub mod agent;
pub mod checkpoint;
pub mod graph;
pub mod transcript;
pub mod runner;
pub mod eval;

pub use error::{LLMError, RunError};
pub use providers::LLMProvider;
pub use types::{ChatMessage, CompletionRequest, CompletionResponse, MessageRole, TokenUsage};
pub use functions::{
    FunctionCall, FunctionDefinition, FunctionParameters, Tool, ToolCall, ToolCallType,
    ToolChoice,
};
pub use retry::RetryPolicy;
pub use prompt::{render_template, Prompt, Variables};
pub use tasks::{expand_variables, TaskBlock, TaskVariant};
pub use config::{Config, ConfigError};
pub use models::{ModelHandle, ModelRegistry};
pub use state::{ConversationState, StateMessage};
pub use agent::{remap_history, AgentNode, AgentSpec, Perspective};
pub use checkpoint::{
    CheckpointBackend, CheckpointError, CheckpointStore, FileCheckpointStore,
    MemoryCheckpointStore, MemoryCheckpoints, Snapshot,
};
pub use graph::{
    build_for_task, parse_direction, CompiledGraph, GraphBuilder, RouterRegistry, RouterSpec,
    RunOptions, RunReport, Target,
};
pub use transcript::{export_transcripts, TranscriptMessage, TranscriptRecord};
pub use runner::{BatchRunner, BatchSummary, RunOutcome, RunStatus};
pub use eval::{
    evaluate_directory, EvalConfig, EvaluationReport, ExtractionError, ExtractionStrategy,
    Extractor, ScoreMatrix,
};

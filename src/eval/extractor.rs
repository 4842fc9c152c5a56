//! Grades transcripts with a model and turns the answer into a validated score record.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use futures_util::{stream::FuturesUnordered, StreamExt};
use jsonschema::{Draft, JSONSchema};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::{fs, sync::Semaphore};
use tracing::{debug, error, info};

use super::{
    report::ScoreMatrix,
    schema::{EvalConfig, ExtractionStrategy, SAVE_RESULT_TOOL},
};
use crate::{
    functions::Tool,
    models::ModelHandle,
    prompt::{render_with, value_to_text},
    transcript::{TranscriptError, TranscriptRecord},
    types::{ChatMessage, MessageRole},
    LLMError,
};

pub const START_MARKER: &str = "<START OUTPUT>";
pub const END_MARKER: &str = "<END OUTPUT>";

static RE_MARKED_OUTPUT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<START OUTPUT>(.*?)<END OUTPUT>").unwrap());

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("grading model call failed: {0}")]
    Model(#[from] LLMError),
    #[error("grading model did not call save_result_to_database")]
    MissingToolCall,
    #[error("grading reply has no <START OUTPUT> ... <END OUTPUT> block")]
    MissingMarkers,
    #[error("grading output is not valid JSON: {0}")]
    MalformedJson(#[from] serde_json::Error),
    #[error("grading output must be a JSON object")]
    NotAnObject,
    #[error("grading output violates the score schema: {}", .0.join("; "))]
    Schema(Vec<String>),
    #[error(transparent)]
    Transcript(#[from] TranscriptError),
    #[error("evaluation I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ExtractionError {
    /// Whether asking the grading model again may help.
    pub fn is_retryable(&self) -> bool {
        match self {
            ExtractionError::Model(error) => error.is_retryable(),
            ExtractionError::MissingToolCall
            | ExtractionError::MissingMarkers
            | ExtractionError::MalformedJson(_)
            | ExtractionError::NotAnObject
            | ExtractionError::Schema(_) => true,
            ExtractionError::Transcript(_) | ExtractionError::Io { .. } => false,
        }
    }
}

/// Decodes the last marker-delimited block of `text`.
pub fn parse_marked_output(text: &str) -> Result<Value, ExtractionError> {
    let block = RE_MARKED_OUTPUT
        .captures_iter(text)
        .last()
        .and_then(|caps| caps.get(1))
        .ok_or(ExtractionError::MissingMarkers)?;
    Ok(serde_json::from_str(block.as_str().trim())?)
}

/// The dialogue as `role: content` lines.
pub fn render_dialogue(record: &TranscriptRecord) -> String {
    record
        .messages
        .iter()
        .map(|m| format!("{}: {}", m.role, m.content))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Fills `{task.KEY}`, `{KEY}`, `{messages}` and `{last_message}` from a transcript.
pub fn render_grading_prompt(template: &str, record: &TranscriptRecord) -> String {
    render_with(template, |key| match key {
        "messages" => Some(render_dialogue(record)),
        "last_message" => record.last_message().map(|m| m.content.clone()),
        other => {
            let key = other.strip_prefix("task.").unwrap_or(other);
            record.task.get(key).map(value_to_text)
        }
    })
}

pub struct Extractor {
    config: EvalConfig,
    model: ModelHandle,
    tool: Tool,
    validator: JSONSchema,
}

impl Extractor {
    pub fn new(config: EvalConfig, model: ModelHandle) -> Result<Self, ExtractionError> {
        let schema = config.schema();
        let validator = JSONSchema::options()
            .with_draft(Draft::Draft7)
            .compile(&schema)
            .map_err(|e| ExtractionError::Schema(vec![e.to_string()]))?;
        let tool = config.save_tool();
        Ok(Self {
            config,
            model,
            tool,
            validator,
        })
    }

    pub fn strategy(&self) -> ExtractionStrategy {
        self.config.strategy
    }

    /// Rendered grading prompt with the strategy's instruction added to the first system turn.
    pub fn grading_messages(&self, record: &TranscriptRecord) -> Vec<ChatMessage> {
        let instruction = self.instruction();
        let mut messages: Vec<ChatMessage> = self
            .config
            .prompt
            .iter()
            .map(|p| ChatMessage::new(p.role, render_grading_prompt(&p.content, record)))
            .collect();

        match messages.iter_mut().find(|m| m.role == MessageRole::System) {
            Some(system) => {
                let text = format!("{}\n\n{instruction}", system.text().unwrap_or_default());
                system.content = Some(text);
            }
            None => messages.insert(0, ChatMessage::system(instruction)),
        }
        messages
    }

    fn instruction(&self) -> String {
        match self.config.strategy {
            ExtractionStrategy::Tool => {
                format!("Call {SAVE_RESULT_TOOL} to store the evaluation result.")
            }
            ExtractionStrategy::Prompt => {
                let schema = serde_json::to_string_pretty(&self.config.schema())
                    .unwrap_or_else(|_| "{}".to_string());
                format!(
                    "Answer with a single JSON object matching this schema:\n{schema}\n\
                     Wrap the JSON between {START_MARKER} and {END_MARKER}, \
                     for example {START_MARKER}{{...}}{END_MARKER}."
                )
            }
        }
    }

    /// Grades one transcript, retrying model and parsing failures with backoff.
    pub async fn extract(&self, record: &TranscriptRecord) -> Result<Map<String, Value>, ExtractionError> {
        let messages = self.grading_messages(record);
        let label = format!("eval:{}", self.model.name());
        self.model
            .retry_policy()
            .run(&label, ExtractionError::is_retryable, |attempt| {
                let messages = messages.clone();
                async move {
                    debug!(attempt, strategy = ?self.config.strategy, "grading transcript");
                    self.attempt(messages).await
                }
            })
            .await
    }

    async fn attempt(&self, messages: Vec<ChatMessage>) -> Result<Map<String, Value>, ExtractionError> {
        let value = match self.config.strategy {
            ExtractionStrategy::Tool => {
                let call = self
                    .model
                    .invoke_with_tool(messages, &self.tool)
                    .await?
                    .ok_or(ExtractionError::MissingToolCall)?;
                match (&call.function.arguments, &call.function.raw_arguments) {
                    (Value::Null, Some(raw)) => serde_json::from_str(raw)?,
                    (arguments, _) => arguments.clone(),
                }
            }
            ExtractionStrategy::Prompt => {
                let reply = self.model.invoke_once(messages).await?;
                parse_marked_output(reply.text().unwrap_or_default())?
            }
        };
        self.validate(value)
    }

    fn validate(&self, value: Value) -> Result<Map<String, Value>, ExtractionError> {
        if let Err(errors) = self.validator.validate(&value) {
            return Err(ExtractionError::Schema(
                errors.map(|e| e.to_string()).collect(),
            ));
        }
        match value {
            Value::Object(map) => Ok(map),
            _ => Err(ExtractionError::NotAnObject),
        }
    }
}

/// Result of grading a whole directory.
#[derive(Debug, Clone)]
pub struct EvaluationReport {
    pub matrix: ScoreMatrix,
    /// Stems of transcripts whose grading failed.
    pub failures: Vec<String>,
    pub csv_path: PathBuf,
}

async fn list_transcripts(dir: &Path) -> Result<Vec<PathBuf>, ExtractionError> {
    let io_error = |source| ExtractionError::Io {
        path: dir.to_path_buf(),
        source,
    };
    let mut files = Vec::new();
    let mut entries = fs::read_dir(dir).await.map_err(io_error)?;
    while let Some(entry) = entries.next_entry().await.map_err(io_error)? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        if entry.file_type().await.map_err(io_error)?.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

fn stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

async fn grade_file(extractor: &Extractor, path: &Path, eval_dir: &Path) -> Result<Map<String, Value>, ExtractionError> {
    let record = TranscriptRecord::read(path).await?;
    let scores = extractor.extract(&record).await?;
    let out = eval_dir.join(format!("{}.json", stem(path)));
    let json = serde_json::to_string_pretty(&scores)?;
    fs::write(&out, json)
        .await
        .map_err(|source| ExtractionError::Io { path: out, source })?;
    Ok(scores)
}

/// Grades every `*.json` transcript in `dir` and writes `eval/<stem>.json` plus
/// `eval/result.csv`. A failed transcript is logged and gets an empty row.
pub async fn evaluate_directory(
    extractor: &Extractor,
    dir: impl AsRef<Path>,
    concurrency: usize,
) -> Result<EvaluationReport, ExtractionError> {
    let dir = dir.as_ref();
    let eval_dir = dir.join("eval");
    fs::create_dir_all(&eval_dir)
        .await
        .map_err(|source| ExtractionError::Io {
            path: eval_dir.clone(),
            source,
        })?;

    let files = list_transcripts(dir).await?;
    info!(dir = %dir.display(), transcripts = files.len(), "evaluating transcripts");

    let gate = Arc::new(Semaphore::new(concurrency.max(1)));
    let mut futures = FuturesUnordered::new();
    for (index, path) in files.iter().enumerate() {
        let gate = Arc::clone(&gate);
        let eval_dir = eval_dir.as_path();
        futures.push(async move {
            let _permit = gate.acquire_owned().await.ok();
            (index, grade_file(extractor, path, eval_dir).await)
        });
    }

    let mut results: Vec<Option<Map<String, Value>>> = vec![None; files.len()];
    let mut failures = Vec::new();
    while let Some((index, result)) = futures.next().await {
        match result {
            Ok(scores) => results[index] = Some(scores),
            Err(err) => {
                error!(transcript = %files[index].display(), error = %err, "evaluation failed");
                failures.push(stem(&files[index]));
            }
        }
    }
    failures.sort();

    let matrix = ScoreMatrix::from_records(
        files
            .iter()
            .map(|path| stem(path))
            .zip(results),
    );
    let csv_path = eval_dir.join("result.csv");
    matrix
        .write_csv(&csv_path)
        .await
        .map_err(|source| ExtractionError::Io {
            path: csv_path.clone(),
            source,
        })?;

    info!(
        graded = files.len() - failures.len(),
        failed = failures.len(),
        csv = %csv_path.display(),
        "evaluation finished"
    );
    Ok(EvaluationReport {
        matrix,
        failures,
        csv_path,
    })
}

//! Model-based grading of exported transcripts.

pub mod extractor;
pub mod report;
pub mod schema;

pub use extractor::{
    evaluate_directory, parse_marked_output, render_grading_prompt, EvaluationReport,
    ExtractionError, Extractor,
};
pub use report::{flatten_record, ScoreMatrix, ScoreRow};
pub use schema::{EvalConfig, ExtractionStrategy, FieldType, FormatField, SAVE_RESULT_TOOL};

use std::sync::Arc;

use colloquy::{
    eval::{evaluate_directory, Extractor, SAVE_RESULT_TOOL},
    export_transcripts,
    providers::scripted::{ScriptedProvider, ScriptedReply},
    BatchRunner, Config, ModelHandle, ModelRegistry, RetryPolicy, RunStatus, TranscriptRecord,
};
use serde_json::json;

const CONFIG: &str = r#"
globals:
  concurrency: 2
  recursion_limit: 6
models:
  tutor:
    model: tutor-model
    type: ollama
  grader:
    model: grader-model
    type: ollama
agents:
  teacher:
    model: tutor
    prompt:
      - role: system
        content: "You tutor a {grade} student. Ask one guiding question."
  student:
    model: tutor
    prompt:
      - role: system
        content: "You are a {grade} student solving {question}."
directions:
  - START -> teacher
  - teacher -> student
  - student -> END
tasks:
  mode: iter
  start_prompt:
    role: user
    content: "Let's work on {question}."
  content:
    - {grade: third, question: "3 x 4"}
    - {grade: fourth, question: "12 / 3"}
    - {grade: fifth, question: "7 + 8"}
evaluation:
  model: grader
  prompt:
    - role: system
      content: "Grade how well the teacher guided a {task.grade} student."
    - role: user
      content: "{messages}"
  format:
    - field: guidance
      type: int
      description: 1-5
    - field: solved
      type: bool
      description: the student reached the answer
"#;

#[tokio::test]
async fn generate_export_and_grade_a_small_batch() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::from_yaml_str(CONFIG).unwrap();
    config.globals.memory.path = dir.path().to_path_buf();

    let tutor = Arc::new(
        ScriptedProvider::new().with_fallback("<think>keep it short</think>What do you notice?"),
    );
    let models = ModelRegistry::with_shared_provider(&config, tutor.clone());
    let summary = BatchRunner::new(&config, models).run().await.unwrap();

    assert_eq!(summary.outcomes.len(), 3);
    assert!(summary.outcomes.iter().all(|o| o.status == RunStatus::Completed));
    assert_eq!(tutor.requests().len(), 6);

    let mut transcripts = Vec::new();
    for outcome in &summary.outcomes {
        let path = outcome.transcript.clone().unwrap();
        let record = TranscriptRecord::read(&path).await.unwrap();
        assert_eq!(record.messages.len(), 2);
        assert_eq!(record.last_message().unwrap().role, "student");
        assert_eq!(record.messages[0].reasoning, "<think>keep it short");
        transcripts.push(record);
    }
    let grades: Vec<_> = transcripts.iter().map(|t| t.task["grade"].clone()).collect();
    assert_eq!(grades, [json!("third"), json!("fourth"), json!("fifth")]);

    let exported = export_transcripts(dir.path()).await.unwrap();
    assert_eq!(exported.len(), 3);

    let grader = Arc::new(ScriptedProvider::new().with_replies([
        ScriptedReply::ToolCall {
            name: SAVE_RESULT_TOOL.to_string(),
            arguments: json!({"guidance": 4, "solved": true}),
        },
        ScriptedReply::ToolCall {
            name: SAVE_RESULT_TOOL.to_string(),
            arguments: json!({"guidance": "excellent"}),
        },
        ScriptedReply::ToolCall {
            name: SAVE_RESULT_TOOL.to_string(),
            arguments: json!({"guidance": 2, "solved": false}),
        },
    ]));
    let handle = ModelHandle::new("grader", grader, "grader-model").with_retry(RetryPolicy::no_retry());
    let extractor = Extractor::new(config.evaluation().unwrap().clone(), handle).unwrap();

    let report = evaluate_directory(&extractor, dir.path(), 1).await.unwrap();
    assert_eq!(report.matrix.rows.len(), 3);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.matrix.metrics, ["guidance", "solved"]);

    let csv = std::fs::read_to_string(&report.csv_path).unwrap();
    let lines: Vec<&str> = csv.lines().collect();
    assert_eq!(lines.len(), 5);
    assert_eq!(lines[0], "task_id,guidance,solved,average");
    assert_eq!(lines[4], "average,3.00,0.50,1.75");
}

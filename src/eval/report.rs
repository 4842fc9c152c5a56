//! Tasks × metrics score table with row and column averages.

use std::path::Path;

use serde_json::{Map, Value};

use crate::prompt::value_to_text;

/// Flattens nested records: `{"x": {"score": 3}}` becomes `x = 3`,
/// other nested objects contribute `parent_child` keys.
pub fn flatten_record(record: &Map<String, Value>) -> Vec<(String, Value)> {
    let mut out = Vec::new();
    flatten_into("", record, &mut out);
    out
}

fn flatten_into(prefix: &str, map: &Map<String, Value>, out: &mut Vec<(String, Value)>) {
    for (key, value) in map {
        let name = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}_{key}")
        };
        match value {
            Value::Object(inner) => match inner.get("score") {
                Some(score) => out.push((name, score.clone())),
                None => flatten_into(&name, inner, out),
            },
            other => out.push((name, other.clone())),
        }
    }
}

/// Numbers count as-is, booleans as 1/0; anything else stays out of averages.
pub fn numeric(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, count) = values.fold((0.0, 0usize), |(sum, count), v| (sum + v, count + 1));
    (count > 0).then(|| sum / count as f64)
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoreRow {
    pub task_id: String,
    /// One cell per metric; `None` where the record had no value.
    pub cells: Vec<Option<Value>>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScoreMatrix {
    pub metrics: Vec<String>,
    pub rows: Vec<ScoreRow>,
}

impl ScoreMatrix {
    /// Metric names come from the first non-empty record. `None` or empty records
    /// still produce a row.
    pub fn from_records<I>(records: I) -> Self
    where
        I: IntoIterator<Item = (String, Option<Map<String, Value>>)>,
    {
        let flattened: Vec<(String, Vec<(String, Value)>)> = records
            .into_iter()
            .map(|(task_id, record)| {
                let values = record.as_ref().map(flatten_record).unwrap_or_default();
                (task_id, values)
            })
            .collect();

        let metrics: Vec<String> = flattened
            .iter()
            .find(|(_, values)| !values.is_empty())
            .map(|(_, values)| values.iter().map(|(name, _)| name.clone()).collect())
            .unwrap_or_default();

        let rows = flattened
            .into_iter()
            .map(|(task_id, values)| ScoreRow {
                task_id,
                cells: metrics
                    .iter()
                    .map(|metric| {
                        values
                            .iter()
                            .find(|(name, _)| name == metric)
                            .map(|(_, value)| value.clone())
                    })
                    .collect(),
            })
            .collect();

        Self { metrics, rows }
    }

    pub fn row_average(&self, row: usize) -> Option<f64> {
        self.rows
            .get(row)
            .and_then(|row| mean(row.cells.iter().flatten().filter_map(numeric)))
    }

    pub fn column_average(&self, metric: &str) -> Option<f64> {
        let column = self.metrics.iter().position(|m| m == metric)?;
        mean(
            self.rows
                .iter()
                .filter_map(|row| row.cells.get(column).and_then(Option::as_ref))
                .filter_map(numeric),
        )
    }

    pub fn to_csv(&self) -> String {
        let mut lines = Vec::with_capacity(self.rows.len() + 2);

        let mut header = vec!["task_id".to_string()];
        header.extend(self.metrics.iter().cloned());
        header.push("average".to_string());
        lines.push(csv_line(&header));

        for (index, row) in self.rows.iter().enumerate() {
            let mut cells = vec![row.task_id.clone()];
            cells.extend(
                row.cells
                    .iter()
                    .map(|cell| cell.as_ref().map(value_to_text).unwrap_or_default()),
            );
            cells.push(format_average(self.row_average(index)));
            lines.push(csv_line(&cells));
        }

        let mut footer = vec!["average".to_string()];
        footer.extend(
            self.metrics
                .iter()
                .map(|metric| format_average(self.column_average(metric))),
        );
        footer.push(format_average(mean(
            (0..self.rows.len()).filter_map(|row| self.row_average(row)),
        )));
        lines.push(csv_line(&footer));

        let mut csv = lines.join("\n");
        csv.push('\n');
        csv
    }

    pub async fn write_csv(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        tokio::fs::write(path, self.to_csv()).await
    }
}

fn format_average(value: Option<f64>) -> String {
    value.map(|v| format!("{v:.2}")).unwrap_or_default()
}

fn csv_line(cells: &[String]) -> String {
    cells
        .iter()
        .map(|cell| csv_escape(cell))
        .collect::<Vec<_>>()
        .join(",")
}

fn csv_escape(cell: &str) -> String {
    if cell.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", cell.replace('"', "\"\""))
    } else {
        cell.to_string()
    }
}

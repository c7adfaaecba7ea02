//! Parquet encoding and decoding for shard inputs and inferred artifacts.
//!
//! Input shards carry `paper_id`, `equation_id` and `content_resolved`, and
//! optionally `LLM_prompt`. Artifacts carry one row per processed input row,
//! whether inference succeeded or not.

use std::fs::File;
use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;

use arrow::array::{Array, ArrayRef, Int64Array, StringArray, UInt32Array, UInt64Array};
use arrow::compute::cast;
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use bytes::Bytes;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::file::properties::WriterProperties;
use parquet::format::KeyValue;
use serde::{Deserialize, Serialize};

use crate::error::{FleetError, Result};

pub const COL_PAPER_ID: &str = "paper_id";
pub const COL_EQUATION_ID: &str = "equation_id";
pub const COL_CONTENT: &str = "content_resolved";
pub const COL_PROMPT_FILTER: &str = "LLM_prompt";

/// Values of `LLM_prompt` that select a row for inference.
const PROMPT_FILTER_VALUES: [&str; 2] = ["LLM", "API"];

/// One input row selected for inference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputRecord {
    /// Position of the row in the shard file, before filtering
    pub row_index: u64,
    pub paper_id: Option<String>,
    pub equation_id: Option<String>,
    pub content: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Ok,
    Unparsed,
    Error,
    Skipped,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Ok => "ok",
            RecordStatus::Unparsed => "unparsed",
            RecordStatus::Error => "error",
            RecordStatus::Skipped => "skipped",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "ok" => Some(RecordStatus::Ok),
            "unparsed" => Some(RecordStatus::Unparsed),
            "error" => Some(RecordStatus::Error),
            "skipped" => Some(RecordStatus::Skipped),
            _ => None,
        }
    }
}

impl std::fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One artifact row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputRecord {
    pub paper_id: Option<String>,
    pub equation_id: Option<String>,
    pub row_index: u64,
    pub latex_raw: String,
    pub latex_clean: String,
    pub llm_raw_output: Option<String>,
    /// JSON array of keywords
    pub math_keywords: Option<String>,
    pub math_sentence: Option<String>,
    pub katex: Option<String>,
    /// JSON object of the first equivalent form
    pub equiv_form_1: Option<String>,
    pub equiv_form_2: Option<String>,
    /// The full validated model output as JSON
    pub output_json: Option<String>,
    pub status: RecordStatus,
    pub error: Option<String>,
    pub attempts: u32,
    pub inferred_at_ms: i64,
}

impl OutputRecord {
    /// A row with inputs filled in and no inference result.
    pub fn placeholder(
        input: &InputRecord,
        latex_clean: String,
        status: RecordStatus,
        error: Option<String>,
    ) -> Self {
        Self {
            paper_id: input.paper_id.clone(),
            equation_id: input.equation_id.clone(),
            row_index: input.row_index,
            latex_raw: input.content.clone().unwrap_or_default(),
            latex_clean,
            llm_raw_output: None,
            math_keywords: None,
            math_sentence: None,
            katex: None,
            equiv_form_1: None,
            equiv_form_2: None,
            output_json: None,
            status,
            error,
            attempts: 0,
            inferred_at_ms: chrono::Utc::now().timestamp_millis(),
        }
    }
}

fn writer_properties() -> WriterProperties {
    let created_by = KeyValue {
        key: "created_by".to_string(),
        value: Some(concat!("fleet-infer ", env!("CARGO_PKG_VERSION")).to_string()),
    };
    WriterProperties::builder()
        .set_key_value_metadata(Some(vec![created_by]))
        .build()
}

fn write_single_batch(schema: Arc<Schema>, batch: &RecordBatch) -> Result<Bytes> {
    let mut cursor = Cursor::new(Vec::<u8>::new());
    let mut writer = ArrowWriter::try_new(&mut cursor, schema, Some(writer_properties()))?;
    writer.write(batch)?;
    writer.close()?;
    Ok(Bytes::from(cursor.into_inner()))
}

fn read_batches(path: &Path) -> Result<Vec<RecordBatch>> {
    let file = File::open(path)?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)?.build()?;
    let mut batches = Vec::new();
    for batch in reader {
        batches.push(batch?);
    }
    Ok(batches)
}

/// Column `name` as strings, whatever its stored type. `None` if absent.
fn col_as_strings(batch: &RecordBatch, name: &str) -> Result<Option<StringArray>> {
    let Ok(idx) = batch.schema().index_of(name) else {
        return Ok(None);
    };
    let column = cast(batch.column(idx), &DataType::Utf8)?;
    column
        .as_any()
        .downcast_ref::<StringArray>()
        .cloned()
        .map(Some)
        .ok_or_else(|| FleetError::ShardFormat(format!("column '{name}' is not castable to string")))
}

fn value_at(column: &Option<StringArray>, row: usize) -> Option<String> {
    column
        .as_ref()
        .filter(|c| !c.is_null(row))
        .map(|c| c.value(row).to_string())
}

/// Read the rows of an input shard that are selected for inference.
pub fn read_shard(path: &Path) -> Result<Vec<InputRecord>> {
    let mut records = Vec::new();
    let mut offset = 0u64;
    for batch in read_batches(path)? {
        let content = col_as_strings(&batch, COL_CONTENT)?.ok_or_else(|| {
            FleetError::ShardFormat(format!(
                "{} has no '{COL_CONTENT}' column",
                path.display()
            ))
        })?;
        let paper_ids = col_as_strings(&batch, COL_PAPER_ID)?;
        let equation_ids = col_as_strings(&batch, COL_EQUATION_ID)?;
        let filter = col_as_strings(&batch, COL_PROMPT_FILTER)?;

        for row in 0..batch.num_rows() {
            let row_index = offset + row as u64;
            if filter.is_some() {
                let selected = value_at(&filter, row)
                    .is_some_and(|v| PROMPT_FILTER_VALUES.contains(&v.as_str()));
                if !selected {
                    continue;
                }
            }
            records.push(InputRecord {
                row_index,
                paper_id: value_at(&paper_ids, row),
                equation_id: value_at(&equation_ids, row),
                content: (!content.is_null(row)).then(|| content.value(row).to_string()),
            });
        }
        offset += batch.num_rows() as u64;
    }
    Ok(records)
}

/// Encode input rows as a shard file. `prompt_filter`, when given, holds
/// one `LLM_prompt` value per row.
pub fn encode_shard(records: &[InputRecord], prompt_filter: Option<&[&str]>) -> Result<Bytes> {
    let mut fields = vec![
        Field::new(COL_PAPER_ID, DataType::Utf8, true),
        Field::new(COL_EQUATION_ID, DataType::Utf8, true),
        Field::new(COL_CONTENT, DataType::Utf8, true),
    ];
    let mut columns: Vec<ArrayRef> = vec![
        Arc::new(StringArray::from(
            records.iter().map(|r| r.paper_id.as_deref()).collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(
            records.iter().map(|r| r.equation_id.as_deref()).collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(
            records.iter().map(|r| r.content.as_deref()).collect::<Vec<_>>(),
        )),
    ];
    if let Some(filter) = prompt_filter {
        if filter.len() != records.len() {
            return Err(FleetError::InvalidArgument(format!(
                "{} filter values for {} records",
                filter.len(),
                records.len()
            )));
        }
        fields.push(Field::new(COL_PROMPT_FILTER, DataType::Utf8, true));
        columns.push(Arc::new(StringArray::from(filter.to_vec())));
    }
    let schema = Arc::new(Schema::new(fields));
    let batch = RecordBatch::try_new(schema.clone(), columns)?;
    write_single_batch(schema, &batch)
}

pub fn output_schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("paper_id", DataType::Utf8, true),
        Field::new("equation_id", DataType::Utf8, true),
        Field::new("row_index", DataType::UInt64, false),
        Field::new("latex_raw", DataType::Utf8, false),
        Field::new("latex_clean", DataType::Utf8, false),
        Field::new("llm_raw_output", DataType::Utf8, true),
        Field::new("math_keywords", DataType::Utf8, true),
        Field::new("math_sentence", DataType::Utf8, true),
        Field::new("katex", DataType::Utf8, true),
        Field::new("equiv_form_1", DataType::Utf8, true),
        Field::new("equiv_form_2", DataType::Utf8, true),
        Field::new("output_json", DataType::Utf8, true),
        Field::new("status", DataType::Utf8, false),
        Field::new("error", DataType::Utf8, true),
        Field::new("attempts", DataType::UInt32, false),
        Field::new("inferred_at_ms", DataType::Int64, false),
    ]))
}

fn opt_column<F>(rows: &[OutputRecord], get: F) -> ArrayRef
where
    F: Fn(&OutputRecord) -> Option<&str>,
{
    Arc::new(StringArray::from(rows.iter().map(get).collect::<Vec<_>>()))
}

/// Encode artifact rows as a single-batch Parquet file.
pub fn encode_artifact(rows: &[OutputRecord]) -> Result<Bytes> {
    let schema = output_schema();
    let columns: Vec<ArrayRef> = vec![
        opt_column(rows, |r| r.paper_id.as_deref()),
        opt_column(rows, |r| r.equation_id.as_deref()),
        Arc::new(UInt64Array::from(
            rows.iter().map(|r| r.row_index).collect::<Vec<_>>(),
        )),
        opt_column(rows, |r| Some(r.latex_raw.as_str())),
        opt_column(rows, |r| Some(r.latex_clean.as_str())),
        opt_column(rows, |r| r.llm_raw_output.as_deref()),
        opt_column(rows, |r| r.math_keywords.as_deref()),
        opt_column(rows, |r| r.math_sentence.as_deref()),
        opt_column(rows, |r| r.katex.as_deref()),
        opt_column(rows, |r| r.equiv_form_1.as_deref()),
        opt_column(rows, |r| r.equiv_form_2.as_deref()),
        opt_column(rows, |r| r.output_json.as_deref()),
        opt_column(rows, |r| Some(r.status.as_str())),
        opt_column(rows, |r| r.error.as_deref()),
        Arc::new(UInt32Array::from(
            rows.iter().map(|r| r.attempts).collect::<Vec<_>>(),
        )),
        Arc::new(Int64Array::from(
            rows.iter().map(|r| r.inferred_at_ms).collect::<Vec<_>>(),
        )),
    ];
    let batch = RecordBatch::try_new(schema.clone(), columns)?;
    write_single_batch(schema, &batch)
}

fn required_string(column: &Option<StringArray>, row: usize, name: &str) -> Result<String> {
    value_at(column, row)
        .ok_or_else(|| FleetError::ShardFormat(format!("artifact column '{name}' is null or missing")))
}

fn col_typed<'a, T: 'static>(batch: &'a RecordBatch, name: &str) -> Result<&'a T> {
    let idx = batch
        .schema()
        .index_of(name)
        .map_err(|e| FleetError::ShardFormat(format!("missing column '{name}': {e}")))?;
    batch
        .column(idx)
        .as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| FleetError::ShardFormat(format!("column '{name}' has unexpected type")))
}

/// Read an artifact back into rows.
pub fn read_artifact(path: &Path) -> Result<Vec<OutputRecord>> {
    let mut rows = Vec::new();
    for batch in read_batches(path)? {
        let s = |name: &str| col_as_strings(&batch, name);
        let paper_id = s("paper_id")?;
        let equation_id = s("equation_id")?;
        let latex_raw = s("latex_raw")?;
        let latex_clean = s("latex_clean")?;
        let llm_raw_output = s("llm_raw_output")?;
        let math_keywords = s("math_keywords")?;
        let math_sentence = s("math_sentence")?;
        let katex = s("katex")?;
        let equiv_form_1 = s("equiv_form_1")?;
        let equiv_form_2 = s("equiv_form_2")?;
        let output_json = s("output_json")?;
        let status = s("status")?;
        let error = s("error")?;
        let row_index = col_typed::<UInt64Array>(&batch, "row_index")?;
        let attempts = col_typed::<UInt32Array>(&batch, "attempts")?;
        let inferred_at_ms = col_typed::<Int64Array>(&batch, "inferred_at_ms")?;

        for row in 0..batch.num_rows() {
            let status_text = required_string(&status, row, "status")?;
            let status = RecordStatus::parse(&status_text).ok_or_else(|| {
                FleetError::ShardFormat(format!("unknown record status '{status_text}'"))
            })?;
            rows.push(OutputRecord {
                paper_id: value_at(&paper_id, row),
                equation_id: value_at(&equation_id, row),
                row_index: row_index.value(row),
                latex_raw: required_string(&latex_raw, row, "latex_raw")?,
                latex_clean: required_string(&latex_clean, row, "latex_clean")?,
                llm_raw_output: value_at(&llm_raw_output, row),
                math_keywords: value_at(&math_keywords, row),
                math_sentence: value_at(&math_sentence, row),
                katex: value_at(&katex, row),
                equiv_form_1: value_at(&equiv_form_1, row),
                equiv_form_2: value_at(&equiv_form_2, row),
                output_json: value_at(&output_json, row),
                status,
                error: value_at(&error, row),
                attempts: attempts.value(row),
                inferred_at_ms: inferred_at_ms.value(row),
            });
        }
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(i: u64, content: Option<&str>) -> InputRecord {
        InputRecord {
            row_index: i,
            paper_id: Some(format!("p{i}")),
            equation_id: Some(format!("e{i}")),
            content: content.map(str::to_string),
        }
    }

    fn write(dir: &Path, name: &str, bytes: Bytes) -> std::path::PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, &bytes).unwrap();
        path
    }

    #[test]
    fn reads_all_rows_without_filter_column() {
        let dir = tempfile::tempdir().unwrap();
        let rows = vec![input(0, Some("a")), input(1, None), input(2, Some("c"))];
        let path = write(dir.path(), "s.parquet", encode_shard(&rows, None).unwrap());

        let read = read_shard(&path).unwrap();
        assert_eq!(read, rows);
    }

    #[test]
    fn filter_column_selects_llm_and_api_rows() {
        let dir = tempfile::tempdir().unwrap();
        let rows: Vec<_> = (0..4).map(|i| input(i, Some("x"))).collect();
        let filter = ["LLM", "skip", "API", "llm"];
        let path = write(
            dir.path(),
            "s.parquet",
            encode_shard(&rows, Some(&filter)).unwrap(),
        );

        let read = read_shard(&path).unwrap();
        let indices: Vec<u64> = read.iter().map(|r| r.row_index).collect();
        assert_eq!(indices, vec![0, 2]);
    }

    #[test]
    fn missing_content_column_is_a_format_error() {
        let dir = tempfile::tempdir().unwrap();
        let schema = Arc::new(Schema::new(vec![Field::new("paper_id", DataType::Utf8, true)]));
        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![Arc::new(StringArray::from(vec![Some("p")])) as ArrayRef],
        )
        .unwrap();
        let path = write(dir.path(), "s.parquet", write_single_batch(schema, &batch).unwrap());

        assert!(matches!(read_shard(&path), Err(FleetError::ShardFormat(_))));
    }

    #[test]
    fn integer_ids_are_read_as_strings() {
        let dir = tempfile::tempdir().unwrap();
        let schema = Arc::new(Schema::new(vec![
            Field::new("paper_id", DataType::Int64, true),
            Field::new("content_resolved", DataType::Utf8, true),
        ]));
        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![
                Arc::new(Int64Array::from(vec![Some(42)])) as ArrayRef,
                Arc::new(StringArray::from(vec![Some("x^2")])) as ArrayRef,
            ],
        )
        .unwrap();
        let path = write(dir.path(), "s.parquet", write_single_batch(schema, &batch).unwrap());

        let read = read_shard(&path).unwrap();
        assert_eq!(read[0].paper_id.as_deref(), Some("42"));
        assert_eq!(read[0].equation_id, None);
    }

    #[test]
    fn artifact_keeps_placeholders() {
        let dir = tempfile::tempdir().unwrap();
        let mut ok = OutputRecord::placeholder(&input(0, Some("a")), "a".into(), RecordStatus::Ok, None);
        ok.llm_raw_output = Some("{}".into());
        ok.attempts = 1;
        let failed = OutputRecord::placeholder(
            &input(1, Some("b")),
            "b".into(),
            RecordStatus::Error,
            Some("HTTP 500".into()),
        );
        let path = write(
            dir.path(),
            "a.parquet",
            encode_artifact(&[ok.clone(), failed.clone()]).unwrap(),
        );

        let read = read_artifact(&path).unwrap();
        assert_eq!(read, vec![ok, failed]);
    }

    #[test]
    fn empty_artifact_is_valid() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "a.parquet", encode_artifact(&[]).unwrap());
        assert!(read_artifact(&path).unwrap().is_empty());
    }
}

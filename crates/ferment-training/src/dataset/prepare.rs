use super::{compute_dataset_id, load_records, normalize, Conversation, DatasetId};
use crate::config::JobConfig;
use crate::error::{DatasetError, DatasetResult};
use crate::template::RoleSpan;
use crate::tokenizer::ChatTokenizer;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// A templated, tokenized example with its loss mask.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormattedExample {
    /// Index of the source record in the dataset file.
    pub record_index: usize,
    pub text: String,
    pub input_ids: Vec<u32>,
    /// `true` on tokens that belong to assistant spans.
    pub loss_mask: Vec<bool>,
    pub spans: Vec<RoleSpan>,
    /// Set when `input_ids` was cut at `max_seq_length`.
    pub truncated: bool,
}

impl FormattedExample {
    pub fn trainable_tokens(&self) -> usize {
        self.loss_mask.iter().filter(|m| **m).count()
    }

    /// Per-token labels: the token id on assistant tokens, `None` elsewhere.
    pub fn labels(&self) -> Vec<Option<u32>> {
        self.input_ids.iter().zip(&self.loss_mask).map(|(id, keep)| keep.then_some(*id)).collect()
    }

    pub fn loss_weights(&self) -> Vec<f32> {
        self.loss_mask.iter().map(|keep| if *keep { 1.0 } else { 0.0 }).collect()
    }
}

/// Render and tokenize one conversation.
///
/// Tokenization runs segment by segment so token boundaries line up with role
/// spans; the same inputs always produce the same example.
pub fn format_example(
    record_index: usize,
    conversation: &Conversation,
    tokenizer: &ChatTokenizer,
    max_seq_length: usize,
) -> DatasetResult<FormattedExample> {
    let binding = tokenizer.binding().ok_or(DatasetError::TemplateUnset)?;
    let rendered = binding
        .template
        .render(conversation, binding.add_generation_prompt)
        .map_err(|message| DatasetError::Template { record: record_index, message })?;

    let mut input_ids = Vec::new();
    let mut loss_mask = Vec::new();
    for segment in &rendered.segments {
        let ids = tokenizer.encode(&segment.text);
        loss_mask.extend(std::iter::repeat_n(segment.is_trainable(), ids.len()));
        input_ids.extend(ids);
    }

    let truncated = input_ids.len() > max_seq_length;
    input_ids.truncate(max_seq_length);
    loss_mask.truncate(max_seq_length);

    Ok(FormattedExample { record_index, text: rendered.text, input_ids, loss_mask, spans: rendered.spans, truncated })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordFailure {
    pub record: usize,
    pub reason: String,
}

/// Outcome of preparing a dataset: what was kept and why the rest was not.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetReport {
    pub source: PathBuf,
    pub total: usize,
    pub kept: usize,
    pub skipped: Vec<RecordFailure>,
}

#[derive(Debug, Clone)]
struct KeptRecord {
    index: usize,
    conversation: Conversation,
}

/// A finite, restartable sequence of formatted examples.
///
/// Records are loaded and validated once; examples are produced lazily in batches,
/// in source order, each time [`PreparedDataset::iter`] is called.
#[derive(Clone)]
pub struct PreparedDataset {
    records: Arc<[KeptRecord]>,
    tokenizer: ChatTokenizer,
    max_seq_length: usize,
    batch_size: usize,
    pool: Option<Arc<rayon::ThreadPool>>,
    id: DatasetId,
}

impl std::fmt::Debug for PreparedDataset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreparedDataset")
            .field("id", &self.id)
            .field("len", &self.records.len())
            .field("batch_size", &self.batch_size)
            .field("workers", &self.pool.as_ref().map(|p| p.current_num_threads()))
            .finish_non_exhaustive()
    }
}

impl PreparedDataset {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Content hash, usable as a cache key across runs with identical config.
    pub fn id(&self) -> &DatasetId {
        &self.id
    }

    pub fn iter(&self) -> Examples<'_> {
        Examples { dataset: self, next: 0, buffer: VecDeque::new() }
    }

    fn format_batch(&self, batch: &[KeptRecord]) -> Vec<DatasetResult<FormattedExample>> {
        let format = |r: &KeptRecord| format_example(r.index, &r.conversation, &self.tokenizer, self.max_seq_length);
        match &self.pool {
            Some(pool) => pool.install(|| batch.par_iter().map(format).collect()),
            None => batch.iter().map(format).collect(),
        }
    }

    /// Write the formatted examples as JSON Lines, text under `text_field`.
    pub fn write_jsonl(&self, path: &Path, text_field: &str) -> DatasetResult<()> {
        let mut out = String::new();
        for example in self.iter() {
            let example = example?;
            let line = serde_json::json!({
                "record": example.record_index,
                text_field: example.text,
                "spans": example.spans,
                "trainable_tokens": example.trainable_tokens(),
            });
            out.push_str(&serde_json::to_string(&line)?);
            out.push('\n');
        }
        std::fs::write(path, out)?;
        Ok(())
    }
}

/// Iterator over a [`PreparedDataset`], formatting one internal batch at a time.
pub struct Examples<'a> {
    dataset: &'a PreparedDataset,
    next: usize,
    buffer: VecDeque<DatasetResult<FormattedExample>>,
}

impl Iterator for Examples<'_> {
    type Item = DatasetResult<FormattedExample>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && self.next < self.dataset.records.len() {
            let end = (self.next + self.dataset.batch_size).min(self.dataset.records.len());
            let batch = &self.dataset.records[self.next..end];
            self.buffer.extend(self.dataset.format_batch(batch));
            self.next = end;
        }
        self.buffer.pop_front()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.buffer.len() + self.dataset.records.len() - self.next;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for Examples<'_> {}

fn build_pool(workers: usize) -> DatasetResult<Option<Arc<rayon::ThreadPool>>> {
    if workers == 0 {
        return Ok(None);
    }
    rayon::ThreadPoolBuilder::new()
        .num_threads(workers)
        .thread_name(|i| format!("ferment-dataset-{i}"))
        .build()
        .map(|pool| Some(Arc::new(pool)))
        .map_err(|e| DatasetError::Io(std::io::Error::other(e.to_string())))
}

/// Load, normalize and validate the configured dataset.
///
/// Per-record problems are collected into the report instead of aborting; an
/// empty result is fatal. The tokenizer must already carry its chat template.
pub fn prepare_dataset(config: &JobConfig, tokenizer: &ChatTokenizer) -> DatasetResult<(PreparedDataset, DatasetReport)> {
    let binding = tokenizer.binding().ok_or(DatasetError::TemplateUnset)?;
    let dataset = &config.dataset;
    let max_seq_length = config.model.max_seq_length;

    let records = load_records(&dataset.path, dataset.format, &dataset.split)?;
    let total = records.len();
    let pool = build_pool(dataset.workers)?;

    let check = |record: &super::DatasetRecord| -> Result<KeptRecord, RecordFailure> {
        let fail = |e: DatasetError| RecordFailure { record: record.index, reason: e.to_string() };
        let conversation = normalize(record, &dataset.message_field).map_err(fail)?;
        // An empty reply still carries an end-of-turn marker, which would teach silence.
        if !conversation.has_assistant_content() {
            return Err(RecordFailure { record: record.index, reason: "no assistant response to train on".to_string() });
        }
        let example = format_example(record.index, &conversation, tokenizer, max_seq_length).map_err(fail)?;
        if example.trainable_tokens() == 0 {
            return Err(RecordFailure {
                record: record.index,
                reason: format!("assistant tokens fall beyond max_seq_length ({max_seq_length})"),
            });
        }
        Ok(KeptRecord { index: record.index, conversation })
    };

    let checked: Vec<Result<KeptRecord, RecordFailure>> = match &pool {
        Some(pool) => pool.install(|| records.par_iter().map(check).collect()),
        None => records.iter().map(check).collect(),
    };

    let mut kept = Vec::with_capacity(checked.len());
    let mut skipped = Vec::new();
    for outcome in checked {
        match outcome {
            Ok(record) => kept.push(record),
            Err(failure) => {
                tracing::warn!(record = failure.record, reason = %failure.reason, "skipping dataset record");
                skipped.push(failure);
            }
        }
    }

    if kept.is_empty() {
        return Err(DatasetError::Empty { total, skipped: skipped.len() });
    }

    let id = compute_dataset_id(kept.iter().map(|r| &r.conversation), binding.template.name(), tokenizer.id())?;
    let report = DatasetReport { source: dataset.path.clone(), total, kept: kept.len(), skipped };
    tracing::info!(dataset_id = %id, kept = report.kept, skipped = report.skipped.len(), "dataset prepared");

    let prepared = PreparedDataset {
        records: kept.into(),
        tokenizer: tokenizer.clone(),
        max_seq_length,
        batch_size: dataset.batch_size.max(1),
        pool,
        id,
    };
    Ok((prepared, report))
}

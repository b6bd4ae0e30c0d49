//! Streaming chunker: reads the source document as a byte stream, decodes
//! UTF-8 incrementally, and closes token-bounded chunks at paragraph
//! boundaries where possible. The whole document is never held in memory.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, warn};

use crate::config::PipelineConfig;
use crate::error::ChunkingError;
use crate::job::{ChunkDescriptor, keys};
use crate::store::ObjectStore;
use crate::token::TokenCounter;

const READ_BUF_BYTES: usize = 64 * 1024;

/// How much paragraph-less text may accumulate before it is force-fed to
/// the chunk builder in fixed-size pieces. The cut position depends only on
/// the text stream, never on read sizes, so chunking stays deterministic.
const PENDING_FLUSH_BYTES: usize = 32 * 1024;

/// Result of chunking one document.
#[derive(Debug, Clone)]
pub struct ChunkPlan {
    pub total_chunks: u32,
    pub total_tokens: u64,
    pub descriptors: Vec<ChunkDescriptor>,
}

pub struct Chunker {
    objects: Arc<dyn ObjectStore>,
    counter: TokenCounter,
    target_tokens: usize,
    overlap_tokens: usize,
    slack_tokens: usize,
}

struct BuildState {
    job_id: String,
    index: u32,
    buf: String,
    /// Running sum of per-segment counts; the exact count is recomputed
    /// when the chunk closes.
    buf_tokens: usize,
    chunk_start: u64,
    previous_summary: String,
    descriptors: Vec<ChunkDescriptor>,
    total_tokens: u64,
    saw_text: bool,
}

impl Chunker {
    pub fn new(objects: Arc<dyn ObjectStore>, config: &PipelineConfig) -> Self {
        let slack_tokens =
            config.target_chunk_tokens * config.paragraph_boundary_slack_percent as usize / 100;
        Self {
            objects,
            counter: TokenCounter::new(),
            target_tokens: config.target_chunk_tokens,
            overlap_tokens: config.overlap_tokens,
            slack_tokens,
        }
    }

    /// Chunk the document behind `reader`, writing each chunk's source text
    /// to `chunks/{job_id}/{index}` as it closes.
    pub async fn chunk(
        &self,
        job_id: &str,
        mut reader: Box<dyn AsyncRead + Send + Unpin>,
    ) -> Result<ChunkPlan, ChunkingError> {
        let mut state = BuildState {
            job_id: job_id.to_string(),
            index: 0,
            buf: String::new(),
            buf_tokens: 0,
            chunk_start: 0,
            previous_summary: String::new(),
            descriptors: Vec::new(),
            total_tokens: 0,
            saw_text: false,
        };

        let mut decoder = Utf8Decoder::default();
        let mut read_buf = vec![0u8; READ_BUF_BYTES];
        // Text decoded but not yet handed to the builder; grows until a
        // paragraph break (or the flush threshold) is found.
        let mut pending = String::new();
        let mut at_start = true;

        loop {
            let n = reader
                .read(&mut read_buf)
                .await
                .map_err(|e| ChunkingError::Storage(e.into()))?;
            if n == 0 {
                break;
            }

            let mut text = decoder.push(&read_buf[..n])?;
            if at_start && !text.is_empty() {
                if let Some(stripped) = text.strip_prefix('\u{feff}') {
                    text = stripped.to_string();
                }
                at_start = false;
            }
            pending.push_str(&text);

            self.drain_pending(&mut state, &mut pending, false).await?;
        }

        decoder.finish()?;
        self.drain_pending(&mut state, &mut pending, true).await?;
        self.close_chunk(&mut state).await?;

        if !state.saw_text || state.descriptors.is_empty() {
            return Err(ChunkingError::EmptySource);
        }

        debug!(
            "chunked job {} into {} chunks ({} tokens)",
            job_id,
            state.descriptors.len(),
            state.total_tokens
        );

        Ok(ChunkPlan {
            total_chunks: state.descriptors.len() as u32,
            total_tokens: state.total_tokens,
            descriptors: state.descriptors,
        })
    }

    /// Move complete paragraphs (and, past the flush threshold, fixed-size
    /// pieces) out of `pending` into the chunk builder. With `all` set the
    /// remainder is flushed too.
    async fn drain_pending(
        &self,
        state: &mut BuildState,
        pending: &mut String,
        all: bool,
    ) -> Result<(), ChunkingError> {
        loop {
            if let Some(pos) = pending.find("\n\n") {
                let paragraph: String = pending.drain(..pos + 2).collect();
                self.push_segment(state, &paragraph).await?;
                continue;
            }
            if pending.len() >= PENDING_FLUSH_BYTES {
                let mut cut = PENDING_FLUSH_BYTES;
                while !pending.is_char_boundary(cut) {
                    cut -= 1;
                }
                let piece: String = pending.drain(..cut).collect();
                self.push_segment(state, &piece).await?;
                continue;
            }
            break;
        }

        if all && !pending.is_empty() {
            let rest = std::mem::take(pending);
            self.push_segment(state, &rest).await?;
        }
        Ok(())
    }

    async fn push_segment(&self, state: &mut BuildState, seg: &str) -> Result<(), ChunkingError> {
        if seg.is_empty() {
            return Ok(());
        }
        if !state.saw_text && seg.chars().any(|c| !c.is_whitespace()) {
            state.saw_text = true;
        }

        let high = self.target_tokens + self.slack_tokens;
        let low = self.target_tokens.saturating_sub(self.slack_tokens);
        let seg_tokens = self.counter.count(seg);

        if state.buf_tokens + seg_tokens <= high {
            state.buf.push_str(seg);
            state.buf_tokens += seg_tokens;
            if state.buf_tokens >= self.target_tokens {
                self.close_chunk(state).await?;
            }
            return Ok(());
        }

        // The segment would overshoot the window. Close at the preceding
        // paragraph boundary when it lies within tolerance of the target.
        if state.buf_tokens >= low {
            self.close_chunk(state).await?;
            if seg_tokens <= high {
                state.buf.push_str(seg);
                state.buf_tokens = seg_tokens;
                if state.buf_tokens >= self.target_tokens {
                    self.close_chunk(state).await?;
                }
                return Ok(());
            }
        }

        // Oversized paragraph: fill the current chunk to the target and
        // split the remainder at token boundaries, never inside a token.
        let mut rest = seg.to_string();
        loop {
            let space = self
                .target_tokens
                .saturating_sub(state.buf_tokens)
                .max(1);
            match self.counter.split_at(&rest, space) {
                Some((head, tail)) => {
                    state.buf.push_str(&head);
                    self.close_chunk(state).await?;
                    rest = tail;
                }
                None => {
                    let rest_tokens = self.counter.count(&rest);
                    state.buf.push_str(&rest);
                    state.buf_tokens += rest_tokens;
                    if state.buf_tokens >= self.target_tokens {
                        self.close_chunk(state).await?;
                    }
                    return Ok(());
                }
            }
        }
    }

    async fn close_chunk(&self, state: &mut BuildState) -> Result<(), ChunkingError> {
        if state.buf.is_empty() {
            return Ok(());
        }

        let text = std::mem::take(&mut state.buf);
        state.buf_tokens = 0;

        let exact = self.counter.count(&text);
        if exact > self.target_tokens + self.slack_tokens {
            warn!(
                "chunk {} of job {} holds {} tokens (unsplittable span over target {})",
                state.index, state.job_id, exact, self.target_tokens
            );
        }

        let source_key = keys::chunk(&state.job_id, state.index);
        self.objects
            .put(&source_key, text.as_bytes())
            .await
            .map_err(ChunkingError::Storage)?;

        state.descriptors.push(ChunkDescriptor {
            job_id: state.job_id.clone(),
            index: state.index,
            input_tokens: exact as u64,
            byte_start: state.chunk_start,
            byte_end: state.chunk_start + text.len() as u64,
            previous_summary: std::mem::take(&mut state.previous_summary),
            source_key,
            output_key: keys::translated(&state.job_id, state.index),
        });

        state.previous_summary = self.counter.tail(&text, self.overlap_tokens);
        state.chunk_start += text.len() as u64;
        state.total_tokens += exact as u64;
        debug!(
            "closed chunk {} of job {} ({} tokens)",
            state.index, state.job_id, exact
        );
        state.index += 1;
        Ok(())
    }
}

/// Incremental UTF-8 decoder that carries partial multi-byte sequences
/// across read boundaries and fails fast on invalid input.
#[derive(Default)]
struct Utf8Decoder {
    incomplete: Vec<u8>,
    offset: u64,
}

impl Utf8Decoder {
    fn push(&mut self, bytes: &[u8]) -> Result<String, ChunkingError> {
        let mut data = std::mem::take(&mut self.incomplete);
        data.extend_from_slice(bytes);

        match std::str::from_utf8(&data) {
            Ok(s) => {
                let out = s.to_string();
                self.offset += data.len() as u64;
                Ok(out)
            }
            Err(e) => {
                let valid = e.valid_up_to();
                if e.error_len().is_some() {
                    return Err(ChunkingError::InvalidEncoding {
                        offset: self.offset + valid as u64,
                    });
                }
                let out = String::from_utf8_lossy(&data[..valid]).into_owned();
                self.incomplete = data[valid..].to_vec();
                self.offset += valid as u64;
                Ok(out)
            }
        }
    }

    fn finish(&self) -> Result<(), ChunkingError> {
        if !self.incomplete.is_empty() {
            return Err(ChunkingError::InvalidEncoding {
                offset: self.offset,
            });
        }
        Ok(())
    }
}

//! Document replication engine: authoritative state plus transform-based
//! convergence for concurrent edits.
//!
//! Every operation carries the revision it was generated against. Before an
//! operation is applied it is transformed against everything applied since
//! that revision:
//!
//! ```text
//! client op (originRevision = r) ──► transform against log[r..] ──► apply
//!                                                                    │
//!                     canonical op (revision = r') ◄─────────────────┘
//!                                │
//!                                └──► rebroadcast, already positioned
//! ```
//!
//! Position adjustment: inserts before an index shift it right, deletes
//! before an index shift it left by the overlap, concurrent inserts at the
//! same index are ordered by participant id (lower id takes the left
//! position). A delete or format transformed across an insert that lands
//! inside its range splits into two ranges, which is why canonical range
//! payloads carry a range set rather than a single span.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::types::{now_millis, OperationId, UserId};

/// Text style for format operations. Closed set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Style {
    Bold,
    Italic,
    Underline,
}

/// A styled run of characters. `start`/`len` are char indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatSpan {
    pub start: usize,
    pub len: usize,
    pub style: Style,
}

/// Authoritative per-document state. Mutated only through accepted
/// operations; `revision` increments exactly once per accepted operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentState {
    pub content: String,
    pub spans: Vec<FormatSpan>,
    pub revision: u64,
    pub last_modified: u64,
}

impl DocumentState {
    pub fn new() -> Self {
        Self {
            content: String::new(),
            spans: Vec::new(),
            revision: 0,
            last_modified: now_millis(),
        }
    }

    pub fn with_content(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Self::new()
        }
    }

    /// Content length in chars (all indices in this module are char indices).
    pub fn char_len(&self) -> usize {
        self.content.chars().count()
    }
}

impl Default for DocumentState {
    fn default() -> Self {
        Self::new()
    }
}

/// Client-submitted edit payload: a single primitive at a position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OpPayload {
    Insert { index: usize, text: String },
    Delete { index: usize, len: usize },
    Format { index: usize, len: usize, style: Style },
}

/// A single atomic edit, immutable once created. Applied at most once,
/// keyed by `op_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub op_id: OperationId,
    pub origin_revision: u64,
    pub participant_id: UserId,
    pub payload: OpPayload,
}

/// Post-transform payload. Delete and format ranges may have been split by
/// concurrent inserts, so they carry disjoint ascending `(start, len)`
/// ranges; deletes apply right-to-left. Inserts never split.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CanonicalPayload {
    Insert { index: usize, text: String },
    Delete { ranges: Vec<(usize, usize)> },
    Format { ranges: Vec<(usize, usize)>, style: Style },
}

/// An accepted operation in its canonical (transformed) form, stamped with
/// the revision it produced. Broadcast to the other participants, who apply
/// it as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedOperation {
    pub op_id: OperationId,
    pub participant_id: UserId,
    pub origin_revision: u64,
    pub revision: u64,
    pub payload: CanonicalPayload,
}

/// Rejection reasons for submitted operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EngineError {
    /// Payload indices outside current bounds, or an origin revision ahead
    /// of the document. Dropped, never retried.
    Malformed(String),
    /// Origin revision predates the retained log; the client must resync.
    Stale {
        origin_revision: u64,
        oldest_retained: u64,
    },
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Malformed(e) => write!(f, "Malformed operation: {e}"),
            EngineError::Stale {
                origin_revision,
                oldest_retained,
            } => write!(
                f,
                "Stale operation: origin revision {origin_revision} predates retained log (oldest {oldest_retained})"
            ),
        }
    }
}

impl std::error::Error for EngineError {}

/// Per-document replication engine. Single-owner: the session actor is the
/// only caller, so there is no interior locking.
pub struct ReplicationEngine {
    state: DocumentState,
    /// Revision the state had when loaded; ops at or below it are gone.
    baseline: u64,
    /// Applied ops since baseline. `log[i].revision == baseline + i + 1`.
    log: Vec<AppliedOperation>,
    /// op_id → index into `log`, for idempotent resubmission.
    applied: HashMap<OperationId, usize>,
}

impl ReplicationEngine {
    pub fn new(state: DocumentState) -> Self {
        let baseline = state.revision;
        Self {
            state,
            baseline,
            log: Vec::new(),
            applied: HashMap::new(),
        }
    }

    pub fn state(&self) -> &DocumentState {
        &self.state
    }

    pub fn revision(&self) -> u64 {
        self.state.revision
    }

    pub fn log_len(&self) -> usize {
        self.log.len()
    }

    /// Accept, transform and apply one operation.
    ///
    /// Resubmitting an already-applied op id returns the original canonical
    /// operation without touching state. Concurrency alone never rejects;
    /// only malformed payloads and origins outside the retained log do.
    pub fn submit(&mut self, op: Operation) -> Result<AppliedOperation, EngineError> {
        if let Some(&idx) = self.applied.get(&op.op_id) {
            return Ok(self.log[idx].clone());
        }

        if op.origin_revision < self.baseline {
            return Err(EngineError::Stale {
                origin_revision: op.origin_revision,
                oldest_retained: self.baseline,
            });
        }
        if op.origin_revision > self.state.revision {
            return Err(EngineError::Malformed(format!(
                "origin revision {} ahead of document revision {}",
                op.origin_revision, self.state.revision
            )));
        }

        let first = (op.origin_revision - self.baseline) as usize;
        self.validate(&op.payload, self.len_at(first))?;

        let mut canon = canonical_of(op.payload);
        for earlier in &self.log[first..] {
            transform(
                &mut canon,
                &earlier.payload,
                earlier.participant_id,
                op.participant_id,
            );
        }

        apply(&mut self.state, &canon);
        self.state.revision += 1;
        self.state.last_modified = now_millis();

        let applied = AppliedOperation {
            op_id: op.op_id,
            participant_id: op.participant_id,
            origin_revision: op.origin_revision,
            revision: self.state.revision,
            payload: canon,
        };
        self.applied.insert(applied.op_id, self.log.len());
        self.log.push(applied.clone());
        Ok(applied)
    }

    /// Drop the oldest retained operations so at most `max_entries` remain.
    /// Later submissions whose origin predates the new baseline are rejected
    /// as stale, forcing a resync instead of an unbounded transform log.
    pub fn prune(&mut self, max_entries: usize) {
        if self.log.len() <= max_entries {
            return;
        }
        let excess = self.log.len() - max_entries;
        for old in self.log.drain(..excess) {
            self.applied.remove(&old.op_id);
        }
        self.baseline += excess as u64;
        for idx in self.applied.values_mut() {
            *idx -= excess;
        }
    }

    /// Content length as of the revision `log[first]` was applied against,
    /// reconstructed by undoing the length deltas of later operations.
    fn len_at(&self, first: usize) -> usize {
        let mut len = self.state.char_len();
        for applied in &self.log[first..] {
            match &applied.payload {
                CanonicalPayload::Insert { text, .. } => len -= text.chars().count(),
                CanonicalPayload::Delete { ranges } => {
                    len += ranges.iter().map(|&(_, l)| l).sum::<usize>();
                }
                CanonicalPayload::Format { .. } => {}
            }
        }
        len
    }

    /// Bounds check against the document as the submitter saw it. Indices in
    /// a payload are relative to the origin revision, not the current one.
    /// Range ends are computed with checked arithmetic; indices are
    /// client-supplied and must never be able to panic the engine.
    fn validate(&self, payload: &OpPayload, len: usize) -> Result<(), EngineError> {
        match payload {
            OpPayload::Insert { index, .. } => {
                if *index > len {
                    return Err(EngineError::Malformed(format!(
                        "insert index {index} out of bounds (len {len})"
                    )));
                }
                Ok(())
            }
            OpPayload::Delete { index, len: dlen } => match index.checked_add(*dlen) {
                Some(end) if end <= len => Ok(()),
                _ => Err(EngineError::Malformed(format!(
                    "delete range {index}+{dlen} out of bounds (len {len})"
                ))),
            },
            OpPayload::Format { index, len: flen, .. } => match index.checked_add(*flen) {
                Some(end) if end <= len => Ok(()),
                _ => Err(EngineError::Malformed(format!(
                    "format range {index}+{flen} out of bounds (len {len})"
                ))),
            },
        }
    }
}

fn canonical_of(payload: OpPayload) -> CanonicalPayload {
    match payload {
        OpPayload::Insert { index, text } => CanonicalPayload::Insert { index, text },
        OpPayload::Delete { index, len } => CanonicalPayload::Delete {
            ranges: if len == 0 { Vec::new() } else { vec![(index, len)] },
        },
        OpPayload::Format { index, len, style } => CanonicalPayload::Format {
            ranges: if len == 0 { Vec::new() } else { vec![(index, len)] },
            style,
        },
    }
}

/// Transform `b` (incoming) against `a` (already applied), adjusting `b`'s
/// positions so it can apply after `a`.
fn transform(b: &mut CanonicalPayload, a: &CanonicalPayload, a_pid: UserId, b_pid: UserId) {
    match a {
        CanonicalPayload::Insert { index: ai, text } => {
            let alen = text.chars().count();
            if alen == 0 {
                return;
            }
            match b {
                CanonicalPayload::Insert { index, .. } => {
                    // Same-index tie: lower participant id keeps the left
                    // position.
                    if *index > *ai || (*index == *ai && a_pid < b_pid) {
                        *index += alen;
                    }
                }
                CanonicalPayload::Delete { ranges } | CanonicalPayload::Format { ranges, .. } => {
                    split_ranges_for_insert(ranges, *ai, alen);
                }
            }
        }
        CanonicalPayload::Delete { ranges: a_ranges } => match b {
            CanonicalPayload::Insert { index, .. } => {
                *index = map_through_delete(*index, a_ranges);
            }
            CanonicalPayload::Delete { ranges } | CanonicalPayload::Format { ranges, .. } => {
                map_ranges_through_delete(ranges, a_ranges);
            }
        },
        // Formats never move positions.
        CanonicalPayload::Format { .. } => {}
    }
}

/// Shift/split ranges around an insert of `alen` chars at `ai`. An insert
/// landing strictly inside a range splits it so the inserted text is left
/// untouched by the delete (and unstyled by the format).
fn split_ranges_for_insert(ranges: &mut Vec<(usize, usize)>, ai: usize, alen: usize) {
    let mut out = Vec::with_capacity(ranges.len() + 1);
    for &(s, len) in ranges.iter() {
        let e = s + len;
        if ai <= s {
            out.push((s + alen, len));
        } else if ai < e {
            out.push((s, ai - s));
            out.push((ai + alen, e - ai));
        } else {
            out.push((s, len));
        }
    }
    *ranges = out;
}

/// Position `p` mapped through a set of deleted ranges: shifted left by the
/// chars deleted before it; positions inside a deleted range collapse to its
/// start.
fn map_through_delete(p: usize, a_ranges: &[(usize, usize)]) -> usize {
    let deleted_before: usize = a_ranges
        .iter()
        .map(|&(s, len)| len.min(p.saturating_sub(s)))
        .sum();
    p - deleted_before
}

fn map_ranges_through_delete(ranges: &mut Vec<(usize, usize)>, a_ranges: &[(usize, usize)]) {
    let mut out = Vec::with_capacity(ranges.len());
    for &(s, len) in ranges.iter() {
        let s2 = map_through_delete(s, a_ranges);
        let e2 = map_through_delete(s + len, a_ranges);
        if e2 > s2 {
            out.push((s2, e2 - s2));
        }
    }
    *ranges = out;
}

/// Apply a canonical operation to the state. Infallible by construction:
/// transformed positions are always in bounds.
fn apply(state: &mut DocumentState, canon: &CanonicalPayload) {
    match canon {
        CanonicalPayload::Insert { index, text } => {
            let tlen = text.chars().count();
            if tlen == 0 {
                return;
            }
            let byte = char_to_byte(&state.content, *index);
            state.content.insert_str(byte, text);

            // Spans at or after the insert point shift; a span the insert
            // lands inside splits (inserted text carries no style).
            let mut spans = Vec::with_capacity(state.spans.len() + 1);
            for &span in &state.spans {
                let ss = span.start;
                let se = ss + span.len;
                if ss >= *index {
                    spans.push(FormatSpan { start: ss + tlen, ..span });
                } else if se > *index {
                    spans.push(FormatSpan { start: ss, len: *index - ss, style: span.style });
                    spans.push(FormatSpan {
                        start: *index + tlen,
                        len: se - *index,
                        style: span.style,
                    });
                } else {
                    spans.push(span);
                }
            }
            state.spans = spans;
            normalize_spans(&mut state.spans);
        }
        CanonicalPayload::Delete { ranges } => {
            // Right-to-left so earlier ranges keep their positions.
            for &(s, len) in ranges.iter().rev() {
                let b1 = char_to_byte(&state.content, s);
                let b2 = char_to_byte(&state.content, s + len);
                state.content.replace_range(b1..b2, "");
                let e = s + len;
                for span in &mut state.spans {
                    let ss = span.start;
                    let se = span.start + span.len;
                    if se <= s {
                        continue;
                    }
                    if ss >= e {
                        span.start -= len;
                        continue;
                    }
                    let overlap = se.min(e) - ss.max(s);
                    span.start = ss.min(s);
                    span.len -= overlap;
                }
            }
            normalize_spans(&mut state.spans);
        }
        CanonicalPayload::Format { ranges, style } => {
            for &(start, len) in ranges {
                state.spans.push(FormatSpan { start, len, style: *style });
            }
            normalize_spans(&mut state.spans);
        }
    }
}

/// Canonical span form: per style merged and disjoint, whole list sorted by
/// (start, style). Keeps replicas byte-identical regardless of apply order.
fn normalize_spans(spans: &mut Vec<FormatSpan>) {
    spans.retain(|s| s.len > 0);
    spans.sort_by_key(|s| (s.style, s.start));
    let mut out: Vec<FormatSpan> = Vec::with_capacity(spans.len());
    for &span in spans.iter() {
        if let Some(last) = out.last_mut() {
            if last.style == span.style && span.start <= last.start + last.len {
                let end = (span.start + span.len).max(last.start + last.len);
                last.len = end - last.start;
                continue;
            }
        }
        out.push(span);
    }
    out.sort_by_key(|s| (s.start, s.style, s.len));
    *spans = out;
}

fn char_to_byte(s: &str, char_idx: usize) -> usize {
    s.char_indices()
        .nth(char_idx)
        .map(|(b, _)| b)
        .unwrap_or(s.len())
}

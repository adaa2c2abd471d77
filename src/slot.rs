//! One in-flight HTTP transfer
//!
//! A slot binds a mirror to a contiguous piece run and streams the response
//! body into the job's file at computed offsets. Two protocol wrinkles live
//! here:
//!
//! - **Range refusal.** A server may answer a `Range` request with a plain
//!   200 and the full body. The first body bytes seen without a validated
//!   `Content-Range` latch the job into single-writer mode: the latching
//!   slot writes the body linearly from offset 0 and every other slot's
//!   bytes are silently discarded so their transfers drain without error.
//! - **Conditional GET.** A single-shot transfer with no expected digest
//!   and a known local mtime sends `If-Modified-Since`; a 304 means the
//!   file on disk is already current.

use crate::error::{DownloadError, NetworkErrorKind, ProtocolErrorKind, Result};
use crate::piece_file::PieceFile;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use reqwest::{Client, StatusCode};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// State shared between a job's slots and the engine
pub(crate) struct JobShared {
    pub file: Mutex<PieceFile>,
    /// Slot id holding the single-writer latch; 0 = no latch
    pub single_writer: AtomicU64,
    /// Bytes received across all of the job's transfers
    pub downloaded: AtomicU64,
}

impl JobShared {
    pub fn new(file: PieceFile) -> Self {
        Self {
            file: Mutex::new(file),
            single_writer: AtomicU64::new(0),
            downloaded: AtomicU64::new(0),
        }
    }

    pub fn latched_writer(&self) -> Option<u64> {
        match self.single_writer.load(Ordering::Acquire) {
            0 => None,
            id => Some(id),
        }
    }

    pub fn release_latch(&self) {
        self.single_writer.store(0, Ordering::Release);
    }
}

/// Addressing and request parameters for one transfer
#[derive(Debug, Clone)]
pub(crate) struct TransferSlot {
    /// Non-zero; 0 is the unset-latch sentinel
    pub slot_id: u64,
    pub job_idx: usize,
    pub mirror_idx: usize,
    pub url: String,
    /// First piece of the contiguous run; `None` for single-shot transfers
    pub start_piece: Option<u32>,
    pub piece_range: Vec<u32>,
    /// Absolute byte offset where the run starts
    pub range_start: u64,
    /// Byte size of the run; 0 when the total size is unknown
    pub expected_bytes: u64,
    /// The run covers the entire file, so no `Range` header is sent
    pub whole_file: bool,
    pub if_modified_since: Option<SystemTime>,
}

/// What a finished transfer reported back to the engine
pub(crate) enum TransferOutcome {
    Completed {
        bytes: u64,
        /// Observed rate in bytes/sec
        speed: f64,
        last_modified: Option<SystemTime>,
        /// The body was written linearly from offset 0 under the latch
        wrote_linear: bool,
        /// Bytes were thrown away because another slot holds the latch
        discarded: bool,
    },
    /// 304 answer to a conditional GET
    NotModified { last_modified: Option<SystemTime> },
    Failed(DownloadError),
}

pub(crate) struct SlotResult {
    pub slot: TransferSlot,
    pub outcome: TransferOutcome,
}

/// Drive one transfer to completion. Never panics; all failures are folded
/// into the outcome so the engine can rotate mirrors.
pub(crate) async fn run_transfer(
    slot: TransferSlot,
    client: Client,
    user_agent: String,
    shared: Arc<JobShared>,
    cancel: CancellationToken,
) -> SlotResult {
    let outcome = match perform(&slot, &client, &user_agent, &shared, &cancel).await {
        Ok(outcome) => outcome,
        Err(err) => TransferOutcome::Failed(err),
    };
    SlotResult { slot, outcome }
}

async fn perform(
    slot: &TransferSlot,
    client: &Client,
    user_agent: &str,
    shared: &JobShared,
    cancel: &CancellationToken,
) -> Result<TransferOutcome> {
    let mut request = client.get(&slot.url).header("User-Agent", user_agent);

    let ranged = slot.start_piece.is_some() && !slot.whole_file;
    // A run covering the whole file needs no Range header; the full body is
    // exactly what we want, so the range handshake is treated as settled.
    let mut got_ranges = !ranged;

    if ranged {
        let end = slot.range_start + slot.expected_bytes - 1;
        request = request.header("Range", range_header(slot.range_start, end));
    }
    if let Some(mtime) = slot.if_modified_since {
        request = request.header("If-Modified-Since", format_http_date(mtime));
    }

    let response = request.send().await?;
    let status = response.status();
    let last_modified = response
        .headers()
        .get("last-modified")
        .and_then(|v| v.to_str().ok())
        .and_then(parse_http_date);

    if status == StatusCode::NOT_MODIFIED && slot.if_modified_since.is_some() {
        return Ok(TransferOutcome::NotModified { last_modified });
    }
    if !status.is_success() {
        return Err(DownloadError::network(
            NetworkErrorKind::HttpStatus(status.as_u16()),
            format!("HTTP error: {status}"),
        ));
    }

    if ranged && status == StatusCode::PARTIAL_CONTENT {
        if let Some(value) = response
            .headers()
            .get("content-range")
            .and_then(|v| v.to_str().ok())
        {
            let (start, end, _) = parse_content_range(value).ok_or_else(|| {
                DownloadError::protocol(
                    ProtocolErrorKind::InvalidResponse,
                    format!("unparseable Content-Range: {value}"),
                )
            })?;
            let covered = end.saturating_sub(start) + 1;
            if covered != slot.expected_bytes {
                return Err(DownloadError::protocol(
                    ProtocolErrorKind::RangeMismatch,
                    format!(
                        "server range {start}-{end} covers {covered} bytes, expected {}",
                        slot.expected_bytes
                    ),
                ));
            }
            got_ranges = true;
        }
    }

    let started = Instant::now();
    let file_size = shared.file.lock().await.size();
    let mut stream = response.bytes_stream();
    let mut received: u64 = 0;
    let mut wrote_linear = false;
    let mut discarding = false;

    while let Some(next) = tokio::select! {
        chunk = stream.next() => chunk,
        _ = cancel.cancelled() => return Err(DownloadError::Aborted),
    } {
        let chunk: Bytes = next.map_err(|e| {
            DownloadError::network(
                NetworkErrorKind::ConnectionReset,
                format!("Stream error: {e}"),
            )
        })?;

        if !got_ranges {
            // Full body instead of 206: the first slot to get here becomes
            // the only writer for the job.
            if shared
                .single_writer
                .compare_exchange(0, slot.slot_id, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                tracing::info!(mirror = %slot.url, "server refused ranges, degrading to a single source");
            }
            got_ranges = true;
        }

        // A slot that has discarded once keeps discarding: its byte
        // accounting no longer lines up with any file offset.
        let writer = shared.single_writer.load(Ordering::Acquire);
        if discarding || (writer != 0 && writer != slot.slot_id) {
            discarding = true;
        } else if writer == slot.slot_id {
            // The body must not overrun the file; a server lying about its
            // length is not allowed to write past other slots' pieces.
            if file_size > 0 && received + chunk.len() as u64 > file_size {
                return Err(overlong_body(received, chunk.len(), file_size));
            }
            let mut file = shared.file.lock().await;
            file.write_at(&chunk, received).await?;
            wrote_linear = true;
        } else {
            if slot.expected_bytes > 0 && received + chunk.len() as u64 > slot.expected_bytes {
                return Err(overlong_body(received, chunk.len(), slot.expected_bytes));
            }
            let mut file = shared.file.lock().await;
            file.write_at(&chunk, slot.range_start + received).await?;
        }

        received += chunk.len() as u64;
        shared.downloaded.fetch_add(chunk.len() as u64, Ordering::Relaxed);
    }

    let elapsed = started.elapsed().as_secs_f64();
    let speed = if elapsed > 0.0 {
        received as f64 / elapsed
    } else {
        0.0
    };

    if !discarding {
        let expected = if wrote_linear {
            shared.file.lock().await.size()
        } else {
            slot.expected_bytes
        };
        if expected > 0 && received < expected {
            return Err(DownloadError::network(
                NetworkErrorKind::Truncated,
                format!("body ended after {received} of {expected} bytes"),
            ));
        }
    }

    Ok(TransferOutcome::Completed {
        bytes: received,
        speed,
        last_modified,
        wrote_linear,
        discarded: discarding,
    })
}

fn overlong_body(received: u64, chunk: usize, bound: u64) -> DownloadError {
    DownloadError::protocol(
        ProtocolErrorKind::InvalidResponse,
        format!("body exceeds expected size: {received}+{chunk} > {bound}"),
    )
}

/// Format an inclusive byte range for the `Range` header
pub(crate) fn range_header(start: u64, end: u64) -> String {
    format!("bytes={start}-{end}")
}

/// Parse a `Content-Range` header: `bytes start-end/total` or `bytes start-end/*`
pub(crate) fn parse_content_range(header: &str) -> Option<(u64, u64, Option<u64>)> {
    let rest = header.strip_prefix("bytes ")?;
    let (range, total) = rest.split_once('/')?;
    let (start, end) = range.split_once('-')?;

    let start = start.trim().parse::<u64>().ok()?;
    let end = end.trim().parse::<u64>().ok()?;
    if end < start {
        return None;
    }
    let total = if total.trim() == "*" {
        None
    } else {
        Some(total.trim().parse::<u64>().ok()?)
    };
    Some((start, end, total))
}

/// Format a `SystemTime` as an RFC 7231 HTTP date
pub(crate) fn format_http_date(when: SystemTime) -> String {
    DateTime::<Utc>::from(when)
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string()
}

/// Parse an HTTP date (`Last-Modified`, `Date`)
pub(crate) fn parse_http_date(value: &str) -> Option<SystemTime> {
    DateTime::parse_from_rfc2822(value)
        .ok()
        .map(SystemTime::from)
}

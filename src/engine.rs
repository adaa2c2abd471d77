//! Download engine
//!
//! The engine drives every job's transfers from a single control loop.
//! Slots run as spawned tasks collected in a [`JoinSet`]; their completions
//! are drained one at a time, so piece state, mirror health, and
//! verification all mutate on one task, with the shared file handle as the
//! only lock.
//!
//! Per job the loop: claims a contiguous run of pending pieces (verifying
//! any bytes already on disk), binds the run to the fastest usable mirror,
//! streams it, verifies each finished piece against its SHA-1, and rotates
//! to another mirror whenever a transfer fails or serves corrupt data. A
//! job ends when every piece is verified, when its whole-file digest
//! matches, or when no usable mirror remains.

use crate::config::EngineConfig;
use crate::digest::DigestAlgorithm;
use crate::error::{DownloadError, Result};
use crate::job::{DownloadJob, JobState, PieceState};
use crate::mirror::{fastest_mirror, MirrorStatus};
use crate::piece_file::PieceFile;
use crate::slot::{run_transfer, JobShared, SlotResult, TransferOutcome, TransferSlot};

use parking_lot::RwLock;
use reqwest::Client;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Readiness-wait bound: progress and cancellation are observed at least
/// once a second even while every transfer is mid-stream.
const TICK_INTERVAL: Duration = Duration::from_secs(1);

type SlotFuture = Pin<Box<dyn Future<Output = SlotResult> + Send>>;

/// Progress callback: (bytes done, bytes total) across all jobs
pub type ProgressListener = Arc<dyn Fn(u64, u64) + Send + Sync>;

/// Per-job state the engine keeps while a run is active
struct JobCtx {
    shared: Arc<JobShared>,
    active_slots: usize,
    /// File mtime when the engine opened it
    entry_mtime: Option<SystemTime>,
    /// Last-Modified reported by the server, applied on success
    last_modified: Option<SystemTime>,
    /// A linear whole-body transfer finished; verify in the post-pass
    whole_pending: bool,
    /// Mirror that served the whole-body transfer, for verification feedback
    whole_writer_mirror: Option<usize>,
    /// Job degraded to a single source after a range refusal
    latched: bool,
}

impl JobCtx {
    fn new(file: PieceFile) -> Self {
        let entry_mtime = file.timestamp();
        Self {
            shared: Arc::new(JobShared::new(file)),
            active_slots: 0,
            entry_mtime,
            last_modified: None,
            whole_pending: false,
            whole_writer_mirror: None,
            latched: false,
        }
    }
}

/// The multiplexing download driver
pub struct DownloadEngine {
    config: EngineConfig,
    /// Client with TLS peer verification
    strict_client: Client,
    /// Client accepting invalid certificates, for jobs that opt out
    lax_client: Client,
    cancel: CancellationToken,
    progress: RwLock<Option<ProgressListener>>,
}

impl DownloadEngine {
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let strict_client = build_client(&config, false)?;
        let lax_client = build_client(&config, true)?;
        Ok(Self {
            config,
            strict_client,
            lax_client,
            cancel: CancellationToken::new(),
            progress: RwLock::new(None),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Token observed by every transfer; cancelling it aborts the run
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancel all in-flight and future transfers
    pub fn abort(&self) {
        self.cancel.cancel();
    }

    /// Install a progress callback, invoked roughly once a second
    pub fn set_progress_listener<F>(&self, listener: F)
    where
        F: Fn(u64, u64) + Send + Sync + 'static,
    {
        *self.progress.write() = Some(Arc::new(listener));
    }

    /// Client used for metadata requests
    pub(crate) fn http_client(&self) -> &Client {
        &self.strict_client
    }

    fn client_for(&self, validate_tls: bool) -> &Client {
        if validate_tls {
            &self.strict_client
        } else {
            &self.lax_client
        }
    }

    /// Run every job to completion or failure.
    ///
    /// Returns `Ok(true)` when all jobs finished, `Ok(false)` when some did
    /// not (failed, out of mirrors, or the run was aborted). Job state and
    /// piece state are left behind for inspection either way.
    pub async fn download(&self, jobs: &mut [DownloadJob]) -> Result<bool> {
        let mut ctxs: Vec<Option<JobCtx>> = Vec::with_capacity(jobs.len());
        let mut next_slot_id: u64 = 1;

        for job in jobs.iter_mut() {
            if job.is_finished() {
                ctxs.push(None);
                continue;
            }
            if job.usable_mirror_count() == 0 {
                tracing::warn!(name = %job.name, "no mirrors, failing job");
                job.state = JobState::Failed;
                ctxs.push(None);
                continue;
            }
            if !job.pieces.is_empty() && (job.size == 0 || job.piece_size == 0) {
                tracing::warn!(name = %job.name, "piece metadata without sizes, failing job");
                job.state = JobState::Failed;
                ctxs.push(None);
                continue;
            }
            job.state = JobState::Running;
            job.parallelism = effective_parallelism(
                self.config.max_parallel,
                job.pieces.len(),
                job.usable_mirror_count(),
            );
            tracing::debug!(name = %job.name, parallelism = job.parallelism, "job admitted");

            match PieceFile::open(&job.path, job.size, job.piece_size).await {
                Ok(file) => ctxs.push(Some(JobCtx::new(file))),
                Err(err) => {
                    tracing::error!(name = %job.name, error = %err, "cannot open target file");
                    job.state = JobState::Failed;
                    ctxs.push(None);
                }
            }
        }

        let mut transfers: JoinSet<SlotResult> = JoinSet::new();
        for job_idx in 0..jobs.len() {
            if ctxs[job_idx].is_none() {
                continue;
            }
            let parallelism = jobs[job_idx].parallelism;
            for _ in 0..parallelism {
                if let Some(fut) = self
                    .setup_slot(job_idx, jobs, &mut ctxs, &mut next_slot_id)
                    .await
                {
                    transfers.spawn(fut);
                }
            }
        }

        if transfers.is_empty() {
            tracing::debug!("nothing to download");
        }

        let mut aborted = false;
        let mut tick = tokio::time::interval(TICK_INTERVAL);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while !transfers.is_empty() {
            tokio::select! {
                Some(joined) = transfers.join_next() => {
                    let result = match joined {
                        Ok(result) => result,
                        Err(err) => {
                            tracing::error!(error = %err, "transfer task died");
                            continue;
                        }
                    };
                    if matches!(result.outcome, TransferOutcome::Failed(DownloadError::Aborted)) {
                        aborted = true;
                    }
                    if let Some(fut) = self
                        .handle_completion(result, jobs, &mut ctxs, &mut next_slot_id)
                        .await
                    {
                        transfers.spawn(fut);
                    }
                }
                _ = self.cancel.cancelled() => {
                    aborted = true;
                    break;
                }
                _ = tick.tick() => {
                    self.report_progress(jobs, &ctxs);
                }
            }
        }
        // Tear down anything still in flight (abort path) before the files
        // are flushed and closed.
        transfers.shutdown().await;

        if !aborted {
            self.whole_file_post_pass(jobs, &mut ctxs).await;
        }
        self.cleanup(jobs, &mut ctxs).await;
        self.report_progress(jobs, &ctxs);

        let all_finished = jobs.iter().all(|j| j.is_finished());
        if aborted {
            tracing::warn!("download run aborted");
        } else if all_finished {
            tracing::debug!("download run complete");
        }
        Ok(!aborted && all_finished)
    }

    /// Claim the next piece run for a job and turn it into a transfer
    /// future. `None` means there is no work for another slot right now:
    /// the job finished, failed, degraded to a single writer, or every
    /// remaining piece is owned by other slots.
    async fn setup_slot(
        &self,
        job_idx: usize,
        jobs: &mut [DownloadJob],
        ctxs: &mut [Option<JobCtx>],
        next_slot_id: &mut u64,
    ) -> Option<SlotFuture> {
        let job = &mut jobs[job_idx];
        let ctx = ctxs[job_idx].as_mut()?;
        if job.state != JobState::Running || ctx.latched {
            return None;
        }

        let run = match claim_piece_run(&ctx.shared, job).await {
            Ok(run) => run,
            Err(err) => {
                tracing::error!(name = %job.name, error = %err, "piece verification failed");
                job.state = JobState::Failed;
                return None;
            }
        };
        if job.state != JobState::Running {
            return None;
        }

        let single_shot = job.pieces.is_empty();
        if !single_shot && run.is_empty() {
            return None;
        }
        if single_shot && (ctx.active_slots > 0 || ctx.whole_pending) {
            return None;
        }

        let Some(mirror_idx) = fastest_mirror(&job.mirrors) else {
            tracing::error!(name = %job.name, "no usable mirror left");
            if ctx.active_slots == 0 {
                job.state = JobState::Failed;
            }
            return None;
        };

        for &i in &run {
            job.pieces[i as usize].state = PieceState::Downloading;
        }

        let (start_piece, range_start, expected_bytes, whole_file) = if single_shot {
            (None, 0, job.size, true)
        } else {
            let expected = ctx.shared.file.lock().await.range_byte_size(&run);
            (
                Some(run[0]),
                run[0] as u64 * job.piece_size,
                expected,
                run.len() == job.pieces.len(),
            )
        };

        // Timestamp-gated fetch only makes sense when there is nothing
        // stronger to verify against and a previous file exists.
        let if_modified_since = if single_shot && job.digest.is_none() {
            let file = ctx.shared.file.lock().await;
            if file.is_new() {
                None
            } else {
                file.timestamp()
            }
        } else {
            None
        };

        let slot_id = *next_slot_id;
        *next_slot_id += 1;

        let slot = TransferSlot {
            slot_id,
            job_idx,
            mirror_idx,
            url: job.mirrors[mirror_idx].url.clone(),
            start_piece,
            piece_range: run,
            range_start,
            expected_bytes,
            whole_file,
            if_modified_since,
        };
        tracing::debug!(
            name = %job.name,
            mirror = %slot.url,
            pieces = ?slot.piece_range,
            "starting transfer"
        );

        ctx.active_slots += 1;
        let client = self.client_for(job.validate_tls).clone();
        Some(Box::pin(run_transfer(
            slot,
            client,
            self.config.http.user_agent.clone(),
            Arc::clone(&ctx.shared),
            self.cancel.clone(),
        )))
    }

    /// Digest verification, mirror feedback, and slot replacement for one
    /// finished transfer. Returns the follow-up transfer, if any.
    async fn handle_completion(
        &self,
        result: SlotResult,
        jobs: &mut [DownloadJob],
        ctxs: &mut [Option<JobCtx>],
        next_slot_id: &mut u64,
    ) -> Option<SlotFuture> {
        let SlotResult { slot, outcome } = result;
        let job_idx = slot.job_idx;
        let mut respawn = false;
        {
            let job = &mut jobs[job_idx];
            let ctx = ctxs[job_idx].as_mut()?;
            ctx.active_slots = ctx.active_slots.saturating_sub(1);

            match outcome {
                TransferOutcome::Failed(DownloadError::Aborted) => {
                    revert_downloading(job, &slot.piece_range);
                }
                TransferOutcome::Failed(err) => {
                    tracing::error!(
                        name = %job.name,
                        mirror = %slot.url,
                        error = %err,
                        "transfer failed"
                    );
                    revert_downloading(job, &slot.piece_range);
                    if err.is_mirror_recoverable() {
                        job.mirrors[slot.mirror_idx].status = MirrorStatus::Broken;
                    } else {
                        // disk trouble is not the mirror's fault and not
                        // recoverable for this job
                        job.state = JobState::Failed;
                    }
                    if ctx.shared.latched_writer() == Some(slot.slot_id) {
                        // the degraded-mode writer died; allow a retry to
                        // latch again
                        ctx.shared.release_latch();
                        ctx.latched = false;
                    }
                    respawn = job.state == JobState::Running;
                }
                TransferOutcome::NotModified { last_modified } => {
                    tracing::info!(name = %job.name, "not modified, file is up to date");
                    if last_modified.is_some() {
                        ctx.last_modified = last_modified;
                    }
                    job.state = JobState::Finished;
                }
                TransferOutcome::Completed {
                    bytes,
                    speed,
                    last_modified,
                    wrote_linear,
                    discarded,
                } => {
                    if last_modified.is_some() {
                        ctx.last_modified = last_modified;
                    }
                    let latch = ctx.shared.latched_writer();

                    if discarded || (latch.is_some() && latch != Some(slot.slot_id)) {
                        // Extraneous transfer drained while another slot
                        // holds the single-writer latch.
                        revert_downloading(job, &slot.piece_range);
                        ctx.latched = true;
                    } else if wrote_linear || slot.start_piece.is_none() {
                        if slot.start_piece.is_none() && job.size == 0 {
                            // unknown-size body over a possibly longer file
                            if let Err(err) = ctx.shared.file.lock().await.set_len(bytes).await {
                                tracing::error!(name = %job.name, error = %err, "truncate failed");
                                job.state = JobState::Failed;
                            }
                        }
                        if latch == Some(slot.slot_id) {
                            ctx.latched = true;
                        }
                        if job.state == JobState::Running {
                            ctx.whole_pending = true;
                            ctx.whole_writer_mirror = Some(slot.mirror_idx);
                        }
                        let mirror = &mut job.mirrors[slot.mirror_idx];
                        mirror.update_speed(speed);
                        if mirror.status == MirrorStatus::Unknown {
                            mirror.status = MirrorStatus::Ok;
                        }
                    } else {
                        self.verify_piece_run(job, ctx, &slot).await;
                        let mirror = &mut job.mirrors[slot.mirror_idx];
                        mirror.update_speed(speed);
                        if mirror.status == MirrorStatus::Unknown {
                            mirror.status = MirrorStatus::Ok;
                        }
                        respawn = job.state == JobState::Running;
                    }
                }
            }
        }

        if respawn {
            self.setup_slot(job_idx, jobs, ctxs, next_slot_id).await
        } else {
            None
        }
    }

    /// Check each piece of a finished run against its expected SHA-1
    async fn verify_piece_run(&self, job: &mut DownloadJob, ctx: &mut JobCtx, slot: &TransferSlot) {
        let mut file = ctx.shared.file.lock().await;
        for &index in &slot.piece_range {
            let expected = match job.pieces[index as usize].sha1.clone() {
                Some(d) => d,
                None => {
                    tracing::warn!(piece = index, "no piece digest, accepting unverified");
                    job.pieces[index as usize].state = PieceState::Finished;
                    continue;
                }
            };
            match file.hash_piece(DigestAlgorithm::Sha1, index).await {
                Ok(got) if got.matches(&expected) => {
                    job.pieces[index as usize].state = PieceState::Finished;
                }
                Ok(got) => {
                    tracing::warn!(
                        piece = index,
                        mirror = %slot.url,
                        expected = %expected,
                        got = %got,
                        "piece digest mismatch"
                    );
                    job.pieces[index as usize].state = PieceState::Pending;
                    job.mirrors[slot.mirror_idx].status = MirrorStatus::Broken;
                }
                Err(err) => {
                    tracing::error!(name = %job.name, error = %err, "hashing failed");
                    job.state = JobState::Failed;
                    return;
                }
            }
        }
    }

    /// Whole-file verification for single-shot and range-refused jobs
    async fn whole_file_post_pass(&self, jobs: &mut [DownloadJob], ctxs: &mut [Option<JobCtx>]) {
        for (job, ctx) in jobs.iter_mut().zip(ctxs.iter_mut()) {
            let Some(ctx) = ctx.as_mut() else { continue };
            if job.state != JobState::Running {
                continue;
            }
            let needs_whole_check =
                ctx.whole_pending || (job.pieces.is_empty() && job.digest.is_some());
            if !needs_whole_check {
                continue;
            }
            match job.digest.clone() {
                Some(expected) => {
                    let got = ctx
                        .shared
                        .file
                        .lock()
                        .await
                        .hash_whole(expected.algorithm())
                        .await;
                    match got {
                        Ok(got) if got.matches(&expected) => {
                            tracing::info!(name = %job.name, digest = %got, "whole-file digest verified");
                            finish_all_pieces(job);
                        }
                        Ok(got) => {
                            tracing::error!(
                                name = %job.name,
                                expected = %expected,
                                got = %got,
                                "whole-file digest mismatch"
                            );
                            job.state = JobState::Failed;
                        }
                        Err(err) => {
                            tracing::error!(name = %job.name, error = %err, "hashing failed");
                            job.state = JobState::Failed;
                        }
                    }
                }
                None if ctx.whole_pending => {
                    if job.pieces.is_empty() {
                        // nothing to verify against; the stored body is the result
                        job.state = JobState::Finished;
                    } else {
                        // no whole-file digest: the linear body must still
                        // satisfy the per-piece digests
                        match verify_stored_pieces(&ctx.shared, job).await {
                            Ok(true) => job.state = JobState::Finished,
                            Ok(false) => {
                                // mismatched pieces went back to the pool;
                                // the job fails this run and re-fetches next
                                if let Some(mirror_idx) = ctx.whole_writer_mirror {
                                    job.mirrors[mirror_idx].status = MirrorStatus::Broken;
                                }
                            }
                            Err(err) => {
                                tracing::error!(name = %job.name, error = %err, "hashing failed");
                                job.state = JobState::Failed;
                            }
                        }
                    }
                }
                None => {}
            }
        }
    }

    /// Close every file exactly once and fix up mtimes: server time for
    /// finished jobs, one second into the past for everything else so the
    /// next run re-fetches.
    async fn cleanup(&self, jobs: &mut [DownloadJob], ctxs: &mut [Option<JobCtx>]) {
        for (job, ctx_slot) in jobs.iter_mut().zip(ctxs.iter_mut()) {
            let Some(ctx) = ctx_slot.take() else { continue };
            {
                let mut file = ctx.shared.file.lock().await;
                if let Err(err) = file.flush().await {
                    tracing::warn!(name = %job.name, error = %err, "flush on close failed");
                }
                if job.is_finished() {
                    if let Some(server_time) = ctx.last_modified {
                        let _ = file.set_timestamp(server_time);
                    }
                } else {
                    if job.state == JobState::Running {
                        job.state = JobState::Failed;
                    }
                    // pieces still claimed by torn-down slots go back to the pool
                    for piece in &mut job.pieces {
                        if piece.state == PieceState::Downloading {
                            piece.state = PieceState::Pending;
                        }
                    }
                    let _ = file.rewind_timestamp(ctx.entry_mtime);
                }
            }
            drop(ctx);
        }
    }

    fn report_progress(&self, jobs: &[DownloadJob], ctxs: &[Option<JobCtx>]) {
        let mut done: u64 = 0;
        let mut total: u64 = 0;
        for (job, ctx) in jobs.iter().zip(ctxs.iter()) {
            total += job.size;
            let job_done = match ctx {
                Some(ctx) => {
                    let received = ctx.shared.downloaded.load(std::sync::atomic::Ordering::Relaxed);
                    if job.size > 0 {
                        received.min(job.size)
                    } else {
                        received
                    }
                }
                None => job.finished_bytes(),
            };
            done += job_done;
        }
        tracing::debug!(done, total, "progress");
        let listener = self.progress.read().clone();
        if let Some(listener) = listener {
            listener(done, total);
        }
    }
}

/// `clamp(requested, 1, min(pieces, usable mirrors))`; piece-less jobs are
/// single transfers
fn effective_parallelism(max_parallel: u32, piece_count: usize, usable_mirrors: usize) -> u32 {
    let bound = piece_count.min(usable_mirrors).max(1) as u32;
    max_parallel.min(bound).max(1)
}

fn build_client(config: &EngineConfig, accept_invalid_certs: bool) -> Result<Client> {
    Client::builder()
        .connect_timeout(Duration::from_secs(config.http.connect_timeout))
        .read_timeout(Duration::from_secs(config.http.read_timeout))
        .redirect(reqwest::redirect::Policy::limited(config.http.max_redirects))
        .danger_accept_invalid_certs(accept_invalid_certs)
        .build()
        .map_err(|e| DownloadError::Internal(format!("Failed to create HTTP client: {e}")))
}

/// Give claimed-but-unfinished pieces back to the pool
fn revert_downloading(job: &mut DownloadJob, pieces: &[u32]) {
    for &i in pieces {
        let piece = &mut job.pieces[i as usize];
        if piece.state == PieceState::Downloading {
            piece.state = PieceState::Pending;
        }
    }
}

fn finish_all_pieces(job: &mut DownloadJob) {
    for piece in &mut job.pieces {
        piece.state = PieceState::Finished;
    }
    job.state = JobState::Finished;
}

/// Check a stored whole-file body against the per-piece digests.
///
/// Pieces carrying an expected SHA-1 are hashed in place; pieces without
/// one count as part of the whole transfer. Mismatched pieces go back to
/// pending. Returns whether every piece passed.
async fn verify_stored_pieces(shared: &JobShared, job: &mut DownloadJob) -> Result<bool> {
    let mut file = shared.file.lock().await;
    let mut all_ok = true;
    for index in 0..job.pieces.len() {
        let Some(expected) = job.pieces[index].sha1.clone() else {
            job.pieces[index].state = PieceState::Finished;
            continue;
        };
        let got = file.hash_piece(DigestAlgorithm::Sha1, index as u32).await?;
        if got.matches(&expected) {
            job.pieces[index].state = PieceState::Finished;
        } else {
            tracing::warn!(
                name = %job.name,
                piece = index,
                expected = %expected,
                got = %got,
                "stored piece digest mismatch"
            );
            job.pieces[index].state = PieceState::Pending;
            all_ok = false;
        }
    }
    Ok(all_ok)
}

/// Select the next contiguous run of pending pieces for one slot,
/// opportunistically verifying bytes already on disk.
///
/// Walks the pieces in order: finished pieces end a started run (one run
/// per slot, contiguous); pending pieces with a digest and a pre-existing
/// file are hashed in place and upgraded when they match; everything else
/// is collected up to the fair share `pieces / parallelism`. An empty walk
/// over a fully verified piece list marks the job finished. Jobs without
/// piece metadata return empty immediately, after a whole-file digest
/// shortcut for files that are already intact on disk.
async fn claim_piece_run(shared: &JobShared, job: &mut DownloadJob) -> Result<Vec<u32>> {
    let mut run: Vec<u32> = Vec::new();
    if job.state != JobState::Running {
        return Ok(run);
    }

    if job.pieces.is_empty() {
        if let Some(expected) = job.digest.clone() {
            let mut file = shared.file.lock().await;
            if !file.is_new() {
                let got = file.hash_whole(expected.algorithm()).await?;
                if got.matches(&expected) {
                    drop(file);
                    tracing::info!(name = %job.name, digest = %got, "file already intact");
                    job.state = JobState::Finished;
                } else {
                    tracing::info!(
                        name = %job.name,
                        expected = %expected,
                        got = %got,
                        "whole-file digest stale, fetching"
                    );
                }
            }
        }
        return Ok(run);
    }

    let share = (job.pieces.len() / job.parallelism.max(1) as usize).max(1);

    for index in 0..job.pieces.len() {
        match job.pieces[index].state {
            PieceState::Finished | PieceState::Downloading => {
                if !run.is_empty() {
                    break;
                }
            }
            PieceState::Pending => {
                let mut upgraded = false;
                if let Some(expected) = job.pieces[index].sha1.clone() {
                    let mut file = shared.file.lock().await;
                    if !file.is_new() {
                        let got = file.hash_piece(DigestAlgorithm::Sha1, index as u32).await?;
                        if got.matches(&expected) {
                            tracing::debug!(piece = index, "on-disk piece already valid, reusing");
                            job.pieces[index].state = PieceState::Finished;
                            upgraded = true;
                        }
                    }
                }
                if upgraded {
                    if !run.is_empty() {
                        break;
                    }
                } else {
                    run.push(index as u32);
                    if run.len() == share {
                        break;
                    }
                }
            }
        }
    }

    if run.is_empty()
        && job
            .pieces
            .iter()
            .all(|p| p.state == PieceState::Finished)
    {
        tracing::debug!(name = %job.name, "all pieces finished");
        job.state = JobState::Finished;
    }
    Ok(run)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::{digest_of, DigestAlgorithm};
    use tempfile::tempdir;

    #[test]
    fn parallelism_clamp() {
        // plenty of pieces and mirrors: requested wins
        assert_eq!(effective_parallelism(4, 10, 10), 4);
        // one mirror caps everything
        assert_eq!(effective_parallelism(4, 10, 1), 1);
        // fewer pieces than mirrors
        assert_eq!(effective_parallelism(8, 3, 5), 3);
        // piece-less single-shot job
        assert_eq!(effective_parallelism(4, 0, 3), 1);
    }

    async fn pieced_job(dir: &std::path::Path, content: &[u8], piece_size: u64) -> (DownloadJob, JobShared) {
        let path = dir.join("artifact.bin");
        std::fs::write(&path, content).unwrap();

        let mut job = DownloadJob::new(&path, "artifact");
        job.size = content.len() as u64;
        let sha1s = content
            .chunks(piece_size as usize)
            .map(|c| Some(digest_of(DigestAlgorithm::Sha1, c)))
            .collect();
        job.set_pieces(piece_size, sha1s);
        job.add_mirror("http://mirror-a/artifact.bin");
        job.parallelism = 1;

        let file = PieceFile::open(&path, job.size, piece_size).await.unwrap();
        (job, JobShared::new(file))
    }

    #[tokio::test]
    async fn claim_upgrades_valid_on_disk_pieces() {
        let dir = tempdir().unwrap();
        let content = vec![9u8; 2500];
        let (mut job, shared) = pieced_job(dir.path(), &content, 1000).await;

        // File pre-exists with matching bytes: everything verifies in place
        let run = claim_piece_run(&shared, &mut job).await.unwrap();
        assert!(run.is_empty());
        assert!(job.is_finished());
        assert_eq!(job.finished_piece_count(), 3);
    }

    #[tokio::test]
    async fn claim_refetches_corrupt_piece_only() {
        let dir = tempdir().unwrap();
        let mut content = vec![9u8; 2500];
        let (mut job, _) = pieced_job(dir.path(), &content, 1000).await;

        // Corrupt the middle piece on disk after digests were taken
        content[1500] ^= 0xff;
        std::fs::write(dir.path().join("artifact.bin"), &content).unwrap();
        let file = PieceFile::open(dir.path().join("artifact.bin"), 2500, 1000)
            .await
            .unwrap();
        let shared = JobShared::new(file);

        let run = claim_piece_run(&shared, &mut job).await.unwrap();
        assert_eq!(run, vec![1]);
        assert_eq!(job.pieces[0].state, PieceState::Finished);
        assert_eq!(job.pieces[2].state, PieceState::Finished);
        assert!(!job.is_finished());
    }

    #[tokio::test]
    async fn claim_respects_fair_share_and_contiguity() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("fresh.bin");
        let mut job = DownloadJob::new(&path, "fresh");
        job.size = 6000;
        job.set_pieces(1000, vec![None; 6]);
        job.add_mirror("http://a");
        job.add_mirror("http://b");
        job.parallelism = 2;

        let file = PieceFile::open(&path, 6000, 1000).await.unwrap();
        let shared = JobShared::new(file);

        // share = 6 / 2 = 3, from the front
        let run = claim_piece_run(&shared, &mut job).await.unwrap();
        assert_eq!(run, vec![0, 1, 2]);
        for &i in &run {
            job.pieces[i as usize].state = PieceState::Downloading;
        }

        // the second slot picks up the rest
        let run = claim_piece_run(&shared, &mut job).await.unwrap();
        assert_eq!(run, vec![3, 4, 5]);
    }

    #[tokio::test]
    async fn claim_run_stops_at_finished_piece() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("gap.bin");
        let mut job = DownloadJob::new(&path, "gap");
        job.size = 5000;
        job.set_pieces(1000, vec![None; 5]);
        job.add_mirror("http://a");
        job.parallelism = 1;
        job.pieces[2].state = PieceState::Finished;

        let file = PieceFile::open(&path, 5000, 1000).await.unwrap();
        let shared = JobShared::new(file);

        // share is 5 but the run must stay contiguous: [0, 1] only
        let run = claim_piece_run(&shared, &mut job).await.unwrap();
        assert_eq!(run, vec![0, 1]);
    }

    #[test]
    fn revert_leaves_finished_pieces_alone() {
        let mut job = DownloadJob::new("/tmp/x", "x");
        job.set_pieces(100, vec![None; 3]);
        job.pieces[0].state = PieceState::Downloading;
        job.pieces[1].state = PieceState::Finished;
        job.pieces[2].state = PieceState::Downloading;

        revert_downloading(&mut job, &[0, 1, 2]);
        assert_eq!(job.pieces[0].state, PieceState::Pending);
        assert_eq!(job.pieces[1].state, PieceState::Finished);
        assert_eq!(job.pieces[2].state, PieceState::Pending);
    }
}

//! Integration tests for armory-dl
//!
//! These tests use wiremock to simulate mirrors and exercise real engine
//! runs: multi-piece range transfers, resumption from partial files,
//! mirror failover, range refusal, conditional GETs, and cancellation.

use armory_dl::digest::{digest_of, Digest, DigestAlgorithm};
use armory_dl::{DownloadEngine, DownloadJob, EngineConfig, JobState, MirrorStatus, PieceState};

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tempfile::TempDir;
use wiremock::matchers::{header, header_exists, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Deterministic pseudo-random content
fn test_content(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i.wrapping_mul(31) % 251) as u8).collect()
}

/// Per-piece SHA-1 digests for `content`
fn piece_sha1s(content: &[u8], piece_size: usize) -> Vec<Option<Digest>> {
    content
        .chunks(piece_size)
        .map(|chunk| Some(digest_of(DigestAlgorithm::Sha1, chunk)))
        .collect()
}

/// Job with piece metadata over `content`
fn pieced_job(dest: &Path, content: &[u8], piece_size: u64, mirrors: &[String]) -> DownloadJob {
    let mut job = DownloadJob::new(dest, "artifact");
    job.size = content.len() as u64;
    job.set_pieces(piece_size, piece_sha1s(content, piece_size as usize));
    for url in mirrors {
        job.add_mirror(url.clone());
    }
    job
}

fn test_engine(dir: &TempDir, max_parallel: u32) -> DownloadEngine {
    let config = EngineConfig::new()
        .writepath(dir.path())
        .max_parallel(max_parallel);
    DownloadEngine::new(config).expect("Failed to create engine")
}

/// Mount a 206 responder for one range of `content`
async fn mount_range(server: &MockServer, url_path: &str, content: &[u8], start: u64, end: u64) {
    let total = content.len() as u64;
    let body = content[start as usize..=(end as usize)].to_vec();
    Mock::given(method("GET"))
        .and(path(url_path.to_string()))
        .and(header("Range", format!("bytes={start}-{end}")))
        .respond_with(
            ResponseTemplate::new(206)
                .insert_header("Content-Range", format!("bytes {start}-{end}/{total}"))
                .set_body_bytes(body),
        )
        .expect(1)
        .mount(server)
        .await;
}

// =============================================================================
// Multi-piece downloads
// =============================================================================

#[tokio::test]
async fn multi_piece_download_uses_concurrent_ranges() {
    let dir = TempDir::new().unwrap();
    let server = MockServer::start().await;
    let content = test_content(4000);

    // Two slots, fair share 2: one request per half
    mount_range(&server, "/artifact.sd7", &content, 0, 1999).await;
    mount_range(&server, "/artifact.sd7", &content, 2000, 3999).await;

    let dest = dir.path().join("artifact.sd7");
    let mirrors = vec![
        format!("{}/artifact.sd7", server.uri()),
        "http://127.0.0.1:9/unused".to_string(),
    ];
    let mut jobs = vec![pieced_job(&dest, &content, 1000, &mirrors)];

    let engine = test_engine(&dir, 2);
    let ok = engine.download(&mut jobs).await.unwrap();

    assert!(ok);
    assert_eq!(jobs[0].state, JobState::Finished);
    assert!(jobs[0].pieces.iter().all(|p| p.state == PieceState::Finished));
    assert_eq!(std::fs::read(&dest).unwrap(), content);

    // First mirror carried the transfer and got measured
    assert_eq!(jobs[0].mirrors[0].status, MirrorStatus::Ok);
    assert!(jobs[0].mirrors[0].speed > 0.0);
}

#[tokio::test]
async fn second_run_verifies_in_place_without_network() {
    let dir = TempDir::new().unwrap();
    let server = MockServer::start().await;
    let content = test_content(3000);

    // One slot claims every piece, so the request carries no Range header
    Mock::given(method("GET"))
        .and(path("/a.sd7"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(content.clone()))
        .expect(1)
        .mount(&server)
        .await;

    let dest = dir.path().join("a.sd7");
    let mirrors = vec![format!("{}/a.sd7", server.uri())];
    let engine = test_engine(&dir, 1);

    let mut jobs = vec![pieced_job(&dest, &content, 1000, &mirrors)];
    assert!(engine.download(&mut jobs).await.unwrap());

    // Fresh job over the same file: every piece verifies on disk and the
    // single-use range mock above would fail a second request anyway.
    let mut jobs = vec![pieced_job(&dest, &content, 1000, &mirrors)];
    assert!(engine.download(&mut jobs).await.unwrap());
    assert_eq!(jobs[0].state, JobState::Finished);
}

#[tokio::test]
async fn resumption_fetches_only_missing_pieces() {
    let dir = TempDir::new().unwrap();
    let server = MockServer::start().await;
    let content = test_content(4000);

    // Piece 0 already valid on disk, the rest zeroed
    let dest = dir.path().join("partial.sd7");
    let mut on_disk = vec![0u8; 4000];
    on_disk[..1000].copy_from_slice(&content[..1000]);
    std::fs::write(&dest, &on_disk).unwrap();

    // Only the tail may be requested
    mount_range(&server, "/partial.sd7", &content, 1000, 3999).await;

    let mirrors = vec![format!("{}/partial.sd7", server.uri())];
    let mut jobs = vec![pieced_job(&dest, &content, 1000, &mirrors)];

    let engine = test_engine(&dir, 1);
    let ok = engine.download(&mut jobs).await.unwrap();

    assert!(ok);
    assert_eq!(std::fs::read(&dest).unwrap(), content);
}

// =============================================================================
// Mirror handling
// =============================================================================

#[tokio::test]
async fn broken_mirror_fails_over() {
    let dir = TempDir::new().unwrap();
    let bad = MockServer::start().await;
    let good = MockServer::start().await;
    let content = test_content(2000);

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&bad)
        .await;
    mount_range(&good, "/f.sdz", &content, 0, 999).await;
    mount_range(&good, "/f.sdz", &content, 1000, 1999).await;

    let dest = dir.path().join("f.sdz");
    let mirrors = vec![
        format!("{}/f.sdz", bad.uri()),
        format!("{}/f.sdz", good.uri()),
    ];
    let mut jobs = vec![pieced_job(&dest, &content, 1000, &mirrors)];

    let engine = test_engine(&dir, 2);
    let ok = engine.download(&mut jobs).await.unwrap();

    assert!(ok);
    assert_eq!(jobs[0].state, JobState::Finished);
    assert_eq!(std::fs::read(&dest).unwrap(), content);

    assert_eq!(jobs[0].mirrors[0].status, MirrorStatus::Broken);
    assert_eq!(jobs[0].mirrors[0].speed, 0.0);
    assert_eq!(jobs[0].mirrors[1].status, MirrorStatus::Ok);
    assert!(jobs[0].mirrors[1].speed > 0.0);
}

#[tokio::test]
async fn job_without_mirrors_fails_at_setup() {
    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("orphan.sd7");
    let content = test_content(1000);
    let mut jobs = vec![pieced_job(&dest, &content, 1000, &[])];

    let engine = test_engine(&dir, 2);
    let ok = engine.download(&mut jobs).await.unwrap();

    assert!(!ok);
    assert_eq!(jobs[0].state, JobState::Failed);
}

#[tokio::test]
async fn bad_content_range_breaks_the_mirror() {
    let dir = TempDir::new().unwrap();
    let server = MockServer::start().await;
    let content = test_content(4000);

    // 206 whose Content-Range covers fewer bytes than any requested run
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(206)
                .insert_header("Content-Range", "bytes 0-499/4000")
                .set_body_bytes(content[..500].to_vec()),
        )
        .mount(&server)
        .await;

    let dest = dir.path().join("m.sd7");
    let mirrors = vec![format!("{}/m.sd7", server.uri())];
    let mut jobs = vec![pieced_job(&dest, &content, 1000, &mirrors)];
    // Two slots of two pieces each, so Range headers are actually sent
    jobs[0].add_mirror(format!("{}/m2.sd7", server.uri()));

    let engine = test_engine(&dir, 2);
    let ok = engine.download(&mut jobs).await.unwrap();

    assert!(!ok);
    assert_eq!(jobs[0].state, JobState::Failed);
    assert_eq!(jobs[0].mirrors[0].status, MirrorStatus::Broken);
    assert!(jobs[0].pieces.iter().all(|p| p.state == PieceState::Pending));
}

// =============================================================================
// Range refusal (single-writer fallback)
// =============================================================================

#[tokio::test]
async fn range_refusal_degrades_to_single_source() {
    let dir = TempDir::new().unwrap();
    let server = MockServer::start().await;
    let content = test_content(3000);

    // Server ignores Range and always answers 200 with the full body
    Mock::given(method("GET"))
        .and(path("/stubborn.sdz"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(content.clone()))
        .mount(&server)
        .await;

    let dest = dir.path().join("stubborn.sdz");
    let mirrors = vec![format!("{}/stubborn.sdz", server.uri())];
    let mut jobs = vec![pieced_job(&dest, &content, 1000, &mirrors)];
    jobs[0].digest = Some(digest_of(DigestAlgorithm::Md5, &content));
    jobs[0].add_mirror(format!("{}/stubborn.sdz", server.uri()));

    let engine = test_engine(&dir, 2);
    let ok = engine.download(&mut jobs).await.unwrap();

    assert!(ok);
    assert_eq!(jobs[0].state, JobState::Finished);
    assert!(jobs[0].pieces.iter().all(|p| p.state == PieceState::Finished));
    // The file is exactly the single writer's body
    assert_eq!(std::fs::read(&dest).unwrap(), content);
}

#[tokio::test]
async fn range_refused_body_without_md5_passes_piece_verification() {
    let dir = TempDir::new().unwrap();
    let server = MockServer::start().await;
    let content = test_content(3000);

    Mock::given(method("GET"))
        .and(path("/nodigest.sdz"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(content.clone()))
        .mount(&server)
        .await;

    // No whole-file digest: the linear body is vetted piece by piece
    let dest = dir.path().join("nodigest.sdz");
    let mirrors = vec![
        format!("{}/nodigest.sdz", server.uri()),
        format!("{}/nodigest.sdz", server.uri()),
    ];
    let mut jobs = vec![pieced_job(&dest, &content, 1000, &mirrors)];

    let engine = test_engine(&dir, 2);
    let ok = engine.download(&mut jobs).await.unwrap();

    assert!(ok);
    assert_eq!(jobs[0].state, JobState::Finished);
    assert!(jobs[0].pieces.iter().all(|p| p.state == PieceState::Finished));
    assert_eq!(std::fs::read(&dest).unwrap(), content);
}

#[tokio::test]
async fn range_refused_corrupt_body_without_md5_is_rejected() {
    let dir = TempDir::new().unwrap();
    let server = MockServer::start().await;
    let content = test_content(3000);

    // Right-sized garbage instead of the real bytes
    let garbage: Vec<u8> = content.iter().map(|b| b ^ 0x55).collect();
    Mock::given(method("GET"))
        .and(path("/liar.sdz"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(garbage))
        .mount(&server)
        .await;

    let dest = dir.path().join("liar.sdz");
    let mirrors = vec![
        format!("{}/liar.sdz", server.uri()),
        format!("{}/liar.sdz", server.uri()),
    ];
    let mut jobs = vec![pieced_job(&dest, &content, 1000, &mirrors)];

    let engine = test_engine(&dir, 2);
    let ok = engine.download(&mut jobs).await.unwrap();

    // Every piece digest disagrees with the stored body: nothing may be
    // marked finished, the writer's mirror is benched, and the pieces are
    // back in the pool for the next run
    assert!(!ok);
    assert_eq!(jobs[0].state, JobState::Failed);
    assert!(jobs[0].pieces.iter().all(|p| p.state == PieceState::Pending));
    assert_eq!(jobs[0].mirrors[0].status, MirrorStatus::Broken);
}

// =============================================================================
// Single-shot transfers
// =============================================================================

#[tokio::test]
async fn conditional_get_304_finishes_without_refetch() {
    let dir = TempDir::new().unwrap();
    let server = MockServer::start().await;

    // A previous run left the file behind
    let dest = dir.path().join("tool.zip");
    let existing = test_content(1234);
    std::fs::write(&dest, &existing).unwrap();

    Mock::given(method("GET"))
        .and(path("/tool.zip"))
        .and(header_exists("If-Modified-Since"))
        .respond_with(ResponseTemplate::new(304))
        .expect(1)
        .mount(&server)
        .await;

    let mut job = DownloadJob::new(&dest, "tool");
    job.add_mirror(format!("{}/tool.zip", server.uri()));
    let mut jobs = vec![job];

    let engine = test_engine(&dir, 2);
    let ok = engine.download(&mut jobs).await.unwrap();

    assert!(ok);
    assert_eq!(jobs[0].state, JobState::Finished);
    assert_eq!(std::fs::read(&dest).unwrap(), existing);
}

#[tokio::test]
async fn single_shot_body_replaces_stale_file() {
    let dir = TempDir::new().unwrap();
    let server = MockServer::start().await;
    let body = test_content(900);

    let dest = dir.path().join("tool.zip");
    std::fs::write(&dest, test_content(5000)).unwrap();

    Mock::given(method("GET"))
        .and(path("/tool.zip"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Last-Modified", "Sun, 06 Nov 1994 08:49:37 GMT")
                .set_body_bytes(body.clone()),
        )
        .mount(&server)
        .await;

    let mut job = DownloadJob::new(&dest, "tool");
    // With a digest present no If-Modified-Since is sent
    job.digest = Some(digest_of(DigestAlgorithm::Md5, &body));
    job.add_mirror(format!("{}/tool.zip", server.uri()));
    let mut jobs = vec![job];

    let engine = test_engine(&dir, 1);
    let ok = engine.download(&mut jobs).await.unwrap();

    assert!(ok);
    assert_eq!(jobs[0].state, JobState::Finished);
    // The longer stale body was truncated away
    assert_eq!(std::fs::read(&dest).unwrap(), body);
    // Mtime took the server's Last-Modified
    let mtime = std::fs::metadata(&dest).unwrap().modified().unwrap();
    assert_eq!(
        mtime,
        SystemTime::UNIX_EPOCH + Duration::from_secs(784_111_777)
    );
}

#[tokio::test]
async fn intact_file_with_matching_md5_needs_no_network() {
    let dir = TempDir::new().unwrap();
    let content = test_content(2048);

    let dest = dir.path().join("done.sdz");
    std::fs::write(&dest, &content).unwrap();

    let mut job = DownloadJob::new(&dest, "done");
    job.size = content.len() as u64;
    job.digest = Some(digest_of(DigestAlgorithm::Md5, &content));
    // Unreachable mirror: any request would fail the job
    job.add_mirror("http://127.0.0.1:9/done.sdz");
    let mut jobs = vec![job];

    let engine = test_engine(&dir, 1);
    let ok = engine.download(&mut jobs).await.unwrap();

    assert!(ok);
    assert_eq!(jobs[0].state, JobState::Finished);
}

// =============================================================================
// Verification failures
// =============================================================================

#[tokio::test]
async fn corrupt_piece_breaks_mirror_and_recovers_from_another() {
    let dir = TempDir::new().unwrap();
    let bad = MockServer::start().await;
    let good = MockServer::start().await;
    let content = test_content(2000);

    // The whole file travels as one run (no Range header); the first
    // mirror serves right-sized garbage, the second the real bytes
    let garbage: Vec<u8> = content.iter().map(|b| b ^ 0xff).collect();
    Mock::given(method("GET"))
        .and(path("/p.sd7"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(garbage))
        .expect(1)
        .mount(&bad)
        .await;
    Mock::given(method("GET"))
        .and(path("/p.sd7"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(content.clone()))
        .expect(1)
        .mount(&good)
        .await;

    let dest = dir.path().join("p.sd7");
    let mirrors = vec![format!("{}/p.sd7", bad.uri()), format!("{}/p.sd7", good.uri())];
    let mut jobs = vec![pieced_job(&dest, &content, 1000, &mirrors)];

    // One slot so the whole file travels as one run per mirror
    let engine = test_engine(&dir, 1);
    let ok = engine.download(&mut jobs).await.unwrap();

    assert!(ok);
    assert_eq!(jobs[0].state, JobState::Finished);
    assert_eq!(std::fs::read(&dest).unwrap(), content);
    assert_eq!(jobs[0].mirrors[0].status, MirrorStatus::Broken);
    assert_eq!(jobs[0].mirrors[1].status, MirrorStatus::Ok);
}

#[tokio::test]
async fn whole_file_digest_mismatch_is_fatal() {
    let dir = TempDir::new().unwrap();
    let server = MockServer::start().await;
    let body = test_content(600);

    Mock::given(method("GET"))
        .and(path("/t.zip"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
        .mount(&server)
        .await;

    let dest = dir.path().join("t.zip");
    let mut job = DownloadJob::new(&dest, "t");
    job.digest = Some(digest_of(DigestAlgorithm::Md5, b"something else"));
    job.add_mirror(format!("{}/t.zip", server.uri()));
    let mut jobs = vec![job];

    let engine = test_engine(&dir, 1);
    let ok = engine.download(&mut jobs).await.unwrap();

    assert!(!ok);
    assert_eq!(jobs[0].state, JobState::Failed);
}

// =============================================================================
// Cancellation
// =============================================================================

#[tokio::test]
async fn abort_stops_transfers_and_rewinds_mtime() {
    let dir = TempDir::new().unwrap();
    let server = MockServer::start().await;
    let content = test_content(2000);

    // Responses stall long enough for the abort to land mid-transfer
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(206)
                .insert_header("Content-Range", "bytes 0-1999/2000")
                .set_body_bytes(content.clone())
                .set_delay(Duration::from_secs(30)),
        )
        .mount(&server)
        .await;

    let dest = dir.path().join("big.sd7");
    let mirrors = vec![format!("{}/big.sd7", server.uri())];
    let jobs = vec![pieced_job(&dest, &content, 1000, &mirrors)];

    let before = SystemTime::now();
    let engine = Arc::new(test_engine(&dir, 1));
    let handle = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            let mut jobs = jobs;
            let ok = engine.download(&mut jobs).await.unwrap();
            (ok, jobs)
        })
    };

    tokio::time::sleep(Duration::from_millis(300)).await;
    engine.abort();

    let (ok, jobs) = handle.await.unwrap();
    assert!(!ok);
    assert_eq!(jobs[0].state, JobState::Failed);
    assert!(jobs[0].pieces.iter().all(|p| p.state != PieceState::Finished));

    // Mtime rolled back to force a re-fetch next run
    let mtime = std::fs::metadata(&dest).unwrap().modified().unwrap();
    assert!(mtime < before);
}

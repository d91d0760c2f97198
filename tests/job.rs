mod common;

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{encrypt_into_segments, hex_bytes, media_bytes, test_config, TestServer, IV_HEX, KEY_HEX};
use hls_fetch::handoff::{CoverExtractor, PageSnapshot, Transcoder};
use hls_fetch::{
    CancellationToken, DownloadError, Downloader, FailureKind, JobRequest, JobStatus, Stage,
    TranscodeProfile,
};

/// Three AES segments; plaintext size chosen so the padded stream splits evenly.
fn three_encrypted() -> (Vec<u8>, Vec<Vec<u8>>) {
    let plain = media_bytes(16 * 64 * 3 - 5);
    let segments = encrypt_into_segments(&plain, 3);
    (plain, segments)
}

async fn run(downloader: &Downloader, url: url::Url, dir: &Path) -> Result<hls_fetch::JobReport, hls_fetch::JobError> {
    let request = JobRequest::new(url, dir).with_identifier("video");
    downloader.run(request, CancellationToken::new()).await
}

#[tokio::test]
async fn completion_order_2_0_1_matches_in_order() {
    let server = TestServer::new().await;
    let (plain, segments) = three_encrypted();
    let ordered = server.publish("ordered", &segments, true);
    let shuffled = server.publish("shuffled", &segments, true);
    // segment 2 finishes first, then 0, then 1
    server.delay("/shuffled/seg0.ts", Duration::from_millis(150));
    server.delay("/shuffled/seg1.ts", Duration::from_millis(300));

    let tmp = tempfile::tempdir().unwrap();
    let downloader = Downloader::new(test_config(0)).unwrap();

    let a = run(&downloader, ordered, &tmp.path().join("a")).await.unwrap();
    let b = run(&downloader, shuffled, &tmp.path().join("b")).await.unwrap();

    assert_eq!(a.status, JobStatus::Succeeded);
    assert_eq!(b.status, JobStatus::Succeeded);
    let out_a = std::fs::read(&a.output).unwrap();
    let out_b = std::fs::read(&b.output).unwrap();
    assert_eq!(out_a, plain);
    assert_eq!(sha256::digest(out_a.as_slice()), sha256::digest(out_b.as_slice()));
    assert_eq!(b.output, tmp.path().join("b").join("video.mp4"));
    assert_eq!(server.hits("/shuffled/key.bin"), 1);
}

#[tokio::test]
async fn completed_output_short_circuits_without_requests() {
    let server = TestServer::new().await;
    let (_, segments) = three_encrypted();
    let url = server.publish("v", &segments, true);
    let tmp = tempfile::tempdir().unwrap();
    let downloader = Downloader::new(test_config(0)).unwrap();

    let first = run(&downloader, url.clone(), tmp.path()).await.unwrap();
    assert_eq!(first.status, JobStatus::Succeeded);
    assert!(!first.skipped);
    let requests = server.total_requests();

    let second = run(&downloader, url, tmp.path()).await.unwrap();
    assert_eq!(second.status, JobStatus::Succeeded);
    assert!(second.skipped);
    assert_eq!(second.output, first.output);
    assert_eq!(server.total_requests(), requests);
}

#[tokio::test]
async fn segment_failing_every_retry_leaves_partial_output() {
    let server = TestServer::new().await;
    let (_, segments) = three_encrypted();
    let url = server.publish("v", &segments, true);
    server.fail("/v/seg1.ts", usize::MAX);
    let tmp = tempfile::tempdir().unwrap();
    let downloader = Downloader::new(test_config(2)).unwrap();

    let report = run(&downloader, url, tmp.path()).await.unwrap();

    assert_eq!(report.status, JobStatus::PartiallyFailed);
    assert_eq!(server.hits("/v/seg1.ts"), 3);
    assert!(!tmp.path().join("video.mp4").exists());
    assert_eq!(report.output, tmp.path().join("video.mp4.part"));
    assert!(report.output.exists());

    assert_eq!(report.failures[0].index, 1);
    assert_eq!(report.failures[0].kind, FailureKind::SegmentFetch);
    // segment 2 depends on segment 1's last cipher block
    assert_eq!(report.missing_indices(), vec![1, 2]);
    assert_eq!(report.failures[1].kind, FailureKind::Decryption);
    assert_eq!(report.written, 1);
}

#[tokio::test]
async fn clear_playlist_is_plain_concatenation() {
    let server = TestServer::new().await;
    let segments = vec![b"first-".to_vec(), b"second-".to_vec(), b"third".to_vec()];
    let url = server.publish("clear", &segments, false);
    let tmp = tempfile::tempdir().unwrap();
    let downloader = Downloader::new(test_config(0)).unwrap();

    let report = run(&downloader, url, tmp.path()).await.unwrap();
    assert_eq!(report.status, JobStatus::Succeeded);
    assert_eq!(std::fs::read(&report.output).unwrap(), b"first-second-third");
    assert!(!tmp.path().join("video.segments").exists());
    assert!(!tmp.path().join("video.mp4.part").exists());
}

#[tokio::test]
async fn transient_errors_are_retried() {
    let server = TestServer::new().await;
    let (plain, segments) = three_encrypted();
    let url = server.publish("v", &segments, true);
    server.fail("/v/seg0.ts", 2);
    server.fail("/v/key.bin", 1);
    let tmp = tempfile::tempdir().unwrap();
    let downloader = Downloader::new(test_config(3)).unwrap();

    let report = run(&downloader, url, tmp.path()).await.unwrap();
    assert_eq!(report.status, JobStatus::Succeeded);
    assert_eq!(server.hits("/v/seg0.ts"), 3);
    assert_eq!(std::fs::read(&report.output).unwrap(), plain);
}

#[tokio::test]
async fn missing_key_aborts_job() {
    let server = TestServer::new().await;
    let (_, segments) = three_encrypted();
    let url = server.publish("v", &segments, true);
    server.fail("/v/key.bin", usize::MAX);
    let tmp = tempfile::tempdir().unwrap();
    let downloader = Downloader::new(test_config(1)).unwrap();

    let err = run(&downloader, url, tmp.path()).await.unwrap_err();
    assert_eq!(err.stage, Stage::KeyFetch);
    assert_eq!(err.identifier, "video");
    assert_eq!(err.status(), JobStatus::Aborted);
    assert!(matches!(err.source, DownloadError::KeyFetch { .. }));
    assert_eq!(server.hits("/v/seg0.ts"), 0);
    assert!(!tmp.path().join("video.mp4").exists());
}

#[tokio::test]
async fn empty_playlist_aborts_job() {
    let server = TestServer::new().await;
    server.put("/e/index.m3u8", "#EXTM3U\n#EXT-X-TARGETDURATION:10\n#EXT-X-ENDLIST\n");
    let tmp = tempfile::tempdir().unwrap();
    let downloader = Downloader::new(test_config(0)).unwrap();

    let err = run(&downloader, server.url("/e/index.m3u8"), tmp.path()).await.unwrap_err();
    assert_eq!(err.stage, Stage::Init);
    assert!(matches!(err.source, DownloadError::MalformedPlaylist { .. }));
}

#[tokio::test]
async fn rerun_resumes_from_cached_segments() {
    let server = TestServer::new().await;
    let segments: Vec<Vec<u8>> = (0..4).map(|i| vec![b'a' + i as u8; 100]).collect();
    let url = server.publish("r", &segments, false);
    server.fail("/r/seg2.ts", usize::MAX);
    let tmp = tempfile::tempdir().unwrap();
    let downloader = Downloader::new(test_config(0)).unwrap();

    let first = run(&downloader, url.clone(), tmp.path()).await.unwrap();
    assert_eq!(first.status, JobStatus::PartiallyFailed);
    assert_eq!(first.missing_indices(), vec![2]);
    // clear playlist: later segments still land in the partial file
    assert_eq!(first.written, 3);
    assert!(tmp.path().join("video.segments").join("index3.ts").exists());

    server.fail("/r/seg2.ts", 0);
    let second = run(&downloader, url, tmp.path()).await.unwrap();
    assert_eq!(second.status, JobStatus::Succeeded);
    assert_eq!(second.cached, 3);
    assert_eq!(second.downloaded, 1);
    assert_eq!(server.hits("/r/seg0.ts"), 1);
    assert_eq!(server.hits("/r/seg3.ts"), 1);
    assert_eq!(std::fs::read(&second.output).unwrap(), segments.concat());
    assert!(!tmp.path().join("video.segments").exists());
    assert!(!tmp.path().join("video.mp4.part").exists());
}

#[tokio::test]
async fn cancellation_removes_temporary_files() {
    let server = TestServer::new().await;
    let segments: Vec<Vec<u8>> = (0..3).map(|_| vec![0u8; 64]).collect();
    let url = server.publish("c", &segments, false);
    server.delay("/c/seg1.ts", Duration::from_secs(30));
    let tmp = tempfile::tempdir().unwrap();
    let downloader = Downloader::new(test_config(0)).unwrap();

    let token = CancellationToken::new();
    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        canceller.cancel();
    });

    let request = JobRequest::new(url, tmp.path()).with_identifier("video");
    let err = downloader.run(request, token).await.unwrap_err();
    assert!(err.is_cancelled());
    assert!(!tmp.path().join("video.mp4").exists());
    assert!(!tmp.path().join("video.mp4.part").exists());
    assert!(!tmp.path().join("video.segments").exists());
}

#[tokio::test]
async fn cancelled_fetches_do_not_write_after_cleanup() {
    let server = TestServer::new().await;
    let segments: Vec<Vec<u8>> = (0..3).map(|i| vec![i as u8; 64]).collect();
    let url = server.publish("late", &segments, false);
    server.delay("/late/seg1.ts", Duration::from_millis(400));
    server.delay("/late/seg2.ts", Duration::from_millis(400));
    let tmp = tempfile::tempdir().unwrap();
    let downloader = Downloader::new(test_config(0)).unwrap();

    let token = CancellationToken::new();
    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        canceller.cancel();
    });

    let request = JobRequest::new(url, tmp.path()).with_identifier("video");
    let err = downloader.run(request, token).await.unwrap_err();
    assert!(err.is_cancelled());
    assert_eq!(err.status(), JobStatus::Aborted);

    // the delayed responses would have landed by now
    tokio::time::sleep(Duration::from_millis(700)).await;
    let leftovers: Vec<_> = std::fs::read_dir(tmp.path())
        .unwrap()
        .map(|e| e.unwrap().file_name())
        .collect();
    assert!(leftovers.is_empty(), "left behind: {:?}", leftovers);
}

#[tokio::test]
async fn segments_before_key_tag_are_copied_clear() {
    let server = TestServer::new().await;
    let intro = media_bytes(18);
    let body = media_bytes(16 * 32 * 2 - 3);
    let encrypted = encrypt_into_segments(&body, 2);

    server.put("/mixed/key.bin", hex_bytes(KEY_HEX));
    server.put("/mixed/seg0.ts", intro.clone());
    server.put("/mixed/seg1.ts", encrypted[0].clone());
    server.put("/mixed/seg2.ts", encrypted[1].clone());
    let playlist = format!(
        "#EXTM3U\n#EXT-X-TARGETDURATION:10\n#EXTINF:10.0,\nseg0.ts\n\
         #EXT-X-KEY:METHOD=AES-128,URI=\"key.bin\",IV=0x{}\n\
         #EXTINF:10.0,\nseg1.ts\n#EXTINF:10.0,\nseg2.ts\n#EXT-X-ENDLIST\n",
        IV_HEX
    );
    server.put("/mixed/index.m3u8", playlist);

    let tmp = tempfile::tempdir().unwrap();
    let downloader = Downloader::new(test_config(0)).unwrap();
    let report = run(&downloader, server.url("/mixed/index.m3u8"), tmp.path())
        .await
        .unwrap();

    assert_eq!(report.status, JobStatus::Succeeded, "{:?}", report.failures);
    let mut expected = intro;
    expected.extend_from_slice(&body);
    assert_eq!(std::fs::read(&report.output).unwrap(), expected);
}

#[tokio::test]
async fn directory_at_output_path_is_not_a_finished_download() {
    let server = TestServer::new().await;
    let url = server.publish("d", &[vec![1u8; 8]], false);
    let tmp = tempfile::tempdir().unwrap();
    std::fs::create_dir(tmp.path().join("video.mp4")).unwrap();
    let downloader = Downloader::new(test_config(0)).unwrap();

    let err = run(&downloader, url, tmp.path()).await.unwrap_err();
    assert_eq!(err.stage, Stage::Init);
    assert!(matches!(err.source, DownloadError::AssemblyIo { .. }));
    assert_eq!(server.total_requests(), 0);
}

#[tokio::test]
async fn empty_identifier_is_rejected() {
    let server = TestServer::new().await;
    let url = server.publish("e", &[vec![1u8; 8]], false);
    let tmp = tempfile::tempdir().unwrap();
    let downloader = Downloader::new(test_config(0)).unwrap();

    let request = JobRequest::new(url, tmp.path()).with_identifier("");
    let err = downloader.run(request, CancellationToken::new()).await.unwrap_err();
    assert_eq!(err.stage, Stage::Init);
    assert!(matches!(err.source, DownloadError::InvalidIdentifier { .. }));
    assert!(!tmp.path().join(".mp4").exists());
    assert_eq!(server.total_requests(), 0);
}

#[tokio::test]
async fn master_playlist_follows_best_variant() {
    let server = TestServer::new().await;
    let segments = vec![b"hi-".to_vec(), b"res".to_vec()];
    server.publish("high", &segments, false);
    server.put("/low/index.m3u8", common::playlist_text(1, false));
    server.put("/low/seg0.ts", "low");
    server.put(
        "/master.m3u8",
        "#EXTM3U\n#EXT-X-STREAM-INF:BANDWIDTH=500000\nlow/index.m3u8\n#EXT-X-STREAM-INF:BANDWIDTH=3000000\nhigh/index.m3u8\n",
    );
    let tmp = tempfile::tempdir().unwrap();
    let downloader = Downloader::new(test_config(0)).unwrap();

    let report = run(&downloader, server.url("/master.m3u8"), tmp.path()).await.unwrap();
    assert_eq!(std::fs::read(&report.output).unwrap(), b"hi-res");
    assert_eq!(server.hits("/low/seg0.ts"), 0);
}

#[derive(Default)]
struct Recorder {
    transcoded: Mutex<Vec<(PathBuf, TranscodeProfile)>>,
    covers: Mutex<Vec<String>>,
}

#[async_trait]
impl Transcoder for Recorder {
    async fn transcode(&self, input: &Path, profile: TranscodeProfile) -> Result<(), DownloadError> {
        self.transcoded.lock().unwrap().push((input.to_path_buf(), profile));
        Ok(())
    }
}

#[async_trait]
impl CoverExtractor for Recorder {
    async fn extract_cover(&self, page: &PageSnapshot, _target_dir: &Path) -> Result<(), DownloadError> {
        self.covers.lock().unwrap().push(page.html.clone());
        Err(DownloadError::Transcode {
            reason: "no og:image".to_string(),
        })
    }
}

#[tokio::test]
async fn post_processing_runs_only_on_success() {
    let server = TestServer::new().await;
    let segments = vec![b"a".to_vec(), b"b".to_vec()];
    let good = server.publish("good", &segments, false);
    let bad = server.publish("bad", &segments, false);
    server.fail("/bad/seg0.ts", usize::MAX);

    let recorder = Arc::new(Recorder::default());
    let mut config = test_config(0);
    config.transcode = Some(TranscodeProfile::Remux);
    let downloader = Downloader::new(config)
        .unwrap()
        .with_transcoder(recorder.clone())
        .with_cover_extractor(recorder.clone());
    let tmp = tempfile::tempdir().unwrap();
    let page = PageSnapshot {
        page_url: None,
        html: "<html></html>".to_string(),
    };

    let ok = downloader
        .run(
            JobRequest::new(good, tmp.path().join("good")).with_identifier("v").with_page(page.clone()),
            CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(ok.status, JobStatus::Succeeded);
    // cover failure is reported but does not fail the job
    assert_eq!(ok.post_process_errors.len(), 1);

    let partial = downloader
        .run(
            JobRequest::new(bad, tmp.path().join("bad")).with_identifier("v").with_page(page),
            CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(partial.status, JobStatus::PartiallyFailed);

    let transcoded = recorder.transcoded.lock().unwrap().clone();
    assert_eq!(transcoded, vec![(ok.output.clone(), TranscodeProfile::Remux)]);
    assert_eq!(recorder.covers.lock().unwrap().len(), 1);
}

//! End-to-end downloader behaviour against a local HTTP server.

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::{Body, Bytes};
use axum::http::header::{CONTENT_LENGTH, CONTENT_TYPE};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures::StreamExt;
use tokio_test::{assert_err, assert_ok};
use tokio_util::sync::CancellationToken;

use common::{
    downloader, full, leftover_workspaces, memory_store, payload, quick_retry, ranged, serve,
    state, Recorder,
};
use mediafetch::download::Credentials;
use mediafetch::resilience::{BreakerSettings, BreakerState, CircuitBreaker};
use mediafetch::store::{DownloadStatus, NewRecord, RecordStore};
use mediafetch::{DownloadJob, Error, ErrorKind};

const TEN_MIB: usize = 10 * 1024 * 1024;

#[tokio::test]
async fn test_flaky_server_succeeds_on_third_attempt() {
    let rec = Recorder::new();
    let body = Arc::new(payload(TEN_MIB));
    let app = Router::new().route(
        "/video",
        get({
            let (rec, body) = (rec.clone(), body.clone());
            move |headers: HeaderMap| async move {
                if rec.hit(&headers) <= 2 {
                    StatusCode::INTERNAL_SERVER_ERROR.into_response()
                } else {
                    full(&body, "video/mp4")
                }
            }
        }),
    );
    let base = serve(app).await;

    let temp = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let store = memory_store();
    let dl = downloader(temp.path(), quick_retry(5)).with_state(state(&store, "worker-a"));

    let dest_base = out.path().join("movie");
    let job = DownloadJob::new(format!("{}/video", base), &dest_base).tracked(Some(42));
    let result = dl.download(&job, &CancellationToken::new()).await.unwrap();

    assert_eq!(rec.hits(), 3);
    assert_eq!(result.attempts, 3);
    assert_eq!(result.file_size, TEN_MIB as u64);
    assert_eq!(result.extension, "mp4");
    assert_eq!(result.file_path, out.path().join("movie.mp4"));
    assert_eq!(std::fs::read(&result.file_path).unwrap(), *body);
    assert!(leftover_workspaces(temp.path()).is_empty());

    let record = store
        .find_by_source(&job.url, &dest_base.to_string_lossy())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status, DownloadStatus::Completed);
    assert_eq!(record.catalog_id, Some(42));
    assert_eq!(record.retry_count, 2);
    assert_eq!(record.file_size, Some(TEN_MIB as u64));
    assert_eq!(
        record.download_path.as_deref(),
        Some(result.file_path.to_string_lossy().as_ref())
    );
    assert!(record.locked_by.is_none());
    assert!(record.completed_at.is_some());
}

#[tokio::test]
async fn test_dropped_connection_resumes_with_range() {
    let total = 256 * 1024;
    let half = total / 2;
    let rec = Recorder::new();
    let body = Arc::new(payload(total));

    let app = Router::new().route(
        "/clip.webm",
        get({
            let (rec, body) = (rec.clone(), body.clone());
            move |headers: HeaderMap| async move {
                if rec.hit(&headers) > 1 {
                    return ranged(&body, "video/webm", &headers);
                }
                let head = Bytes::copy_from_slice(&body[..half]);
                let stream = futures::stream::iter(vec![Ok::<_, std::io::Error>(head)]).chain(
                    futures::stream::once(async {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Err(std::io::Error::other("connection dropped"))
                    }),
                );
                Response::builder()
                    .header(CONTENT_TYPE, "video/webm")
                    .header(CONTENT_LENGTH, total)
                    .body(Body::from_stream(stream))
                    .unwrap()
            }
        }),
    );
    let base = serve(app).await;

    let temp = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let dl = downloader(temp.path(), quick_retry(3));

    let job = DownloadJob::new(format!("{}/clip.webm", base), out.path().join("clip"));
    let result = dl.download(&job, &CancellationToken::new()).await.unwrap();

    assert_eq!(rec.hits(), 2);
    assert_eq!(rec.ranges()[0], None);
    assert_eq!(rec.ranges()[1], Some(format!("bytes={}-", half)));
    assert_eq!(result.attempts, 2);
    assert_eq!(result.file_path, out.path().join("clip.webm"));
    assert_eq!(std::fs::read(&result.file_path).unwrap(), *body);
}

#[tokio::test]
async fn test_extension_from_content_type() {
    let rec = Recorder::new();
    let app = Router::new().route(
        "/stream/42",
        get({
            let rec = rec.clone();
            move |headers: HeaderMap| async move {
                rec.hit(&headers);
                full(b"matroska bytes", "video/x-matroska; charset=binary")
            }
        }),
    );
    let base = serve(app).await;

    let temp = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let dl = downloader(temp.path(), quick_retry(1));

    let job = DownloadJob::new(format!("{}/stream/42", base), out.path().join("Show.S01E01"));
    let result = dl.download(&job, &CancellationToken::new()).await.unwrap();

    assert_eq!(result.extension, "mkv");
    assert_eq!(result.file_path, out.path().join("Show.S01E01.mkv"));
    assert_eq!(result.file_size, 14);
}

#[tokio::test]
async fn test_lock_held_elsewhere_skips_without_fetching() {
    let rec = Recorder::new();
    let app = Router::new().route(
        "/a.mp4",
        get({
            let rec = rec.clone();
            move |headers: HeaderMap| async move {
                rec.hit(&headers);
                full(b"data", "video/mp4")
            }
        }),
    );
    let base = serve(app).await;

    let store = memory_store();
    let record = store
        .create(NewRecord {
            catalog_id: None,
            source_url: Some(format!("{}/a.mp4", base)),
            destination_base: None,
        })
        .await
        .unwrap();
    let other = state(&store, "other-host:1");
    assert!(other.acquire_lock(record.id).await.unwrap());

    let temp = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let dl = downloader(temp.path(), quick_retry(3)).with_state(state(&store, "this-host:2"));

    let job = DownloadJob::new(format!("{}/a.mp4", base), out.path().join("a")).with_record(record.id);
    let err = dl.download(&job, &CancellationToken::new()).await.unwrap_err();

    assert!(matches!(err, Error::LockHeld(id) if id == record.id));
    assert_eq!(err.kind(), ErrorKind::Busy);
    assert!(!err.is_retryable());
    assert_eq!(rec.hits(), 0);

    let after = store.get(record.id).await.unwrap().unwrap();
    assert_eq!(after.locked_by.as_deref(), Some("other-host:1"));
    assert_eq!(after.status, DownloadStatus::Pending);
}

#[tokio::test]
async fn test_concurrent_instances_download_record_once() {
    let rec = Recorder::new();
    let app = Router::new().route(
        "/slow.mp4",
        get({
            let rec = rec.clone();
            move |headers: HeaderMap| async move {
                rec.hit(&headers);
                tokio::time::sleep(Duration::from_millis(300)).await;
                full(b"slow body", "video/mp4")
            }
        }),
    );
    let base = serve(app).await;

    let store = memory_store();
    let record = store.create(NewRecord::default()).await.unwrap();

    let temp = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let first = downloader(temp.path(), quick_retry(1)).with_state(state(&store, "a"));
    let second = downloader(temp.path(), quick_retry(1)).with_state(state(&store, "b"));

    let url = format!("{}/slow.mp4", base);
    let job_a = DownloadJob::new(url.clone(), out.path().join("a")).with_record(record.id);
    let job_b = DownloadJob::new(url, out.path().join("b")).with_record(record.id);
    let cancel = CancellationToken::new();

    let (a, b) = tokio::join!(first.download(&job_a, &cancel), second.download(&job_b, &cancel));

    let busy = [&a, &b]
        .iter()
        .filter(|r| matches!(r, Err(Error::LockHeld(_))))
        .count();
    let done = [&a, &b].iter().filter(|r| r.is_ok()).count();
    assert_eq!((done, busy), (1, 1));
    assert_eq!(rec.hits(), 1);
}

#[tokio::test]
async fn test_cancellation_leaves_nothing_behind() {
    let app = Router::new().route(
        "/big.mp4",
        get(|| async {
            let head = Bytes::from(vec![7u8; 64 * 1024]);
            let stream = futures::stream::iter(vec![Ok::<_, std::io::Error>(head)]).chain(
                futures::stream::once(async {
                    tokio::time::sleep(Duration::from_secs(10)).await;
                    Ok(Bytes::from(vec![7u8; 64 * 1024]))
                }),
            );
            Response::builder()
                .header(CONTENT_TYPE, "video/mp4")
                .header(CONTENT_LENGTH, 128 * 1024)
                .body(Body::from_stream(stream))
                .unwrap()
        }),
    );
    let base = serve(app).await;

    let temp = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let store = memory_store();
    let dl = downloader(temp.path(), quick_retry(3)).with_state(state(&store, "worker"));

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    let dest_base = out.path().join("big");
    let job = DownloadJob::new(format!("{}/big.mp4", base), &dest_base)
        .tracked(None)
        .with_progress(move |p| {
            if p.downloaded > 0 {
                trigger.cancel();
            }
        });

    let started = Instant::now();
    let err = dl.download(&job, &cancel).await.unwrap_err();

    assert!(matches!(err, Error::Cancelled));
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(!out.path().join("big.mp4").exists());
    assert_eq!(std::fs::read_dir(out.path()).unwrap().count(), 0);
    assert!(leftover_workspaces(temp.path()).is_empty());

    let record = store
        .find_by_source(&job.url, &dest_base.to_string_lossy())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status, DownloadStatus::Paused);
    assert!(record.locked_by.is_none());
    assert!(record.locked_at.is_none());
}

#[tokio::test]
async fn test_not_found_marks_record_failed() {
    let rec = Recorder::new();
    let app = Router::new().route(
        "/gone.mp4",
        get({
            let rec = rec.clone();
            move |headers: HeaderMap| async move {
                rec.hit(&headers);
                StatusCode::NOT_FOUND
            }
        }),
    );
    let base = serve(app).await;

    let temp = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let store = memory_store();
    let dl = downloader(temp.path(), quick_retry(3)).with_state(state(&store, "worker"));

    let dest_base = out.path().join("gone");
    let job = DownloadJob::new(format!("{}/gone.mp4", base), &dest_base).tracked(None);
    let err = dl.download(&job, &CancellationToken::new()).await.unwrap_err();

    assert!(matches!(err, Error::HttpStatus { status: 404, .. }));
    assert_eq!(err.kind(), ErrorKind::ExternalService);
    assert_eq!(rec.hits(), 3);
    assert!(!out.path().join("gone.mp4").exists());

    let record = store
        .find_by_source(&job.url, &dest_base.to_string_lossy())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status, DownloadStatus::Failed);
    assert!(record.error_message.unwrap().contains("404"));
    assert!(record.locked_by.is_none());
    assert!(record.completed_at.is_some());
}

#[tokio::test]
async fn test_failed_record_reenters_through_retrying() {
    let rec = Recorder::new();
    let app = Router::new().route(
        "/later.mp4",
        get({
            let rec = rec.clone();
            move |headers: HeaderMap| async move {
                if rec.hit(&headers) == 1 {
                    StatusCode::SERVICE_UNAVAILABLE.into_response()
                } else {
                    full(b"finally", "video/mp4")
                }
            }
        }),
    );
    let base = serve(app).await;

    let temp = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let store = memory_store();
    let dl = downloader(temp.path(), quick_retry(1)).with_state(state(&store, "worker"));

    let job = DownloadJob::new(format!("{}/later.mp4", base), out.path().join("later")).tracked(None);
    assert_err!(dl.download(&job, &CancellationToken::new()).await);
    assert_ok!(dl.download(&job, &CancellationToken::new()).await);

    let record = store
        .find_by_source(&job.url, &out.path().join("later").to_string_lossy())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status, DownloadStatus::Completed);
    assert_eq!(record.retry_count, 1);
    assert!(record.last_retry_at.is_some());
}

#[tokio::test]
async fn test_open_breaker_short_circuits_retries() {
    let rec = Recorder::new();
    let app = Router::new().route(
        "/down.mp4",
        get({
            let rec = rec.clone();
            move |headers: HeaderMap| async move {
                rec.hit(&headers);
                StatusCode::BAD_GATEWAY
            }
        }),
    );
    let base = serve(app).await;

    let breaker = Arc::new(CircuitBreaker::new(
        "origin",
        BreakerSettings {
            max_failures: 1,
            timeout: Duration::from_secs(60),
            max_half_open_requests: 1,
        },
    ));
    let temp = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let dl = downloader(temp.path(), quick_retry(3)).with_breaker(breaker.clone());

    let job = DownloadJob::new(format!("{}/down.mp4", base), out.path().join("down"));
    let err = dl.download(&job, &CancellationToken::new()).await.unwrap_err();

    assert!(matches!(err, Error::BreakerOpen), "{:?}", err);
    assert_eq!(rec.hits(), 1);
    assert_eq!(breaker.state(), BreakerState::Open);
}

#[tokio::test]
async fn test_cancelled_download_leaves_breaker_half_open() {
    let app = Router::new()
        .route(
            "/stalled.mp4",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                full(b"too late", "video/mp4")
            }),
        )
        .route("/ok.mp4", get(|| async { full(b"recovered", "video/mp4") }));
    let base = serve(app).await;

    let breaker = Arc::new(CircuitBreaker::new(
        "origin",
        BreakerSettings {
            max_failures: 1,
            timeout: Duration::from_millis(50),
            max_half_open_requests: 1,
        },
    ));
    let _ = breaker
        .call(|| async { Err::<(), Error>(Error::Stream("reset".into())) })
        .await;
    assert_eq!(breaker.state(), BreakerState::Open);
    tokio::time::sleep(Duration::from_millis(80)).await;

    let temp = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let dl = downloader(temp.path(), quick_retry(1)).with_breaker(breaker.clone());

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });
    let job = DownloadJob::new(format!("{}/stalled.mp4", base), out.path().join("s"));
    let err = dl.download(&job, &cancel).await.unwrap_err();
    assert!(matches!(err, Error::Cancelled), "{:?}", err);
    assert_eq!(breaker.state(), BreakerState::HalfOpen);

    // The half-open slot was handed back, so the next call still decides.
    let job = DownloadJob::new(format!("{}/ok.mp4", base), out.path().join("ok"));
    assert_ok!(dl.download(&job, &CancellationToken::new()).await);
    assert_eq!(breaker.state(), BreakerState::Closed);
}

#[tokio::test]
async fn test_basic_auth_is_sent() {
    let rec = Recorder::new();
    let app = Router::new().route(
        "/private.mp4",
        get({
            let rec = rec.clone();
            move |headers: HeaderMap| async move {
                rec.hit(&headers);
                let authorized = headers
                    .get("authorization")
                    .is_some_and(|v| v == "Basic YWxpY2U6c2VjcmV0");
                if authorized {
                    full(b"secret video", "video/mp4")
                } else {
                    StatusCode::UNAUTHORIZED.into_response()
                }
            }
        }),
    );
    let base = serve(app).await;

    let temp = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let dl = downloader(temp.path(), quick_retry(1)).with_credentials(Credentials {
        username: "alice".into(),
        password: Some("secret".into()),
    });

    let job = DownloadJob::new(format!("{}/private.mp4", base), out.path().join("p"));
    let result = dl.download(&job, &CancellationToken::new()).await.unwrap();

    assert_eq!(result.file_size, 12);
    assert_eq!(rec.auth(), vec![Some("Basic YWxpY2U6c2VjcmV0".to_string())]);
}

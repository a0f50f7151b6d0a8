//! HTTP surface: one GET route that downloads the registry as a zip archive.
//!
//! The archive is built completely before any response bytes are produced, so
//! a failing source turns into a 500 instead of a truncated download.

use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use dossier_types::{ApiError, SourceList, now_ms};
use facet::Facet;
use tracing::{error, info};

use crate::error::RouteError;
use crate::registry::Registry;

pub const ARCHIVE_CONTENT_TYPE: &str = "application/zip";

/// Add the archive route at `path` (and a `<path>/sources` listing) to `router`.
///
/// `path` must be a literal route: it starts with `/` and has no `{param}`,
/// `*wildcard` or `:name` segments. Like any axum route, adding it to a router
/// that already has a GET handler at `path` or `<path>/sources` panics.
pub fn register_handler<S>(
    router: Router<S>,
    path: &str,
    registry: Arc<Registry>,
) -> Result<Router<S>, RouteError>
where
    S: Clone + Send + Sync + 'static,
{
    validate_path(path)?;
    let sources_path = format!("{}/sources", path.trim_end_matches('/'));

    let archive_registry = Arc::clone(&registry);
    Ok(router
        .route(
            path,
            get(move || serve_archive(Arc::clone(&archive_registry))),
        )
        .route(
            &sources_path,
            get(move || serve_source_list(Arc::clone(&registry))),
        ))
}

/// A fresh router serving the archive at `path` and the listing at `<path>/sources`.
pub fn router(path: &str, registry: Arc<Registry>) -> Result<Router, RouteError> {
    register_handler(Router::new(), path, registry)
}

fn validate_path(path: &str) -> Result<(), RouteError> {
    let literal = path.starts_with('/')
        && !path.contains(['{', '}', '*'])
        && !path.split('/').any(|segment| segment.starts_with(':'));
    if literal {
        Ok(())
    } else {
        Err(RouteError::InvalidPath {
            path: path.to_string(),
        })
    }
}

async fn serve_archive(registry: Arc<Registry>) -> Response {
    let started = Instant::now();
    // Sources block (the CPU profile sleeps for its whole window).
    let built = tokio::task::spawn_blocking(move || registry.build_archive()).await;

    match built {
        Ok(Ok(archive)) => {
            info!(
                bytes = archive.len(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "served debug archive"
            );
            archive_ok(archive)
        }
        Ok(Err(e)) => {
            error!(%e, "debug archive build failed");
            json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("failed to build debug archive: {e}"),
            )
        }
        Err(e) => {
            error!(%e, "debug archive build task did not complete");
            json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("debug archive build task did not complete: {e}"),
            )
        }
    }
}

async fn serve_source_list(registry: Arc<Registry>) -> Response {
    json_ok(&SourceList {
        sources: registry.names(),
    })
}

fn archive_ok(archive: Vec<u8>) -> Response {
    let disposition = format!("attachment; filename=\"dossier-{}.zip\"", now_ms());
    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, ARCHIVE_CONTENT_TYPE.to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        archive,
    )
        .into_response()
}

pub fn json_ok<T>(value: &T) -> Response
where
    T: for<'facet> Facet<'facet>,
{
    json_with_status(StatusCode::OK, value)
}

pub fn json_error(status: StatusCode, message: impl Into<String>) -> Response {
    json_with_status(
        status,
        &ApiError {
            error: message.into(),
        },
    )
}

pub fn json_with_status<T>(status: StatusCode, value: &T) -> Response
where
    T: for<'facet> Facet<'facet>,
{
    match facet_json::to_string(value) {
        Ok(body) => (
            status,
            [(header::CONTENT_TYPE, "application/json; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(error) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            format!("json encode error: {error}"),
        )
            .into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{SourceError, StaticSource};
    use std::collections::BTreeMap;
    use std::io::{Cursor, Read, Write};
    use tokio::net::TcpListener;

    async fn serve(router: Router) -> String {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind test listener");
        let addr = listener.local_addr().expect("listener addr");
        tokio::spawn(async move {
            axum::serve(listener, router).await.expect("test server");
        });
        format!("http://{addr}")
    }

    enum Fetched {
        Ok {
            content_type: Option<String>,
            disposition: Option<String>,
            body: Vec<u8>,
        },
        Status(u16, String),
    }

    async fn fetch(url: String) -> Fetched {
        tokio::task::spawn_blocking(move || match ureq::get(&url).call() {
            Ok(response) => {
                let content_type = response.header("content-type").map(str::to_string);
                let disposition = response.header("content-disposition").map(str::to_string);
                let mut body = Vec::new();
                response
                    .into_reader()
                    .read_to_end(&mut body)
                    .expect("read response body");
                Fetched::Ok {
                    content_type,
                    disposition,
                    body,
                }
            }
            Err(ureq::Error::Status(code, response)) => {
                Fetched::Status(code, response.into_string().unwrap_or_default())
            }
            Err(e) => panic!("GET {url}: {e}"),
        })
        .await
        .expect("client task")
    }

    fn read_entries(archive: &[u8]) -> BTreeMap<String, String> {
        let mut zip = zip::ZipArchive::new(Cursor::new(archive)).expect("archive must parse");
        let mut out = BTreeMap::new();
        for i in 0..zip.len() {
            let mut file = zip.by_index(i).expect("entry must open");
            let mut content = String::new();
            file.read_to_string(&mut content).expect("entry must read");
            out.insert(file.name().to_string(), content);
        }
        out
    }

    fn test_registry() -> Arc<Registry> {
        let registry = Arc::new(Registry::new());
        registry
            .register_source("test", StaticSource::new("test"))
            .unwrap();
        registry
            .register_source("foo", StaticSource::new("bar"))
            .unwrap();
        registry
    }

    #[tokio::test]
    async fn download_zip_then_fail_after_bad_source_registers() {
        let registry = test_registry();
        let base = serve(router("/debug/dump", Arc::clone(&registry)).unwrap()).await;

        match fetch(format!("{base}/debug/dump")).await {
            Fetched::Ok {
                content_type,
                disposition,
                body,
            } => {
                assert_eq!(content_type.as_deref(), Some(ARCHIVE_CONTENT_TYPE));
                let disposition = disposition.expect("download must carry a filename");
                let stamp = disposition
                    .strip_prefix("attachment; filename=\"dossier-")
                    .and_then(|rest| rest.strip_suffix(".zip\""))
                    .unwrap_or_else(|| panic!("unexpected content-disposition {disposition:?}"));
                assert!(stamp.parse::<i64>().is_ok_and(|ms| ms > 0), "{disposition}");
                let entries = read_entries(&body);
                assert_eq!(entries.len(), 2);
                assert_eq!(entries["test"], "test");
                assert_eq!(entries["foo"], "bar");
            }
            Fetched::Status(code, body) => panic!("unexpected status {code}: {body}"),
        }

        registry
            .register_fn("test2", |sink: &mut dyn Write| -> Result<(), SourceError> {
                sink.write_all(b"oh snap")?;
                Err("bad write".into())
            })
            .unwrap();

        match fetch(format!("{base}/debug/dump")).await {
            Fetched::Status(code, body) => {
                assert_eq!(code, 500);
                assert!(body.contains("test2"), "error body should name the source: {body}");
            }
            Fetched::Ok { .. } => panic!("failing source must not produce an archive"),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_downloads_build_independent_archives() {
        let registry = test_registry();
        let in_flight = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let overlapped = Arc::new(std::sync::atomic::AtomicBool::new(false));
        {
            let in_flight = Arc::clone(&in_flight);
            let overlapped = Arc::clone(&overlapped);
            registry
                .register_fn("slow", move |sink: &mut dyn Write| -> Result<(), SourceError> {
                    use std::sync::atomic::Ordering;
                    if in_flight.fetch_add(1, Ordering::SeqCst) > 0 {
                        overlapped.store(true, Ordering::SeqCst);
                    }
                    std::thread::sleep(std::time::Duration::from_millis(300));
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    sink.write_all(b"slow")?;
                    Ok(())
                })
                .unwrap();
        }
        let base = serve(router("/debug/dump", registry).unwrap()).await;

        let (first, second) = tokio::join!(
            fetch(format!("{base}/debug/dump")),
            fetch(format!("{base}/debug/dump"))
        );
        for fetched in [first, second] {
            match fetched {
                Fetched::Ok { body, .. } => {
                    let entries = read_entries(&body);
                    assert_eq!(entries.len(), 3);
                    assert_eq!(entries["test"], "test");
                    assert_eq!(entries["foo"], "bar");
                    assert_eq!(entries["slow"], "slow");
                }
                Fetched::Status(code, body) => panic!("unexpected status {code}: {body}"),
            }
        }
        assert!(
            overlapped.load(std::sync::atomic::Ordering::SeqCst),
            "the two builds should have run at the same time"
        );
    }

    #[tokio::test]
    async fn routes_are_added_to_an_existing_router() {
        let existing = Router::new().route("/healthz", get(|| async { "ok" }));
        let app = register_handler(existing, "/debug/dump", test_registry()).unwrap();
        let base = serve(app).await;

        assert!(matches!(
            fetch(format!("{base}/healthz")).await,
            Fetched::Ok { body, .. } if body == b"ok"
        ));

        match fetch(format!("{base}/debug/dump/sources")).await {
            Fetched::Ok { body, .. } => {
                let list: SourceList = facet_json::from_str(
                    std::str::from_utf8(&body).expect("utf-8 listing"),
                )
                .expect("listing must decode");
                assert_eq!(list.sources, vec!["test".to_string(), "foo".to_string()]);
            }
            Fetched::Status(code, body) => panic!("unexpected status {code}: {body}"),
        }
    }

    #[test]
    fn rejects_paths_axum_cannot_route_literally() {
        for path in ["debug/dump", "", "/debug/{id}", "/debug/*rest", "/debug/:id", "/:dump"] {
            let err = router(path, Arc::new(Registry::new())).expect_err("path must be rejected");
            assert_eq!(
                err,
                RouteError::InvalidPath {
                    path: path.to_string()
                }
            );
        }
    }
}

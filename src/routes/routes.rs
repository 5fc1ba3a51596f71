//! Defines routes for the file service.
//!
//! ## Structure
//! - **Probes** (mounted at root)
//!   - `GET    /healthz`: liveness
//!   - `GET    /readyz`: metadata DB + object store readiness
//!
//! - **File endpoints** under `/api/v1/files`
//!   - `POST   /upload`: multipart upload
//!   - `GET    /info/{id}`: metadata, optionally with a presigned URL
//!   - `GET    /download/{id}`: stream the content
//!   - `GET    /url/{id}`: presigned URL
//!   - `DELETE /{id}`: delete object, then soft-delete metadata
//!   - `GET    /health`: object store probe
//!   - `GET    /objects/{*key}`: locally signed object URLs
//!
//! The wildcard `*key` carries nested keys like `20240101/{hash}/data.csv`.

use crate::handlers::{
    AppState,
    file_handlers::{
        delete_file, download_file, file_info, presigned_url, signed_object, storage_health,
        upload_file,
    },
    health_handlers::{healthz, readyz},
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{delete, get, post},
};

/// Build the router for every endpoint.
///
/// Uploads bypass axum's default body limit; the handler enforces the
/// configured maximum while spooling.
pub fn routes() -> Router<AppState> {
    let files = Router::new()
        .route(
            "/upload",
            post(upload_file).layer(DefaultBodyLimit::disable()),
        )
        .route("/info/{id}", get(file_info))
        .route("/download/{id}", get(download_file))
        .route("/url/{id}", get(presigned_url))
        .route("/health", get(storage_health))
        .route("/objects/{*key}", get(signed_object))
        .route("/{id}", delete(delete_file));

    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .nest("/api/v1/files", files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        services::{
            file_repository::test_support::memory_repository,
            file_service::{FileService, UploadPolicy},
        },
        storage::{ObjectStore, local::LocalObjectStore},
    };
    use axum::{
        body::{Body, to_bytes},
        http::{Request, StatusCode, header},
        response::Response,
    };
    use serde_json::Value;
    use std::{sync::Arc, time::Duration};
    use tempfile::TempDir;
    use tower::ServiceExt;
    use url::Url;

    const BOUNDARY: &str = "X-FILE-SERVICE-BOUNDARY";
    const CSV: &[u8] = b"a,b,c\n1,2,3";

    struct TestApp {
        router: Router,
        _dir: TempDir,
    }

    async fn app() -> TestApp {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(
            dir.path().join("objects"),
            "uploads",
            Url::parse("http://files.test").unwrap(),
            b"route-secret",
        );
        store.ensure_bucket().await.unwrap();

        let service = FileService::new(
            Arc::new(store),
            Arc::new(memory_repository().await),
            UploadPolicy::new(64, ["csv", "xlsx"]),
        );
        let state = AppState::new(service, dir.path().join("spool"), Duration::from_secs(600));
        TestApp {
            router: routes().with_state(state),
            _dir: dir,
        }
    }

    fn multipart(filename: &str, data: &[u8], access_type: Option<&str>) -> Request<Body> {
        let mut body = Vec::new();
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{filename}\"\r\nContent-Type: text/csv\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(data);
        body.extend_from_slice(b"\r\n");
        if let Some(access_type) = access_type {
            body.extend_from_slice(
                format!(
                    "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"access_type\"\r\n\r\n{access_type}\r\n"
                )
                .as_bytes(),
            );
        }
        body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());

        Request::builder()
            .method("POST")
            .uri("/api/v1/files/upload")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    async fn send(app: &TestApp, request: Request<Body>) -> Response {
        app.router.clone().oneshot(request).await.unwrap()
    }

    async fn get(app: &TestApp, uri: &str) -> Response {
        send(app, Request::get(uri).body(Body::empty()).unwrap()).await
    }

    async fn json(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn bytes(response: Response) -> Vec<u8> {
        to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap()
            .to_vec()
    }

    #[tokio::test]
    async fn upload_download_delete() {
        let app = app().await;

        let response = send(&app, multipart("data.csv", CSV, Some("public-read"))).await;
        assert_eq!(response.status(), StatusCode::CREATED);
        let record = json(response).await;
        let id = record["id"].as_str().unwrap().to_string();
        assert_eq!(record["size_bytes"], CSV.len());
        assert_eq!(record["content_type"], "text/csv");
        assert_eq!(record["access_type"], "public-read");
        assert!(record["object_key"].as_str().unwrap().ends_with("/data.csv"));

        let response = get(&app, &format!("/api/v1/files/download/{id}")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "text/csv");
        assert_eq!(response.headers()[header::CONTENT_LENGTH], "11");
        assert_eq!(
            response.headers()[header::CONTENT_DISPOSITION],
            "attachment; filename=\"data.csv\""
        );
        assert_eq!(bytes(response).await, CSV);

        let delete = Request::delete(format!("/api/v1/files/{id}"))
            .body(Body::empty())
            .unwrap();
        let response = send(&app, delete).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = json(response).await;
        assert_eq!(body["deleted"], true);
        assert_eq!(body["metadata_orphaned"], false);

        let delete = Request::delete(format!("/api/v1/files/{id}"))
            .body(Body::empty())
            .unwrap();
        assert_eq!(send(&app, delete).await.status(), StatusCode::NOT_FOUND);

        let response = get(&app, &format!("/api/v1/files/download/{id}")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = json(response).await;
        assert_eq!(body["status"], 404);
    }

    #[tokio::test]
    async fn info_with_signed_url() {
        let app = app().await;
        let record = json(send(&app, multipart("data.csv", CSV, None)).await).await;
        let id = record["id"].as_str().unwrap();

        let info = json(get(&app, &format!("/api/v1/files/info/{id}")).await).await;
        assert_eq!(info["filename"], "data.csv");
        assert!(info["download_url"].is_null());

        let info = json(
            get(
                &app,
                &format!("/api/v1/files/info/{id}?generate_url=true&url_expires=60"),
            )
            .await,
        )
        .await;
        let url = Url::parse(info["download_url"].as_str().unwrap()).unwrap();
        assert_eq!(url.host_str(), Some("files.test"));
        let local = format!("{}?{}", url.path(), url.query().unwrap());

        let response = get(&app, &local).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(bytes(response).await, CSV);

        let tampered = local.replace("token=", "token=x");
        assert_eq!(get(&app, &tampered).await.status(), StatusCode::FORBIDDEN);

        let response = get(&app, &format!("/api/v1/files/url/{id}")).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = json(response).await;
        assert_eq!(body["expires_in"], 600);

        let response = get(&app, &format!("/api/v1/files/url/{id}?expires=0")).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn rejected_uploads() {
        let app = app().await;

        let response = send(&app, multipart("setup.exe", b"MZ", None)).await;
        assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);

        let response = send(&app, multipart("big.csv", &[b'x'; 65], None)).await;
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);

        let response = send(&app, multipart("data.csv", CSV, Some("world-writable"))).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = send(&app, multipart("../data.csv", CSV, None)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_ids() {
        let app = app().await;
        let id = uuid::Uuid::new_v4();
        for uri in [
            format!("/api/v1/files/info/{id}"),
            format!("/api/v1/files/download/{id}"),
            format!("/api/v1/files/url/{id}"),
        ] {
            assert_eq!(get(&app, &uri).await.status(), StatusCode::NOT_FOUND, "{uri}");
        }
    }

    #[tokio::test]
    async fn probes() {
        let app = app().await;
        assert_eq!(get(&app, "/healthz").await.status(), StatusCode::OK);

        let response = get(&app, "/readyz").await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = json(response).await;
        assert_eq!(body["checks"]["sqlite"]["ok"], true);
        assert_eq!(body["checks"]["object_store"]["ok"], true);

        let response = get(&app, "/api/v1/files/health").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json(response).await["bucket"], "uploads");
    }
}

use std::path::Path;

use chatwire_engine::{Artifact, Session, SessionId};
use reqwest::multipart::{Form, Part};
use snafu::{ResultExt, ensure};

use crate::error::{FetchResult, ReadUploadSnafu, UploadRejectedSnafu};
use crate::http::ApiEndpoint;
use crate::wire::{CreateSessionRequest, SessionBody};

/// Largest file the uploader accepts.
pub const MAX_UPLOAD_BYTES: u64 = 10 * 1024 * 1024;
/// Accepted upload extensions, compared case-insensitively.
pub const UPLOAD_EXTENSIONS: [&str; 2] = ["csv", "pdf"];

/// Session CRUD and file upload.
#[derive(Debug, Clone)]
pub struct SessionClient {
    endpoint: ApiEndpoint,
}

impl SessionClient {
    pub fn new(endpoint: ApiEndpoint) -> Self {
        Self { endpoint }
    }

    pub async fn create_session(&self, title: Option<String>) -> FetchResult<Session> {
        let stage = "create-session";
        let url = self.endpoint.url("sessions", stage)?;
        let request = self
            .endpoint
            .http()
            .post(url.clone())
            .json(&CreateSessionRequest { title });
        let body: SessionBody = self.endpoint.send_json(stage, &url, request).await?;

        let session = Session::from(body.session);
        tracing::info!(session_id = %session.id, title = %session.title, "created session");
        Ok(session)
    }

    pub async fn delete_session(&self, session_id: SessionId) -> FetchResult<()> {
        let stage = "delete-session";
        let url = self.endpoint.url(&format!("sessions/{session_id}"), stage)?;
        let request = self.endpoint.http().delete(url.clone());
        self.endpoint.send_checked(stage, &url, request).await?;

        tracing::info!(session_id = %session_id, "deleted session");
        Ok(())
    }

    /// Uploads a csv or pdf file and binds it to `session_id`.
    pub async fn upload(&self, session_id: SessionId, path: &Path) -> FetchResult<Artifact> {
        let file_name = validate_upload(path).await?;
        let bytes = tokio::fs::read(path).await.context(ReadUploadSnafu {
            stage: "read-upload",
            path: path.to_path_buf(),
        })?;

        let stage = "upload-file";
        let url = self.endpoint.url("upload", stage)?;
        let form = Form::new()
            .part("file", Part::bytes(bytes).file_name(file_name.clone()))
            .text("session_id", session_id.to_string());
        let request = self.endpoint.http().post(url.clone()).multipart(form);
        let artifact: Artifact = self.endpoint.send_json(stage, &url, request).await?;

        tracing::info!(
            session_id = %session_id,
            file_name = %artifact.file_name,
            "uploaded session file"
        );
        Ok(artifact)
    }
}

/// Applies the local upload rules and returns the file name to send.
async fn validate_upload(path: &Path) -> FetchResult<String> {
    let stage = "validate-upload";
    let extension = path
        .extension()
        .and_then(|extension| extension.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    ensure!(
        UPLOAD_EXTENSIONS.contains(&extension.as_str()),
        UploadRejectedSnafu {
            stage,
            path: path.to_path_buf(),
            reason: "only .csv and .pdf files are accepted",
        }
    );

    let metadata = tokio::fs::metadata(path).await.context(ReadUploadSnafu {
        stage,
        path: path.to_path_buf(),
    })?;
    ensure!(
        metadata.len() <= MAX_UPLOAD_BYTES,
        UploadRejectedSnafu {
            stage,
            path: path.to_path_buf(),
            reason: format!("file is larger than {} MiB", MAX_UPLOAD_BYTES / (1024 * 1024)),
        }
    );

    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("upload")
        .to_string();
    Ok(file_name)
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::time::Duration;

    use axum::extract::{Multipart, Path as RoutePath};
    use axum::http::StatusCode;
    use axum::routing::{delete, post};
    use axum::{Json, Router};
    use serde_json::{Value, json};
    use tokio::net::TcpListener;

    use super::*;
    use crate::FetchError;

    async fn serve(app: Router) -> SessionClient {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        SessionClient::new(
            ApiEndpoint::new(&format!("http://{addr}"), Duration::from_secs(5)).unwrap(),
        )
    }

    fn unreachable_client() -> SessionClient {
        // Port 9 is never served in tests; validation must fail before any request.
        SessionClient::new(ApiEndpoint::new("http://127.0.0.1:9", Duration::from_secs(1)).unwrap())
    }

    #[tokio::test]
    async fn create_session_sends_title_and_maps_the_response() {
        let app = Router::new().route(
            "/sessions",
            post(|Json(body): Json<Value>| async move {
                assert_eq!(body, json!({ "title": "Q3 revenue" }));
                (
                    StatusCode::CREATED,
                    Json(json!({
                        "session": { "id": 12, "title": "Q3 revenue", "created_at": "2024-05-01" }
                    })),
                )
            }),
        );
        let client = serve(app).await;

        let session = client
            .create_session(Some("Q3 revenue".to_string()))
            .await
            .unwrap();

        assert_eq!(session.id, SessionId::new(12));
        assert_eq!(session.title, "Q3 revenue");
        assert_eq!(session.artifact, None);
    }

    #[tokio::test]
    async fn delete_session_reports_failure_status() {
        let app = Router::new().route(
            "/sessions/:id",
            delete(|RoutePath(id): RoutePath<u64>| async move {
                if id == 1 {
                    StatusCode::NO_CONTENT
                } else {
                    StatusCode::NOT_FOUND
                }
            }),
        );
        let client = serve(app).await;

        client.delete_session(SessionId::new(1)).await.unwrap();
        let error = client.delete_session(SessionId::new(2)).await.unwrap_err();
        assert!(matches!(error, FetchError::Status { status: 404, .. }));
    }

    #[tokio::test]
    async fn upload_posts_file_and_session_fields() {
        let app = Router::new().route(
            "/upload",
            post(|mut multipart: Multipart| async move {
                let mut file_name = String::new();
                let mut session_id = String::new();
                let mut content = String::new();
                while let Some(field) = multipart.next_field().await.unwrap() {
                    let name = field.name().map(str::to_string);
                    match name.as_deref() {
                        Some("file") => {
                            file_name = field.file_name().unwrap_or_default().to_string();
                            content = field.text().await.unwrap();
                        }
                        Some("session_id") => session_id = field.text().await.unwrap(),
                        _ => {}
                    }
                }
                assert_eq!(session_id, "5");
                assert_eq!(content, "city,sales\nOslo,12\n");
                Json(json!({ "file_name": file_name, "file_path": format!("uploads/{file_name}") }))
            }),
        );
        let client = serve(app).await;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Sales.CSV");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(b"city,sales\nOslo,12\n").unwrap();

        let artifact = client.upload(SessionId::new(5), &path).await.unwrap();

        assert_eq!(artifact.file_name, "Sales.CSV");
        assert_eq!(artifact.file_path, "uploads/Sales.CSV");
    }

    #[tokio::test]
    async fn upload_rejects_unsupported_extension_before_any_request() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, "hello").unwrap();

        let error = unreachable_client()
            .upload(SessionId::new(1), &path)
            .await
            .unwrap_err();

        assert!(matches!(error, FetchError::UploadRejected { .. }));
    }

    #[tokio::test]
    async fn upload_rejects_oversized_files_before_any_request() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.pdf");
        let file = std::fs::File::create(&path).unwrap();
        file.set_len(MAX_UPLOAD_BYTES + 1).unwrap();

        let error = unreachable_client()
            .upload(SessionId::new(1), &path)
            .await
            .unwrap_err();

        assert!(matches!(error, FetchError::UploadRejected { .. }));
    }
}

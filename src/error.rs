use std::fmt;

use axum::{
    body::Body,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use thiserror::Error;
use tracing::error;
use uuid::Uuid;

use crate::{
    auth::scope::Denial,
    digest::{Digest, DigestError},
};

/// Kinds of object an operation can fail to find.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Resource {
    Repository,
    Blob,
    Manifest,
    Upload,
    Project,
    Webhook,
    Event,
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Resource::Repository => "repository",
            Resource::Blob => "blob",
            Resource::Manifest => "manifest",
            Resource::Upload => "upload",
            Resource::Project => "project",
            Resource::Webhook => "webhook",
            Resource::Event => "event",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Conflict {
    TagImmutable { repository: String, tag: String },
    ManifestReferenced { digest: Digest },
    Exists(String),
}

impl fmt::Display for Conflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Conflict::TagImmutable { repository, tag } => {
                write!(f, "tag {repository}:{tag} is immutable")
            }
            Conflict::ManifestReferenced { digest } => {
                write!(f, "manifest {digest} is still referenced by an index")
            }
            Conflict::Exists(what) => write!(f, "{what} already exists"),
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("digest mismatch: expected {expected}, computed {actual}")]
    DigestMismatch { expected: Digest, actual: Digest },
    #[error("invalid digest: {0}")]
    DigestInvalid(#[from] DigestError),
    #[error("chunk does not start at the current offset {offset}")]
    RangeMismatch { offset: u64 },
    #[error("{0} not found")]
    NotFound(Resource),
    #[error("authentication required")]
    Unauthorized,
    #[error("access denied: {0}")]
    Forbidden(Denial),
    #[error("conflict: {0}")]
    Conflict(Conflict),
    #[error("invalid manifest: {0}")]
    ManifestInvalid(String),
    #[error("manifest references unknown blob or manifest {0}")]
    ManifestBlobUnknown(Digest),
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("invalid request: {0}")]
    Invalid(String),
    #[error("webhook delivery failed: {0}")]
    DeliveryFailed(String),
    #[error("webhook event {0} has no attempts left")]
    ExhaustedRetries(Uuid),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

pub(crate) enum RegistryError {
    MustAuthenticate {
        challenge: String,
    },
    AccessDenied {
        reason: String,
    },
    RepositoryNotFound {},
    ManifestNotFound {},
    ManifestInvalid {
        detail: String,
    },
    ManifestBlobUnknown {
        digest: Digest,
    },
    DigestInvalid {
        detail: String,
    },
    BlobNotFound {},
    UploadNotFound {},
    UploadInvalid {
        detail: String,
    },
    RangeNotSatisfiable {
        repository: String,
        upload_id: String,
        size: u64,
    },
    BlobRangeNotSatisfiable {
        size: u64,
    },
    Conflict {
        conflict: Conflict,
    },
    Unsupported {
        detail: String,
    },
    NotFound {
        resource: Resource,
    },
    BadRequest {
        detail: String,
    },
    Unhandled(anyhow::Error),
}

fn format_error(e: &anyhow::Error) -> String {
    let mut s = String::new();
    s.push_str(&format!("{}", e));
    for cause in e.chain().skip(1) {
        s.push_str(&format!("\nCaused by: {}", cause));
    }
    s
}

pub(crate) fn simple_oci_error(code: &str, message: &str, detail: Option<String>) -> Body {
    let mut error = serde_json::json!({
        "code": code,
        "message": message,
    });

    if let Some(detail) = detail {
        error["detail"] = serde_json::Value::String(detail);
    }

    Body::from(serde_json::json!({ "errors": [error] }).to_string())
}

fn oci_response(status: StatusCode, code: &str, message: &str, detail: Option<String>) -> Response {
    (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        simple_oci_error(code, message, detail),
    )
        .into_response()
}

impl IntoResponse for RegistryError {
    fn into_response(self) -> Response {
        match self {
            Self::MustAuthenticate { challenge } => Response::builder()
                .status(StatusCode::UNAUTHORIZED)
                .header(header::CONTENT_TYPE, "application/json")
                .header(header::WWW_AUTHENTICATE, challenge)
                .body(simple_oci_error(
                    "UNAUTHORIZED",
                    "authentication required",
                    None,
                )),
            Self::AccessDenied { reason } => Ok(oci_response(
                StatusCode::FORBIDDEN,
                "DENIED",
                "requested access to the resource is denied",
                Some(reason),
            )),
            Self::RepositoryNotFound {} => Ok(oci_response(
                StatusCode::NOT_FOUND,
                "NAME_UNKNOWN",
                "repository name not known to registry",
                None,
            )),
            Self::ManifestNotFound {} => Ok(oci_response(
                StatusCode::NOT_FOUND,
                "MANIFEST_UNKNOWN",
                "manifest unknown",
                None,
            )),
            Self::ManifestInvalid { detail } => Ok(oci_response(
                StatusCode::BAD_REQUEST,
                "MANIFEST_INVALID",
                "manifest invalid",
                Some(detail),
            )),
            Self::ManifestBlobUnknown { digest } => Ok(oci_response(
                StatusCode::BAD_REQUEST,
                "MANIFEST_BLOB_UNKNOWN",
                "blob unknown to registry",
                Some(digest.to_string()),
            )),
            Self::DigestInvalid { detail } => Ok(oci_response(
                StatusCode::BAD_REQUEST,
                "DIGEST_INVALID",
                "provided digest did not match uploaded content",
                Some(detail),
            )),
            Self::BlobNotFound {} => Ok(oci_response(
                StatusCode::NOT_FOUND,
                "BLOB_UNKNOWN",
                "blob unknown to registry",
                None,
            )),
            Self::UploadNotFound {} => Ok(oci_response(
                StatusCode::NOT_FOUND,
                "BLOB_UPLOAD_UNKNOWN",
                "blob upload unknown to registry",
                None,
            )),
            Self::UploadInvalid { detail } => Ok(oci_response(
                StatusCode::BAD_REQUEST,
                "BLOB_UPLOAD_INVALID",
                "blob upload invalid",
                Some(detail),
            )),
            Self::RangeNotSatisfiable {
                repository,
                upload_id,
                size,
            } => {
                /*
                416 Range Not Satisfiable
                Location: /v2/<name>/blobs/uploads/<uuid>
                Range: 0-<offset>
                Content-Length: 0
                Docker-Upload-UUID: <uuid>
                */

                let range_end = if size > 0 { size - 1 } else { 0 };

                Response::builder()
                    .status(StatusCode::RANGE_NOT_SATISFIABLE)
                    .header(
                        header::LOCATION,
                        format!("/v2/{repository}/blobs/uploads/{upload_id}"),
                    )
                    .header("Range", format!("0-{range_end}"))
                    .header(header::CONTENT_LENGTH, "0")
                    .header("Docker-Upload-UUID", upload_id.clone())
                    .body(Body::empty())
            }
            Self::BlobRangeNotSatisfiable { size } => Response::builder()
                .status(StatusCode::RANGE_NOT_SATISFIABLE)
                .header(header::CONTENT_RANGE, format!("bytes */{size}"))
                .header(header::CONTENT_LENGTH, "0")
                .body(Body::empty()),
            Self::Conflict { conflict } => {
                let code = match conflict {
                    Conflict::TagImmutable { .. } => "TAG_IMMUTABLE",
                    _ => "CONFLICT",
                };
                Ok(oci_response(
                    StatusCode::CONFLICT,
                    code,
                    "operation conflicts with current state",
                    Some(conflict.to_string()),
                ))
            }
            Self::Unsupported { detail } => Ok(oci_response(
                StatusCode::UNSUPPORTED_MEDIA_TYPE,
                "UNSUPPORTED",
                "the operation is unsupported",
                Some(detail),
            )),
            Self::NotFound { resource } => Ok(oci_response(
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
                &format!("{resource} not found"),
                None,
            )),
            Self::BadRequest { detail } => Ok(oci_response(
                StatusCode::BAD_REQUEST,
                "BAD_REQUEST",
                "request invalid",
                Some(detail),
            )),
            Self::Unhandled(err) => {
                error!(
                    error = %format_error(&err),
                    backtrace = ?err.backtrace(),
                    "Registry error"
                );
                Response::builder()
                    .status(StatusCode::INTERNAL_SERVER_ERROR)
                    .body(Body::empty())
            }
        }
        .unwrap_or_else(|err| {
            let err = err.into();
            error!(
                error = %format_error(&err),
                backtrace = ?err.backtrace(),
                "Registry error"
            );
            (StatusCode::INTERNAL_SERVER_ERROR, Body::empty()).into_response()
        })
    }
}

impl From<Error> for RegistryError {
    fn from(err: Error) -> Self {
        match err {
            Error::DigestMismatch { .. } => Self::DigestInvalid {
                detail: err.to_string(),
            },
            Error::DigestInvalid(inner) => Self::DigestInvalid {
                detail: inner.to_string(),
            },
            Error::RangeMismatch { offset } => Self::UploadInvalid {
                detail: format!("expected offset {offset}"),
            },
            Error::NotFound(Resource::Repository) => Self::RepositoryNotFound {},
            Error::NotFound(Resource::Blob) => Self::BlobNotFound {},
            Error::NotFound(Resource::Manifest) => Self::ManifestNotFound {},
            Error::NotFound(Resource::Upload) => Self::UploadNotFound {},
            Error::NotFound(resource) => Self::NotFound { resource },
            Error::Unauthorized => Self::MustAuthenticate {
                challenge: "Basic realm=\"wharf\"".to_string(),
            },
            Error::Forbidden(denial) => Self::AccessDenied {
                reason: denial.to_string(),
            },
            Error::Conflict(conflict) => Self::Conflict { conflict },
            Error::ManifestInvalid(detail) => Self::ManifestInvalid { detail },
            Error::ManifestBlobUnknown(digest) => Self::ManifestBlobUnknown { digest },
            Error::Unsupported(detail) => Self::Unsupported { detail },
            Error::Invalid(detail) => Self::BadRequest { detail },
            Error::DeliveryFailed(_) | Error::ExhaustedRetries(_) => {
                Self::Unhandled(anyhow::Error::new(err))
            }
            Error::Io(err) => Self::Unhandled(err.into()),
            Error::Internal(err) => Self::Unhandled(err),
        }
    }
}

impl From<anyhow::Error> for RegistryError {
    fn from(err: anyhow::Error) -> Self {
        Self::Unhandled(err)
    }
}

impl From<std::io::Error> for RegistryError {
    fn from(err: std::io::Error) -> Self {
        Self::Unhandled(err.into())
    }
}

impl From<axum::http::Error> for RegistryError {
    fn from(err: axum::http::Error) -> Self {
        Self::Unhandled(err.into())
    }
}

impl From<serde_json::Error> for RegistryError {
    fn from(err: serde_json::Error) -> Self {
        Self::Unhandled(err.into())
    }
}

#[cfg(test)]
mod tests {
    use http_body_util::BodyExt;
    use serde_json::{Value, json};

    use super::*;

    async fn body_json(res: Response) -> Value {
        let body = res.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn not_found_kinds_map_to_oci_codes() {
        let cases = [
            (Resource::Blob, "BLOB_UNKNOWN"),
            (Resource::Manifest, "MANIFEST_UNKNOWN"),
            (Resource::Upload, "BLOB_UPLOAD_UNKNOWN"),
            (Resource::Repository, "NAME_UNKNOWN"),
        ];

        for (resource, code) in cases {
            let res = RegistryError::from(Error::NotFound(resource)).into_response();
            assert_eq!(res.status(), StatusCode::NOT_FOUND);
            assert_eq!(body_json(res).await["errors"][0]["code"], code);
        }
    }

    #[tokio::test]
    async fn immutable_tag_is_409() {
        let res = RegistryError::from(Error::Conflict(Conflict::TagImmutable {
            repository: "library/nginx".into(),
            tag: "v1".into(),
        }))
        .into_response();

        assert_eq!(res.status(), StatusCode::CONFLICT);
        assert_eq!(
            body_json(res).await,
            json!({"errors": [{
                "code": "TAG_IMMUTABLE",
                "message": "operation conflicts with current state",
                "detail": "tag library/nginx:v1 is immutable",
            }]})
        );
    }

    #[tokio::test]
    async fn denial_reason_is_detail() {
        let res = RegistryError::from(Error::Forbidden(Denial::MalformedScopes)).into_response();

        assert_eq!(res.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            body_json(res).await["errors"][0]["detail"],
            "malformed-scopes"
        );
    }

    #[tokio::test]
    async fn blob_range_not_satisfiable() {
        let res = RegistryError::BlobRangeNotSatisfiable { size: 10 }.into_response();

        assert_eq!(res.status(), StatusCode::RANGE_NOT_SATISFIABLE);
        assert_eq!(res.headers()[header::CONTENT_RANGE], "bytes */10");
    }

    #[tokio::test]
    async fn internal_errors_have_no_body() {
        let res = RegistryError::from(Error::Internal(anyhow::anyhow!("disk on fire")))
            .into_response();

        assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = res.into_body().collect().await.unwrap().to_bytes();
        assert!(body.is_empty());
    }
}

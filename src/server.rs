//! HTTP surfaces: the report ingestion endpoint and the operator API.
//!
//! Ingestion is fire-and-forget from the browser's side. Every request gets
//! `204 No Content` whether the report was kept or dropped; only bodies over
//! the size limit are answered differently (`413`, from the body limit
//! layer) and requests that outlive the request deadline (`408`, from the
//! timeout layer). Nothing about routing decisions leaks back to the sender.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Path, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::middleware;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Local};
use serde::Serialize;
use thiserror::Error;
use tower_http::timeout::TimeoutLayer;
use tracing::{debug, error, warn};

use crate::aggregator::FlushResult;
use crate::archive::ArchiveInfo;
use crate::context::AppContext;
use crate::report::CspReport;

/// What happened to an ingested body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Buffered for the named domain
    Accepted(String),

    /// Not a parsable report, or no usable document URI
    Malformed,

    /// Document host is not whitelisted
    UnknownDomain(String),
}

/// Route one raw report body to its domain and the forwarder.
pub async fn ingest_report(ctx: &AppContext, body: Bytes) -> IngestOutcome {
    let report = match CspReport::parse(&body) {
        Ok(report) => report,
        Err(e) => {
            debug!(error = %e, "Dropping malformed report");
            return IngestOutcome::Malformed;
        }
    };

    let host = match report.document_host() {
        Ok(host) => host,
        Err(e) => {
            debug!(error = %e, "Dropping report without usable document-uri");
            return IngestOutcome::Malformed;
        }
    };

    let Some(aggregator) = ctx.domain(&host).cloned() else {
        debug!(host = %host, "Dropping report for domain not on whitelist");
        return IngestOutcome::UnknownDomain(host);
    };

    let text = String::from_utf8_lossy(&body).into_owned();
    debug!(domain = %host, report = %text, "Report accepted");

    let raw = body.clone();
    if let Err(e) = tokio::task::spawn_blocking(move || aggregator.append(&raw)).await {
        error!(domain = %host, error = %e, "Append task panicked");
    }

    ctx.forward(&host, &text);
    IngestOutcome::Accepted(host)
}

async fn ingest(State(ctx): State<Arc<AppContext>>, body: Bytes) -> StatusCode {
    ingest_report(&ctx, body).await;
    StatusCode::NO_CONTENT
}

/// Router for browser-submitted reports. Accepts any path.
///
/// The request deadline covers reading the body, so a stalled client is cut
/// off instead of holding its connection open.
pub fn ingest_router(ctx: Arc<AppContext>) -> Router {
    let limit = ctx.max_report_size();
    let deadline = ctx.request_timeout();
    Router::new()
        .route("/", post(ingest))
        .route("/csp", post(ingest))
        .fallback(ingest)
        .layer(DefaultBodyLimit::max(limit))
        .layer(TimeoutLayer::new(deadline))
        .with_state(ctx)
}

/// Operator API errors
#[derive(Debug, Error)]
pub enum AdminError {
    #[error("unknown domain: {0}")]
    UnknownDomain(String),

    #[error("internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

impl IntoResponse for AdminError {
    fn into_response(self) -> Response {
        let status = match self {
            AdminError::UnknownDomain(_) => StatusCode::NOT_FOUND,
            AdminError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            warn!(error = %self, "Operator request failed");
        }
        (
            status,
            Json(ErrorResponse {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}

#[derive(Debug, Serialize)]
pub struct DomainSummary {
    pub name: String,
    pub live_count: u64,
}

#[derive(Debug, Serialize)]
pub struct DomainDetail {
    pub name: String,
    pub live_count: u64,
    pub last_flush: DateTime<Local>,
    pub archives: Vec<ArchiveInfo>,
}

#[derive(Debug, Serialize)]
pub struct FlushResponse {
    pub domain: String,
    pub written: Vec<String>,
    /// Sealed archives still waiting for a successful write
    pub pending: usize,
}

impl FlushResponse {
    fn new(domain: String, result: FlushResult) -> Self {
        let (paths, pending) = match result {
            FlushResult::Written(paths) => (paths, 0),
            FlushResult::Partial { written, pending } => (written, pending),
            FlushResult::Empty => (Vec::new(), 0),
        };
        let written = paths
            .iter()
            .filter_map(|p| p.file_name().and_then(|n| n.to_str()).map(str::to_string))
            .collect();
        Self {
            domain,
            written,
            pending,
        }
    }
}

async fn list_domains(State(ctx): State<Arc<AppContext>>) -> Json<Vec<DomainSummary>> {
    let domains = ctx
        .domains()
        .iter()
        .map(|agg| DomainSummary {
            name: agg.name().to_string(),
            live_count: agg.count(),
        })
        .collect();
    Json(domains)
}

async fn domain_detail(
    State(ctx): State<Arc<AppContext>>,
    Path(domain): Path<String>,
) -> Result<Json<DomainDetail>, AdminError> {
    let agg = ctx
        .domain(&domain)
        .ok_or_else(|| AdminError::UnknownDomain(domain.clone()))?;

    let archives = ctx
        .domain_archives(&domain)
        .map_err(|e| AdminError::Internal(format!("listing archives: {}", e)))?;

    Ok(Json(DomainDetail {
        name: domain,
        live_count: agg.count(),
        last_flush: agg.last_flush(),
        archives,
    }))
}

async fn flush_domain(
    State(ctx): State<Arc<AppContext>>,
    Path(domain): Path<String>,
) -> Result<Json<FlushResponse>, AdminError> {
    let agg = ctx
        .domain(&domain)
        .cloned()
        .ok_or_else(|| AdminError::UnknownDomain(domain.clone()))?;

    let result = tokio::task::spawn_blocking(move || agg.flush())
        .await
        .map_err(|e| AdminError::Internal(format!("flush task: {}", e)))?
        .map_err(|e| AdminError::Internal(e.to_string()))?;

    Ok(Json(FlushResponse::new(domain, result)))
}

/// Attach a freshly rendered policy header to every operator response.
async fn attach_policy(State(ctx): State<Arc<AppContext>>, mut response: Response) -> Response {
    let (_nonce, policy) = ctx.policy().issue();
    match HeaderValue::from_str(&policy) {
        Ok(value) => {
            response
                .headers_mut()
                .insert(header::CONTENT_SECURITY_POLICY, value);
        }
        Err(e) => warn!(error = %e, "Rendered policy is not a valid header value"),
    }
    response
}

/// Router for operators: live counts, archive listings and on-demand flushes.
pub fn admin_router(ctx: Arc<AppContext>) -> Router {
    Router::new()
        .route("/domains", get(list_domains))
        .route("/domains/:domain", get(domain_detail))
        .route("/flush/:domain", post(flush_domain))
        .layer(middleware::map_response_with_state(ctx.clone(), attach_policy))
        .with_state(ctx)
}

//! Violation report wire types.
//!
//! Browsers POST a JSON document wrapping the violation in a `csp-report`
//! key. Only `document-uri` matters for routing; the rest is kept so the
//! payload can be inspected in logs and tests. The raw body, not this
//! struct, is what gets archived and forwarded.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

/// Envelope sent by the browser.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CspReport {
    #[serde(rename = "csp-report")]
    pub report: ViolationReport,
}

/// A single policy violation.
///
/// Every field is optional on the wire; browsers disagree on which ones they
/// send, so missing fields default to empty/zero.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ViolationReport {
    pub blocked_uri: String,
    pub document_uri: String,
    pub line_number: i64,
    pub original_policy: String,
    pub referrer: String,
    pub script_sample: String,
    pub source_file: String,
    pub violated_directive: String,
    pub effective_directive: String,
    pub disposition: String,
    pub status_code: i64,
    pub column_number: i64,
}

/// Reasons a body cannot be routed to a domain.
#[derive(Debug, Error)]
pub enum ReportError {
    #[error("malformed report: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("invalid document-uri '{uri}': {message}")]
    InvalidDocumentUri { uri: String, message: String },

    #[error("document-uri '{0}' has no host")]
    NoHost(String),
}

impl CspReport {
    /// Parse a raw request body.
    pub fn parse(body: &[u8]) -> Result<Self, ReportError> {
        Ok(serde_json::from_slice(body)?)
    }

    /// Lower-cased hostname of the page that produced the violation, without port.
    pub fn document_host(&self) -> Result<String, ReportError> {
        let uri = &self.report.document_uri;
        let url = Url::parse(uri).map_err(|e| ReportError::InvalidDocumentUri {
            uri: uri.clone(),
            message: e.to_string(),
        })?;

        url.host_str()
            .map(|h| h.trim_end_matches('.').to_ascii_lowercase())
            .filter(|h| !h.is_empty())
            .ok_or_else(|| ReportError::NoHost(uri.clone()))
    }
}

//! Content-Security-Policy header rendering for pages served by the collector.
//!
//! Each response gets a fresh nonce; the policy string is produced from a
//! template with `{nonce}` and `{report_uri}` placeholders.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::RngCore;

/// Random bytes per nonce (24 base64 characters)
const NONCE_BYTES: usize = 18;

/// Locked-down policy used when no template is configured.
pub const DEFAULT_POLICY_TEMPLATE: &str = "default-src 'none'; script-src 'nonce-{nonce}'; \
     style-src 'none'; media-src 'none'; img-src 'self' data:; child-src 'none'; \
     frame-src 'none'; frame-ancestors 'none'; object-src 'none'; base-uri 'none'; \
     font-src 'none'; connect-src 'none'; report-uri https://{report_uri}/csp;";

/// A fresh base64-encoded nonce.
pub fn generate_nonce() -> String {
    let mut bytes = [0u8; NONCE_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    STANDARD.encode(bytes)
}

/// Policy template bound to the collector's report URI.
#[derive(Debug, Clone)]
pub struct PolicyTemplate {
    template: String,
    report_uri: String,
}

impl PolicyTemplate {
    /// Build from a template; newlines are folded into spaces so multi-line
    /// templates still produce a valid header value.
    pub fn new(template: impl Into<String>, report_uri: impl Into<String>) -> Self {
        let template = template.into().replace(['\r', '\n'], " ");
        Self {
            template,
            report_uri: report_uri.into(),
        }
    }

    pub fn with_default(report_uri: impl Into<String>) -> Self {
        Self::new(DEFAULT_POLICY_TEMPLATE, report_uri)
    }

    /// Render the policy for a given nonce.
    pub fn render(&self, nonce: &str) -> String {
        self.template
            .replace("{nonce}", nonce)
            .replace("{report_uri}", &self.report_uri)
    }

    /// A new nonce and the policy that allows it.
    pub fn issue(&self) -> (String, String) {
        let nonce = generate_nonce();
        let policy = self.render(&nonce);
        (nonce, policy)
    }
}

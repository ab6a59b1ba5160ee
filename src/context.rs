//! Application context shared by every request handler.
//!
//! Built once at startup from the configuration and never mutated after;
//! handlers receive it as `Arc<AppContext>` through router state.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::aggregator::{Clock, DomainAggregator, FlushResult};
use crate::archive::{list_archives, list_domain_archives, ArchiveError, ArchiveInfo};
use crate::config::Config;
use crate::forwarder::{DispatchError, ForwarderSender};
use crate::policy::PolicyTemplate;

pub struct AppContext {
    /// Aggregators in whitelist order
    domains: Vec<Arc<DomainAggregator>>,
    index: HashMap<String, usize>,
    archive_dir: PathBuf,
    max_report_size: usize,
    request_timeout: Duration,
    forwarder: Option<ForwarderSender>,
    policy: PolicyTemplate,
}

impl AppContext {
    /// Create one aggregator per whitelisted domain.
    pub fn new(
        config: &Config,
        clock: Arc<dyn Clock>,
        forwarder: Option<ForwarderSender>,
    ) -> Result<Self, ArchiveError> {
        let mut domains = Vec::with_capacity(config.domains.len());
        let mut index = HashMap::with_capacity(config.domains.len());

        for name in &config.domains {
            let aggregator = DomainAggregator::new(
                name.clone(),
                config.archive_dir.clone(),
                config.max_reports_per_archive,
                clock.clone(),
            )?;
            index.insert(name.clone(), domains.len());
            domains.push(Arc::new(aggregator));
        }

        Ok(Self {
            domains,
            index,
            archive_dir: config.archive_dir.clone(),
            max_report_size: config.max_report_size,
            request_timeout: config.request_timeout,
            forwarder,
            policy: PolicyTemplate::with_default(config.policy_report_uri.clone()),
        })
    }

    /// Aggregator for an exact domain name.
    pub fn domain(&self, name: &str) -> Option<&Arc<DomainAggregator>> {
        self.index.get(name).map(|&i| &self.domains[i])
    }

    pub fn domains(&self) -> &[Arc<DomainAggregator>] {
        &self.domains
    }

    pub fn archive_dir(&self) -> &Path {
        &self.archive_dir
    }

    pub fn max_report_size(&self) -> usize {
        self.max_report_size
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    pub fn policy(&self) -> &PolicyTemplate {
        &self.policy
    }

    /// Live buffered count for display; `None` for unknown domains.
    pub fn live_count(&self, domain: &str) -> Option<u64> {
        self.domain(domain).map(|agg| agg.count())
    }

    /// Flush one domain on demand; `None` for unknown domains.
    pub fn flush(&self, domain: &str) -> Option<Result<FlushResult, ArchiveError>> {
        self.domain(domain).map(|agg| agg.flush())
    }

    /// Flush every domain, logging failures. Used at shutdown.
    pub fn flush_all(&self) {
        for agg in &self.domains {
            if let Err(e) = agg.flush() {
                warn!(domain = %agg.name(), error = %e, "Flush failed");
            }
        }
    }

    /// Archives whose names start with `prefix`.
    pub fn list_archives(&self, prefix: &str) -> io::Result<Vec<ArchiveInfo>> {
        list_archives(&self.archive_dir, prefix)
    }

    /// Archives belonging to exactly `domain`.
    pub fn domain_archives(&self, domain: &str) -> io::Result<Vec<ArchiveInfo>> {
        list_domain_archives(&self.archive_dir, domain)
    }

    /// Hand a raw report to the forwarder queue, if forwarding is enabled.
    pub fn forward(&self, domain: &str, body: &str) {
        let Some(forwarder) = &self.forwarder else {
            return;
        };

        match forwarder.try_forward(domain, body) {
            Ok(()) => {}
            Err(DispatchError::Full) => {
                warn!(domain = %domain, "Forward queue full, dropping report");
            }
            Err(DispatchError::Closed) => {
                debug!(domain = %domain, "Forwarder closed, dropping report");
            }
        }
    }
}

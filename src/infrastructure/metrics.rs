//! Authentication counters
//!
//! Every counter is kept twice: as an in-process atomic, readable through
//! [`AuthStats::snapshot`], and as a `metrics` counter for whatever recorder
//! the embedding process installs.

use metrics::{counter, describe_counter};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Describe the exported metrics
pub fn describe_metrics() {
    describe_counter!(
        "auth_retrieve_total",
        "Credential retrievals, by mode (sync or async)"
    );
    describe_counter!(
        "auth_password_lookups_total",
        "Credential lookups, by outcome (found or not)"
    );
    describe_counter!(
        "auth_backend_errors_total",
        "Credential lookups that failed in the backend"
    );
    describe_counter!(
        "auth_decisions_total",
        "Authentication decisions, by outcome"
    );
}

/// Final outcome of one authentication decision, as counted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionOutcome {
    TrustedHost,
    TlsCertificate,
    Digest,
    Challenged,
    Rejected,
    TestAccount,
    Terminated,
}

impl DecisionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionOutcome::TrustedHost => "trusted_host",
            DecisionOutcome::TlsCertificate => "tls_certificate",
            DecisionOutcome::Digest => "digest",
            DecisionOutcome::Challenged => "challenged",
            DecisionOutcome::Rejected => "rejected",
            DecisionOutcome::TestAccount => "test_account",
            DecisionOutcome::Terminated => "terminated",
        }
    }
}

/// Counters of the authentication engine
#[derive(Debug, Default)]
pub struct AuthStats {
    async_retrieve: AtomicU64,
    sync_retrieve: AtomicU64,
    password_found: AtomicU64,
    password_not_found: AtomicU64,
    backend_errors: AtomicU64,
}

/// Point-in-time copy of [`AuthStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct AuthStatsSnapshot {
    pub count_async_retrieve: u64,
    pub count_sync_retrieve: u64,
    pub count_password_found: u64,
    pub count_password_not_found: u64,
    pub count_backend_error: u64,
}

impl AuthStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_async_retrieve(&self) {
        self.async_retrieve.fetch_add(1, Ordering::Relaxed);
        counter!("auth_retrieve_total", "mode" => "async").increment(1);
    }

    pub fn record_sync_retrieve(&self) {
        self.sync_retrieve.fetch_add(1, Ordering::Relaxed);
        counter!("auth_retrieve_total", "mode" => "sync").increment(1);
    }

    /// Outcome of one credential lookup
    pub fn record_password_fetch(&self, found: bool) {
        if found {
            self.password_found.fetch_add(1, Ordering::Relaxed);
        } else {
            self.password_not_found.fetch_add(1, Ordering::Relaxed);
        }
        counter!("auth_password_lookups_total", "found" => found.to_string()).increment(1);
    }

    pub fn record_backend_error(&self) {
        self.backend_errors.fetch_add(1, Ordering::Relaxed);
        counter!("auth_backend_errors_total").increment(1);
    }

    pub fn record_decision(&self, outcome: DecisionOutcome) {
        counter!("auth_decisions_total", "outcome" => outcome.as_str()).increment(1);
    }

    pub fn snapshot(&self) -> AuthStatsSnapshot {
        AuthStatsSnapshot {
            count_async_retrieve: self.async_retrieve.load(Ordering::Relaxed),
            count_sync_retrieve: self.sync_retrieve.load(Ordering::Relaxed),
            count_password_found: self.password_found.load(Ordering::Relaxed),
            count_password_not_found: self.password_not_found.load(Ordering::Relaxed),
            count_backend_error: self.backend_errors.load(Ordering::Relaxed),
        }
    }
}

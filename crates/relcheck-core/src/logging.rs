use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};

use crate::config::{LogConfig, LogFormat};
use crate::engine::{
    CheckError, CheckRequest, CheckResult, ExpandRequest, ExpandResult, LookupRequest, LookupResult,
};

const DECISION_TARGET: &str = "relcheck::decision";

/// Installs the global subscriber. `RUST_LOG` wins over `config.level`.
/// Fails if a global subscriber is already set.
pub fn init_logging(config: &LogConfig) -> Result<(), TryInitError> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));
    let registry = tracing_subscriber::registry().with(filter);

    match config.format {
        LogFormat::Json => {
            let fmt_layer = tracing_subscriber::fmt::layer().json();
            registry.with(fmt_layer).try_init()
        }
        LogFormat::Pretty => {
            let fmt_layer = tracing_subscriber::fmt::layer().pretty();
            registry.with(fmt_layer).try_init()
        }
    }
}

pub(crate) fn check_decided(request: &CheckRequest, result: &CheckResult) {
    tracing::debug!(
        target: DECISION_TARGET,
        event = "check",
        tenant_id = %request.tenant_id,
        entity = %request.entity,
        permission = request.permission.as_str(),
        subject = %request.subject,
        allowed = result.allowed,
        check_count = result.check_count,
        snapshot = result.snapshot.value(),
        schema_version = result.schema_version.as_str(),
        "check decided"
    );
}

pub(crate) fn check_failed(request: &CheckRequest, error: &CheckError) {
    tracing::debug!(
        target: DECISION_TARGET,
        event = "check",
        tenant_id = %request.tenant_id,
        entity = %request.entity,
        permission = request.permission.as_str(),
        subject = %request.subject,
        kind = ?error.kind(),
        error = %error,
        "check failed"
    );
}

pub(crate) fn lookup_completed(request: &LookupRequest, result: &LookupResult) {
    tracing::debug!(
        target: DECISION_TARGET,
        event = "lookup",
        tenant_id = %request.tenant_id,
        entity_type = request.entity_type.as_str(),
        permission = request.permission.as_str(),
        subject = %request.subject,
        matched = result.entity_ids.len(),
        skipped = result.skipped.len(),
        check_count = result.check_count,
        snapshot = result.snapshot.value(),
        "lookup completed"
    );
}

pub(crate) fn lookup_failed(request: &LookupRequest, error: &CheckError) {
    tracing::debug!(
        target: DECISION_TARGET,
        event = "lookup",
        tenant_id = %request.tenant_id,
        entity_type = request.entity_type.as_str(),
        permission = request.permission.as_str(),
        subject = %request.subject,
        kind = ?error.kind(),
        error = %error,
        "lookup failed"
    );
}

pub(crate) fn expand_completed(request: &ExpandRequest, result: &ExpandResult) {
    tracing::debug!(
        target: DECISION_TARGET,
        event = "expand",
        tenant_id = %request.tenant_id,
        entity = %request.entity,
        permission = request.permission.as_str(),
        subjects = result.tree.direct_subjects().len(),
        snapshot = result.snapshot.value(),
        schema_version = result.schema_version.as_str(),
        "expand completed"
    );
}

pub(crate) fn expand_failed(request: &ExpandRequest, error: &CheckError) {
    tracing::debug!(
        target: DECISION_TARGET,
        event = "expand",
        tenant_id = %request.tenant_id,
        entity = %request.entity,
        permission = request.permission.as_str(),
        kind = ?error.kind(),
        error = %error,
        "expand failed"
    );
}

pub(crate) fn candidate_skipped(request: &LookupRequest, entity_id: &str, error: &CheckError) {
    tracing::warn!(
        target: DECISION_TARGET,
        event = "lookup_candidate_skipped",
        tenant_id = %request.tenant_id,
        entity_type = request.entity_type.as_str(),
        entity_id = entity_id,
        permission = request.permission.as_str(),
        kind = ?error.kind(),
        error = %error,
        "lookup candidate skipped"
    );
}

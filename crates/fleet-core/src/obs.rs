//! Structured events for candidate and status lifecycles.
//!
//! Every event carries an `event` field so log pipelines can key on it
//! without parsing messages.

use fleet_state::ContentDigest;
use tracing::{info, warn};

/// RAII guard that tags everything logged while it lives with a build and candidate.
pub struct CandidateSpan {
    _span: tracing::span::EnteredSpan,
}

impl CandidateSpan {
    pub fn enter(build_name: &str, version: &str) -> Self {
        let span = tracing::info_span!("fleet.candidate", build = %build_name, version = %version);
        Self {
            _span: span.entered(),
        }
    }
}

pub fn emit_candidate_published(build_name: &str, version: &str, commit: Option<&str>, attempts: u32) {
    info!(
        event = "candidate.published",
        build = %build_name,
        version = %version,
        commit = commit.unwrap_or("unknown"),
        attempts = attempts,
    );
}

/// Someone else pushed first; the publish will refresh and retry.
pub fn emit_publish_rejected(version: &str, attempt: u32) {
    warn!(event = "candidate.push_rejected", version = %version, attempt = attempt);
}

pub fn emit_candidate_skipped(build_name: &str, latest: &str) {
    info!(
        event = "candidate.skipped",
        build = %build_name,
        latest = %latest,
        "checkout already built, no new candidate",
    );
}

pub fn emit_candidate_promoted(version: &str, digest: &ContentDigest) {
    info!(event = "candidate.promoted", version = %version, digest = %digest.short());
}

pub fn emit_builder_status(builder: &str, version: &str, status: &str) {
    info!(event = "builder.status", builder = %builder, version = %version, status = %status);
}

pub fn emit_status_timeout(version: &str, waiting_on: &[String]) {
    warn!(
        event = "builder.status_timeout",
        version = %version,
        waiting_on = %waiting_on.join(","),
    );
}

pub fn emit_suspects_found(changes: usize, suspects: usize, blame_everything: bool) {
    info!(
        event = "blame.suspects",
        changes = changes,
        suspects = suspects,
        blame_everything = blame_everything,
    );
}

pub fn emit_blamelist_entry(change: &str, chump: bool) {
    info!(event = "blame.blamelist_entry", change = %change, chump = chump);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn span_and_events_do_not_panic() {
        let _span = CandidateSpan::enter("x86-generic-paladin", "5100.0.0-rc1");
        emit_candidate_published("x86-generic-paladin", "5100.0.0-rc1", None, 1);
        emit_status_timeout("5100.0.0-rc1", &["a".to_string(), "b".to_string()]);
    }
}

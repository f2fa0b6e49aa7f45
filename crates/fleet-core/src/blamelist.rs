//! Changes landed since the last known good manifest.
//!
//! For every project the LKGM pins, the commits between that pin and the
//! checkout's HEAD are scanned for `Reviewed-on:` trailers. A change whose
//! committer is not a trusted bot was landed by hand: a chump.

use std::collections::HashSet;
use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::checkout::SourceCheckout;
use crate::error::Result;
use crate::git::GitOps;
use crate::manifest::Manifest;
use crate::obs;

/// One reviewed change in the blamelist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlameEntry {
    /// Last component of the project name.
    pub project: String,
    pub author: Option<String>,
    pub change_number: String,
    pub url: String,
    /// Landed without going through a trusted committer.
    pub chump: bool,
}

impl fmt::Display for BlameEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.chump {
            f.write_str("CHUMP | ")?;
        }
        write!(
            f,
            "{} | {} | {}",
            self.project,
            self.author.as_deref().unwrap_or("unknown"),
            self.change_number
        )
    }
}

struct Patterns {
    reviewed_on: Regex,
    author: Regex,
    committer: Regex,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| Patterns {
        reviewed_on: Regex::new(r"^\s*Reviewed-on:\s*(\S+)").expect("static regex"),
        author: Regex::new(r"^\s*Author:.*<(\S+)@\S+>\s*").expect("static regex"),
        committer: Regex::new(r"^\s*Commit:.*<(\S+)@\S+>\s*").expect("static regex"),
    })
}

/// Entries for every reviewed change in a `git log --pretty=full` dump of `project`.
pub fn parse_log(project: &str, log: &str, trusted_committers: &[String]) -> Vec<BlameEntry> {
    let p = patterns();
    let short_project = project.rsplit('/').next().unwrap_or(project);

    let mut author: Option<String> = None;
    let mut committer: Option<String> = None;
    let mut entries = Vec::new();
    for line in log.lines() {
        if let Some(caps) = p.author.captures(line) {
            author = Some(caps[1].to_string());
        }
        if let Some(caps) = p.committer.captures(line) {
            committer = Some(caps[1].to_string());
        }
        if let Some(caps) = p.reviewed_on.captures(line) {
            let url = caps[1].to_string();
            let change_number = url.rsplit('/').next().unwrap_or(&url).to_string();
            let chump = !committer
                .as_ref()
                .is_some_and(|c| trusted_committers.iter().any(|t| t == c));
            entries.push(BlameEntry {
                project: short_project.to_string(),
                author: author.clone(),
                change_number,
                url,
                chump,
            });
        }
    }
    entries
}

/// Blamelist of `checkout` relative to the `lkgm` pins.
///
/// Projects missing from the checkout, and projects whose pinned revision
/// the checkout does not know, are skipped with a warning. A change
/// cherry-picked into several projects is listed once.
pub async fn generate_blamelist(
    lkgm: &Manifest,
    checkout: &dyn SourceCheckout,
    git: &dyn GitOps,
    trusted_committers: &[String],
    only_chumps: bool,
) -> Result<Vec<BlameEntry>> {
    let mut seen = HashSet::new();
    let mut blamelist = Vec::new();

    for project in lkgm.projects()? {
        let Some(revision) = project.revision.as_deref().filter(|r| !r.is_empty()) else {
            continue;
        };
        let dir = checkout.project_dir(&project);
        if !dir.exists() {
            info!(project = %project.name, "project removed from checkout, skipping");
            continue;
        }

        let Some(log) = git.log_since(&dir, revision).await? else {
            warn!(project = %project.name, revision, "pinned revision missing from checkout");
            continue;
        };

        for entry in parse_log(&project.name, &log, trusted_committers) {
            if only_chumps && !entry.chump {
                continue;
            }
            if seen.insert(entry.url.clone()) {
                obs::emit_blamelist_entry(&entry.url, entry.chump);
                blamelist.push(entry);
            }
        }
    }
    Ok(blamelist)
}

//! Failure taxonomy for build stages.
//!
//! Every stage failure is a [`StepFailure`]. Infrastructure failures are
//! compound: they own the ordered list of [`FailureRecord`]s that caused
//! them, and every query (`has_failure_type`, `matches_failure_type`,
//! `has_fatal_failure`) looks at that list, never at the compound's own kind.
//! [`wrap_failure`] re-types an arbitrary error into a compound kind at a
//! unit-of-work boundary.

use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;

use fleet_state::{BuildStatus, BuilderStatus};
use serde::{Deserialize, Serialize};

/// Every node of the failure hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Step,
    RetriableStep,
    BuildScript,
    PackageBuild,
    Compound,
    Infrastructure,
    TestLab,
    GoB,
    GoBQuery,
    GoBSubmit,
    GoBFetch,
    Gs,
    GsUpload,
    GsDownload,
    Builder,
    CrashCollection,
}

impl FailureKind {
    pub fn parent(self) -> Option<FailureKind> {
        use FailureKind::*;
        match self {
            Step => None,
            RetriableStep | BuildScript | Compound => Some(Step),
            PackageBuild => Some(BuildScript),
            Infrastructure => Some(Compound),
            TestLab | GoB | Gs | Builder | CrashCollection => Some(Infrastructure),
            GoBQuery | GoBSubmit | GoBFetch => Some(GoB),
            GsUpload | GsDownload => Some(Gs),
        }
    }

    /// True when `self` is `ancestor` or descends from it.
    pub fn is_a(self, ancestor: FailureKind) -> bool {
        let mut cur = Some(self);
        while let Some(kind) = cur {
            if kind == ancestor {
                return true;
            }
            cur = kind.parent();
        }
        false
    }

    pub fn name(self) -> &'static str {
        use FailureKind::*;
        match self {
            Step => "StepFailure",
            RetriableStep => "RetriableStepFailure",
            BuildScript => "BuildScriptFailure",
            PackageBuild => "PackageBuildFailure",
            Compound => "CompoundFailure",
            Infrastructure => "InfrastructureFailure",
            TestLab => "TestLabFailure",
            GoB => "GoBFailure",
            GoBQuery => "GoBQueryFailure",
            GoBSubmit => "GoBSubmitFailure",
            GoBFetch => "GoBFetchFailure",
            Gs => "GSFailure",
            GsUpload => "GSUploadFailure",
            GsDownload => "GSDownloadFailure",
            Builder => "BuilderFailure",
            CrashCollection => "CrashCollectionFailure",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The kinds a compound failure may take.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompoundKind {
    Compound,
    Infrastructure,
    TestLab,
    GoB,
    GoBQuery,
    GoBSubmit,
    GoBFetch,
    Gs,
    GsUpload,
    GsDownload,
    Builder,
    CrashCollection,
}

impl From<CompoundKind> for FailureKind {
    fn from(kind: CompoundKind) -> Self {
        match kind {
            CompoundKind::Compound => FailureKind::Compound,
            CompoundKind::Infrastructure => FailureKind::Infrastructure,
            CompoundKind::TestLab => FailureKind::TestLab,
            CompoundKind::GoB => FailureKind::GoB,
            CompoundKind::GoBQuery => FailureKind::GoBQuery,
            CompoundKind::GoBSubmit => FailureKind::GoBSubmit,
            CompoundKind::GoBFetch => FailureKind::GoBFetch,
            CompoundKind::Gs => FailureKind::Gs,
            CompoundKind::GsUpload => FailureKind::GsUpload,
            CompoundKind::GsDownload => FailureKind::GsDownload,
            CompoundKind::Builder => FailureKind::Builder,
            CompoundKind::CrashCollection => FailureKind::CrashCollection,
        }
    }
}

/// One captured failure: type, short message, full detail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    /// Taxonomy kind, when the captured error was itself a `StepFailure`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<FailureKind>,
    pub type_name: String,
    pub message: String,
    pub traceback: String,
}

impl FailureRecord {
    fn matches(&self, kind: FailureKind) -> bool {
        self.kind.is_some_and(|k| k.is_a(kind))
    }

    fn of_failure(failure: &StepFailure) -> Self {
        FailureRecord {
            kind: Some(failure.kind()),
            type_name: failure.kind().name().to_string(),
            message: failure.to_string(),
            traceback: format!("{failure:?}"),
        }
    }
}

/// A stage failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepFailure {
    Step {
        message: String,
    },
    RetriableStep {
        message: String,
    },
    BuildScript {
        shortname: String,
        returncode: i32,
        #[serde(default)]
        message: String,
    },
    PackageBuild {
        shortname: String,
        returncode: i32,
        failed_packages: BTreeSet<String>,
    },
    Compound {
        compound: CompoundKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(default)]
        records: Vec<FailureRecord>,
    },
}

impl StepFailure {
    pub fn step(message: impl Into<String>) -> Self {
        StepFailure::Step {
            message: message.into(),
        }
    }

    pub fn build_script(shortname: impl Into<String>, returncode: i32, message: impl Into<String>) -> Self {
        StepFailure::BuildScript {
            shortname: shortname.into(),
            returncode,
            message: message.into(),
        }
    }

    pub fn package_build<I, S>(shortname: impl Into<String>, returncode: i32, packages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        StepFailure::PackageBuild {
            shortname: shortname.into(),
            returncode,
            failed_packages: packages.into_iter().map(Into::into).collect(),
        }
    }

    pub fn compound(kind: CompoundKind, records: Vec<FailureRecord>) -> Self {
        StepFailure::Compound {
            compound: kind,
            message: None,
            records,
        }
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            StepFailure::Step { .. } => FailureKind::Step,
            StepFailure::RetriableStep { .. } => FailureKind::RetriableStep,
            StepFailure::BuildScript { .. } => FailureKind::BuildScript,
            StepFailure::PackageBuild { .. } => FailureKind::PackageBuild,
            StepFailure::Compound { compound, .. } => (*compound).into(),
        }
    }

    pub fn is_a(&self, kind: FailureKind) -> bool {
        self.kind().is_a(kind)
    }

    /// Captured records. Always empty for non-compound failures.
    pub fn records(&self) -> &[FailureRecord] {
        match self {
            StepFailure::Compound { records, .. } => records,
            _ => &[],
        }
    }

    pub fn failed_packages(&self) -> Option<&BTreeSet<String>> {
        match self {
            StepFailure::PackageBuild {
                failed_packages, ..
            } => Some(failed_packages),
            _ => None,
        }
    }

    /// Any captured record is of `kind`.
    pub fn has_failure_type(&self, kind: FailureKind) -> bool {
        self.records().iter().any(|r| r.matches(kind))
    }

    /// At least one record, and every record is of `kind`.
    pub fn matches_failure_type(&self, kind: FailureKind) -> bool {
        let records = self.records();
        !records.is_empty() && records.iter().all(|r| r.matches(kind))
    }

    /// Any record falls outside `whitelist`. With no whitelist, any record at all.
    pub fn has_fatal_failure(&self, whitelist: &[FailureKind]) -> bool {
        if whitelist.is_empty() {
            return !self.records().is_empty();
        }
        self.records()
            .iter()
            .any(|r| !whitelist.iter().any(|&w| r.matches(w)))
    }

    /// Short message plus every captured traceback.
    pub fn to_full_message(&self) -> String {
        let records = self.records();
        if records.is_empty() {
            return self.to_string();
        }
        records
            .iter()
            .map(|r| format!("{}: {}\n{}", r.type_name, r.message, r.traceback))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Records to carry when this failure is wrapped into another kind.
    fn into_records(self) -> Vec<FailureRecord> {
        match self {
            StepFailure::Compound { records, .. } if !records.is_empty() => records,
            other => vec![FailureRecord::of_failure(&other)],
        }
    }
}

impl fmt::Display for StepFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepFailure::Step { message } | StepFailure::RetriableStep { message } => {
                f.write_str(message)
            }
            StepFailure::BuildScript {
                shortname,
                returncode,
                message,
            } => {
                if *returncode != 0 {
                    write!(f, "{shortname} failed (code={returncode})")
                } else {
                    f.write_str(message)
                }
            }
            StepFailure::PackageBuild {
                shortname,
                failed_packages,
                ..
            } => {
                let packages: Vec<&str> = failed_packages.iter().map(String::as_str).collect();
                write!(f, "Packages failed in {shortname}: {}", packages.join(" "))
            }
            StepFailure::Compound {
                message: Some(message),
                ..
            } => f.write_str(message),
            StepFailure::Compound { records, .. } => {
                let lines: Vec<String> = records
                    .iter()
                    .map(|r| format!("{}: {}", r.type_name, r.message))
                    .collect();
                f.write_str(&lines.join("\n"))
            }
        }
    }
}

impl std::error::Error for StepFailure {}

/// Re-type the error of `result` as a `target` compound failure.
///
/// A `StepFailure` that already is a `target` passes through unchanged. A
/// compound with records donates its records; anything else becomes one
/// record carrying its type, message and debug detail.
pub fn wrap_failure<T, E>(target: CompoundKind, result: Result<T, E>) -> Result<T, StepFailure>
where
    E: Into<anyhow::Error>,
{
    result.map_err(|err| {
        let type_name = std::any::type_name::<E>();
        retype(target, type_name, err.into())
    })
}

/// Await `fut` and re-type its error with [`wrap_failure`].
pub async fn with_failure_type<F, T, E>(target: CompoundKind, fut: F) -> Result<T, StepFailure>
where
    F: Future<Output = Result<T, E>>,
    E: Into<anyhow::Error>,
{
    wrap_failure(target, fut.await)
}

fn retype(target: CompoundKind, type_name: &str, err: anyhow::Error) -> StepFailure {
    match err.downcast::<StepFailure>() {
        Ok(failure) if failure.is_a(target.into()) => failure,
        Ok(failure) => StepFailure::compound(target, failure.into_records()),
        Err(err) => StepFailure::compound(
            target,
            vec![FailureRecord {
                kind: None,
                type_name: type_name.to_string(),
                message: err.to_string(),
                traceback: format!("{err:?}"),
            }],
        ),
    }
}

/// Failure summary a builder attaches to its FAILED status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildFailureMessage {
    pub message: String,
    /// Failures raised by the builder's stages.
    pub tracebacks: Vec<StepFailure>,
    pub internal: bool,
    pub reason: String,
    pub builder: String,
}

impl BuildFailureMessage {
    /// Every traceback is `kind`, directly or through all of its records.
    pub fn matches_failure_type(&self, kind: FailureKind) -> bool {
        self.tracebacks
            .iter()
            .all(|tb| tb.is_a(kind) || (tb.is_a(FailureKind::Compound) && tb.matches_failure_type(kind)))
    }

    /// Some traceback is `kind`, directly or through one of its records.
    pub fn has_failure_type(&self, kind: FailureKind) -> bool {
        self.tracebacks
            .iter()
            .any(|tb| tb.is_a(kind) || tb.has_failure_type(kind))
    }

    pub fn is_package_build_failure(&self) -> bool {
        self.matches_failure_type(FailureKind::PackageBuild)
    }

    /// The flat status record published for this failure.
    pub fn to_builder_status(&self) -> BuilderStatus {
        BuilderStatus::new(BuildStatus::Failed)
            .with_message(self.message.clone())
            .with_reason(self.reason.clone())
    }
}

impl fmt::Display for BuildFailureMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("connection reset by peer")]
    struct ResetError;

    fn gs_failure() -> StepFailure {
        wrap_failure::<(), _>(CompoundKind::GsUpload, Err(ResetError)).unwrap_err()
    }

    #[test]
    fn hierarchy_ancestry() {
        assert!(FailureKind::GoBQuery.is_a(FailureKind::GoB));
        assert!(FailureKind::GoBQuery.is_a(FailureKind::Infrastructure));
        assert!(FailureKind::GoBQuery.is_a(FailureKind::Compound));
        assert!(FailureKind::GoBQuery.is_a(FailureKind::Step));
        assert!(FailureKind::PackageBuild.is_a(FailureKind::BuildScript));
        assert!(!FailureKind::PackageBuild.is_a(FailureKind::Compound));
        assert!(!FailureKind::Gs.is_a(FailureKind::GoB));
        assert!(!FailureKind::Infrastructure.is_a(FailureKind::TestLab));
    }

    #[test]
    fn build_script_display() {
        let f = StepFailure::build_script("build_packages", 1, "ignored");
        assert_eq!(f.to_string(), "build_packages failed (code=1)");
        let f = StepFailure::build_script("build_image", 0, "image too large");
        assert_eq!(f.to_string(), "image too large");
    }

    #[test]
    fn package_build_display_is_sorted() {
        let f = StepFailure::package_build("build_packages", 1, ["sys-apps/dbus", "chromeos-base/shill"]);
        assert_eq!(
            f.to_string(),
            "Packages failed in build_packages: chromeos-base/shill sys-apps/dbus"
        );
        assert!(f.is_a(FailureKind::BuildScript));
    }

    #[test]
    fn wrap_records_foreign_error() {
        let f = gs_failure();
        assert_eq!(f.kind(), FailureKind::GsUpload);
        assert_eq!(f.records().len(), 1);
        assert!(f.records()[0].type_name.ends_with("ResetError"));
        assert_eq!(f.records()[0].message, "connection reset by peer");
        assert!(f.to_string().contains("connection reset by peer"));
    }

    #[test]
    fn wrap_passes_through_matching_subtype() {
        let inner = gs_failure();
        let wrapped = wrap_failure::<(), _>(CompoundKind::Infrastructure, Err(inner.clone())).unwrap_err();
        assert_eq!(wrapped, inner);
    }

    #[test]
    fn wrap_reuses_compound_records() {
        let inner = gs_failure();
        let wrapped = wrap_failure::<(), _>(CompoundKind::TestLab, Err(inner.clone())).unwrap_err();
        assert_eq!(wrapped.kind(), FailureKind::TestLab);
        assert_eq!(wrapped.records(), inner.records());
    }

    #[test]
    fn wrap_step_failure_keeps_its_kind_in_record() {
        let pkg = StepFailure::package_build("build_packages", 1, ["dev-libs/foo"]);
        let wrapped = wrap_failure::<(), _>(CompoundKind::Builder, Err(pkg)).unwrap_err();
        assert_eq!(wrapped.records().len(), 1);
        assert_eq!(wrapped.records()[0].kind, Some(FailureKind::PackageBuild));
        assert!(wrapped.has_failure_type(FailureKind::BuildScript));
        assert!(wrapped.matches_failure_type(FailureKind::PackageBuild));
    }

    #[test]
    fn wrap_ok_is_untouched() {
        assert_eq!(wrap_failure::<_, ResetError>(CompoundKind::Gs, Ok(7)).unwrap(), 7);
    }

    #[test]
    fn queries_operate_over_records() {
        let f = StepFailure::compound(
            CompoundKind::Infrastructure,
            vec![
                FailureRecord::of_failure(&gs_failure()),
                FailureRecord::of_failure(&StepFailure::step("boom")),
            ],
        );
        assert!(f.has_failure_type(FailureKind::Gs));
        assert!(!f.matches_failure_type(FailureKind::Gs));
        assert!(f.matches_failure_type(FailureKind::Step));
        // The compound's own kind is never consulted.
        assert!(!f.has_failure_type(FailureKind::Infrastructure));
    }

    #[test]
    fn empty_compound_queries() {
        let f = StepFailure::compound(CompoundKind::Compound, vec![]);
        assert!(!f.has_failure_type(FailureKind::Step));
        assert!(!f.matches_failure_type(FailureKind::Step));
        assert!(!f.has_fatal_failure(&[]));
        assert_eq!(f.to_full_message(), "");
    }

    #[test]
    fn fatal_failure_whitelist() {
        let f = StepFailure::compound(
            CompoundKind::Infrastructure,
            vec![FailureRecord::of_failure(&gs_failure())],
        );
        assert!(f.has_fatal_failure(&[]));
        assert!(!f.has_fatal_failure(&[FailureKind::Infrastructure]));
        assert!(f.has_fatal_failure(&[FailureKind::TestLab]));
        assert!(!f.has_fatal_failure(&[FailureKind::TestLab, FailureKind::GsUpload]));
    }

    #[test]
    fn full_message_includes_tracebacks() {
        let f = gs_failure();
        let full = f.to_full_message();
        assert!(full.contains("connection reset by peer"));
        assert!(full.lines().count() >= 2);
        assert!(full.len() > f.to_string().len());
    }

    #[tokio::test]
    async fn with_failure_type_wraps_future_error() {
        let result = with_failure_type(CompoundKind::GoBFetch, async {
            Err::<(), _>(anyhow::anyhow!("fetch timed out"))
        })
        .await;
        let f = result.unwrap_err();
        assert_eq!(f.kind(), FailureKind::GoBFetch);
        assert_eq!(f.records()[0].message, "fetch timed out");
    }

    #[test]
    fn failure_message_type_queries() {
        let msg = BuildFailureMessage {
            message: "lumpy-paladin failed".to_string(),
            tracebacks: vec![
                StepFailure::package_build("build_packages", 1, ["a/b"]),
                StepFailure::compound(
                    CompoundKind::Compound,
                    vec![FailureRecord::of_failure(&StepFailure::package_build(
                        "build_packages",
                        1,
                        ["c/d"],
                    ))],
                ),
            ],
            internal: false,
            reason: "build_packages".to_string(),
            builder: "lumpy-paladin".to_string(),
        };
        assert!(msg.is_package_build_failure());
        assert!(msg.has_failure_type(FailureKind::BuildScript));
        assert!(!msg.has_failure_type(FailureKind::Infrastructure));

        let status = msg.to_builder_status();
        assert_eq!(status.status, BuildStatus::Failed);
        assert_eq!(status.reason.as_deref(), Some("build_packages"));
    }

    #[test]
    fn failure_serializes_with_kind_tag() {
        let f = StepFailure::package_build("build_packages", 1, ["x/y"]);
        let json = serde_json::to_value(&f).unwrap();
        assert_eq!(json["kind"], "package_build");
        let back: StepFailure = serde_json::from_value(json).unwrap();
        assert_eq!(back, f);
    }
}

//! Build-retrieval metrics collaborator.
//!
//! Mirrors the original's monitoring contract: retrieval-time histograms
//! per step, build age, and a build-revision gauge. The real monitoring
//! backend is out of scope for this crate, so the production
//! implementation logs structured `tracing` events in its place, and tests
//! use [`NullMetricsSink`].

use std::time::Duration;

/// The step a retrieval-time measurement covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetrievalStep {
    /// Downloading the archive (or custom binary) to local disk.
    Download,
    /// Listing the archive's fuzz targets.
    ListFuzzTargets,
    /// Extracting the archive.
    Unpack,
    /// The whole setup pipeline, start to finish.
    Total,
}

impl RetrievalStep {
    fn label(self) -> &'static str {
        match self {
            Self::Download => "download",
            Self::ListFuzzTargets => "list_fuzz_targets",
            Self::Unpack => "unpack",
            Self::Total => "total",
        }
    }
}

/// Which half of a symbolized pair (or "release" for every other variant) a
/// measurement belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildType {
    /// The default for every non-symbolized variant, and the first half of
    /// a symbolized pair.
    Release,
    /// The second half of a symbolized pair.
    Debug,
}

impl BuildType {
    fn label(self) -> &'static str {
        match self {
            Self::Release => "release",
            Self::Debug => "debug",
        }
    }
}

/// The metrics sink contract: `record_retrieval_time`, `record_build_age`,
/// `record_build_revision`.
pub trait MetricsSink: Send + Sync {
    /// Record how long `step` took for `job` on `platform`.
    fn record_retrieval_time(&self, job: &str, platform: &str, step: RetrievalStep, build_type: BuildType, duration: Duration);

    /// Record the age (hours) of the build that was just materialized,
    /// i.e. how long ago the upstream object was last modified.
    fn record_build_age(&self, job: &str, platform: &str, age_hours: f64);

    /// Record the revision of the build that was just materialized, as a gauge.
    fn record_build_revision(&self, job: &str, platform: &str, revision: i64);
}

/// A [`MetricsSink`] that logs structured `tracing` events in place of a
/// real monitoring backend.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMetricsSink;

impl MetricsSink for TracingMetricsSink {
    fn record_retrieval_time(&self, job: &str, platform: &str, step: RetrievalStep, build_type: BuildType, duration: Duration) {
        tracing::info!(
            job,
            platform,
            step = step.label(),
            build_type = build_type.label(),
            duration_secs = duration.as_secs_f64(),
            "JOB_BUILD_RETRIEVAL_TIME"
        );
    }

    fn record_build_age(&self, job: &str, platform: &str, age_hours: f64) {
        tracing::info!(job, platform, age_hours, "JOB_BUILD_AGE");
    }

    fn record_build_revision(&self, job: &str, platform: &str, revision: i64) {
        tracing::info!(job, platform, revision, "JOB_BUILD_REVISION");
    }
}

/// A [`MetricsSink`] that discards every measurement, for tests that don't
/// care about metrics emission.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullMetricsSink;

impl MetricsSink for NullMetricsSink {
    fn record_retrieval_time(&self, _job: &str, _platform: &str, _step: RetrievalStep, _build_type: BuildType, _duration: Duration) {}
    fn record_build_age(&self, _job: &str, _platform: &str, _age_hours: f64) {}
    fn record_build_revision(&self, _job: &str, _platform: &str, _revision: i64) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        revisions: Mutex<Vec<i64>>,
    }

    impl MetricsSink for RecordingSink {
        fn record_retrieval_time(&self, _job: &str, _platform: &str, _step: RetrievalStep, _build_type: BuildType, _duration: Duration) {}
        fn record_build_age(&self, _job: &str, _platform: &str, _age_hours: f64) {}
        fn record_build_revision(&self, _job: &str, _platform: &str, revision: i64) {
            self.revisions.lock().unwrap().push(revision);
        }
    }

    #[test]
    fn sink_trait_is_object_safe_and_callable() {
        let sink = RecordingSink::default();
        sink.record_build_revision("job", "linux", 42);
        assert_eq!(*sink.revisions.lock().unwrap(), vec![42]);
    }

    #[test]
    fn null_sink_accepts_all_calls_without_panicking() {
        let sink = NullMetricsSink;
        sink.record_retrieval_time("job", "linux", RetrievalStep::Download, BuildType::Release, Duration::from_secs(1));
        sink.record_build_age("job", "linux", 1.5);
        sink.record_build_revision("job", "linux", 1);
    }
}

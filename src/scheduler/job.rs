use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{MapcadError, Result};

/// Largest accepted capture radius, in meters.
pub const MAX_RADIUS_M: f64 = 10_000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// The job state machine. Anything not listed here is a scheduler bug.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Queued, JobStatus::Running)
                | (JobStatus::Queued, JobStatus::Cancelled)
                | (JobStatus::Running, JobStatus::Completed)
                | (JobStatus::Running, JobStatus::Failed)
                | (JobStatus::Running, JobStatus::Cancelled)
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Queued => f.pad("queued"),
            JobStatus::Running => f.pad("running"),
            JobStatus::Completed => f.pad("completed"),
            JobStatus::Failed => f.pad("failed"),
            JobStatus::Cancelled => f.pad("cancelled"),
        }
    }
}

/// Why a job ended up `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureKind {
    Execution,
    Timeout,
    Interrupted,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::Execution => f.pad("execution"),
            FailureKind::Timeout => f.pad("timeout"),
            FailureKind::Interrupted => f.pad("interrupted"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityTier {
    Draft,
    #[default]
    Standard,
    High,
}

impl QualityTier {
    pub fn as_str(self) -> &'static str {
        match self {
            QualityTier::Draft => "draft",
            QualityTier::Standard => "standard",
            QualityTier::High => "high",
        }
    }
}

impl std::fmt::Display for QualityTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

impl std::str::FromStr for QualityTier {
    type Err = MapcadError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "draft" | "low" => Ok(QualityTier::Draft),
            "standard" | "medium" => Ok(QualityTier::Standard),
            "high" => Ok(QualityTier::High),
            other => Err(MapcadError::validation(
                "quality",
                format!("unknown quality tier '{}'", other),
            )),
        }
    }
}

/// Optional clipping rectangle, in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoBounds {
    pub min_lat: f64,
    pub min_lon: f64,
    pub max_lat: f64,
    pub max_lon: f64,
}

impl GeoBounds {
    fn validate(&self) -> Result<()> {
        let values = [self.min_lat, self.min_lon, self.max_lat, self.max_lon];
        if values.iter().any(|v| !v.is_finite()) {
            return Err(MapcadError::validation("bounds", "must be finite numbers"));
        }
        check_range("bounds", self.min_lat, -90.0, 90.0)?;
        check_range("bounds", self.max_lat, -90.0, 90.0)?;
        check_range("bounds", self.min_lon, -180.0, 180.0)?;
        check_range("bounds", self.max_lon, -180.0, 180.0)?;
        if self.min_lat >= self.max_lat || self.min_lon >= self.max_lon {
            return Err(MapcadError::validation(
                "bounds",
                "min corner must be strictly south-west of max corner",
            ));
        }
        Ok(())
    }
}

impl std::str::FromStr for GeoBounds {
    type Err = MapcadError;

    /// Parses `min_lat,min_lon,max_lat,max_lon`.
    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<f64> = s
            .split(',')
            .map(|p| p.trim().parse::<f64>())
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| MapcadError::validation("bounds", e.to_string()))?;
        match parts.as_slice() {
            [min_lat, min_lon, max_lat, max_lon] => Ok(GeoBounds {
                min_lat: *min_lat,
                min_lon: *min_lon,
                max_lat: *max_lat,
                max_lon: *max_lon,
            }),
            _ => Err(MapcadError::validation(
                "bounds",
                "expected min_lat,min_lon,max_lat,max_lon",
            )),
        }
    }
}

/// Parameters forwarded to the generation worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationPayload {
    pub lat: f64,
    pub lon: f64,
    pub radius_m: f64,
    #[serde(default)]
    pub quality: QualityTier,
    #[serde(default)]
    pub strict: bool,
    #[serde(default)]
    pub bounds: Option<GeoBounds>,
}

impl GenerationPayload {
    pub fn new(lat: f64, lon: f64, radius_m: f64) -> Self {
        Self {
            lat,
            lon,
            radius_m,
            quality: QualityTier::default(),
            strict: false,
            bounds: None,
        }
    }

    pub fn with_quality(mut self, quality: QualityTier) -> Self {
        self.quality = quality;
        self
    }

    pub fn with_strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn with_bounds(mut self, bounds: GeoBounds) -> Self {
        self.bounds = Some(bounds);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !self.lat.is_finite() {
            return Err(MapcadError::validation("lat", "must be a finite number"));
        }
        if !self.lon.is_finite() {
            return Err(MapcadError::validation("lon", "must be a finite number"));
        }
        check_range("lat", self.lat, -90.0, 90.0)?;
        check_range("lon", self.lon, -180.0, 180.0)?;
        if !self.radius_m.is_finite() || self.radius_m <= 0.0 {
            return Err(MapcadError::validation(
                "radius",
                format!("must be a positive number, got {}", self.radius_m),
            ));
        }
        if self.radius_m > MAX_RADIUS_M {
            return Err(MapcadError::validation(
                "radius",
                format!("must not exceed {}m, got {}", MAX_RADIUS_M, self.radius_m),
            ));
        }
        if let Some(bounds) = &self.bounds {
            bounds.validate()?;
        }
        Ok(())
    }
}

fn check_range(field: &'static str, value: f64, min: f64, max: f64) -> Result<()> {
    if value < min || value > max {
        return Err(MapcadError::validation(
            field,
            format!("{} is outside [{}, {}]", value, min, max),
        ));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    /// Submission order; breaks ties between equal `created_at` values
    pub sequence: u64,
    pub status: JobStatus,
    pub payload: GenerationPayload,
    pub output_path: PathBuf,
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub elapsed_ms: Option<u64>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub error_kind: Option<FailureKind>,
    pub download_url: Option<String>,
}

impl Job {
    pub fn new(payload: GenerationPayload, sequence: u64, output_dir: &Path) -> Self {
        let id = Uuid::new_v4();
        Self {
            id,
            sequence,
            status: JobStatus::Queued,
            payload,
            output_path: output_dir.join(format!("{}.dxf", id)),
            cancel_requested: false,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            elapsed_ms: None,
            result: None,
            error: None,
            error_kind: None,
            download_url: None,
        }
    }

    /// Sort key for FIFO dispatch and oldest-first retention.
    pub fn fifo_key(&self) -> (DateTime<Utc>, u64) {
        (self.created_at, self.sequence)
    }

    pub fn summary(&self) -> JobSummary {
        JobSummary {
            id: self.id,
            status: self.status,
            quality: self.payload.quality,
            cancel_requested: self.cancel_requested,
            created_at: self.created_at,
            finished_at: self.finished_at,
            error: self.error.clone(),
        }
    }
}

/// A status change together with the fields its target status carries.
#[derive(Debug, Clone)]
pub enum Transition {
    Start {
        at: DateTime<Utc>,
    },
    Complete {
        at: DateTime<Utc>,
        result: serde_json::Value,
        download_url: String,
    },
    Fail {
        at: DateTime<Utc>,
        error: String,
        kind: FailureKind,
    },
    Cancel {
        at: DateTime<Utc>,
    },
}

impl Transition {
    pub fn target(&self) -> JobStatus {
        match self {
            Transition::Start { .. } => JobStatus::Running,
            Transition::Complete { .. } => JobStatus::Completed,
            Transition::Fail { .. } => JobStatus::Failed,
            Transition::Cancel { .. } => JobStatus::Cancelled,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSummary {
    pub id: Uuid,
    pub status: JobStatus,
    pub quality: QualityTier,
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobReceipt {
    pub job_id: Uuid,
    pub status: JobStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelReceipt {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub cancel_requested: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [JobStatus; 5] = [
        JobStatus::Queued,
        JobStatus::Running,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    #[test]
    fn state_machine_table() {
        let allowed = [
            (JobStatus::Queued, JobStatus::Running),
            (JobStatus::Queued, JobStatus::Cancelled),
            (JobStatus::Running, JobStatus::Completed),
            (JobStatus::Running, JobStatus::Failed),
            (JobStatus::Running, JobStatus::Cancelled),
        ];
        for from in ALL {
            for to in ALL {
                assert_eq!(
                    from.can_transition_to(to),
                    allowed.contains(&(from, to)),
                    "{} -> {}",
                    from,
                    to
                );
            }
        }
    }

    #[test]
    fn terminal_states_have_no_exits() {
        for from in ALL.into_iter().filter(|s| s.is_terminal()) {
            assert!(ALL.iter().all(|to| !from.can_transition_to(*to)));
        }
        assert!(!JobStatus::Queued.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
    }

    #[test]
    fn new_job_is_queued() {
        let job = Job::new(GenerationPayload::new(52.5, 13.4, 250.0), 7, Path::new("/out"));
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.sequence, 7);
        assert!(!job.cancel_requested);
        assert!(job.started_at.is_none());
        assert_eq!(job.output_path, PathBuf::from(format!("/out/{}.dxf", job.id)));
    }

    #[test]
    fn validate_accepts_reasonable_payload() {
        let payload = GenerationPayload::new(48.85, 2.35, 500.0)
            .with_quality(QualityTier::High)
            .with_strict(true)
            .with_bounds(GeoBounds {
                min_lat: 48.8,
                min_lon: 2.3,
                max_lat: 48.9,
                max_lon: 2.4,
            });
        assert!(payload.validate().is_ok());
    }

    #[test]
    fn validate_rejects_negative_radius() {
        let err = GenerationPayload::new(0.0, 0.0, -5.0).validate().unwrap_err();
        assert!(matches!(err, MapcadError::Validation { field: "radius", .. }));
    }

    #[test]
    fn validate_rejects_out_of_range_coordinates() {
        assert!(GenerationPayload::new(91.0, 0.0, 10.0).validate().is_err());
        assert!(GenerationPayload::new(0.0, -180.5, 10.0).validate().is_err());
        assert!(GenerationPayload::new(f64::NAN, 0.0, 10.0).validate().is_err());
        assert!(GenerationPayload::new(0.0, 0.0, MAX_RADIUS_M + 1.0)
            .validate()
            .is_err());
    }

    #[test]
    fn validate_rejects_inverted_bounds() {
        let payload = GenerationPayload::new(10.0, 10.0, 100.0).with_bounds(GeoBounds {
            min_lat: 11.0,
            min_lon: 9.0,
            max_lat: 10.0,
            max_lon: 12.0,
        });
        let err = payload.validate().unwrap_err();
        assert!(matches!(err, MapcadError::Validation { field: "bounds", .. }));
    }

    #[test]
    fn parse_bounds_and_quality() {
        let bounds: GeoBounds = "1.0, 2.0, 3.0, 4.0".parse().unwrap();
        assert_eq!(bounds.max_lon, 4.0);
        assert!("1,2,3".parse::<GeoBounds>().is_err());
        assert!("a,b,c,d".parse::<GeoBounds>().is_err());

        assert_eq!("HIGH".parse::<QualityTier>().unwrap(), QualityTier::High);
        assert_eq!("low".parse::<QualityTier>().unwrap(), QualityTier::Draft);
        assert!("ultra".parse::<QualityTier>().is_err());
    }

    #[test]
    fn payload_deserializes_with_defaults() {
        let payload: GenerationPayload =
            serde_json::from_str(r#"{"lat":1.0,"lon":2.0,"radius_m":30.0}"#).unwrap();
        assert_eq!(payload.quality, QualityTier::Standard);
        assert!(!payload.strict);
        assert!(payload.bounds.is_none());
    }

    #[test]
    fn transition_targets() {
        let at = Utc::now();
        assert_eq!(Transition::Start { at }.target(), JobStatus::Running);
        assert_eq!(Transition::Cancel { at }.target(), JobStatus::Cancelled);
        assert_eq!(
            Transition::Fail {
                at,
                error: "x".into(),
                kind: FailureKind::Timeout
            }
            .target(),
            JobStatus::Failed
        );
    }
}

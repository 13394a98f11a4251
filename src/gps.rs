//! GPS capture validation for driver actions.
//!
//! Every mutating driver action (start/complete/fail delivery, petty cash,
//! location ping) embeds a validated position. Validation is a pure scoring
//! pass over the raw reading: it annotates quality and mock-location
//! suspicion but never blocks — mock suspicion is surfaced to the driver as
//! a confirm-to-proceed warning, not a hard rejection.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Platform location acquisition is given this long before the capture is
/// abandoned and surfaced as a timeout.
pub const ACQUISITION_TIMEOUT: Duration = Duration::from_secs(10);

/// Two or more mock indicators flag the reading as suspected-mock.
const MOCK_INDICATOR_THRESHOLD: u32 = 2;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// A raw geolocation sample as reported by the platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpsReading {
    pub latitude: f64,
    pub longitude: f64,
    /// Reported horizontal accuracy in meters.
    pub accuracy: f64,
    pub altitude: Option<f64>,
    pub altitude_accuracy: Option<f64>,
    pub heading: Option<f64>,
    /// Ground speed in m/s.
    pub speed: Option<f64>,
    /// Capture time as reported by the platform, not the wall clock at
    /// validation time.
    pub timestamp: DateTime<Utc>,
}

/// Derived quality annotations for a reading. Never persisted — recomputed
/// on each capture so the freshness penalty reflects the current clock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpsMetadata {
    pub is_mock_location: bool,
    /// Heuristic trustworthiness, 0–100.
    pub quality_score: u8,
    /// Human-readable flags, in the order the checks run.
    pub warnings: Vec<String>,
}

/// A reading bundled with its validation result, ready to embed in an
/// action payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidatedPosition {
    pub reading: GpsReading,
    pub metadata: GpsMetadata,
}

impl ValidatedPosition {
    /// JSON shape embedded under `gps` in replayed action payloads.
    pub fn to_payload(&self) -> Value {
        serde_json::json!({
            "latitude": self.reading.latitude,
            "longitude": self.reading.longitude,
            "accuracy": self.reading.accuracy,
            "altitude": self.reading.altitude,
            "heading": self.reading.heading,
            "speed": self.reading.speed,
            "captured_at": self.reading.timestamp.to_rfc3339(),
            "quality_score": self.metadata.quality_score,
            "is_mock_location": self.metadata.is_mock_location,
            "warnings": self.metadata.warnings,
        })
    }
}

/// Coarse quality band for the driver-facing status indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityBand {
    Excellent,
    Good,
    Fair,
    Poor,
}

impl QualityBand {
    pub fn from_score(score: u8) -> Self {
        match score {
            80..=100 => QualityBand::Excellent,
            60..=79 => QualityBand::Good,
            40..=59 => QualityBand::Fair,
            _ => QualityBand::Poor,
        }
    }
}

/// Errors from the underlying platform location source. Surfaced directly to
/// the initiating driver action; the validator never fabricates a reading.
#[derive(Debug, Error)]
pub enum GpsError {
    #[error("location permission denied")]
    PermissionDenied,

    #[error("location unavailable: {0}")]
    Unavailable(String),

    #[error("GPS acquisition timed out after {}s", ACQUISITION_TIMEOUT.as_secs())]
    Timeout,
}

/// Platform geolocation source. High accuracy is expected and cached
/// readings are not acceptable; the implementation should request a fresh
/// fix on every call.
#[allow(async_fn_in_trait)]
pub trait PositionSource {
    async fn current_reading(&self) -> Result<GpsReading, GpsError>;
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Count the decimal digits in the shortest display form of a coordinate.
/// Hand-entered mock coordinates are typically round numbers; real GPS chips
/// emit high-precision floats.
fn decimal_places(value: f64) -> usize {
    let rendered = format!("{}", value.abs());
    rendered
        .split('.')
        .nth(1)
        .map(|digits| digits.len())
        .unwrap_or(0)
}

/// Score a raw reading against the mock-location and quality heuristics.
///
/// Pure and deterministic: identical `reading` and `now` always produce an
/// identical result. `now` is passed in rather than read from the clock so
/// the freshness checks are reproducible.
pub fn validate_reading(reading: &GpsReading, now: DateTime<Utc>) -> GpsMetadata {
    let mut mock_indicators: u32 = 0;
    let mut warnings: Vec<String> = Vec::new();

    // Accuracy: very poor is just a warning; implausibly sharp is suspicious
    // (consumer GPS rarely reports below 5 m).
    if reading.accuracy > 100.0 {
        warnings.push(format!("poor accuracy (±{:.0} m)", reading.accuracy));
    } else if reading.accuracy < 5.0 {
        mock_indicators += 1;
        warnings.push(format!(
            "implausibly precise accuracy (±{:.1} m)",
            reading.accuracy
        ));
    }

    // Coordinate precision: fewer than 4 decimal digits on either axis.
    if decimal_places(reading.latitude) < 4 || decimal_places(reading.longitude) < 4 {
        mock_indicators += 1;
        warnings.push("suspiciously rounded coordinates".to_string());
    }

    // Freshness: stale is a warning; a capture timestamp in the future means
    // clock skew or spoofing.
    let age_secs = (now - reading.timestamp).num_milliseconds() as f64 / 1000.0;
    if age_secs > 30.0 {
        warnings.push(format!("stale reading ({age_secs:.0}s old)"));
    } else if age_secs < 0.0 {
        mock_indicators += 1;
        warnings.push("capture timestamp is in the future".to_string());
    }

    // Missing sensors: a moving device normally populates at least one of
    // altitude, heading, or speed.
    if reading.altitude.is_none() && reading.heading.is_none() && reading.speed.is_none() {
        mock_indicators += 1;
        warnings.push("no altitude, heading, or speed data".to_string());
    }

    // Impossible values are a strong mock signal, weighted heavier.
    if reading.latitude.abs() > 90.0 || reading.longitude.abs() > 180.0 {
        mock_indicators += 3;
        warnings.push("invalid coordinate range".to_string());
    }

    // Null island: common default in spoofing tools.
    if reading.latitude == 0.0 && reading.longitude == 0.0 {
        mock_indicators += 3;
        warnings.push("null island coordinates (0, 0)".to_string());
    }

    let is_mock_location = mock_indicators >= MOCK_INDICATOR_THRESHOLD;

    let mut score: i32 = 100;
    if reading.accuracy > 50.0 {
        score -= 20;
    } else if reading.accuracy > 20.0 {
        score -= 10;
    }
    if age_secs > 15.0 {
        score -= 15;
    } else if age_secs > 5.0 {
        score -= 5;
    }
    if reading.altitude.is_none() {
        score -= 5;
    }
    if reading.heading.is_none() {
        score -= 5;
    }
    if reading.speed.is_none() {
        score -= 5;
    }
    score -= 15 * mock_indicators as i32;

    // Floor at 0: an adversarial reading can go deeply negative before the
    // clamp.
    let quality_score = score.clamp(0, 100) as u8;

    GpsMetadata {
        is_mock_location,
        quality_score,
        warnings,
    }
}

/// Acquire a fresh reading from the platform source (bounded by
/// [`ACQUISITION_TIMEOUT`]) and validate it against the current clock.
pub async fn acquire_validated<S: PositionSource>(
    source: &S,
) -> Result<ValidatedPosition, GpsError> {
    let reading = tokio::time::timeout(ACQUISITION_TIMEOUT, source.current_reading())
        .await
        .map_err(|_| GpsError::Timeout)??;

    let metadata = validate_reading(&reading, Utc::now());
    if metadata.is_mock_location {
        warn!(
            quality_score = metadata.quality_score,
            warnings = ?metadata.warnings,
            "suspected mock location captured"
        );
    } else if !metadata.warnings.is_empty() {
        debug!(
            quality_score = metadata.quality_score,
            warnings = ?metadata.warnings,
            "GPS reading validated with warnings"
        );
    }

    Ok(ValidatedPosition { reading, metadata })
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn now() -> DateTime<Utc> {
        "2026-08-20T08:30:00Z".parse().expect("fixed test clock")
    }

    /// A clean, high-quality reading: accurate, fresh, all sensors present.
    fn clean_reading() -> GpsReading {
        GpsReading {
            latitude: 19.076_012_3,
            longitude: 72.877_701_9,
            accuracy: 12.0,
            altitude: Some(15.0),
            altitude_accuracy: Some(4.0),
            heading: Some(90.0),
            speed: Some(1.2),
            timestamp: now() - ChronoDuration::seconds(2),
        }
    }

    #[test]
    fn test_clean_reading_scores_in_good_band() {
        // Scenario: a driver mid-delivery in Mumbai with a healthy fix.
        let reading = GpsReading {
            latitude: 19.07600,
            longitude: 72.87770,
            accuracy: 12.0,
            altitude: Some(15.0),
            altitude_accuracy: None,
            heading: Some(90.0),
            speed: Some(1.2),
            timestamp: now() - ChronoDuration::seconds(2),
        };
        let meta = validate_reading(&reading, now());

        assert!(!meta.is_mock_location);
        assert!(
            meta.quality_score >= 60,
            "expected Good/Excellent band, got {}",
            meta.quality_score
        );
        assert!(matches!(
            QualityBand::from_score(meta.quality_score),
            QualityBand::Good | QualityBand::Excellent
        ));
    }

    #[test]
    fn test_high_precision_reading_is_unflagged() {
        let meta = validate_reading(&clean_reading(), now());
        assert!(!meta.is_mock_location);
        assert!(meta.warnings.is_empty(), "warnings: {:?}", meta.warnings);
        assert_eq!(meta.quality_score, 100);
    }

    #[test]
    fn test_scoring_is_deterministic() {
        let reading = clean_reading();
        let at = now();
        let first = validate_reading(&reading, at);
        let second = validate_reading(&reading, at);
        assert_eq!(first.quality_score, second.quality_score);
        assert_eq!(first.warnings, second.warnings);
        assert_eq!(first.is_mock_location, second.is_mock_location);
    }

    #[test]
    fn test_null_island_alone_flags_mock() {
        // (0, 0) contributes +3 indicators, past the threshold on its own.
        // It also trips the rounded-coordinate check.
        let reading = GpsReading {
            latitude: 0.0,
            longitude: 0.0,
            accuracy: 12.0,
            altitude: Some(10.0),
            altitude_accuracy: None,
            heading: Some(0.0),
            speed: Some(0.5),
            timestamp: now() - ChronoDuration::seconds(1),
        };
        let meta = validate_reading(&reading, now());
        assert!(meta.is_mock_location);
        assert!(meta
            .warnings
            .iter()
            .any(|w| w.contains("null island")));
    }

    #[test]
    fn test_sub_five_meter_accuracy_alone_is_not_mock() {
        // One indicator is suspicion, not a verdict: needs a second.
        let reading = GpsReading {
            accuracy: 3.0,
            ..clean_reading()
        };
        let meta = validate_reading(&reading, now());
        assert!(!meta.is_mock_location);
        assert!(meta
            .warnings
            .iter()
            .any(|w| w.contains("implausibly precise")));

        // Pair it with rounded coordinates and the verdict flips.
        let reading = GpsReading {
            latitude: 19.07,
            longitude: 72.87,
            accuracy: 3.0,
            ..clean_reading()
        };
        let meta = validate_reading(&reading, now());
        assert!(meta.is_mock_location);
    }

    #[test]
    fn test_rounded_coordinates_warn() {
        let reading = GpsReading {
            latitude: 19.1,
            longitude: 72.877_701_9,
            ..clean_reading()
        };
        let meta = validate_reading(&reading, now());
        assert!(!meta.is_mock_location);
        assert!(meta
            .warnings
            .iter()
            .any(|w| w.contains("rounded coordinates")));
    }

    #[test]
    fn test_future_timestamp_is_suspicious() {
        let reading = GpsReading {
            timestamp: now() + ChronoDuration::seconds(45),
            ..clean_reading()
        };
        let meta = validate_reading(&reading, now());
        assert!(meta
            .warnings
            .iter()
            .any(|w| w.contains("future")));
        // One indicator only — not flagged as mock by itself.
        assert!(!meta.is_mock_location);
    }

    #[test]
    fn test_stale_reading_warns_without_mock_flag() {
        let reading = GpsReading {
            timestamp: now() - ChronoDuration::seconds(90),
            ..clean_reading()
        };
        let meta = validate_reading(&reading, now());
        assert!(!meta.is_mock_location);
        assert!(meta.warnings.iter().any(|w| w.contains("stale")));
        // Age > 15s costs 15 points.
        assert_eq!(meta.quality_score, 85);
    }

    #[test]
    fn test_missing_all_sensors_is_one_indicator() {
        let reading = GpsReading {
            altitude: None,
            altitude_accuracy: None,
            heading: None,
            speed: None,
            ..clean_reading()
        };
        let meta = validate_reading(&reading, now());
        assert!(!meta.is_mock_location, "single indicator must not flag");
        // -5 × 3 missing sensors, -15 × 1 indicator.
        assert_eq!(meta.quality_score, 70);
    }

    #[test]
    fn test_out_of_range_coordinates_weigh_heavily() {
        let reading = GpsReading {
            latitude: 123.0,
            longitude: 200.0,
            ..clean_reading()
        };
        let meta = validate_reading(&reading, now());
        assert!(meta.is_mock_location);
        assert!(meta
            .warnings
            .iter()
            .any(|w| w.contains("invalid coordinate range")));
    }

    #[test]
    fn test_adversarial_reading_floors_at_zero() {
        // Every negative heuristic at once: the raw score goes deeply
        // negative but the reported floor is 0.
        let reading = GpsReading {
            latitude: 0.0,
            longitude: 0.0,
            accuracy: 2.0,
            altitude: None,
            altitude_accuracy: None,
            heading: None,
            speed: None,
            timestamp: now() + ChronoDuration::seconds(10),
        };
        let meta = validate_reading(&reading, now());
        assert!(meta.is_mock_location);
        assert_eq!(meta.quality_score, 0);
    }

    #[test]
    fn test_quality_bands() {
        assert_eq!(QualityBand::from_score(100), QualityBand::Excellent);
        assert_eq!(QualityBand::from_score(80), QualityBand::Excellent);
        assert_eq!(QualityBand::from_score(79), QualityBand::Good);
        assert_eq!(QualityBand::from_score(60), QualityBand::Good);
        assert_eq!(QualityBand::from_score(59), QualityBand::Fair);
        assert_eq!(QualityBand::from_score(40), QualityBand::Fair);
        assert_eq!(QualityBand::from_score(39), QualityBand::Poor);
        assert_eq!(QualityBand::from_score(0), QualityBand::Poor);
    }

    #[test]
    fn test_position_payload_shape() {
        let reading = clean_reading();
        let metadata = validate_reading(&reading, now());
        let position = ValidatedPosition { reading, metadata };
        let payload = position.to_payload();

        assert!(payload.get("latitude").is_some());
        assert!(payload.get("captured_at").is_some());
        assert_eq!(
            payload.get("is_mock_location").and_then(Value::as_bool),
            Some(false)
        );
        assert_eq!(
            payload.get("quality_score").and_then(Value::as_u64),
            Some(100)
        );
    }

    struct StaticSource(GpsReading);

    impl PositionSource for StaticSource {
        async fn current_reading(&self) -> Result<GpsReading, GpsError> {
            Ok(self.0.clone())
        }
    }

    struct DeniedSource;

    impl PositionSource for DeniedSource {
        async fn current_reading(&self) -> Result<GpsReading, GpsError> {
            Err(GpsError::PermissionDenied)
        }
    }

    #[tokio::test]
    async fn test_acquire_validated_attaches_metadata() {
        let source = StaticSource(clean_reading());
        let position = acquire_validated(&source).await.expect("acquire");
        assert!(!position.metadata.is_mock_location);
        // Fixed test clock is in the past relative to the real Utc::now(),
        // so only assert structural properties here.
        assert!(position.metadata.quality_score <= 100);
    }

    #[tokio::test]
    async fn test_acquire_surfaces_platform_errors() {
        let err = acquire_validated(&DeniedSource).await.unwrap_err();
        assert!(matches!(err, GpsError::PermissionDenied));
    }
}

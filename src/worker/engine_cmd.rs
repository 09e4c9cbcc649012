//! Engine command builder: turns the free-form parameter map into a
//! concrete argv for ffmpeg or gst-launch. This is the one place the
//! dynamic map is validated into typed values; anything malformed is a
//! user error, reported without ever starting the engine.
//!
//! Scenarios run from a synthetic test source, so a job is fully
//! described by duration, resolution, frame rate, codec and bitrate.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::domain::job::{EngineKind, Job, JobParameters, codec, duration_seconds};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("invalid parameter {name}: {value}")]
    InvalidParameter { name: String, value: String },
    #[error("unsupported codec: {0}")]
    UnsupportedCodec(String),
}

/// Typed view of the submission parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineParameters {
    pub duration_seconds: f64,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub codec: Codec,
    /// Kilobits per second.
    pub bitrate_kbps: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    H264,
    Hevc,
    Av1,
}

static BITRATE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?i)(\d+)\s*([km])?$").expect("bitrate pattern compiles"));
static RESOLUTION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d{2,5})x(\d{2,5})$").expect("resolution pattern compiles"));
/// Scenario names like `720p30-h264` or `4K60-h264` carry a usable
/// resolution hint when the parameters omit one.
static SCENARIO_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^(\d{3,4})p(\d{2,3})?|^4k(\d{2,3})?").expect("scenario pattern"));

const DEFAULT_DURATION_SECONDS: f64 = 10.0;
const DEFAULT_BITRATE_KBPS: u32 = 2_000;

pub fn parse_parameters(
    scenario: &str,
    parameters: &JobParameters,
) -> Result<EngineParameters, CommandError> {
    let duration = match duration_seconds(parameters) {
        Some(d) if d > 0.0 && d.is_finite() => d,
        Some(_) => {
            return Err(CommandError::InvalidParameter {
                name: "duration".into(),
                value: parameters
                    .get("duration")
                    .map(|v| v.to_string())
                    .unwrap_or_default(),
            });
        }
        None => DEFAULT_DURATION_SECONDS,
    };

    let (width, height, scenario_fps) = resolve_resolution(scenario, parameters)?;
    let fps = parameters
        .get("fps")
        .and_then(|v| v.as_u64())
        .map(|v| v as u32)
        .or(scenario_fps)
        .unwrap_or(30);

    let codec = match codec(parameters).as_deref() {
        None | Some("h264") | Some("avc") => Codec::H264,
        Some("h265") | Some("hevc") => Codec::Hevc,
        Some("av1") => Codec::Av1,
        Some(other) => return Err(CommandError::UnsupportedCodec(other.to_string())),
    };

    let bitrate_kbps = match parameters.get("bitrate") {
        None => DEFAULT_BITRATE_KBPS,
        Some(v) => parse_bitrate(v).ok_or_else(|| CommandError::InvalidParameter {
            name: "bitrate".into(),
            value: v.to_string(),
        })?,
    };

    Ok(EngineParameters {
        duration_seconds: duration,
        width,
        height,
        fps,
        codec,
        bitrate_kbps,
    })
}

fn parse_bitrate(value: &serde_json::Value) -> Option<u32> {
    match value {
        serde_json::Value::Number(n) => n.as_u64().map(|v| v as u32),
        serde_json::Value::String(s) => {
            let caps = BITRATE_RE.captures(s.trim())?;
            let base: u32 = caps.get(1)?.as_str().parse().ok()?;
            let scale = match caps.get(2).map(|m| m.as_str().to_ascii_lowercase()) {
                Some(ref u) if u == "m" => 1_000,
                Some(ref u) if u == "k" => 1,
                _ => 1,
            };
            Some(base.saturating_mul(scale))
        }
        _ => None,
    }
}

fn resolve_resolution(
    scenario: &str,
    parameters: &JobParameters,
) -> Result<(u32, u32, Option<u32>), CommandError> {
    if let Some(value) = parameters.get("resolution") {
        let text = value.as_str().unwrap_or_default();
        let caps =
            RESOLUTION_RE
                .captures(text.trim())
                .ok_or_else(|| CommandError::InvalidParameter {
                    name: "resolution".into(),
                    value: value.to_string(),
                })?;
        let width = caps[1].parse().unwrap_or(1280);
        let height = caps[2].parse().unwrap_or(720);
        return Ok((width, height, None));
    }

    // Fall back to the scenario naming convention.
    if let Some(caps) = SCENARIO_RE.captures(scenario) {
        if let Some(p) = caps.get(1) {
            let height: u32 = p.as_str().parse().unwrap_or(720);
            let width = height * 16 / 9;
            let fps = caps.get(2).and_then(|m| m.as_str().parse().ok());
            return Ok((width, height, fps));
        }
        // 4K branch.
        let fps = caps.get(3).and_then(|m| m.as_str().parse().ok());
        return Ok((3840, 2160, fps));
    }

    Ok((1280, 720, None))
}

/// Resolve `auto` to a concrete engine for this node.
pub fn resolve_engine(job: &Job, available: &[String]) -> EngineKind {
    match job.engine {
        EngineKind::Auto => {
            if available.iter().any(|e| e == "ffmpeg") || available.is_empty() {
                EngineKind::Ffmpeg
            } else {
                EngineKind::Gstreamer
            }
        }
        explicit => explicit,
    }
}

/// Build the argv the wrapper will execute. `use_gpu` selects the NVENC
/// encoders the node advertised; the dispatcher already guaranteed the
/// capability for codecs that require it.
pub fn build_argv(job: &Job, engine: EngineKind, use_gpu: bool) -> Result<Vec<String>, CommandError> {
    let params = parse_parameters(&job.scenario, &job.parameters)?;
    match engine {
        EngineKind::Gstreamer => Ok(gstreamer_argv(&params)),
        _ => Ok(ffmpeg_argv(&params, use_gpu)),
    }
}

fn ffmpeg_argv(p: &EngineParameters, use_gpu: bool) -> Vec<String> {
    let encoder = match (p.codec, use_gpu) {
        (Codec::H264, false) => "libx264",
        (Codec::H264, true) => "h264_nvenc",
        (Codec::Hevc, true) => "hevc_nvenc",
        // HEVC/AV1 without GPU only happens when the operator forces it;
        // fall back to the software encoders.
        (Codec::Hevc, false) => "libx265",
        (Codec::Av1, true) => "av1_nvenc",
        (Codec::Av1, false) => "libsvtav1",
    };
    vec![
        "ffmpeg".into(),
        "-hide_banner".into(),
        "-nostdin".into(),
        "-f".into(),
        "lavfi".into(),
        "-i".into(),
        format!("testsrc2=size={}x{}:rate={}", p.width, p.height, p.fps),
        "-t".into(),
        format!("{}", p.duration_seconds),
        "-c:v".into(),
        encoder.into(),
        "-b:v".into(),
        format!("{}k", p.bitrate_kbps),
        "-progress".into(),
        "pipe:2".into(),
        "-f".into(),
        "null".into(),
        "-".into(),
    ]
}

fn gstreamer_argv(p: &EngineParameters) -> Vec<String> {
    let num_buffers = (p.duration_seconds * f64::from(p.fps)).ceil() as u64;
    vec![
        "gst-launch-1.0".into(),
        "-e".into(),
        "videotestsrc".into(),
        format!("num-buffers={num_buffers}"),
        "!".into(),
        format!(
            "video/x-raw,width={},height={},framerate={}/1",
            p.width, p.height, p.fps
        ),
        "!".into(),
        "videoconvert".into(),
        "!".into(),
        "x264enc".into(),
        format!("bitrate={}", p.bitrate_kbps),
        "!".into(),
        "fakesink".into(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::JobRequest;
    use serde_json::json;

    fn job_with(scenario: &str, params: &[(&str, serde_json::Value)]) -> Job {
        let mut req = JobRequest::for_scenario(scenario);
        for (k, v) in params {
            req.parameters.insert((*k).into(), v.clone());
        }
        Job::from_request(req, 1)
    }

    #[test]
    fn typical_submission_parses() {
        let job = job_with("720p30-h264", &[("duration", json!(30)), ("bitrate", json!("2M"))]);
        let p = parse_parameters(&job.scenario, &job.parameters).unwrap();
        assert_eq!(p.duration_seconds, 30.0);
        assert_eq!((p.width, p.height, p.fps), (1280, 720, 30));
        assert_eq!(p.codec, Codec::H264);
        assert_eq!(p.bitrate_kbps, 2_000);
    }

    #[test]
    fn resolution_parameter_beats_scenario_hint() {
        let job = job_with("720p30-h264", &[("resolution", json!("1920x1080"))]);
        let p = parse_parameters(&job.scenario, &job.parameters).unwrap();
        assert_eq!((p.width, p.height), (1920, 1080));
    }

    #[test]
    fn four_k_scenarios_resolve() {
        let job = job_with("4K60-h264", &[]);
        let p = parse_parameters(&job.scenario, &job.parameters).unwrap();
        assert_eq!((p.width, p.height, p.fps), (3840, 2160, 60));
    }

    #[test]
    fn bad_bitrate_is_a_user_error() {
        let job = job_with("s", &[("bitrate", json!("fast"))]);
        let err = parse_parameters(&job.scenario, &job.parameters).unwrap_err();
        assert!(matches!(err, CommandError::InvalidParameter { ref name, .. } if name == "bitrate"));
    }

    #[test]
    fn negative_duration_is_rejected() {
        let job = job_with("s", &[("duration", json!(-5))]);
        assert!(parse_parameters(&job.scenario, &job.parameters).is_err());
    }

    #[test]
    fn ffmpeg_argv_uses_nvenc_only_with_gpu() {
        let job = job_with("1080p30", &[("codec", json!("hevc")), ("duration", json!(5))]);
        let gpu = build_argv(&job, EngineKind::Ffmpeg, true).unwrap();
        assert!(gpu.contains(&"hevc_nvenc".to_string()));
        let cpu = build_argv(&job, EngineKind::Ffmpeg, false).unwrap();
        assert!(cpu.contains(&"libx265".to_string()));
    }

    #[test]
    fn gstreamer_argv_sizes_the_test_source() {
        let job = job_with("720p30", &[("duration", json!(2))]);
        let argv = build_argv(&job, EngineKind::Gstreamer, false).unwrap();
        assert_eq!(argv[0], "gst-launch-1.0");
        assert!(argv.contains(&"num-buffers=60".to_string()));
    }

    #[test]
    fn auto_engine_prefers_ffmpeg() {
        let job = job_with("s", &[]);
        assert_eq!(
            resolve_engine(&job, &["ffmpeg".into(), "gstreamer".into()]),
            EngineKind::Ffmpeg
        );
        assert_eq!(
            resolve_engine(&job, &["gstreamer".into()]),
            EngineKind::Gstreamer
        );
        assert_eq!(resolve_engine(&job, &[]), EngineKind::Ffmpeg);
    }
}

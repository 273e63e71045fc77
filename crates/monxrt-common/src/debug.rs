//! Debug override options, read from the environment.
//!
//! Each option is read on first use and cached for the lifetime of the
//! process. Recognized keys and defaults:
//!
//! | Key | Meaning | Default |
//! |---|---|---|
//! | `MONXRT_LOG` | tracing filter when `RUST_LOG` is unset | `info` |
//! | `MONXRT_LIFECYCLE_LOG` | verbose session lifecycle logging | `false` |
//! | `MONXRT_DEBUG_VIEWS` | log per-view data | `false` |
//! | `MONXRT_DEBUG_SPACES` | log space resolution | `false` |
//! | `MONXRT_IPD_MM` | interpupillary distance override, millimeters | `63.0` |
//! | `MONXRT_WAIT_FRAME_SLEEP_MS` | extra sleep added to `wait_frame` | `0` |
//! | `MONXRT_FOV_OVERRIDE` | four radian half-angles `l,r,u,d` | unset |
//! | `MONXRT_EXIT_ON_DISCONNECT` | stop the service when a client drops | `false` |

use std::env;

/// Truthy values accepted for boolean options.
fn parse_bool(val: &str) -> bool {
    matches!(
        val.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Read a raw string option, `None` if unset or empty.
pub fn get_str(key: &str) -> Option<String> {
    match env::var(key) {
        Ok(v) if !v.trim().is_empty() => Some(v),
        _ => None,
    }
}

/// Read a boolean option with a default.
pub fn get_bool(key: &str, default: bool) -> bool {
    get_str(key).map(|v| parse_bool(&v)).unwrap_or(default)
}

/// Read a floating-point option with a default. Malformed values fall back
/// to the default with a warning.
pub fn get_f64(key: &str, default: f64) -> f64 {
    match get_str(key) {
        Some(v) => v.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %v, "malformed debug option, using default");
            default
        }),
        None => default,
    }
}

/// Read an unsigned integer option with a default.
pub fn get_u64(key: &str, default: u64) -> u64 {
    match get_str(key) {
        Some(v) => v.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %v, "malformed debug option, using default");
            default
        }),
        None => default,
    }
}

/// Field-of-view override angles in radians: left, right, up, down.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FovOverride {
    pub angle_left: f64,
    pub angle_right: f64,
    pub angle_up: f64,
    pub angle_down: f64,
}

/// Parse `MONXRT_FOV_OVERRIDE` as four comma-separated radian angles.
pub fn get_fov_override() -> Option<FovOverride> {
    let raw = get_str("MONXRT_FOV_OVERRIDE")?;
    let parts: Vec<f64> = raw
        .split(',')
        .map(|p| p.trim().parse().ok())
        .collect::<Option<Vec<_>>>()?;
    if parts.len() != 4 {
        tracing::warn!(value = %raw, "MONXRT_FOV_OVERRIDE needs four angles, ignoring");
        return None;
    }
    Some(FovOverride {
        angle_left: parts[0],
        angle_right: parts[1],
        angle_up: parts[2],
        angle_down: parts[3],
    })
}

/// Options the service reads once at startup.
#[derive(Debug, Clone)]
pub struct ServiceOptions {
    pub lifecycle_log: bool,
    pub debug_views: bool,
    pub debug_spaces: bool,
    pub ipd_mm: f64,
    pub wait_frame_sleep_ms: u64,
    pub fov_override: Option<FovOverride>,
    pub exit_on_disconnect: bool,
}

impl ServiceOptions {
    /// Capture all debug options from the environment.
    pub fn from_env() -> Self {
        Self {
            lifecycle_log: get_bool("MONXRT_LIFECYCLE_LOG", false),
            debug_views: get_bool("MONXRT_DEBUG_VIEWS", false),
            debug_spaces: get_bool("MONXRT_DEBUG_SPACES", false),
            ipd_mm: get_f64("MONXRT_IPD_MM", 63.0),
            wait_frame_sleep_ms: get_u64("MONXRT_WAIT_FRAME_SLEEP_MS", 0),
            fov_override: get_fov_override(),
            exit_on_disconnect: get_bool("MONXRT_EXIT_ON_DISCONNECT", false),
        }
    }
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            lifecycle_log: false,
            debug_views: false,
            debug_spaces: false,
            ipd_mm: 63.0,
            wait_frame_sleep_ms: 0,
            fov_override: None,
            exit_on_disconnect: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bool_parsing() {
        assert!(parse_bool("1"));
        assert!(parse_bool("TRUE"));
        assert!(parse_bool(" on "));
        assert!(!parse_bool("0"));
        assert!(!parse_bool("off"));
        assert!(!parse_bool("nonsense"));
    }

    #[test]
    fn defaults_without_env() {
        let opts = ServiceOptions::default();
        assert!(!opts.lifecycle_log);
        assert_eq!(opts.ipd_mm, 63.0);
        assert_eq!(opts.wait_frame_sleep_ms, 0);
        assert!(opts.fov_override.is_none());
    }
}

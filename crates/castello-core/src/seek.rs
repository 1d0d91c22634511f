//! Start position normalization
//!
//! Senders disagree on the unit of the requested start position: some send
//! seconds, some milliseconds. A value larger than the media duration can
//! only be milliseconds.

use url::form_urlencoded;

/// Query parameters that trim a manifest server-side
const TRIM_PARAMS: [&str; 2] = ["start", "end"];

/// Convert a raw requested start position into seconds.
///
/// Absent, negative or non-finite input is treated as `0`.
pub fn normalize(requested_seek_raw: f64, media_duration_seconds: f64, watch_from_start: bool) -> f64 {
    if watch_from_start {
        return 0.0;
    }
    let raw = if requested_seek_raw.is_finite() && requested_seek_raw > 0.0 {
        requested_seek_raw
    } else {
        0.0
    };
    let duration = if media_duration_seconds.is_finite() {
        media_duration_seconds
    } else {
        0.0
    };

    if raw > duration && duration > 0.0 {
        raw / 1000.0
    } else {
        raw
    }
}

/// Normalize the optional fields of a load command
pub fn normalize_command(requested: Option<f64>, duration: Option<f64>, watch_from_start: bool) -> f64 {
    normalize(requested.unwrap_or(0.0), duration.unwrap_or(0.0), watch_from_start)
}

/// Whether a normalized seek should be applied once the player knows the
/// real duration. Skipped seeks are not retried.
pub fn should_apply(target_seconds: f64, player_duration: f64) -> bool {
    player_duration > 0.0 && target_seconds < player_duration
}

/// Remove `start`/`end` query parameters so a trimmed manifest cannot
/// override an explicit restart.
///
/// Works on the raw string, so relative and otherwise unparseable URLs are
/// stripped too. The base, the remaining parameters and any fragment are
/// kept byte for byte.
pub fn strip_trim_params(source_url: &str) -> String {
    let (rest, fragment) = match source_url.split_once('#') {
        Some((rest, fragment)) => (rest, Some(fragment)),
        None => (source_url, None),
    };
    let Some((base, query)) = rest.split_once('?') else {
        return source_url.to_string();
    };

    let kept: Vec<&str> = query
        .split('&')
        .filter(|pair| {
            form_urlencoded::parse(pair.as_bytes())
                .next()
                .is_some_and(|(key, _)| !TRIM_PARAMS.contains(&key.as_ref()))
        })
        .collect();

    let mut stripped = base.to_string();
    if !kept.is_empty() {
        stripped.push('?');
        stripped.push_str(&kept.join("&"));
    }
    if let Some(fragment) = fragment {
        stripped.push('#');
        stripped.push_str(fragment);
    }
    stripped
}

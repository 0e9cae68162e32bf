use std::{cmp::Ordering, sync::LazyLock};

use regex::Regex;

const ALT_WEIGHT: f64 = 0.01;
const BITRATE_WEIGHT_RATIO: f64 = 2.8;

static QUALITY_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d+)([kp])?(\d+)?(\+)?(?:[a_](\d+)k)?(?:_(alt)(\d)?)?$").unwrap()
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightKind {
    Pixels,
    Bitrate,
    None,
}

/// Quality weight of a stream name such as `720p60`, `1080p+`, `480p_alt` or
/// `2500k`. Names that carry no quality get `(0.0, WeightKind::None)`.
pub fn stream_weight(name: &str) -> (f64, WeightKind) {
    let Some(captures) = QUALITY_REGEX.captures(name) else {
        return (0.0, WeightKind::None);
    };
    let number = |index: usize| {
        captures
            .get(index)
            .and_then(|m| m.as_str().parse::<f64>().ok())
    };

    let mut weight = 0.0;
    if captures.get(6).is_some() {
        weight -= ALT_WEIGHT * number(7).unwrap_or(1.0);
    }

    match captures.get(2).map(|m| m.as_str()) {
        Some("k") => (weight + number(1).unwrap_or(0.0), WeightKind::Bitrate),
        Some("p") => {
            weight += number(1).unwrap_or(0.0);
            weight += number(3).unwrap_or(0.0);
            if captures.get(4).is_some() {
                weight += 1.0;
            }
            weight += number(5).unwrap_or(0.0) / BITRATE_WEIGHT_RATIO;
            (weight, WeightKind::Pixels)
        }
        _ => (0.0, WeightKind::None),
    }
}

pub fn compare_streams(a: &str, b: &str) -> Ordering {
    stream_weight(a).0.total_cmp(&stream_weight(b).0)
}

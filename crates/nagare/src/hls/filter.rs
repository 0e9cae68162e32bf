use regex::Regex;

use super::m3u8::Segment;
use crate::error::{NagareError, NagareResult};

/// Decides whether a segment is dropped from the output.
///
/// A filtered segment is never downloaded, but it still occupies its slot so
/// that the segments around it are written back to back.
pub trait SegmentFilter: Send + Sync {
    fn should_filter(&self, segment: &Segment) -> bool;
}

impl<F> SegmentFilter for F
where
    F: Fn(&Segment) -> bool + Send + Sync,
{
    fn should_filter(&self, segment: &Segment) -> bool {
        self(segment)
    }
}

/// Filters segments whose file name, without extension, is one of `names`.
pub struct IgnoreNamesFilter {
    pattern: Regex,
}

impl IgnoreNamesFilter {
    pub fn new(names: &[String]) -> NagareResult<Option<Self>> {
        if names.is_empty() {
            return Ok(None);
        }

        let names = names
            .iter()
            .map(|name| regex::escape(name))
            .collect::<Vec<_>>()
            .join("|");
        let pattern = Regex::new(&format!(r"(?:/|^)(?:{names})\.\w{{2,5}}$"))
            .map_err(|e| NagareError::Config(format!("Invalid hls-segment-ignore-names: {e}")))?;
        Ok(Some(Self { pattern }))
    }
}

impl SegmentFilter for IgnoreNamesFilter {
    fn should_filter(&self, segment: &Segment) -> bool {
        self.pattern.is_match(segment.uri.path())
    }
}

/// Filters segments whose URI contains a fixed substring, such as the
/// `preloading` placeholders some live sites splice into their playlists.
pub struct UriContainsFilter {
    needle: String,
}

impl UriContainsFilter {
    pub fn new(needle: impl Into<String>) -> Self {
        Self {
            needle: needle.into(),
        }
    }
}

impl SegmentFilter for UriContainsFilter {
    fn should_filter(&self, segment: &Segment) -> bool {
        segment.uri.as_str().contains(&self.needle)
    }
}

#[cfg(test)]
mod tests {
    use url::Url;

    use super::*;

    fn segment(uri: &str) -> Segment {
        Segment {
            num: 0,
            uri: Url::parse(uri).unwrap(),
            duration: 1.0,
            title: None,
            byte_range: None,
            discontinuity: false,
            key: None,
            map: None,
            program_date_time: None,
        }
    }

    #[test]
    fn test_ignore_names() {
        let filter = IgnoreNamesFilter::new(&["ad".to_string(), "pre.roll".to_string()])
            .unwrap()
            .unwrap();
        assert!(filter.should_filter(&segment("https://example.com/live/ad.ts")));
        assert!(filter.should_filter(&segment("https://example.com/pre.roll.aac?x=1")));
        assert!(!filter.should_filter(&segment("https://example.com/live/bad.ts")));
        assert!(!filter.should_filter(&segment("https://example.com/ad/seg.ts")));
        assert!(!filter.should_filter(&segment("https://example.com/preXroll.ts")));

        assert!(IgnoreNamesFilter::new(&[]).unwrap().is_none());
    }

    #[test]
    fn test_uri_contains() {
        let filter = UriContainsFilter::new("preloading");
        assert!(filter.should_filter(&segment("https://example.com/preloading/1.ts")));
        assert!(!filter.should_filter(&segment("https://example.com/live/1.ts")));
    }

    #[test]
    fn test_closure_filter() {
        let filter = |segment: &Segment| segment.duration < 0.5;
        assert!(!filter.should_filter(&segment("https://example.com/a.ts")));
    }
}

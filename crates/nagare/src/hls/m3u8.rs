use std::{borrow::Cow, collections::HashMap, fmt};

use chrono::{DateTime, Duration as ChronoDuration, FixedOffset};
use m3u8_rs::QuotedOrUnquoted;
use url::Url;

use crate::{
    error::{NagareError, NagareResult},
    util::ByteRange,
};

#[derive(Debug, Clone, PartialEq)]
pub enum Playlist {
    Media(MediaPlaylist),
    Multivariant(MultivariantPlaylist),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaylistType {
    Event,
    Vod,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MediaPlaylist {
    pub url: Url,
    pub version: Option<u32>,
    pub target_duration: Option<f64>,
    pub media_sequence: u64,
    pub discontinuity_sequence: u64,
    pub playlist_type: Option<PlaylistType>,
    pub end_list: bool,
    pub iframes_only: bool,
    /// `TIME-OFFSET` of `#EXT-X-START`
    pub start_offset: Option<f64>,
    pub segments: Vec<Segment>,
}

impl MediaPlaylist {
    pub fn last_sequence(&self) -> Option<u64> {
        self.segments.last().map(|s| s.num)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    /// Absolute media sequence number.
    pub num: u64,
    pub uri: Url,
    pub duration: f64,
    pub title: Option<String>,
    pub byte_range: Option<ByteRange>,
    pub discontinuity: bool,
    pub key: Option<Key>,
    pub map: Option<Map>,
    pub program_date_time: Option<DateTime<FixedOffset>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KeyMethod {
    None,
    Aes128,
    SampleAes,
    Other(String),
}

impl From<&m3u8_rs::KeyMethod> for KeyMethod {
    fn from(method: &m3u8_rs::KeyMethod) -> Self {
        match method {
            m3u8_rs::KeyMethod::None => KeyMethod::None,
            m3u8_rs::KeyMethod::AES128 => KeyMethod::Aes128,
            m3u8_rs::KeyMethod::SampleAES => KeyMethod::SampleAes,
            m3u8_rs::KeyMethod::Other(other) => KeyMethod::Other(other.clone()),
        }
    }
}

impl fmt::Display for KeyMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyMethod::None => write!(f, "NONE"),
            KeyMethod::Aes128 => write!(f, "AES-128"),
            KeyMethod::SampleAes => write!(f, "SAMPLE-AES"),
            KeyMethod::Other(other) => write!(f, "{other}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Key {
    pub method: KeyMethod,
    pub uri: Option<Url>,
    pub iv: Option<[u8; 16]>,
    pub key_format: Option<String>,
    pub key_format_versions: Option<String>,
}

/// Media initialization section (`#EXT-X-MAP`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Map {
    pub uri: Url,
    pub byte_range: Option<ByteRange>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub width: u64,
    pub height: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Variant {
    pub uri: Url,
    pub bandwidth: u64,
    pub average_bandwidth: Option<u64>,
    pub codecs: Option<String>,
    pub resolution: Option<Resolution>,
    pub frame_rate: Option<f64>,
    pub audio: Option<String>,
    pub video: Option<String>,
    pub subtitles: Option<String>,
    /// Non-standard `NAME` attribute some sites put on variants.
    pub name: Option<String>,
    pub is_iframe: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaType {
    Audio,
    Video,
    Subtitles,
    ClosedCaptions,
    Other(String),
}

impl From<&m3u8_rs::AlternativeMediaType> for MediaType {
    fn from(media_type: &m3u8_rs::AlternativeMediaType) -> Self {
        match media_type {
            m3u8_rs::AlternativeMediaType::Audio => MediaType::Audio,
            m3u8_rs::AlternativeMediaType::Video => MediaType::Video,
            m3u8_rs::AlternativeMediaType::Subtitles => MediaType::Subtitles,
            m3u8_rs::AlternativeMediaType::ClosedCaptions => MediaType::ClosedCaptions,
            m3u8_rs::AlternativeMediaType::Other(other) => MediaType::Other(other.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Media {
    pub media_type: MediaType,
    pub uri: Option<Url>,
    pub group_id: String,
    pub language: Option<String>,
    pub name: String,
    pub default: bool,
    pub autoselect: bool,
    pub forced: bool,
    pub channels: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MultivariantPlaylist {
    pub url: Url,
    pub version: Option<u32>,
    pub variants: Vec<Variant>,
    pub media: Vec<Media>,
}

fn overflow(what: &str) -> NagareError {
    NagareError::Protocol(format!("{what} out of range"))
}

fn parse_iv(iv: &str) -> NagareResult<[u8; 16]> {
    let invalid = || NagareError::Protocol(format!("invalid IV: {iv}"));
    let digits = iv.trim();
    let digits = digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
        .unwrap_or(digits);
    if digits.len() > 32 {
        return Err(invalid());
    }
    hex::decode(format!("{digits:0>32}"))
        .map_err(|_| invalid())?
        .try_into()
        .map_err(|_| invalid())
}

fn attribute_value(value: &QuotedOrUnquoted) -> String {
    match value {
        QuotedOrUnquoted::Quoted(value) | QuotedOrUnquoted::Unquoted(value) => value.clone(),
    }
}

fn convert_key(key: &m3u8_rs::Key, base: &Url) -> NagareResult<Option<Key>> {
    let method = KeyMethod::from(&key.method);
    if method == KeyMethod::None {
        return Ok(None);
    }

    Ok(Some(Key {
        method,
        uri: key.uri.as_deref().map(|uri| base.join(uri)).transpose()?,
        iv: key.iv.as_deref().map(parse_iv).transpose()?,
        key_format: key.keyformat.clone(),
        key_format_versions: key.keyformatversions.clone(),
    }))
}

fn convert_map(map: &m3u8_rs::Map, base: &Url) -> NagareResult<Map> {
    let byte_range = match &map.byte_range {
        Some(range) => {
            let range = ByteRange::new(range.offset.unwrap_or(0), range.length);
            range.end().ok_or_else(|| overflow("#EXT-X-MAP byte range"))?;
            Some(range)
        }
        None => None,
    };
    Ok(Map {
        uri: base.join(&map.uri)?,
        byte_range,
    })
}

/// Applies the tag state m3u8-rs keeps on a single segment to every segment
/// it governs. Keys and maps stay in effect until replaced, and byte ranges
/// without an offset continue the previous range of the same resource.
/// Program date times are extrapolated up to the next discontinuity.
fn convert_media(playlist: m3u8_rs::MediaPlaylist, base: &Url) -> NagareResult<MediaPlaylist> {
    let mut key = None;
    let mut map = None;
    let mut next_date: Option<DateTime<FixedOffset>> = None;
    let mut range_ends: HashMap<Url, u64> = HashMap::new();
    let mut segments = Vec::with_capacity(playlist.segments.len());

    for (index, segment) in playlist.segments.into_iter().enumerate() {
        let num = playlist
            .media_sequence
            .checked_add(index as u64)
            .ok_or_else(|| overflow("media sequence"))?;
        let uri = base.join(&segment.uri)?;

        if let Some(k) = &segment.key {
            key = convert_key(k, base)?;
        }
        if let Some(m) = &segment.map {
            map = Some(convert_map(m, base)?);
        }

        let byte_range = match &segment.byte_range {
            Some(range) => {
                let offset = range
                    .offset
                    .unwrap_or_else(|| range_ends.get(&uri).copied().unwrap_or(0));
                let range = ByteRange::new(offset, range.length);
                let end = range.end().ok_or_else(|| overflow("#EXT-X-BYTERANGE"))?;
                range_ends.insert(uri.clone(), end);
                Some(range)
            }
            None => None,
        };

        let duration = (segment.duration as f64).max(0.0);
        let program_date_time = match segment.program_date_time {
            Some(date) => Some(date),
            None if segment.discontinuity => None,
            None => next_date,
        };
        next_date = program_date_time
            .map(|date| date + ChronoDuration::milliseconds((duration * 1000.0) as i64));

        segments.push(Segment {
            num,
            uri,
            duration,
            title: segment.title.filter(|title| !title.is_empty()),
            byte_range,
            discontinuity: segment.discontinuity,
            key: key.clone(),
            map: map.clone(),
            program_date_time,
        });
    }

    let target_duration = playlist.target_duration as f64;
    Ok(MediaPlaylist {
        url: base.clone(),
        version: playlist.version.and_then(|v| u32::try_from(v).ok()),
        target_duration: (target_duration > 0.0).then_some(target_duration),
        media_sequence: playlist.media_sequence,
        discontinuity_sequence: playlist.discontinuity_sequence,
        playlist_type: match playlist.playlist_type {
            Some(m3u8_rs::MediaPlaylistType::Event) => Some(PlaylistType::Event),
            Some(m3u8_rs::MediaPlaylistType::Vod) => Some(PlaylistType::Vod),
            _ => None,
        },
        end_list: playlist.end_list,
        iframes_only: playlist.i_frames_only,
        start_offset: playlist
            .start
            .and_then(|start| start.time_offset.to_string().parse().ok()),
        segments,
    })
}

fn convert_variant(variant: &m3u8_rs::VariantStream, base: &Url) -> NagareResult<Variant> {
    Ok(Variant {
        uri: base.join(&variant.uri)?,
        bandwidth: variant.bandwidth,
        average_bandwidth: variant.average_bandwidth,
        codecs: variant.codecs.clone(),
        resolution: variant.resolution.map(|r| Resolution {
            width: r.width,
            height: r.height,
        }),
        frame_rate: variant.frame_rate,
        audio: variant.audio.clone(),
        video: variant.video.clone(),
        subtitles: variant.subtitles.clone(),
        name: variant
            .other_attributes
            .as_ref()
            .and_then(|attributes| attributes.get("NAME"))
            .map(attribute_value),
        is_iframe: variant.is_i_frame,
    })
}

fn convert_media_rendition(media: &m3u8_rs::AlternativeMedia, base: &Url) -> NagareResult<Media> {
    Ok(Media {
        media_type: MediaType::from(&media.media_type),
        uri: media.uri.as_deref().map(|uri| base.join(uri)).transpose()?,
        group_id: media.group_id.clone(),
        language: media.language.clone(),
        name: media.name.clone(),
        default: media.default,
        autoselect: media.autoselect,
        forced: media.forced,
        channels: media.channels.clone(),
    })
}

fn convert_multivariant(
    playlist: m3u8_rs::MasterPlaylist,
    base: &Url,
) -> NagareResult<MultivariantPlaylist> {
    Ok(MultivariantPlaylist {
        url: base.clone(),
        version: playlist.version.and_then(|v| u32::try_from(v).ok()),
        variants: playlist
            .variants
            .iter()
            .map(|variant| convert_variant(variant, base))
            .collect::<NagareResult<_>>()?,
        media: playlist
            .alternatives
            .iter()
            .map(|media| convert_media_rendition(media, base))
            .collect::<NagareResult<_>>()?,
    })
}

/// Parses playlist bytes; relative URIs resolve against `url`.
pub fn parse_playlist(data: &[u8], url: &Url) -> NagareResult<Playlist> {
    let data = data.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(data);
    // m3u8-rs expects the last line to be terminated
    let data: Cow<[u8]> = if data.ends_with(b"\n") {
        Cow::Borrowed(data)
    } else {
        let mut owned = data.to_vec();
        owned.push(b'\n');
        Cow::Owned(owned)
    };

    match m3u8_rs::parse_playlist_res(&data) {
        Ok(m3u8_rs::Playlist::MediaPlaylist(playlist)) => {
            Ok(Playlist::Media(convert_media(playlist, url)?))
        }
        Ok(m3u8_rs::Playlist::MasterPlaylist(playlist)) => {
            Ok(Playlist::Multivariant(convert_multivariant(playlist, url)?))
        }
        Err(error) => Err(NagareError::Protocol(format!(
            "failed to parse playlist {url}: {error}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Url {
        Url::parse("https://example.com/live/playlist.m3u8").unwrap()
    }

    fn media(text: &str) -> MediaPlaylist {
        match parse_playlist(text.as_bytes(), &base()).unwrap() {
            Playlist::Media(playlist) => playlist,
            Playlist::Multivariant(_) => panic!("expected a media playlist"),
        }
    }

    #[test]
    fn test_missing_header() {
        let result = parse_playlist(b"#EXTINF:1,\nseg.ts\n", &base());
        assert!(matches!(result, Err(NagareError::Protocol(_))));
    }

    #[test]
    fn test_media_playlist() {
        let playlist = media(
            "#EXTM3U
#EXT-X-VERSION:3
#EXT-X-TARGETDURATION:6
#EXT-X-MEDIA-SEQUENCE:100
#EXTINF:6.000,first
seg100.ts
#EXTINF:5.5,
https://cdn.example.com/seg101.ts
#EXT-X-DISCONTINUITY
#EXTINF:6,
../other/seg102.ts
#EXT-X-ENDLIST
",
        );
        assert_eq!(playlist.version, Some(3));
        assert_eq!(playlist.target_duration, Some(6.0));
        assert!(playlist.end_list);
        let nums: Vec<_> = playlist.segments.iter().map(|s| s.num).collect();
        assert_eq!(nums, vec![100, 101, 102]);
        assert_eq!(playlist.segments[0].title.as_deref(), Some("first"));
        assert_eq!(
            playlist.segments[0].uri.as_str(),
            "https://example.com/live/seg100.ts"
        );
        assert_eq!(
            playlist.segments[1].uri.as_str(),
            "https://cdn.example.com/seg101.ts"
        );
        assert_eq!(
            playlist.segments[2].uri.as_str(),
            "https://example.com/other/seg102.ts"
        );
        assert!(playlist.segments[2].discontinuity);
        assert!(!playlist.segments[1].discontinuity);
    }

    #[test]
    fn test_missing_media_sequence() {
        let playlist = media("#EXTM3U\n#EXTINF:1,\na.ts\n#EXTINF:1,\nb.ts\n");
        assert_eq!(playlist.media_sequence, 0);
        assert_eq!(playlist.last_sequence(), Some(1));
        assert_eq!(playlist.target_duration, None);
    }

    #[test]
    fn test_keys_carry_forward() {
        let playlist = media(
            "#EXTM3U
#EXT-X-MEDIA-SEQUENCE:7
#EXT-X-KEY:METHOD=AES-128,URI=\"k.key\",IV=0x00000000000000000000000000000001
#EXTINF:1,
a.ts
#EXTINF:1,
b.ts
#EXT-X-KEY:METHOD=AES-128,URI=\"k2.key\"
#EXTINF:1,
c.ts
#EXT-X-KEY:METHOD=NONE
#EXTINF:1,
d.ts
",
        );
        let segments = &playlist.segments;
        let key = segments[0].key.as_ref().unwrap();
        assert_eq!(key.method, KeyMethod::Aes128);
        assert_eq!(key.uri.as_ref().map(Url::as_str), Some("https://example.com/live/k.key"));
        let mut iv = [0u8; 16];
        iv[15] = 1;
        assert_eq!(key.iv, Some(iv));
        assert_eq!(segments[1].key, segments[0].key);
        assert_eq!(segments[2].key.as_ref().and_then(|k| k.iv), None);
        assert!(segments[3].key.is_none());
    }

    #[test]
    fn test_byte_ranges() {
        let playlist = media(
            "#EXTM3U
#EXTINF:1,
#EXT-X-BYTERANGE:1000@0
media.ts
#EXTINF:1,
#EXT-X-BYTERANGE:500
media.ts
#EXTINF:1,
#EXT-X-BYTERANGE:200
other.ts
",
        );
        let ranges: Vec<_> = playlist.segments.iter().map(|s| s.byte_range).collect();
        assert_eq!(
            ranges,
            vec![
                Some(ByteRange::new(0, 1000)),
                Some(ByteRange::new(1000, 500)),
                Some(ByteRange::new(0, 200)),
            ]
        );
    }

    #[test]
    fn test_map_and_date() {
        let playlist = media(
            "#EXTM3U
#EXT-X-MAP:URI=\"init.mp4\",BYTERANGE=\"720@0\"
#EXT-X-PROGRAM-DATE-TIME:2024-01-01T00:00:00.000+00:00
#EXTINF:2,
a.m4s
#EXTINF:2,
b.m4s
",
        );
        let map = playlist.segments[0].map.as_ref().unwrap();
        assert_eq!(map.uri.as_str(), "https://example.com/live/init.mp4");
        assert_eq!(map.byte_range, Some(ByteRange::new(0, 720)));
        assert_eq!(playlist.segments[1].map, playlist.segments[0].map);

        let first = playlist.segments[0].program_date_time.unwrap();
        let second = playlist.segments[1].program_date_time.unwrap();
        assert_eq!((second - first).num_seconds(), 2);
    }

    #[test]
    fn test_multivariant() {
        let playlist = parse_playlist(
            b"#EXTM3U
#EXT-X-MEDIA:TYPE=AUDIO,GROUP-ID=\"aac\",LANGUAGE=\"en\",NAME=\"English\",DEFAULT=YES,AUTOSELECT=YES,URI=\"audio/en.m3u8\"
#EXT-X-STREAM-INF:BANDWIDTH=1280000,RESOLUTION=1280x720,FRAME-RATE=60.000,CODECS=\"avc1.4d401f,mp4a.40.2\",AUDIO=\"aac\"
720p60.m3u8
#EXT-X-I-FRAME-STREAM-INF:BANDWIDTH=86000,URI=\"iframe.m3u8\"
",
            &base(),
        )
        .unwrap();
        let Playlist::Multivariant(playlist) = playlist else {
            panic!("expected a multivariant playlist");
        };
        assert_eq!(playlist.variants.len(), 2);
        let variant = &playlist.variants[0];
        assert_eq!(variant.bandwidth, 1_280_000);
        assert_eq!(variant.codecs.as_deref(), Some("avc1.4d401f,mp4a.40.2"));
        assert_eq!(
            variant.resolution,
            Some(Resolution {
                width: 1280,
                height: 720
            })
        );
        assert_eq!(variant.frame_rate, Some(60.0));
        assert!(playlist.variants[1].is_iframe);

        let audio = &playlist.media[0];
        assert_eq!(audio.media_type, MediaType::Audio);
        assert!(audio.default && audio.autoselect);
        assert_eq!(
            audio.uri.as_ref().map(Url::as_str),
            Some("https://example.com/live/audio/en.m3u8")
        );
    }

    #[test]
    fn test_overflowing_byte_range() {
        let result = parse_playlist(
            b"#EXTM3U
#EXTINF:1,
#EXT-X-BYTERANGE:18446744073709551615@10
media.ts
",
            &base(),
        );
        assert!(matches!(result, Err(NagareError::Protocol(_))));

        // a continued range may overflow even when each one fits
        let result = parse_playlist(
            b"#EXTM3U
#EXTINF:1,
#EXT-X-BYTERANGE:18446744073709551000@0
media.ts
#EXTINF:1,
#EXT-X-BYTERANGE:1000
media.ts
",
            &base(),
        );
        assert!(matches!(result, Err(NagareError::Protocol(_))));
    }

    #[test]
    fn test_overflowing_media_sequence() {
        let result = parse_playlist(
            b"#EXTM3U
#EXT-X-MEDIA-SEQUENCE:18446744073709551615
#EXTINF:1,
a.ts
#EXTINF:1,
b.ts
",
            &base(),
        );
        assert!(matches!(result, Err(NagareError::Protocol(_))));
    }

    #[test]
    fn test_parse_iv() {
        let mut iv = [0u8; 16];
        iv[15] = 0x1f;
        assert_eq!(parse_iv("0x0000000000000000000000000000001F").unwrap(), iv);
        assert_eq!(parse_iv("0X1f").unwrap(), iv);
        assert!(parse_iv("0xZZ").is_err());
        assert!(parse_iv(&format!("0x{}", "1".repeat(33))).is_err());
    }
}

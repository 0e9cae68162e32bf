use std::collections::HashSet;

use super::{
    m3u8::{parse_playlist, Media, MediaType, Playlist, Variant},
    options::HlsOptions,
    stream::HlsStream,
};
use crate::{error::NagareResult, http::RequestOverlay, session::Session};

/// Stream name of a variant: its `NAME`, else `<height>p` (with the frame
/// rate appended above 30 fps), else `<kbps>k`.
pub fn variant_name(variant: &Variant) -> Option<String> {
    if let Some(name) = variant.name.as_deref().filter(|n| !n.is_empty()) {
        return Some(name.to_string());
    }
    if let Some(resolution) = variant.resolution.filter(|r| r.height > 0) {
        return Some(match variant.frame_rate {
            Some(fps) if fps > 30.0 => format!("{}p{}", resolution.height, fps.round() as u64),
            _ => format!("{}p", resolution.height),
        });
    }
    (variant.bandwidth > 0).then(|| format!("{}k", variant.bandwidth / 1000))
}

/// Audio renditions to pair with a variant (RFC 8216 4.3.4.2.1).
///
/// Renditions listed in `select` by language or name win (`*` selects all),
/// then the `DEFAULT=YES` rendition, then the first `AUTOSELECT=YES` one.
/// Renditions without a URI are muxed into the variant and never selected.
pub fn select_audio(media: &[Media], group: Option<&str>, select: &[String]) -> Vec<Media> {
    let Some(group) = group else {
        return Vec::new();
    };
    let renditions: Vec<&Media> = media
        .iter()
        .filter(|m| m.media_type == MediaType::Audio && m.group_id == group && m.uri.is_some())
        .collect();

    if !select.is_empty() {
        let selected: Vec<Media> = renditions
            .iter()
            .filter(|m| {
                select.iter().any(|s| {
                    s == "*"
                        || m.name.eq_ignore_ascii_case(s)
                        || m.language.as_deref().is_some_and(|l| l.eq_ignore_ascii_case(s))
                })
            })
            .map(|m| (*m).clone())
            .collect();
        if !selected.is_empty() {
            return selected;
        }
    }

    renditions
        .iter()
        .find(|m| m.default)
        .or_else(|| renditions.iter().find(|m| m.autoselect))
        .map(|m| vec![(*m).clone()])
        .unwrap_or_default()
}

fn unique_name(name: String, taken: &mut HashSet<String>) -> String {
    if taken.insert(name.clone()) {
        return name;
    }
    let alt = format!("{name}_alt");
    if taken.insert(alt.clone()) {
        return alt;
    }
    let mut index = 2;
    loop {
        let alt = format!("{name}_alt{index}");
        if taken.insert(alt.clone()) {
            return alt;
        }
        index += 1;
    }
}

pub(crate) async fn parse_variant_playlist(
    session: &Session,
    url: &str,
    overlay: RequestOverlay,
) -> NagareResult<Vec<(String, HlsStream)>> {
    let response = session.http().get(url).overlay(overlay.clone()).send().await?;
    let Playlist::Multivariant(playlist) = parse_playlist(response.bytes(), response.url())? else {
        return Ok(Vec::new());
    };
    let audio_select = HlsOptions::from_options(&session.options())?.audio_select;

    let mut taken = HashSet::new();
    let mut streams = Vec::new();
    for variant in playlist.variants.iter().filter(|v| !v.is_iframe) {
        let Some(name) = variant_name(variant) else {
            log::debug!("Skipping unnamed variant {}", variant.uri);
            continue;
        };
        let name = unique_name(name, &mut taken);
        let audio = select_audio(&playlist.media, variant.audio.as_deref(), &audio_select);
        let stream = HlsStream::new(session, variant.uri.clone())
            .with_overlay(overlay.clone())
            .with_variant(variant.clone(), audio);
        streams.push((name, stream));
    }
    Ok(streams)
}

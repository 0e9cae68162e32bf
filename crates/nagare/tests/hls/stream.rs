use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use aes::cipher::{block_padding::Pkcs7, BlockEncryptMut, KeyIvInit};
use nagare::{
    hls::{HlsStream, UriContainsFilter},
    Session, Stream,
};
use tokio::io::AsyncReadExt;
use wiremock::{
    matchers::{header, method, path},
    Mock, MockServer, Request, Respond, ResponseTemplate,
};

use super::{segment_body, setup_mock_server, HlsMock};
use crate::AssertWrapper;

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;

fn media_playlist(first: usize, last: usize, end_list: bool) -> String {
    let mut playlist =
        format!("#EXTM3U\n#EXT-X-TARGETDURATION:1\n#EXT-X-MEDIA-SEQUENCE:{first}\n");
    for num in first..last {
        playlist.push_str(&format!("#EXTINF:1.0,\nsegment{num}.ts\n"));
    }
    if end_list {
        playlist.push_str("#EXT-X-ENDLIST\n");
    }
    playlist
}

/// Live playlist with a sliding window that gains one segment per request
/// and ends once `total` segments were published.
struct GrowingPlaylist {
    requests: AtomicUsize,
    initial: usize,
    window: usize,
    total: usize,
}

impl Respond for GrowingPlaylist {
    fn respond(&self, _: &Request) -> ResponseTemplate {
        let request = self.requests.fetch_add(1, Ordering::SeqCst);
        let last = (self.initial + request).min(self.total);
        let first = last.saturating_sub(self.window);
        ResponseTemplate::new(200).set_body_string(media_playlist(first, last, last == self.total))
    }
}

/// Serves a live playlist once, then fails every later request.
#[derive(Clone, Default)]
struct FailingReloads {
    requests: Arc<Mutex<Vec<Instant>>>,
}

impl FailingReloads {
    fn requests(&self) -> Vec<Instant> {
        self.requests.lock().unwrap().clone()
    }
}

impl Respond for FailingReloads {
    fn respond(&self, _: &Request) -> ResponseTemplate {
        let mut requests = self.requests.lock().unwrap();
        requests.push(Instant::now());
        if requests.len() == 1 {
            ResponseTemplate::new(200).set_body_string(media_playlist(0, 2, false))
        } else {
            ResponseTemplate::new(500)
        }
    }
}

async fn mount_playlist<R: Respond + 'static>(server: &MockServer, responder: R) -> String {
    Mock::given(method("GET"))
        .and(path("/live.m3u8"))
        .respond_with(responder)
        .mount(server)
        .await;
    format!("{}/live.m3u8", server.uri())
}

#[tokio::test]
async fn vod_segments_in_order() -> anyhow::Result<()> {
    let (uri, server) = setup_mock_server(
        "#EXTM3U
#EXT-X-TARGETDURATION:6
#EXT-X-MEDIA-SEQUENCE:0
#EXTINF:6.0,
a.ts
#EXTINF:6.0,
b.ts
#EXTINF:6.0,
c.ts
#EXT-X-ENDLIST",
    )
    .await;
    server.mock_segments(&["a.ts", "b.ts", "c.ts"]).await;

    let session = Session::new()?;
    session.set_option("hls-segment-threads", 3)?;
    let reader = HlsStream::new(&session, uri.parse()?).open().await?;

    let mut output = Vec::new();
    reader.into_async_read().read_to_end(&mut output).await?;
    assert_eq!(output, b"<a.ts><b.ts><c.ts>");
    Ok(())
}

#[tokio::test]
async fn live_stream_starts_at_live_edge() -> anyhow::Result<()> {
    let mut playlist = "#EXTM3U\n#EXT-X-TARGETDURATION:6\n#EXT-X-MEDIA-SEQUENCE:100\n".to_string();
    let names: Vec<String> = (100..110).map(|i| format!("segment{i}.ts")).collect();
    for name in &names {
        playlist.push_str(&format!("#EXTINF:6.0,\n{name}\n"));
    }
    let (uri, server) = setup_mock_server(&playlist).await;
    let names: Vec<&str> = names.iter().map(String::as_str).collect();
    server.mock_segments(&names).await;

    let session = Session::new()?;
    session.set_option("hls-live-edge", 3)?;
    let mut reader = HlsStream::new(&session, uri.parse()?).open().await?;

    let expected = segment_body("segment107.ts");
    let mut output = Vec::new();
    while output.len() < expected.len() {
        let chunk = reader.read(expected.len() - output.len()).await?;
        assert!(!chunk.is_empty(), "stream ended early");
        output.extend_from_slice(&chunk);
    }
    assert_eq!(output, expected.as_bytes());

    reader.close().await;
    assert!(reader.is_closed());
    Ok(())
}

#[tokio::test]
async fn aes128_segments_are_decrypted() -> anyhow::Result<()> {
    let key = *b"0123456789abcdef";
    let mut iv = [0u8; 16];
    iv[15] = 1;

    let (uri, server) = setup_mock_server(
        "#EXTM3U
#EXT-X-TARGETDURATION:6
#EXT-X-KEY:METHOD=AES-128,URI=\"k.key\",IV=0x00000000000000000000000000000001
#EXTINF:6.0,
first.ts
#EXTINF:6.0,
second.ts
#EXT-X-ENDLIST",
    )
    .await;
    server.mock("/k.key", key.to_vec()).await;
    for (name, plaintext) in [("/first.ts", "first plaintext"), ("/second.ts", "second plaintext")] {
        let ciphertext = Aes128CbcEnc::new((&key).into(), (&iv).into())
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());
        server.mock(name, ciphertext).await;
    }

    let session = Session::new()?;
    let reader = HlsStream::new(&session, uri.parse()?).open().await?;
    let output = reader.read_to_end().await.assert_success();
    assert_eq!(output, b"first plaintextsecond plaintext");
    Ok(())
}

#[tokio::test]
async fn byte_range_continues_previous_range() -> anyhow::Result<()> {
    let (uri, server) = setup_mock_server(
        "#EXTM3U
#EXT-X-TARGETDURATION:6
#EXT-X-VERSION:4
#EXTINF:6.0,
#EXT-X-BYTERANGE:1000@0
media.ts
#EXTINF:6.0,
#EXT-X-BYTERANGE:500
media.ts
#EXT-X-ENDLIST",
    )
    .await;
    Mock::given(method("GET"))
        .and(path("/media.ts"))
        .and(header("Range", "bytes=0-999"))
        .respond_with(ResponseTemplate::new(206).set_body_bytes(vec![b'a'; 1000]))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/media.ts"))
        .and(header("Range", "bytes=1000-1499"))
        .respond_with(ResponseTemplate::new(206).set_body_bytes(vec![b'b'; 500]))
        .expect(1)
        .mount(&server)
        .await;

    let session = Session::new()?;
    let reader = HlsStream::new(&session, uri.parse()?).open().await?;
    let output = reader.read_to_end().await?;
    assert_eq!(output.len(), 1500);
    assert!(output[..1000].iter().all(|b| *b == b'a'));
    assert!(output[1000..].iter().all(|b| *b == b'b'));

    server.verify().await;
    Ok(())
}

#[tokio::test]
async fn failed_segment_is_retried() -> anyhow::Result<()> {
    let (uri, server) = setup_mock_server(
        "#EXTM3U
#EXT-X-TARGETDURATION:6
#EXTINF:6.0,
flaky.ts
#EXT-X-ENDLIST",
    )
    .await;
    Mock::given(method("GET"))
        .and(path("/flaky.ts"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    server.mock_segments(&["flaky.ts"]).await;

    let session = Session::new()?;
    session.set_option("hls-segment-attempts", 3)?;
    let reader = HlsStream::new(&session, uri.parse()?).open().await?;
    assert_eq!(reader.read_to_end().await?, b"<flaky.ts>");
    Ok(())
}

#[tokio::test]
async fn filtered_segments_leave_no_gap() -> anyhow::Result<()> {
    let (uri, server) = setup_mock_server(
        "#EXTM3U
#EXT-X-TARGETDURATION:6
#EXTINF:6.0,
intro.ts
#EXTINF:6.0,
preloading.ts
#EXTINF:6.0,
outro.ts
#EXT-X-ENDLIST",
    )
    .await;
    server.mock_segments(&["intro.ts", "outro.ts"]).await;
    Mock::given(method("GET"))
        .and(path("/preloading.ts"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<preloading.ts>"))
        .expect(0)
        .mount(&server)
        .await;

    let session = Session::new()?;
    session.set_option("hls-segment-threads", 2)?;
    let reader = HlsStream::new(&session, uri.parse()?)
        .with_filter(UriContainsFilter::new("preloading"))
        .open()
        .await?;
    assert_eq!(reader.read_to_end().await?, b"<intro.ts><outro.ts>");

    server.verify().await;
    Ok(())
}

#[tokio::test]
async fn ignore_names_option_filters_segments() -> anyhow::Result<()> {
    let (uri, server) = setup_mock_server(
        "#EXTM3U
#EXT-X-TARGETDURATION:6
#EXTINF:6.0,
ad.ts
#EXTINF:6.0,
main.ts
#EXT-X-ENDLIST",
    )
    .await;
    server.mock_segments(&["main.ts"]).await;

    let session = Session::new()?;
    session.set_option("hls-segment-ignore-names", vec!["ad"])?;
    let reader = HlsStream::new(&session, uri.parse()?).open().await?;
    assert_eq!(reader.read_to_end().await?, b"<main.ts>");
    Ok(())
}

#[tokio::test]
async fn duration_limits_output() -> anyhow::Result<()> {
    let (uri, server) = setup_mock_server(
        "#EXTM3U
#EXT-X-TARGETDURATION:6
#EXTINF:6.0,
a.ts
#EXTINF:6.0,
b.ts
#EXTINF:6.0,
c.ts
#EXT-X-ENDLIST",
    )
    .await;
    server.mock_segments(&["a.ts", "b.ts", "c.ts"]).await;

    let session = Session::new()?;
    let reader = HlsStream::new(&session, uri.parse()?)
        .with_duration(Duration::from_secs(10))
        .open()
        .await?;
    assert_eq!(reader.read_to_end().await?, b"<a.ts><b.ts>");
    Ok(())
}

#[tokio::test]
async fn missing_playlist_fails_on_read() -> anyhow::Result<()> {
    let server = MockServer::start().await;

    let session = Session::new()?;
    session.set_option("hls-playlist-reload-attempts", 1)?;
    let reader = HlsStream::new(&session, format!("{}/gone.m3u8", server.uri()).parse()?)
        .open()
        .await?;
    reader.read_to_end().await.assert_error();
    Ok(())
}

#[tokio::test]
async fn live_reloads_append_segments_until_endlist() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    let names: Vec<String> = (0..8).map(|i| format!("segment{i}.ts")).collect();
    let names: Vec<&str> = names.iter().map(String::as_str).collect();
    server.mock_segments(&names).await;
    let uri = mount_playlist(
        &server,
        GrowingPlaylist {
            requests: AtomicUsize::new(0),
            initial: 4,
            window: 4,
            total: 8,
        },
    )
    .await;

    let session = Session::new()?;
    session.set_option("hls-live-edge", 2)?;
    session.set_option("hls-playlist-reload-time", 0.2)?;
    session.set_option("hls-segment-threads", 3)?;
    let reader = HlsStream::new(&session, uri.parse()?).open().await?;

    let output = String::from_utf8(reader.read_to_end().await?)?;
    let expected: String = (2..8).map(|i| segment_body(&format!("segment{i}.ts"))).collect();
    assert_eq!(output, expected);
    Ok(())
}

#[tokio::test]
async fn reload_failures_end_a_running_stream() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    server.mock_segments(&["segment0.ts", "segment1.ts"]).await;
    let playlist = FailingReloads::default();
    let uri = mount_playlist(&server, playlist.clone()).await;

    let session = Session::new()?;
    session.set_option("hls-playlist-reload-time", 0.2)?;
    session.set_option("hls-playlist-reload-attempts", 3)?;
    let reader = HlsStream::new(&session, uri.parse()?).open().await?;

    let mut output = Vec::new();
    loop {
        match reader.read(4096).await {
            Ok(chunk) if chunk.is_empty() => panic!("stream ended without a reload error"),
            Ok(chunk) => output.extend_from_slice(&chunk),
            Err(_) => break,
        }
    }
    assert_eq!(output, b"<segment0.ts><segment1.ts>");
    // one successful load, then three failed reloads
    assert_eq!(playlist.requests().len(), 4);
    Ok(())
}

#[tokio::test]
async fn failed_reloads_back_off() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    server.mock_segments(&["segment0.ts", "segment1.ts"]).await;
    let playlist = FailingReloads::default();
    let uri = mount_playlist(&server, playlist.clone()).await;

    let session = Session::new()?;
    session.set_option("hls-playlist-reload-time", 1.5)?;
    session.set_option("hls-playlist-reload-attempts", 4)?;
    let reader = HlsStream::new(&session, uri.parse()?).open().await?;
    reader.read_to_end().await.assert_error();

    let requests = playlist.requests();
    let gaps: Vec<Duration> = requests.windows(2).map(|w| w[1] - w[0]).collect();
    assert_eq!(gaps.len(), 4, "unexpected reloads: {gaps:?}");
    // 500ms doubling per failure, capped by the 1.5s reload interval
    let expected = [1500, 500, 1000, 1500].map(Duration::from_millis);
    for (gap, expected) in gaps.iter().zip(expected) {
        let lower = expected.saturating_sub(Duration::from_millis(50));
        let upper = expected + Duration::from_millis(500);
        assert!(
            (lower..upper).contains(gap),
            "reload gaps {gaps:?}, expected about {expected:?}"
        );
    }
    Ok(())
}

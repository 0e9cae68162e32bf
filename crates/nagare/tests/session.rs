use nagare::{NagareError, Session};
use tokio::io::AsyncReadExt;
use wiremock::{
    matchers::{method, path},
    Mock, MockServer, ResponseTemplate,
};

async fn mock(server: &MockServer, mock_path: &str, body: &str) {
    Mock::given(method("GET"))
        .and(path(mock_path))
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .mount(server)
        .await;
}

#[tokio::test]
async fn hls_plugin_resolves_variants() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    mock(
        &server,
        "/master.m3u8",
        "#EXTM3U
#EXT-X-STREAM-INF:BANDWIDTH=800000,RESOLUTION=640x360
low.m3u8
#EXT-X-STREAM-INF:BANDWIDTH=3000000,RESOLUTION=1280x720
high.m3u8",
    )
    .await;

    let session = Session::new()?;
    let url = format!("hls://{}/master.m3u8", server.uri());
    let streams = session.resolve_url(&url).await?;

    let names: Vec<_> = streams.iter().map(|(name, _)| name.as_str()).collect();
    assert_eq!(names, vec!["360p", "720p", "worst", "best"]);
    let best = &streams.iter().find(|(name, _)| name == "best").unwrap().1;
    assert_eq!(best.url(), format!("{}/high.m3u8", server.uri()));
    assert_eq!(best.shortname(), "hls");
    Ok(())
}

#[tokio::test]
async fn media_playlist_is_a_single_live_stream() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    mock(
        &server,
        "/index.m3u8",
        "#EXTM3U
#EXT-X-TARGETDURATION:6
#EXTINF:6.0,
a.ts
#EXT-X-ENDLIST",
    )
    .await;
    mock(&server, "/a.ts", "payload").await;

    let session = Session::new()?;
    let streams = session
        .resolve_url(&format!("{}/index.m3u8", server.uri()))
        .await?;
    let names: Vec<_> = streams.iter().map(|(name, _)| name.as_str()).collect();
    assert_eq!(names, vec!["live", "worst", "best"]);

    let reader = streams[0].1.open().await?;
    let mut output = String::new();
    reader.into_async_read().read_to_string(&mut output).await?;
    assert_eq!(output, "payload");
    Ok(())
}

#[tokio::test]
async fn unknown_url_has_no_plugin() -> anyhow::Result<()> {
    let session = Session::new()?;
    let result = session.resolve_url("example.com/watch/123").await;
    assert!(matches!(result, Err(NagareError::NoPlugin(url)) if url == "https://example.com/watch/123"));
    Ok(())
}

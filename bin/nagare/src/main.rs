mod plugin_args;

use std::path::PathBuf;

use anyhow::bail;
use clap::{CommandFactory, FromArgMatches, Parser};
use fake_user_agent::get_chrome_rua;
use nagare::Session;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

#[derive(Parser, Debug, Clone)]
#[clap(name = "nagare", version, about)]
pub struct NagareArgs {
    /// Debug output
    #[clap(short, long, alias = "debug")]
    verbose: bool,

    /// Write the stream to FILE
    #[clap(short, long, value_name = "FILE", conflicts_with = "stdout")]
    output: Option<PathBuf>,

    /// Write the stream to standard output
    #[clap(short = 'O', long)]
    stdout: bool,

    /// Overwrite an existing output file
    #[clap(short, long)]
    force: bool,

    /// Print the URL of the selected stream instead of playing it
    #[clap(long)]
    stream_url: bool,

    /// Proxy for HTTP and HTTPS requests
    #[clap(long, env = "HTTP_PROXY")]
    http_proxy: Option<String>,

    /// Extra HTTP header, eg. "Referer=https://example.com/"
    #[clap(long = "http-header", value_name = "KEY=VALUE")]
    http_headers: Vec<String>,

    /// Extra cookie sent with every request
    #[clap(long = "http-cookie", value_name = "KEY=VALUE")]
    http_cookies: Vec<String>,

    /// Extra query parameter appended to every request
    #[clap(long = "http-query-param", value_name = "KEY=VALUE")]
    http_query_params: Vec<String>,

    /// Timeout seconds of HTTP requests
    #[clap(long)]
    http_timeout: Option<f64>,

    /// Skip TLS certificate verification
    #[clap(long)]
    http_no_ssl_verify: bool,

    /// Disable Diffie-Hellman key exchange
    #[clap(long)]
    http_disable_dh: bool,

    /// Allow legacy TLS cipher suites
    #[clap(long)]
    http_seclevel1: bool,

    /// Resolve and connect over IPv4 only
    #[clap(short = '4', long, conflicts_with = "ipv6")]
    ipv4: bool,

    /// Resolve and connect over IPv6 only
    #[clap(short = '6', long)]
    ipv6: bool,

    /// User-Agent header. Defaults to a recent Chrome.
    #[clap(long)]
    user_agent: Option<String>,

    /// Number of segments from the end of a live playlist to start at
    #[clap(long)]
    hls_live_edge: Option<u64>,

    /// Start live streams from the beginning of the playlist
    #[clap(long)]
    hls_live_restart: bool,

    /// Size of the segment buffer in bytes
    #[clap(long)]
    hls_segment_queue_threshold: Option<u64>,

    /// Attempts per segment download
    #[clap(long)]
    hls_segment_attempts: Option<u64>,

    /// Concurrent segment downloads (1-10)
    #[clap(long)]
    hls_segment_threads: Option<u64>,

    /// Timeout seconds of segment downloads
    #[clap(long)]
    hls_segment_timeout: Option<f64>,

    /// Skip segments with these file names (without extension), comma separated
    #[clap(long, value_delimiter = ',')]
    hls_segment_ignore_names: Vec<String>,

    /// Rewrite key URIs: {url}, {scheme}, {netloc}, {path} and {query} are replaced
    #[clap(long)]
    hls_segment_key_uri: Option<String>,

    /// Attempts per playlist reload
    #[clap(long)]
    hls_playlist_reload_attempts: Option<u64>,

    /// Playlist reload interval: default, segment, live-edge or seconds
    #[clap(long)]
    hls_playlist_reload_time: Option<String>,

    /// Seconds to skip from the start of the stream
    #[clap(long)]
    hls_start_offset: Option<f64>,

    /// Stop after this many seconds of media
    #[clap(long)]
    hls_duration: Option<f64>,

    /// Audio renditions by language or name, comma separated, "*" for all
    #[clap(long, value_delimiter = ',')]
    hls_audio_select: Vec<String>,

    /// Seconds to wait for workers on close
    #[clap(long)]
    hls_close_timeout: Option<f64>,

    /// Seconds without data before a read fails, 0 to wait forever
    #[clap(long)]
    stream_timeout: Option<f64>,

    /// Stream page or playlist URL
    url: String,

    /// Stream name to play
    #[clap(default_value = "best")]
    stream: String,
}

impl NagareArgs {
    fn init_logger(&self) {
        let mut builder = pretty_env_logger::formatted_builder();
        builder.filter_level(if self.verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        });
        if let Ok(filters) = std::env::var("RUST_LOG") {
            builder.parse_filters(&filters);
        }
        builder.init();
    }

    fn configure(&self, session: &Session) -> anyhow::Result<()> {
        let user_agent = match &self.user_agent {
            Some(user_agent) => user_agent.clone(),
            None => get_chrome_rua().to_string(),
        };
        session.set_option("user-agent", user_agent)?;

        if let Some(proxy) = &self.http_proxy {
            session.set_option("http-proxy", proxy.as_str())?;
        }
        for (key, values) in [
            ("http-headers", &self.http_headers),
            ("http-cookies", &self.http_cookies),
            ("http-query-params", &self.http_query_params),
        ] {
            for value in values {
                session.set_option(key, value.as_str())?;
            }
        }

        let flags = [
            ("http-ssl-verify", !self.http_no_ssl_verify),
            ("http-disable-dh", self.http_disable_dh),
            ("http-seclevel1", self.http_seclevel1),
            ("ipv4", self.ipv4),
            ("ipv6", self.ipv6),
            ("hls-live-restart", self.hls_live_restart),
        ];
        for (key, value) in flags {
            if session.get_option(key).as_bool() != Some(value) {
                session.set_option(key, value)?;
            }
        }

        let integers = [
            ("hls-live-edge", self.hls_live_edge),
            ("hls-segment-queue-threshold", self.hls_segment_queue_threshold),
            ("hls-segment-attempts", self.hls_segment_attempts),
            ("hls-segment-threads", self.hls_segment_threads),
            ("hls-playlist-reload-attempts", self.hls_playlist_reload_attempts),
        ];
        for (key, value) in integers {
            if let Some(value) = value {
                session.set_option(key, value)?;
            }
        }

        let seconds = [
            ("http-timeout", self.http_timeout),
            ("hls-segment-timeout", self.hls_segment_timeout),
            ("hls-start-offset", self.hls_start_offset),
            ("hls-duration", self.hls_duration),
            ("hls-close-timeout", self.hls_close_timeout),
            ("stream-timeout", self.stream_timeout),
        ];
        for (key, value) in seconds {
            if let Some(value) = value {
                session.set_option(key, value)?;
            }
        }

        if let Some(reload_time) = &self.hls_playlist_reload_time {
            session.set_option("hls-playlist-reload-time", reload_time.as_str())?;
        }
        if let Some(key_uri) = &self.hls_segment_key_uri {
            session.set_option("hls-segment-key-uri", key_uri.as_str())?;
        }
        if !self.hls_segment_ignore_names.is_empty() {
            session.set_option("hls-segment-ignore-names", self.hls_segment_ignore_names.clone())?;
        }
        if !self.hls_audio_select.is_empty() {
            session.set_option("hls-audio-select", self.hls_audio_select.clone())?;
        }
        Ok(())
    }
}

async fn relay<R, W>(input: &mut R, output: &mut W) -> anyhow::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let copied = tokio::select! {
        copied = tokio::io::copy(input, output) => Some(copied?),
        _ = tokio::signal::ctrl_c() => None,
    };
    output.flush().await?;

    match copied {
        Some(bytes) => log::info!("Stream ended, {bytes} bytes written"),
        None => log::info!("Interrupted by user"),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let session = Session::new()?;
    let matches = plugin_args::augment(NagareArgs::command(), &session).get_matches();
    let args = NagareArgs::from_arg_matches(&matches)?;
    args.init_logger();
    args.configure(&session)?;
    plugin_args::apply(&matches, &session)?;

    let streams = session.resolve_url(&args.url).await?;
    let names: Vec<&str> = streams.iter().map(|(name, _)| name.as_str()).collect();
    if args.output.is_none() && !args.stdout && !args.stream_url {
        println!("Available streams: {}", names.join(", "));
        return Ok(());
    }

    let Some((name, stream)) = streams.iter().find(|(name, _)| *name == args.stream) else {
        bail!(
            "Stream {} not found, available streams: {}",
            args.stream,
            names.join(", ")
        );
    };
    if args.stream_url {
        println!("{}", stream.url());
        return Ok(());
    }

    log::info!("Opening stream: {name} ({})", stream.shortname());
    let mut input = stream.open().await?.into_async_read();
    match &args.output {
        Some(path) => {
            if path.exists() && !args.force {
                bail!("File {} already exists, use --force to overwrite", path.display());
            }
            let mut file = tokio::fs::File::create(path).await?;
            relay(&mut input, &mut file).await
        }
        None => relay(&mut input, &mut tokio::io::stdout()).await,
    }
}

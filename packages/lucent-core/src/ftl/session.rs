//! FTL text-protocol listener and per-connection state machine.
//!
//! Protocol shape: line-terminated ASCII commands over TCP. A connection
//! walks `New -> Unauth -> Config -> Live`; after the `.` command the media
//! arrives as RTP on the advertised UDP port and the connection stays open
//! only for keepalives and `DISCONNECT`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;

use crate::media::Demuxer;

use super::auth::{generate_nonce, AuthError, ChannelAuth, IngestAuth, NONCE_LEN};
use super::deframe::Deframer;
use super::rtp::{RtpDispatcher, RtpSource, SESSION_QUEUE};

/// Overall deadline for a connection to finish authenticating.
const AUTH_DEADLINE: Duration = Duration::from_secs(30);
/// Per-command read deadline before authentication.
const UNAUTH_CMD_TIMEOUT: Duration = Duration::from_secs(10);
/// Per-command read deadline after authentication.
const CMD_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum FtlError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("timed out waiting for command")]
    Timeout,

    #[error("client didn't auth before deadline")]
    AuthDeadline,

    #[error("unsupported {kind} codec {name:?}")]
    UnsupportedCodec { kind: &'static str, name: String },

    #[error("missing parameter")]
    MissingParameter,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Receives the authenticated media stream of a publisher; the call blocks
/// for the lifetime of the publish.
#[async_trait]
pub trait PublishSink: Send + Sync {
    async fn publish(
        &self,
        auth: ChannelAuth,
        kind: &'static str,
        remote: String,
        src: Box<dyn Demuxer>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// FTL ingest listener.
///
/// The dispatcher is shared with the UDP side and passed in explicitly; the
/// server owns no global state.
pub struct FtlServer {
    auth: Arc<dyn IngestAuth>,
    sink: Arc<dyn PublishSink>,
    dispatcher: Arc<RtpDispatcher>,
    /// Port advertised in the go-live response; 0 means the dispatcher's
    /// actual bound port.
    advertise_port: u16,
}

impl FtlServer {
    #[must_use]
    pub fn new(
        auth: Arc<dyn IngestAuth>,
        sink: Arc<dyn PublishSink>,
        dispatcher: Arc<RtpDispatcher>,
        advertise_port: u16,
    ) -> Arc<Self> {
        Arc::new(Self {
            auth,
            sink,
            dispatcher,
            advertise_port,
        })
    }

    /// Accepts connections until cancelled.
    pub async fn serve(self: Arc<Self>, listener: TcpListener, cancel: CancellationToken) {
        loop {
            let (stream, peer) = tokio::select! {
                _ = cancel.cancelled() => return,
                r = listener.accept() => match r {
                    Ok(v) => v,
                    Err(e) => {
                        log::error!("[ftl] accepting connection: {e}");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        continue;
                    }
                },
            };
            let server = self.clone();
            let conn_cancel = cancel.child_token();
            tokio::spawn(async move {
                if let Err(e) = server.handle(stream, peer, conn_cancel).await {
                    log::error!("[ftl] handling connection from {peer}: {e}");
                }
            });
        }
    }

    async fn handle(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        cancel: CancellationToken,
    ) -> Result<(), FtlError> {
        let (rd, wr) = stream.into_split();
        let mut conn = Conn {
            server: self,
            reader: BufReader::new(rd),
            writer: wr,
            peer,
            cancel: cancel.clone(),
            state: SessionState::New,
            nonce: None,
            auth: None,
            tracks: Tracks::default(),
        };
        let result = conn.run().await;
        // Tearing down the connection ends the RTP source and thereby the
        // publish, whether we exited cleanly or not.
        cancel.cancel();
        result
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum SessionState {
    New,
    Unauth,
    Config,
    Live,
}

/// Negotiated track parameters accumulated during Config.
#[derive(Debug, Default)]
struct Tracks {
    video: bool,
    audio: bool,
    vcodec: Option<String>,
    acodec: Option<String>,
    vpayload: Option<u8>,
    apayload: Option<u8>,
    vssrc: Option<u32>,
    assrc: Option<u32>,
}

struct Conn<'a> {
    server: &'a FtlServer,
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    peer: SocketAddr,
    cancel: CancellationToken,

    state: SessionState,
    nonce: Option<[u8; NONCE_LEN]>,
    auth: Option<ChannelAuth>,
    tracks: Tracks,
}

impl Conn<'_> {
    async fn run(&mut self) -> Result<(), FtlError> {
        let auth_by = Instant::now() + AUTH_DEADLINE;
        let mut line = String::new();
        loop {
            let per_cmd = if self.state < SessionState::Config {
                if Instant::now() > auth_by {
                    return Err(FtlError::AuthDeadline);
                }
                UNAUTH_CMD_TIMEOUT
            } else {
                CMD_TIMEOUT
            };

            line.clear();
            let read = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                r = timeout(per_cmd, self.reader.read_line(&mut line)) => r,
            };
            let n = match read {
                Err(_) => return Err(FtlError::Timeout),
                Ok(r) => r?,
            };
            if n == 0 {
                // Peer closed the connection.
                return Ok(());
            }
            let words: Vec<&str> = line.split_whitespace().collect();
            let Some(&command) = words.first() else {
                continue;
            };

            let result = match command {
                "HMAC" => self.handle_hmac().await,
                "CONNECT" => self.handle_connect(&words).await,
                "DISCONNECT" => {
                    log::info!("[ftl] {} disconnected cleanly", self.peer);
                    self.send("200 OK.\n").await?;
                    return Ok(());
                }
                "PING" => self.send("201 PONG.\n").await.map_err(FtlError::from),

                "ProtocolVersion:" => {
                    if words.get(1) != Some(&"0.9") {
                        self.bad_request().await;
                        return Err(FtlError::Protocol(format!(
                            "unsupported protocol version: {}",
                            line.trim_end()
                        )));
                    }
                    Ok(())
                }
                "VendorName:" | "VendorVersion:" | "VideoHeight:" | "VideoWidth:" => Ok(()),
                "Video:" | "Audio:" => self.handle_enable(&words),
                "VideoCodec:" | "AudioCodec:" => self.handle_codec(&words),
                "VideoPayloadType:" | "AudioPayloadType:" => self.handle_payload_type(&words),
                "VideoIngestSSRC:" | "AudioIngestSSRC:" => self.handle_ssrc(&words),

                "." => self.handle_live().await,

                _ => {
                    self.bad_request().await;
                    return Err(FtlError::Protocol(format!(
                        "unexpected command {:?}",
                        line.trim_end()
                    )));
                }
            };
            if let Err(e) = result {
                self.bad_request().await;
                return Err(e);
            }
        }
    }

    async fn send(&mut self, response: &str) -> std::io::Result<()> {
        self.writer.write_all(response.as_bytes()).await?;
        self.writer.flush().await
    }

    /// Best-effort rejection; the connection is closing anyway.
    async fn bad_request(&mut self) {
        let _ = self.send("400 Bad Request.\n").await;
    }

    async fn handle_hmac(&mut self) -> Result<(), FtlError> {
        if self.state > SessionState::Unauth {
            return Err(FtlError::Protocol("unexpected HMAC after auth complete".into()));
        }
        let nonce = *self.nonce.get_or_insert_with(generate_nonce);
        let mut response = String::with_capacity(5 + NONCE_LEN * 2);
        response.push_str("200 ");
        for b in nonce {
            response.push_str(&format!("{b:02x}"));
        }
        response.push('\n');
        self.send(&response).await?;
        self.state = SessionState::Unauth;
        Ok(())
    }

    async fn handle_connect(&mut self, words: &[&str]) -> Result<(), FtlError> {
        if words.len() < 3 {
            return Err(FtlError::Protocol("invalid CONNECT line".into()));
        }
        if self.state != SessionState::Unauth {
            return Err(FtlError::Protocol("invalid state for CONNECT".into()));
        }
        let channel_id = words[1];
        let digest_hex = words[2].strip_prefix('$').unwrap_or(words[2]);
        let digest = decode_hex(digest_hex)
            .ok_or_else(|| FtlError::Protocol("parsing CONNECT digest".into()))?;
        let nonce = self.nonce.ok_or(FtlError::MissingParameter)?;
        let auth = self
            .server
            .auth
            .check_user(channel_id, &nonce, &digest)
            .await?;
        log::info!(
            "[ftl] authenticated {} as channel {} of user {}",
            self.peer,
            auth.name,
            auth.user_id
        );
        self.auth = Some(auth);
        self.state = SessionState::Config;
        self.send("200 OK.\n").await?;
        Ok(())
    }

    fn expect_config<'w>(&self, words: &[&'w str]) -> Result<&'w str, FtlError> {
        if self.state != SessionState::Config {
            return Err(FtlError::Protocol("unexpected state".into()));
        }
        if words.len() != 2 {
            return Err(FtlError::Protocol(format!(
                "unexpected value: {}",
                words.join(" ")
            )));
        }
        Ok(words[1])
    }

    fn handle_enable(&mut self, words: &[&str]) -> Result<(), FtlError> {
        let value = self.expect_config(words)?;
        if !value.eq_ignore_ascii_case("true") {
            return Err(FtlError::Protocol(format!("unexpected value: {value}")));
        }
        if words[0].starts_with("Video") {
            self.tracks.video = true;
        } else {
            self.tracks.audio = true;
        }
        Ok(())
    }

    fn handle_codec(&mut self, words: &[&str]) -> Result<(), FtlError> {
        let value = self.expect_config(words)?.to_owned();
        if words[0].starts_with("Video") {
            self.tracks.vcodec = Some(value);
        } else {
            self.tracks.acodec = Some(value);
        }
        Ok(())
    }

    fn handle_payload_type(&mut self, words: &[&str]) -> Result<(), FtlError> {
        let value = self.expect_config(words)?;
        let pt: u8 = value
            .parse()
            .map_err(|e| FtlError::Protocol(format!("value {value:?}: {e}")))?;
        if words[0].starts_with("Video") {
            self.tracks.vpayload = Some(pt);
        } else {
            self.tracks.apayload = Some(pt);
        }
        Ok(())
    }

    fn handle_ssrc(&mut self, words: &[&str]) -> Result<(), FtlError> {
        let value = self.expect_config(words)?;
        let ssrc: u32 = value
            .parse()
            .map_err(|e| FtlError::Protocol(format!("value {value:?}: {e}")))?;
        if words[0].starts_with("Video") {
            self.tracks.vssrc = Some(ssrc);
        } else {
            self.tracks.assrc = Some(ssrc);
        }
        Ok(())
    }

    async fn handle_live(&mut self) -> Result<(), FtlError> {
        if self.state != SessionState::Config {
            return Err(FtlError::Protocol("unexpected state".into()));
        }
        self.state = SessionState::Live;
        let t = &self.tracks;
        if !t.video || !t.audio {
            return Err(FtlError::MissingParameter);
        }
        let (Some(vcodec), Some(acodec)) = (&t.vcodec, &t.acodec) else {
            return Err(FtlError::MissingParameter);
        };
        let (Some(vpayload), Some(apayload), Some(vssrc), Some(assrc)) =
            (t.vpayload, t.apayload, t.vssrc, t.assrc)
        else {
            return Err(FtlError::MissingParameter);
        };

        let vdeframer = match vcodec.as_str() {
            "H264" => Deframer::h264(vssrc, vpayload),
            other => {
                return Err(FtlError::UnsupportedCodec {
                    kind: "video",
                    name: other.to_owned(),
                })
            }
        };
        let adeframer = match acodec.as_str() {
            "OPUS" => Deframer::opus(assrc, apayload),
            other => {
                return Err(FtlError::UnsupportedCodec {
                    kind: "audio",
                    name: other.to_owned(),
                })
            }
        };

        let auth = self.auth.clone().ok_or(FtlError::MissingParameter)?;
        let remote = self.peer.ip().to_canonical();
        let (tx, rx) = mpsc::channel(SESSION_QUEUE);
        let src = RtpSource::new(self.cancel.clone(), rx, vec![vdeframer, adeframer]);
        let keys = self.server.dispatcher.register(remote, vssrc, assrc, tx.clone());

        log::info!(
            "[ftl] user {} started publishing to {} from {}",
            auth.user_id,
            auth.name,
            remote
        );
        let sink = self.server.sink.clone();
        let dispatcher = self.server.dispatcher.clone();
        let cancel = self.cancel.clone();
        let channel_name = auth.name.clone();
        tokio::spawn(async move {
            let result = sink
                .publish(auth, "ftl", remote.to_string(), Box::new(src))
                .await;
            dispatcher.deregister(&keys, &tx);
            match result {
                Ok(()) => log::info!("[ftl] publish of {channel_name} stopped"),
                Err(e) => {
                    log::error!("[ftl] publishing {channel_name} from {remote}: {e}");
                    cancel.cancel();
                }
            }
        });

        let port = if self.server.advertise_port != 0 {
            self.server.advertise_port
        } else {
            self.server.dispatcher.local_port()?
        };
        self.send(&format!("200 OK. Use UDP port {port}\n")).await?;
        Ok(())
    }
}

fn decode_hex(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_decoding() {
        assert_eq!(decode_hex("00ff10"), Some(vec![0x00, 0xff, 0x10]));
        assert_eq!(decode_hex(""), Some(vec![]));
        assert_eq!(decode_hex("0"), None);
        assert_eq!(decode_hex("zz"), None);
    }
}

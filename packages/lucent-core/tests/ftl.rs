//! End-to-end FTL ingest: handshake over TCP, media over UDP, deframed
//! packets delivered to the publish sink.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use lucent_core::ftl::auth::{compute_digest, verify_digest};
use lucent_core::ftl::{AuthError, ChannelAuth, FtlServer, IngestAuth, PublishSink, RtpDispatcher};
use lucent_core::media::{DemuxEvent, Demuxer, Packet, StreamDescriptor};

/// Baseline 64x64 SPS.
const SPS: [u8; 7] = [0x67, 0x42, 0x00, 0x1e, 0xf4, 0x21, 0x32];
const PPS: [u8; 4] = [0x68, 0xce, 0x38, 0x80];

struct KeyTableAuth {
    keys: HashMap<String, (Vec<u8>, String)>,
}

#[async_trait]
impl IngestAuth for KeyTableAuth {
    async fn check_user(
        &self,
        channel_id: &str,
        nonce: &[u8],
        digest: &[u8],
    ) -> Result<ChannelAuth, AuthError> {
        let (key, name) = self.keys.get(channel_id).ok_or(AuthError::UnknownChannel)?;
        if !verify_digest(key, nonce, digest) {
            return Err(AuthError::DigestMismatch);
        }
        Ok(ChannelAuth {
            channel_id: channel_id.to_owned(),
            name: name.clone(),
            user_id: "tester".to_owned(),
        })
    }
}

#[derive(Debug)]
enum Capture {
    Streams(Arc<[StreamDescriptor]>),
    Packet(Arc<Packet>),
}

struct CaptureSink {
    tx: mpsc::Sender<Capture>,
}

#[async_trait]
impl PublishSink for CaptureSink {
    async fn publish(
        &self,
        _auth: ChannelAuth,
        _kind: &'static str,
        _remote: String,
        mut src: Box<dyn Demuxer>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let streams = src.streams().await?;
        let _ = self.tx.send(Capture::Streams(streams)).await;
        loop {
            match src.read().await? {
                DemuxEvent::Packet(pkt) => {
                    let _ = self.tx.send(Capture::Packet(pkt)).await;
                }
                DemuxEvent::Discontinuity => {}
                DemuxEvent::End => return Ok(()),
            }
        }
    }
}

struct Harness {
    ftl_addr: SocketAddr,
    captures: mpsc::Receiver<Capture>,
    cancel: CancellationToken,
}

async fn start_harness() -> Harness {
    let udp = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let dispatcher = RtpDispatcher::new(udp);
    let cancel = CancellationToken::new();
    {
        let dispatcher = dispatcher.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { dispatcher.run(cancel).await });
    }

    let (tx, captures) = mpsc::channel(256);
    let auth = Arc::new(KeyTableAuth {
        keys: HashMap::from([(
            "gunk001".to_owned(),
            (b"topsecret".to_vec(), "mychannel".to_owned()),
        )]),
    });
    let server = FtlServer::new(auth, Arc::new(CaptureSink { tx }), dispatcher, 0);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let ftl_addr = listener.local_addr().unwrap();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move { server.serve(listener, cancel).await });
    }
    Harness {
        ftl_addr,
        captures,
        cancel,
    }
}

struct Client {
    reader: BufReader<tokio::net::tcp::OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Client {
    async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (rd, writer) = stream.into_split();
        Self {
            reader: BufReader::new(rd),
            writer,
        }
    }

    async fn send(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
        self.writer.flush().await.unwrap();
    }

    async fn recv(&mut self) -> String {
        let mut line = String::new();
        let n = timeout(Duration::from_secs(5), self.reader.read_line(&mut line))
            .await
            .expect("timed out waiting for response")
            .unwrap();
        assert!(n > 0, "connection closed while expecting a response");
        line.trim_end().to_owned()
    }

    /// Returns `true` if the server closed the connection without a reply.
    async fn recv_or_eof(&mut self) -> Option<String> {
        let mut line = String::new();
        let n = timeout(Duration::from_secs(5), self.reader.read_line(&mut line))
            .await
            .expect("timed out waiting for response")
            .unwrap();
        if n == 0 {
            None
        } else {
            Some(line.trim_end().to_owned())
        }
    }
}

fn hex_encode(data: &[u8]) -> String {
    data.iter().map(|b| format!("{b:02x}")).collect()
}

fn hex_decode(s: &str) -> Vec<u8> {
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).unwrap())
        .collect()
}

/// Runs the handshake up to and including CONNECT; returns nothing but
/// leaves the session in the Config state.
async fn authenticate(client: &mut Client) {
    client.send("HMAC").await;
    let response = client.recv().await;
    let nonce_hex = response.strip_prefix("200 ").expect("HMAC response");
    assert_eq!(nonce_hex.len(), 128);
    let nonce = hex_decode(nonce_hex);

    let digest = compute_digest(b"topsecret", &nonce);
    client
        .send(&format!("CONNECT gunk001 ${}", hex_encode(&digest)))
        .await;
    assert_eq!(client.recv().await, "200 OK.");
}

fn rtp(ssrc: u32, pt: u8, seq: u16, ts: u32, payload: &[u8]) -> Vec<u8> {
    let mut d = vec![0u8; 12];
    d[0] = 0x80;
    d[1] = pt;
    d[2..4].copy_from_slice(&seq.to_be_bytes());
    d[4..8].copy_from_slice(&ts.to_be_bytes());
    d[8..12].copy_from_slice(&ssrc.to_be_bytes());
    d.extend_from_slice(payload);
    d
}

fn stap_a(nals: &[&[u8]]) -> Vec<u8> {
    let mut p = vec![0x78];
    for nal in nals {
        p.extend_from_slice(&(nal.len() as u16).to_be_bytes());
        p.extend_from_slice(nal);
    }
    p
}

#[tokio::test]
async fn ftl_happy_path_delivers_media() {
    let mut harness = start_harness().await;
    let mut client = Client::connect(harness.ftl_addr).await;

    authenticate(&mut client).await;
    client.send("ProtocolVersion: 0.9").await;
    client.send("VendorName: test-harness").await;
    client.send("Video: true").await;
    client.send("Audio: true").await;
    client.send("VideoCodec: H264").await;
    client.send("AudioCodec: OPUS").await;
    client.send("VideoPayloadType: 96").await;
    client.send("AudioPayloadType: 97").await;
    client.send("VideoIngestSSRC: 1").await;
    client.send("AudioIngestSSRC: 2").await;
    client.send(".").await;
    let response = client.recv().await;
    let port: u16 = response
        .strip_prefix("200 OK. Use UDP port ")
        .expect("go-live response")
        .parse()
        .unwrap();

    // Keepalives still work while live.
    client.send("PING").await;
    assert_eq!(client.recv().await, "201 PONG.");

    // Send media to the advertised port.
    let media = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    media.connect(("127.0.0.1", port)).await.unwrap();
    let idr = [0x65, 0xaa, 0xbb, 0xcc];
    media
        .send(&rtp(1, 96, 1, 0, &stap_a(&[&SPS, &PPS, &idr])))
        .await
        .unwrap();
    media.send(&rtp(2, 97, 1, 0, &[0xf8, 0x01])).await.unwrap();
    media.send(&rtp(1, 96, 2, 3000, &idr)).await.unwrap();

    // The sink sees the negotiated streams first.
    let streams = loop {
        match timeout(Duration::from_secs(5), harness.captures.recv())
            .await
            .expect("no streams captured")
            .expect("capture channel closed")
        {
            Capture::Streams(s) => break s,
            Capture::Packet(_) => panic!("packet before streams"),
        }
    };
    assert_eq!(streams.len(), 2);
    match &streams[0] {
        StreamDescriptor::Video(v) => assert_eq!((v.width, v.height), (64, 64)),
        other => panic!("expected video first, got {other:?}"),
    }
    assert!(streams[1].is_audio());

    // And then deframed packets, AVCC-framed for video.
    let pkt = loop {
        match timeout(Duration::from_secs(5), harness.captures.recv())
            .await
            .expect("no packet captured")
            .expect("capture channel closed")
        {
            Capture::Packet(p) if p.stream == 0 => break p,
            _ => {}
        }
    };
    assert!(pkt.is_key);
    assert_eq!(&pkt.data[..4], &[0, 0, 0, 4]);
    assert_eq!(&pkt.data[4..], &idr);

    client.send("DISCONNECT").await;
    assert_eq!(client.recv().await, "200 OK.");
    harness.cancel.cancel();
}

#[tokio::test]
async fn bad_digest_is_rejected() {
    let harness = start_harness().await;
    let mut client = Client::connect(harness.ftl_addr).await;

    client.send("HMAC").await;
    let _ = client.recv().await;
    client
        .send(&format!("CONNECT gunk001 ${}", hex_encode(&[0u8; 64])))
        .await;
    assert_eq!(client.recv_or_eof().await.as_deref(), Some("400 Bad Request."));
    // The server closes the connection after rejecting.
    assert!(client.recv_or_eof().await.is_none());
    harness.cancel.cancel();
}

#[tokio::test]
async fn unknown_channel_is_rejected() {
    let harness = start_harness().await;
    let mut client = Client::connect(harness.ftl_addr).await;

    client.send("HMAC").await;
    let _ = client.recv().await;
    client
        .send(&format!("CONNECT nobody ${}", hex_encode(&[0u8; 64])))
        .await;
    assert_eq!(client.recv_or_eof().await.as_deref(), Some("400 Bad Request."));
    harness.cancel.cancel();
}

#[tokio::test]
async fn unknown_command_is_rejected() {
    let harness = start_harness().await;
    let mut client = Client::connect(harness.ftl_addr).await;

    client.send("FROB everything").await;
    assert_eq!(client.recv_or_eof().await.as_deref(), Some("400 Bad Request."));
    assert!(client.recv_or_eof().await.is_none());
    harness.cancel.cancel();
}

#[tokio::test]
async fn wrong_protocol_version_is_rejected() {
    let harness = start_harness().await;
    let mut client = Client::connect(harness.ftl_addr).await;

    authenticate(&mut client).await;
    client.send("ProtocolVersion: 1.0").await;
    assert_eq!(client.recv_or_eof().await.as_deref(), Some("400 Bad Request."));
    harness.cancel.cancel();
}

#[tokio::test]
async fn go_live_requires_all_parameters() {
    let harness = start_harness().await;
    let mut client = Client::connect(harness.ftl_addr).await;

    authenticate(&mut client).await;
    client.send("Video: true").await;
    client.send("VideoCodec: H264").await;
    client.send(".").await;
    assert_eq!(client.recv_or_eof().await.as_deref(), Some("400 Bad Request."));
    harness.cancel.cancel();
}

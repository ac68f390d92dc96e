//! UDP RTP reception: a single socket reader demultiplexing datagrams to
//! sessions, and the demuxer source that turns a session's datagram stream
//! into elementary-stream packets.

use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use byteorder::{BigEndian, ByteOrder};
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::media::{DemuxError, DemuxEvent, Demuxer, Packet, StreamDescriptor};

use super::deframe::{parse_rtp, Deframer, ParsedPacket};

/// Largest datagram the dispatcher will read; RTP over UDP stays within a
/// single MTU.
const MAX_DATAGRAM: usize = 1500;

/// Queue depth between the dispatcher and each session.
pub const SESSION_QUEUE: usize = 256;

/// How long a source waits for codec parameters before giving up.
const CODEC_DATA_TIMEOUT: Duration = Duration::from_secs(10);

/// Routing key for inbound datagrams.
///
/// Keepalive pings carry no SSRC and are matched on the source IP alone;
/// media packets are matched on (source IP, SSRC).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum RouteKey {
    Ip(IpAddr),
    Ssrc(IpAddr, u32),
}

/// Keys registered for one session, handed back for deregistration.
#[derive(Debug, Clone)]
pub struct SessionKeys {
    ip: IpAddr,
    video_ssrc: u32,
    audio_ssrc: u32,
}

impl SessionKeys {
    fn routes(&self) -> [RouteKey; 3] {
        [
            RouteKey::Ip(self.ip),
            RouteKey::Ssrc(self.ip, self.video_ssrc),
            RouteKey::Ssrc(self.ip, self.audio_ssrc),
        ]
    }
}

/// Single-reader UDP demultiplexer shared by all FTL sessions.
///
/// Construct one per server and pass it explicitly to the FTL listener; the
/// registry is not global state.
pub struct RtpDispatcher {
    socket: UdpSocket,
    receivers: Mutex<HashMap<RouteKey, mpsc::Sender<Bytes>>>,
    overflows: AtomicU64,
}

impl RtpDispatcher {
    #[must_use]
    pub fn new(socket: UdpSocket) -> Arc<Self> {
        Arc::new(Self {
            socket,
            receivers: Mutex::new(HashMap::new()),
            overflows: AtomicU64::new(0),
        })
    }

    /// Port the socket is bound to, advertised to publishers.
    pub fn local_port(&self) -> std::io::Result<u16> {
        Ok(self.socket.local_addr()?.port())
    }

    /// Datagrams dropped because a session queue was full.
    #[must_use]
    pub fn overflows(&self) -> u64 {
        self.overflows.load(Ordering::Relaxed)
    }

    /// Registers a session's routing keys. Later registrations for the same
    /// key replace earlier ones.
    pub fn register(&self, ip: IpAddr, video_ssrc: u32, audio_ssrc: u32, tx: mpsc::Sender<Bytes>) -> SessionKeys {
        let keys = SessionKeys {
            ip: canonical(ip),
            video_ssrc,
            audio_ssrc,
        };
        let mut receivers = self.receivers.lock();
        for k in keys.routes() {
            receivers.insert(k, tx.clone());
        }
        keys
    }

    /// Removes a session's routing keys, but only where they still point at
    /// the same channel (a replacement session keeps its own registration).
    pub fn deregister(&self, keys: &SessionKeys, tx: &mpsc::Sender<Bytes>) {
        let mut receivers = self.receivers.lock();
        for k in keys.routes() {
            if receivers.get(&k).is_some_and(|r| r.same_channel(tx)) {
                receivers.remove(&k);
            }
        }
    }

    /// Reads and classifies datagrams until cancelled. Never blocks on a
    /// slow session: a full session queue drops the datagram.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut buf = [0u8; MAX_DATAGRAM];
        loop {
            let (n, addr) = tokio::select! {
                _ = cancel.cancelled() => return,
                r = self.socket.recv_from(&mut buf) => match r {
                    Ok(v) => v,
                    Err(e) => {
                        log::error!("[ftl] receiving from UDP socket: {e}");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        continue;
                    }
                },
            };
            let d = &buf[..n];
            if d.len() < 12 {
                continue;
            }
            let ip = canonical(addr.ip());
            if d[0] == 0x81 && d[1] == 0xfa {
                // Keepalive ping: echo back to registered publishers.
                let known = self.receivers.lock().contains_key(&RouteKey::Ip(ip));
                if known {
                    if let Err(e) = self.socket.send_to(d, addr).await {
                        log::debug!("[ftl] echoing ping to {addr}: {e}");
                    }
                }
                continue;
            }
            if d[1] == 0xc8 {
                // RTCP sender report.
                continue;
            }
            let ssrc = BigEndian::read_u32(&d[8..12]);
            let rcv = self
                .receivers
                .lock()
                .get(&RouteKey::Ssrc(ip, ssrc))
                .cloned();
            let Some(rcv) = rcv else { continue };
            match rcv.try_send(Bytes::copy_from_slice(d)) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.overflows.fetch_add(1, Ordering::Relaxed);
                    log::warn!("[ftl] {addr} overflow in UDP handler");
                }
                // Session is tearing down; the keys will be removed shortly.
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
    }
}

fn canonical(ip: IpAddr) -> IpAddr {
    ip.to_canonical()
}

/// Demuxer over a session's datagram stream.
///
/// Packets are deframed per SSRC/payload-type; `streams` drives codec
/// discovery by reading until every deframer has produced codec data.
pub struct RtpSource {
    cancel: CancellationToken,
    datagrams: mpsc::Receiver<Bytes>,
    deframers: Vec<Deframer>,
    streams: Option<Arc<[StreamDescriptor]>>,
    saved: VecDeque<Packet>,
    scratch: Vec<ParsedPacket>,
}

impl RtpSource {
    #[must_use]
    pub fn new(
        cancel: CancellationToken,
        datagrams: mpsc::Receiver<Bytes>,
        deframers: Vec<Deframer>,
    ) -> Self {
        Self {
            cancel,
            datagrams,
            deframers,
            streams: None,
            saved: VecDeque::new(),
            scratch: Vec::new(),
        }
    }

    /// Reads the next elementary-stream packet, or `None` at end of stream.
    async fn next_packet(&mut self) -> Result<Option<Packet>, DemuxError> {
        if let Some(pkt) = self.saved.pop_front() {
            return Ok(Some(pkt));
        }
        loop {
            let datagram = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(None),
                d = self.datagrams.recv() => match d {
                    None => return Ok(None),
                    Some(d) => d,
                },
            };
            let rp = parse_rtp(&datagram).map_err(|e| DemuxError::Malformed(e.to_string()))?;
            for (idx, def) in self.deframers.iter_mut().enumerate() {
                if rp.ssrc != def.ssrc || rp.payload_type != def.payload_type {
                    continue;
                }
                self.scratch.clear();
                let pts = def
                    .deframe(&rp, &mut self.scratch)
                    .map_err(|e| DemuxError::Malformed(e.to_string()))?;
                let mut packets = self.scratch.drain(..).map(|p| Packet {
                    stream: idx,
                    pts,
                    cts: Duration::ZERO,
                    is_key: p.is_key,
                    data: p.data,
                });
                if let Some(first) = packets.next() {
                    self.saved.extend(packets);
                    return Ok(Some(first));
                }
                // Only fragments so far; keep reading.
                break;
            }
        }
    }

    async fn discover_streams(&mut self) -> Result<Arc<[StreamDescriptor]>, DemuxError> {
        let discovery = async {
            loop {
                // Packets read before codec data is complete are dropped;
                // they predate the parameter sets and cannot be decoded.
                if self.next_packet().await?.is_none() {
                    return Err(DemuxError::CodecDataTimeout);
                }
                let mut descriptors = Vec::with_capacity(self.deframers.len());
                for def in &self.deframers {
                    match def.codec_data() {
                        Ok(Some(d)) => descriptors.push(d),
                        Ok(None) => break,
                        Err(e) => return Err(DemuxError::Malformed(e.to_string())),
                    }
                }
                if descriptors.len() == self.deframers.len() {
                    return Ok(descriptors.into());
                }
            }
        };
        timeout(CODEC_DATA_TIMEOUT, discovery)
            .await
            .map_err(|_| DemuxError::CodecDataTimeout)?
    }
}

#[async_trait]
impl Demuxer for RtpSource {
    async fn streams(&mut self) -> Result<Arc<[StreamDescriptor]>, DemuxError> {
        if let Some(streams) = &self.streams {
            return Ok(streams.clone());
        }
        let streams = self.discover_streams().await?;
        self.streams = Some(streams.clone());
        Ok(streams)
    }

    async fn read(&mut self) -> Result<DemuxEvent, DemuxError> {
        if self.streams.is_none() {
            self.streams().await?;
        }
        Ok(match self.next_packet().await? {
            Some(pkt) => DemuxEvent::Packet(Arc::new(pkt)),
            None => DemuxEvent::End,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    async fn dispatcher_pair() -> (Arc<RtpDispatcher>, UdpSocket, SocketAddr, CancellationToken) {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.connect(server_addr).await.unwrap();
        let dispatcher = RtpDispatcher::new(server);
        let cancel = CancellationToken::new();
        let d = dispatcher.clone();
        let c = cancel.clone();
        tokio::spawn(async move { d.run(c).await });
        (dispatcher, client, server_addr, cancel)
    }

    fn rtp_datagram(ssrc: u32, seq: u16, payload: &[u8]) -> Vec<u8> {
        let mut d = vec![0x80, 97, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0];
        BigEndian::write_u16(&mut d[2..4], seq);
        BigEndian::write_u32(&mut d[8..12], ssrc);
        d.extend_from_slice(payload);
        d
    }

    #[tokio::test]
    async fn routes_by_source_ip_and_ssrc() {
        let (dispatcher, client, _, cancel) = dispatcher_pair().await;
        let (tx, mut rx) = mpsc::channel(SESSION_QUEUE);
        let ip = client.local_addr().unwrap().ip();
        dispatcher.register(ip, 5, 6, tx);

        client.send(&rtp_datagram(5, 1, &[0xaa])).await.unwrap();
        let d = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert_eq!(d[8..12], [0, 0, 0, 5]);

        // Unregistered SSRC is dropped.
        client.send(&rtp_datagram(99, 2, &[0xbb])).await.unwrap();
        client.send(&rtp_datagram(6, 3, &[0xcc])).await.unwrap();
        let d = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert_eq!(d[8..12], [0, 0, 0, 6]);
        cancel.cancel();
    }

    #[tokio::test]
    async fn echoes_keepalive_pings_for_registered_sources() {
        let (dispatcher, client, _, cancel) = dispatcher_pair().await;
        let ip = client.local_addr().unwrap().ip();

        // Not registered yet: no echo.
        let mut ping = vec![0x81, 0xfa];
        ping.extend_from_slice(&[0u8; 10]);
        client.send(&ping).await.unwrap();

        let (tx, _rx) = mpsc::channel(SESSION_QUEUE);
        dispatcher.register(ip, 5, 6, tx);
        client.send(&ping).await.unwrap();

        let mut buf = [0u8; 64];
        let n = timeout(Duration::from_secs(2), client.recv(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], &ping[..]);
        cancel.cancel();
    }

    #[tokio::test]
    async fn drops_rtcp_sender_reports() {
        let (dispatcher, client, _, cancel) = dispatcher_pair().await;
        let (tx, mut rx) = mpsc::channel(SESSION_QUEUE);
        let ip = client.local_addr().unwrap().ip();
        dispatcher.register(ip, 5, 6, tx);

        let mut rtcp = vec![0x80, 0xc8];
        rtcp.extend_from_slice(&[0u8; 10]);
        // An RTCP report whose bytes 8..12 happen to match a registered SSRC
        // must still be dropped.
        BigEndian::write_u32(&mut rtcp[8..12], 5);
        client.send(&rtcp).await.unwrap();
        client.send(&rtp_datagram(5, 1, &[0x01])).await.unwrap();
        let d = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert_eq!(d[1], 97);
        cancel.cancel();
    }

    #[tokio::test]
    async fn never_delivers_to_deregistered_sessions() {
        let (dispatcher, client, _, cancel) = dispatcher_pair().await;
        let (tx, mut rx) = mpsc::channel(SESSION_QUEUE);
        let ip = client.local_addr().unwrap().ip();
        let keys = dispatcher.register(ip, 5, 6, tx.clone());
        dispatcher.deregister(&keys, &tx);

        client.send(&rtp_datagram(5, 1, &[0xaa])).await.unwrap();
        // Give the dispatcher time to (not) deliver.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
        cancel.cancel();
    }

    #[tokio::test]
    async fn deregister_spares_a_replacement_registration() {
        let (dispatcher, client, _, cancel) = dispatcher_pair().await;
        let ip = client.local_addr().unwrap().ip();
        let (tx1, _rx1) = mpsc::channel(SESSION_QUEUE);
        let (tx2, mut rx2) = mpsc::channel(SESSION_QUEUE);
        let keys1 = dispatcher.register(ip, 5, 6, tx1.clone());
        dispatcher.register(ip, 5, 6, tx2);
        // The old session going away must not disturb the new one's routes.
        dispatcher.deregister(&keys1, &tx1);

        client.send(&rtp_datagram(5, 1, &[0xaa])).await.unwrap();
        let d = timeout(Duration::from_secs(2), rx2.recv()).await.unwrap().unwrap();
        assert_eq!(d[8..12], [0, 0, 0, 5]);
        cancel.cancel();
    }

    #[tokio::test]
    async fn full_session_queue_drops_and_counts() {
        let (dispatcher, client, _, cancel) = dispatcher_pair().await;
        let (tx, mut rx) = mpsc::channel(1);
        let ip = client.local_addr().unwrap().ip();
        dispatcher.register(ip, 5, 6, tx);

        for seq in 0..20u16 {
            client.send(&rtp_datagram(5, seq, &[0x01])).await.unwrap();
        }
        // The queue holds one datagram; the rest must have been dropped
        // without blocking the dispatcher.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx.recv().await.is_some());
        assert!(dispatcher.overflows() > 0);
        cancel.cancel();
    }
}

//! UDP transport over the VPN overlay.
//!
//! The overlay already authenticates both peers, so a magic echo is enough
//! to know the daemon is listening. The handshake resends on the same
//! socket; each attempt waits out its full timeout before the next send.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use ras_common::VPN_HANDSHAKE_MAGIC;
use tokio::net::UdpSocket;
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};

use super::{CloseSignal, StatsSnapshot, TransportError, TransportStats};

const MAX_DATAGRAM: usize = 64 * 1024;

/// A connected datagram socket.
#[async_trait]
pub trait DatagramSocket: Send + Sync {
    async fn send(&self, data: &[u8]) -> io::Result<usize>;
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;
    fn close(&self);
}

#[async_trait]
pub trait SocketFactory: Send + Sync {
    async fn connect(&self, peer: SocketAddr) -> io::Result<Arc<dyn DatagramSocket>>;
}

/// Tokio UDP socket. `close` releases our handle; a `recv` already in flight
/// keeps its clone until the caller drops it.
#[derive(Debug)]
pub struct UdpDatagramSocket {
    socket: RwLock<Option<Arc<UdpSocket>>>,
}

impl UdpDatagramSocket {
    pub fn new(socket: UdpSocket) -> Self {
        Self {
            socket: RwLock::new(Some(Arc::new(socket))),
        }
    }

    fn handle(&self) -> io::Result<Arc<UdpSocket>> {
        self.socket
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "socket closed"))
    }
}

#[async_trait]
impl DatagramSocket for UdpDatagramSocket {
    async fn send(&self, data: &[u8]) -> io::Result<usize> {
        self.handle()?.send(data).await
    }

    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.handle()?.recv(buf).await
    }

    fn close(&self) {
        self.socket.write().unwrap_or_else(|e| e.into_inner()).take();
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct UdpSocketFactory;

#[async_trait]
impl SocketFactory for UdpSocketFactory {
    async fn connect(&self, peer: SocketAddr) -> io::Result<Arc<dyn DatagramSocket>> {
        let bind: SocketAddr = if peer.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(bind).await?;
        socket.connect(peer).await?;
        Ok(Arc::new(UdpDatagramSocket::new(socket)))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct VpnHandshakeConfig {
    pub attempts: u32,
    pub attempt_timeout: Duration,
}

impl Default for VpnHandshakeConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            attempt_timeout: Duration::from_millis(1500),
        }
    }
}

/// Closes the socket on drop unless disarmed.
struct CloseGuard(Option<Arc<dyn DatagramSocket>>);

impl CloseGuard {
    fn disarm(mut self) {
        self.0 = None;
    }
}

impl Drop for CloseGuard {
    fn drop(&mut self) {
        if let Some(socket) = self.0.take() {
            socket.close();
        }
    }
}

pub struct VpnTransport {
    socket: Arc<dyn DatagramSocket>,
    peer: SocketAddr,
    attempt_count: u32,
    stats: TransportStats,
    closed: CloseSignal,
}

impl std::fmt::Debug for VpnTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VpnTransport")
            .field("peer", &self.peer)
            .field("attempt_count", &self.attempt_count)
            .finish()
    }
}

impl VpnTransport {
    /// Open a socket to `peer` and run the magic echo handshake.
    ///
    /// On failure or cancellation the socket is closed exactly once.
    pub async fn connect(
        factory: &dyn SocketFactory,
        peer: SocketAddr,
        config: VpnHandshakeConfig,
    ) -> Result<Self, TransportError> {
        info!("starting vpn handshake with {}", peer);
        let socket = factory.connect(peer).await?;
        let guard = CloseGuard(Some(socket.clone()));

        let attempt_count = handshake(socket.as_ref(), config).await?;
        guard.disarm();
        info!("vpn handshake complete on attempt {}", attempt_count);

        Ok(Self {
            socket,
            peer,
            attempt_count,
            stats: TransportStats::new(),
            closed: CloseSignal::new(),
        })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Which handshake attempt got the echo (1-based).
    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    /// The overlay authenticated both ends before any byte reached us.
    pub fn is_authenticated(&self) -> bool {
        true
    }

    pub(crate) fn mark_authenticated(&self) {}

    pub fn is_closed(&self) -> bool {
        self.closed.is_closed()
    }

    pub async fn send(&self, data: &[u8]) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        self.socket.send(data).await?;
        self.stats.record_sent(data.len());
        Ok(())
    }

    pub async fn receive(&self, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let deadline = Instant::now() + timeout;
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            if self.is_closed() {
                return Err(TransportError::Closed);
            }
            let received = tokio::select! {
                _ = self.closed.closed() => return Err(TransportError::Closed),
                received = time::timeout_at(deadline, self.socket.recv(&mut buf)) => received,
            };
            let len = received.map_err(|_| TransportError::Timeout)??;
            // Late echoes from earlier handshake attempts.
            if buf[..len] == VPN_HANDSHAKE_MAGIC {
                debug!("dropping duplicate handshake echo");
                continue;
            }
            self.stats.record_received(len);
            buf.truncate(len);
            return Ok(buf);
        }
    }

    pub fn close(&self) {
        if self.closed.close() {
            self.socket.close();
            debug!("closed vpn transport to {}", self.peer);
        }
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }
}

impl Drop for VpnTransport {
    fn drop(&mut self) {
        self.close();
    }
}

async fn handshake(
    socket: &dyn DatagramSocket,
    config: VpnHandshakeConfig,
) -> Result<u32, TransportError> {
    let mut buf = [0u8; 64];
    for attempt in 1..=config.attempts {
        socket.send(&VPN_HANDSHAKE_MAGIC).await?;
        debug!(
            "sent vpn handshake (attempt {}/{})",
            attempt, config.attempts
        );

        let deadline = Instant::now() + config.attempt_timeout;
        loop {
            match time::timeout_at(deadline, socket.recv(&mut buf)).await {
                Err(_) => break,
                Ok(Err(e)) => {
                    // ICMP errors surface immediately on connected sockets;
                    // still wait out the attempt before resending.
                    debug!("vpn handshake recv error: {}", e);
                    time::sleep_until(deadline).await;
                    break;
                }
                Ok(Ok(len)) if buf[..len] == VPN_HANDSHAKE_MAGIC => return Ok(attempt),
                Ok(Ok(len)) => debug!("ignoring {}-byte datagram during handshake", len),
            }
        }
    }

    warn!("vpn handshake failed after {} attempts", config.attempts);
    Err(TransportError::HandshakeFailed {
        attempts: config.attempts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    /// Counts sends and closes; echoes the magic on chosen attempts.
    struct ScriptedSocket {
        sends: AtomicUsize,
        closes: AtomicUsize,
        echo_on: Vec<usize>,
        inbox_tx: mpsc::UnboundedSender<Vec<u8>>,
        inbox_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    }

    impl ScriptedSocket {
        fn new(echo_on: Vec<usize>) -> Arc<Self> {
            let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
            Arc::new(Self {
                sends: AtomicUsize::new(0),
                closes: AtomicUsize::new(0),
                echo_on,
                inbox_tx,
                inbox_rx: tokio::sync::Mutex::new(inbox_rx),
            })
        }
    }

    #[async_trait]
    impl DatagramSocket for ScriptedSocket {
        async fn send(&self, data: &[u8]) -> io::Result<usize> {
            let n = self.sends.fetch_add(1, Ordering::SeqCst) + 1;
            if self.echo_on.contains(&n) {
                let _ = self.inbox_tx.send(data.to_vec());
            }
            Ok(data.len())
        }

        async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
            let data = self.inbox_rx.lock().await.recv().await;
            let data = data.ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;
            buf[..data.len()].copy_from_slice(&data);
            Ok(data.len())
        }

        fn close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct ScriptedFactory {
        socket: Arc<ScriptedSocket>,
        connects: Mutex<Vec<SocketAddr>>,
    }

    #[async_trait]
    impl SocketFactory for ScriptedFactory {
        async fn connect(&self, peer: SocketAddr) -> io::Result<Arc<dyn DatagramSocket>> {
            self.connects.lock().unwrap().push(peer);
            Ok(self.socket.clone())
        }
    }

    fn factory(echo_on: Vec<usize>) -> ScriptedFactory {
        ScriptedFactory {
            socket: ScriptedSocket::new(echo_on),
            connects: Mutex::new(Vec::new()),
        }
    }

    fn peer() -> SocketAddr {
        "100.64.0.7:7890".parse().unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_peer_exhausts_attempts_on_one_socket() {
        let factory = factory(vec![]);
        let started = Instant::now();
        let err = VpnTransport::connect(&factory, peer(), VpnHandshakeConfig::default())
            .await
            .unwrap_err();

        assert!(matches!(err, TransportError::HandshakeFailed { attempts: 3 }));
        assert_eq!(factory.socket.sends.load(Ordering::SeqCst), 3);
        assert_eq!(factory.socket.closes.load(Ordering::SeqCst), 1);
        assert_eq!(factory.connects.lock().unwrap().len(), 1);
        // Every attempt waited out its full timeout.
        assert!(started.elapsed() >= Duration::from_millis(4500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_echo_on_second_attempt() {
        let factory = factory(vec![2]);
        let transport = VpnTransport::connect(&factory, peer(), VpnHandshakeConfig::default())
            .await
            .unwrap();

        assert_eq!(transport.attempt_count(), 2);
        assert_eq!(factory.socket.sends.load(Ordering::SeqCst), 2);
        assert_eq!(factory.socket.closes.load(Ordering::SeqCst), 0);
        assert!(transport.is_authenticated());

        transport.close();
        transport.close();
        drop(transport);
        assert_eq!(factory.socket.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_handshake_closes_socket() {
        let factory = factory(vec![]);
        let attempt = VpnTransport::connect(&factory, peer(), VpnHandshakeConfig::default());
        assert!(time::timeout(Duration::from_millis(2000), attempt).await.is_err());
        assert_eq!(factory.socket.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_udp_loopback_roundtrip() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();
        let echo = tokio::spawn(async move {
            let mut buf = [0u8; 1500];
            for _ in 0..2 {
                let (len, from) = server.recv_from(&mut buf).await.unwrap();
                server.send_to(&buf[..len], from).await.unwrap();
            }
        });

        let transport = VpnTransport::connect(&UdpSocketFactory, addr, VpnHandshakeConfig::default())
            .await
            .unwrap();
        assert_eq!(transport.attempt_count(), 1);

        transport.send(b"hello daemon").await.unwrap();
        let reply = transport.receive(Duration::from_secs(2)).await.unwrap();
        assert_eq!(reply, b"hello daemon");
        assert_eq!(transport.stats().messages_received, 1);

        transport.close();
        assert!(matches!(transport.send(b"x").await, Err(TransportError::Closed)));
        echo.await.unwrap();
    }

    #[tokio::test]
    async fn test_close_releases_pending_receive() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();
        // Answers the handshake, then stays silent.
        let daemon = tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let (len, from) = server.recv_from(&mut buf).await.unwrap();
            server.send_to(&buf[..len], from).await.unwrap();
            std::future::pending::<()>().await;
        });

        let transport = Arc::new(
            VpnTransport::connect(&UdpSocketFactory, addr, VpnHandshakeConfig::default())
                .await
                .unwrap(),
        );
        let pending = {
            let transport = transport.clone();
            tokio::spawn(async move { transport.receive(Duration::from_secs(10)).await })
        };
        time::sleep(Duration::from_millis(50)).await;

        transport.close();
        let received = time::timeout(Duration::from_secs(1), pending)
            .await
            .expect("receive must return once the transport is closed")
            .unwrap();
        assert!(matches!(received, Err(TransportError::Closed)));
        daemon.abort();
    }
}

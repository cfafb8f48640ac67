//! UDP hole punching.
//!
//! Both peers run [`HolePuncher::punch`] at roughly the same time on the very
//! socket they will later stream media over. Outbound probes create the NAT
//! binding on our side; the first datagram that makes it back in proves the
//! peer's NAT has opened too.

use peercall_common::{EndpointPair, MetricsContext, PunchConfig};
use std::io::ErrorKind;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::PunchError;

/// Probe datagram payload.
///
/// A single byte is shorter than a video fragment header and is never a
/// whole number of 16-bit audio samples, so media receivers that see a late
/// probe discard it as malformed.
pub const PROBE: &[u8] = &[0x50];

/// Result of a successful punch.
#[derive(Debug, Clone, Copy)]
pub struct PunchOutcome {
    // ---
    /// Source of the first inbound datagram
    pub from: SocketAddr,

    /// Where media for this path goes: `from` when it belongs to the peer,
    /// the peer's public endpoint otherwise
    pub peer: SocketAddr,

    /// Probe bursts sent before it arrived
    pub attempts: u32,

    pub elapsed: Duration,
}

/// Hole-punching engine.
#[derive(Clone)]
pub struct HolePuncher {
    // ---
    config: PunchConfig,
    metrics: MetricsContext,
}

impl HolePuncher {
    // ---
    pub fn new(config: PunchConfig, metrics: MetricsContext) -> Self {
        // ---
        Self { config, metrics }
    }

    /// Punches towards the peer until a datagram arrives on `socket`.
    ///
    /// Every attempt sends [`PROBE`] to each of [`EndpointPair::probe_targets`],
    /// then waits one interval for any inbound datagram. The first datagram
    /// from any source ends punching. Only a source that matches one of the
    /// peer's endpoints (or its public IP, for a NAT that remapped the port)
    /// becomes the media peer; anything else leaves the media peer at the
    /// public endpoint. One more probe goes to the media peer so a peer still
    /// waiting sees traffic too.
    ///
    /// # Arguments
    ///
    /// * `socket` - Socket shared with the media layer afterwards
    /// * `peer` - Peer endpoints as signaled
    /// * `cancel` - Aborts punching early
    ///
    /// # Errors
    ///
    /// - [`PunchError::NoResponse`] once the attempt budget is exhausted
    /// - [`PunchError::Cancelled`] if `cancel` fires first
    /// - [`PunchError::Io`] on a socket failure other than ICMP unreachables
    pub async fn punch(
        &self,
        socket: &UdpSocket,
        peer: &EndpointPair,
        cancel: &CancellationToken,
    ) -> Result<PunchOutcome, PunchError> {
        // ---
        let targets = peer.probe_targets();

        info!(
            "Punching from {} towards {:?} ({} x {:?})",
            socket.local_addr()?,
            targets,
            self.config.attempts,
            self.config.interval()
        );

        let started = Instant::now();
        let mut buf = vec![0u8; 2048];

        for attempt in 1..=self.config.attempts {
            self.send_burst(socket, &targets).await;

            let wait = tokio::time::sleep(self.config.interval());
            tokio::pin!(wait);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("Punching cancelled after {} attempts", attempt);
                        return Err(PunchError::Cancelled);
                    }
                    _ = &mut wait => break,
                    received = socket.recv_from(&mut buf) => {
                        match received {
                            Ok((len, from)) => {
                                let elapsed = started.elapsed();
                                debug!("Punch got {} bytes from {}", len, from);
                                let media_peer = media_peer(peer, &targets, from);
                                if let Err(e) = socket.send_to(PROBE, media_peer).await {
                                    debug!("Final probe to {} failed: {}", media_peer, e);
                                } else {
                                    self.metrics.punch_probes_sent_total.inc();
                                }
                                self.metrics
                                    .punch_duration_seconds
                                    .observe(elapsed.as_secs_f64());
                                info!(
                                    "Path open: first datagram from {} after {} attempts ({:.0}ms)",
                                    from,
                                    attempt,
                                    elapsed.as_secs_f64() * 1000.0
                                );
                                return Ok(PunchOutcome {
                                    from,
                                    peer: media_peer,
                                    attempts: attempt,
                                    elapsed,
                                });
                            }
                            // ICMP unreachable from an earlier probe; keep waiting
                            Err(e) if is_transient(&e) => {
                                debug!("Ignoring transient receive error: {}", e);
                            }
                            Err(e) => return Err(PunchError::Io(e)),
                        }
                    }
                }
            }
        }

        warn!(
            "No datagram from peer after {} attempts ({:?})",
            self.config.attempts,
            started.elapsed()
        );
        Err(PunchError::NoResponse {
            attempts: self.config.attempts,
        })
    }

    async fn send_burst(&self, socket: &UdpSocket, targets: &[SocketAddr]) {
        // ---
        for target in targets {
            match socket.send_to(PROBE, target).await {
                Ok(_) => self.metrics.punch_probes_sent_total.inc(),
                // Unroutable local candidates are expected across networks
                Err(e) => debug!("Probe to {} failed: {}", target, e),
            }
        }
    }
}

/// Media destination for a path that was opened by a datagram from `from`.
fn media_peer(peer: &EndpointPair, targets: &[SocketAddr], from: SocketAddr) -> SocketAddr {
    // ---
    if targets.contains(&from) || from.ip() == IpAddr::V4(*peer.public.ip()) {
        return from;
    }
    warn!(
        "First datagram came from {}, not the peer; media goes to {}",
        from, peer.public
    );
    SocketAddr::V4(peer.public)
}

fn is_transient(e: &std::io::Error) -> bool {
    // ---
    matches!(
        e.kind(),
        ErrorKind::ConnectionRefused | ErrorKind::ConnectionReset
    )
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use std::net::{Ipv4Addr, SocketAddrV4};

    fn v4(socket: &UdpSocket) -> SocketAddrV4 {
        match socket.local_addr().unwrap() {
            SocketAddr::V4(a) => a,
            SocketAddr::V6(_) => unreachable!("bound to IPv4"),
        }
    }

    fn same_host(socket: &UdpSocket) -> EndpointPair {
        EndpointPair::new(v4(socket), v4(socket))
    }

    fn puncher(attempts: u32, interval_ms: u64) -> HolePuncher {
        let config = PunchConfig {
            interval_ms,
            attempts,
        };
        HolePuncher::new(config, MetricsContext::new("test").unwrap())
    }

    #[test]
    fn test_probe_is_not_media_shaped() {
        // ---
        assert!(PROBE.len() < 12);
        assert_ne!(PROBE.len() % 2, 0);
    }

    #[tokio::test]
    async fn test_already_waiting_datagram_succeeds_first_attempt() {
        // ---
        let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        b.send_to(b"early", a.local_addr().unwrap()).await.unwrap();

        let outcome = puncher(3, 200)
            .punch(&a, &same_host(&b), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.from, b.local_addr().unwrap());
        assert_eq!(outcome.peer, b.local_addr().unwrap());
        assert_eq!(outcome.attempts, 1);
    }

    #[tokio::test]
    async fn test_stranger_does_not_become_media_peer() {
        // ---
        let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let stranger = UdpSocket::bind("127.0.0.2:0").await.unwrap();

        stranger
            .send_to(b"hello", a.local_addr().unwrap())
            .await
            .unwrap();

        let outcome = puncher(3, 200)
            .punch(&a, &same_host(&b), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.from, stranger.local_addr().unwrap());
        assert_eq!(outcome.peer, b.local_addr().unwrap());

        // Follow-up probe went to the peer, not back to the stranger
        let mut buf = [0u8; 16];
        let (len, from) = b.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], PROBE);
        assert_eq!(from, a.local_addr().unwrap());
        let mut stray = [0u8; 16];
        assert!(
            tokio::time::timeout(Duration::from_millis(100), stranger.recv_from(&mut stray))
                .await
                .is_err()
        );
    }

    #[test]
    fn test_media_peer_accepts_remapped_port_on_public_ip() {
        // ---
        let peer: EndpointPair = "10.0.0.2:4000:198.51.100.4:4100".parse().unwrap();
        let targets = peer.probe_targets();

        let lan: SocketAddr = "10.0.0.2:4000".parse().unwrap();
        let remapped: SocketAddr = "198.51.100.4:5123".parse().unwrap();
        let stranger: SocketAddr = "203.0.113.50:4100".parse().unwrap();

        assert_eq!(media_peer(&peer, &targets, lan), lan);
        assert_eq!(media_peer(&peer, &targets, remapped), remapped);
        assert_eq!(
            media_peer(&peer, &targets, stranger),
            "198.51.100.4:4100".parse::<SocketAddr>().unwrap()
        );
    }

    #[tokio::test]
    async fn test_silent_peer_exhausts_budget() {
        // ---
        let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        // Bound but never reads or answers
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        // Distinct local candidate that nothing listens on
        let other = SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 2), v4(&silent).port());
        let peer = EndpointPair::new(other, v4(&silent));

        let result = puncher(3, 20)
            .punch(&a, &peer, &CancellationToken::new())
            .await;

        assert!(matches!(result, Err(PunchError::NoResponse { attempts: 3 })));
    }

    #[tokio::test]
    async fn test_cancel_stops_punching() {
        // ---
        let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = puncher(100, 1000)
            .punch(&a, &same_host(&silent), &cancel)
            .await;

        assert!(matches!(result, Err(PunchError::Cancelled)));
    }
}

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use tokio::net::{lookup_host, UdpSocket};
use tokio::time::{timeout_at, Instant};

use crate::error::ControllerError;

const RETRY_INTERVAL: Duration = Duration::from_secs(1);
const ATTEMPTS: u32 = 3;
const RECV_BUFFER: usize = 1024;

/// Request/response exchange with one BMC over a connected UDP socket.
pub struct UdpTransport {
    socket: UdpSocket,
    retry_interval: Duration,
    attempts: u32,
}

impl UdpTransport {
    pub async fn connect(host: &str, port: u16) -> Result<Self, ControllerError> {
        let target = lookup_host((host, port))
            .await
            .map_err(|_| ControllerError::Resolve(format!("{host}:{port}")))?
            .next()
            .ok_or_else(|| ControllerError::Resolve(format!("{host}:{port}")))?;

        let local: IpAddr = match target {
            SocketAddr::V4(_) => Ipv4Addr::UNSPECIFIED.into(),
            SocketAddr::V6(_) => Ipv6Addr::UNSPECIFIED.into(),
        };
        let socket = UdpSocket::bind((local, 0)).await?;
        socket.connect(target).await?;
        log::trace!("[ipmi] talking to {target} from {}", socket.local_addr()?);

        Ok(Self { socket, retry_interval: RETRY_INTERVAL, attempts: ATTEMPTS })
    }

    #[cfg(test)]
    pub fn with_retry(mut self, retry_interval: Duration, attempts: u32) -> Self {
        self.retry_interval = retry_interval;
        self.attempts = attempts;
        self
    }

    /// Sends `packet` and waits for a datagram that `accept` recognizes,
    /// resending on silence.
    ///
    /// `accept` returns `Ok(None)` for datagrams that belong to some other
    /// exchange (late duplicates, stale retransmit answers); those are dropped
    /// and reading continues until the attempt runs out.
    pub async fn send_recv<T, F>(&self, packet: &[u8], mut accept: F) -> Result<T, ControllerError>
    where
        F: FnMut(&[u8]) -> Result<Option<T>, ControllerError>,
    {
        let mut buf = [0u8; RECV_BUFFER];
        for attempt in 1..=self.attempts {
            self.socket.send(packet).await?;
            let deadline = Instant::now() + self.retry_interval;
            loop {
                let len = match timeout_at(deadline, self.socket.recv(&mut buf)).await {
                    Ok(Ok(len)) => len,
                    Ok(Err(e)) => return Err(e.into()),
                    Err(_) => break,
                };
                match accept(&buf[..len])? {
                    Some(reply) => return Ok(reply),
                    None => log::trace!("[ipmi] dropping unrelated {len} byte datagram"),
                }
            }
            log::debug!("[ipmi] no response (attempt {attempt}/{})", self.attempts);
        }
        Err(ControllerError::NoResponse)
    }
}

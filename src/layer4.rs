use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use pnet::util::MacAddr;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use crate::common;
use crate::config::Layer4Config;
use crate::power::PowerOrchestrator;

const RECV_BUFFER: usize = 1024;

/// WakeOnLan over UDP. Datagrams are handled one at a time.
pub struct Layer4Listener {
    socket: UdpSocket,
}

impl Layer4Listener {
    pub async fn bind(cfg: &Layer4Config) -> Result<Self> {
        let socket = UdpSocket::bind((cfg.listen_addr, cfg.listen_port))
            .await
            .with_context(|| format!("failed to listen on UDP {}:{}", cfg.listen_addr, cfg.listen_port))?;
        Ok(Self { socket })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub async fn run(
        self,
        target: MacAddr,
        orchestrator: Arc<PowerOrchestrator>,
        token: CancellationToken,
    ) -> Result<()> {
        log::info!("[udp] listening on {} for WakeOnLan packets to {target}", self.local_addr()?);

        let mut buf = [0u8; RECV_BUFFER];
        loop {
            let (len, peer) = tokio::select! {
                _ = token.cancelled() => { log::trace!("[udp] exit"); break; }
                res = self.socket.recv_from(&mut buf) => match res {
                    Ok(received) => received,
                    Err(e) => {
                        log::warn!("[udp] receive failed: {e}");
                        continue;
                    }
                },
            };

            if !common::check_wol_payload(&buf[..len], &target) {
                log::trace!("[udp] ignoring {len} byte datagram from {peer}");
                continue;
            }

            log::info!("[udp] received WakeOnLan packet from {peer}");
            let outcome = orchestrator.trigger_power_on().await;
            if outcome.is_success() {
                log::info!("[udp] {outcome}");
            } else {
                log::warn!("[udp] {outcome}");
            }
        }

        Ok(())
    }
}

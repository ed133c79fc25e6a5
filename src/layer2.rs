use std::io::ErrorKind;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{anyhow, Result};
use pnet::datalink::{self, Channel, Config, NetworkInterface};
use pnet::packet::{ethernet::EthernetPacket, Packet};
use pnet::util::MacAddr;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::common;
use crate::config::Layer2Config;
use crate::power::PowerOrchestrator;

pub const ETHERTYPE_WOL: u16 = 0x0842;

struct WolFrame {
    iface: String,
    source: MacAddr,
}

/// Raw Ethernet listeners plus the task that turns their frames into power-on requests.
pub struct Layer2Workers {
    listeners: Vec<JoinHandle<()>>,
    dispatcher: tokio::task::JoinHandle<()>,
}

impl Layer2Workers {
    pub async fn join(self) {
        let listeners = self.listeners;
        let joined = tokio::task::spawn_blocking(move || {
            for h in listeners {
                if h.join().is_err() {
                    log::error!("[l2] listener thread panicked");
                }
            }
        }).await;
        if joined.is_err() || self.dispatcher.await.is_err() {
            log::error!("[l2] worker ended abnormally");
        }
    }
}

fn l2_wol_check(pkt: &EthernetPacket, target: &MacAddr) -> bool {
    let dst = pkt.get_destination();
    pkt.get_ethertype().0 == ETHERTYPE_WOL &&
        (dst.is_broadcast() || dst == *target) &&
        common::check_wol_payload(pkt.payload(), target)
}

pub fn l2_worker(
    cfg: &Layer2Config,
    target: MacAddr,
    orchestrator: Arc<PowerOrchestrator>,
    token: CancellationToken,
) -> Result<Layer2Workers> {
    let interfaces: Vec<NetworkInterface> = datalink::interfaces()
        .into_iter()
        .filter(|iface| cfg.interfaces.contains(&iface.name))
        .collect();
    for name in &cfg.interfaces {
        if !interfaces.iter().any(|iface| &iface.name == name) {
            log::warn!("[l2] interface '{name}' not found");
        }
    }

    let (frame_tx, mut frame_rx) = mpsc::channel::<WolFrame>(8);

    let mut dl_cfg = Config::default();
    dl_cfg.read_timeout = Some(Duration::from_millis(50));

    let mut listeners: Vec<JoinHandle<()>> = Vec::new();
    for iface in interfaces {
        if iface.is_loopback() || !iface.is_up() {
            log::warn!("[l2][{}] skipping loopback or down interface", iface.name);
            continue;
        }

        let mut rx = match datalink::channel(&iface, dl_cfg) {
            Ok(Channel::Ethernet(_, rx)) => rx,
            Ok(_) => {
                log::warn!("[l2][{}] unsupported channel type", iface.name);
                continue;
            }
            Err(e) => {
                log::warn!("[l2][{}] cannot open raw socket: {e}", iface.name);
                continue;
            }
        };
        log::info!("[l2][{}] listening for WakeOnLan frames to {target}", iface.name);

        let frame_tx = frame_tx.clone();
        let token = token.clone();

        // Blocking reads stay off the runtime; only matching frames cross into it.
        let h = std::thread::spawn(move || {
            loop {
                if token.is_cancelled() { log::trace!("[l2][{}] exit", iface.name); break; }

                let packet = match rx.next() {
                    Ok(pkt) => pkt,
                    Err(e) if e.kind() == ErrorKind::TimedOut || e.kind() == ErrorKind::WouldBlock => continue,
                    Err(e) => {
                        log::error!("[l2][{}] read failed: {e}", iface.name);
                        break;
                    }
                };

                let Some(eth_pkt) = EthernetPacket::new(packet) else { continue };
                log::trace!("[l2][{}] ethernet packet from {} to {} of type {}",
                    iface.name, eth_pkt.get_source(), eth_pkt.get_destination(),
                    eth_pkt.get_ethertype());

                if !l2_wol_check(&eth_pkt, &target) { continue; }

                log::debug!("[l2][{}] received WakeOnLan Ethernet frame", iface.name);
                let frame = WolFrame { iface: iface.name.clone(), source: eth_pkt.get_source() };
                if frame_tx.blocking_send(frame).is_err() {
                    break;
                }
            }
        });
        listeners.push(h);
    }

    if listeners.is_empty() {
        log::error!("[l2] no suitable interface available");
        return Err(anyhow!("none of the interfaces {:?} could be opened", cfg.interfaces));
    }
    drop(frame_tx);

    let dispatcher = tokio::spawn(async move {
        loop {
            let frame = tokio::select! {
                _ = token.cancelled() => break,
                frame = frame_rx.recv() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
            };

            log::info!("[l2][{}] WakeOnLan frame from {}", frame.iface, frame.source);
            let outcome = orchestrator.trigger_power_on().await;
            if outcome.is_success() {
                log::info!("[l2] {outcome}");
            } else {
                log::warn!("[l2] {outcome}");
            }
        }
        log::trace!("[l2] dispatcher exit");
    });

    Ok(Layer2Workers { listeners, dispatcher })
}

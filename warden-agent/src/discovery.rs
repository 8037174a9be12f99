// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Node announcement and discovery.
//!
//! While a node is operational it periodically announces itself on an IPv6
//! link-local multicast group and collects the announcements of its peers.
//! The announcements are a starting point for address exchange only; nothing
//! in them is authenticated.

use serde::{Deserialize, Serialize};
use slog::Logger;
use std::collections::HashMap;
use std::io;
use std::net::{Ipv6Addr, SocketAddr, SocketAddrV6};
use std::sync::{Arc, Mutex};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

const ANNOUNCE_INTERVAL: tokio::time::Duration =
    tokio::time::Duration::from_secs(5);

/// What a node says about itself.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Announcement {
    pub node_id: Uuid,
    /// Port of the node's agent API at the sender's address.
    pub api_port: u16,
}

/// Manages node discovery: our announcement to peers, and our view of
/// theirs.
pub struct PeerBroadcaster {
    peers: Arc<Mutex<HashMap<Uuid, SocketAddr>>>,
    stop_tx: watch::Sender<bool>,
    worker: JoinHandle<()>,
}

impl PeerBroadcaster {
    pub async fn start(
        log: &Logger,
        node_id: Uuid,
        api_port: u16,
        discovery_port: u16,
    ) -> Result<PeerBroadcaster, io::Error> {
        // Link-local "all nodes" scope; the group is only meaningful on the
        // cluster interconnect.
        let group = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 0x1);
        let address = SocketAddrV6::new(group, discovery_port, 0, 0);

        let sender = UdpSocket::bind(("::", 0)).await?;
        let listener = UdpSocket::bind(("::", discovery_port)).await?;
        listener.join_multicast_v6(&group, 0)?;

        let peers = Arc::new(Mutex::new(HashMap::new()));
        let (stop_tx, stop_rx) = watch::channel(false);
        let worker = tokio::spawn(broadcast_worker(
            log.new(o!("component" => "PeerBroadcaster")),
            Announcement { node_id, api_port },
            address,
            sender,
            listener,
            Arc::clone(&peers),
            stop_rx,
        ));
        Ok(PeerBroadcaster { peers, stop_tx, worker })
    }

    /// Returns the currently known peers.
    ///
    /// Note: peers are unverified; they have merely announced themselves.
    pub fn peers(&self) -> Vec<(Uuid, SocketAddr)> {
        self.peers
            .lock()
            .unwrap()
            .iter()
            .map(|(id, addr)| (*id, *addr))
            .collect()
    }

    /// Stop announcing and listening. Waits for the worker to exit.
    pub async fn stop(self) {
        let _ = self.stop_tx.send(true);
        let _ = self.worker.await;
    }
}

async fn broadcast_worker(
    log: Logger,
    announcement: Announcement,
    address: SocketAddrV6,
    sender: UdpSocket,
    listener: UdpSocket,
    peers: Arc<Mutex<HashMap<Uuid, SocketAddr>>>,
    mut stop_rx: watch::Receiver<bool>,
) {
    let message = match serde_json::to_vec(&announcement) {
        Ok(message) => message,
        Err(err) => {
            error!(log, "failed to serialize announcement: {}", err);
            return;
        }
    };
    let mut buf = vec![0u8; 512];
    loop {
        tokio::select! {
            _ = stop_rx.wait_for(|stopped| *stopped) => {
                debug!(log, "peer broadcaster stopped");
                return;
            }
            _ = tokio::time::sleep(ANNOUNCE_INTERVAL) => {
                trace!(log, "announcing ourselves"; "address" => %address);
                if let Err(e) = sender.try_send_to(&message, address.into()) {
                    warn!(log, "failed to announce: {}", e);
                }
            }
            result = listener.recv_from(&mut buf) => {
                match result {
                    Ok((len, addr)) => {
                        handle_announcement(&log, &peers, &buf[..len], addr);
                    }
                    Err(e) => warn!(log, "failed to receive: {}", e),
                }
            }
        }
    }
}

fn handle_announcement(
    log: &Logger,
    peers: &Mutex<HashMap<Uuid, SocketAddr>>,
    payload: &[u8],
    from: SocketAddr,
) {
    let announcement: Announcement = match serde_json::from_slice(payload) {
        Ok(announcement) => announcement,
        Err(err) => {
            // Not one of ours; multicast groups attract strays.
            debug!(log, "ignoring malformed announcement from {}: {}",
                from, err);
            return;
        }
    };
    let mut api_addr = from;
    api_addr.set_port(announcement.api_port);
    let mut peers = peers.lock().unwrap();
    if peers.insert(announcement.node_id, api_addr).is_none() {
        info!(log, "discovered peer";
            "node_id" => %announcement.node_id,
            "address" => %api_addr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn announcements_update_the_peer_set_once() {
        let log = {
            use slog::Drain;
            Logger::root(slog::Discard.fuse(), o!())
        };
        let peers = Mutex::new(HashMap::new());
        let node_id = Uuid::new_v4();
        let payload = serde_json::to_vec(&Announcement {
            node_id,
            api_port: 8441,
        })
        .unwrap();
        let from: SocketAddr = "[fe80::1]:9999".parse().unwrap();

        handle_announcement(&log, &peers, &payload, from);
        handle_announcement(&log, &peers, &payload, from);

        let peers = peers.lock().unwrap();
        assert_eq!(peers.len(), 1);
        let addr = peers.get(&node_id).unwrap();
        assert_eq!(addr.port(), 8441, "peer address must use the API port");
    }

    #[test]
    fn malformed_announcements_are_ignored() {
        let log = {
            use slog::Drain;
            Logger::root(slog::Discard.fuse(), o!())
        };
        let peers = Mutex::new(HashMap::new());
        let from: SocketAddr = "[fe80::1]:9999".parse().unwrap();
        handle_announcement(&log, &peers, b"warranty", from);
        assert!(peers.lock().unwrap().is_empty());
    }
}

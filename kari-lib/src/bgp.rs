//! BGP peer session: TCP transport to port 179, OPEN with capabilities,
//! grouped UPDATE emission, periodic KEEPALIVE, Cease on teardown.
//!
//! Hold-timer arbitration and graceful restart are out of scope; the session
//! emits protocol messages and drains the peer without running a full FSM.

use bytes::BytesMut;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::codec::bgp as wire;
use crate::error::{EngineError, Result};

pub const BGP_PORT: u16 = 179;
/// Placeholder 2-byte ASN when the real one needs the 4-byte capability.
pub const AS_TRANS: u16 = 23456;

fn default_peer_port() -> u16 {
    BGP_PORT
}

fn default_hold_time() -> u16 {
    180
}

fn default_connect_timeout_secs() -> u64 {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BgpConfig {
    pub local_ip: Ipv4Addr,
    pub local_asn: u32,
    pub peer_ip: Ipv4Addr,
    pub peer_asn: u32,
    #[serde(default = "default_peer_port")]
    pub peer_port: u16,
    #[serde(default)]
    pub router_id: Option<Ipv4Addr>,
    #[serde(default = "default_hold_time")]
    pub hold_time: u16,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Route {
    pub prefix: Ipv4Addr,
    pub prefix_len: u8,
    #[serde(default)]
    pub next_hop: Option<Ipv4Addr>,
    #[serde(default)]
    pub local_pref: Option<u32>,
}

#[derive(Debug, Default)]
pub struct BgpCounters {
    updates_sent: AtomicU64,
    routes_advertised: AtomicU64,
    routes_withdrawn: AtomicU64,
    keepalives_sent: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct BgpCountersSnapshot {
    pub updates_sent: u64,
    pub routes_advertised: u64,
    pub routes_withdrawn: u64,
    pub keepalives_sent: u64,
}

impl BgpCounters {
    fn snapshot(&self) -> BgpCountersSnapshot {
        BgpCountersSnapshot {
            updates_sent: self.updates_sent.load(Ordering::Relaxed),
            routes_advertised: self.routes_advertised.load(Ordering::Relaxed),
            routes_withdrawn: self.routes_withdrawn.load(Ordering::Relaxed),
            keepalives_sent: self.keepalives_sent.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug)]
pub struct BgpSession {
    cfg: BgpConfig,
    writer: Mutex<OwnedWriteHalf>,
    reader: std::sync::Mutex<Option<JoinHandle<()>>>,
    keepalive: std::sync::Mutex<Option<JoinHandle<()>>>,
    counters: BgpCounters,
}

impl BgpSession {
    /// Connects to the peer within the configured deadline.
    pub async fn connect(cfg: BgpConfig) -> Result<Arc<Self>> {
        let deadline = Duration::from_secs(cfg.connect_timeout_secs);
        let stream = timeout(deadline, TcpStream::connect((cfg.peer_ip, cfg.peer_port)))
            .await
            .map_err(|_| {
                EngineError::Timeout(format!("bgp connect to {}:{}", cfg.peer_ip, cfg.peer_port))
            })?
            .map_err(|e| EngineError::Transport(format!("bgp connect: {e}")))?;
        info!(peer = %cfg.peer_ip, port = cfg.peer_port, "bgp transport connected");

        let (read_half, write_half) = stream.into_split();
        let session = Arc::new(Self {
            cfg,
            writer: Mutex::new(write_half),
            reader: std::sync::Mutex::new(None),
            keepalive: std::sync::Mutex::new(None),
            counters: BgpCounters::default(),
        });
        let reader = tokio::spawn(drain_peer(read_half));
        *session.reader.lock().unwrap() = Some(reader);
        Ok(session)
    }

    fn four_byte_asn(&self) -> bool {
        self.cfg.local_asn > u32::from(u16::MAX)
    }

    /// Sends OPEN announcing version 4, the local ASN, hold time, router id,
    /// and capabilities; then starts the keepalive timer at hold/3.
    pub async fn open(self: &Arc<Self>) -> Result<()> {
        let mut capabilities = vec![
            wire::Capability::MultiprotocolIpv4Unicast,
            wire::Capability::RouteRefresh,
        ];
        if self.four_byte_asn() {
            capabilities.push(wire::Capability::FourByteAsn(self.cfg.local_asn));
        }
        let open = wire::OpenMessage {
            version: 4,
            asn: if self.four_byte_asn() {
                AS_TRANS
            } else {
                self.cfg.local_asn as u16
            },
            hold_time: self.cfg.hold_time,
            router_id: self.cfg.router_id.unwrap_or(self.cfg.local_ip),
            capabilities,
        };
        self.send_message(wire::MessageType::Open, &open.encode())
            .await?;
        info!(asn = self.cfg.local_asn, hold = self.cfg.hold_time, "bgp open sent");
        self.start_keepalive();
        Ok(())
    }

    fn start_keepalive(self: &Arc<Self>) {
        let session = Arc::clone(self);
        let interval = Duration::from_secs((u64::from(self.cfg.hold_time) / 3).max(1));
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // first tick fires immediately
            loop {
                ticker.tick().await;
                if let Err(err) = session
                    .send_message(wire::MessageType::Keepalive, &[])
                    .await
                {
                    warn!(%err, "bgp keepalive failed, stopping timer");
                    break;
                }
                session.counters.keepalives_sent.fetch_add(1, Ordering::Relaxed);
            }
        });
        *self.keepalive.lock().unwrap() = Some(task);
    }

    /// Groups `routes` by next hop and emits one UPDATE per group. Returns
    /// the number of UPDATEs sent.
    pub async fn advertise(&self, routes: &[Route]) -> Result<usize> {
        let mut by_next_hop: BTreeMap<Ipv4Addr, Vec<&Route>> = BTreeMap::new();
        for route in routes {
            by_next_hop
                .entry(route.next_hop.unwrap_or(self.cfg.local_ip))
                .or_default()
                .push(route);
        }

        let mut updates = 0;
        for (next_hop, group) in by_next_hop {
            let mut attributes = vec![
                wire::PathAttribute::origin(wire::ORIGIN_IGP),
                wire::PathAttribute::as_path(&[self.cfg.local_asn], self.four_byte_asn()),
                wire::PathAttribute::next_hop(next_hop),
            ];
            if let Some(pref) = group.iter().find_map(|r| r.local_pref) {
                attributes.push(wire::PathAttribute::local_pref(pref));
            }
            let update = wire::UpdateMessage {
                withdrawn: Vec::new(),
                attributes,
                nlri: group
                    .iter()
                    .map(|r| wire::Prefix::new(r.prefix, r.prefix_len))
                    .collect(),
            };
            self.send_message(wire::MessageType::Update, &update.encode())
                .await?;
            self.counters.updates_sent.fetch_add(1, Ordering::Relaxed);
            self.counters
                .routes_advertised
                .fetch_add(group.len() as u64, Ordering::Relaxed);
            updates += 1;
        }
        info!(routes = routes.len(), updates, "bgp routes advertised");
        Ok(updates)
    }

    /// Emits one UPDATE with a populated Withdrawn Routes field.
    pub async fn withdraw(&self, routes: &[Route]) -> Result<()> {
        let update = wire::UpdateMessage {
            withdrawn: routes
                .iter()
                .map(|r| wire::Prefix::new(r.prefix, r.prefix_len))
                .collect(),
            attributes: Vec::new(),
            nlri: Vec::new(),
        };
        self.send_message(wire::MessageType::Update, &update.encode())
            .await?;
        self.counters.updates_sent.fetch_add(1, Ordering::Relaxed);
        self.counters
            .routes_withdrawn
            .fetch_add(routes.len() as u64, Ordering::Relaxed);
        info!(routes = routes.len(), "bgp routes withdrawn");
        Ok(())
    }

    /// Sends NOTIFICATION Cease and tears the session down.
    pub async fn close(&self) -> Result<()> {
        let _ = self
            .send_message(wire::MessageType::Notification, &wire::CEASE.encode())
            .await;
        if let Some(task) = self.keepalive.lock().unwrap().take() {
            task.abort();
        }
        if let Some(task) = self.reader.lock().unwrap().take() {
            task.abort();
        }
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
        info!(peer = %self.cfg.peer_ip, "bgp session closed");
        Ok(())
    }

    pub fn counters(&self) -> BgpCountersSnapshot {
        self.counters.snapshot()
    }

    pub fn config(&self) -> &BgpConfig {
        &self.cfg
    }

    async fn send_message(&self, message_type: wire::MessageType, body: &[u8]) -> Result<()> {
        let mut framed = BytesMut::with_capacity(wire::HEADER_LEN + body.len());
        wire::push_message(&mut framed, message_type, body);
        let mut writer = self.writer.lock().await;
        writer
            .write_all(&framed)
            .await
            .map_err(|e| EngineError::Transport(format!("bgp send: {e}")))?;
        Ok(())
    }
}

/// Reads and logs whatever the peer sends; the session does not run a
/// receive-side FSM.
async fn drain_peer(mut reader: OwnedReadHalf) {
    let mut pending = BytesMut::with_capacity(4096);
    let mut chunk = [0u8; 4096];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                pending.extend_from_slice(&chunk[..n]);
                loop {
                    match wire::parse_message(&pending) {
                        Ok((message_type, _body, consumed)) => {
                            debug!(?message_type, "bgp message received");
                            let _ = pending.split_to(consumed);
                        }
                        Err(_) => break,
                    }
                }
            }
        }
    }
    debug!("bgp peer closed transport");
}

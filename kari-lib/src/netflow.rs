//! NetFlow v5 / IPFIX flow export for collector testing.

use rand::{rng, Rng};
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::codec::netflow::{
    build_ipfix_data, build_ipfix_template, build_v5_datagram, V5Header, V5_MAX_RECORDS,
};
pub use crate::codec::netflow::FlowRecord;
use crate::error::{EngineError, Result};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetflowVariant {
    #[default]
    V5,
    Ipfix,
}

fn default_flows_per_second() -> u32 {
    100
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NetflowConfig {
    /// Collector address: conventionally UDP/2055 for v5, UDP/4739 for IPFIX.
    pub collector: SocketAddr,
    #[serde(default)]
    pub variant: NetflowVariant,
    #[serde(default = "default_flows_per_second")]
    pub flows_per_second: u32,
    #[serde(default)]
    pub domain_id: u32,
}

pub struct NetflowExporter {
    socket: UdpSocket,
    cfg: NetflowConfig,
    boot: Instant,
    sequence: u32,
    template_sent: bool,
    pub flows_sent: u64,
    pub datagrams_sent: u64,
}

impl NetflowExporter {
    pub async fn bind(cfg: NetflowConfig) -> Result<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(cfg.collector).await?;
        Ok(Self {
            socket,
            cfg,
            boot: Instant::now(),
            sequence: 0,
            template_sent: false,
            flows_sent: 0,
            datagrams_sent: 0,
        })
    }

    fn unix_now() -> (u32, u32) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO);
        (now.as_secs() as u32, now.subsec_nanos())
    }

    /// Ships `flows` to the collector, chunked per the variant's datagram
    /// limits. IPFIX announces its template ahead of the first data set.
    pub async fn export(&mut self, flows: &[FlowRecord]) -> Result<()> {
        match self.cfg.variant {
            NetflowVariant::V5 => {
                for chunk in flows.chunks(V5_MAX_RECORDS) {
                    let (unix_secs, unix_nsecs) = Self::unix_now();
                    let header = V5Header {
                        count: chunk.len() as u16,
                        sys_uptime_ms: self.boot.elapsed().as_millis() as u32,
                        unix_secs,
                        unix_nsecs,
                        flow_sequence: self.sequence,
                        engine_type: 0,
                        engine_id: 0,
                    };
                    let datagram = build_v5_datagram(&header, chunk)
                        .map_err(EngineError::Codec)?;
                    self.socket.send(&datagram).await?;
                    self.sequence = self.sequence.wrapping_add(chunk.len() as u32);
                    self.flows_sent += chunk.len() as u64;
                    self.datagrams_sent += 1;
                }
            }
            NetflowVariant::Ipfix => {
                let (unix_secs, _) = Self::unix_now();
                if !self.template_sent {
                    let template =
                        build_ipfix_template(unix_secs, self.sequence, self.cfg.domain_id);
                    self.socket.send(&template).await?;
                    self.datagrams_sent += 1;
                    self.template_sent = true;
                }
                let datagram =
                    build_ipfix_data(flows, unix_secs, self.sequence, self.cfg.domain_id);
                self.socket.send(&datagram).await?;
                self.sequence = self.sequence.wrapping_add(flows.len() as u32);
                self.flows_sent += flows.len() as u64;
                self.datagrams_sent += 1;
            }
        }
        Ok(())
    }
}

pub struct NetflowHandle {
    task: JoinHandle<()>,
}

impl NetflowHandle {
    pub fn stop(self) {
        self.task.abort();
    }
}

/// Spawns a background task exporting synthetic flows at the configured rate
/// until stopped.
pub fn spawn_generator(cfg: NetflowConfig) -> NetflowHandle {
    let task = tokio::spawn(async move {
        let mut exporter = match NetflowExporter::bind(cfg.clone()).await {
            Ok(exporter) => exporter,
            Err(err) => {
                warn!(%err, "netflow exporter failed to bind");
                return;
            }
        };
        info!(collector = %cfg.collector, ?cfg.variant, "netflow generation started");
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        loop {
            ticker.tick().await;
            let flows: Vec<FlowRecord> = (0..cfg.flows_per_second)
                .map(|_| synthetic_flow(&mut rng()))
                .collect();
            if let Err(err) = exporter.export(&flows).await {
                warn!(%err, "netflow export failed");
            }
        }
    });
    NetflowHandle { task }
}

fn synthetic_flow<R: Rng>(rng: &mut R) -> FlowRecord {
    let start = rng.random_range(0..60_000u32);
    FlowRecord {
        src_addr: Ipv4Addr::new(10, rng.random(), rng.random(), rng.random_range(1..255)),
        dst_addr: Ipv4Addr::new(10, rng.random(), rng.random(), rng.random_range(1..255)),
        src_port: rng.random_range(1024..=65535),
        dst_port: [80, 443, 53, 5060][rng.random_range(0..4)],
        protocol: if rng.random_bool(0.7) { 6 } else { 17 },
        packets: rng.random_range(1..10_000),
        octets: rng.random_range(64..10_000_000),
        first_ms: start,
        last_ms: start + rng.random_range(100..5_000),
    }
}

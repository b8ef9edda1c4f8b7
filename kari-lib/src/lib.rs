//! Kári: a multi-port network traffic generator and impairment engine for
//! lab validation of switches, routers, firewalls, and telemetry collectors.

pub mod api;
pub mod bgp;
pub mod codec;
pub mod config;
pub mod engine;
pub mod error;
pub mod iface;
pub mod impair;
pub mod netflow;
pub mod pool;
pub mod rfc2544;
pub mod sched;
pub mod tcp;
pub mod telemetry;

pub use config::{load_from_path, save_to_path, EngineSnapshot, InterfaceConfig, TrafficProfile};
pub use engine::{Engine, EngineOptions};
pub use error::{EngineError, Result};
pub use iface::Interface;
pub use pool::PacketPool;

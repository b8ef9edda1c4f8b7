pub mod template;
pub mod worker;

pub use template::{build_template, encap_overhead, min_frame_len};
pub use worker::{batch_size_for, ProfileStats, ProfileStatsSnapshot, WorkerHandle};

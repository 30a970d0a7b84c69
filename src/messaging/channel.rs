//! Deterministic transport addressing
//!
//! Publishers and subscribers never exchange stream ids; both sides derive
//! the same `(channel, stream-id)` pair from `(job, task, slot, site)`.

use crc32fast::Hasher;
use serde::{Deserialize, Serialize};

use super::frame::SlotId;

/// A transport endpoint: channel URI plus stream id within it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelAddress {
    pub channel: String,
    pub stream_id: i32,
}

impl ChannelAddress {
    /// Data stream a subscriber at `site` receives frames for `(job, task, slot)` on.
    pub fn data(job_id: &str, task_id: &str, slot_id: SlotId, site: &str) -> Self {
        Self {
            channel: channel_uri(site),
            stream_id: derive_stream_id("data", job_id, task_id, slot_id),
        }
    }

    /// Status stream a subscriber sends heartbeats and acks back on.
    pub fn status(job_id: &str, task_id: &str, slot_id: SlotId, sender_site: &str) -> Self {
        Self {
            channel: channel_uri(sender_site),
            stream_id: derive_stream_id("status", job_id, task_id, slot_id),
        }
    }
}

fn channel_uri(site: &str) -> String {
    format!("udp://{}", site)
}

/// Non-negative stream id from a CRC32 of the addressing tuple.
fn derive_stream_id(kind: &str, job_id: &str, task_id: &str, slot_id: SlotId) -> i32 {
    let mut hasher = Hasher::new();
    for part in [kind.as_bytes(), job_id.as_bytes(), task_id.as_bytes()] {
        hasher.update(&(part.len() as u32).to_le_bytes());
        hasher.update(part);
    }
    hasher.update(&slot_id.to_le_bytes());
    (hasher.finalize() & 0x7fff_ffff) as i32
}

//! Frame types exchanged between upstream publishers and subscribers
//!
//! Every frame carries a header with enough addressing for a handler to
//! discard frames that are not meant for its subscription. Frames travel
//! as opaque bytes; `encode`/`decode` are the only codec.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::errors::{MessagingError, MessagingResult};

/// Identity of a peer process
pub type PeerId = Uuid;

/// Transport session identifier assigned by the publisher side
pub type SessionId = i64;

/// Position of a fragment within a transport session
pub type Position = i64;

/// Task identifier within a job
pub type TaskId = String;

/// Slot (partition) of a task
pub type SlotId = u32;

/// Job topology generation
pub type ReplicaVersion = u64;

/// Barrier epoch within one replica version, the first barrier is epoch 1
pub type Epoch = u64;

/// Job identifier
pub type JobId = String;

/// Identifies one logical subscription.
///
/// Used for equality and reconciliation; never mutated.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SubscriptionKey {
    pub src_peer_id: PeerId,
    pub dst_task_id: TaskId,
    pub slot_id: SlotId,
    /// Network site the subscription listens on (`host:port`)
    pub site: String,
}

impl SubscriptionKey {
    pub fn new(
        src_peer_id: PeerId,
        dst_task_id: impl Into<TaskId>,
        slot_id: SlotId,
        site: impl Into<String>,
    ) -> Self {
        Self {
            src_peer_id,
            dst_task_id: dst_task_id.into(),
            slot_id,
            site: site.into(),
        }
    }
}

/// Addressing shared by every frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameHeader {
    pub replica_version: ReplicaVersion,
    pub src_peer_id: PeerId,
    pub dst_task_id: TaskId,
    pub slot_id: SlotId,
}

impl FrameHeader {
    /// Header addressing frames of `key` at `replica_version`.
    pub fn for_key(key: &SubscriptionKey, replica_version: ReplicaVersion) -> Self {
        Self {
            replica_version,
            src_peer_id: key.src_peer_id,
            dst_task_id: key.dst_task_id.clone(),
            slot_id: key.slot_id,
        }
    }

    /// Whether source, destination and slot all match `key`.
    pub fn is_addressed_to(&self, key: &SubscriptionKey) -> bool {
        self.src_peer_id == key.src_peer_id
            && self.dst_task_id == key.dst_task_id
            && self.slot_id == key.slot_id
    }
}

/// Frame payload variants
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FrameBody {
    /// Liveness signal, either direction
    Heartbeat,

    /// Publisher announces a session for the current replica version
    ReadyHandshake,

    /// Subscriber acknowledges a handshake (status stream only)
    ReadyReplyAck,

    /// Application payload
    Message { payload: Vec<u8> },

    /// Epoch boundary
    Barrier {
        epoch: Epoch,
        /// Upstream has finished; aligning this barrier completes the stream
        #[serde(default)]
        completed: bool,
        /// Recovery coordinates carried by the first barrier of a version
        #[serde(default)]
        recovery: Option<serde_json::Value>,
    },

    /// Subscriber reports an aligned barrier (status stream only)
    BarrierAlignedAck { epoch: Epoch },
}

impl FrameBody {
    pub fn name(&self) -> &'static str {
        match self {
            FrameBody::Heartbeat => "heartbeat",
            FrameBody::ReadyHandshake => "ready_handshake",
            FrameBody::ReadyReplyAck => "ready_reply_ack",
            FrameBody::Message { .. } => "message",
            FrameBody::Barrier { .. } => "barrier",
            FrameBody::BarrierAlignedAck { .. } => "barrier_aligned_ack",
        }
    }
}

/// A complete frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub header: FrameHeader,
    pub body: FrameBody,
}

impl Frame {
    pub fn new(header: FrameHeader, body: FrameBody) -> Self {
        Self { header, body }
    }

    pub fn heartbeat(header: FrameHeader) -> Self {
        Self::new(header, FrameBody::Heartbeat)
    }

    pub fn ready_handshake(header: FrameHeader) -> Self {
        Self::new(header, FrameBody::ReadyHandshake)
    }

    pub fn message(header: FrameHeader, payload: impl Into<Vec<u8>>) -> Self {
        Self::new(
            header,
            FrameBody::Message {
                payload: payload.into(),
            },
        )
    }

    pub fn barrier(header: FrameHeader, epoch: Epoch) -> Self {
        Self::new(
            header,
            FrameBody::Barrier {
                epoch,
                completed: false,
                recovery: None,
            },
        )
    }

    /// Serialize to transport bytes.
    pub fn encode(&self) -> MessagingResult<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| MessagingError::transport(format!("failed to encode frame: {}", e)))
    }

    /// Parse transport bytes. A frame that cannot be parsed is a protocol
    /// violation: the sender is not speaking this protocol.
    pub fn decode(bytes: &[u8]) -> MessagingResult<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| MessagingError::protocol_violation(format!("undecodable frame: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> SubscriptionKey {
        SubscriptionKey::new(Uuid::from_u128(7), "task-a", 0, "localhost:40200")
    }

    #[test]
    fn test_header_addressing() {
        let k = key();
        let header = FrameHeader::for_key(&k, 3);
        assert!(header.is_addressed_to(&k));

        let mut other_slot = header.clone();
        other_slot.slot_id = 1;
        assert!(!other_slot.is_addressed_to(&k));

        let mut other_task = header.clone();
        other_task.dst_task_id = "task-b".to_string();
        assert!(!other_task.is_addressed_to(&k));

        let mut other_peer = header;
        other_peer.src_peer_id = Uuid::from_u128(8);
        assert!(!other_peer.is_addressed_to(&k));
    }

    #[test]
    fn test_barrier_decode_defaults() {
        let header = FrameHeader::for_key(&key(), 1);
        let mut json = serde_json::to_value(Frame::barrier(header, 1)).unwrap();
        json["body"].as_object_mut().unwrap().remove("completed");
        json["body"].as_object_mut().unwrap().remove("recovery");

        let frame = Frame::decode(&serde_json::to_vec(&json).unwrap()).unwrap();
        assert_eq!(
            frame.body,
            FrameBody::Barrier {
                epoch: 1,
                completed: false,
                recovery: None
            }
        );
    }

    #[test]
    fn test_garbage_is_protocol_violation() {
        let err = Frame::decode(b"\x00\x01not a frame").unwrap_err();
        assert!(err.is_protocol_violation());
    }
}

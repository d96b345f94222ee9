//! ---
//! gcs_section: "02-telemetry-link"
//! gcs_subsection: "module"
//! gcs_type: "source"
//! gcs_scope: "code"
//! gcs_description: "Wire codec seam and the in-memory loopback codec."
//! gcs_version: "v0.0.0-prealpha"
//! gcs_owner: "tbd"
//! ---
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;

use crate::object::ObjectRef;
use crate::stats::StatsReport;

/// Header, object id, instance id and checksum framing every payload.
pub const FRAME_OVERHEAD_BYTES: usize = 11;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("link i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("link is down")]
    LinkDown,
    #[error("codec rejected frame: {0}")]
    Rejected(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum FrameBody {
    /// Object data; `acked` asks the peer to acknowledge it.
    Object { acked: bool },
    /// Ask the peer to send its copy of the object.
    Request,
    /// Local link statistics carried by the stats object.
    Stats(StatsReport),
}

/// A frame handed to the codec for transmission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutboundFrame {
    pub object: ObjectRef,
    pub all_instances: bool,
    pub body: FrameBody,
}

impl OutboundFrame {
    pub fn object(object: ObjectRef, all_instances: bool, acked: bool) -> Self {
        Self {
            object,
            all_instances,
            body: FrameBody::Object { acked },
        }
    }

    pub fn request(object: ObjectRef, all_instances: bool) -> Self {
        Self {
            object,
            all_instances,
            body: FrameBody::Request,
        }
    }

    pub fn stats(object: ObjectRef, report: StatsReport) -> Self {
        Self {
            object,
            all_instances: false,
            body: FrameBody::Stats(report),
        }
    }

    /// Whether the frame carries registry object traffic rather than link stats.
    pub fn is_object_payload(&self) -> bool {
        !matches!(self.body, FrameBody::Stats(_))
    }

    pub fn kind(&self) -> &'static str {
        match self.body {
            FrameBody::Object { acked: true } => "object_acked",
            FrameBody::Object { acked: false } => "object",
            FrameBody::Request => "request",
            FrameBody::Stats(_) => "stats",
        }
    }
}

/// Byte-level framing below the coordinator.
pub trait WireCodec: Send + Sync {
    /// Encode and send a frame; returns the number of bytes put on the link.
    fn transmit(&self, frame: &OutboundFrame) -> Result<usize, CodecError>;
    /// Abandon codec-side state for an object whose transaction failed.
    fn cancel(&self, object: &ObjectRef);
    /// Human-readable codec name for logging and metrics.
    fn name(&self) -> &'static str;
}

#[derive(Debug, Default)]
struct LoopbackState {
    frames: Vec<OutboundFrame>,
    cancelled: Vec<ObjectRef>,
    fail_next: u32,
    link_down: bool,
}

/// In-memory codec that records every frame it is asked to send.
#[derive(Debug, Clone)]
pub struct LoopbackCodec {
    state: Arc<Mutex<LoopbackState>>,
    payload_len: usize,
}

impl LoopbackCodec {
    pub fn new() -> Self {
        Self::with_payload_len(32)
    }

    /// Report every object frame as carrying `payload_len` data bytes.
    pub fn with_payload_len(payload_len: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(LoopbackState::default())),
            payload_len,
        }
    }

    /// Fail the next `count` transmissions with [`CodecError::Rejected`].
    pub fn fail_next(&self, count: u32) {
        self.state.lock().fail_next = count;
    }

    /// Fail every transmission with [`CodecError::LinkDown`] until cleared.
    pub fn set_link_down(&self, down: bool) {
        self.state.lock().link_down = down;
    }

    pub fn frames(&self) -> Vec<OutboundFrame> {
        self.state.lock().frames.clone()
    }

    pub fn take_frames(&self) -> Vec<OutboundFrame> {
        std::mem::take(&mut self.state.lock().frames)
    }

    /// Frames sent for one object, in transmission order.
    pub fn frames_for(&self, object: &ObjectRef) -> Vec<OutboundFrame> {
        self.state
            .lock()
            .frames
            .iter()
            .filter(|frame| frame.object == *object)
            .cloned()
            .collect()
    }

    pub fn cancelled(&self) -> Vec<ObjectRef> {
        self.state.lock().cancelled.clone()
    }

    fn frame_len(&self, frame: &OutboundFrame) -> usize {
        match frame.body {
            FrameBody::Object { .. } => FRAME_OVERHEAD_BYTES + self.payload_len,
            FrameBody::Request => FRAME_OVERHEAD_BYTES,
            FrameBody::Stats(_) => FRAME_OVERHEAD_BYTES + 20,
        }
    }
}

impl Default for LoopbackCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl WireCodec for LoopbackCodec {
    fn transmit(&self, frame: &OutboundFrame) -> Result<usize, CodecError> {
        let mut state = self.state.lock();
        if state.link_down {
            return Err(CodecError::LinkDown);
        }
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(CodecError::Rejected(format!(
                "injected failure for {}",
                frame.object
            )));
        }
        state.frames.push(frame.clone());
        Ok(self.frame_len(frame))
    }

    fn cancel(&self, object: &ObjectRef) {
        self.state.lock().cancelled.push(*object);
    }

    fn name(&self) -> &'static str {
        "loopback"
    }
}

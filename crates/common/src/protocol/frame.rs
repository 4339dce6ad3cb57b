// Binary frame codec for the sync/awareness relay protocol.
//
// Every WebSocket binary message carries exactly one frame: a lib0 varuint
// message kind followed by a kind-specific payload.

use thiserror::Error;
use yrs::encoding::read::{Cursor, Read};
use yrs::encoding::write::Write;

pub const MESSAGE_SYNC: u32 = 0;
pub const MESSAGE_AWARENESS: u32 = 1;

pub const SYNC_STEP1: u32 = 0;
pub const SYNC_STEP2: u32 = 1;
pub const SYNC_UPDATE: u32 = 2;

/// Sync-protocol payload carried by a [`Frame::Sync`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncFrame {
    /// The sender offers its encoded state vector.
    Step1(Vec<u8>),
    /// The responder sends the diff computed against a step-1 state vector.
    Step2(Vec<u8>),
    /// A live incremental update.
    Update(Vec<u8>),
}

impl SyncFrame {
    pub const fn subkind(&self) -> u32 {
        match self {
            Self::Step1(_) => SYNC_STEP1,
            Self::Step2(_) => SYNC_STEP2,
            Self::Update(_) => SYNC_UPDATE,
        }
    }

    pub fn payload(&self) -> &[u8] {
        match self {
            Self::Step1(payload) | Self::Step2(payload) | Self::Update(payload) => payload,
        }
    }

    pub const fn name(&self) -> &'static str {
        match self {
            Self::Step1(_) => "step1",
            Self::Step2(_) => "step2",
            Self::Update(_) => "update",
        }
    }
}

/// A decoded relay frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Sync(SyncFrame),
    /// Opaque presence delta produced by an awareness encoder.
    Awareness(Vec<u8>),
    /// A message kind this build does not understand. Receivers drop it.
    Unknown(u32),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame is empty")]
    Empty,
    #[error("unknown sync message subkind: {0}")]
    UnknownSyncSubkind(u32),
    #[error("malformed frame: {0}")]
    Malformed(String),
}

impl Frame {
    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.is_empty() {
            return Err(FrameError::Empty);
        }

        let mut cursor = Cursor::new(bytes);
        let kind: u32 = cursor.read_var().map_err(malformed)?;
        match kind {
            MESSAGE_SYNC => {
                let subkind: u32 = cursor.read_var().map_err(malformed)?;
                let payload = cursor.read_buf().map_err(malformed)?.to_vec();
                let sync = match subkind {
                    SYNC_STEP1 => SyncFrame::Step1(payload),
                    SYNC_STEP2 => SyncFrame::Step2(payload),
                    SYNC_UPDATE => SyncFrame::Update(payload),
                    other => return Err(FrameError::UnknownSyncSubkind(other)),
                };
                Ok(Self::Sync(sync))
            }
            MESSAGE_AWARENESS => {
                let payload = cursor.read_buf().map_err(malformed)?.to_vec();
                Ok(Self::Awareness(payload))
            }
            other => Ok(Self::Unknown(other)),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut encoded = Vec::new();
        match self {
            Self::Sync(sync) => {
                encoded.write_var(MESSAGE_SYNC);
                encoded.write_var(sync.subkind());
                encoded.write_buf(sync.payload());
            }
            Self::Awareness(payload) => {
                encoded.write_var(MESSAGE_AWARENESS);
                encoded.write_buf(payload);
            }
            Self::Unknown(kind) => {
                encoded.write_var(*kind);
            }
        }
        encoded
    }

    pub const fn kind(&self) -> u32 {
        match self {
            Self::Sync(_) => MESSAGE_SYNC,
            Self::Awareness(_) => MESSAGE_AWARENESS,
            Self::Unknown(kind) => *kind,
        }
    }
}

fn malformed(error: yrs::encoding::read::Error) -> FrameError {
    FrameError::Malformed(error.to_string())
}

pub mod close;
pub mod frame;

pub use close::CloseReason;
pub use frame::{Frame, FrameError, SyncFrame};

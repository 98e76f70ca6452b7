//! The streaming relay: per-request session orchestration and the
//! client-facing SSE frame vocabulary.

pub mod frames;
pub mod session;

pub use frames::{FrameContext, DONE_FRAME};
pub use session::{run_session, SessionContext, SessionOutcome};

pub mod envelope;
pub mod framing;

pub use envelope::{Envelope, InitPack, StreamPack, EXFIL_PACK, INIT_PACK, JOB_PACK};
pub use framing::{recv_frame, send_frame, AsyncStream, MAX_FRAME_SIZE};

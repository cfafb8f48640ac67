//! Video transport: fragmentation, reassembly and the two stream loops.

pub mod fragment;
pub mod pattern;
pub mod reassembly;
pub mod stream;

pub use fragment::{is_newer, FragmentHeader, Fragmenter, HEADER_LEN};
pub use pattern::TestPattern;
pub use reassembly::{FrameAssembly, FrameReassembler, Ingested};
pub use stream::{video_receive_loop, video_send_loop};

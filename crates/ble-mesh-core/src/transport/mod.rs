//! Message transport layer: wire fragment format, reassembly, loop
//! avoidance and the FIFO outbound queue.

pub mod fragment;
pub mod loop_guard;
pub mod queue;
pub mod reassembly;

pub use fragment::Fragment;
pub use queue::{CryptoCipher, ForwardResult, MessageKind, TransportQueue};
pub use reassembly::ReassembledMessage;

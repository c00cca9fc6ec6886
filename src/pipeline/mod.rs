pub mod repair;
pub mod signal;
pub mod store;

pub use repair::{HuffmanScan, STANDARD_DHT};
pub use signal::GenerationSignal;
pub use store::{Chunk, Frame, FrameStore};

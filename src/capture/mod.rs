pub mod capture_loop;
pub mod controls;
pub mod device;
pub mod frame;
pub mod source;
pub mod v4l2;

pub use capture_loop::{CaptureLoop, CaptureStats};
pub use controls::{list_controls, run_control, set_control, ControlAction};
pub use device::CaptureDevice;
pub use frame::{Buffer, BufferPool, IoMethod, PixelFormat};
pub use source::{CaptureSource, Readiness};
pub use v4l2::V4l2Source;

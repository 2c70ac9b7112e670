//! rollcall-hw: V4L2 camera capture.
//!
//! Opens a capture device, negotiates YUYV/MJPG/GREY and hands out frames
//! decoded to RGB.

pub mod camera;
pub mod frame;

pub use camera::{Camera, CameraError, DeviceInfo, FrameStream, PixelFormat};
pub use frame::{Frame, FrameError};

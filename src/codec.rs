use std::ops::{Deref, DerefMut};
use std::time::Instant;

use crate::buffer::VideoBuffer;
use crate::mjpegcodec::MjpegEncoder;
use crate::{Bitmap, Rect, ResultType};

/// Monotonic time source with nanosecond resolution.
pub type TimeSource = Box<dyn Fn() -> u64>;

pub(crate) fn monotonic_time_source() -> TimeSource {
    let epoch = Instant::now();
    // 0 is reserved as the unset-timestamp sentinel
    Box::new(move || epoch.elapsed().as_nanos() as u64 + 1)
}

/// Host-supplied hooks for the rate controller. Every callback is
/// optional; the controller falls back to a fixed default when one is
/// absent. Callbacks run synchronously on the caller's thread and must
/// not re-enter the encoder.
#[derive(Default)]
pub struct RateControlCbs {
    /// Round-trip time to the client in milliseconds. Default: 0.
    pub get_roundtrip_ms: Option<Box<dyn Fn() -> u32>>,
    /// Frame rate the capture source produces. Default: 25.
    pub get_source_fps: Option<Box<dyn Fn() -> u32>>,
    /// Pushes a new minimum playback delay (ms) to the client.
    pub update_client_playback_delay: Option<Box<dyn Fn(u32)>>,
    /// Overrides the monotonic clock. Tests use this for deterministic
    /// timing; leave `None` in production.
    pub now_ns: Option<TimeSource>,
}

pub struct MjpegEncoderConfig {
    /// Initial estimate of the available bandwidth, bits per second.
    pub starting_bit_rate: u64,
    pub cbs: RateControlCbs,
}

pub enum EncoderCfg {
    Mjpeg(MjpegEncoderConfig),
}

/// Outcome of one frame submission.
pub enum EncodeResult {
    /// The frame was encoded; the buffer holds a complete JPEG stream.
    Done(VideoBuffer),
    /// The frame was dropped by the admission gate.
    Drop,
    /// The frame cannot be encoded (format, allocation or codec error).
    /// Encoder state is preserved; the next frame may succeed.
    Unsupported,
}

/// Playback statistics reported by the client for a window of frames.
/// `start_frame_mm_time`/`end_frame_mm_time` are media-time
/// milliseconds; `end_frame_delay` is signed (negative means the last
/// frame arrived past its due time).
#[derive(Debug, Clone, Copy, Default)]
pub struct ClientStreamReport {
    pub num_frames: u32,
    pub num_drops: u32,
    pub start_frame_mm_time: u32,
    pub end_frame_mm_time: u32,
    pub end_frame_delay: i32,
    pub audio_delay: u32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VideoEncoderStats {
    pub starting_bit_rate: u64,
    pub cur_bit_rate: u64,
    pub avg_quality: f64,
}

pub trait VideoEncoder {
    /// Submits one candidate frame. `frame_mm_time` is the caller's
    /// media-time stamp in milliseconds and must be non-decreasing
    /// across the stream.
    fn encode_frame(
        &mut self,
        bitmap: &Bitmap,
        src: &Rect,
        top_down: bool,
        frame_mm_time: u32,
    ) -> EncodeResult;

    fn client_stream_report(&mut self, report: ClientStreamReport);

    fn notify_server_frame_drop(&mut self);

    /// Current bit-rate estimate, bits per second.
    fn get_bit_rate(&self) -> u64;

    fn get_stats(&self) -> VideoEncoderStats;
}

pub struct Encoder {
    pub codec: Box<dyn VideoEncoder>,
}

impl Deref for Encoder {
    type Target = Box<dyn VideoEncoder>;

    fn deref(&self) -> &Self::Target {
        &self.codec
    }
}

impl DerefMut for Encoder {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.codec
    }
}

impl Encoder {
    pub fn new(config: EncoderCfg) -> ResultType<Encoder> {
        log::info!("new encoder: mjpeg");
        match config {
            EncoderCfg::Mjpeg(_) => Ok(Encoder {
                codec: Box::new(MjpegEncoder::new(config)?),
            }),
        }
    }
}

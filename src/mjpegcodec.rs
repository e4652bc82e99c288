use image::codecs::jpeg::JpegEncoder;
use image::{ExtendedColorType, ImageEncoder};

use crate::buffer::VideoBuffer;
use crate::codec::{ClientStreamReport, EncodeResult, EncoderCfg, VideoEncoder, VideoEncoderStats};
use crate::convert::{self, LineConverter, LineReader};
use crate::rate_control::RateControl;
use crate::{Bitmap, BitmapFormat, Rect, ResultType};

enum FrameStart {
    Ready,
    Drop,
    Unsupported,
}

/// Motion-JPEG encoder: every accepted frame is compressed into an
/// independently decodable baseline JPEG at the quality the rate
/// controller currently targets.
pub struct MjpegEncoder {
    rate_control: RateControl,

    /// RGB24 scanlines of the frame being encoded.
    frame: Vec<u8>,
    bytes_per_pixel: usize,
    pixel_converter: LineConverter,
    image_width: u32,
    image_height: u32,

    /* stats */
    starting_bit_rate: u64,
    avg_quality: u64,
    num_frames: u32,
}

impl MjpegEncoder {
    pub fn new(cfg: EncoderCfg) -> ResultType<Self> {
        let EncoderCfg::Mjpeg(cfg) = cfg;
        Ok(MjpegEncoder {
            rate_control: RateControl::new(cfg.starting_bit_rate, cfg.cbs),
            frame: Vec::new(),
            bytes_per_pixel: 0,
            pixel_converter: convert::bgrx32_to_rgb24,
            image_width: 0,
            image_height: 0,
            starting_bit_rate: cfg.starting_bit_rate,
            avg_quality: 0,
            num_frames: 0,
        })
    }

    fn start_frame(&mut self, format: BitmapFormat, src: &Rect, frame_mm_time: u32) -> FrameStart {
        if !self.rate_control.admit_frame(frame_mm_time) {
            return FrameStart::Drop;
        }

        let (bytes_per_pixel, pixel_converter) = match format {
            BitmapFormat::Rgba32 | BitmapFormat::Bgrx32 => {
                (4, convert::bgrx32_to_rgb24 as LineConverter)
            }
            BitmapFormat::Rgb24 => (3, convert::bgr24_to_rgb24 as LineConverter),
            BitmapFormat::Rgb16 => (2, convert::rgb565_to_rgb24 as LineConverter),
            _ => {
                log::debug!("unsupported format {:?}", format);
                return FrameStart::Unsupported;
            }
        };
        self.bytes_per_pixel = bytes_per_pixel;
        self.pixel_converter = pixel_converter;
        self.image_width = src.width();
        self.image_height = src.height();

        // check for integer overflow
        let Some(stride) = self.image_width.checked_mul(3) else {
            return FrameStart::Unsupported;
        };
        let Some(frame_size) = (stride as usize).checked_mul(self.image_height as usize) else {
            return FrameStart::Unsupported;
        };
        self.frame.clear();
        if self.frame.try_reserve_exact(frame_size).is_err() {
            return FrameStart::Unsupported;
        }

        self.num_frames += 1;
        self.avg_quality += self.rate_control.quality() as u64;
        FrameStart::Ready
    }

    fn encode_lines(&mut self, bitmap: &Bitmap, src: &Rect, top_down: bool) -> bool {
        let mut lines = LineReader::new(bitmap.chunks, bitmap.stride);
        let skip_lines = if top_down {
            src.top
        } else {
            bitmap.height.saturating_sub(src.bottom)
        };
        for _ in 0..skip_lines {
            if lines.next().is_none() {
                return false;
            }
        }

        let left_offset = src.left as usize * self.bytes_per_pixel;
        let line_bytes = self.image_width as usize * self.bytes_per_pixel;
        let out_stride = self.image_width as usize * 3;
        for _ in 0..self.image_height {
            let Some(line) = lines.next() else {
                return false;
            };
            let Some(src_pixels) = line.get(left_offset..left_offset + line_bytes) else {
                return false;
            };
            let start = self.frame.len();
            self.frame.resize(start + out_stride, 0);
            (self.pixel_converter)(src_pixels, &mut self.frame[start..]);
        }
        true
    }

    fn end_frame(&mut self, buffer: &mut VideoBuffer) -> ResultType<u64> {
        let encoder = JpegEncoder::new_with_quality(&mut *buffer, self.rate_control.quality());
        encoder.write_image(
            &self.frame,
            self.image_width,
            self.image_height,
            ExtendedColorType::Rgb8,
        )?;
        let enc_size = buffer.len() as u64;
        self.rate_control.frame_encoded(enc_size);
        Ok(enc_size)
    }
}

impl VideoEncoder for MjpegEncoder {
    fn encode_frame(
        &mut self,
        bitmap: &Bitmap,
        src: &Rect,
        top_down: bool,
        frame_mm_time: u32,
    ) -> EncodeResult {
        let Ok(mut buffer) = VideoBuffer::new() else {
            return EncodeResult::Unsupported;
        };

        match self.start_frame(bitmap.format, src, frame_mm_time) {
            FrameStart::Drop => return EncodeResult::Drop,
            FrameStart::Unsupported => return EncodeResult::Unsupported,
            FrameStart::Ready => {}
        }

        if !self.encode_lines(bitmap, src, top_down) {
            return EncodeResult::Unsupported;
        }

        match self.end_frame(&mut buffer) {
            Ok(_) => EncodeResult::Done(buffer),
            Err(e) => {
                log::debug!("jpeg encode failed: {e}");
                self.rate_control.frame_aborted();
                EncodeResult::Unsupported
            }
        }
    }

    fn client_stream_report(&mut self, report: ClientStreamReport) {
        self.rate_control.client_stream_report(&report);
    }

    fn notify_server_frame_drop(&mut self) {
        self.rate_control.notify_server_frame_drop();
    }

    fn get_bit_rate(&self) -> u64 {
        self.rate_control.byte_rate() * 8
    }

    fn get_stats(&self) -> VideoEncoderStats {
        VideoEncoderStats {
            starting_bit_rate: self.starting_bit_rate,
            cur_bit_rate: self.get_bit_rate(),
            avg_quality: if self.num_frames == 0 {
                0.0
            } else {
                self.avg_quality as f64 / self.num_frames as f64
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{MjpegEncoderConfig, RateControlCbs};
    use crate::NSEC_PER_SEC;
    use std::cell::Cell;
    use std::rc::Rc;

    const NSEC_PER_MS: u64 = 1_000_000;

    fn new_clock() -> Rc<Cell<u64>> {
        Rc::new(Cell::new(NSEC_PER_SEC))
    }

    fn test_encoder(clock: &Rc<Cell<u64>>) -> MjpegEncoder {
        let source = clock.clone();
        MjpegEncoder::new(EncoderCfg::Mjpeg(MjpegEncoderConfig {
            starting_bit_rate: 8_000_000,
            cbs: RateControlCbs {
                now_ns: Some(Box::new(move || source.get())),
                ..Default::default()
            },
        }))
        .unwrap()
    }

    fn solid_bgrx(width: usize, height: usize, b: u8, g: u8, r: u8) -> Vec<u8> {
        let mut data = Vec::with_capacity(width * height * 4);
        for _ in 0..width * height {
            data.extend_from_slice(&[b, g, r, 0]);
        }
        data
    }

    #[test]
    fn encodes_a_jpeg_stream() {
        let clock = new_clock();
        let mut encoder = test_encoder(&clock);
        let data = solid_bgrx(16, 16, 0x40, 0x40, 0x40);
        let chunks = [&data[..]];
        let bitmap = Bitmap {
            format: BitmapFormat::Bgrx32,
            stride: 16 * 4,
            height: 16,
            chunks: &chunks,
        };
        let rect = Rect {
            left: 0,
            top: 0,
            right: 16,
            bottom: 16,
        };

        let EncodeResult::Done(buffer) = encoder.encode_frame(&bitmap, &rect, true, 0) else {
            panic!("first frame should encode");
        };
        assert_eq!(&buffer.data()[..2], &[0xff, 0xd8]);
        assert_eq!(&buffer.data()[buffer.len() - 2..], &[0xff, 0xd9]);

        let stats = encoder.get_stats();
        assert_eq!(stats.starting_bit_rate, 8_000_000);
        assert_eq!(stats.cur_bit_rate, 8_000_000);
        assert_eq!(stats.avg_quality, 50.0);
    }

    #[test]
    fn gate_drops_frames_once_probing_ends() {
        let clock = new_clock();
        let mut encoder = test_encoder(&clock);
        let data = solid_bgrx(16, 16, 0x40, 0x40, 0x40);
        let chunks = [&data[..]];
        let bitmap = Bitmap {
            format: BitmapFormat::Bgrx32,
            stride: 16 * 4,
            height: 16,
            chunks: &chunks,
        };
        let rect = Rect {
            left: 0,
            top: 0,
            right: 16,
            bottom: 16,
        };

        let mut mm_time = 0;
        for _ in 0..10 {
            clock.set(clock.get() + 40 * NSEC_PER_MS);
            mm_time += 40;
            match encoder.encode_frame(&bitmap, &rect, true, mm_time) {
                EncodeResult::Done(_) => {}
                _ => panic!("frame should encode"),
            }
            if !encoder.rate_control.is_evaluating() {
                break;
            }
        }
        assert!(!encoder.rate_control.is_evaluating());

        clock.set(clock.get() + NSEC_PER_MS);
        assert!(matches!(
            encoder.encode_frame(&bitmap, &rect, true, mm_time + 1),
            EncodeResult::Drop
        ));
    }

    #[test]
    fn rejects_unsupported_formats() {
        let clock = new_clock();
        let mut encoder = test_encoder(&clock);
        let data = vec![0u8; 16];
        let chunks = [&data[..]];
        let rect = Rect {
            left: 0,
            top: 0,
            right: 4,
            bottom: 4,
        };

        for format in [BitmapFormat::Pal8, BitmapFormat::Rgb555] {
            let bitmap = Bitmap {
                format,
                stride: 4 * format.bytes_per_pixel(),
                height: 4,
                chunks: &chunks,
            };
            assert!(matches!(
                encoder.encode_frame(&bitmap, &rect, true, 0),
                EncodeResult::Unsupported
            ));
        }
    }

    #[test]
    fn rejects_truncated_chunks_and_recovers() {
        let clock = new_clock();
        let mut encoder = test_encoder(&clock);
        let short = solid_bgrx(16, 8, 0, 0, 0);
        let chunks = [&short[..]];
        let bitmap = Bitmap {
            format: BitmapFormat::Bgrx32,
            stride: 16 * 4,
            height: 16,
            chunks: &chunks,
        };
        let rect = Rect {
            left: 0,
            top: 0,
            right: 16,
            bottom: 16,
        };
        assert!(matches!(
            encoder.encode_frame(&bitmap, &rect, true, 0),
            EncodeResult::Unsupported
        ));

        let full = solid_bgrx(16, 16, 0, 0, 0);
        let chunks = [&full[..]];
        let bitmap = Bitmap {
            format: BitmapFormat::Bgrx32,
            stride: 16 * 4,
            height: 16,
            chunks: &chunks,
        };
        assert!(matches!(
            encoder.encode_frame(&bitmap, &rect, true, 0),
            EncodeResult::Done(_)
        ));
    }

    #[test]
    fn rejects_stride_overflow() {
        let clock = new_clock();
        let mut encoder = test_encoder(&clock);
        let data = vec![0u8; 16];
        let chunks = [&data[..]];
        let bitmap = Bitmap {
            format: BitmapFormat::Bgrx32,
            stride: 4,
            height: 1,
            chunks: &chunks,
        };
        let rect = Rect {
            left: 0,
            top: 0,
            right: u32::MAX,
            bottom: 1,
        };
        assert!(matches!(
            encoder.encode_frame(&bitmap, &rect, true, 0),
            EncodeResult::Unsupported
        ));
    }

    #[test]
    fn bottom_up_frame_reads_trailing_lines() {
        let clock = new_clock();
        let mut encoder = test_encoder(&clock);
        // top half blue, bottom half red; bottom-up the encoder must
        // skip the first stored half for a rect covering rows 0..8
        let mut data = solid_bgrx(16, 8, 200, 0, 0);
        data.extend_from_slice(&solid_bgrx(16, 8, 0, 0, 200));
        let chunks = [&data[..]];
        let bitmap = Bitmap {
            format: BitmapFormat::Bgrx32,
            stride: 16 * 4,
            height: 16,
            chunks: &chunks,
        };
        let rect = Rect {
            left: 0,
            top: 0,
            right: 16,
            bottom: 8,
        };

        let EncodeResult::Done(buffer) = encoder.encode_frame(&bitmap, &rect, false, 0) else {
            panic!("frame should encode");
        };
        let decoded = image::load_from_memory(buffer.data()).unwrap().to_rgb8();
        assert_eq!(decoded.dimensions(), (16, 8));
        let px = decoded.get_pixel(8, 4);
        assert!(px[0] > 150, "expected red, got {px:?}");
        assert!(px[2] < 60, "expected red, got {px:?}");
    }

    #[test]
    fn rgb16_frames_expand_to_full_scale() {
        let clock = new_clock();
        let mut encoder = test_encoder(&clock);
        let pixel = 0xf800u16.to_le_bytes();
        let data: Vec<u8> = std::iter::repeat(pixel).take(8 * 8).flatten().collect();
        let chunks = [&data[..]];
        let bitmap = Bitmap {
            format: BitmapFormat::Rgb16,
            stride: 8 * 2,
            height: 8,
            chunks: &chunks,
        };
        let rect = Rect {
            left: 0,
            top: 0,
            right: 8,
            bottom: 8,
        };

        let EncodeResult::Done(buffer) = encoder.encode_frame(&bitmap, &rect, true, 0) else {
            panic!("frame should encode");
        };
        let decoded = image::load_from_memory(buffer.data()).unwrap().to_rgb8();
        let px = decoded.get_pixel(4, 4);
        assert!(px[0] > 230, "expected saturated red, got {px:?}");
        assert!(px[1] < 60 && px[2] < 60, "expected saturated red, got {px:?}");
    }
}

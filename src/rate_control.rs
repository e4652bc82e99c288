use crate::codec::{monotonic_time_source, ClientStreamReport, RateControlCbs, TimeSource};
use crate::{MSEC_PER_SEC, NSEC_PER_MILLISEC, NSEC_PER_SEC};

pub(crate) const QUALITY_SAMPLE_NUM: usize = 7;
pub(crate) const QUALITY_SAMPLES: [u8; QUALITY_SAMPLE_NUM] = [20, 30, 40, 50, 60, 70, 80];

pub(crate) const MAX_FPS: u32 = 25;
pub(crate) const MIN_FPS: u32 = 1;

const IMPROVE_QUALITY_FPS_STRICT_TH: u32 = 10;
const IMPROVE_QUALITY_FPS_PERMISSIVE_TH: u32 = 5;

const AVERAGE_SIZE_WINDOW: u32 = 3;

const BIT_RATE_EVAL_MIN_NUM_FRAMES: u32 = 3;

const SERVER_STATUS_EVAL_FPS_INTERVAL: u32 = 1;
const SERVER_DOWNGRADE_DROP_FACTOR_TH: f64 = 0.1;

/* Positive client reports are acted on only after the current settings
 * proved stable for this long (media time). */
const CLIENT_POSITIVE_REPORT_TIMEOUT: i64 = 2000;
const CLIENT_POSITIVE_REPORT_STRICT_TIMEOUT: i64 = 3000;

const ADJUST_FPS_TIMEOUT: u64 = 500;

/* Caps the playback delay pushed to the client, so temporary incidents
 * of instability do not stall the playback for long. */
const MAX_CLIENT_PLAYBACK_DELAY: u32 = (MSEC_PER_SEC * 5) as u32;

/* The stream starts without rate control, after lossless frames were
 * sent to the client; early drops on either side do not necessarily
 * reflect the bit rate, so downgrades wait for the stream to settle. */
const WARMUP_TIME: u64 = NSEC_PER_SEC * 3;

const PLAYBACK_LATENCY_DECREASE_FACTOR: f64 = 0.5;
const VIDEO_VS_AUDIO_LATENCY_FACTOR: f64 = 1.25;
const VIDEO_DELAY_TH: i32 = -15;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum EvalType {
    #[default]
    Set,
    Upgrade,
    Downgrade,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum EvalReason {
    #[default]
    SizeChange,
    RateChange,
}

/// State of one quality-evaluation round. While a round is active,
/// successive frames are compressed at different quality ids; the
/// resulting sizes, against the available byte rate, select the highest
/// quality that still allows a reasonable frame rate.
#[derive(Debug, Default)]
struct QualityEval {
    kind: EvalType,
    reason: EvalReason,
    /// Zero means the quality id was not sampled in this round.
    encoded_size_by_quality: [u64; QUALITY_SAMPLE_NUM],
    /* lower limit for the current evaluation round */
    min_quality_id: usize,
    min_quality_fps: u32,
    /* upper limit for the current evaluation round */
    max_quality_id: usize,
    max_quality_fps: u32,
    /* best sampled fps so far */
    max_sampled_fps: u32,
    max_sampled_fps_quality_id: usize,
}

impl QualityEval {
    fn reset() -> Self {
        QualityEval {
            max_quality_id: QUALITY_SAMPLE_NUM - 1,
            max_quality_fps: MAX_FPS,
            ..Default::default()
        }
    }
}

#[derive(Debug, Default)]
struct ClientState {
    max_video_latency: i32,
    max_audio_latency: u32,
}

#[derive(Debug, Default)]
struct ServerState {
    num_frames_encoded: u32,
    num_frames_dropped: u32,
}

/// Encoded-frame statistics accumulated since the last bit-rate change.
#[derive(Debug, Default)]
struct BitRateInfo {
    change_start_time: u64,
    last_frame_time: u64,
    change_start_mm_time: u32,
    was_upgraded: bool,
    num_enc_frames: u32,
    sum_enc_size: u64,
}

/// All adaptive state of the MJPEG encoder: the current operating point
/// (quality id, fps), the pacing rate driving the admission gate, the
/// byte-rate estimate, and the bookkeeping that feeds the quality
/// evaluation rounds and the feedback handlers.
pub(crate) struct RateControl {
    during_quality_eval: bool,
    quality_eval_data: QualityEval,
    bit_rate_info: BitRateInfo,
    client_state: ClientState,
    server_state: ServerState,

    byte_rate: u64,
    quality_id: usize,
    fps: u32,
    adjusted_fps: f64,
    adjusted_fps_start_time: u64,
    adjusted_fps_num_frames: u64,

    /* the encoded frame size the quality and fps evaluation was based upon */
    base_enc_size: u64,

    last_enc_size: u64,

    sum_recent_enc_size: u64,
    num_recent_enc_frames: u32,

    warmup_start_time: u64,

    cbs: RateControlCbs,
    time_source: TimeSource,
}

fn max_fps_for_size(frame_size: u64, bytes_per_sec: u64) -> u32 {
    if frame_size == 0 {
        MAX_FPS
    } else {
        (bytes_per_sec / frame_size).min(u32::MAX as u64) as u32
    }
}

/* The video playback jitter buffer should hold at least
 * (send_time * 2 + net_latency) to prevent underflow. */
fn min_required_playback_delay(frame_enc_size: u64, byte_rate: u64, latency: u32) -> u32 {
    if frame_enc_size == 0 || byte_rate == 0 {
        return latency;
    }
    let one_frame_time = frame_enc_size * MSEC_PER_SEC / byte_rate;
    (one_frame_time * 2 + latency as u64).min(MAX_CLIENT_PLAYBACK_DELAY as u64) as u32
}

impl RateControl {
    pub fn new(starting_bit_rate: u64, mut cbs: RateControlCbs) -> Self {
        let time_source = cbs.now_ns.take().unwrap_or_else(monotonic_time_source);
        let mut rate_control = RateControl {
            during_quality_eval: false,
            quality_eval_data: QualityEval::default(),
            bit_rate_info: BitRateInfo::default(),
            client_state: ClientState::default(),
            server_state: ServerState::default(),
            byte_rate: starting_bit_rate / 8,
            quality_id: 0,
            fps: 0,
            adjusted_fps: 0.0,
            adjusted_fps_start_time: 0,
            adjusted_fps_num_frames: 0,
            base_enc_size: 0,
            last_enc_size: 0,
            sum_recent_enc_size: 0,
            num_recent_enc_frames: 0,
            warmup_start_time: 0,
            cbs,
            time_source,
        };
        rate_control.reset_quality(QUALITY_SAMPLE_NUM / 2, 5, 0);
        rate_control.during_quality_eval = true;
        rate_control.quality_eval_data.kind = EvalType::Set;
        rate_control.quality_eval_data.reason = EvalReason::RateChange;
        rate_control.warmup_start_time = rate_control.now_ns();
        rate_control
    }

    fn now_ns(&self) -> u64 {
        (self.time_source)()
    }

    fn source_fps(&self) -> u32 {
        self.cbs.get_source_fps.as_ref().map_or(MAX_FPS, |f| f())
    }

    fn latency_ms(&self) -> u32 {
        self.cbs.get_roundtrip_ms.as_ref().map_or(0, |f| f()) / 2
    }

    pub fn byte_rate(&self) -> u64 {
        self.byte_rate
    }

    /// JPEG quality for the frame about to be encoded.
    pub fn quality(&self) -> u8 {
        QUALITY_SAMPLES[self.quality_id]
    }

    #[cfg(test)]
    pub fn is_evaluating(&self) -> bool {
        self.during_quality_eval
    }

    fn sampled(&self, quality_id: usize) -> bool {
        self.quality_eval_data.encoded_size_by_quality[quality_id] != 0
    }

    /// Installs a new operating point, ending any evaluation round. The
    /// `adjusted_fps / fps` pacing ratio survives the change; the next
    /// periodic recalibration pulls it back into range if the new fps
    /// leaves it above 2x.
    fn reset_quality(&mut self, quality_id: usize, fps: u32, frame_enc_size: u64) {
        self.during_quality_eval = false;

        if self.quality_id != quality_id {
            self.last_enc_size = 0;
        }
        if self.quality_eval_data.reason == EvalReason::RateChange {
            self.server_state = ServerState::default();
        }
        self.quality_id = quality_id;
        self.quality_eval_data = QualityEval::reset();

        let fps_ratio = if self.adjusted_fps != 0.0 {
            self.adjusted_fps / self.fps as f64
        } else {
            1.5
        };
        self.fps = fps.clamp(MIN_FPS, MAX_FPS);
        self.adjusted_fps = self.fps as f64 * fps_ratio;
        log::debug!(
            "adjusted-fps-ratio={:.2} adjusted-fps={:.2}",
            fps_ratio,
            self.adjusted_fps
        );
        self.adjusted_fps_start_time = 0;
        self.adjusted_fps_num_frames = 0;
        self.base_enc_size = frame_enc_size;

        self.sum_recent_enc_size = 0;
        self.num_recent_enc_frames = 0;

        if let Some(cb) = &self.cbs.update_client_playback_delay {
            let min_delay =
                min_required_playback_delay(frame_enc_size, self.byte_rate, self.latency_ms());
            cb(min_delay);
        }
    }

    /// One evaluation step, run after the size of the previously encoded
    /// frame was recorded. Either steps to a neighboring quality id for
    /// further sampling, or completes the round and installs the stream
    /// parameters. Compression ratio is assumed to grow monotonically in
    /// quality; the best-sampled-fps tracking covers the frames that
    /// violate this.
    fn eval_quality(&mut self) {
        let enc_size = self.quality_eval_data.encoded_size_by_quality[self.quality_id];
        if enc_size == 0 {
            log::debug!("size info missing");
            return;
        }

        let src_fps = self.source_fps();
        let fps = max_fps_for_size(enc_size, self.byte_rate);
        log::debug!(
            "jpeg {}: {:.2} (KB) fps {} src-fps {}",
            QUALITY_SAMPLES[self.quality_id],
            enc_size as f64 / 1024.0,
            fps,
            src_fps
        );

        let quality_eval = &mut self.quality_eval_data;
        if fps > quality_eval.max_sampled_fps
            || ((fps == quality_eval.max_sampled_fps || fps >= src_fps)
                && self.quality_id > quality_eval.max_sampled_fps_quality_id)
        {
            quality_eval.max_sampled_fps = fps;
            quality_eval.max_sampled_fps_quality_id = self.quality_id;
        }

        if self.quality_id > QUALITY_SAMPLE_NUM / 2
            && fps < IMPROVE_QUALITY_FPS_STRICT_TH
            && fps < src_fps
        {
            /* above the median quality, prefer a reasonable frame rate
             * over improving the quality */
            log::debug!(
                "fps < {} && fps < src-fps, quality {}",
                IMPROVE_QUALITY_FPS_STRICT_TH,
                QUALITY_SAMPLES[self.quality_id]
            );
            self.quality_id -= 1;
            if self.sampled(self.quality_id) {
                /* the next worse quality already passed the frame rate
                 * thresholds (evaluation continued past it) */
                self.complete_sample();
            }
        } else if (fps > IMPROVE_QUALITY_FPS_PERMISSIVE_TH
            && fps as f64 >= 0.66 * self.quality_eval_data.min_quality_fps as f64)
            || fps >= src_fps
        {
            /* below the median quality the fps threshold is less strict,
             * in order to improve the jpeg quality */
            if self.quality_id + 1 == QUALITY_SAMPLE_NUM
                || self.quality_id >= self.quality_eval_data.max_quality_id
                || self.sampled(self.quality_id + 1)
            {
                /* best quality reached, or the next better quality was
                 * already evaluated and failed the fps thresholds */
                self.complete_sample();
            } else if self.quality_id == QUALITY_SAMPLE_NUM / 2
                && fps < IMPROVE_QUALITY_FPS_STRICT_TH
                && fps < src_fps
            {
                self.complete_sample();
            } else {
                self.quality_id += 1;
            }
        } else {
            // very small frame rate, try to improve by downgrading the quality
            if self.quality_id == 0 || self.quality_id <= self.quality_eval_data.min_quality_id {
                self.complete_sample();
            } else if self.sampled(self.quality_id - 1) {
                self.quality_id -= 1;
                self.complete_sample();
            } else {
                self.quality_id -= 1;
            }
        }
    }

    fn complete_sample(&mut self) {
        let quality_eval = &self.quality_eval_data;
        let final_quality_id = if quality_eval.max_sampled_fps != 0 {
            /* covers rounds where monotonicity was violated and a better
             * jpeg quality compressed to a better frame rate */
            self.quality_id.max(quality_eval.max_sampled_fps_quality_id)
        } else {
            self.quality_id
        };
        let final_enc_size = quality_eval.encoded_size_by_quality[final_quality_id];
        let mut final_fps = max_fps_for_size(final_enc_size, self.byte_rate);
        if final_quality_id == quality_eval.min_quality_id {
            final_fps = final_fps.max(quality_eval.min_quality_fps);
        }
        if final_quality_id == quality_eval.max_quality_id {
            final_fps = final_fps.min(quality_eval.max_quality_fps);
        }

        self.reset_quality(final_quality_id, final_fps, final_enc_size);
        self.sum_recent_enc_size = final_enc_size;
        self.num_recent_enc_frames = 1;

        log::debug!(
            "quality sample end: quality {} fps {}",
            QUALITY_SAMPLES[self.quality_id],
            self.fps
        );
    }

    fn quality_eval_set_upgrade(
        &mut self,
        reason: EvalReason,
        min_quality_id: usize,
        min_quality_fps: u32,
    ) {
        self.during_quality_eval = true;
        let quality_eval = &mut self.quality_eval_data;
        quality_eval.kind = EvalType::Upgrade;
        quality_eval.reason = reason;
        quality_eval.min_quality_id = min_quality_id;
        quality_eval.min_quality_fps = min_quality_fps;
    }

    fn quality_eval_set_downgrade(
        &mut self,
        reason: EvalReason,
        max_quality_id: usize,
        max_quality_fps: u32,
    ) {
        self.during_quality_eval = true;
        let quality_eval = &mut self.quality_eval_data;
        quality_eval.kind = EvalType::Downgrade;
        quality_eval.reason = reason;
        quality_eval.max_quality_id = max_quality_id;
        quality_eval.max_quality_fps = max_quality_fps;
    }

    /// Re-evaluates the operating point once per accepted frame, before
    /// encoding. Outside an evaluation round, a significant shift of the
    /// recent average frame size against the byte rate arms a new round.
    fn adjust_params_to_bit_rate(&mut self) {
        if self.last_enc_size == 0 {
            log::debug!("missing sample size");
            return;
        }

        if self.during_quality_eval {
            self.quality_eval_data.encoded_size_by_quality[self.quality_id] = self.last_enc_size;
            self.eval_quality();
            return;
        }

        if self.num_recent_enc_frames == 0 {
            log::debug!("no recent encoded frames");
            return;
        }

        let mut new_avg_enc_size = 0;
        if !(self.num_recent_enc_frames < AVERAGE_SIZE_WINDOW
            && self.num_recent_enc_frames < self.fps)
        {
            new_avg_enc_size = self.sum_recent_enc_size / self.num_recent_enc_frames as u64;
            let new_fps = max_fps_for_size(new_avg_enc_size, self.byte_rate);
            log::debug!(
                "cur-fps={} new-fps={} bit-rate={:.2} (Mbps) quality={} new-size-avg={} base-size={}",
                self.fps,
                new_fps,
                (self.byte_rate * 8) as f64 / 1024.0 / 1024.0,
                QUALITY_SAMPLES[self.quality_id],
                new_avg_enc_size,
                self.base_enc_size
            );

            let src_fps = self.source_fps();

            /* The ratio between new_fps and the current fps reflects the
             * changes in frame size; past a threshold, the quality and
             * frame rate are re-evaluated. */
            if new_fps > self.fps && (self.fps < src_fps || self.quality_id < QUALITY_SAMPLE_NUM - 1)
            {
                log::debug!("fps change >>: re-evaluating params");
                /* fps has improved, don't allow the quality to deteriorate */
                self.quality_eval_set_upgrade(EvalReason::SizeChange, self.quality_id, self.fps);
            } else if new_fps < self.fps && new_fps < src_fps {
                log::debug!("fps change <<: re-evaluating params");
                self.quality_eval_set_downgrade(EvalReason::SizeChange, self.quality_id, self.fps);
            }
        }

        if self.during_quality_eval {
            self.quality_eval_data.encoded_size_by_quality[self.quality_id] = new_avg_enc_size;
            self.eval_quality();
        } else {
            self.process_server_drops();
        }
    }

    /* The actual frame distribution does not necessarily admit one frame
     * every 1000/fps milliseconds. To keep the average close to the
     * defined fps, the measured average feeds back into adjusted_fps,
     * and 1000/adjusted_fps is the interval the admission gate uses. */
    fn adjust_fps(&mut self, now: u64) {
        let time_passed_ms = (now - self.adjusted_fps_start_time) / NSEC_PER_MILLISEC;

        if !self.during_quality_eval
            && time_passed_ms > ADJUST_FPS_TIMEOUT
            && time_passed_ms as f64 > MSEC_PER_SEC as f64 / self.adjusted_fps
        {
            let avg_fps =
                (self.adjusted_fps_num_frames * MSEC_PER_SEC) as f64 / time_passed_ms as f64;
            log::debug!(
                "#frames-adjust={} #adjust-time={} avg-fps={:.2} defined={} old-adjusted={:.2}",
                self.adjusted_fps_num_frames,
                time_passed_ms,
                avg_fps,
                self.fps,
                self.adjusted_fps
            );
            let fps_ratio = avg_fps / self.fps as f64;
            if avg_fps + 0.5 < self.fps as f64 && (self.source_fps() as f64) > avg_fps {
                let new_adjusted_fps = if avg_fps != 0.0 {
                    self.adjusted_fps / fps_ratio
                } else {
                    self.adjusted_fps * 2.0
                };
                self.adjusted_fps = new_adjusted_fps.min((self.fps * 2) as f64);
                log::debug!("new-adjusted-fps={:.2}", self.adjusted_fps);
            } else if (self.fps as f64) + 0.5 < avg_fps {
                let new_adjusted_fps = self.adjusted_fps / fps_ratio;
                self.adjusted_fps = new_adjusted_fps.max(self.fps as f64);
                log::debug!("new-adjusted-fps={:.2}", self.adjusted_fps);
            }
            self.adjusted_fps_start_time = now;
            self.adjusted_fps_num_frames = 0;
        }
    }

    /// Admission gate plus per-frame parameter update. Returns false
    /// when the candidate frame should be dropped; this is the only path
    /// that drops frames.
    pub fn admit_frame(&mut self, frame_mm_time: u32) -> bool {
        let now = self.now_ns();

        if self.adjusted_fps_start_time == 0 {
            self.adjusted_fps_start_time = now;
        }
        self.adjust_fps(now);

        let interval = now - self.bit_rate_info.last_frame_time;
        if (interval as f64) < NSEC_PER_SEC as f64 / self.adjusted_fps {
            return false;
        }

        self.adjust_params_to_bit_rate();

        if !self.during_quality_eval || self.quality_eval_data.reason == EvalReason::SizeChange {
            if self.bit_rate_info.change_start_time == 0 {
                self.bit_rate_info.change_start_time = now;
                self.bit_rate_info.change_start_mm_time = frame_mm_time;
            }
            self.bit_rate_info.last_frame_time = now;
        }
        true
    }

    /// Bookkeeping for a successfully encoded frame.
    pub fn frame_encoded(&mut self, enc_size: u64) {
        self.last_enc_size = enc_size;
        self.server_state.num_frames_encoded += 1;

        if !self.during_quality_eval || self.quality_eval_data.reason == EvalReason::SizeChange {
            if !self.during_quality_eval {
                if self.num_recent_enc_frames >= AVERAGE_SIZE_WINDOW {
                    self.num_recent_enc_frames = 0;
                    self.sum_recent_enc_size = 0;
                }
                self.sum_recent_enc_size += enc_size;
                self.num_recent_enc_frames += 1;
                self.adjusted_fps_num_frames += 1;
            }
            self.bit_rate_info.sum_enc_size += enc_size;
            self.bit_rate_info.num_enc_frames += 1;
        }
    }

    /// The codec ran out of output space mid-frame; the frame was
    /// abandoned and must not feed the estimators.
    pub fn frame_aborted(&mut self) {
        self.last_enc_size = 0;
    }

    /// Cancels an active evaluation round, restoring a conservative
    /// operating point from the round's bounds.
    fn quality_eval_stop(&mut self) {
        if !self.during_quality_eval {
            return;
        }
        let (quality_id, fps) = match self.quality_eval_data.kind {
            EvalType::Upgrade => (
                self.quality_eval_data.min_quality_id,
                self.quality_eval_data.min_quality_fps,
            ),
            EvalType::Downgrade => (
                self.quality_eval_data.max_quality_id,
                self.quality_eval_data.max_quality_fps,
            ),
            EvalType::Set => (QUALITY_SAMPLE_NUM / 2, MAX_FPS / 2),
        };
        self.reset_quality(quality_id, fps, 0);
        log::debug!(
            "canceling quality evaluation: reset quality to {} fps {}",
            QUALITY_SAMPLES[self.quality_id],
            self.fps
        );
    }

    fn decrease_bit_rate(&mut self) {
        self.quality_eval_stop();

        self.client_state = ClientState::default();
        if self.warmup_start_time != 0 {
            let now = self.now_ns();
            if now - self.warmup_start_time < WARMUP_TIME {
                log::debug!("during warmup, ignoring");
                return;
            }
            self.warmup_start_time = 0;
        }

        let measured_byte_rate;
        let mut decrease_size;
        if self.bit_rate_info.num_enc_frames >= BIT_RATE_EVAL_MIN_NUM_FRAMES.max(self.fps) {
            let duration_sec = (self.bit_rate_info.last_frame_time
                - self.bit_rate_info.change_start_time) as f64
                / NSEC_PER_SEC as f64;
            measured_byte_rate = (self.bit_rate_info.sum_enc_size as f64 / duration_sec) as u64;
            decrease_size =
                self.bit_rate_info.sum_enc_size / self.bit_rate_info.num_enc_frames as u64;
            log::debug!(
                "bit rate estimation {:.2} (Mbps)",
                (measured_byte_rate * 8) as f64 / 1024.0 / 1024.0
            );
        } else {
            measured_byte_rate = self.byte_rate;
            decrease_size = measured_byte_rate / self.fps as u64;
            log::debug!(
                "bit rate not re-estimated {:.2} (Mbps) fps {}",
                (measured_byte_rate * 8) as f64 / 1024.0 / 1024.0,
                self.fps
            );
        }

        let measured_byte_rate = measured_byte_rate.min(self.byte_rate);
        if decrease_size >= measured_byte_rate {
            decrease_size = measured_byte_rate / 2;
        }

        self.byte_rate = measured_byte_rate - decrease_size;
        self.bit_rate_info = BitRateInfo::default();

        log::info!(
            "decrease bit rate {:.2} (Mbps)",
            (self.byte_rate * 8) as f64 / 1024.0 / 1024.0
        );
        self.quality_eval_set_downgrade(EvalReason::RateChange, self.quality_id, self.fps);
    }

    fn increase_bit_rate(&mut self) {
        if self.bit_rate_info.num_enc_frames < BIT_RATE_EVAL_MIN_NUM_FRAMES.max(self.fps) {
            log::debug!("not enough samples for measuring the bit rate, no change");
            return;
        }

        let duration_sec = (self.bit_rate_info.last_frame_time
            - self.bit_rate_info.change_start_time) as f64
            / NSEC_PER_SEC as f64;
        let measured_byte_rate = (self.bit_rate_info.sum_enc_size as f64 / duration_sec) as u64;
        let avg_frame_size =
            self.bit_rate_info.sum_enc_size / self.bit_rate_info.num_enc_frames as u64;
        log::debug!(
            "bit rate estimation {:.2} (Mbps) defined {:.2} avg-frame-size={:.2} (KB)",
            (measured_byte_rate * 8) as f64 / 1024.0 / 1024.0,
            (self.byte_rate * 8) as f64 / 1024.0 / 1024.0,
            avg_frame_size as f64 / 1024.0
        );
        let increase_size = avg_frame_size;

        self.quality_eval_stop();

        if measured_byte_rate + increase_size < self.byte_rate {
            log::debug!("measured byte rate is small: not upgrading, just re-evaluating");
        } else {
            self.byte_rate = measured_byte_rate.min(self.byte_rate) + increase_size;
        }

        self.bit_rate_info = BitRateInfo {
            was_upgraded: true,
            ..Default::default()
        };

        log::info!(
            "increase bit rate {:.2} (Mbps)",
            (self.byte_rate * 8) as f64 / 1024.0 / 1024.0
        );
        self.quality_eval_set_upgrade(EvalReason::RateChange, self.quality_id, self.fps);
    }

    fn handle_negative_report(&mut self, report_end_mm_time: u32) {
        let info = &self.bit_rate_info;
        if (info.change_start_mm_time > report_end_mm_time || info.change_start_mm_time == 0)
            && !info.was_upgraded
        {
            log::debug!("ignoring, a downgrade already occurred later than the report time");
            return;
        }
        self.decrease_bit_rate();
    }

    fn handle_positive_report(&mut self, report_start_mm_time: u32) {
        if self.during_quality_eval && self.quality_eval_data.reason == EvalReason::RateChange {
            log::debug!("during quality evaluation (rate change), ignoring report");
            return;
        }

        let timeout = if (self.fps > IMPROVE_QUALITY_FPS_STRICT_TH
            || self.fps >= self.source_fps())
            && self.quality_id > QUALITY_SAMPLE_NUM / 2
        {
            CLIENT_POSITIVE_REPORT_STRICT_TIMEOUT
        } else {
            CLIENT_POSITIVE_REPORT_TIMEOUT
        };

        let stable_client_mm_time =
            report_start_mm_time as i64 - self.bit_rate_info.change_start_mm_time as i64;

        if self.bit_rate_info.change_start_mm_time == 0 || stable_client_mm_time < timeout {
            /* the current settings have not proved stable yet */
            log::debug!(
                "no drops, but not enough time has passed for assessing playback stability"
            );
            return;
        }
        self.increase_bit_rate();
    }

    pub fn client_stream_report(&mut self, report: &ClientStreamReport) {
        log::debug!(
            "client report: #frames {} #drops {} duration {} video-delay {} audio-delay {}",
            report.num_frames,
            report.num_drops,
            report.end_frame_mm_time - report.start_frame_mm_time,
            report.end_frame_delay,
            report.audio_delay
        );

        if self.during_quality_eval
            && self.quality_eval_data.kind == EvalType::Downgrade
            && self.quality_eval_data.reason == EvalReason::RateChange
        {
            log::debug!("during rate downgrade evaluation");
            return;
        }

        let avg_enc_size = if self.num_recent_enc_frames != 0 {
            self.sum_recent_enc_size / self.num_recent_enc_frames as u64
        } else {
            0
        };
        let min_playback_delay =
            min_required_playback_delay(avg_enc_size, self.byte_rate, self.latency_ms());
        log::debug!(
            "min-delay {} client-delay {}",
            min_playback_delay,
            report.end_frame_delay
        );

        let mut is_video_delay_small = false;
        if (min_playback_delay as i64) > report.end_frame_delay as i64 {
            let src_fps = self.source_fps();
            /* at the highest rate, neither the real network bit rate nor
             * the min playback delay can be estimated */
            if self.quality_id != QUALITY_SAMPLE_NUM - 1
                || self.fps < src_fps.min(MAX_FPS)
                || report.end_frame_delay < 0
            {
                is_video_delay_small = true;
                if let Some(cb) = &self.cbs.update_client_playback_delay {
                    cb(min_playback_delay);
                }
            }
        }

        /* If the audio latency has decreased since the start of the
         * current sequence of positive reports while the video latency
         * is bigger, slow down the video rate. */
        if report.end_frame_delay > 0
            && (report.audio_delay as f64)
                < PLAYBACK_LATENCY_DECREASE_FACTOR * self.client_state.max_audio_latency as f64
            && report.end_frame_delay as f64
                > VIDEO_VS_AUDIO_LATENCY_FACTOR * report.audio_delay as f64
        {
            log::debug!(
                "video latency >> audio latency && audio latency << max ({})",
                self.client_state.max_audio_latency
            );
            self.handle_negative_report(report.end_frame_mm_time);
            return;
        }

        if report.end_frame_delay < VIDEO_DELAY_TH {
            self.handle_negative_report(report.end_frame_mm_time);
        } else {
            self.client_state.max_video_latency =
                self.client_state.max_video_latency.max(report.end_frame_delay);
            self.client_state.max_audio_latency =
                self.client_state.max_audio_latency.max(report.audio_delay);

            let medium_delay_thresh =
                self.client_state.max_video_latency as f64 * PLAYBACK_LATENCY_DECREASE_FACTOR;
            let major_delay_thresh = medium_delay_thresh * PLAYBACK_LATENCY_DECREASE_FACTOR;

            /* The latency is judged too low only against the maximum
             * observed since the last bit rate decrement; a decrease
             * since then suggests the stream bit rate is too high. */
            if ((report.end_frame_delay as f64) < medium_delay_thresh && is_video_delay_small)
                || (report.end_frame_delay as f64) < major_delay_thresh
            {
                log::debug!(
                    "downgrade due to short video delay (last={} past-max={})",
                    report.end_frame_delay,
                    self.client_state.max_video_latency
                );
                self.handle_negative_report(report.end_frame_mm_time);
            } else if report.num_drops == 0 {
                self.handle_positive_report(report.start_frame_mm_time);
            }
        }
    }

    pub fn notify_server_frame_drop(&mut self) {
        self.server_state.num_frames_dropped += 1;
        self.process_server_drops();
    }

    /* Decrease the bit rate when the server-side drop rate exceeds the
     * threshold over roughly one second's worth of frames. */
    fn process_server_drops(&mut self) {
        let fps = self.fps.min(self.source_fps());
        if self.server_state.num_frames_encoded < fps * SERVER_STATUS_EVAL_FPS_INTERVAL {
            return;
        }

        let num_frames_total =
            self.server_state.num_frames_dropped + self.server_state.num_frames_encoded;
        let drop_factor = self.server_state.num_frames_dropped as f64 / num_frames_total as f64;

        log::debug!(
            "#drops {} total {} fps {} src-fps {}",
            self.server_state.num_frames_dropped,
            num_frames_total,
            self.fps,
            self.source_fps()
        );

        if drop_factor > SERVER_DOWNGRADE_DROP_FACTOR_TH {
            self.decrease_bit_rate();
        }
        self.server_state = ServerState::default();
    }
}

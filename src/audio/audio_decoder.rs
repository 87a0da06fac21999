//! Decoder backends behind a uniform pull interface.
//!
//! `PcmFrameSource` is the stable vtable the device reads the active slot
//! through. `SymphoniaDecoder` implements it for every supported format and
//! buffers leftover PCM between decode calls; `DeviceAdaptedSource` wraps a
//! source and converts sample rate and channel layout to the output device.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};

use audio_mixer::{Channel as MixChannel, Mixer};
use log::{debug, error, warn};
use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{CodecParameters, Decoder, DecoderOptions};
use symphonia::core::errors::Error;
use symphonia::core::formats::{FormatOptions, FormatReader, SeekMode, SeekTo};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

/// Codec-defined preroll re-armed after every seek, matching the 80 ms
/// Opus convention at 48 kHz.
const SEEK_PREROLL_MS: u64 = 80;
const MAX_CONSECUTIVE_DECODE_ERRORS: u32 = 50;

/// Uniform pull interface over format-specific decoders.
///
/// Frame counts are per-channel sample groups; buffers are interleaved f32.
pub trait PcmFrameSource: Send {
    /// Short container/codec label, e.g. `FLAC`.
    fn format_name(&self) -> &str;
    fn channels(&self) -> u16;
    fn sample_rate(&self) -> u32;
    /// Reads up to `out.len() / channels` frames; returns frames produced.
    /// Zero frames means end of stream.
    fn read_frames(&mut self, out: &mut [f32]) -> Result<usize, String>;
    /// Seeks to an absolute PCM frame index.
    fn seek(&mut self, frame: u64) -> Result<(), String>;
    /// Current position in PCM frames.
    fn tell(&self) -> u64;
    /// Total length in PCM frames when the container declares it.
    fn length(&self) -> Option<u64>;
}

/// Symphonia-backed decoder with a leftover ring between decode calls.
pub struct SymphoniaDecoder {
    path: PathBuf,
    format_label: String,
    format_reader: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    codec_params: CodecParameters,
    source_track_id: u32,
    sample_rate: u32,
    channel_count: u16,
    total_frames: Option<u64>,
    /// Interleaved samples produced by a decode call but not yet consumed.
    leftover: VecDeque<f32>,
    position_frames: u64,
    /// Leading frames to discard after open (codec delay / Opus pre-skip).
    pre_skip_frames: u64,
    pre_skip_remaining: u64,
    input_exhausted: bool,
    consecutive_decode_errors: u32,
}

impl SymphoniaDecoder {
    pub fn open(path: &Path) -> Result<SymphoniaDecoder, String> {
        let mut hint = Hint::new();
        if let Some(extension) = path.extension().and_then(|ext| ext.to_str()) {
            hint.with_extension(extension);
        }
        let file = std::fs::File::open(path)
            .map_err(|err| format!("Failed to open file {}: {}", path.display(), err))?;
        let media_source = MediaSourceStream::new(Box::new(file), Default::default());

        let probed = symphonia::default::get_probe()
            .format(
                &hint,
                media_source,
                &FormatOptions::default(),
                &MetadataOptions::default(),
            )
            .map_err(|err| format!("Failed to probe {}: {}", path.display(), err))?;
        let format_reader = probed.format;

        let (source_track_id, codec_params) = {
            let track = format_reader
                .default_track()
                .ok_or_else(|| format!("No default track in {}", path.display()))?;
            (track.id, track.codec_params.clone())
        };

        let sample_rate = codec_params.sample_rate.unwrap_or(44_100);
        let channel_count = codec_params
            .channels
            .map(|channels| channels.count() as u16)
            .unwrap_or(2);
        if channel_count == 0 {
            return Err(format!("Unsupported channel count 0 in {}", path.display()));
        }

        let decoder = symphonia::default::get_codecs()
            .make(&codec_params, &DecoderOptions::default())
            .map_err(|err| format!("Failed to create decoder for {}: {}", path.display(), err))?;

        let pre_skip_frames = u64::from(codec_params.delay.unwrap_or(0));
        let total_frames = codec_params_total_frames(&codec_params);
        let format_label = path
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or("AUDIO")
            .to_uppercase();

        debug!(
            "SymphoniaDecoder: opened {} sr={} channels={} pre_skip={}",
            path.display(),
            sample_rate,
            channel_count,
            pre_skip_frames
        );

        Ok(SymphoniaDecoder {
            path: path.to_path_buf(),
            format_label,
            format_reader,
            decoder,
            codec_params,
            source_track_id,
            sample_rate,
            channel_count,
            total_frames,
            leftover: VecDeque::new(),
            position_frames: 0,
            pre_skip_frames,
            pre_skip_remaining: pre_skip_frames,
            input_exhausted: false,
            consecutive_decode_errors: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Duration in seconds when the container declares a frame count.
    pub fn duration_seconds(&self) -> f64 {
        match self.length() {
            Some(frames) if self.sample_rate > 0 => frames as f64 / f64::from(self.sample_rate),
            _ => 0.0,
        }
    }

    /// Decodes one packet into the leftover ring. Returns `false` when the
    /// input is exhausted and nothing further will be produced.
    fn decode_one_packet(&mut self) -> Result<bool, String> {
        if self.input_exhausted {
            return Ok(false);
        }

        let packet = match self.format_reader.next_packet() {
            Ok(packet) => packet,
            Err(Error::IoError(_)) => {
                self.input_exhausted = true;
                return Ok(false);
            }
            Err(err) => {
                debug!(
                    "SymphoniaDecoder: end of stream or packet read failure: {}",
                    err
                );
                self.input_exhausted = true;
                return Ok(false);
            }
        };
        if packet.track_id() != self.source_track_id {
            return Ok(true);
        }

        match self.decoder.decode(&packet) {
            Ok(decoded) => {
                self.consecutive_decode_errors = 0;
                let spec = decoded.spec();
                let mut sample_buffer = SampleBuffer::<f32>::new(decoded.capacity() as u64, *spec);
                sample_buffer.copy_interleaved_ref(decoded);
                let channels = usize::from(self.channel_count.max(1));
                let mut samples = sample_buffer.samples();

                // Discard codec-delay frames before yielding PCM.
                if self.pre_skip_remaining > 0 {
                    let frames_available = (samples.len() / channels) as u64;
                    let discard_frames = self.pre_skip_remaining.min(frames_available);
                    samples = &samples[(discard_frames as usize) * channels..];
                    self.pre_skip_remaining -= discard_frames;
                }

                self.leftover.extend(samples.iter().copied());
                Ok(true)
            }
            Err(Error::DecodeError(message)) => {
                warn!("Decode error (skipping frame): {}", message);
                self.consecutive_decode_errors += 1;
                if self.consecutive_decode_errors > MAX_CONSECUTIVE_DECODE_ERRORS {
                    error!("Too many consecutive decode errors. Giving up on track.");
                    self.input_exhausted = true;
                    return Ok(false);
                }
                Ok(true)
            }
            Err(Error::ResetRequired) => {
                debug!("SymphoniaDecoder: reset required, re-creating decoder");
                self.decoder = symphonia::default::get_codecs()
                    .make(&self.codec_params, &DecoderOptions::default())
                    .map_err(|err| format!("Failed to re-create decoder: {}", err))?;
                self.consecutive_decode_errors = 0;
                Ok(true)
            }
            Err(err) => Err(format!("Fatal decode error: {}", err)),
        }
    }
}

fn codec_params_total_frames(codec_params: &CodecParameters) -> Option<u64> {
    codec_params.n_frames
}

impl PcmFrameSource for SymphoniaDecoder {
    fn format_name(&self) -> &str {
        &self.format_label
    }

    fn channels(&self) -> u16 {
        self.channel_count
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn read_frames(&mut self, out: &mut [f32]) -> Result<usize, String> {
        let channels = usize::from(self.channel_count.max(1));
        let wanted_samples = (out.len() / channels) * channels;
        if wanted_samples == 0 {
            return Ok(0);
        }

        while self.leftover.len() < wanted_samples {
            if !self.decode_one_packet()? {
                break;
            }
        }

        let available = self.leftover.len().min(wanted_samples);
        let produced_samples = available - (available % channels);
        for slot in out.iter_mut().take(produced_samples) {
            *slot = self.leftover.pop_front().expect("leftover sample present");
        }

        let produced_frames = produced_samples / channels;
        self.position_frames += produced_frames as u64;
        Ok(produced_frames)
    }

    fn seek(&mut self, frame: u64) -> Result<(), String> {
        let sample_rate = u64::from(self.sample_rate.max(1));
        let seconds = frame / sample_rate;
        let frac = (frame % sample_rate) as f64 / sample_rate as f64;

        self.format_reader
            .seek(
                SeekMode::Accurate,
                SeekTo::Time {
                    time: symphonia::core::units::Time { seconds, frac },
                    track_id: Some(self.source_track_id),
                },
            )
            .map_err(|err| format!("Seek failed: {}", err))?;
        self.decoder.reset();
        self.leftover.clear();
        self.input_exhausted = false;
        self.consecutive_decode_errors = 0;
        self.position_frames = frame;
        // Codecs with delay need a preroll discard after any seek.
        if self.pre_skip_frames > 0 {
            self.pre_skip_remaining = SEEK_PREROLL_MS * u64::from(self.sample_rate) / 1_000;
        }
        Ok(())
    }

    fn tell(&self) -> u64 {
        self.position_frames
    }

    fn length(&self) -> Option<u64> {
        self.total_frames
    }
}

/// Remaps interleaved samples between channel layouts without mixing.
fn channel_map_channels(samples: &[f32], source_channels: usize, target_channels: usize) -> Vec<f32> {
    if source_channels == 0 || target_channels == 0 {
        return Vec::new();
    }
    if source_channels == target_channels {
        return samples.to_vec();
    }

    let frame_count = samples.len() / source_channels;
    let mut remapped = Vec::with_capacity(frame_count * target_channels);
    for frame_index in 0..frame_count {
        let frame = &samples[frame_index * source_channels..(frame_index + 1) * source_channels];
        for out_channel in 0..target_channels {
            let sample = if target_channels == 1 {
                frame.iter().copied().sum::<f32>() / source_channels as f32
            } else if source_channels == 1 {
                frame[0]
            } else if out_channel < source_channels {
                frame[out_channel]
            } else {
                frame[out_channel % source_channels]
            };
            remapped.push(sample);
        }
    }
    remapped
}

fn channel_layout_for_count(channel_count: usize) -> Vec<MixChannel> {
    match channel_count {
        0 => Vec::new(),
        1 => vec![MixChannel::FrontCenter],
        2 => vec![MixChannel::FrontLeft, MixChannel::FrontRight],
        3 => vec![
            MixChannel::FrontLeft,
            MixChannel::FrontRight,
            MixChannel::FrontCenter,
        ],
        4 => vec![
            MixChannel::FrontLeft,
            MixChannel::FrontRight,
            MixChannel::BackLeft,
            MixChannel::BackRight,
        ],
        5 => vec![
            MixChannel::FrontLeft,
            MixChannel::FrontRight,
            MixChannel::FrontCenter,
            MixChannel::BackLeft,
            MixChannel::BackRight,
        ],
        6 => vec![
            MixChannel::FrontLeft,
            MixChannel::FrontRight,
            MixChannel::FrontCenter,
            MixChannel::LowFrequency,
            MixChannel::BackLeft,
            MixChannel::BackRight,
        ],
        7 => vec![
            MixChannel::FrontLeft,
            MixChannel::FrontRight,
            MixChannel::FrontCenter,
            MixChannel::LowFrequency,
            MixChannel::BackLeft,
            MixChannel::BackRight,
            MixChannel::BackCenter,
        ],
        8 => vec![
            MixChannel::FrontLeft,
            MixChannel::FrontRight,
            MixChannel::FrontCenter,
            MixChannel::LowFrequency,
            MixChannel::BackLeft,
            MixChannel::BackRight,
            MixChannel::SideLeft,
            MixChannel::SideRight,
        ],
        _ => {
            let mut layout = channel_layout_for_count(8);
            layout.resize(channel_count, MixChannel::Discrete);
            layout
        }
    }
}

fn deinterleave(samples: &[f32], channels: usize) -> Vec<Vec<f32>> {
    let mut deinterleaved = vec![vec![]; channels];
    for (index, sample) in samples.iter().enumerate() {
        deinterleaved[index % channels].push(*sample);
    }
    deinterleaved
}

fn interleave(samples: &[Vec<f32>]) -> Vec<f32> {
    if samples.is_empty() {
        return Vec::new();
    }
    let mut interleaved = Vec::new();
    for frame_index in 0..samples[0].len() {
        for channel in samples {
            interleaved.push(channel[frame_index]);
        }
    }
    interleaved
}

/// Adapts a source to the output device's sample rate and channel count.
pub struct DeviceAdaptedSource {
    source: Box<dyn PcmFrameSource>,
    device_sample_rate: u32,
    device_channels: u16,
    resampler: Option<SincFixedIn<f32>>,
    resampler_flushed: bool,
    /// Converted samples ready for the device, interleaved.
    converted: VecDeque<f32>,
    downmix_mixers: HashMap<(usize, usize), Mixer<f32>>,
}

impl DeviceAdaptedSource {
    pub fn new(
        source: Box<dyn PcmFrameSource>,
        device_sample_rate: u32,
        device_channels: u16,
    ) -> DeviceAdaptedSource {
        DeviceAdaptedSource {
            source,
            device_sample_rate,
            device_channels,
            resampler: None,
            resampler_flushed: false,
            converted: VecDeque::new(),
            downmix_mixers: HashMap::new(),
        }
    }

    pub fn source(&self) -> &dyn PcmFrameSource {
        self.source.as_ref()
    }

    pub fn source_mut(&mut self) -> &mut dyn PcmFrameSource {
        self.source.as_mut()
    }

    fn needs_resampling(&self) -> bool {
        self.source.sample_rate() != self.device_sample_rate
    }

    fn create_resampler(&self, chunk_size: usize) -> Result<SincFixedIn<f32>, String> {
        let params = SincInterpolationParameters {
            sinc_len: 256,
            f_cutoff: 0.95,
            interpolation: SincInterpolationType::Linear,
            oversampling_factor: 256,
            window: WindowFunction::BlackmanHarris2,
        };
        SincFixedIn::<f32>::new(
            f64::from(self.device_sample_rate) / f64::from(self.source.sample_rate()),
            2.0,
            params,
            chunk_size,
            usize::from(self.device_channels.max(1)),
        )
        .map_err(|err| format!("Failed to create resampler: {}", err))
    }

    fn downmix_or_map(&mut self, samples: &[f32]) -> Vec<f32> {
        let source_channels = usize::from(self.source.channels().max(1));
        let target_channels = usize::from(self.device_channels.max(1));
        if source_channels <= target_channels {
            return channel_map_channels(samples, source_channels, target_channels);
        }

        let mixer = self
            .downmix_mixers
            .entry((source_channels, target_channels))
            .or_insert_with(|| {
                Mixer::<f32>::new(
                    &channel_layout_for_count(source_channels),
                    &channel_layout_for_count(target_channels),
                )
            });
        let mut downmixed = Vec::with_capacity(samples.len() / source_channels * target_channels);
        let mut output_frame = vec![0.0f32; target_channels];
        for input_frame in samples.chunks_exact(source_channels) {
            mixer.mix(input_frame, &mut output_frame);
            downmixed.extend_from_slice(&output_frame);
        }
        downmixed
    }

    /// Pulls one chunk from the source through channel transform and
    /// resampling into `converted`. Returns `false` when nothing further
    /// will be produced.
    fn produce_chunk(&mut self) -> Result<bool, String> {
        let source_channels = usize::from(self.source.channels().max(1));
        let device_channels = usize::from(self.device_channels.max(1));

        if self.needs_resampling() && self.resampler.is_none() {
            self.resampler = Some(self.create_resampler(2048)?);
            self.resampler_flushed = false;
        }

        let chunk_frames = self
            .resampler
            .as_ref()
            .map(|resampler| resampler.input_frames_next())
            .unwrap_or(2048);

        let mut source_buffer = vec![0.0f32; chunk_frames * source_channels];
        let produced_frames = self.source.read_frames(&mut source_buffer)?;
        source_buffer.truncate(produced_frames * source_channels);

        if produced_frames == 0 {
            // Flush the resampler tail exactly once at end of stream.
            if let Some(resampler) = self.resampler.as_mut() {
                if !self.resampler_flushed {
                    self.resampler_flushed = true;
                    match resampler.process_partial::<&[f32]>(None, None) {
                        Ok(flushed) => {
                            self.converted.extend(interleave(&flushed));
                            return Ok(!self.converted.is_empty());
                        }
                        Err(err) => warn!("DeviceAdaptedSource: resampler flush failed: {}", err),
                    }
                }
            }
            return Ok(false);
        }

        let transformed = self.downmix_or_map(&source_buffer);
        if let Some(resampler) = self.resampler.as_mut() {
            let deinterleaved = deinterleave(&transformed, device_channels);
            let resampled = if deinterleaved[0].len() == chunk_frames {
                resampler.process(&deinterleaved, None)
            } else {
                resampler.process_partial(Some(&deinterleaved), None)
            };
            match resampled {
                Ok(waves) => self.converted.extend(interleave(&waves)),
                Err(err) => {
                    warn!("DeviceAdaptedSource: resample failed: {}", err);
                    self.converted.extend(transformed);
                }
            }
        } else {
            self.converted.extend(transformed);
        }
        Ok(true)
    }

    /// Reads device-format frames; zero frames signals end of stream.
    pub fn read_device_frames(&mut self, out: &mut [f32]) -> Result<usize, String> {
        let device_channels = usize::from(self.device_channels.max(1));
        let wanted_samples = (out.len() / device_channels) * device_channels;
        if wanted_samples == 0 {
            return Ok(0);
        }

        while self.converted.len() < wanted_samples {
            if !self.produce_chunk()? {
                break;
            }
        }

        let available = self.converted.len().min(wanted_samples);
        let produced_samples = available - (available % device_channels);
        for slot in out.iter_mut().take(produced_samples) {
            *slot = self.converted.pop_front().expect("converted sample present");
        }
        Ok(produced_samples / device_channels)
    }

    /// Seeks the wrapped source, discarding any converted backlog.
    pub fn seek(&mut self, frame: u64) -> Result<(), String> {
        self.source.seek(frame)?;
        self.converted.clear();
        self.resampler = None;
        self.resampler_flushed = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{
        channel_map_channels, deinterleave, interleave, DeviceAdaptedSource, PcmFrameSource,
    };

    /// Deterministic ramp source used in place of a real decoder.
    struct RampSource {
        channels: u16,
        sample_rate: u32,
        position: u64,
        total_frames: u64,
    }

    impl RampSource {
        fn new(channels: u16, sample_rate: u32, total_frames: u64) -> RampSource {
            RampSource {
                channels,
                sample_rate,
                position: 0,
                total_frames,
            }
        }
    }

    impl PcmFrameSource for RampSource {
        fn format_name(&self) -> &str {
            "RAMP"
        }

        fn channels(&self) -> u16 {
            self.channels
        }

        fn sample_rate(&self) -> u32 {
            self.sample_rate
        }

        fn read_frames(&mut self, out: &mut [f32]) -> Result<usize, String> {
            let channels = usize::from(self.channels);
            let wanted = out.len() / channels;
            let remaining = (self.total_frames - self.position) as usize;
            let produced = wanted.min(remaining);
            for frame in 0..produced {
                let value = (self.position + frame as u64) as f32;
                for channel in 0..channels {
                    out[frame * channels + channel] = value;
                }
            }
            self.position += produced as u64;
            Ok(produced)
        }

        fn seek(&mut self, frame: u64) -> Result<(), String> {
            self.position = frame.min(self.total_frames);
            Ok(())
        }

        fn tell(&self) -> u64 {
            self.position
        }

        fn length(&self) -> Option<u64> {
            Some(self.total_frames)
        }
    }

    #[test]
    fn test_channel_map_duplicates_mono_into_stereo() {
        let remapped = channel_map_channels(&[0.25, 0.5], 1, 2);
        assert_eq!(remapped, vec![0.25, 0.25, 0.5, 0.5]);
    }

    #[test]
    fn test_channel_map_averages_into_mono() {
        let remapped = channel_map_channels(&[0.2, 0.4], 2, 1);
        assert_eq!(remapped.len(), 1);
        assert!((remapped[0] - 0.3).abs() < 1e-6);
    }

    #[test]
    fn test_interleave_round_trips_deinterleave() {
        let original = vec![0.1, 0.2, 0.3, 0.4, 0.5, 0.6];
        let split = deinterleave(&original, 2);
        assert_eq!(interleave(&split), original);
    }

    #[test]
    fn test_adapted_source_passes_through_matching_formats() {
        let source = RampSource::new(2, 48_000, 100);
        let mut adapted = DeviceAdaptedSource::new(Box::new(source), 48_000, 2);

        let mut out = vec![0.0f32; 40];
        let frames = adapted.read_device_frames(&mut out).expect("read succeeds");
        assert_eq!(frames, 20);
        assert_eq!(out[0], 0.0);
        assert_eq!(out[2], 1.0);
        assert_eq!(out[38], 19.0);
    }

    #[test]
    fn test_adapted_source_signals_end_of_stream_with_zero_frames() {
        let source = RampSource::new(2, 48_000, 10);
        let mut adapted = DeviceAdaptedSource::new(Box::new(source), 48_000, 2);

        let mut out = vec![0.0f32; 64];
        let first = adapted.read_device_frames(&mut out).expect("read succeeds");
        assert_eq!(first, 10);
        let second = adapted.read_device_frames(&mut out).expect("read succeeds");
        assert_eq!(second, 0);
    }

    #[test]
    fn test_adapted_source_expands_mono_to_stereo_device() {
        let source = RampSource::new(1, 44_100, 8);
        let mut adapted = DeviceAdaptedSource::new(Box::new(source), 44_100, 2);

        let mut out = vec![0.0f32; 16];
        let frames = adapted.read_device_frames(&mut out).expect("read succeeds");
        assert_eq!(frames, 8);
        assert_eq!(out[0], out[1]);
        assert_eq!(out[14], out[15]);
    }

    #[test]
    fn test_adapted_source_resamples_to_device_rate() {
        let source = RampSource::new(2, 22_050, 22_050);
        let mut adapted = DeviceAdaptedSource::new(Box::new(source), 44_100, 2);

        let mut produced_frames = 0usize;
        let mut out = vec![0.0f32; 4096];
        loop {
            let frames = adapted.read_device_frames(&mut out).expect("read succeeds");
            if frames == 0 {
                break;
            }
            produced_frames += frames;
        }
        // One second of input should yield roughly one second at 44.1 kHz.
        assert!(
            (produced_frames as i64 - 44_100).unsigned_abs() < 4_410,
            "produced {} frames",
            produced_frames
        );
    }

    #[test]
    fn test_seek_discards_converted_backlog() {
        let source = RampSource::new(2, 48_000, 1_000);
        let mut adapted = DeviceAdaptedSource::new(Box::new(source), 48_000, 2);

        let mut out = vec![0.0f32; 64];
        let _ = adapted.read_device_frames(&mut out).expect("read succeeds");
        adapted.seek(500).expect("seek succeeds");
        assert_eq!(adapted.source().tell(), 500);

        let frames = adapted.read_device_frames(&mut out).expect("read succeeds");
        assert!(frames > 0);
        assert_eq!(out[0], 500.0);
    }
}

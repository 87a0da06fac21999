//! Audio output device and the dual decoder slots it reads from.
//!
//! The device callback is real-time constrained: it reads one atomic that
//! names the active slot and a per-slot `deleted` flag, and takes nothing
//! stronger than a `try_lock` on the slot contents. A deleted, unloaded, or
//! contended slot produces silence.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use log::{debug, error, warn};
use tokio::sync::broadcast::Sender;

use crate::audio::audio_decoder::DeviceAdaptedSource;
use crate::protocol::{Message, PlayerMessage, SlotId, SongData};

/// Contents of one decoder slot while a song is loaded into it.
pub struct SlotContent {
    pub track_id: u64,
    pub source: DeviceAdaptedSource,
    pub song: SongData,
}

/// One of the two decoder slots used for gapless streaming.
pub struct DecoderSlot {
    content: Mutex<Option<SlotContent>>,
    /// Teardown was requested while the device might still read the slot.
    deleted: AtomicBool,
    /// Nothing valid inside; the device must not read it.
    unloaded: AtomicBool,
}

impl DecoderSlot {
    fn new() -> DecoderSlot {
        DecoderSlot {
            content: Mutex::new(None),
            deleted: AtomicBool::new(false),
            unloaded: AtomicBool::new(true),
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::Acquire)
    }

    pub fn is_unloaded(&self) -> bool {
        self.unloaded.load(Ordering::Acquire)
    }

    pub fn mark_deleted(&self) {
        self.deleted.store(true, Ordering::Release);
    }

    /// Publishes a fully prepared decoder into the slot.
    pub fn publish(&self, content: SlotContent) {
        let mut guard = self.content.lock().expect("slot content lock poisoned");
        *guard = Some(content);
        self.deleted.store(false, Ordering::Release);
        self.unloaded.store(false, Ordering::Release);
    }

    /// Tears the slot down. Safe against the device callback because the
    /// `unloaded` flag is raised before the content is dropped and the
    /// callback only ever `try_lock`s.
    pub fn unload(&self) {
        self.unloaded.store(true, Ordering::Release);
        let mut guard = self.content.lock().expect("slot content lock poisoned");
        *guard = None;
        self.deleted.store(false, Ordering::Release);
    }

    pub fn lock_content(&self) -> MutexGuard<'_, Option<SlotContent>> {
        self.content.lock().expect("slot content lock poisoned")
    }

    pub fn loaded_track_id(&self) -> Option<u64> {
        if self.is_unloaded() {
            return None;
        }
        self.lock_content().as_ref().map(|content| content.track_id)
    }
}

/// Both decoder slots plus the atomic active pointer the device follows.
pub struct DecoderSlots {
    slot_a: DecoderSlot,
    slot_b: DecoderSlot,
    using_slot_a: AtomicBool,
    /// Set by the callback when the active slot ran dry, cleared by the
    /// EOF handler after rotation.
    eof_pending: AtomicBool,
}

impl DecoderSlots {
    pub fn new() -> DecoderSlots {
        DecoderSlots {
            slot_a: DecoderSlot::new(),
            slot_b: DecoderSlot::new(),
            using_slot_a: AtomicBool::new(true),
            eof_pending: AtomicBool::new(false),
        }
    }

    pub fn slot(&self, id: SlotId) -> &DecoderSlot {
        match id {
            SlotId::A => &self.slot_a,
            SlotId::B => &self.slot_b,
        }
    }

    pub fn active_id(&self) -> SlotId {
        if self.using_slot_a.load(Ordering::Acquire) {
            SlotId::A
        } else {
            SlotId::B
        }
    }

    pub fn inactive_id(&self) -> SlotId {
        self.active_id().other()
    }

    pub fn active_slot(&self) -> &DecoderSlot {
        self.slot(self.active_id())
    }

    pub fn set_active(&self, id: SlotId) {
        self.using_slot_a.store(id == SlotId::A, Ordering::Release);
    }

    /// Rotates the active pointer to the other slot.
    pub fn flip_active(&self) {
        self.set_active(self.inactive_id());
    }

    pub fn eof_pending(&self) -> bool {
        self.eof_pending.load(Ordering::Acquire)
    }

    pub fn set_eof_handled(&self) {
        self.eof_pending.store(false, Ordering::Release);
    }
}

impl Default for DecoderSlots {
    fn default() -> Self {
        Self::new()
    }
}

fn quantize_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * i16::MAX as f32)
        .round()
        .clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

fn quantize_u16(sample: f32) -> u16 {
    ((sample.clamp(-1.0, 1.0) * 0.5 + 0.5) * u16::MAX as f32)
        .round()
        .clamp(0.0, u16::MAX as f32) as u16
}

#[allow(clippy::too_many_arguments)]
fn render_output_buffer<T, F>(
    output_buffer: &mut [T],
    is_playing: &Arc<AtomicBool>,
    slots: &Arc<DecoderSlots>,
    volume: &Arc<AtomicU32>,
    bus_sender: &Sender<Message>,
    scratch: &mut Vec<f32>,
    mut convert_sample: F,
    silence_value: T,
) where
    T: Copy,
    F: FnMut(f32) -> T,
{
    output_buffer.fill(silence_value);
    if !is_playing.load(Ordering::Relaxed) {
        return;
    }

    let slot = slots.active_slot();
    if slot.is_deleted() || slot.is_unloaded() {
        return;
    }

    // The hot path takes nothing stronger than a trylock; a loader holding
    // the slot simply costs one buffer of silence.
    let Ok(mut guard) = slot.content.try_lock() else {
        return;
    };
    let Some(content) = guard.as_mut() else {
        return;
    };

    scratch.clear();
    scratch.resize(output_buffer.len(), 0.0);
    let gain = (volume.load(Ordering::Relaxed) as f32 / 100.0).clamp(0.0, 1.0);

    match content.source.read_device_frames(scratch) {
        Ok(0) => {
            if !slots.eof_pending.swap(true, Ordering::AcqRel) {
                let _ = bus_sender.send(Message::Player(PlayerMessage::EndOfSongReached));
            }
        }
        Ok(_frames) => {
            for (slot_out, sample) in output_buffer.iter_mut().zip(scratch.iter()) {
                *slot_out = convert_sample(*sample * gain);
            }
        }
        Err(err) => {
            warn!("AudioDevice: read from active slot failed: {}", err);
            if !slots.eof_pending.swap(true, Ordering::AcqRel) {
                let _ = bus_sender.send(Message::Player(PlayerMessage::EndOfSongReached));
            }
        }
    }
}

/// The single output device. Exclusively owned by the track manager; only
/// rotation code tears it down.
pub struct AudioDevice {
    stream: cpal::Stream,
    pub sample_rate_hz: u32,
    pub channel_count: u16,
}

impl AudioDevice {
    /// Probes the default output device's preferred format without opening a
    /// stream. Loaders use this to adapt decoders before the device exists.
    pub fn probe_default_format() -> Result<(u32, u16), String> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| "No output device available".to_string())?;
        let config = device
            .default_output_config()
            .map_err(|err| format!("Error getting device config: {}", err))?;
        Ok((config.sample_rate().0, config.channels()))
    }

    /// Opens the output stream and starts pulling from the active slot.
    pub fn open(
        slots: Arc<DecoderSlots>,
        is_playing: Arc<AtomicBool>,
        volume: Arc<AtomicU32>,
        bus_sender: Sender<Message>,
    ) -> Result<AudioDevice, String> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| "No output device available".to_string())?;
        let default_config = device
            .default_output_config()
            .map_err(|err| format!("Error getting device config: {}", err))?;
        let sample_format = default_config.sample_format();
        let stream_config: cpal::StreamConfig = default_config.config();
        let sample_rate_hz = stream_config.sample_rate.0;
        let channel_count = stream_config.channels;

        let error_callback = |err| error!("Audio stream error: {}", err);
        let stream_result = match sample_format {
            cpal::SampleFormat::F32 => {
                let mut scratch = Vec::new();
                device.build_output_stream(
                    &stream_config,
                    move |output_buffer: &mut [f32], _: &cpal::OutputCallbackInfo| {
                        render_output_buffer(
                            output_buffer,
                            &is_playing,
                            &slots,
                            &volume,
                            &bus_sender,
                            &mut scratch,
                            |sample| sample.clamp(-1.0, 1.0),
                            0.0,
                        );
                    },
                    error_callback,
                    None,
                )
            }
            cpal::SampleFormat::I16 => {
                let mut scratch = Vec::new();
                device.build_output_stream(
                    &stream_config,
                    move |output_buffer: &mut [i16], _: &cpal::OutputCallbackInfo| {
                        render_output_buffer(
                            output_buffer,
                            &is_playing,
                            &slots,
                            &volume,
                            &bus_sender,
                            &mut scratch,
                            quantize_i16,
                            0,
                        );
                    },
                    error_callback,
                    None,
                )
            }
            cpal::SampleFormat::U16 => {
                let mut scratch = Vec::new();
                device.build_output_stream(
                    &stream_config,
                    move |output_buffer: &mut [u16], _: &cpal::OutputCallbackInfo| {
                        render_output_buffer(
                            output_buffer,
                            &is_playing,
                            &slots,
                            &volume,
                            &bus_sender,
                            &mut scratch,
                            quantize_u16,
                            u16::MAX / 2 + 1,
                        );
                    },
                    error_callback,
                    None,
                )
            }
            other => return Err(format!("Unsupported output sample format: {:?}", other)),
        };

        let stream = stream_result.map_err(|err| format!("Failed to build audio stream: {}", err))?;
        stream
            .play()
            .map_err(|err| format!("Failed to start audio stream: {}", err))?;
        debug!(
            "AudioDevice: stream created sr={} channels={} format={:?}",
            sample_rate_hz, channel_count, sample_format
        );

        Ok(AudioDevice {
            stream,
            sample_rate_hz,
            channel_count,
        })
    }

    /// Stops the device from pulling; the callback keeps running but the
    /// engine gates it with the shared `is_playing` flag, so this is only a
    /// hint to the OS stream.
    pub fn pause_stream(&self) {
        if let Err(err) = self.stream.pause() {
            warn!("AudioDevice: failed to pause stream: {}", err);
        }
    }

    pub fn resume_stream(&self) {
        if let Err(err) = self.stream.play() {
            warn!("AudioDevice: failed to resume stream: {}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{quantize_i16, quantize_u16, DecoderSlots};
    use crate::protocol::SlotId;

    #[test]
    fn test_slots_start_with_slot_a_active_and_both_unloaded() {
        let slots = DecoderSlots::new();
        assert_eq!(slots.active_id(), SlotId::A);
        assert!(slots.slot(SlotId::A).is_unloaded());
        assert!(slots.slot(SlotId::B).is_unloaded());
        assert!(!slots.eof_pending());
    }

    #[test]
    fn test_flip_active_rotates_between_slots() {
        let slots = DecoderSlots::new();
        slots.flip_active();
        assert_eq!(slots.active_id(), SlotId::B);
        assert_eq!(slots.inactive_id(), SlotId::A);
        slots.flip_active();
        assert_eq!(slots.active_id(), SlotId::A);
    }

    #[test]
    fn test_unload_clears_deleted_flag() {
        let slots = DecoderSlots::new();
        let slot = slots.slot(SlotId::A);
        slot.mark_deleted();
        assert!(slot.is_deleted());
        slot.unload();
        assert!(!slot.is_deleted());
        assert!(slot.is_unloaded());
    }

    #[test]
    fn test_quantize_i16_clamps_out_of_range_samples() {
        assert_eq!(quantize_i16(1.5), i16::MAX);
        assert_eq!(quantize_i16(-1.5), -i16::MAX);
        assert_eq!(quantize_i16(0.0), 0);
    }

    #[test]
    fn test_quantize_u16_maps_full_scale() {
        assert_eq!(quantize_u16(-1.0), 0);
        assert_eq!(quantize_u16(1.0), u16::MAX);
    }
}

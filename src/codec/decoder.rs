//! Opus decoder for processing-rate speech frames

use opus::{Channels, Decoder};

use crate::audio::frame::AudioFrame;
use crate::error::CodecError;
use crate::protocol::EncodedPacket;

/// Longest frame Opus can carry in one packet, in milliseconds
const MAX_PACKET_MS: usize = 120;

/// Decodes one packet into exactly one frame.
///
/// Decoding never blocks. Packets that are empty, malformed or hold a
/// different frame duration fail with [`CodecError::DecodeError`]; the caller
/// substitutes [`SpeechDecoder::silence`] to keep the playback cadence.
pub struct SpeechDecoder {
    decoder: Decoder,
    sample_rate: u32,
    frame_len: usize,
    /// Reused output buffer, sized for the longest Opus packet
    decode_buffer: Vec<f32>,
    frames_decoded: u64,
    decode_errors: u64,
}

impl SpeechDecoder {
    pub fn new(sample_rate: u32, frame_len: usize) -> Result<Self, CodecError> {
        let decoder = Decoder::new(sample_rate, Channels::Mono)
            .map_err(|e| CodecError::DecoderInit(e.to_string()))?;

        let max_samples = (sample_rate as usize * MAX_PACKET_MS / 1000).max(frame_len);

        Ok(Self {
            decoder,
            sample_rate,
            frame_len,
            decode_buffer: vec![0.0f32; max_samples],
            frames_decoded: 0,
            decode_errors: 0,
        })
    }

    pub fn decode(&mut self, packet: &EncodedPacket) -> Result<AudioFrame, CodecError> {
        if packet.payload.is_empty() {
            self.decode_errors += 1;
            return Err(CodecError::DecodeError("empty payload".into()));
        }

        let samples = match self
            .decoder
            .decode_float(&packet.payload, &mut self.decode_buffer, false)
        {
            Ok(n) => n,
            Err(e) => {
                self.decode_errors += 1;
                return Err(CodecError::DecodeError(e.to_string()));
            }
        };

        if samples != self.frame_len {
            self.decode_errors += 1;
            return Err(CodecError::DecodeError(format!(
                "packet holds {} samples, expected {}",
                samples, self.frame_len
            )));
        }

        self.frames_decoded += 1;
        Ok(AudioFrame::new(self.decode_buffer[..samples].to_vec(), self.sample_rate).clamped())
    }

    /// Zero-filled frame of the expected length
    pub fn silence(&self) -> AudioFrame {
        AudioFrame::silence(self.frame_len, self.sample_rate)
    }

    /// Clear decoder history, e.g. after the peer restarted
    pub fn reset(&mut self) -> Result<(), CodecError> {
        self.decoder
            .reset_state()
            .map_err(|e| CodecError::DecoderInit(e.to_string()))
    }

    pub fn frame_len(&self) -> usize {
        self.frame_len
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn frames_decoded(&self) -> u64 {
        self.frames_decoded
    }

    pub fn decode_errors(&self) -> u64 {
        self.decode_errors
    }
}

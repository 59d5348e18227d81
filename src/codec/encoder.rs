//! Opus encoder for processing-rate speech frames

use bytes::Bytes;
use opus::{Application, Bitrate, Channels, Encoder};
use tracing::debug;

use super::MAX_OPUS_PACKET;
use crate::audio::frame::AudioFrame;
use crate::config::CodecConfig;
use crate::error::CodecError;
use crate::protocol::EncodedPacket;

/// Encodes fixed-length mono frames and stamps them with a sequence number
pub struct SpeechEncoder {
    encoder: Encoder,
    sample_rate: u32,
    frame_len: usize,
    next_sequence: u32,
    /// Reused output buffer
    encode_buffer: Vec<u8>,
    frames_encoded: u64,
    bytes_produced: u64,
}

impl SpeechEncoder {
    pub fn new(sample_rate: u32, frame_len: usize, config: &CodecConfig) -> Result<Self, CodecError> {
        let mut encoder = Encoder::new(sample_rate, Channels::Mono, Application::Voip)
            .map_err(|e| CodecError::EncoderInit(e.to_string()))?;

        encoder
            .set_bitrate(Bitrate::Bits(config.bitrate as i32))
            .map_err(|e| CodecError::EncoderInit(format!("Failed to set bitrate: {}", e)))?;
        encoder
            .set_vbr(!config.cbr)
            .map_err(|e| CodecError::EncoderInit(format!("Failed to set VBR: {}", e)))?;
        if !config.cbr {
            encoder
                .set_vbr_constraint(true)
                .map_err(|e| CodecError::EncoderInit(format!("Failed to set CVBR: {}", e)))?;
        }
        encoder
            .set_inband_fec(config.fec)
            .map_err(|e| CodecError::EncoderInit(format!("Failed to set FEC: {}", e)))?;
        if config.fec {
            encoder
                .set_packet_loss_perc(config.packet_loss_perc as i32)
                .map_err(|e| CodecError::EncoderInit(format!("Failed to set packet loss: {}", e)))?;
        }

        debug!(
            "Opus encoder: {} Hz mono, {} samples/frame, {} bps, cbr={}",
            sample_rate, frame_len, config.bitrate, config.cbr
        );

        Ok(Self {
            encoder,
            sample_rate,
            frame_len,
            next_sequence: 0,
            encode_buffer: vec![0u8; MAX_OPUS_PACKET],
            frames_encoded: 0,
            bytes_produced: 0,
        })
    }

    /// Compress one frame.
    ///
    /// An empty frame is encoded as silence; any other length than the
    /// configured frame length is rejected.
    pub fn encode(&mut self, frame: &AudioFrame) -> Result<EncodedPacket, CodecError> {
        if frame.sample_rate() != self.sample_rate {
            return Err(CodecError::EncodingFailed(format!(
                "frame at {} Hz given to a {} Hz encoder",
                frame.sample_rate(),
                self.sample_rate
            )));
        }

        let size = if frame.is_empty() {
            let silence = vec![0.0f32; self.frame_len];
            self.encode_samples(&silence)?
        } else if frame.len() != self.frame_len {
            return Err(CodecError::InvalidFrameSize(frame.len()));
        } else {
            self.encode_samples(frame.samples())?
        };

        let sequence = self.next_sequence;
        self.next_sequence = self.next_sequence.wrapping_add(1);
        self.frames_encoded += 1;
        self.bytes_produced += size as u64;

        Ok(EncodedPacket::new(
            sequence,
            Bytes::copy_from_slice(&self.encode_buffer[..size]),
        ))
    }

    fn encode_samples(&mut self, samples: &[f32]) -> Result<usize, CodecError> {
        self.encoder
            .encode_float(samples, &mut self.encode_buffer)
            .map_err(|e| CodecError::EncodingFailed(e.to_string()))
    }

    /// Clear codec history and restart sequence numbering
    pub fn reset(&mut self) -> Result<(), CodecError> {
        self.next_sequence = 0;
        self.encoder
            .reset_state()
            .map_err(|e| CodecError::EncoderInit(e.to_string()))
    }

    pub fn frame_len(&self) -> usize {
        self.frame_len
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn stats(&self) -> EncoderStats {
        EncoderStats {
            frames_encoded: self.frames_encoded,
            bytes_produced: self.bytes_produced,
            average_frame_size: if self.frames_encoded > 0 {
                self.bytes_produced as f32 / self.frames_encoded as f32
            } else {
                0.0
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct EncoderStats {
    pub frames_encoded: u64,
    pub bytes_produced: u64,
    pub average_frame_size: f32,
}

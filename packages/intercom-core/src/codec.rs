//! Opus codec layer: PCM <-> Opus at the fixed intercom parameters.
//!
//! Encoder: wideband 16 kHz mono, 32 kbps VBR, complexity 5, inband FEC.
//! Decoder: same rate, PLC on a missing frame (empty payload), FEC
//! recovery when the caller knows the previous frame was lost.
//!
//! Both states are heap-allocated once and reused for the life of the
//! stream. Decode failure is recoverable by contract: callers emit a
//! silent frame and count the error, never tear the stream down.

use opus::{Application, Channels};

use crate::error::{IntercomError, IntercomResult};
use crate::protocol::{
    FRAME_SAMPLES, MAX_OPUS_PAYLOAD, OPUS_BITRATE, OPUS_COMPLEXITY, SAMPLE_RATE,
};

/// Reusable Opus encoder state.
pub struct AudioEncoder {
    inner: opus::Encoder,
}

impl AudioEncoder {
    /// Creates an encoder at the intercom's fixed parameters.
    pub fn new() -> IntercomResult<Self> {
        let mut inner = opus::Encoder::new(SAMPLE_RATE, Channels::Mono, Application::Voip)
            .map_err(|e| IntercomError::CodecInit(format!("encoder create: {}", e)))?;
        inner
            .set_bitrate(opus::Bitrate::Bits(OPUS_BITRATE))
            .map_err(|e| IntercomError::CodecInit(format!("set bitrate: {}", e)))?;
        inner
            .set_vbr(true)
            .map_err(|e| IntercomError::CodecInit(format!("set vbr: {}", e)))?;
        inner
            .set_complexity(OPUS_COMPLEXITY)
            .map_err(|e| IntercomError::CodecInit(format!("set complexity: {}", e)))?;
        inner
            .set_inband_fec(true)
            .map_err(|e| IntercomError::CodecInit(format!("set fec: {}", e)))?;
        Ok(Self { inner })
    }

    /// Encodes exactly one 20 ms frame (320 samples) of 16-bit PCM.
    ///
    /// The output is bounded by [`MAX_OPUS_PAYLOAD`] so every encoded
    /// frame fits a wire packet by construction.
    pub fn encode(&mut self, pcm: &[i16]) -> IntercomResult<Vec<u8>> {
        if pcm.len() != FRAME_SAMPLES {
            return Err(IntercomError::Encode(format!(
                "{} samples, expected {}",
                pcm.len(),
                FRAME_SAMPLES
            )));
        }
        let mut out = vec![0u8; MAX_OPUS_PAYLOAD];
        let len = self
            .inner
            .encode(pcm, &mut out)
            .map_err(|e| IntercomError::Encode(e.to_string()))?;
        out.truncate(len);
        Ok(out)
    }
}

/// Reusable Opus decoder state.
///
/// On the embedded side this state lives in external RAM; here it is a
/// plain heap allocation with the same reuse discipline.
pub struct AudioDecoder {
    inner: opus::Decoder,
}

impl AudioDecoder {
    pub fn new() -> IntercomResult<Self> {
        let inner = opus::Decoder::new(SAMPLE_RATE, Channels::Mono)
            .map_err(|e| IntercomError::CodecInit(format!("decoder create: {}", e)))?;
        Ok(Self { inner })
    }

    /// Decodes one Opus payload to a 320-sample PCM frame.
    ///
    /// An empty payload synthesizes concealment (PLC). Pass `fec = true`
    /// with the packet FOLLOWING a loss to recover the lost frame from
    /// its in-band FEC data.
    pub fn decode(&mut self, payload: &[u8], fec: bool) -> IntercomResult<Vec<i16>> {
        let mut pcm = vec![0i16; FRAME_SAMPLES];
        let decoded = self
            .inner
            .decode(payload, &mut pcm, fec)
            .map_err(|e| IntercomError::Decode(e.to_string()))?;
        pcm.truncate(decoded);
        Ok(pcm)
    }

    /// Decodes a payload, absorbing failure as a silent frame.
    ///
    /// Returns the PCM plus whether a decode error was absorbed, so the
    /// caller can bump its counter.
    pub fn decode_or_silence(&mut self, payload: &[u8], fec: bool) -> (Vec<i16>, bool) {
        match self.decode(payload, fec) {
            Ok(pcm) if pcm.len() == FRAME_SAMPLES => (pcm, false),
            Ok(mut pcm) => {
                // Short decode (e.g. a truncated payload): pad to a full frame.
                pcm.resize(FRAME_SAMPLES, 0);
                (pcm, false)
            }
            Err(e) => {
                log::debug!("[Codec] Decode error absorbed as silence: {}", e);
                (silence_frame().to_vec(), true)
            }
        }
    }
}

/// One frame of PCM silence.
pub fn silence_frame() -> [i16; FRAME_SAMPLES] {
    [0i16; FRAME_SAMPLES]
}

/// Converts little-endian 16-bit PCM bytes (the web transport form) to samples.
pub fn pcm_from_le_bytes(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|c| i16::from_le_bytes([c[0], c[1]]))
        .collect()
}

/// Converts PCM samples to the little-endian byte form sent to web clients.
pub fn pcm_to_le_bytes(pcm: &[i16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(pcm.len() * 2);
    for s in pcm {
        out.extend_from_slice(&s.to_le_bytes());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 440 Hz test tone at moderate level.
    fn tone_frame(phase_frames: usize) -> Vec<i16> {
        (0..FRAME_SAMPLES)
            .map(|i| {
                let t = (phase_frames * FRAME_SAMPLES + i) as f32 / SAMPLE_RATE as f32;
                ((t * 440.0 * std::f32::consts::TAU).sin() * 8000.0) as i16
            })
            .collect()
    }

    #[test]
    fn encode_fits_wire_payload() {
        let mut enc = AudioEncoder::new().unwrap();
        for n in 0..10 {
            let payload = enc.encode(&tone_frame(n)).unwrap();
            assert!(!payload.is_empty());
            assert!(payload.len() <= MAX_OPUS_PAYLOAD);
        }
    }

    #[test]
    fn encode_rejects_wrong_frame_size() {
        let mut enc = AudioEncoder::new().unwrap();
        assert!(enc.encode(&[0i16; 100]).is_err());
    }

    #[test]
    fn decode_round_trip_yields_full_frames() {
        let mut enc = AudioEncoder::new().unwrap();
        let mut dec = AudioDecoder::new().unwrap();
        for n in 0..5 {
            let payload = enc.encode(&tone_frame(n)).unwrap();
            let pcm = dec.decode(&payload, false).unwrap();
            assert_eq!(pcm.len(), FRAME_SAMPLES);
        }
    }

    #[test]
    fn empty_payload_synthesizes_concealment() {
        let mut enc = AudioEncoder::new().unwrap();
        let mut dec = AudioDecoder::new().unwrap();
        // Prime the decoder with real audio so PLC has history.
        for n in 0..3 {
            let payload = enc.encode(&tone_frame(n)).unwrap();
            dec.decode(&payload, false).unwrap();
        }
        let concealed = dec.decode(&[], false).unwrap();
        assert_eq!(concealed.len(), FRAME_SAMPLES);
    }

    #[test]
    fn garbage_payload_is_absorbed_as_silence() {
        let mut dec = AudioDecoder::new().unwrap();
        let (pcm, errored) = dec.decode_or_silence(&[0xff; 7], false);
        assert_eq!(pcm.len(), FRAME_SAMPLES);
        assert!(errored);
    }

    #[test]
    fn round_trip_snr_exceeds_25_db() {
        let mut enc = AudioEncoder::new().unwrap();
        let mut dec = AudioDecoder::new().unwrap();
        // Skip the first frames while the codec converges.
        let mut signal = 0f64;
        let mut noise = 0f64;
        for n in 0..50 {
            let original = tone_frame(n);
            let payload = enc.encode(&original).unwrap();
            let decoded = dec.decode(&payload, false).unwrap();
            if n < 5 {
                continue;
            }
            for (a, b) in original.iter().zip(decoded.iter()) {
                signal += (*a as f64) * (*a as f64);
                noise += ((*a - *b) as f64) * ((*a - *b) as f64);
            }
        }
        let snr_db = 10.0 * (signal / noise.max(1.0)).log10();
        assert!(snr_db > 25.0, "SNR {:.1} dB below floor", snr_db);
    }

    #[test]
    fn pcm_byte_conversion_round_trips() {
        let pcm: Vec<i16> = vec![-32768, -1, 0, 1, 32767];
        assert_eq!(pcm_from_le_bytes(&pcm_to_le_bytes(&pcm)), pcm);
    }
}

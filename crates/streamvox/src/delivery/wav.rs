//! RIFF/WAVE framing and 16-bit PCM chunking

use bytes::{BufMut, Bytes, BytesMut};

pub const WAV_HEADER_LEN: usize = 44;
pub const BYTES_PER_SAMPLE: usize = 2;

/// Length placeholder for streams whose size is unknown up front
const OPEN_LENGTH: u32 = 0xFFFF_FFFF;

/// 44-byte mono 16-bit PCM header with open-ended lengths
pub fn wav_header(sample_rate: u32) -> Bytes {
    let channels: u16 = 1;
    let block_align = channels as u32 * BYTES_PER_SAMPLE as u32;
    let byte_rate = sample_rate * block_align;

    let mut buf = BytesMut::with_capacity(WAV_HEADER_LEN);
    buf.put_slice(b"RIFF");
    buf.put_u32_le(OPEN_LENGTH);
    buf.put_slice(b"WAVE");

    buf.put_slice(b"fmt ");
    buf.put_u32_le(16); // fmt chunk size for PCM
    buf.put_u16_le(1); // PCM
    buf.put_u16_le(channels);
    buf.put_u32_le(sample_rate);
    buf.put_u32_le(byte_rate);
    buf.put_u16_le(block_align as u16);
    buf.put_u16_le(16); // bits per sample

    buf.put_slice(b"data");
    buf.put_u32_le(OPEN_LENGTH);
    buf.freeze()
}

/// Zeroed PCM covering `ms` milliseconds
pub fn silence(sample_rate: u32, ms: u32) -> Bytes {
    let samples = sample_rate as usize * ms as usize / 1000;
    Bytes::from(vec![0u8; samples * BYTES_PER_SAMPLE])
}

/// Convert float samples in `[-1, 1]` to signed 16-bit little-endian PCM
pub fn encode_pcm16(samples: &[f32]) -> Bytes {
    let mut buf = BytesMut::with_capacity(samples.len() * BYTES_PER_SAMPLE);
    for &sample in samples {
        buf.put_i16_le((sample.clamp(-1.0, 1.0) * 32767.0) as i16);
    }
    buf.freeze()
}

/// Split PCM into chunks of at most `max_bytes`, never splitting a sample
pub fn chunk_pcm(mut pcm: Bytes, max_bytes: usize) -> Vec<Bytes> {
    let size = (max_bytes - max_bytes % BYTES_PER_SAMPLE).max(BYTES_PER_SAMPLE);
    let mut chunks = Vec::with_capacity(pcm.len().div_ceil(size));
    while pcm.len() > size {
        chunks.push(pcm.split_to(size));
    }
    if !pcm.is_empty() {
        chunks.push(pcm);
    }
    chunks
}

/// Duration in seconds of `samples` at `sample_rate`
pub fn duration_secs(samples: usize, sample_rate: u32) -> f64 {
    if sample_rate == 0 {
        0.0
    } else {
        samples as f64 / sample_rate as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn u32_at(bytes: &[u8], at: usize) -> u32 {
        u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
    }

    fn u16_at(bytes: &[u8], at: usize) -> u16 {
        u16::from_le_bytes([bytes[at], bytes[at + 1]])
    }

    #[test]
    fn test_header_layout() {
        let header = wav_header(24_000);
        assert_eq!(header.len(), WAV_HEADER_LEN);
        assert_eq!(&header[0..4], b"RIFF");
        assert_eq!(u32_at(&header, 4), 0xFFFF_FFFF);
        assert_eq!(&header[8..12], b"WAVE");
        assert_eq!(&header[12..16], b"fmt ");
        assert_eq!(u32_at(&header, 16), 16);
        assert_eq!(u16_at(&header, 20), 1);
        assert_eq!(u16_at(&header, 22), 1);
        assert_eq!(u32_at(&header, 24), 24_000);
        assert_eq!(u32_at(&header, 28), 48_000);
        assert_eq!(u16_at(&header, 32), 2);
        assert_eq!(u16_at(&header, 34), 16);
        assert_eq!(&header[36..40], b"data");
        assert_eq!(u32_at(&header, 40), 0xFFFF_FFFF);
    }

    #[test]
    fn test_silence_length() {
        assert_eq!(silence(24_000, 10).len(), 480);
        assert!(silence(24_000, 10).iter().all(|b| *b == 0));
        assert!(silence(24_000, 0).is_empty());
    }

    #[test]
    fn test_pcm_encoding_clamps() {
        let pcm = encode_pcm16(&[0.0, 1.0, -1.0, 2.0, -3.0, 0.5]);
        let values: Vec<i16> = pcm
            .chunks_exact(2)
            .map(|c| i16::from_le_bytes([c[0], c[1]]))
            .collect();
        assert_eq!(values, vec![0, 32767, -32767, 32767, -32767, 16383]);
    }

    #[test]
    fn test_chunks_are_bounded_and_complete() {
        let pcm = encode_pcm16(&vec![0.1; 5000]);
        let chunks = chunk_pcm(pcm.clone(), 4800);
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.len() <= 4800 && c.len() % 2 == 0));

        let joined: Vec<u8> = chunks.iter().flat_map(|c| c.iter().copied()).collect();
        assert_eq!(joined, pcm.to_vec());
    }

    #[test]
    fn test_odd_chunk_size_keeps_samples_whole() {
        let chunks = chunk_pcm(encode_pcm16(&[0.1; 10]), 5);
        assert!(chunks.iter().all(|c| c.len() == 4));
        assert!(chunk_pcm(Bytes::new(), 4800).is_empty());
    }
}

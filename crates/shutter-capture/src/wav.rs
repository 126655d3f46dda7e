// crates/shutter-capture/src/wav.rs
//
// Buffered PCM sink writing a RIFF/WAVE file.
//
// The header goes out first with placeholder chunk sizes; samples are
// buffered and flushed in large runs so the host's tiny audio packets do
// not turn into tiny writes; `end` seeks back and patches the RIFF size
// (file length − 8) and the data size (PCM bytes).

use std::fs::File;
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;

use anyhow::{Context, Result};
use shutter_core::movie::{AudioParams, WaveSample};

/// Samples held before a flush to disk.
pub const WAV_BUFFERED_SAMPLES: usize = 32_768;

pub struct WavSink {
    file: File,
    /// Seek position of the RIFF chunk size field.
    riff_size_pos: u64,
    /// Seek position of the data chunk size field.
    data_size_pos: u64,
    data_len: u32,
    block_align: u16,
    buf: Vec<WaveSample>,
}

impl WavSink {
    /// Create the file and write the header with placeholder sizes.
    pub fn begin(path: &Path, audio: &AudioParams) -> Result<Self> {
        let mut file = File::create(path)
            .with_context(|| format!("create wave file {}", path.display()))?;

        let block_align = audio.channels * (audio.bits / 8);
        let byte_rate = audio.hz * block_align as u32;

        file.write_all(b"RIFF")?;
        let riff_size_pos = file.stream_position()?;
        file.write_all(&0u32.to_le_bytes())?;
        file.write_all(b"WAVE")?;

        file.write_all(b"fmt ")?;
        file.write_all(&16u32.to_le_bytes())?;
        file.write_all(&1u16.to_le_bytes())?; // PCM
        file.write_all(&audio.channels.to_le_bytes())?;
        file.write_all(&audio.hz.to_le_bytes())?;
        file.write_all(&byte_rate.to_le_bytes())?;
        file.write_all(&block_align.to_le_bytes())?;
        file.write_all(&audio.bits.to_le_bytes())?;

        file.write_all(b"data")?;
        let data_size_pos = file.stream_position()?;
        file.write_all(&0u32.to_le_bytes())?;

        Ok(Self {
            file,
            riff_size_pos,
            data_size_pos,
            data_len: 0,
            block_align,
            buf: Vec::with_capacity(WAV_BUFFERED_SAMPLES),
        })
    }

    /// Append samples, flushing to disk only when capacity would be
    /// exceeded.
    pub fn push(&mut self, samples: &[WaveSample]) -> Result<()> {
        if self.buf.len() + samples.len() > WAV_BUFFERED_SAMPLES {
            self.flush_buffered()?;
        }
        if samples.len() > WAV_BUFFERED_SAMPLES {
            // A burst that can never fit bypasses the buffer entirely.
            self.write_samples(samples)?;
        } else {
            self.buf.extend_from_slice(samples);
        }
        Ok(())
    }

    /// Flush the tail and back-patch the chunk sizes.
    pub fn end(mut self) -> Result<()> {
        self.flush_buffered()?;

        let file_len = self.file.stream_position()?;
        self.file.seek(SeekFrom::Start(self.riff_size_pos))?;
        self.file
            .write_all(&((file_len - 8) as u32).to_le_bytes())?;
        self.file.seek(SeekFrom::Start(self.data_size_pos))?;
        self.file.write_all(&self.data_len.to_le_bytes())?;
        self.file.flush().context("finalise wave file")?;
        Ok(())
    }

    fn flush_buffered(&mut self) -> Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let samples = std::mem::take(&mut self.buf);
        self.write_samples(&samples)?;
        self.buf = samples;
        self.buf.clear();
        Ok(())
    }

    fn write_samples(&mut self, samples: &[WaveSample]) -> Result<()> {
        let bytes: &[u8] = bytemuck::cast_slice(samples);
        self.file.write_all(bytes).context("write wave samples")?;
        self.data_len += bytes.len() as u32;
        debug_assert_eq!(
            std::mem::size_of::<WaveSample>(),
            self.block_align as usize
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn samples(n: usize, base: i16) -> Vec<WaveSample> {
        (0..n)
            .map(|i| {
                let l = base.wrapping_add(i as i16);
                WaveSample { l, r: l.wrapping_neg() }
            })
            .collect()
    }

    fn read_u32(bytes: &[u8], at: usize) -> u32 {
        u32::from_le_bytes(bytes[at..at + 4].try_into().unwrap())
    }

    fn read_u16(bytes: &[u8], at: usize) -> u16 {
        u16::from_le_bytes(bytes[at..at + 2].try_into().unwrap())
    }

    /// Parse the produced file and check the RIFF invariants.
    fn check_wav(bytes: &[u8], expect_samples: usize) {
        assert_eq!(&bytes[0..4], b"RIFF");
        assert_eq!(read_u32(bytes, 4) as usize, bytes.len() - 8);
        assert_eq!(&bytes[8..12], b"WAVE");

        assert_eq!(&bytes[12..16], b"fmt ");
        assert_eq!(read_u32(bytes, 16), 16);
        assert_eq!(read_u16(bytes, 20), 1); // PCM
        let channels = read_u16(bytes, 22);
        let bits = read_u16(bytes, 34);
        let block_align = read_u16(bytes, 32);
        assert_eq!(block_align, channels * bits / 8);

        assert_eq!(&bytes[36..40], b"data");
        let data_len = read_u32(bytes, 40) as usize;
        assert_eq!(data_len, expect_samples * block_align as usize);
        assert_eq!(bytes.len(), 44 + data_len);
    }

    #[test]
    fn small_bursts_flush_to_exact_totals() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.wav");

        let mut sink = WavSink::begin(&path, &AudioParams::default()).unwrap();
        // The host delivers tiny packets under heavy motion blur; 12 at a
        // time is the observed size.
        let mut total = 0usize;
        while total < 10_000 {
            let n = 12.min(10_000 - total);
            sink.push(&samples(n, total as i16)).unwrap();
            total += n;
        }
        sink.end().unwrap();

        let bytes = std::fs::read(&path).unwrap();
        check_wav(&bytes, 10_000);

        // First and last sample survive the buffering intact.
        let first = i16::from_le_bytes(bytes[44..46].try_into().unwrap());
        assert_eq!(first, 0);
        let at = 44 + 9_999 * 4;
        let last_l = i16::from_le_bytes(bytes[at..at + 2].try_into().unwrap());
        assert_eq!(last_l, 9_999);
    }

    #[test]
    fn bursts_larger_than_the_buffer_bypass_it() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.wav");

        let mut sink = WavSink::begin(&path, &AudioParams::default()).unwrap();
        sink.push(&samples(WAV_BUFFERED_SAMPLES * 2, 1)).unwrap();
        sink.push(&samples(5, 1)).unwrap();
        sink.end().unwrap();

        let bytes = std::fs::read(&path).unwrap();
        check_wav(&bytes, WAV_BUFFERED_SAMPLES * 2 + 5);
    }

    /// Filling the buffer to exactly its capacity must not trigger a
    /// flush; only exceeding it does.
    #[test]
    fn exact_capacity_fill_stays_buffered_until_exceeded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("edge.wav");

        let mut sink = WavSink::begin(&path, &AudioParams::default()).unwrap();
        sink.push(&samples(WAV_BUFFERED_SAMPLES, 0)).unwrap();
        assert_eq!(sink.buf.len(), WAV_BUFFERED_SAMPLES);
        assert_eq!(sink.data_len, 0);

        // One more sample crosses the threshold and forces the flush.
        sink.push(&samples(1, 0)).unwrap();
        assert_eq!(sink.buf.len(), 1);
        assert_eq!(sink.data_len as usize, WAV_BUFFERED_SAMPLES * 4);

        sink.end().unwrap();
        let bytes = std::fs::read(&path).unwrap();
        check_wav(&bytes, WAV_BUFFERED_SAMPLES + 1);
    }

    #[test]
    fn empty_recording_is_still_a_valid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.wav");

        let sink = WavSink::begin(&path, &AudioParams::default()).unwrap();
        sink.end().unwrap();

        let bytes = std::fs::read(&path).unwrap();
        check_wav(&bytes, 0);
    }
}

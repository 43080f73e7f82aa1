use std::path::Path;

use anyhow::Context;

/// Write raw little-endian 16-bit mono PCM as an uncompressed RIFF wave
/// file. A trailing odd byte, which cannot form a sample, is dropped.
pub(crate) fn write_pcm(path: &Path, pcm: &[u8], sample_rate: u32) -> anyhow::Result<()> {
    let spec = hound::WavSpec {
        channels: crate::CHANNELS,
        sample_rate,
        bits_per_sample: crate::BITS_PER_SAMPLE,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec)
        .with_context(|| format!("creating {}", path.display()))?;
    for pair in pcm.chunks_exact(2) {
        writer.write_sample(i16::from_le_bytes([pair[0], pair[1]]))?;
    }
    writer.finalize().context("finalizing wave file")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_samples_and_format() {
        let path = std::env::temp_dir().join(format!("wav-{}.wav", std::process::id()));
        let pcm: Vec<u8> = [100i16, -100, 0, i16::MAX, i16::MIN]
            .iter()
            .flat_map(|s| s.to_le_bytes())
            .collect();
        write_pcm(&path, &pcm, crate::SAMPLE_RATE).unwrap();

        let mut reader = hound::WavReader::open(&path).unwrap();
        let spec = reader.spec();
        assert_eq!(spec.channels, 1);
        assert_eq!(spec.sample_rate, 24_000);
        assert_eq!(spec.bits_per_sample, 16);
        let samples: Vec<i16> = reader.samples::<i16>().map(|s| s.unwrap()).collect();
        assert_eq!(samples, vec![100, -100, 0, i16::MAX, i16::MIN]);
        std::fs::remove_file(&path).unwrap();
    }
}

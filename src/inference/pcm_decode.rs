use std::path::Path;

use anyhow::{anyhow, Result};
use symphonia::core::audio::{AudioBufferRef, Signal};
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::conv::FromSample;

const RESAMPLE_CHUNK_SIZE: usize = 1024;

fn conv<T>(samples: &mut Vec<f32>, data: std::borrow::Cow<symphonia::core::audio::AudioBuffer<T>>)
where
    T: symphonia::core::sample::Sample,
    f32: FromSample<T>,
{
    samples.extend(data.chan(0).iter().map(|v| f32::from_sample(*v)));
}

// Taken from https://github.com/huggingface/candle/blob/main/candle-examples/src/audio.rs
/// Decodes the first audio track of `path` into mono f32 samples and its sample rate.
pub(crate) fn pcm_decode(path: &Path) -> Result<(Vec<f32>, u32)> {
    let src = std::fs::File::open(path)?;
    let mss = symphonia::core::io::MediaSourceStream::new(Box::new(src), Default::default());
    let hint = symphonia::core::probe::Hint::new();
    let meta_opts: symphonia::core::meta::MetadataOptions = Default::default();
    let fmt_opts: symphonia::core::formats::FormatOptions = Default::default();

    let probed = symphonia::default::get_probe().format(&hint, mss, &fmt_opts, &meta_opts)?;
    let mut format = probed.format;
    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| anyhow!("no supported audio tracks"))?;

    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions { verify: true })
        .map_err(|e| anyhow!("unsupported codec: {e}"))?;
    let track_id = track.id;
    let sample_rate = track
        .codec_params
        .sample_rate
        .ok_or_else(|| anyhow!("audio track has no sample rate"))?;

    let mut pcm_data = Vec::new();
    while let Ok(packet) = format.next_packet() {
        while !format.metadata().is_latest() {
            format.metadata().pop();
        }
        if packet.track_id() != track_id {
            continue;
        }
        match decoder.decode(&packet)? {
            AudioBufferRef::F64(buf) => conv(&mut pcm_data, buf),
            AudioBufferRef::F32(buf) => conv(&mut pcm_data, buf),
            AudioBufferRef::S32(buf) => conv(&mut pcm_data, buf),
            AudioBufferRef::S16(buf) => conv(&mut pcm_data, buf),
            AudioBufferRef::S8(buf) => conv(&mut pcm_data, buf),
            AudioBufferRef::U32(buf) => conv(&mut pcm_data, buf),
            AudioBufferRef::U16(buf) => conv(&mut pcm_data, buf),
            AudioBufferRef::U8(buf) => conv(&mut pcm_data, buf),
            AudioBufferRef::U24(buf) => conv(&mut pcm_data, buf),
            AudioBufferRef::S24(buf) => conv(&mut pcm_data, buf),
        }
    }
    Ok((pcm_data, sample_rate))
}

/// Band-limited FFT resampling of a mono signal, as in candle's audio helpers.
pub(crate) fn resample(pcm_in: &[f32], from_rate: u32, to_rate: u32) -> Result<Vec<f32>> {
    use rubato::Resampler;

    if from_rate == to_rate || pcm_in.is_empty() {
        return Ok(pcm_in.to_vec());
    }
    let (from_rate, to_rate) = (from_rate as usize, to_rate as usize);
    let mut pcm_out =
        Vec::with_capacity(pcm_in.len() * to_rate / from_rate + RESAMPLE_CHUNK_SIZE);
    let mut resampler =
        rubato::FftFixedInOut::<f32>::new(from_rate, to_rate, RESAMPLE_CHUNK_SIZE, 1)?;
    let mut output_buffer = resampler.output_buffer_allocate(true);
    let mut pos_in = 0;
    while pos_in + resampler.input_frames_next() < pcm_in.len() {
        let (in_len, out_len) =
            resampler.process_into_buffer(&[&pcm_in[pos_in..]], &mut output_buffer, None)?;
        pos_in += in_len;
        pcm_out.extend_from_slice(&output_buffer[0][..out_len]);
    }
    if pos_in < pcm_in.len() {
        let (_, out_len) = resampler.process_partial_into_buffer(
            Some(&[&pcm_in[pos_in..]]),
            &mut output_buffer,
            None,
        )?;
        pcm_out.extend_from_slice(&output_buffer[0][..out_len]);
    }
    Ok(pcm_out)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;

    fn write_wav(sample_rate: u32, samples: &[i16]) -> NamedTempFile {
        let data_len = (samples.len() * 2) as u32;
        let mut bytes = Vec::new();
        bytes.extend_from_slice(b"RIFF");
        bytes.extend_from_slice(&(36 + data_len).to_le_bytes());
        bytes.extend_from_slice(b"WAVEfmt ");
        bytes.extend_from_slice(&16u32.to_le_bytes());
        bytes.extend_from_slice(&1u16.to_le_bytes());
        bytes.extend_from_slice(&1u16.to_le_bytes());
        bytes.extend_from_slice(&sample_rate.to_le_bytes());
        bytes.extend_from_slice(&(sample_rate * 2).to_le_bytes());
        bytes.extend_from_slice(&2u16.to_le_bytes());
        bytes.extend_from_slice(&16u16.to_le_bytes());
        bytes.extend_from_slice(b"data");
        bytes.extend_from_slice(&data_len.to_le_bytes());
        for s in samples {
            bytes.extend_from_slice(&s.to_le_bytes());
        }

        let mut file = tempfile::Builder::new().suffix(".wav").tempfile().unwrap();
        file.write_all(&bytes).unwrap();
        file
    }

    #[test]
    fn decodes_pcm_wav() {
        let file = write_wav(16_000, &[0, i16::MAX, i16::MIN, 0]);
        let (pcm, rate) = pcm_decode(file.path()).unwrap();

        assert_eq!(rate, 16_000);
        assert_eq!(pcm.len(), 4);
        assert!(pcm[1] > 0.99);
        assert!(pcm[2] < -0.99);
    }

    #[test]
    fn rejects_non_audio_input() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"definitely not audio").unwrap();
        assert!(pcm_decode(file.path()).is_err());
    }

    fn sine(freq: f32, rate: u32, len: usize) -> Vec<f32> {
        (0..len)
            .map(|i| (2.0 * std::f32::consts::PI * freq * i as f32 / rate as f32).sin())
            .collect()
    }

    // RMS over the middle half, away from the filter's ramp-in and padded tail
    fn rms(samples: &[f32]) -> f32 {
        let middle = &samples[samples.len() / 4..samples.len() * 3 / 4];
        (middle.iter().map(|s| s * s).sum::<f32>() / middle.len() as f32).sqrt()
    }

    #[test]
    fn downsampling_keeps_speech_band_tones() {
        let out = resample(&sine(1_000.0, 48_000, 48_000), 48_000, 16_000).unwrap();

        assert!(out.len().abs_diff(16_000) <= RESAMPLE_CHUNK_SIZE);
        assert!((rms(&out) - std::f32::consts::FRAC_1_SQRT_2).abs() < 0.05);
    }

    #[test]
    fn downsampling_filters_tones_above_nyquist() {
        let out = resample(&sine(12_000.0, 48_000, 48_000), 48_000, 16_000).unwrap();

        assert!(out.len().abs_diff(16_000) <= RESAMPLE_CHUNK_SIZE);
        assert!(rms(&out) < 0.01);
    }

    #[test]
    fn upsampling_odd_rates() {
        let out = resample(&sine(440.0, 11_025, 11_025), 11_025, 16_000).unwrap();

        assert!(out.len().abs_diff(16_000) <= RESAMPLE_CHUNK_SIZE * 2);
        assert!(rms(&out) > 0.6);
    }

    #[test]
    fn same_rate_is_untouched() {
        let samples = [0.25, -0.5];
        assert_eq!(resample(&samples, 16_000, 16_000).unwrap(), samples.to_vec());
    }
}

//! PCM track view and the sample conversions shared by the backends.

use std::time::Duration;

use crate::error::PlayError;

pub const VOLUME_MIN: i32 = -100;
pub const VOLUME_MAX: i32 = 100;
pub const VOLUME_DEFAULT: i32 = 0;

/// Byte order of 16-bit samples on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    Little,
    Big,
}

impl ByteOrder {
    pub const fn native() -> Self {
        if cfg!(target_endian = "big") {
            ByteOrder::Big
        } else {
            ByteOrder::Little
        }
    }
}

/// Borrowed PCM samples plus format metadata, valid for one play() call.
///
/// `samples` are interleaved. For 8-bit tracks every `i16` carries one
/// signed 8-bit value in `-128..=127`.
#[derive(Debug, Clone, Copy)]
pub struct Track<'a> {
    pub bits: u16,
    pub num_channels: u16,
    pub sample_rate: u32,
    pub samples: &'a [i16],
}

impl<'a> Track<'a> {
    pub fn new(bits: u16, num_channels: u16, sample_rate: u32, samples: &'a [i16]) -> Self {
        Self {
            bits,
            num_channels,
            sample_rate,
            samples,
        }
    }

    /// Frame count.
    pub fn num_samples(&self) -> usize {
        self.samples.len() / usize::from(self.num_channels.max(1))
    }

    pub fn is_empty(&self) -> bool {
        self.num_samples() == 0
    }

    pub fn bytes_per_sample(&self) -> Result<usize, PlayError> {
        match self.bits {
            16 => Ok(2),
            8 => Ok(1),
            other => Err(PlayError::UnsupportedBits(other)),
        }
    }

    /// Check the metadata every backend relies on.
    pub fn validate(&self) -> Result<usize, PlayError> {
        let bytes_per_sample = self.bytes_per_sample()?;
        if self.num_channels == 0 {
            return Err(PlayError::InvalidTrack("zero channels".into()));
        }
        if self.sample_rate == 0 {
            return Err(PlayError::InvalidTrack("zero sample rate".into()));
        }
        Ok(bytes_per_sample)
    }

    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.num_samples() as f64 / f64::from(self.sample_rate))
    }
}

/// Gain in `[0, 1]` for a volume in `VOLUME_MIN..=VOLUME_MAX`.
pub fn volume_factor(volume: i32) -> f32 {
    let clamped = volume.clamp(VOLUME_MIN, VOLUME_MAX);
    (clamped - VOLUME_MIN) as f32 / (VOLUME_MAX - VOLUME_MIN) as f32
}

/// Private scaled copy of `samples`; the caller's buffer is never touched.
pub fn scale_volume(samples: &[i16], volume: i32) -> Vec<i16> {
    let factor = volume_factor(volume);
    samples
        .iter()
        .map(|&s| (f32::from(s) * factor) as i16)
        .collect()
}

/// Copy with every 16-bit sample byte-swapped.
pub fn swap_bytes(samples: &[i16]) -> Vec<i16> {
    samples.iter().map(|s| s.swap_bytes()).collect()
}

/// How 8-bit samples go on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EightBit {
    Signed,
    Unsigned,
}

/// Serialise samples into raw device bytes.
pub fn to_bytes(samples: &[i16], bits: u16, order: ByteOrder, eight_bit: EightBit) -> Vec<u8> {
    if bits == 8 {
        return samples
            .iter()
            .map(|&s| {
                let v = s.clamp(i16::from(i8::MIN), i16::from(i8::MAX)) as i8;
                match eight_bit {
                    EightBit::Signed => v as u8,
                    EightBit::Unsigned => (i16::from(v) + 128) as u8,
                }
            })
            .collect();
    }

    let mut out = Vec::with_capacity(samples.len() * 2);
    for &s in samples {
        match order {
            ByteOrder::Little => out.extend_from_slice(&s.to_le_bytes()),
            ByteOrder::Big => out.extend_from_slice(&s.to_be_bytes()),
        }
    }
    out
}

/// Inverse of [`to_bytes`] for signed data, used by sinks that consume
/// `i16` frames. 8-bit samples are widened to the 16-bit range.
pub fn from_bytes(bytes: &[u8], bits: u16, order: ByteOrder) -> Vec<i16> {
    if bits == 8 {
        return bytes.iter().map(|&b| i16::from(b as i8) << 8).collect();
    }
    bytes
        .chunks_exact(2)
        .map(|pair| match order {
            ByteOrder::Little => i16::from_le_bytes([pair[0], pair[1]]),
            ByteOrder::Big => i16::from_be_bytes([pair[0], pair[1]]),
        })
        .collect()
}

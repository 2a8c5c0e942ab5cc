//! PCM format descriptors and sample (de)serialization helpers.
//!
//! Decoders describe their output with an [`AudioFormat`]; render sinks describe what they
//! accept with an [`OutputSpec`]. The converter bridges the two.

use sonan_types::OutputFormat;

/// Encoding of a single PCM sample.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SampleEncoding {
    Int16,
    Int24,
    Int32,
    Float32,
}

impl SampleEncoding {
    pub fn bits(self) -> u16 {
        match self {
            SampleEncoding::Int16 => 16,
            SampleEncoding::Int24 => 24,
            SampleEncoding::Int32 | SampleEncoding::Float32 => 32,
        }
    }

    pub fn bytes(self) -> usize {
        usize::from(self.bits() / 8)
    }
}

impl From<OutputFormat> for SampleEncoding {
    fn from(format: OutputFormat) -> Self {
        match format {
            OutputFormat::F32 => SampleEncoding::Float32,
            OutputFormat::I16 => SampleEncoding::Int16,
            OutputFormat::I32 => SampleEncoding::Int32,
        }
    }
}

/// Byte order of multi-byte samples.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ByteOrder {
    Little,
    Big,
}

impl ByteOrder {
    pub fn native() -> Self {
        if cfg!(target_endian = "big") {
            ByteOrder::Big
        } else {
            ByteOrder::Little
        }
    }
}

/// Interleaved PCM format of a decoded source.
///
/// Immutable for the lifetime of one opened source; only a track change may introduce a
/// different descriptor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub encoding: SampleEncoding,
    pub byte_order: ByteOrder,
}

impl AudioFormat {
    pub fn new(sample_rate: u32, channels: u16, encoding: SampleEncoding, byte_order: ByteOrder) -> Self {
        Self {
            sample_rate,
            channels,
            encoding,
            byte_order,
        }
    }

    pub fn bits_per_sample(&self) -> u16 {
        self.encoding.bits()
    }

    pub fn bytes_per_frame(&self) -> usize {
        self.encoding.bytes() * usize::from(self.channels.max(1))
    }

    /// Convert a frame count to seconds at this format's rate.
    pub fn frames_to_seconds(&self, frames: f64) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        frames / f64::from(self.sample_rate)
    }

    /// Convert seconds to a whole number of frames (rounded down, negative clamps to 0).
    pub fn seconds_to_frames(&self, seconds: f64) -> u64 {
        if !seconds.is_finite() || seconds <= 0.0 {
            return 0;
        }
        (seconds * f64::from(self.sample_rate)).floor() as u64
    }

    /// Byte length of `seconds` of audio, aligned to whole frames.
    pub fn bytes_for_seconds(&self, seconds: f64) -> usize {
        let frames = self.seconds_to_frames(seconds) as usize;
        frames.saturating_mul(self.bytes_per_frame())
    }
}

/// What a render sink accepts: rate, channel count and sample encoding (native endian).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct OutputSpec {
    pub sample_rate: u32,
    pub channels: u16,
    pub encoding: OutputFormat,
}

impl OutputSpec {
    pub fn bytes_per_frame(&self) -> usize {
        self.encoding.bytes_per_sample() * usize::from(self.channels.max(1))
    }

    pub fn format(&self) -> AudioFormat {
        AudioFormat::new(
            self.sample_rate,
            self.channels,
            self.encoding.into(),
            ByteOrder::native(),
        )
    }
}

/// Read one sample at the start of `bytes` as a normalized `f32`.
///
/// `bytes` must hold at least `encoding.bytes()` bytes.
pub(crate) fn read_sample(bytes: &[u8], encoding: SampleEncoding, order: ByteOrder) -> f32 {
    match encoding {
        SampleEncoding::Int16 => {
            let raw = [bytes[0], bytes[1]];
            let v = match order {
                ByteOrder::Little => i16::from_le_bytes(raw),
                ByteOrder::Big => i16::from_be_bytes(raw),
            };
            f32::from(v) / 32_768.0
        }
        SampleEncoding::Int24 => {
            let (b0, b1, b2) = match order {
                ByteOrder::Little => (bytes[0], bytes[1], bytes[2]),
                ByteOrder::Big => (bytes[2], bytes[1], bytes[0]),
            };
            // Sign-extend through the top byte of an i32.
            let v = i32::from_le_bytes([0, b0, b1, b2]) >> 8;
            v as f32 / 8_388_608.0
        }
        SampleEncoding::Int32 => {
            let raw = [bytes[0], bytes[1], bytes[2], bytes[3]];
            let v = match order {
                ByteOrder::Little => i32::from_le_bytes(raw),
                ByteOrder::Big => i32::from_be_bytes(raw),
            };
            (f64::from(v) / 2_147_483_648.0) as f32
        }
        SampleEncoding::Float32 => {
            let raw = [bytes[0], bytes[1], bytes[2], bytes[3]];
            match order {
                ByteOrder::Little => f32::from_le_bytes(raw),
                ByteOrder::Big => f32::from_be_bytes(raw),
            }
        }
    }
}

/// Append one sample in the output encoding (native endian).
pub(crate) fn write_sample(value: f32, encoding: OutputFormat, out: &mut Vec<u8>) {
    match encoding {
        OutputFormat::F32 => out.extend_from_slice(&value.to_ne_bytes()),
        OutputFormat::I16 => {
            let v = (value.clamp(-1.0, 1.0) * 32_767.0).round() as i16;
            out.extend_from_slice(&v.to_ne_bytes());
        }
        OutputFormat::I32 => {
            let v = (f64::from(value.clamp(-1.0, 1.0)) * 2_147_483_647.0).round() as i32;
            out.extend_from_slice(&v.to_ne_bytes());
        }
    }
}

/// Multiply every sample in `bytes` (output encoding) by `gain`.
pub(crate) fn scale_samples(bytes: &mut [u8], encoding: OutputFormat, gain: f32) {
    match encoding {
        OutputFormat::F32 => {
            for chunk in bytes.chunks_exact_mut(4) {
                let v = f32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) * gain;
                chunk.copy_from_slice(&v.to_ne_bytes());
            }
        }
        OutputFormat::I16 => {
            for chunk in bytes.chunks_exact_mut(2) {
                let v = f32::from(i16::from_ne_bytes([chunk[0], chunk[1]])) * gain;
                let v = v.clamp(f32::from(i16::MIN), f32::from(i16::MAX)) as i16;
                chunk.copy_from_slice(&v.to_ne_bytes());
            }
        }
        OutputFormat::I32 => {
            for chunk in bytes.chunks_exact_mut(4) {
                let v = f64::from(i32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
                    * f64::from(gain);
                let v = v.clamp(f64::from(i32::MIN), f64::from(i32::MAX)) as i32;
                chunk.copy_from_slice(&v.to_ne_bytes());
            }
        }
    }
}

/// Silence is all-zero bytes for every supported output encoding.
pub(crate) fn fill_silence(bytes: &mut [u8]) {
    bytes.fill(0);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_math_uses_channels_and_encoding() {
        let format = AudioFormat::new(44_100, 2, SampleEncoding::Int16, ByteOrder::Little);
        assert_eq!(format.bytes_per_frame(), 4);
        assert_eq!(format.bits_per_sample(), 16);
        assert_eq!(format.bytes_for_seconds(1.0), 176_400);
        assert_eq!(format.frames_to_seconds(22_050.0), 0.5);
        assert_eq!(format.seconds_to_frames(-1.0), 0);
        assert_eq!(format.seconds_to_frames(f64::NAN), 0);
    }

    #[test]
    fn read_sample_handles_byte_orders() {
        let le = 16_384i16.to_le_bytes();
        let be = 16_384i16.to_be_bytes();
        assert_eq!(read_sample(&le, SampleEncoding::Int16, ByteOrder::Little), 0.5);
        assert_eq!(read_sample(&be, SampleEncoding::Int16, ByteOrder::Big), 0.5);

        let f = (-0.25f32).to_be_bytes();
        assert_eq!(read_sample(&f, SampleEncoding::Float32, ByteOrder::Big), -0.25);
    }

    #[test]
    fn read_sample_sign_extends_24_bit() {
        // -1 in 24-bit little endian.
        let bytes = [0xff, 0xff, 0xff];
        let v = read_sample(&bytes, SampleEncoding::Int24, ByteOrder::Little);
        assert!(v < 0.0 && v > -0.0001);
        // Most negative value.
        let bytes = [0x00, 0x00, 0x80];
        assert_eq!(read_sample(&bytes, SampleEncoding::Int24, ByteOrder::Little), -1.0);
    }

    #[test]
    fn write_sample_clamps_integer_outputs() {
        let mut out = Vec::new();
        write_sample(2.0, OutputFormat::I16, &mut out);
        assert_eq!(i16::from_ne_bytes([out[0], out[1]]), i16::MAX);

        out.clear();
        write_sample(0.5, OutputFormat::F32, &mut out);
        assert_eq!(f32::from_ne_bytes([out[0], out[1], out[2], out[3]]), 0.5);
    }

    #[test]
    fn scale_samples_applies_gain() {
        let mut bytes = Vec::new();
        write_sample(0.5, OutputFormat::F32, &mut bytes);
        write_sample(-0.5, OutputFormat::F32, &mut bytes);
        scale_samples(&mut bytes, OutputFormat::F32, 0.5);
        let a = f32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let b = f32::from_ne_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        assert_eq!(a, 0.25);
        assert_eq!(b, -0.25);
    }

    #[test]
    fn output_spec_maps_to_native_format() {
        let spec = OutputSpec {
            sample_rate: 48_000,
            channels: 2,
            encoding: OutputFormat::I16,
        };
        assert_eq!(spec.bytes_per_frame(), 4);
        let format = spec.format();
        assert_eq!(format.encoding, SampleEncoding::Int16);
        assert_eq!(format.byte_order, ByteOrder::native());
    }
}

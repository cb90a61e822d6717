//! Scalar quantization of stored vectors.
//!
//! | Width | Stored per vector                          |
//! |-------|--------------------------------------------|
//! | 32    | `dims` little-endian f32                   |
//! | 16    | `dims` little-endian f16                   |
//! | 8     | f32 scale, then `dims` i8                  |
//! | 1     | `ceil(dims / 32)` u32 words of sign bits   |
//!
//! Quantization only changes how a vector is stored; it never drops rows.

use half::f16;

use crate::protocol::Quantization;

/// Bytes needed to store one vector of `dims` components.
#[must_use]
pub const fn stride(quantization: Quantization, dims: usize) -> usize {
    match quantization {
        Quantization::F32 => dims * 4,
        Quantization::F16 => dims * 2,
        Quantization::I8 => 4 + dims,
        Quantization::B1 => dims.div_ceil(32) * 4,
    }
}

/// Appends the quantized form of `values` to `out`.
#[allow(clippy::cast_possible_truncation)] // i8 values are clamped first
pub fn encode_into(quantization: Quantization, values: &[f32], out: &mut Vec<u8>) {
    match quantization {
        Quantization::F32 => {
            for v in values {
                out.extend_from_slice(&v.to_le_bytes());
            }
        },
        Quantization::F16 => {
            for v in values {
                out.extend_from_slice(&f16::from_f32(*v).to_le_bytes());
            }
        },
        Quantization::I8 => {
            let max_abs = values.iter().fold(0.0f32, |acc, v| acc.max(v.abs()));
            let scale = if max_abs > 0.0 { max_abs / 127.0 } else { 0.0 };
            out.extend_from_slice(&scale.to_le_bytes());
            for v in values {
                let q = if scale > 0.0 {
                    (v / scale).round().clamp(-127.0, 127.0) as i8
                } else {
                    0
                };
                out.push(q.to_le_bytes()[0]);
            }
        },
        Quantization::B1 => {
            for chunk in values.chunks(32) {
                let mut word = 0u32;
                for (bit, v) in chunk.iter().enumerate() {
                    if *v > 0.0 {
                        word |= 1 << bit;
                    }
                }
                out.extend_from_slice(&word.to_le_bytes());
            }
        },
    }
}

/// Appends `dims` dequantized components decoded from `bytes` to `out`.
///
/// `bytes` must be exactly [`stride`] long.
pub fn decode_into(quantization: Quantization, bytes: &[u8], dims: usize, out: &mut Vec<f32>) {
    match quantization {
        Quantization::F32 => out.extend(
            bytes
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]])),
        ),
        Quantization::F16 => out.extend(
            bytes
                .chunks_exact(2)
                .map(|c| f16::from_le_bytes([c[0], c[1]]).to_f32()),
        ),
        Quantization::I8 => {
            let scale = f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
            out.extend(
                bytes[4..]
                    .iter()
                    .map(|b| f32::from(i8::from_le_bytes([*b])) * scale),
            );
        },
        Quantization::B1 => {
            let words = bytes
                .chunks_exact(4)
                .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]));
            let mut remaining = dims;
            for word in words {
                for bit in 0..remaining.min(32) {
                    out.push(if word & (1 << bit) == 0 { -1.0 } else { 1.0 });
                }
                remaining = remaining.saturating_sub(32);
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(quantization: Quantization, values: &[f32]) -> Vec<f32> {
        let mut bytes = Vec::new();
        encode_into(quantization, values, &mut bytes);
        assert_eq!(bytes.len(), stride(quantization, values.len()));
        let mut out = Vec::new();
        decode_into(quantization, &bytes, values.len(), &mut out);
        assert_eq!(out.len(), values.len());
        out
    }

    #[test]
    fn test_f32_is_exact() {
        let values = [0.1, -2.5, 1e-7, 3.0e8];
        assert_eq!(roundtrip(Quantization::F32, &values), values);
    }

    #[test]
    fn test_f16_precision() {
        let values = [0.1, -2.5, 100.25];
        for (a, b) in roundtrip(Quantization::F16, &values).iter().zip(values) {
            assert!((a - b).abs() <= b.abs() * 1e-3);
        }
    }

    #[test]
    fn test_i8_scaled() {
        let values = [1.0, -0.5, 0.25, 0.0];
        let decoded = roundtrip(Quantization::I8, &values);
        for (a, b) in decoded.iter().zip(values) {
            assert!((a - b).abs() < 0.01, "{a} vs {b}");
        }
        assert_eq!(roundtrip(Quantization::I8, &[0.0; 3]), vec![0.0; 3]);
    }

    #[test]
    fn test_b1_signs() {
        let values: Vec<f32> = (0..40).map(|i| if i % 3 == 0 { 1.0 } else { -1.0 }).collect();
        assert_eq!(stride(Quantization::B1, 40), 8);
        assert_eq!(roundtrip(Quantization::B1, &values), values);
    }
}

//! # Weights — Layer Tables and the Delta Blob Wire Format
//!
//! A model's trainable state is an ordered list of named layers, each a flat
//! `f32` vector. The same layout serves two encodings:
//!
//! - **Model blobs** (magic `0x00`): uncompressed float32. Used for the
//!   global model artifacts stored in the model store, and as the fallback
//!   path for workers that cannot quantize.
//! - **Delta blobs** (magic `0x01`): float16-quantized and LZ4-compressed
//!   (raw block, no framing). This is what workers upload after local
//!   training; quantization is lossy, so the aggregator widens to f32 on
//!   read and accumulates in f64.
//!
//! ## Layout (after optional decompression)
//!
//! ```text
//! layer_count: u32 LE
//! per layer, in canonical order:
//!     name_len:   u32 LE
//!     name_utf8:  byte[name_len]
//!     elem_count: u32 LE
//!     values:     (f16 | f32) LE × elem_count
//! ```
//!
//! Canonical layer order is fixed per architecture; decode preserves input
//! order and the aggregator enforces equality against the global model.

use half::f16;
use thiserror::Error;

/// Hard ceilings on untrusted input. A real model never approaches these;
/// a malformed length prefix would otherwise drive a huge allocation.
const MAX_LAYERS: u32 = 4_096;
const MAX_NAME_LEN: u32 = 1_024;

pub const MAGIC_F32: u8 = 0x00;
pub const MAGIC_F16_LZ4: u8 = 0x01;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("empty blob")]
    Empty,
    #[error("unknown magic byte 0x{0:02x}")]
    BadMagic(u8),
    #[error("blob truncated at {context}")]
    Truncated { context: &'static str },
    #[error("layer count {0} exceeds limit {MAX_LAYERS}")]
    TooManyLayers(u32),
    #[error("layer name length {0} exceeds limit {MAX_NAME_LEN}")]
    NameTooLong(u32),
    #[error("layer name is not valid UTF-8")]
    BadName,
    #[error("declared decompressed size {declared} does not match actual {actual}")]
    SizeMismatch { declared: usize, actual: usize },
    #[error("LZ4 block decode failed: {0}")]
    Lz4(String),
    #[error("trailing garbage after last layer")]
    TrailingBytes,
}

/// One named layer of flat weights.
#[derive(Clone, Debug, PartialEq)]
pub struct Layer {
    pub name: String,
    pub values: Vec<f32>,
}

/// An ordered set of layers — a full model or a weight delta.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LayerTable {
    pub layers: Vec<Layer>,
}

impl LayerTable {
    pub fn new(layers: Vec<Layer>) -> Self {
        LayerTable { layers }
    }

    pub fn total_elems(&self) -> usize {
        self.layers.iter().map(|l| l.values.len()).sum()
    }

    /// True when `other` has the same layer names and sizes in the same
    /// order. The aggregator rejects submissions that fail this check.
    pub fn same_shape(&self, other: &LayerTable) -> bool {
        self.layers.len() == other.layers.len()
            && self
                .layers
                .iter()
                .zip(&other.layers)
                .all(|(a, b)| a.name == b.name && a.values.len() == b.values.len())
    }

    // ── Encoding ────────────────────────────────────────────────

    /// Encode as an uncompressed float32 blob (magic `0x00`).
    pub fn encode_f32(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + self.payload_size(4));
        out.push(MAGIC_F32);
        self.write_payload(&mut out, |values, out| {
            for v in values {
                out.extend_from_slice(&v.to_le_bytes());
            }
        });
        out
    }

    /// Encode as a quantized, LZ4-compressed delta blob (magic `0x01`).
    pub fn encode_f16_lz4(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(self.payload_size(2));
        self.write_payload(&mut payload, |values, out| {
            for v in values {
                out.extend_from_slice(&f16::from_f32(*v).to_le_bytes());
            }
        });
        let compressed = lz4_flex::compress(&payload);
        let mut out = Vec::with_capacity(5 + compressed.len());
        out.push(MAGIC_F16_LZ4);
        out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        out.extend_from_slice(&compressed);
        out
    }

    fn payload_size(&self, elem_bytes: usize) -> usize {
        4 + self
            .layers
            .iter()
            .map(|l| 8 + l.name.len() + l.values.len() * elem_bytes)
            .sum::<usize>()
    }

    fn write_payload(&self, out: &mut Vec<u8>, write_values: impl Fn(&[f32], &mut Vec<u8>)) {
        out.extend_from_slice(&(self.layers.len() as u32).to_le_bytes());
        for layer in &self.layers {
            out.extend_from_slice(&(layer.name.len() as u32).to_le_bytes());
            out.extend_from_slice(layer.name.as_bytes());
            out.extend_from_slice(&(layer.values.len() as u32).to_le_bytes());
            write_values(&layer.values, out);
        }
    }

    // ── Decoding ────────────────────────────────────────────────

    /// Decode a blob, dispatching on the magic byte.
    pub fn decode(blob: &[u8]) -> Result<LayerTable, CodecError> {
        let (&magic, rest) = blob.split_first().ok_or(CodecError::Empty)?;
        match magic {
            MAGIC_F32 => parse_payload(rest, 4, |bytes| {
                f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
            }),
            MAGIC_F16_LZ4 => {
                if rest.len() < 4 {
                    return Err(CodecError::Truncated {
                        context: "original_size",
                    });
                }
                let declared = u32::from_le_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
                let payload = lz4_flex::decompress(&rest[4..], declared)
                    .map_err(|e| CodecError::Lz4(e.to_string()))?;
                if payload.len() != declared {
                    return Err(CodecError::SizeMismatch {
                        declared,
                        actual: payload.len(),
                    });
                }
                parse_payload(&payload, 2, |bytes| {
                    f16::from_le_bytes([bytes[0], bytes[1]]).to_f32()
                })
            }
            other => Err(CodecError::BadMagic(other)),
        }
    }
}

fn parse_payload(
    payload: &[u8],
    elem_bytes: usize,
    read_elem: impl Fn(&[u8]) -> f32,
) -> Result<LayerTable, CodecError> {
    let mut cursor = Cursor::new(payload);
    let layer_count = cursor.read_u32("layer_count")?;
    if layer_count > MAX_LAYERS {
        return Err(CodecError::TooManyLayers(layer_count));
    }
    let mut layers = Vec::with_capacity(layer_count as usize);
    for _ in 0..layer_count {
        let name_len = cursor.read_u32("name_len")?;
        if name_len > MAX_NAME_LEN {
            return Err(CodecError::NameTooLong(name_len));
        }
        let name_bytes = cursor.read_bytes(name_len as usize, "name")?;
        let name = std::str::from_utf8(name_bytes)
            .map_err(|_| CodecError::BadName)?
            .to_string();
        let elem_count = cursor.read_u32("elem_count")? as usize;
        let value_bytes = cursor.read_bytes(elem_count * elem_bytes, "values")?;
        let values = value_bytes
            .chunks_exact(elem_bytes)
            .map(&read_elem)
            .collect();
        layers.push(Layer { name, values });
    }
    if !cursor.at_end() {
        return Err(CodecError::TrailingBytes);
    }
    Ok(LayerTable { layers })
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Cursor { data, pos: 0 }
    }

    fn read_bytes(&mut self, len: usize, context: &'static str) -> Result<&'a [u8], CodecError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&e| e <= self.data.len())
            .ok_or(CodecError::Truncated { context })?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn read_u32(&mut self, context: &'static str) -> Result<u32, CodecError> {
        let b = self.read_bytes(4, context)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn at_end(&self) -> bool {
        self.pos == self.data.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_table() -> LayerTable {
        LayerTable::new(vec![
            Layer {
                name: "conv1.weight".into(),
                values: vec![0.5, -1.25, 3.0, 0.0],
            },
            Layer {
                name: "conv1.bias".into(),
                values: vec![0.125],
            },
            Layer {
                name: "fc.weight".into(),
                values: (0..64).map(|i| i as f32 * 0.01).collect(),
            },
        ])
    }

    #[test]
    fn f32_roundtrip_is_exact() {
        let table = sample_table();
        let decoded = LayerTable::decode(&table.encode_f32()).unwrap();
        assert_eq!(decoded, table);
    }

    #[test]
    fn f16_roundtrip_within_quantization_tolerance() {
        let table = sample_table();
        let decoded = LayerTable::decode(&table.encode_f16_lz4()).unwrap();
        assert!(decoded.same_shape(&table));
        for (orig, got) in table.layers.iter().zip(&decoded.layers) {
            let max_abs = orig.values.iter().fold(0f32, |m, v| m.max(v.abs()));
            let tol = max_abs * 2f32.powi(-10);
            for (a, b) in orig.values.iter().zip(&got.values) {
                assert!((a - b).abs() <= tol, "{} vs {} (tol {})", a, b, tol);
            }
        }
    }

    #[test]
    fn f16_values_exactly_representable_survive() {
        // Powers of two and small integers are exact in f16
        let table = LayerTable::new(vec![Layer {
            name: "w".into(),
            values: vec![0.0, 1.0, -2.0, 0.5, 0.25, 1024.0],
        }]);
        let decoded = LayerTable::decode(&table.encode_f16_lz4()).unwrap();
        assert_eq!(decoded, table);
    }

    #[test]
    fn empty_blob_rejected() {
        assert_eq!(LayerTable::decode(&[]), Err(CodecError::Empty));
    }

    #[test]
    fn bad_magic_rejected() {
        let err = LayerTable::decode(&[0x7f, 0, 0, 0, 0]).unwrap_err();
        assert_eq!(err, CodecError::BadMagic(0x7f));
    }

    #[test]
    fn truncated_f32_blob_rejected() {
        let mut blob = sample_table().encode_f32();
        blob.truncate(blob.len() - 3);
        let err = LayerTable::decode(&blob).unwrap_err();
        assert!(matches!(err, CodecError::Truncated { .. }));
    }

    #[test]
    fn trailing_bytes_rejected() {
        let mut blob = sample_table().encode_f32();
        blob.push(0xff);
        assert_eq!(LayerTable::decode(&blob), Err(CodecError::TrailingBytes));
    }

    #[test]
    fn truncated_lz4_body_rejected() {
        let mut blob = sample_table().encode_f16_lz4();
        blob.truncate(blob.len() - 4);
        let err = LayerTable::decode(&blob).unwrap_err();
        assert!(matches!(err, CodecError::Lz4(_) | CodecError::SizeMismatch { .. }));
    }

    #[test]
    fn lying_original_size_rejected() {
        let mut blob = sample_table().encode_f16_lz4();
        // Inflate the declared decompressed size past the real payload
        let real = u32::from_le_bytes([blob[1], blob[2], blob[3], blob[4]]);
        blob[1..5].copy_from_slice(&(real + 64).to_le_bytes());
        let err = LayerTable::decode(&blob).unwrap_err();
        assert!(matches!(err, CodecError::Lz4(_) | CodecError::SizeMismatch { .. }));
    }

    #[test]
    fn oversized_layer_count_rejected() {
        let mut blob = vec![MAGIC_F32];
        blob.extend_from_slice(&u32::MAX.to_le_bytes());
        let err = LayerTable::decode(&blob).unwrap_err();
        assert_eq!(err, CodecError::TooManyLayers(u32::MAX));
    }

    #[test]
    fn oversized_name_rejected() {
        let mut blob = vec![MAGIC_F32];
        blob.extend_from_slice(&1u32.to_le_bytes());
        blob.extend_from_slice(&1_000_000u32.to_le_bytes());
        let err = LayerTable::decode(&blob).unwrap_err();
        assert_eq!(err, CodecError::NameTooLong(1_000_000));
    }

    #[test]
    fn non_utf8_name_rejected() {
        let mut blob = vec![MAGIC_F32];
        blob.extend_from_slice(&1u32.to_le_bytes());
        blob.extend_from_slice(&2u32.to_le_bytes());
        blob.extend_from_slice(&[0xff, 0xfe]);
        blob.extend_from_slice(&0u32.to_le_bytes());
        assert_eq!(LayerTable::decode(&blob), Err(CodecError::BadName));
    }

    #[test]
    fn same_shape_detects_mismatches() {
        let a = sample_table();
        let mut b = sample_table();
        assert!(a.same_shape(&b));

        b.layers[1].name = "conv1.beta".into();
        assert!(!a.same_shape(&b));

        let mut c = sample_table();
        c.layers[2].values.pop();
        assert!(!a.same_shape(&c));

        let mut d = sample_table();
        d.layers.pop();
        assert!(!a.same_shape(&d));
    }

    #[test]
    fn empty_table_roundtrips() {
        let empty = LayerTable::default();
        assert_eq!(LayerTable::decode(&empty.encode_f32()).unwrap(), empty);
        assert_eq!(LayerTable::decode(&empty.encode_f16_lz4()).unwrap(), empty);
    }

    #[test]
    fn compression_shrinks_repetitive_weights() {
        let table = LayerTable::new(vec![Layer {
            name: "zeros".into(),
            values: vec![0.0; 10_000],
        }]);
        let compressed = table.encode_f16_lz4();
        let raw = table.encode_f32();
        assert!(compressed.len() < raw.len() / 4);
    }
}

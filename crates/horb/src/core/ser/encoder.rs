// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Output cursor: application data to CDR bytes, possibly split across
//! multiple physical fragments.
//!
//! Alignment is always computed against the logical message body origin,
//! never the current fragment. A full buffer triggers an immediate
//! fragment emit through the [`FragmentSink`] before writing continues
//! (GIOP 1.0 cannot fragment and grows the buffer instead).

use super::{align_up, CdrError, CdrResult, CodeSet};
use crate::config::OrbConfig;
use crate::core::value::{ValueRef, MAX_CHUNK_LEN};
use crate::protocol::giop::{msg_type, MessageHeader};
use crate::protocol::policy::{stream_policy, StreamPolicy};
use std::collections::HashMap;

/// Consumer-side transport boundary: receives each flushed fragment as a
/// complete GIOP message (header included).
pub trait FragmentSink: Send {
    fn send(&mut self, fragment: Vec<u8>) -> CdrResult<()>;
}

impl FragmentSink for crossbeam::channel::Sender<Vec<u8>> {
    fn send(&mut self, fragment: Vec<u8>) -> CdrResult<()> {
        crossbeam::channel::Sender::send(self, fragment)
            .map_err(|_| CdrError::marshal("fragment sink disconnected"))
    }
}

/// Generate aligned write methods for fixed-width integers, plus the bulk
/// array form (defined as equivalent to a loop of scalar writes).
macro_rules! impl_write_scalar {
    ($name:ident, $array:ident, $ty:ty, $size:expr) => {
        pub fn $name(&mut self, value: $ty) -> CdrResult<()> {
            let bytes = if self.little_endian {
                value.to_le_bytes()
            } else {
                value.to_be_bytes()
            };
            self.write_primitive(&bytes, $size)
        }

        pub fn $array(&mut self, values: &[$ty]) -> CdrResult<()> {
            for value in values {
                self.$name(*value)?;
            }
            Ok(())
        }
    };
}

/// Output cursor over one logical GIOP message.
pub struct CdrEncoder {
    /// Body bytes of the fragment under construction.
    buf: Vec<u8>,
    /// Logical body bytes already emitted in earlier fragments.
    flushed: usize,
    little_endian: bool,
    policy: StreamPolicy,
    narrow: CodeSet,
    fragment_size: usize,
    msg_type: u8,
    request_id: u32,
    sink: Option<Box<dyn FragmentSink>>,
    first_emitted: bool,
    // Value-graph state (driven by core::value::encode).
    pub(crate) value_depth: u32,
    /// Number of enclosing chunked values; nested values inherit chunking.
    pub(crate) chunk_depth: u32,
    pub(crate) chunk_pending: bool,
    chunk_len_pos: Option<usize>,
    /// Value tag offsets keyed by cell address. The clone keeps the cell
    /// alive so its address cannot be reused while the table maps it.
    pub(crate) value_offsets: HashMap<usize, (usize, ValueRef)>,
    pub(crate) string_offsets: HashMap<String, usize>,
}

impl CdrEncoder {
    /// Buffered encoder: the whole body is collected in memory and turned
    /// into a single message by [`CdrEncoder::into_message`].
    pub fn new(config: &OrbConfig, msg_type: u8) -> Self {
        Self::build(config, msg_type, 0, None)
    }

    /// Streaming encoder: a full buffer is flushed to `sink` as a fragment
    /// and writing continues. `request_id` goes into GIOP 1.2 fragment
    /// headers.
    pub fn with_sink(
        config: &OrbConfig,
        msg_type: u8,
        request_id: u32,
        sink: Box<dyn FragmentSink>,
    ) -> Self {
        Self::build(config, msg_type, request_id, Some(sink))
    }

    fn build(
        config: &OrbConfig,
        msg_type: u8,
        request_id: u32,
        sink: Option<Box<dyn FragmentSink>>,
    ) -> Self {
        let policy = stream_policy(config.giop_version, &config.legacy);
        let mut enc = Self {
            buf: Vec::with_capacity(config.effective_fragment_size()),
            flushed: 0,
            little_endian: config.little_endian,
            policy,
            narrow: config.narrow_code_set,
            fragment_size: config.effective_fragment_size(),
            msg_type,
            request_id,
            sink,
            first_emitted: false,
            value_depth: 0,
            chunk_depth: 0,
            chunk_pending: false,
            chunk_len_pos: None,
            value_offsets: HashMap::new(),
            string_offsets: HashMap::new(),
        };
        if enc.policy.initial_eight_byte_align {
            // Body origin is offset 0, so this is a no-op pad today; kept
            // as a policy consultation so a future prologue stays correct.
            enc.pad_to(8);
        }
        enc
    }

    /// Logical position within the message body.
    pub fn pos(&self) -> usize {
        self.flushed + self.buf.len()
    }

    pub fn little_endian(&self) -> bool {
        self.little_endian
    }

    pub(crate) fn policy(&self) -> &StreamPolicy {
        &self.policy
    }

    // ------------------------------------------------------------------
    // Buffer primitives
    // ------------------------------------------------------------------

    fn pad_to(&mut self, alignment: usize) {
        let target = align_up(self.pos(), alignment);
        // Padding content is unspecified by the format; zeros by convention.
        for _ in self.pos()..target {
            self.buf.push(0);
        }
    }

    /// Open the lazily pending chunk: aligned length slot, patched on close.
    pub(crate) fn ensure_chunk(&mut self) -> CdrResult<()> {
        if self.chunk_pending && self.chunk_len_pos.is_none() {
            self.pad_to(4);
            self.chunk_len_pos = Some(self.buf.len());
            self.buf.extend_from_slice(&[0u8; 4]);
        }
        Ok(())
    }

    /// Patch the open chunk's length slot and leave chunked mode until the
    /// next [`ensure_chunk`].
    pub(crate) fn close_current_chunk(&mut self) -> CdrResult<()> {
        if let Some(slot) = self.chunk_len_pos.take() {
            let len = self.buf.len() - (slot + 4);
            if len as u32 >= MAX_CHUNK_LEN {
                return Err(CdrError::marshal(format!("chunk length {} too large", len)));
            }
            let bytes = if self.little_endian {
                (len as u32).to_le_bytes()
            } else {
                (len as u32).to_be_bytes()
            };
            self.buf[slot..slot + 4].copy_from_slice(&bytes);
        }
        self.chunk_pending = false;
        Ok(())
    }

    fn write_primitive(&mut self, bytes: &[u8], alignment: usize) -> CdrResult<()> {
        self.ensure_chunk()?;
        self.pad_to(alignment);
        self.buf.extend_from_slice(bytes);
        self.maybe_flush()
    }

    fn maybe_flush(&mut self) -> CdrResult<()> {
        if self.sink.is_none() || !self.policy.fragments_allowed {
            return Ok(());
        }
        if self.buf.len() < self.fragment_size {
            return Ok(());
        }
        self.emit(true)
    }

    /// Frame the current buffer as a GIOP message and hand it to the sink.
    fn emit(&mut self, more: bool) -> CdrResult<()> {
        // Fragment boundaries never land inside an open chunk: close it
        // here and let the next write reopen one.
        let reopen = self.chunk_len_pos.is_some();
        if reopen {
            self.close_current_chunk()?;
            self.chunk_pending = true;
        }

        let hdr_type = if self.first_emitted {
            msg_type::FRAGMENT
        } else {
            self.msg_type
        };
        let frag_id = self.first_emitted && self.policy.version == crate::GiopVersion::V1_2;
        let extra = if frag_id { 4 } else { 0 };
        let header = MessageHeader {
            version: self.policy.version,
            little_endian: self.little_endian,
            more_fragments: more,
            msg_type: hdr_type,
            body_len: (self.buf.len() + extra) as u32,
        };

        let mut out = Vec::with_capacity(crate::config::GIOP_HEADER_LEN + extra + self.buf.len());
        out.extend_from_slice(&header.encode());
        if frag_id {
            let id = if self.little_endian {
                self.request_id.to_le_bytes()
            } else {
                self.request_id.to_be_bytes()
            };
            out.extend_from_slice(&id);
        }
        out.extend_from_slice(&self.buf);

        log::debug!(
            "[Out] emit fragment type={} body={} more={}",
            hdr_type,
            self.buf.len(),
            more
        );
        self.flushed += self.buf.len();
        self.buf.clear();
        self.first_emitted = true;
        self.sink
            .as_mut()
            .ok_or_else(|| CdrError::marshal("emit without sink"))?
            .send(out)
    }

    // ------------------------------------------------------------------
    // Scalars
    // ------------------------------------------------------------------

    impl_write_scalar!(write_short, write_short_array, i16, 2);
    impl_write_scalar!(write_ushort, write_ushort_array, u16, 2);
    impl_write_scalar!(write_long, write_long_array, i32, 4);
    impl_write_scalar!(write_ulong, write_ulong_array, u32, 4);
    impl_write_scalar!(write_longlong, write_longlong_array, i64, 8);
    impl_write_scalar!(write_ulonglong, write_ulonglong_array, u64, 8);

    pub fn write_octet(&mut self, value: u8) -> CdrResult<()> {
        self.write_primitive(&[value], 1)
    }

    pub fn write_boolean(&mut self, value: bool) -> CdrResult<()> {
        self.write_octet(u8::from(value))
    }

    pub fn write_boolean_array(&mut self, values: &[bool]) -> CdrResult<()> {
        for value in values {
            self.write_boolean(*value)?;
        }
        Ok(())
    }

    pub fn write_float(&mut self, value: f32) -> CdrResult<()> {
        let bits = value.to_bits();
        let bytes = if self.little_endian {
            bits.to_le_bytes()
        } else {
            bits.to_be_bytes()
        };
        self.write_primitive(&bytes, 4)
    }

    pub fn write_float_array(&mut self, values: &[f32]) -> CdrResult<()> {
        for value in values {
            self.write_float(*value)?;
        }
        Ok(())
    }

    pub fn write_double(&mut self, value: f64) -> CdrResult<()> {
        let bits = value.to_bits();
        let bytes = if self.little_endian {
            bits.to_le_bytes()
        } else {
            bits.to_be_bytes()
        };
        self.write_primitive(&bytes, 8)
    }

    pub fn write_double_array(&mut self, values: &[f64]) -> CdrResult<()> {
        for value in values {
            self.write_double(*value)?;
        }
        Ok(())
    }

    /// A `char` is always one octet on the wire regardless of the string
    /// code set; characters outside Latin-1 are not representable.
    pub fn write_char(&mut self, value: char) -> CdrResult<()> {
        let code = value as u32;
        if code > 0xFF {
            return Err(CdrError::InvalidArgument {
                reason: format!("char U+{:04X} not encodable as a single octet", code),
            });
        }
        self.write_octet(code as u8)
    }

    pub fn write_char_array(&mut self, values: &[char]) -> CdrResult<()> {
        for value in values {
            self.write_char(*value)?;
        }
        Ok(())
    }

    pub fn write_octet_array(&mut self, values: &[u8]) -> CdrResult<()> {
        let mut rest = values;
        while !rest.is_empty() {
            self.ensure_chunk()?;
            let room = if self.sink.is_some() && self.policy.fragments_allowed {
                self.fragment_size.saturating_sub(self.buf.len()).max(1)
            } else {
                rest.len()
            };
            let n = room.min(rest.len());
            self.buf.extend_from_slice(&rest[..n]);
            rest = &rest[n..];
            self.maybe_flush()?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Text
    // ------------------------------------------------------------------

    /// Narrow string: 4-byte length including the trailing NUL (legacy
    /// convention retained for backward compatibility), then the encoded
    /// bytes in the negotiated narrow code set, then the NUL.
    pub fn write_string(&mut self, value: &str) -> CdrResult<()> {
        let bytes = encode_narrow(value, self.narrow)?;
        self.write_ulong((bytes.len() + 1) as u32)?;
        self.write_octet_array(&bytes)?;
        self.write_octet(0)
    }

    /// Like [`write_string`] but surfaces the null-string contract: `None`
    /// is a caller error, never silently encoded.
    pub fn write_string_opt(&mut self, value: Option<&str>) -> CdrResult<()> {
        match value {
            Some(s) => self.write_string(s),
            None => Err(CdrError::InvalidArgument {
                reason: "null string".into(),
            }),
        }
    }

    pub fn write_wchar(&mut self, value: char) -> CdrResult<()> {
        if !self.policy.wide_types_allowed {
            return Err(CdrError::marshal(format!(
                "wchar not permitted under GIOP {}",
                self.policy.version
            )));
        }
        let code = value as u32;
        if code > 0xFFFF {
            return Err(CdrError::InvalidArgument {
                reason: format!("wchar U+{:04X} outside the basic multilingual plane", code),
            });
        }
        let unit = code as u16;
        if self.policy.wchar_length_prefixed {
            // Length octet counts the bytes that follow; the BOM makes the
            // character decodable independent of the message byte order.
            self.write_octet(4)?;
            let mut bytes = [0u8; 4];
            bytes[..2].copy_from_slice(&0xFEFFu16.to_be_bytes());
            bytes[2..].copy_from_slice(&unit.to_be_bytes());
            self.write_primitive(&bytes, 1)
        } else {
            // 1.1, and 1.0 under the pre-patch legacy mode: a bare
            // fixed-width code unit in the message byte order.
            let bytes = if self.little_endian {
                unit.to_le_bytes()
            } else {
                unit.to_be_bytes()
            };
            self.write_primitive(&bytes, 2)
        }
    }

    pub fn write_wchar_array(&mut self, values: &[char]) -> CdrResult<()> {
        for value in values {
            self.write_wchar(*value)?;
        }
        Ok(())
    }

    pub fn write_wstring(&mut self, value: &str) -> CdrResult<()> {
        if !self.policy.wide_types_allowed {
            return Err(CdrError::marshal(format!(
                "wstring not permitted under GIOP {}",
                self.policy.version
            )));
        }
        let units: Vec<u16> = value.encode_utf16().collect();
        if self.policy.wstring_counts_bytes {
            // 1.2: length in bytes, no terminator; a leading BOM carries
            // the byte order of the units.
            self.write_ulong(((units.len() + 1) * 2) as u32)?;
            let mut bytes = Vec::with_capacity((units.len() + 1) * 2);
            bytes.extend_from_slice(&0xFEFFu16.to_be_bytes());
            for unit in &units {
                bytes.extend_from_slice(&unit.to_be_bytes());
            }
            self.write_octet_array(&bytes)?;
            Ok(())
        } else if self.policy.legacy_wide_fixed_width {
            // 1.0 pre-patch mode: unit count, no terminator, no markers.
            self.write_ulong(units.len() as u32)?;
            for unit in units {
                let bytes = if self.little_endian {
                    unit.to_le_bytes()
                } else {
                    unit.to_be_bytes()
                };
                self.write_primitive(&bytes, 2)?;
            }
            Ok(())
        } else {
            // 1.1: unit count including the trailing NUL unit.
            self.write_ulong((units.len() + 1) as u32)?;
            for unit in units {
                let bytes = if self.little_endian {
                    unit.to_le_bytes()
                } else {
                    unit.to_be_bytes()
                };
                self.write_primitive(&bytes, 2)?;
            }
            self.write_primitive(&0u16.to_be_bytes(), 2)
        }
    }

    pub fn write_wstring_opt(&mut self, value: Option<&str>) -> CdrResult<()> {
        match value {
            Some(s) => self.write_wstring(s),
            None => Err(CdrError::InvalidArgument {
                reason: "null wstring".into(),
            }),
        }
    }

    // ------------------------------------------------------------------
    // Finish
    // ------------------------------------------------------------------

    fn check_balanced(&self) -> CdrResult<()> {
        if self.value_depth > 0 {
            return Err(CdrError::InvalidArgument {
                reason: "message finished inside an open value".into(),
            });
        }
        Ok(())
    }

    /// Streaming mode: emit the final fragment with the more-fragments
    /// flag clear.
    pub fn finish(mut self) -> CdrResult<()> {
        self.check_balanced()?;
        if self.sink.is_none() {
            return Err(CdrError::InvalidArgument {
                reason: "finish() requires a fragment sink".into(),
            });
        }
        self.emit(false)
    }

    /// Buffered mode: frame the collected body as one complete message.
    pub fn into_message(self) -> CdrResult<Vec<u8>> {
        self.check_balanced()?;
        if self.sink.is_some() {
            return Err(CdrError::InvalidArgument {
                reason: "into_message() on a streaming encoder".into(),
            });
        }
        let header = MessageHeader {
            version: self.policy.version,
            little_endian: self.little_endian,
            more_fragments: false,
            msg_type: self.msg_type,
            body_len: self.buf.len() as u32,
        };
        let mut out = Vec::with_capacity(crate::config::GIOP_HEADER_LEN + self.buf.len());
        out.extend_from_slice(&header.encode());
        out.extend_from_slice(&self.buf);
        Ok(out)
    }

    /// Buffered mode: the raw body bytes without GIOP framing.
    pub fn into_body(self) -> CdrResult<Vec<u8>> {
        self.check_balanced()?;
        if self.sink.is_some() {
            return Err(CdrError::InvalidArgument {
                reason: "into_body() on a streaming encoder".into(),
            });
        }
        Ok(self.buf)
    }

    /// Write a value graph rooted at `value` (see `core::value::encode`).
    pub fn write_value(&mut self, value: Option<&ValueRef>) -> CdrResult<()> {
        crate::core::value::encode::write_value(self, value)
    }
}

pub(crate) fn encode_narrow(value: &str, code_set: CodeSet) -> CdrResult<Vec<u8>> {
    match code_set {
        CodeSet::Latin1 => {
            let mut out = Vec::with_capacity(value.len());
            for c in value.chars() {
                let code = c as u32;
                if code > 0xFF {
                    return Err(CdrError::InvalidArgument {
                        reason: format!("char U+{:04X} outside the narrow code set", code),
                    });
                }
                out.push(code as u8);
            }
            Ok(out)
        }
        CodeSet::Utf8 => Ok(value.as_bytes().to_vec()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::policy::GiopVersion;

    fn big_endian_config() -> OrbConfig {
        OrbConfig::default()
    }

    fn body(enc: CdrEncoder) -> Vec<u8> {
        enc.into_body().expect("buffered body")
    }

    #[test]
    fn test_alignment_pattern_from_message_origin() {
        let mut enc = CdrEncoder::new(&big_endian_config(), msg_type::REQUEST);
        enc.write_octet(4).unwrap();
        enc.write_short(-14).unwrap();
        enc.write_long(1).unwrap();
        enc.write_longlong(2).unwrap();
        let bytes = body(enc);
        // octet @0, pad @1, short @2, long @4, double-word @8.
        assert_eq!(bytes[0], 4);
        assert_eq!(bytes[1], 0);
        assert_eq!(&bytes[2..4], &(-14i16).to_be_bytes());
        assert_eq!(&bytes[4..8], &1i32.to_be_bytes());
        assert_eq!(&bytes[8..16], &2i64.to_be_bytes());
        assert_eq!(bytes.len(), 16);
    }

    #[test]
    fn test_little_endian_scalars() {
        let cfg = OrbConfig {
            little_endian: true,
            ..OrbConfig::default()
        };
        let mut enc = CdrEncoder::new(&cfg, msg_type::REQUEST);
        enc.write_ulong(0x0102_0304).unwrap();
        let bytes = body(enc);
        assert_eq!(bytes, vec![0x04, 0x03, 0x02, 0x01]);
    }

    #[test]
    fn test_string_has_length_and_nul() {
        let mut enc = CdrEncoder::new(&big_endian_config(), msg_type::REQUEST);
        enc.write_string("ab").unwrap();
        let bytes = body(enc);
        assert_eq!(&bytes[..4], &3u32.to_be_bytes());
        assert_eq!(&bytes[4..7], b"ab\0");
    }

    #[test]
    fn test_null_string_rejected() {
        let mut enc = CdrEncoder::new(&big_endian_config(), msg_type::REQUEST);
        match enc.write_string_opt(None) {
            Err(CdrError::InvalidArgument { .. }) => {}
            other => panic!("expected InvalidArgument, got {:?}", other),
        }
    }

    #[test]
    fn test_wstring_forbidden_on_giop_1_0() {
        let cfg = OrbConfig {
            giop_version: GiopVersion::V1_0,
            ..OrbConfig::default()
        };
        let mut enc = CdrEncoder::new(&cfg, msg_type::REQUEST);
        match enc.write_wstring("x") {
            Err(CdrError::Marshal { .. }) => {}
            other => panic!("expected Marshal, got {:?}", other),
        }
    }

    #[test]
    fn test_wchar_1_2_length_prefixed_with_bom() {
        let mut enc = CdrEncoder::new(&big_endian_config(), msg_type::REQUEST);
        enc.write_wchar('A').unwrap();
        let bytes = body(enc);
        assert_eq!(bytes, vec![4, 0xFE, 0xFF, 0x00, 0x41]);
    }

    #[test]
    fn test_wchar_1_1_bare_unit() {
        let cfg = OrbConfig {
            giop_version: GiopVersion::V1_1,
            ..OrbConfig::default()
        };
        let mut enc = CdrEncoder::new(&cfg, msg_type::REQUEST);
        enc.write_wchar('A').unwrap();
        let bytes = body(enc);
        assert_eq!(bytes, vec![0x00, 0x41]);
    }

    #[test]
    fn test_wstring_1_1_counts_units_with_nul() {
        let cfg = OrbConfig {
            giop_version: GiopVersion::V1_1,
            ..OrbConfig::default()
        };
        let mut enc = CdrEncoder::new(&cfg, msg_type::REQUEST);
        enc.write_wstring("hi").unwrap();
        let bytes = body(enc);
        assert_eq!(&bytes[..4], &3u32.to_be_bytes());
        assert_eq!(
            &bytes[4..10],
            &[0x00, b'h', 0x00, b'i', 0x00, 0x00]
        );
    }

    #[test]
    fn test_utf8_narrow_code_set() {
        let cfg = OrbConfig {
            narrow_code_set: CodeSet::Utf8,
            ..OrbConfig::default()
        };
        let mut enc = CdrEncoder::new(&cfg, msg_type::REQUEST);
        enc.write_string("héllo").unwrap();
        let bytes = body(enc);
        let expected = "héllo".as_bytes();
        assert_eq!(&bytes[..4], &((expected.len() + 1) as u32).to_be_bytes());
        assert_eq!(&bytes[4..4 + expected.len()], expected);
    }

    #[test]
    fn test_streaming_encoder_flushes_on_full_buffer() {
        let (tx, rx) = crossbeam::channel::unbounded();
        let cfg = OrbConfig {
            fragment_size: 64,
            ..OrbConfig::default()
        };
        let mut enc = CdrEncoder::with_sink(&cfg, msg_type::REQUEST, 9, Box::new(tx));
        enc.write_octet_array(&[0xAB; 200]).unwrap();
        enc.finish().unwrap();

        let frames: Vec<Vec<u8>> = rx.try_iter().collect();
        assert!(frames.len() >= 2, "200 bytes at 64/fragment must split");
        // First frame carries the request type, later ones Fragment.
        assert_eq!(frames[0][7], msg_type::REQUEST);
        for frame in &frames[1..] {
            assert_eq!(frame[7], msg_type::FRAGMENT);
        }
        // Only the last frame clears the more-fragments flag.
        for frame in &frames[..frames.len() - 1] {
            assert_ne!(frame[6] & 0x02, 0);
        }
        assert_eq!(frames[frames.len() - 1][6] & 0x02, 0);
    }

    #[test]
    fn test_giop_1_0_never_fragments() {
        let (tx, rx) = crossbeam::channel::unbounded();
        let cfg = OrbConfig {
            giop_version: GiopVersion::V1_0,
            fragment_size: 64,
            ..OrbConfig::default()
        };
        let mut enc = CdrEncoder::with_sink(&cfg, msg_type::REQUEST, 0, Box::new(tx));
        enc.write_octet_array(&[1; 500]).unwrap();
        enc.finish().unwrap();
        let frames: Vec<Vec<u8>> = rx.try_iter().collect();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].len(), 12 + 500);
    }
}

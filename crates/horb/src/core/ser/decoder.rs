// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Input cursor: CDR bytes back to application data.
//!
//! The cursor reads a logical body that may span several physical
//! fragments. A window of retained fragments backs the current position
//! (and the mark, when one is set); everything older is released to the
//! pool immediately. Running off the end of the window blocks on the
//! fragment queue with the configured timeout.
//!
//! Inside a chunked value the cursor refills chunks transparently: a data
//! read that lands on a chunk boundary consumes the next chunk length
//! before touching payload bytes, so callers never observe chunking.

use super::{align_up, CdrError, CdrResult, CodeSet, MAX_EAGER_ALLOC};
use crate::config::OrbConfig;
use crate::core::buffer::{BufferPool, Fragment, FragmentQueue};
use crate::core::value::{TypeRegistry, ValueRef, MAX_CHUNK_LEN};
use crate::protocol::giop::MessageHeader;
use crate::protocol::policy::{stream_policy, StreamPolicy};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
struct Mark {
    pos: usize,
    little_endian: bool,
    chunk_active: bool,
    chunk_end: usize,
}

macro_rules! impl_read_scalar {
    ($name:ident, $array:ident, $ty:ty, $size:expr) => {
        pub fn $name(&mut self) -> CdrResult<$ty> {
            let mut bytes = [0u8; $size];
            self.read_data(&mut bytes, $size)?;
            Ok(if self.little_endian {
                <$ty>::from_le_bytes(bytes)
            } else {
                <$ty>::from_be_bytes(bytes)
            })
        }

        pub fn $array(&mut self, len: usize) -> CdrResult<Vec<$ty>> {
            let mut out = Vec::with_capacity(len.min(MAX_EAGER_ALLOC));
            for _ in 0..len {
                out.push(self.$name()?);
            }
            Ok(out)
        }
    };
}

/// Input cursor over one logical GIOP message body.
pub struct CdrDecoder {
    queue: Arc<FragmentQueue>,
    window: VecDeque<Fragment>,
    /// Logical offset of the first byte of `window[0]`.
    window_base: usize,
    /// Logical offset one past the last windowed byte.
    window_end: usize,
    pos: usize,
    little_endian: bool,
    policy: StreamPolicy,
    narrow: CodeSet,
    timeout: Duration,
    mark: Option<Mark>,
    closed: bool,
    // Value-graph state (driven by core::value::decode).
    pub(crate) value_depth: u32,
    pub(crate) chunk_active: bool,
    pub(crate) chunk_end: usize,
    pub(crate) value_table: HashMap<usize, ValueRef>,
    pub(crate) id_table: HashMap<usize, String>,
    pub(crate) registry: Arc<TypeRegistry>,
}

impl CdrDecoder {
    /// Streaming cursor over a fragment queue fed by a
    /// [`crate::protocol::giop::Reassembler`]. Version and byte order come
    /// from the first message's header.
    pub fn new(queue: Arc<FragmentQueue>, header: &MessageHeader, config: &OrbConfig) -> Self {
        let policy = stream_policy(header.version, &config.legacy);
        Self::build(queue, header.little_endian, policy, config)
    }

    /// Cursor over an in-memory body using the configured version and
    /// byte order. No blocking ever happens: the body is complete.
    pub fn from_body(config: &OrbConfig, body: Vec<u8>) -> Self {
        let queue = FragmentQueue::new(BufferPool::new());
        queue.push(body, false);
        let policy = stream_policy(config.giop_version, &config.legacy);
        Self::build(queue, config.little_endian, policy, config)
    }

    /// Cursor over one complete, unfragmented GIOP message.
    pub fn from_message(config: &OrbConfig, message: &[u8]) -> CdrResult<Self> {
        let header = MessageHeader::decode(message)?;
        if header.more_fragments {
            return Err(CdrError::marshal(
                "fragmented message needs a reassembler-fed cursor",
            ));
        }
        let body = &message[crate::config::GIOP_HEADER_LEN..];
        if body.len() != header.body_len as usize {
            return Err(CdrError::marshal(format!(
                "body length mismatch: header says {}, message carries {}",
                header.body_len,
                body.len()
            )));
        }
        let queue = FragmentQueue::new(BufferPool::new());
        queue.push(body.to_vec(), false);
        let policy = stream_policy(header.version, &config.legacy);
        Ok(Self::build(queue, header.little_endian, policy, config))
    }

    fn build(
        queue: Arc<FragmentQueue>,
        little_endian: bool,
        policy: StreamPolicy,
        config: &OrbConfig,
    ) -> Self {
        let mut dec = Self {
            queue,
            window: VecDeque::new(),
            window_base: 0,
            window_end: 0,
            pos: 0,
            little_endian,
            policy,
            narrow: config.narrow_code_set,
            timeout: config.fragment_timeout,
            mark: None,
            closed: false,
            value_depth: 0,
            chunk_active: false,
            chunk_end: 0,
            value_table: HashMap::new(),
            id_table: HashMap::new(),
            registry: Arc::new(TypeRegistry::new()),
        };
        if dec.policy.initial_eight_byte_align {
            // Offset 0 is already 8-aligned; consulted so a future body
            // prologue keeps the same code path.
            debug_assert_eq!(align_up(dec.pos, 8), dec.pos);
        }
        dec
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn little_endian(&self) -> bool {
        self.little_endian
    }

    pub(crate) fn policy(&self) -> &StreamPolicy {
        &self.policy
    }

    /// Abort any blocked read and poison the queue for future ones.
    pub fn cancel(&self, reason: impl Into<String>) {
        self.queue.cancel(reason);
    }

    /// Registry consulted for value decode strategies. Unregistered
    /// chunked values are skipped as opaque; unregistered unchunked
    /// values are undecodable.
    pub fn set_registry(&mut self, registry: Arc<TypeRegistry>) {
        self.registry = registry;
    }

    // ------------------------------------------------------------------
    // Window machinery
    // ------------------------------------------------------------------

    fn ensure_window(&mut self, end: usize) -> CdrResult<()> {
        if self.closed {
            return Err(CdrError::marshal("read on a closed cursor"));
        }
        while self.window_end < end {
            let fragment = self.queue.next_fragment(self.timeout)?;
            self.window_end += fragment.len();
            self.window.push_back(fragment);
        }
        Ok(())
    }

    /// Drop windowed fragments no longer reachable from the position or
    /// the mark.
    fn release_consumed(&mut self) {
        let keep_from = match &self.mark {
            Some(mark) => mark.pos.min(self.pos),
            None => self.pos,
        };
        while let Some(front) = self.window.front() {
            let front_end = self.window_base + front.len();
            if front_end <= keep_from {
                self.window_base = front_end;
                self.window.pop_front();
            } else {
                break;
            }
        }
    }

    /// Copy `out.len()` bytes at the current position, ignoring chunk
    /// boundaries. The structural read used for tags and chunk lengths.
    fn fill_raw(&mut self, out: &mut [u8]) -> CdrResult<()> {
        let end = self.pos + out.len();
        self.ensure_window(end)?;
        let mut written = 0;
        let mut frag_start = self.window_base;
        for frag in &self.window {
            let frag_end = frag_start + frag.len();
            let want = self.pos + written;
            if frag_end > want {
                let src = want - frag_start;
                let n = (frag_end.min(end)) - want;
                out[written..written + n].copy_from_slice(&frag.as_slice()[src..src + n]);
                written += n;
                if written == out.len() {
                    break;
                }
            }
            frag_start = frag_end;
        }
        self.pos = end;
        self.release_consumed();
        Ok(())
    }

    fn skip_padding(&mut self, alignment: usize) -> CdrResult<()> {
        let target = align_up(self.pos, alignment);
        if target > self.pos {
            self.ensure_window(target)?;
            // Padding content is ignored, not validated.
            self.pos = target;
            self.release_consumed();
        }
        Ok(())
    }

    /// Bulk raw bytes. `n` comes off the wire and is untrusted: the buffer
    /// grows in bounded steps so truncation surfaces before a hostile
    /// length turns into a giant allocation.
    pub(crate) fn read_raw_bytes(&mut self, n: usize) -> CdrResult<Vec<u8>> {
        let mut out = Vec::with_capacity(n.min(MAX_EAGER_ALLOC));
        while out.len() < n {
            let step = (n - out.len()).min(MAX_EAGER_ALLOC);
            let start = out.len();
            out.resize(start + step, 0);
            self.fill_raw_range(&mut out, start, step)?;
        }
        Ok(out)
    }

    pub(crate) fn skip_raw(&mut self, n: usize) -> CdrResult<()> {
        self.ensure_window(self.pos + n)?;
        self.pos += n;
        self.release_consumed();
        Ok(())
    }

    /// Aligned structural long, outside chunk accounting.
    pub(crate) fn read_long_raw(&mut self) -> CdrResult<i32> {
        self.skip_padding(4)?;
        let mut bytes = [0u8; 4];
        self.fill_raw(&mut bytes)?;
        Ok(if self.little_endian {
            i32::from_le_bytes(bytes)
        } else {
            i32::from_be_bytes(bytes)
        })
    }

    pub(crate) fn read_ulong_raw(&mut self) -> CdrResult<u32> {
        self.read_long_raw().map(|v| v as u32)
    }

    /// Look at the next aligned long without consuming anything. The
    /// window copy bypasses `fill_raw` so no fragment gets released and
    /// the position stays put.
    pub(crate) fn peek_aligned_long(&mut self) -> CdrResult<i32> {
        let target = align_up(self.pos, 4);
        self.ensure_window(target + 4)?;
        let mut bytes = [0u8; 4];
        let mut written = 0;
        let mut frag_start = self.window_base;
        for frag in &self.window {
            let frag_end = frag_start + frag.len();
            let want = target + written;
            if frag_end > want {
                let src = want - frag_start;
                let n = frag_end.min(target + 4) - want;
                bytes[written..written + n].copy_from_slice(&frag.as_slice()[src..src + n]);
                written += n;
                if written == 4 {
                    break;
                }
            }
            frag_start = frag_end;
        }
        Ok(if self.little_endian {
            i32::from_le_bytes(bytes)
        } else {
            i32::from_be_bytes(bytes)
        })
    }

    /// Position the next aligned long will be read from.
    pub(crate) fn aligned_pos(&self) -> usize {
        align_up(self.pos, 4)
    }

    // ------------------------------------------------------------------
    // Chunk accounting
    // ------------------------------------------------------------------

    /// Consume the next chunk length when the current chunk is exhausted.
    pub(crate) fn refill_chunk(&mut self) -> CdrResult<()> {
        let len = self.read_long_raw()?;
        if len <= 0 || len as u32 >= MAX_CHUNK_LEN {
            return Err(CdrError::marshal(format!(
                "expected chunk continuation, found {}",
                len
            )));
        }
        self.chunk_end = self.pos + len as usize;
        Ok(())
    }

    /// Data read: chunk refill, padding skip, then payload bytes.
    fn read_data(&mut self, out: &mut [u8], alignment: usize) -> CdrResult<()> {
        if self.chunk_active && self.pos >= self.chunk_end {
            self.refill_chunk()?;
        }
        self.skip_padding(alignment)?;
        self.fill_raw(out)
    }

    // ------------------------------------------------------------------
    // Scalars
    // ------------------------------------------------------------------

    impl_read_scalar!(read_short, read_short_array, i16, 2);
    impl_read_scalar!(read_ushort, read_ushort_array, u16, 2);
    impl_read_scalar!(read_long, read_long_array, i32, 4);
    impl_read_scalar!(read_ulong, read_ulong_array, u32, 4);
    impl_read_scalar!(read_longlong, read_longlong_array, i64, 8);
    impl_read_scalar!(read_ulonglong, read_ulonglong_array, u64, 8);

    pub fn read_octet(&mut self) -> CdrResult<u8> {
        let mut byte = [0u8; 1];
        self.read_data(&mut byte, 1)?;
        Ok(byte[0])
    }

    pub fn read_boolean(&mut self) -> CdrResult<bool> {
        Ok(self.read_octet()? != 0)
    }

    pub fn read_boolean_array(&mut self, len: usize) -> CdrResult<Vec<bool>> {
        let mut out = Vec::with_capacity(len.min(MAX_EAGER_ALLOC));
        for _ in 0..len {
            out.push(self.read_boolean()?);
        }
        Ok(out)
    }

    pub fn read_float(&mut self) -> CdrResult<f32> {
        let mut bytes = [0u8; 4];
        self.read_data(&mut bytes, 4)?;
        let bits = if self.little_endian {
            u32::from_le_bytes(bytes)
        } else {
            u32::from_be_bytes(bytes)
        };
        Ok(f32::from_bits(bits))
    }

    pub fn read_float_array(&mut self, len: usize) -> CdrResult<Vec<f32>> {
        let mut out = Vec::with_capacity(len.min(MAX_EAGER_ALLOC));
        for _ in 0..len {
            out.push(self.read_float()?);
        }
        Ok(out)
    }

    pub fn read_double(&mut self) -> CdrResult<f64> {
        let mut bytes = [0u8; 8];
        self.read_data(&mut bytes, 8)?;
        let bits = if self.little_endian {
            u64::from_le_bytes(bytes)
        } else {
            u64::from_be_bytes(bytes)
        };
        Ok(f64::from_bits(bits))
    }

    pub fn read_double_array(&mut self, len: usize) -> CdrResult<Vec<f64>> {
        let mut out = Vec::with_capacity(len.min(MAX_EAGER_ALLOC));
        for _ in 0..len {
            out.push(self.read_double()?);
        }
        Ok(out)
    }

    pub fn read_char(&mut self) -> CdrResult<char> {
        let byte = self.read_octet()?;
        Ok(char::from(byte))
    }

    pub fn read_char_array(&mut self, len: usize) -> CdrResult<Vec<char>> {
        let mut out = Vec::with_capacity(len.min(MAX_EAGER_ALLOC));
        for _ in 0..len {
            out.push(self.read_char()?);
        }
        Ok(out)
    }

    /// Bulk octets, chunk-split aware: a writer-side fragment flush may
    /// have divided the run over several chunks.
    pub fn read_octet_array(&mut self, len: usize) -> CdrResult<Vec<u8>> {
        let mut out = Vec::with_capacity(len.min(MAX_EAGER_ALLOC));
        let mut filled = 0;
        while filled < len {
            let want = if self.chunk_active {
                if self.pos >= self.chunk_end {
                    self.refill_chunk()?;
                }
                (self.chunk_end - self.pos).min(len - filled)
            } else {
                len - filled
            };
            // Wire-declared length; grow in bounded steps.
            let step = want.min(MAX_EAGER_ALLOC);
            out.resize(filled + step, 0);
            self.fill_raw_range(&mut out, filled, step)?;
            filled += step;
        }
        Ok(out)
    }

    fn fill_raw_range(&mut self, out: &mut [u8], start: usize, n: usize) -> CdrResult<()> {
        self.fill_raw(&mut out[start..start + n])
    }

    // ------------------------------------------------------------------
    // Text
    // ------------------------------------------------------------------

    /// Narrow string: the length includes the trailing NUL, which is
    /// consumed and stripped. A zero length is tolerated as the empty
    /// string for interoperability with old encoders.
    pub fn read_string(&mut self) -> CdrResult<String> {
        let len = self.read_ulong()? as usize;
        if len == 0 {
            return Ok(String::new());
        }
        let bytes = self.read_octet_array(len)?;
        let body = match bytes.last() {
            Some(0) => &bytes[..len - 1],
            _ => &bytes[..],
        };
        match self.narrow {
            CodeSet::Latin1 => Ok(body.iter().map(|&b| char::from(b)).collect()),
            CodeSet::Utf8 => String::from_utf8(body.to_vec())
                .map_err(|_| CdrError::marshal("string body is not valid UTF-8")),
        }
    }

    pub fn read_wchar(&mut self) -> CdrResult<char> {
        if !self.policy.wide_types_allowed {
            return Err(CdrError::marshal(format!(
                "wchar not permitted under GIOP {}",
                self.policy.version
            )));
        }
        let unit = if self.policy.wchar_length_prefixed {
            let n = self.read_octet()? as usize;
            if n < 2 || n > 4 {
                return Err(CdrError::marshal(format!("bad wchar length {}", n)));
            }
            let bytes = self.read_octet_array(n)?;
            let (order, payload) = split_bom(&bytes, self.little_endian);
            if payload.len() != 2 {
                return Err(CdrError::marshal("wchar is not a single UTF-16 unit"));
            }
            unit_from(payload[0], payload[1], order)
        } else {
            self.read_ushort()?
        };
        char::from_u32(u32::from(unit))
            .ok_or_else(|| CdrError::marshal(format!("wchar unit {:#06X} is not a character", unit)))
    }

    pub fn read_wchar_array(&mut self, len: usize) -> CdrResult<Vec<char>> {
        let mut out = Vec::with_capacity(len.min(MAX_EAGER_ALLOC));
        for _ in 0..len {
            out.push(self.read_wchar()?);
        }
        Ok(out)
    }

    pub fn read_wstring(&mut self) -> CdrResult<String> {
        if !self.policy.wide_types_allowed {
            return Err(CdrError::marshal(format!(
                "wstring not permitted under GIOP {}",
                self.policy.version
            )));
        }
        if self.policy.wstring_counts_bytes {
            // 1.2: byte count, optional BOM, no terminator.
            let byte_len = self.read_ulong()? as usize;
            if byte_len == 0 {
                return Ok(String::new());
            }
            if byte_len % 2 != 0 {
                return Err(CdrError::marshal(format!("odd wstring byte count {}", byte_len)));
            }
            let bytes = self.read_octet_array(byte_len)?;
            let (order, payload) = split_bom(&bytes, self.little_endian);
            let units: Vec<u16> = payload
                .chunks_exact(2)
                .map(|pair| unit_from(pair[0], pair[1], order))
                .collect();
            String::from_utf16(&units)
                .map_err(|_| CdrError::marshal("wstring is not valid UTF-16"))
        } else if self.policy.legacy_wide_fixed_width {
            // 1.0 pre-patch: unit count, no terminator.
            let unit_len = self.read_ulong()? as usize;
            let units = self.read_ushort_array(unit_len)?;
            String::from_utf16(&units)
                .map_err(|_| CdrError::marshal("wstring is not valid UTF-16"))
        } else {
            // 1.1: unit count including the trailing NUL unit.
            let unit_len = self.read_ulong()? as usize;
            if unit_len == 0 {
                return Ok(String::new());
            }
            let mut units = self.read_ushort_array(unit_len)?;
            match units.pop() {
                Some(0) => {}
                _ => return Err(CdrError::marshal("wstring missing NUL terminator")),
            }
            String::from_utf16(&units)
                .map_err(|_| CdrError::marshal("wstring is not valid UTF-16"))
        }
    }

    /// Read an `Option<ValueRef>` graph (see `core::value::decode`).
    pub fn read_value(&mut self) -> CdrResult<Option<ValueRef>> {
        crate::core::value::decode::read_value(self)
    }

    // ------------------------------------------------------------------
    // Mark / reset
    // ------------------------------------------------------------------

    /// Remember the current position. Fragments stay retained from here
    /// until [`reset`](Self::reset) or [`clear_mark`](Self::clear_mark).
    /// A second mark replaces the first.
    pub fn mark(&mut self) {
        self.mark = Some(Mark {
            pos: self.pos,
            little_endian: self.little_endian,
            chunk_active: self.chunk_active,
            chunk_end: self.chunk_end,
        });
    }

    /// Rewind to the mark. The mark stays armed for further resets.
    pub fn reset(&mut self) -> CdrResult<()> {
        let mark = self.mark.ok_or_else(|| CdrError::InvalidArgument {
            reason: "reset without a mark".into(),
        })?;
        self.pos = mark.pos;
        self.little_endian = mark.little_endian;
        self.chunk_active = mark.chunk_active;
        self.chunk_end = mark.chunk_end;
        Ok(())
    }

    /// Discard the mark and release any fragments it alone was retaining.
    pub fn clear_mark(&mut self) {
        self.mark = None;
        self.release_consumed();
    }

    /// Release the window and drain undelivered fragments. Idempotent.
    pub fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.mark = None;
            self.window.clear();
            self.queue.drain();
        }
    }
}

impl Drop for CdrDecoder {
    fn drop(&mut self) {
        self.close();
    }
}

/// Resolve the byte order of a UTF-16 run from its optional BOM.
/// Returns (little_endian, payload without the BOM).
fn split_bom(bytes: &[u8], fallback_little: bool) -> (bool, &[u8]) {
    match bytes {
        [0xFE, 0xFF, rest @ ..] => (false, rest),
        [0xFF, 0xFE, rest @ ..] => (true, rest),
        _ => (fallback_little, bytes),
    }
}

fn unit_from(a: u8, b: u8, little_endian: bool) -> u16 {
    if little_endian {
        u16::from_le_bytes([a, b])
    } else {
        u16::from_be_bytes([a, b])
    }
}

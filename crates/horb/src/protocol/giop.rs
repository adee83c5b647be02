// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! GIOP message framing: the 12-byte header codec and the reassembler
//! that turns raw transport messages back into a body-byte stream.

use crate::config::{LegacyConfig, GIOP_HEADER_LEN};
use crate::core::buffer::FragmentQueue;
use crate::core::ser::{CdrError, CdrResult};
use crate::protocol::policy::{stream_policy, GiopVersion};
use std::sync::Arc;

pub const GIOP_MAGIC: [u8; 4] = *b"GIOP";

/// Flags octet, bit 0: body scalars are little-endian.
pub const FLAG_LITTLE_ENDIAN: u8 = 0x01;
/// Flags octet, bit 1: at least one more fragment follows (GIOP >= 1.1).
pub const FLAG_MORE_FRAGMENTS: u8 = 0x02;

/// GIOP message type octets.
pub mod msg_type {
    pub const REQUEST: u8 = 0;
    pub const REPLY: u8 = 1;
    pub const CANCEL_REQUEST: u8 = 2;
    pub const LOCATE_REQUEST: u8 = 3;
    pub const LOCATE_REPLY: u8 = 4;
    pub const CLOSE_CONNECTION: u8 = 5;
    pub const MESSAGE_ERROR: u8 = 6;
    pub const FRAGMENT: u8 = 7;

    pub(crate) const MAX: u8 = FRAGMENT;
}

/// Decoded 12-byte GIOP message header.
///
/// The header itself is version-invariant; `body_len` counts the bytes
/// after the header in the header's own byte order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub version: GiopVersion,
    pub little_endian: bool,
    pub more_fragments: bool,
    pub msg_type: u8,
    pub body_len: u32,
}

impl MessageHeader {
    pub fn encode(&self) -> [u8; GIOP_HEADER_LEN] {
        let mut out = [0u8; GIOP_HEADER_LEN];
        out[..4].copy_from_slice(&GIOP_MAGIC);
        out[4] = self.version.major();
        out[5] = self.version.minor();
        let mut flags = 0u8;
        if self.little_endian {
            flags |= FLAG_LITTLE_ENDIAN;
        }
        if self.more_fragments {
            flags |= FLAG_MORE_FRAGMENTS;
        }
        out[6] = flags;
        out[7] = self.msg_type;
        let len = if self.little_endian {
            self.body_len.to_le_bytes()
        } else {
            self.body_len.to_be_bytes()
        };
        out[8..].copy_from_slice(&len);
        out
    }

    pub fn decode(bytes: &[u8]) -> CdrResult<Self> {
        if bytes.len() < GIOP_HEADER_LEN {
            return Err(CdrError::UnexpectedEndOfData);
        }
        if bytes[..4] != GIOP_MAGIC {
            return Err(CdrError::marshal("bad GIOP magic"));
        }
        let version = GiopVersion::from_parts(bytes[4], bytes[5]).ok_or_else(|| {
            CdrError::marshal(format!("unsupported GIOP version {}.{}", bytes[4], bytes[5]))
        })?;
        let flags = bytes[6];
        let msg_type = bytes[7];
        if msg_type > msg_type::MAX {
            return Err(CdrError::marshal(format!("unknown message type {}", msg_type)));
        }
        let little_endian = flags & FLAG_LITTLE_ENDIAN != 0;
        let more_fragments = flags & FLAG_MORE_FRAGMENTS != 0;
        if more_fragments && version == GiopVersion::V1_0 {
            return Err(CdrError::marshal("fragmented message under GIOP 1.0"));
        }
        let mut len = [0u8; 4];
        len.copy_from_slice(&bytes[8..12]);
        let body_len = if little_endian {
            u32::from_le_bytes(len)
        } else {
            u32::from_be_bytes(len)
        };
        Ok(Self {
            version,
            little_endian,
            more_fragments,
            msg_type,
            body_len,
        })
    }
}

/// Accepts raw GIOP messages from the transport, validates the framing
/// and pushes body bytes into a [`FragmentQueue`].
///
/// The first message fixes the version, byte order and message type of
/// the exchange; every continuation must be a Fragment message agreeing
/// with it. Under GIOP 1.2 the fragment request id is stripped here and
/// checked against the id of the first fragment seen.
pub struct Reassembler {
    queue: Arc<FragmentQueue>,
    legacy: LegacyConfig,
    first: Option<MessageHeader>,
    request_id: Option<u32>,
    complete: bool,
}

impl Reassembler {
    pub fn new(queue: Arc<FragmentQueue>, legacy: LegacyConfig) -> Self {
        Self {
            queue,
            legacy,
            first: None,
            request_id: None,
            complete: false,
        }
    }

    /// Header of the first message, once seen.
    pub fn header(&self) -> Option<&MessageHeader> {
        self.first.as_ref()
    }

    /// Validate one complete transport message (header plus body) and
    /// queue its payload.
    pub fn feed(&mut self, message: &[u8]) -> CdrResult<()> {
        if self.complete {
            return Err(CdrError::marshal("fragment after final fragment"));
        }
        let header = MessageHeader::decode(message)?;
        let body = &message[GIOP_HEADER_LEN..];
        if body.len() != header.body_len as usize {
            return Err(CdrError::marshal(format!(
                "body length mismatch: header says {}, message carries {}",
                header.body_len,
                body.len()
            )));
        }

        let payload = match &self.first {
            None => {
                if header.more_fragments {
                    let policy = stream_policy(header.version, &self.legacy);
                    if !policy.fragments_allowed {
                        return Err(CdrError::marshal(format!(
                            "GIOP {} cannot fragment",
                            header.version
                        )));
                    }
                }
                self.first = Some(header);
                body
            }
            Some(first) => {
                if header.msg_type != msg_type::FRAGMENT {
                    return Err(CdrError::marshal(format!(
                        "expected Fragment continuation, got type {}",
                        header.msg_type
                    )));
                }
                if header.version != first.version {
                    return Err(CdrError::marshal(format!(
                        "fragment version {} does not match message version {}",
                        header.version, first.version
                    )));
                }
                if header.little_endian != first.little_endian {
                    return Err(CdrError::marshal("fragment byte order flipped mid-message"));
                }
                if header.version == GiopVersion::V1_2 {
                    // 1.2 fragments carry the request id right after the
                    // header; it is framing, not body data.
                    if body.len() < 4 {
                        return Err(CdrError::marshal("1.2 fragment too short for request id"));
                    }
                    let mut id = [0u8; 4];
                    id.copy_from_slice(&body[..4]);
                    let id = if header.little_endian {
                        u32::from_le_bytes(id)
                    } else {
                        u32::from_be_bytes(id)
                    };
                    match self.request_id {
                        None => self.request_id = Some(id),
                        Some(expected) if expected != id => {
                            return Err(CdrError::marshal(format!(
                                "fragment request id {} does not match {}",
                                id, expected
                            )));
                        }
                        Some(_) => {}
                    }
                    &body[4..]
                } else {
                    body
                }
            }
        };

        self.complete = !header.more_fragments;
        self.queue.push(payload.to_vec(), header.more_fragments);
        Ok(())
    }

    /// True once the message with the more-fragments flag clear arrived.
    pub fn is_complete(&self) -> bool {
        self.complete
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::buffer::BufferPool;
    use std::time::Duration;

    fn header_bytes(version: GiopVersion, flags: u8, ty: u8, len: u32) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(b"GIOP");
        out.push(version.major());
        out.push(version.minor());
        out.push(flags);
        out.push(ty);
        if flags & FLAG_LITTLE_ENDIAN != 0 {
            out.extend_from_slice(&len.to_le_bytes());
        } else {
            out.extend_from_slice(&len.to_be_bytes());
        }
        out
    }

    #[test]
    fn test_header_round_trip() {
        let header = MessageHeader {
            version: GiopVersion::V1_2,
            little_endian: true,
            more_fragments: true,
            msg_type: msg_type::REPLY,
            body_len: 300,
        };
        let bytes = header.encode();
        assert_eq!(&bytes[..4], b"GIOP");
        assert_eq!(MessageHeader::decode(&bytes).unwrap(), header);
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut bytes = header_bytes(GiopVersion::V1_2, 0, msg_type::REQUEST, 0);
        bytes[0] = b'X';
        match MessageHeader::decode(&bytes) {
            Err(CdrError::Marshal { .. }) => {}
            other => panic!("expected Marshal, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_version_rejected() {
        let mut bytes = header_bytes(GiopVersion::V1_2, 0, msg_type::REQUEST, 0);
        bytes[5] = 9;
        assert!(MessageHeader::decode(&bytes).is_err());
    }

    #[test]
    fn test_fragment_flag_invalid_on_1_0() {
        let bytes = header_bytes(GiopVersion::V1_0, FLAG_MORE_FRAGMENTS, msg_type::REQUEST, 0);
        assert!(MessageHeader::decode(&bytes).is_err());
    }

    fn reassembler() -> (Reassembler, Arc<FragmentQueue>) {
        let queue = FragmentQueue::new(BufferPool::new());
        (
            Reassembler::new(Arc::clone(&queue), LegacyConfig::default()),
            queue,
        )
    }

    #[test]
    fn test_single_message_feeds_body() {
        let (mut asm, queue) = reassembler();
        let mut msg = header_bytes(GiopVersion::V1_2, 0, msg_type::REQUEST, 3);
        msg.extend_from_slice(&[1, 2, 3]);
        asm.feed(&msg).unwrap();
        assert!(asm.is_complete());

        let frag = queue.next_fragment(Duration::from_millis(10)).unwrap();
        assert_eq!(frag.as_slice(), &[1, 2, 3]);
    }

    #[test]
    fn test_1_2_fragment_request_id_stripped_and_checked() {
        let (mut asm, queue) = reassembler();
        let mut first = header_bytes(GiopVersion::V1_2, FLAG_MORE_FRAGMENTS, msg_type::REQUEST, 2);
        first.extend_from_slice(&[0xAA, 0xBB]);
        asm.feed(&first).unwrap();

        let mut cont = header_bytes(GiopVersion::V1_2, 0, msg_type::FRAGMENT, 6);
        cont.extend_from_slice(&77u32.to_be_bytes());
        cont.extend_from_slice(&[0xCC, 0xDD]);
        asm.feed(&cont).unwrap();
        assert!(asm.is_complete());

        let a = queue.next_fragment(Duration::from_millis(10)).unwrap();
        assert_eq!(a.as_slice(), &[0xAA, 0xBB]);
        let b = queue.next_fragment(Duration::from_millis(10)).unwrap();
        // Request id stripped: only payload bytes reach the queue.
        assert_eq!(b.as_slice(), &[0xCC, 0xDD]);
    }

    #[test]
    fn test_mismatched_fragment_request_id_rejected() {
        let (mut asm, _queue) = reassembler();
        let first = header_bytes(GiopVersion::V1_2, FLAG_MORE_FRAGMENTS, msg_type::REQUEST, 0);
        asm.feed(&first).unwrap();

        let mut cont = header_bytes(GiopVersion::V1_2, FLAG_MORE_FRAGMENTS, msg_type::FRAGMENT, 4);
        cont.extend_from_slice(&5u32.to_be_bytes());
        asm.feed(&cont).unwrap();

        let mut bad = header_bytes(GiopVersion::V1_2, 0, msg_type::FRAGMENT, 4);
        bad.extend_from_slice(&6u32.to_be_bytes());
        assert!(asm.feed(&bad).is_err());
    }

    #[test]
    fn test_continuation_must_be_fragment_type() {
        let (mut asm, _queue) = reassembler();
        let first = header_bytes(GiopVersion::V1_1, FLAG_MORE_FRAGMENTS, msg_type::REQUEST, 0);
        asm.feed(&first).unwrap();
        let next = header_bytes(GiopVersion::V1_1, 0, msg_type::REQUEST, 0);
        assert!(asm.feed(&next).is_err());
    }

    #[test]
    fn test_feed_after_complete_rejected() {
        let (mut asm, _queue) = reassembler();
        let msg = header_bytes(GiopVersion::V1_1, 0, msg_type::REQUEST, 0);
        asm.feed(&msg).unwrap();
        let late = header_bytes(GiopVersion::V1_1, 0, msg_type::FRAGMENT, 0);
        assert!(asm.feed(&late).is_err());
    }

    #[test]
    fn test_body_length_mismatch_rejected() {
        let (mut asm, _queue) = reassembler();
        let mut msg = header_bytes(GiopVersion::V1_1, 0, msg_type::REQUEST, 5);
        msg.extend_from_slice(&[0; 3]);
        assert!(asm.feed(&msg).is_err());
    }
}

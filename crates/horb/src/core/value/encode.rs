// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Value graph writer.
//!
//! Sharing and cycles are preserved through the offset table: the first
//! encoding of a cell records the stream offset of its value tag, and any
//! later write of the same cell (by identity) emits an indirection to it.
//! Repository id and codebase strings go through the same mechanism with
//! their own table.
//!
//! Chunking is contagious: any value nested inside a chunked value is
//! itself chunked, and the parent's current chunk is closed before any
//! nested element (null, indirection or inline value) is written.

use super::{
    Field, FieldKind, ValueBody, ValueRef, INDIRECTION_TAG, REPO_ID_SINGLE, TAG_CHUNKED,
    TAG_CODEBASE, VALUE_TAG_BASE,
};
use crate::core::ser::encoder::CdrEncoder;
use crate::core::ser::{align_up, CdrError, CdrResult};
use std::sync::Arc;

pub(crate) fn write_value(enc: &mut CdrEncoder, value: Option<&ValueRef>) -> CdrResult<()> {
    let parent_chunked = enc.chunk_depth > 0;
    if parent_chunked {
        // A chunk never contains a value element; the next data write
        // after the element reopens one.
        enc.close_current_chunk()?;
    }
    match value {
        None => enc.write_ulong(0)?,
        Some(v) => {
            let key = Arc::as_ptr(v) as usize;
            let known = enc.value_offsets.get(&key).map(|(target, _)| *target);
            match known {
                Some(target) => write_indirection(enc, target)?,
                None => write_value_body(enc, v)?,
            }
        }
    }
    if parent_chunked {
        enc.chunk_pending = true;
    }
    Ok(())
}

/// Indirection: the marker tag, then a signed offset from the offset
/// field's own position back to the target's tag.
fn write_indirection(enc: &mut CdrEncoder, target: usize) -> CdrResult<()> {
    enc.write_ulong(INDIRECTION_TAG)?;
    let here = enc.pos();
    enc.write_long(indirection_delta(target, here)?)
}

/// The wire offset is a signed long; a logical stream long enough to
/// overflow it cannot express this back-reference.
fn indirection_delta(target: usize, here: usize) -> CdrResult<i32> {
    let delta = target as i64 - here as i64;
    i32::try_from(delta)
        .map_err(|_| CdrError::marshal(format!("indirection offset {} exceeds signed long", delta)))
}

fn write_value_body(enc: &mut CdrEncoder, v: &ValueRef) -> CdrResult<()> {
    let body = v.body();
    let is_custom = matches!(body, ValueBody::Custom { .. });
    let chunked = v.chunked() || is_custom || enc.chunk_depth > 0;

    let mut tag = VALUE_TAG_BASE | REPO_ID_SINGLE;
    if v.codebase().is_some() {
        tag |= TAG_CODEBASE;
    }
    if chunked {
        tag |= TAG_CHUNKED;
    }

    let tag_pos = align_up(enc.pos(), 4);
    enc.write_ulong(tag)?;
    // The table entry pins the cell: a caller dropping it must not let a
    // later allocation reuse its address and alias this offset.
    enc.value_offsets
        .insert(Arc::as_ptr(v) as usize, (tag_pos, Arc::clone(v)));

    // Header (codebase, repository id) sits outside the chunked region.
    if let Some(codebase) = v.codebase() {
        write_indirectable_string(enc, codebase)?;
    }
    write_indirectable_string(enc, v.repo_id())?;

    enc.value_depth += 1;
    if chunked {
        enc.chunk_depth += 1;
        enc.chunk_pending = true;
    }

    match body {
        ValueBody::Pending => {
            return Err(CdrError::InvalidArgument {
                reason: format!("value {} has no body to encode", v.repo_id()),
            });
        }
        ValueBody::Fields(fields) => {
            for field in &fields {
                write_field(enc, field)?;
            }
        }
        ValueBody::Custom {
            format,
            default_data,
            data,
        } => {
            enc.write_octet(format)?;
            enc.write_boolean(default_data)?;
            if data.is_empty() && enc.policy().empty_optional_marker {
                // Stream format 2 marks absent optional data explicitly.
                enc.write_ulong(0)?;
            } else {
                enc.write_octet_array(&data)?;
            }
        }
        ValueBody::Opaque(data) => {
            enc.write_octet_array(&data)?;
        }
    }

    if chunked {
        enc.close_current_chunk()?;
        // One end tag per level, magnitude equal to the nesting depth.
        enc.write_long(-(enc.value_depth as i32))?;
        enc.chunk_depth -= 1;
    }
    enc.value_depth -= 1;
    Ok(())
}

fn write_field(enc: &mut CdrEncoder, field: &Field) -> CdrResult<()> {
    match &field.kind {
        FieldKind::Octet(v) => enc.write_octet(*v),
        FieldKind::Boolean(v) => enc.write_boolean(*v),
        FieldKind::Char(v) => enc.write_char(*v),
        FieldKind::WChar(v) => enc.write_wchar(*v),
        FieldKind::Short(v) => enc.write_short(*v),
        FieldKind::UShort(v) => enc.write_ushort(*v),
        FieldKind::Long(v) => enc.write_long(*v),
        FieldKind::ULong(v) => enc.write_ulong(*v),
        FieldKind::LongLong(v) => enc.write_longlong(*v),
        FieldKind::ULongLong(v) => enc.write_ulonglong(*v),
        FieldKind::Float(v) => enc.write_float(*v),
        FieldKind::Double(v) => enc.write_double(*v),
        FieldKind::Str(v) => enc.write_string(v),
        FieldKind::WStr(v) => enc.write_wstring(v),
        FieldKind::Value(v) => write_value(enc, v.as_ref()),
    }
}

/// Repository id or codebase string: written once, indirected afterwards.
fn write_indirectable_string(enc: &mut CdrEncoder, s: &str) -> CdrResult<()> {
    if let Some(&target) = enc.string_offsets.get(s) {
        enc.write_ulong(INDIRECTION_TAG)?;
        let here = enc.pos();
        enc.write_long(indirection_delta(target, here)?)
    } else {
        let pos = align_up(enc.pos(), 4);
        enc.string_offsets.insert(s.to_string(), pos);
        enc.write_string(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OrbConfig;
    use crate::core::value::ValueCell;
    use crate::protocol::giop::msg_type;

    fn encoder() -> CdrEncoder {
        CdrEncoder::new(&OrbConfig::default(), msg_type::REQUEST)
    }

    #[test]
    fn test_null_value_is_zero_tag() {
        let mut enc = encoder();
        enc.write_value(None).unwrap();
        assert_eq!(enc.into_body().unwrap(), 0u32.to_be_bytes().to_vec());
    }

    #[test]
    fn test_unchunked_value_layout() {
        let v = ValueCell::new("IDL:n:1.0", vec![Field::new("x", FieldKind::Long(7))]);
        let mut enc = encoder();
        enc.write_value(Some(&v)).unwrap();
        let bytes = enc.into_body().unwrap();

        assert_eq!(&bytes[..4], &0x7FFF_FF02u32.to_be_bytes());
        // Repository id string: length 10 ("IDL:n:1.0" plus NUL).
        assert_eq!(&bytes[4..8], &10u32.to_be_bytes());
        assert_eq!(&bytes[8..18], b"IDL:n:1.0\0");
        // Field long aligned to 20.
        assert_eq!(&bytes[20..24], &7i32.to_be_bytes());
        assert_eq!(bytes.len(), 24);
    }

    #[test]
    fn test_second_write_is_indirection() {
        let v = ValueCell::new("IDL:n:1.0", vec![Field::new("x", FieldKind::Long(7))]);
        let mut enc = encoder();
        enc.write_value(Some(&v)).unwrap();
        enc.write_value(Some(&v)).unwrap();
        let bytes = enc.into_body().unwrap();

        assert_eq!(&bytes[24..28], &0xFFFF_FFFFu32.to_be_bytes());
        // Offset field at 28 points back to the tag at 0.
        assert_eq!(&bytes[28..32], &(-28i32).to_be_bytes());
    }

    #[test]
    fn test_chunked_value_layout() {
        let v = ValueCell::new_chunked("IDL:n:1.0", vec![Field::new("x", FieldKind::Long(7))]);
        let mut enc = encoder();
        enc.write_value(Some(&v)).unwrap();
        let bytes = enc.into_body().unwrap();

        assert_eq!(&bytes[..4], &0x7FFF_FF0Au32.to_be_bytes());
        // Chunk length slot at 20 says four payload bytes follow.
        assert_eq!(&bytes[20..24], &4u32.to_be_bytes());
        assert_eq!(&bytes[24..28], &7i32.to_be_bytes());
        // End tag closes nesting level one.
        assert_eq!(&bytes[28..32], &(-1i32).to_be_bytes());
        assert_eq!(bytes.len(), 32);
    }

    #[test]
    fn test_repo_id_shared_between_values() {
        let a = ValueCell::new("IDL:n:1.0", vec![]);
        let b = ValueCell::new("IDL:n:1.0", vec![]);
        let mut enc = encoder();
        enc.write_value(Some(&a)).unwrap();
        enc.write_value(Some(&b)).unwrap();
        let bytes = enc.into_body().unwrap();

        // Second value: tag at 20, then an id indirection to offset 4.
        assert_eq!(&bytes[20..24], &0x7FFF_FF02u32.to_be_bytes());
        assert_eq!(&bytes[24..28], &0xFFFF_FFFFu32.to_be_bytes());
        // Offset field at 28, id length long was at 4: delta -24.
        assert_eq!(&bytes[28..32], &(-24i32).to_be_bytes());
    }

    #[test]
    fn test_nested_value_inherits_chunking() {
        let inner = ValueCell::new("IDL:inner:1.0", vec![Field::new("y", FieldKind::Long(9))]);
        let outer = ValueCell::new_chunked(
            "IDL:outer:1.0",
            vec![Field::new("child", FieldKind::Value(Some(inner)))],
        );
        let mut enc = encoder();
        enc.write_value(Some(&outer)).unwrap();
        let bytes = enc.into_body().unwrap();

        // Outer tag chunked; the nested tag must be chunked too.
        assert_eq!(&bytes[..4], &0x7FFF_FF0Au32.to_be_bytes());
        let inner_tag = u32::from_be_bytes([bytes[24], bytes[25], bytes[26], bytes[27]]);
        assert_eq!(inner_tag, 0x7FFF_FF0A);
        // Innermost end tag magnitude is two, outer is one.
        let n = bytes.len();
        assert_eq!(&bytes[n - 4..], &(-1i32).to_be_bytes());
    }

    #[test]
    fn test_custom_value_header_inside_chunk() {
        let v = ValueCell::new_custom("IDL:c:1.0", 2, true, vec![0xAA, 0xBB]);
        let mut enc = encoder();
        enc.write_value(Some(&v)).unwrap();
        let bytes = enc.into_body().unwrap();

        // Chunked tag even though new_custom never asked for chunking.
        assert_eq!(&bytes[..4], &0x7FFF_FF0Au32.to_be_bytes());
        // Chunk at 20: format octet, default-data boolean, two payload bytes.
        assert_eq!(&bytes[20..24], &4u32.to_be_bytes());
        assert_eq!(&bytes[24..28], &[2, 1, 0xAA, 0xBB]);
        assert_eq!(&bytes[28..32], &(-1i32).to_be_bytes());
    }

    #[test]
    fn test_indirection_delta_must_fit_signed_long() {
        let v = ValueCell::new("IDL:n:1.0", vec![]);
        let mut enc = encoder();
        // Pretend the id string first appeared beyond signed-long reach.
        enc.string_offsets
            .insert("IDL:n:1.0".into(), i32::MAX as usize + 16);
        match enc.write_value(Some(&v)) {
            Err(CdrError::Marshal { .. }) => {}
            other => panic!("expected Marshal, got {:?}", other),
        }
    }

    #[test]
    fn test_pending_body_rejected() {
        let v = ValueCell::pending("IDL:p:1.0".into(), None, false);
        let mut enc = encoder();
        match enc.write_value(Some(&v)) {
            Err(CdrError::InvalidArgument { .. }) => {}
            other => panic!("expected InvalidArgument, got {:?}", other),
        }
    }
}

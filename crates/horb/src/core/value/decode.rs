// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Value graph reader.
//!
//! Decoding registers each value cell in the offset table before its body
//! is read, so indirections (including cyclic ones) resolve to the cell
//! already under construction. Chunked bodies are tracked through the
//! cursor's chunk accounting; an unregistered chunked type is skipped
//! over with its payload retained as [`ValueBody::Opaque`].

use super::{
    DecodeStrategy, Field, FieldKind, FieldSpec, TypeKind, ValueBody, ValueCell, ValueRef,
    INDIRECTION_TAG,
    MAX_CHUNK_LEN, REPO_ID_LIST, REPO_ID_MASK, REPO_ID_SINGLE, TAG_CHUNKED, TAG_CODEBASE,
    VALUE_TAG_BASE, VALUE_TAG_MASK,
};
use crate::core::ser::decoder::CdrDecoder;
use crate::core::ser::{CdrError, CdrResult};
use std::sync::Arc;

/// Upper bound on a truncatable repository id list. Anything larger is a
/// corrupt stream, not a deep hierarchy.
const MAX_REPO_ID_LIST: u32 = 1024;

pub(crate) fn read_value(dec: &mut CdrDecoder) -> CdrResult<Option<ValueRef>> {
    let parent_chunked = dec.chunk_active;
    if parent_chunked {
        // The writer closed its chunk before this element; any unread
        // remainder is data our layout did not model, and a writer-side
        // flush may have spread it over several chunks.
        loop {
            if dec.pos() < dec.chunk_end {
                let rest = dec.chunk_end - dec.pos();
                dec.skip_raw(rest)?;
            }
            let next = dec.peek_aligned_long()?;
            if next > 0 && (next as u32) < MAX_CHUNK_LEN {
                dec.refill_chunk()?;
            } else {
                break;
            }
        }
        dec.chunk_active = false;
    }

    let result = read_element(dec);

    if parent_chunked {
        // Parent data resumes in a fresh chunk.
        dec.chunk_active = true;
        dec.chunk_end = dec.pos();
    }
    result
}

fn read_element(dec: &mut CdrDecoder) -> CdrResult<Option<ValueRef>> {
    let tag_pos = dec.aligned_pos();
    let tag = dec.read_ulong_raw()?;
    match tag {
        0 => Ok(None),
        INDIRECTION_TAG => {
            let here = dec.pos() as i64;
            let offset = i64::from(dec.read_long_raw()?);
            let target = here + offset;
            if target < 0 {
                return Err(CdrError::Indirection { offset: target });
            }
            match dec.value_table.get(&(target as usize)) {
                Some(v) => Ok(Some(Arc::clone(v))),
                None => Err(CdrError::Indirection { offset: target }),
            }
        }
        t if t & VALUE_TAG_MASK == VALUE_TAG_BASE => read_value_body(dec, t, tag_pos).map(Some),
        t => Err(CdrError::marshal(format!("bad value tag {:#010X}", t))),
    }
}

fn read_value_body(dec: &mut CdrDecoder, tag: u32, tag_pos: usize) -> CdrResult<ValueRef> {
    let chunked = tag & TAG_CHUNKED != 0;
    let codebase = if tag & TAG_CODEBASE != 0 {
        Some(read_indirectable_string(dec)?)
    } else {
        None
    };
    let repo_ids: Vec<String> = match tag & REPO_ID_MASK {
        REPO_ID_SINGLE => vec![read_indirectable_string(dec)?],
        REPO_ID_LIST => {
            let n = dec.read_ulong_raw()?;
            if n == 0 || n > MAX_REPO_ID_LIST {
                return Err(CdrError::marshal(format!("bad repository id count {}", n)));
            }
            (0..n)
                .map(|_| read_indirectable_string(dec))
                .collect::<CdrResult<_>>()?
        }
        0 => {
            return Err(CdrError::marshal("value tag carries no repository id"));
        }
        bits => {
            return Err(CdrError::marshal(format!("bad repository id bits {:#04X}", bits)));
        }
    };
    let primary = repo_ids[0].clone();

    // Registered before the body so cyclic indirections find it.
    let cell = ValueCell::pending(primary.clone(), codebase, chunked);
    dec.value_table.insert(tag_pos, Arc::clone(&cell));
    log::debug!("[Value] open {} at {} (chunked={})", primary, tag_pos, chunked);

    dec.value_depth += 1;
    if chunked {
        dec.chunk_active = true;
        dec.chunk_end = dec.pos();
    }

    let strategy = dec.registry.resolve_first(&repo_ids).map(|(_, s)| s);
    let body = match strategy {
        Some(strategy) => match strategy.as_ref() {
            DecodeStrategy::Fields(specs) => {
                let mut fields = Vec::with_capacity(specs.len());
                for spec in specs {
                    fields.push(read_field(dec, spec)?);
                }
                ValueBody::Fields(fields)
            }
            DecodeStrategy::Custom => read_custom_body(dec, chunked)?,
        },
        None => {
            if !chunked {
                return Err(CdrError::marshal(format!(
                    "no decode strategy for unchunked value {}",
                    primary
                )));
            }
            log::debug!("[Value] skipping unknown chunked type {}", primary);
            ValueBody::Opaque(skip_unknown_chunks(dec)?)
        }
    };

    if chunked {
        finish_chunked(dec)?;
    }
    dec.value_depth -= 1;
    cell.set_body(body);
    Ok(cell)
}

fn read_field(dec: &mut CdrDecoder, spec: &FieldSpec) -> CdrResult<Field> {
    let kind = match spec.kind {
        TypeKind::Octet => FieldKind::Octet(dec.read_octet()?),
        TypeKind::Boolean => FieldKind::Boolean(dec.read_boolean()?),
        TypeKind::Char => FieldKind::Char(dec.read_char()?),
        TypeKind::WChar => FieldKind::WChar(dec.read_wchar()?),
        TypeKind::Short => FieldKind::Short(dec.read_short()?),
        TypeKind::UShort => FieldKind::UShort(dec.read_ushort()?),
        TypeKind::Long => FieldKind::Long(dec.read_long()?),
        TypeKind::ULong => FieldKind::ULong(dec.read_ulong()?),
        TypeKind::LongLong => FieldKind::LongLong(dec.read_longlong()?),
        TypeKind::ULongLong => FieldKind::ULongLong(dec.read_ulonglong()?),
        TypeKind::Float => FieldKind::Float(dec.read_float()?),
        TypeKind::Double => FieldKind::Double(dec.read_double()?),
        TypeKind::Str => FieldKind::Str(dec.read_string()?),
        TypeKind::WStr => FieldKind::WStr(dec.read_wstring()?),
        TypeKind::Value => FieldKind::Value(read_value(dec)?),
    };
    Ok(Field::new(spec.name.clone(), kind))
}

/// Custom-marshal body: stream-format header, then whatever payload
/// remains in the value's chunks.
fn read_custom_body(dec: &mut CdrDecoder, chunked: bool) -> CdrResult<ValueBody> {
    if !chunked {
        return Err(CdrError::marshal("custom-marshaled value must be chunked"));
    }
    let format = dec.read_octet()?;
    let default_data = dec.read_boolean()?;

    let data = if dec.policy().empty_optional_marker {
        if dec.pos() >= dec.chunk_end {
            dec.refill_chunk()?;
        }
        // The no-optional-data marker is an aligned zero long closing the
        // final chunk.
        if dec.peek_aligned_long()? == 0 && dec.chunk_end == dec.aligned_pos() + 4 {
            dec.read_ulong()?;
            Vec::new()
        } else {
            read_chunk_payload(dec)?
        }
    } else {
        read_chunk_payload(dec)?
    };
    Ok(ValueBody::Custom {
        format,
        default_data,
        data,
    })
}

/// Remaining payload of the current value: the rest of the open chunk
/// plus any continuation chunks, stopping at the end tag.
fn read_chunk_payload(dec: &mut CdrDecoder) -> CdrResult<Vec<u8>> {
    let mut data = Vec::new();
    loop {
        if dec.pos() < dec.chunk_end {
            let n = dec.chunk_end - dec.pos();
            data.extend(dec.read_raw_bytes(n)?);
        }
        let next = dec.peek_aligned_long()?;
        if next > 0 && (next as u32) < MAX_CHUNK_LEN {
            dec.refill_chunk()?;
        } else {
            return Ok(data);
        }
    }
}

/// Skip an unregistered chunked value: capture chunk payload, recurse
/// into nested value tags so their offsets still register, stop at the
/// end tag.
fn skip_unknown_chunks(dec: &mut CdrDecoder) -> CdrResult<Vec<u8>> {
    let mut data = Vec::new();
    loop {
        if dec.pos() < dec.chunk_end {
            let n = dec.chunk_end - dec.pos();
            data.extend(dec.read_raw_bytes(n)?);
            continue;
        }
        let next = dec.peek_aligned_long()?;
        if next > 0 && (next as u32) < MAX_CHUNK_LEN {
            dec.refill_chunk()?;
        } else if next == 0 {
            // Nested null element.
            dec.read_ulong_raw()?;
            dec.chunk_end = dec.pos();
        } else if (next as u32) & VALUE_TAG_MASK == VALUE_TAG_BASE {
            // Nested value: decode for the offset tables, drop the result.
            dec.chunk_active = false;
            read_element(dec)?;
            dec.chunk_active = true;
            dec.chunk_end = dec.pos();
        } else {
            // End tag (or a nested indirection, indistinguishable here).
            return Ok(data);
        }
    }
}

/// Consume trailing unread chunks, then this level's end tag.
fn finish_chunked(dec: &mut CdrDecoder) -> CdrResult<()> {
    loop {
        if dec.pos() < dec.chunk_end {
            dec.skip_raw(dec.chunk_end - dec.pos())?;
        }
        let next = dec.peek_aligned_long()?;
        if next > 0 && (next as u32) < MAX_CHUNK_LEN {
            dec.refill_chunk()?;
        } else {
            break;
        }
    }
    dec.chunk_active = false;

    let tag = dec.read_long_raw()?;
    if tag >= 0 {
        return Err(CdrError::marshal(format!(
            "expected end tag, found {:#010X}",
            tag
        )));
    }
    let magnitude = tag.unsigned_abs();
    if magnitude < dec.value_depth && !dec.policy().lenient_end_tags {
        return Err(CdrError::marshal(format!(
            "end tag {} closes level {} while depth is {}",
            tag, magnitude, dec.value_depth
        )));
    }
    Ok(())
}

fn read_indirectable_string(dec: &mut CdrDecoder) -> CdrResult<String> {
    let first = dec.peek_aligned_long()? as u32;
    if first == INDIRECTION_TAG {
        dec.read_ulong_raw()?;
        let here = dec.pos() as i64;
        let offset = i64::from(dec.read_long_raw()?);
        let target = here + offset;
        if target < 0 {
            return Err(CdrError::Indirection { offset: target });
        }
        dec.id_table
            .get(&(target as usize))
            .cloned()
            .ok_or(CdrError::Indirection { offset: target })
    } else {
        let pos = dec.aligned_pos();
        let s = dec.read_string()?;
        dec.id_table.insert(pos, s.clone());
        Ok(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OrbConfig;
    use crate::core::ser::encoder::CdrEncoder;
    use crate::core::value::{TypeRegistry, ValueCell};
    use crate::protocol::giop::msg_type;

    fn node_registry() -> Arc<TypeRegistry> {
        let reg = TypeRegistry::new();
        reg.register(
            "IDL:test/Node:1.0",
            DecodeStrategy::Fields(vec![
                FieldSpec::new("label", TypeKind::Str),
                FieldSpec::new("next", TypeKind::Value),
            ]),
        );
        Arc::new(reg)
    }

    fn round_trip(value: Option<&ValueRef>, registry: Arc<TypeRegistry>) -> Option<ValueRef> {
        let cfg = OrbConfig::default();
        let mut enc = CdrEncoder::new(&cfg, msg_type::REQUEST);
        enc.write_value(value).unwrap();
        let body = enc.into_body().unwrap();
        let mut dec = CdrDecoder::from_body(&cfg, body);
        dec.set_registry(registry);
        dec.read_value().unwrap()
    }

    #[test]
    fn test_null_round_trip() {
        assert!(round_trip(None, node_registry()).is_none());
    }

    #[test]
    fn test_fields_round_trip() {
        let v = ValueCell::new(
            "IDL:test/Node:1.0",
            vec![
                Field::new("label", FieldKind::Str("tail".into())),
                Field::new("next", FieldKind::Value(None)),
            ],
        );
        let out = round_trip(Some(&v), node_registry()).unwrap();
        assert_eq!(out.repo_id(), "IDL:test/Node:1.0");
        match out.body() {
            ValueBody::Fields(fields) => {
                assert_eq!(fields[0].kind, FieldKind::Str("tail".into()));
                assert_eq!(fields[1].kind, FieldKind::Value(None));
            }
            other => panic!("expected fields, got {:?}", other),
        }
    }

    #[test]
    fn test_cycle_round_trip() {
        let node = ValueCell::new_chunked(
            "IDL:test/Node:1.0",
            vec![Field::new("label", FieldKind::Str("self".into()))],
        );
        let next = Field::new("next", FieldKind::Value(Some(Arc::clone(&node))));
        node.with_fields_mut(|fields| fields.push(next)).unwrap();

        let out = round_trip(Some(&node), node_registry()).unwrap();
        match out.body() {
            ValueBody::Fields(fields) => match &fields[1].kind {
                FieldKind::Value(Some(back)) => {
                    assert!(Arc::ptr_eq(back, &out), "cycle must close on itself");
                }
                other => panic!("expected back-reference, got {:?}", other),
            },
            other => panic!("expected fields, got {:?}", other),
        }
    }

    #[test]
    fn test_written_value_dropped_by_caller_keeps_identity() {
        let reg = TypeRegistry::new();
        reg.register(
            "IDL:test/Num:1.0",
            DecodeStrategy::Fields(vec![FieldSpec::new("x", TypeKind::Long)]),
        );
        let cfg = OrbConfig::default();
        let mut enc = CdrEncoder::new(&cfg, msg_type::REQUEST);

        let a = ValueCell::new("IDL:test/Num:1.0", vec![Field::new("x", FieldKind::Long(1))]);
        enc.write_value(Some(&a)).unwrap();
        drop(a);
        // A fresh cell may land on the dropped cell's heap address; it
        // must encode as its own value, never as a stale back-reference.
        let b = ValueCell::new("IDL:test/Num:1.0", vec![Field::new("x", FieldKind::Long(2))]);
        enc.write_value(Some(&b)).unwrap();
        let body = enc.into_body().unwrap();

        let mut dec = CdrDecoder::from_body(&cfg, body);
        dec.set_registry(Arc::new(reg));
        let first = dec.read_value().unwrap().unwrap();
        let second = dec.read_value().unwrap().unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        match (first.body(), second.body()) {
            (ValueBody::Fields(fa), ValueBody::Fields(fb)) => {
                assert_eq!(fa[0].kind, FieldKind::Long(1));
                assert_eq!(fb[0].kind, FieldKind::Long(2));
            }
            other => panic!("expected field bodies, got {:?}", other),
        }
    }

    #[test]
    fn test_extra_fields_split_across_chunks_before_value() {
        // A newer peer appended two long fields our layout does not know,
        // flushed between them: one chunk each, ahead of the value field.
        let reg = TypeRegistry::new();
        reg.register(
            "IDL:test/Link:1.0",
            DecodeStrategy::Fields(vec![FieldSpec::new("next", TypeKind::Value)]),
        );
        let mut body = Vec::new();
        body.extend_from_slice(&0x7FFF_FF0Au32.to_be_bytes());
        body.extend_from_slice(&18u32.to_be_bytes());
        body.extend_from_slice(b"IDL:test/Link:1.0\0");
        body.extend_from_slice(&[0, 0]);
        body.extend_from_slice(&4u32.to_be_bytes());
        body.extend_from_slice(&1i32.to_be_bytes());
        body.extend_from_slice(&4u32.to_be_bytes());
        body.extend_from_slice(&2i32.to_be_bytes());
        body.extend_from_slice(&0u32.to_be_bytes()); // null `next`
        body.extend_from_slice(&(-1i32).to_be_bytes());

        let cfg = OrbConfig::default();
        let mut dec = CdrDecoder::from_body(&cfg, body);
        dec.set_registry(Arc::new(reg));
        let out = dec.read_value().unwrap().unwrap();
        match out.body() {
            ValueBody::Fields(fields) => {
                assert_eq!(fields[0].kind, FieldKind::Value(None));
            }
            other => panic!("expected fields, got {:?}", other),
        }
    }

    #[test]
    fn test_dangling_indirection() {
        let cfg = OrbConfig::default();
        let mut body = Vec::new();
        body.extend_from_slice(&INDIRECTION_TAG.to_be_bytes());
        body.extend_from_slice(&(-100i32).to_be_bytes());
        let mut dec = CdrDecoder::from_body(&cfg, body);
        match dec.read_value() {
            Err(CdrError::Indirection { offset }) => assert_eq!(offset, -96),
            other => panic!("expected Indirection, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_chunked_type_skipped_as_opaque() {
        let v = ValueCell::new_chunked(
            "IDL:test/Mystery:1.0",
            vec![Field::new("a", FieldKind::Long(3))],
        );
        // Empty registry: nothing resolvable.
        let out = round_trip(Some(&v), Arc::new(TypeRegistry::new())).unwrap();
        match out.body() {
            ValueBody::Opaque(data) => assert_eq!(data, 3i32.to_be_bytes().to_vec()),
            other => panic!("expected opaque body, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_unchunked_type_fails() {
        let v = ValueCell::new("IDL:test/Mystery:1.0", vec![Field::new("a", FieldKind::Long(3))]);
        let cfg = OrbConfig::default();
        let mut enc = CdrEncoder::new(&cfg, msg_type::REQUEST);
        enc.write_value(Some(&v)).unwrap();
        let body = enc.into_body().unwrap();
        let mut dec = CdrDecoder::from_body(&cfg, body);
        match dec.read_value() {
            Err(CdrError::Marshal { .. }) => {}
            other => panic!("expected Marshal, got {:?}", other),
        }
    }

    #[test]
    fn test_custom_round_trip() {
        let reg = TypeRegistry::new();
        reg.register("IDL:test/Blob:1.0", DecodeStrategy::Custom);
        let v = ValueCell::new_custom("IDL:test/Blob:1.0", 1, false, vec![9, 8, 7]);
        let out = round_trip(Some(&v), Arc::new(reg)).unwrap();
        match out.body() {
            ValueBody::Custom {
                format,
                default_data,
                data,
            } => {
                assert_eq!(format, 1);
                assert!(!default_data);
                assert_eq!(data, vec![9, 8, 7]);
            }
            other => panic!("expected custom body, got {:?}", other),
        }
    }

    #[test]
    fn test_custom_empty_optional_marker_round_trip() {
        let reg = TypeRegistry::new();
        reg.register("IDL:test/Blob:1.0", DecodeStrategy::Custom);
        let v = ValueCell::new_custom("IDL:test/Blob:1.0", 2, true, Vec::new());
        let out = round_trip(Some(&v), Arc::new(reg)).unwrap();
        match out.body() {
            ValueBody::Custom {
                default_data, data, ..
            } => {
                assert!(default_data);
                assert!(data.is_empty());
            }
            other => panic!("expected custom body, got {:?}", other),
        }
    }

    #[test]
    fn test_bad_value_tag() {
        let cfg = OrbConfig::default();
        let mut dec = CdrDecoder::from_body(&cfg, 0x1234_5678u32.to_be_bytes().to_vec());
        match dec.read_value() {
            Err(CdrError::Marshal { .. }) => {}
            other => panic!("expected Marshal, got {:?}", other),
        }
    }
}

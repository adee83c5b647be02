// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Core marshaling engine: fragment buffers, CDR cursors and the value
//! graph codec.

pub mod buffer;
pub mod ser;
pub mod value;

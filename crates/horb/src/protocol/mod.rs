// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! GIOP protocol framing: message headers, fragment reassembly and the
//! stream policy table consulted by every version-sensitive codec decision.

pub mod giop;
pub mod policy;

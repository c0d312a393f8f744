// SPDX-FileCopyrightText: © 2025 VoiceDeck Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Movie identity tracking.
//!
//! Every movie load contributes a successor of a per-process secret; a
//! movie carries the union of every contribution it ever incorporated.
//! This crate stores those 256-bit contributions as coalesced intervals,
//! serialises them with a compact run-length wire format, and mirrors them
//! into a project-scoped append-only log.

pub mod id;
pub mod set;

pub use id::{RerecordId, ID_BYTES};
pub use set::{RerecordSet, MAX_RUN};

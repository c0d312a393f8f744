// SPDX-FileCopyrightText: © 2025 VoiceDeck Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Persistent storage for voice commentary: the cluster filesystem, the
//! packet streams stored in it, the collection index that maps streams
//! onto the movie timeline, and the external container formats.

pub mod collection;
pub mod container;
pub mod filesys;
pub mod playback;
pub mod stream;

pub use collection::StreamCollection;
pub use filesys::{ChainCursor, ClusterFs, FsHandle, CLUSTER_SIZE, INDEX_CLUSTER};
pub use playback::{PlaybackStream, OUTPUT_BLOCK};
pub use stream::{SharedStream, VoiceStream};

//! Map and news file transfer.

use super::types::PlayerId;
use crate::capability::{Capability, CapabilityId};
use std::io;

/// A file clients download and cache.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DownloadKind {
    /// The map of an arena, by file name
    Map(String),
    News,
}

/// Serves downloadable files to players.
pub trait FileDownload: Send + Sync {
    /// Queues the file for transfer to `player`.
    fn send_file(&self, player: PlayerId, kind: &DownloadKind) -> io::Result<()>;

    /// Checksum clients compare against their cached copy. `None` if the
    /// file is not available.
    fn checksum(&self, kind: &DownloadKind) -> Option<u32>;
}

impl Capability for dyn FileDownload {
    const ID: CapabilityId = CapabilityId::new("file-download");
}

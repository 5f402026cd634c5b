use std::io;
use std::path::Path;

/// Free-space query for the volume holding the output directory
pub trait SpaceGauge: Send + Sync {
    fn free_bytes(&self, path: &Path) -> io::Result<u64>;
}

/// Asks the filesystem (statvfs / GetDiskFreeSpaceEx) for space available to this user
#[derive(Debug, Default, Clone, Copy)]
pub struct FsSpaceGauge;

impl SpaceGauge for FsSpaceGauge {
    fn free_bytes(&self, path: &Path) -> io::Result<u64> {
        fs2::available_space(path)
    }
}

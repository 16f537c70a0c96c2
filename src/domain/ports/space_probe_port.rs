//! Port definition for free-space checks.

use std::path::Path;

/// Reports usable space on the volume holding a path.
#[cfg_attr(test, mockall::automock)]
pub trait SpaceProbe: Send + Sync {
    /// Usable bytes, or `None` if the volume cannot be determined.
    fn usable_space(&self, path: &Path) -> Option<u64>;
}

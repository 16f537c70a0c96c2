//! Free-space probe backed by `sysinfo`.

use std::path::{Path, PathBuf};

use sysinfo::Disks;
use tracing::trace;

use crate::domain::ports::SpaceProbe;

/// Reports available space of the mounted volume that contains a path.
#[derive(Debug, Clone, Copy, Default)]
pub struct SysinfoSpaceProbe;

impl SpaceProbe for SysinfoSpaceProbe {
    fn usable_space(&self, path: &Path) -> Option<u64> {
        let path = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        let disks = Disks::new_with_refreshed_list();
        let mounts: Vec<(PathBuf, u64)> = disks
            .list()
            .iter()
            .map(|disk| (disk.mount_point().to_path_buf(), disk.available_space()))
            .collect();

        let available = available_for(&path, &mounts);
        trace!(path = %path.display(), ?available, "Probed usable space");
        available
    }
}

/// Picks the mount point with the longest prefix of `path`.
fn available_for(path: &Path, mounts: &[(PathBuf, u64)]) -> Option<u64> {
    mounts
        .iter()
        .filter(|(mount, _)| path.starts_with(mount))
        .max_by_key(|(mount, _)| mount.components().count())
        .map(|(_, available)| *available)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_longest_mount_prefix_wins() {
        let mounts = vec![
            (PathBuf::from("/"), 10),
            (PathBuf::from("/home"), 20),
            (PathBuf::from("/home/user/data"), 30),
        ];

        assert_eq!(available_for(Path::new("/home/user/.cache/x"), &mounts), Some(20));
        assert_eq!(available_for(Path::new("/home/user/data/cache"), &mounts), Some(30));
        assert_eq!(available_for(Path::new("/var/cache"), &mounts), Some(10));
    }

    #[test]
    fn test_unknown_volume() {
        let mounts = vec![(PathBuf::from("/mnt/a"), 10)];
        assert_eq!(available_for(Path::new("/srv"), &mounts), None);
    }

    #[test]
    fn test_component_prefix_not_string_prefix() {
        let mounts = vec![(PathBuf::from("/"), 1), (PathBuf::from("/home"), 2)];
        assert_eq!(available_for(Path::new("/homeless"), &mounts), Some(1));
    }
}

//! Block device discovery for logged-in iSCSI sessions.
//!
//! Device nodes appear some time after the session is established, and with
//! dm-multipath enabled the aggregated `dm-N` device appears after that.
//! Resolution is always re-derived from the kernel's view; nothing is cached.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::types::{DevicePath, Portal};

/// A device-mapper multipath device and the number of paths it aggregates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultipathDevice {
    pub path: DevicePath,
    pub path_count: usize,
}

/// Looks up the block devices backing a target.
pub trait DeviceResolver: Send + Sync {
    /// Raw SCSI disks currently present for `target_iqn`, at most one per
    /// portal, in portal order.
    fn raw_devices(&self, target_iqn: &str, portals: &[Portal]) -> io::Result<Vec<DevicePath>>;

    /// The multipath device holding `device`, if any.
    fn multipath_holder(&self, device: &DevicePath) -> io::Result<Option<MultipathDevice>>;
}

/// Resolver reading udev's `/dev/disk/by-path` links and sysfs.
///
/// The roots are configurable so tests can point it at a scratch tree.
#[derive(Debug, Clone)]
pub struct SysfsDeviceResolver {
    dev_root: PathBuf,
    sys_root: PathBuf,
}

impl Default for SysfsDeviceResolver {
    fn default() -> Self {
        Self::new("/dev", "/sys")
    }
}

/// Entries of `dir` sorted by name; a missing directory is empty.
fn sorted_entries(dir: &Path) -> io::Result<Vec<fs::DirEntry>> {
    match fs::read_dir(dir) {
        Ok(entries) => {
            let mut entries = entries.collect::<io::Result<Vec<_>>>()?;
            entries.sort_by_key(|e| e.file_name());
            Ok(entries)
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e),
    }
}

impl SysfsDeviceResolver {
    pub fn new(dev_root: impl Into<PathBuf>, sys_root: impl Into<PathBuf>) -> Self {
        Self {
            dev_root: dev_root.into(),
            sys_root: sys_root.into(),
        }
    }

    /// by-path links look like `ip-<portal>-iscsi-<iqn>-lun-<lun>`
    fn by_path_prefix(target_iqn: &str, portal: &Portal) -> String {
        format!("ip-{}-iscsi-{}-lun-", portal, target_iqn)
    }

    /// Friendly `/dev/mapper` name for a dm device, falling back to `/dev/dm-N`.
    fn mapper_path(&self, dm_name: &str) -> io::Result<PathBuf> {
        for entry in sorted_entries(&self.dev_root.join("mapper"))? {
            if let Ok(link) = fs::read_link(entry.path())
                && link.file_name().is_some_and(|n| n == dm_name)
            {
                return Ok(entry.path());
            }
        }
        Ok(self.dev_root.join(dm_name))
    }
}

impl DeviceResolver for SysfsDeviceResolver {
    fn raw_devices(&self, target_iqn: &str, portals: &[Portal]) -> io::Result<Vec<DevicePath>> {
        let entries = sorted_entries(&self.dev_root.join("disk/by-path"))?;
        let mut devices = Vec::new();

        for portal in portals {
            let prefix = Self::by_path_prefix(target_iqn, portal);
            let found = entries.iter().find(|e| {
                let name = e.file_name();
                let name = name.to_string_lossy();
                // Skip partition links (`-lun-0-part1`)
                name.starts_with(&prefix) && !name.contains("-part")
            });

            // A dangling link means udev has not finished; treat as absent
            if let Some(entry) = found
                && let Ok(device) = fs::canonicalize(entry.path())
            {
                debug!(portal = %portal, device = %device.display(), "Found raw device");
                devices.push(DevicePath::new(device));
            }
        }

        Ok(devices)
    }

    fn multipath_holder(&self, device: &DevicePath) -> io::Result<Option<MultipathDevice>> {
        let Some(dev_name) = device.as_path().file_name() else {
            return Ok(None);
        };
        let holders = self.sys_root.join("block").join(dev_name).join("holders");

        for entry in sorted_entries(&holders)? {
            let holder = entry.file_name();
            let holder = holder.to_string_lossy();
            if !holder.starts_with("dm-") {
                continue;
            }

            let slaves = self
                .sys_root
                .join("block")
                .join(&*holder)
                .join("slaves");
            let path_count = sorted_entries(&slaves)?.len();
            let path = self.mapper_path(&holder)?;

            debug!(
                device = %device,
                multipath = %path.display(),
                path_count,
                "Device is held by multipath"
            );
            return Ok(Some(MultipathDevice {
                path: DevicePath::new(path),
                path_count,
            }));
        }

        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;

    const IQN: &str = "iqn.2013-01.com.example:test";

    struct Tree {
        _dir: tempfile::TempDir,
        dev: PathBuf,
        sys: PathBuf,
    }

    impl Tree {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let dev = dir.path().join("dev");
            let sys = dir.path().join("sys");
            fs::create_dir_all(dev.join("disk/by-path")).unwrap();
            fs::create_dir_all(dev.join("mapper")).unwrap();
            fs::create_dir_all(sys.join("block")).unwrap();
            Self { _dir: dir, dev, sys }
        }

        fn resolver(&self) -> SysfsDeviceResolver {
            SysfsDeviceResolver::new(&self.dev, &self.sys)
        }

        fn disk(&self, name: &str, portal: &str) -> PathBuf {
            let node = self.dev.join(name);
            fs::write(&node, b"").unwrap();
            let link = self
                .dev
                .join("disk/by-path")
                .join(format!("ip-{}-iscsi-{}-lun-0", portal, IQN));
            symlink(format!("../../{}", name), link).unwrap();
            fs::create_dir_all(self.sys.join("block").join(name).join("holders")).unwrap();
            fs::canonicalize(node).unwrap()
        }

        fn multipath(&self, dm: &str, alias: &str, members: &[&str]) {
            fs::write(self.dev.join(dm), b"").unwrap();
            symlink(format!("../{}", dm), self.dev.join("mapper").join(alias)).unwrap();
            let slaves = self.sys.join("block").join(dm).join("slaves");
            fs::create_dir_all(&slaves).unwrap();
            for member in members {
                fs::write(slaves.join(member), b"").unwrap();
                fs::write(
                    self.sys
                        .join("block")
                        .join(member)
                        .join("holders")
                        .join(dm),
                    b"",
                )
                .unwrap();
            }
        }
    }

    #[test]
    fn test_no_devices_yet() {
        let tree = Tree::new();
        let devices = tree
            .resolver()
            .raw_devices(IQN, &[Portal::new("10.0.0.1", 3260)])
            .unwrap();
        assert!(devices.is_empty());
    }

    #[test]
    fn test_raw_devices_per_portal() {
        let tree = Tree::new();
        let sdb = tree.disk("sdb", "10.0.0.2:3260");
        let sda = tree.disk("sda", "10.0.0.1:3260");

        let portals = [Portal::new("10.0.0.1", 3260), Portal::new("10.0.0.2", 3260)];
        let devices = tree.resolver().raw_devices(IQN, &portals).unwrap();
        assert_eq!(devices, vec![DevicePath::new(sda), DevicePath::new(sdb)]);

        // Other targets and portals are ignored
        let devices = tree
            .resolver()
            .raw_devices("iqn.other", &portals[..1])
            .unwrap();
        assert!(devices.is_empty());
    }

    #[test]
    fn test_multipath_holder_counts_paths() {
        let tree = Tree::new();
        let sda = tree.disk("sda", "10.0.0.1:3260");
        tree.disk("sdb", "10.0.0.2:3260");
        tree.multipath("dm-0", "mpatha", &["sda", "sdb"]);

        let holder = tree
            .resolver()
            .multipath_holder(&DevicePath::new(sda))
            .unwrap()
            .unwrap();
        assert_eq!(holder.path, DevicePath::new(tree.dev.join("mapper/mpatha")));
        assert_eq!(holder.path_count, 2);
    }

    #[test]
    fn test_plain_disk_has_no_holder() {
        let tree = Tree::new();
        let sda = tree.disk("sda", "10.0.0.1:3260");
        assert_eq!(
            tree.resolver()
                .multipath_holder(&DevicePath::new(sda))
                .unwrap(),
            None
        );
    }
}

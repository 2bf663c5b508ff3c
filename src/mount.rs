//! Parse the mount table, to find where a USB disk is mounted.

use std::{fs, path::Path};

use thiserror::Error;

pub const PROC_MOUNTS_PATH: &str = "/proc/mounts";

/// A line of the mount table.
///
/// See `man fstab` for a detailed description of the fields.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct MountEntry {
    /// The mounted block device, for instance `/dev/sdb1`.
    pub source: String,
    pub mount_point: String,
    pub fs_type: String,
}

/// Error while parsing the mount table.
#[derive(Debug, Error)]
#[error("invalid mount line: {input}")]
pub struct ParseError {
    pub(crate) input: String,
}

/// Error while reading/parsing the mount table.
#[derive(Debug, Error)]
pub enum ReadError {
    #[error("failed to parse the mount table")]
    Parse(#[from] ParseError),
    #[error("failed to read the mount table")]
    Io(#[from] std::io::Error),
}

impl MountEntry {
    /// Attempts to parse a line of the mount table.
    /// Returns `None` if it fails.
    pub(crate) fn parse(line: &str) -> Option<Self> {
        let mut fields = line.split_ascii_whitespace();
        let source = unescape(fields.next()?);
        let mount_point = unescape(fields.next()?);
        let fs_type = fields.next()?.to_owned();
        // options, dump and pass are not needed, but a valid line has them
        fields.next()?;
        Some(Self {
            source,
            mount_point,
            fs_type,
        })
    }
}

/// Decodes the octal escapes (`\040` for a space, ...) that the kernel uses
/// for the special characters of paths.
fn unescape(field: &str) -> String {
    if !field.contains('\\') {
        return field.to_owned();
    }
    let bytes = field.as_bytes();
    let mut res = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() && is_octal(&bytes[i + 1..i + 4]) {
            let code = (bytes[i + 1] - b'0') * 64 + (bytes[i + 2] - b'0') * 8 + (bytes[i + 3] - b'0');
            res.push(code);
            i += 4;
        } else {
            res.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8_lossy(&res).into_owned()
}

fn is_octal(digits: &[u8]) -> bool {
    digits.len() == 3 && digits[0] <= b'3' && digits.iter().all(|d| (b'0'..=b'7').contains(d))
}

/// Reads the mount table at `path` and parses its content.
pub(crate) fn read_mounts(path: &Path) -> Result<Vec<MountEntry>, ReadError> {
    let content = fs::read_to_string(path)?;
    let mut mounts = Vec::with_capacity(64);
    parse_mounts(&content, &mut mounts)?;
    Ok(mounts)
}

/// Parses the content of the mount table.
pub(crate) fn parse_mounts(content: &str, buf: &mut Vec<MountEntry>) -> Result<(), ParseError> {
    for line in content.lines() {
        let line = line.trim_start_matches(|c: char| c.is_ascii_whitespace());
        if !line.is_empty() && !line.starts_with('#') {
            let m = MountEntry::parse(line).ok_or_else(|| ParseError {
                input: line.to_owned(),
            })?;
            buf.push(m);
        }
    }
    Ok(())
}

/// Returns the first mount point of the block device `dev_name` (e.g. `sdb1`).
pub(crate) fn mount_point_of<'a>(mounts: &'a [MountEntry], dev_name: &str) -> Option<&'a str> {
    mounts
        .iter()
        .find(|m| {
            m.source
                .strip_prefix("/dev/")
                .is_some_and(|name| name == dev_name)
        })
        .map(|m| m.mount_point.as_str())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::{mount_point_of, parse_mounts, MountEntry};

    fn entry(source: &str, mount_point: &str, fs_type: &str) -> MountEntry {
        MountEntry {
            source: source.to_owned(),
            mount_point: mount_point.to_owned(),
            fs_type: fs_type.to_owned(),
        }
    }

    #[test]
    fn parsing() {
        let content = "
sysfs /sys sysfs rw,nosuid,nodev,noexec,relatime 0 0
/dev/nvme0n1p1 /boot/efi vfat rw,relatime,errors=remount-ro 0 0
/dev/sdb1 /media/alice/USB\\040STICK vfat rw,nosuid,nodev,relatime,uid=1000 0 0";
        let mut mounts = Vec::new();
        parse_mounts(content, &mut mounts).unwrap();

        let expected = vec![
            entry("sysfs", "/sys", "sysfs"),
            entry("/dev/nvme0n1p1", "/boot/efi", "vfat"),
            entry("/dev/sdb1", "/media/alice/USB STICK", "vfat"),
        ];
        assert_eq!(expected, mounts);
    }

    #[test]
    fn parsing_error() {
        let mut mounts = Vec::new();
        parse_mounts("badbad", &mut mounts).unwrap_err();
        parse_mounts("/dev/sdb1 /mnt", &mut mounts).unwrap_err();
    }

    #[test]
    fn parsing_comments() {
        let mut mounts = Vec::new();
        parse_mounts("\n# badbad\n", &mut mounts).unwrap();
        assert!(mounts.is_empty());
    }

    #[test]
    fn lookup_by_device_name() {
        let mounts = vec![
            entry("/dev/sda2", "/", "ext4"),
            entry("/dev/sdb1", "/media/usb", "vfat"),
            entry("/dev/sdb1", "/srv/again", "vfat"),
        ];
        assert_eq!(Some("/media/usb"), mount_point_of(&mounts, "sdb1"));
        assert_eq!(None, mount_point_of(&mounts, "sdb"));
        assert_eq!(None, mount_point_of(&mounts, "sdc1"));
    }
}

//! An optional append-only binary capture of every byte read from the
//! device, with rotation at a size cap.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Append-only raw byte capture. Bytes are written pre-unescape, in
/// arrival order, exactly as spec.md §6 describes the dump file format.
pub struct RawDump {
    path: PathBuf,
    max_size_bytes: u64,
    file: File,
    written: u64,
}

impl RawDump {
    /// Opens (creating if needed) a dump file at `path`, rotating to
    /// `<path>.old` once the file exceeds `max_size_kb` KB. A cap of `0`
    /// disables rotation.
    pub fn open(path: impl Into<PathBuf>, max_size_kb: u64) -> io::Result<Self> {
        let path = path.into();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        let written = file.metadata()?.len();
        Ok(Self {
            path,
            max_size_bytes: max_size_kb.saturating_mul(1024),
            file,
            written,
        })
    }

    /// Test-only constructor that sets the rotation cap directly in bytes,
    /// so rotation can be exercised without writing a full kilobyte.
    #[cfg(test)]
    fn open_with_byte_cap(path: impl Into<PathBuf>, max_size_bytes: u64) -> io::Result<Self> {
        let mut dump = Self::open(path, 0)?;
        dump.max_size_bytes = max_size_bytes;
        Ok(dump)
    }

    /// Appends one raw byte, rotating first if the cap has been reached.
    pub fn write_byte(&mut self, byte: u8) -> io::Result<()> {
        if self.max_size_bytes > 0 && self.written >= self.max_size_bytes {
            self.rotate()?;
        }
        self.file.write_all(&[byte])?;
        self.written += 1;
        Ok(())
    }

    fn rotate(&mut self) -> io::Result<()> {
        let old_path = rotated_path(&self.path);
        // Drop the current handle before renaming so the rename isn't
        // racing a dangling writer on some platforms.
        self.file.flush()?;
        std::fs::rename(&self.path, &old_path)?;
        self.file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        self.written = 0;
        Ok(())
    }
}

fn rotated_path(path: &Path) -> PathBuf {
    let mut s = path.as_os_str().to_owned();
    s.push(".old");
    PathBuf::from(s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn tmp_path(name: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!("ebus-core-test-{}-{name}", std::process::id()));
        p
    }

    #[test]
    fn appends_bytes_in_order() {
        let path = tmp_path("append");
        let _ = std::fs::remove_file(&path);
        {
            let mut dump = RawDump::open(&path, 1024).unwrap();
            dump.write_byte(0x01).unwrap();
            dump.write_byte(0x02).unwrap();
            dump.write_byte(0x03).unwrap();
        }
        let mut contents = Vec::new();
        File::open(&path).unwrap().read_to_end(&mut contents).unwrap();
        assert_eq!(contents, vec![0x01, 0x02, 0x03]);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn rotates_when_cap_exceeded() {
        let path = tmp_path("rotate");
        let old_path = rotated_path(&path);
        let _ = std::fs::remove_file(&path);
        let _ = std::fs::remove_file(&old_path);

        // A 1-byte cap: the second write should trigger a rotation.
        let mut dump = RawDump::open_with_byte_cap(&path, 1).unwrap();
        dump.write_byte(0xAA).unwrap();
        dump.write_byte(0xBB).unwrap();

        assert!(old_path.exists());
        let mut old_contents = Vec::new();
        File::open(&old_path)
            .unwrap()
            .read_to_end(&mut old_contents)
            .unwrap();
        assert_eq!(old_contents, vec![0xAA]);

        let _ = std::fs::remove_file(&path);
        let _ = std::fs::remove_file(&old_path);
    }
}

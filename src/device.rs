//! Raw device: open, read, write, close, file-lock the backing store.
//!
//! A backing store is a regular file or block device sliced into fixed-size
//! macroblocks; trailing bytes past the last full macroblock are unused.
//! Per §5, each open partition gets its own file handle into the same
//! store (via `try_clone`) so that concurrent reads of different
//! macroblocks never race on the shared seek position, and writes are
//! serialized by the partition's own lock rather than by the OS file
//! position.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use fs2::FileExt;

use crate::api::Geometry;
use crate::error::{Error, Result};

/// A handle onto the shared backing store, sized in whole macroblocks.
pub struct RawDevice {
    file: File,
    geometry: Geometry,
    no_macroblocks: u32,
}

impl RawDevice {
    /// Opens and exclusively locks `path`, sizing the store by the file's
    /// (or block device's) length right-shifted by `geometry.macroblock_log`.
    /// Fails if the store holds fewer than one macroblock or if another
    /// process already holds the lock.
    pub fn open(path: impl AsRef<Path>, geometry: Geometry) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path.as_ref()).map_err(Error::Io)?;
        file.try_lock_exclusive().map_err(|_| {
            Error::conflict(format!("backing store {:?} is locked by another process", path.as_ref()))
        })?;
        let len = file.metadata().map_err(Error::Io)?.len();
        let no_macroblocks = (len >> geometry.macroblock_log) as u32;
        if no_macroblocks < 1 {
            return Err(Error::config(format!(
                "backing store {:?} ({len} bytes) is smaller than one macroblock ({} bytes)",
                path.as_ref(),
                geometry.macroblock_size()
            )));
        }
        Ok(RawDevice { file, geometry, no_macroblocks })
    }

    pub fn geometry(&self) -> Geometry { self.geometry }

    pub fn no_macroblocks(&self) -> u32 { self.no_macroblocks }

    /// A second, independent handle onto the same store, sharing the lock
    /// (per §5, one file handle per open partition).
    pub fn try_clone(&self) -> Result<Self> {
        Ok(RawDevice {
            file: self.file.try_clone().map_err(Error::Io)?,
            geometry: self.geometry,
            no_macroblocks: self.no_macroblocks,
        })
    }

    fn check_id(&self, macro_id: u32) -> Result<()> {
        if macro_id >= self.no_macroblocks {
            return Err(Error::config(format!(
                "macroblock id {macro_id} out of range (have {})",
                self.no_macroblocks
            )));
        }
        Ok(())
    }

    /// Reads one whole macroblock's raw (still-encrypted) bytes.
    pub fn read_macroblock(&mut self, macro_id: u32) -> Result<Vec<u8>> {
        self.check_id(macro_id)?;
        let mut buf = vec![0u8; self.geometry.macroblock_size()];
        let offset = (macro_id as u64) << self.geometry.macroblock_log;
        self.file.seek(SeekFrom::Start(offset)).map_err(Error::Io)?;
        self.file.read_exact(&mut buf).map_err(Error::Io)?;
        Ok(buf)
    }

    /// Reads a byte range within one macroblock without materializing the whole cell.
    pub fn read_macroblock_range(&mut self, macro_id: u32, within_offset: u64, out: &mut [u8]) -> Result<()> {
        self.check_id(macro_id)?;
        debug_assert!(within_offset as usize + out.len() <= self.geometry.macroblock_size());
        let offset = ((macro_id as u64) << self.geometry.macroblock_log) + within_offset;
        self.file.seek(SeekFrom::Start(offset)).map_err(Error::Io)?;
        self.file.read_exact(out).map_err(Error::Io)?;
        Ok(())
    }

    /// Writes one whole macroblock's raw bytes; `buf.len()` must equal the macroblock size.
    pub fn write_macroblock(&mut self, macro_id: u32, buf: &[u8]) -> Result<()> {
        self.check_id(macro_id)?;
        debug_assert_eq!(buf.len(), self.geometry.macroblock_size());
        let offset = (macro_id as u64) << self.geometry.macroblock_log;
        self.file.seek(SeekFrom::Start(offset)).map_err(Error::Io)?;
        self.file.write_all(buf).map_err(Error::Io)?;
        self.file.flush().map_err(Error::Io)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{DEFAULT_MESOBLOCK_LOG, Geometry};

    fn geometry() -> Geometry { Geometry::new(16, DEFAULT_MESOBLOCK_LOG.min(14)).unwrap() }

    #[test]
    fn opens_and_sizes_from_file_length() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.as_file().set_len(4 * (1u64 << 16)).unwrap();
        let dev = RawDevice::open(tmp.path(), geometry()).unwrap();
        assert_eq!(dev.no_macroblocks(), 4);
    }

    #[test]
    fn rejects_a_store_smaller_than_one_macroblock() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.as_file().set_len(100).unwrap();
        assert!(RawDevice::open(tmp.path(), geometry()).is_err());
    }

    #[test]
    fn round_trips_a_macroblock() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.as_file().set_len(2 * (1u64 << 16)).unwrap();
        let mut dev = RawDevice::open(tmp.path(), geometry()).unwrap();
        let payload = vec![0x5Au8; geometry().macroblock_size()];
        dev.write_macroblock(1, &payload).unwrap();
        let back = dev.read_macroblock(1).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn second_lock_on_same_store_is_rejected() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.as_file().set_len(2 * (1u64 << 16)).unwrap();
        let _dev = RawDevice::open(tmp.path(), geometry()).unwrap();
        assert!(RawDevice::open(tmp.path(), geometry()).is_err());
    }
}

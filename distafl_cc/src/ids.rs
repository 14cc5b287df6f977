//! Build-wide join point identities, backed by a counter file that outlives the process.
//!
//! Every compiler invocation of a build opens the same file, continues counting where the
//! previous one stopped, and writes its last issued identity back when it is done.
//! The file holds a raw native-endian `u32`.

#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;
use std::{
    fs::{File, OpenOptions},
    io::{self, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use distafl_bolts::Error;
use fs2::FileExt;

/// Where the counter lives unless configured otherwise
pub const DEFAULT_ID_FILE: &str = "/tmp/.cur_id";

/// Hands out strictly increasing identities, continuing from the persisted counter.
///
/// Nothing is written back unless [`PersistentIdAllocator::finish`] is called.
#[derive(Debug)]
pub struct PersistentIdAllocator {
    path: PathBuf,
    file: File,
    locked: bool,
    start: u32,
    current: u32,
}

impl PersistentIdAllocator {
    /// Opens (or creates) the counter file and reads the persisted value.
    ///
    /// A new or empty file counts as 0. With `lock`, an exclusive advisory lock is held
    /// until [`PersistentIdAllocator::finish`], serializing concurrent compiler processes.
    pub fn open<P: AsRef<Path>>(path: P, lock: bool) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();

        let mut options = OpenOptions::new();
        options.read(true).write(true).create(true).truncate(false);
        #[cfg(unix)]
        options.mode(0o600);
        let mut file = options
            .open(&path)
            .map_err(|err| Error::os_error(err, format!("Unable to create {}", path.display())))?;

        if lock {
            file.lock_exclusive().map_err(|err| {
                Error::os_error(err, format!("Unable to lock {}", path.display()))
            })?;
        }

        let start = read_counter(&mut file, &path)?;
        log::debug!("Continuing join point ids after {start} ({})", path.display());

        Ok(Self {
            path,
            file,
            locked: lock,
            start,
            current: start,
        })
    }

    /// Issues the next identity.
    ///
    /// Fails once the counter reaches `u32::MAX`; identities are never reissued.
    pub fn acquire_next_id(&mut self) -> Result<u32, Error> {
        self.current = self.current.checked_add(1).ok_or_else(|| {
            Error::illegal_state(format!(
                "Join point ids exhausted in {}, delete it to start over",
                self.path.display()
            ))
        })?;
        Ok(self.current)
    }

    /// The value persisted before this run
    #[must_use]
    pub fn start(&self) -> u32 {
        self.start
    }

    /// The last identity issued, or [`Self::start`] if none was
    #[must_use]
    pub fn current(&self) -> u32 {
        self.current
    }

    /// How many identities this run issued
    #[must_use]
    pub fn issued(&self) -> u32 {
        self.current - self.start
    }

    /// The counter file
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes the last issued identity back and releases the file.
    pub fn finish(mut self) -> Result<u32, Error> {
        self.file.seek(SeekFrom::Start(0))?;
        self.file
            .write_all(&self.current.to_ne_bytes())
            .and_then(|()| self.file.flush())
            .map_err(|err| {
                Error::os_error(err, format!("Short write {}", self.path.display()))
            })?;
        if self.locked {
            FileExt::unlock(&self.file)?;
        }
        Ok(self.current)
    }
}

fn read_counter(file: &mut File, path: &Path) -> Result<u32, Error> {
    let mut buf = [0_u8; 4];
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => {
                return Err(Error::os_error(
                    err,
                    format!("Unable to read {}", path.display()),
                ))
            }
        }
    }
    match filled {
        0 => Ok(0),
        4 => Ok(u32::from_ne_bytes(buf)),
        _ => Err(Error::illegal_state(format!(
            "Short read {} ({filled} of 4 bytes)",
            path.display()
        ))),
    }
}

use std::cell::RefCell;
use std::collections::HashMap;
use std::fs::File;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use crate::log::debug;
use crate::util::fstat;
use crate::ErrorExt as _;
use crate::Result;

use super::ElfParser;


#[derive(Debug)]
struct ElfCacheEntry {
    dev: libc::dev_t,
    inode: libc::ino_t,
    size: libc::off_t,
    mtime_sec: libc::time_t,
    mtime_nsec: i64,
    parser: Arc<ElfParser>,
}

impl ElfCacheEntry {
    fn new(file: &File) -> Result<Self> {
        let stat = fstat(file.as_raw_fd())?;
        let parser = Arc::new(ElfParser::open_file(file)?);

        Ok(Self {
            dev: stat.st_dev,
            inode: stat.st_ino,
            size: stat.st_size,
            mtime_sec: stat.st_mtime,
            mtime_nsec: stat.st_mtime_nsec,
            parser,
        })
    }

    fn is_valid(&self, stat: &libc::stat) -> bool {
        stat.st_dev == self.dev
            && stat.st_ino == self.inode
            && stat.st_size == self.size
            && stat.st_mtime == self.mtime_sec
            && stat.st_mtime_nsec == self.mtime_nsec
    }
}


/// A cache of ELF parsers, keyed by path.
///
/// Entries are validated against the file's current meta data on every
/// lookup, so that a file replaced on disk (for example by a package
/// upgrade) is parsed anew.
#[derive(Debug, Default)]
pub(crate) struct ElfCache {
    cache: RefCell<HashMap<PathBuf, ElfCacheEntry>>,
}

impl ElfCache {
    pub(crate) fn find(&self, path: &Path) -> Result<Arc<ElfParser>> {
        let file = File::open(path)
            .with_context(|| format!("failed to open ELF file {}", path.display()))?;

        let mut cache = self.cache.borrow_mut();
        if let Some(entry) = cache.get(path) {
            let stat = fstat(file.as_raw_fd())?;
            if entry.is_valid(&stat) {
                return Ok(Arc::clone(&entry.parser))
            }
            debug!("ELF file {} changed on disk; reparsing", path.display());
        }

        let entry = ElfCacheEntry::new(&file)
            .with_context(|| format!("failed to parse ELF file {}", path.display()))?;
        let parser = Arc::clone(&entry.parser);
        let _previous = cache.insert(path.to_path_buf(), entry);
        Ok(parser)
    }
}

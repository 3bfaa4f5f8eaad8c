use std::fs::File;
use std::io::BufRead;
use std::io::BufReader;
use std::io::Read;
use std::ops::Range;
use std::path::PathBuf;

use crate::target::Perm;
use crate::target::RawMapping;
use crate::Addr;
use crate::Error;
use crate::ErrorExt as _;
use crate::IntoError as _;
use crate::Pid;
use crate::Result;


#[derive(Debug)]
pub(crate) struct MapsEntry {
    /// The virtual address range covered by this entry.
    pub range: Range<Addr>,
    pub perm: Perm,
    pub offset: u64,
    /// The path of the backing file, if any.
    ///
    /// Pseudo-paths such as `[heap]` or `[vdso]` are not reported.
    pub path: Option<PathBuf>,
}

impl From<MapsEntry> for RawMapping {
    fn from(entry: MapsEntry) -> Self {
        RawMapping {
            base: entry.range.start,
            size: entry.range.end - entry.range.start,
            perm: entry.perm,
            offset: entry.offset,
            path: entry.path,
            ..Default::default()
        }
    }
}


fn parse_perm(perm_str: &str) -> Option<Perm> {
    let mut perm = Perm::NONE;
    let mut chars = perm_str.chars();
    for (flag, c) in [(Perm::READ, 'r'), (Perm::WRITE, 'w'), (Perm::EXEC, 'x')] {
        match chars.next()? {
            '-' => (),
            x if x == c => perm |= flag,
            _ => return None,
        }
    }

    match chars.next()? {
        'p' => (),
        's' => perm |= Perm::SHARED,
        _ => return None,
    }
    Some(perm)
}


/// Parse a line of a proc maps file.
fn parse_maps_line<'line>(line: &'line str) -> Result<MapsEntry> {
    let full_line = line;

    let split_once = |line: &'line str, component| -> Result<(&'line str, &'line str)> {
        line.split_once(|c: char| c.is_ascii_whitespace())
            .ok_or_invalid_data(|| {
                format!("failed to find {component} in proc maps line: {line}\n{full_line}")
            })
    };

    // Lines have the following format:
    // address           perms offset  dev   inode      pathname
    // 08048000-08049000 r-xp 00000000 03:00 8312       /opt/test
    // 0804a000-0806b000 rw-p 00000000 00:00 0          [heap]
    // a7cb1000-a7cb2000 ---p 00000000 00:00 0
    // a7ed5000-a8008000 r-xp 00000000 03:00 4222       /lib/libc.so.6
    let (address_str, line) = split_once(line, "address range")?;
    let (loaded_str, end_str) = address_str.split_once('-').ok_or_invalid_data(|| {
        format!("encountered malformed address range in proc maps line: {full_line}")
    })?;
    let loaded_address = Addr::from_str_radix(loaded_str, 16)
        .map_err(Error::with_invalid_data)
        .with_context(|| format!("encountered malformed start address in proc maps line: {full_line}"))?;
    let end_address = Addr::from_str_radix(end_str, 16)
        .map_err(Error::with_invalid_data)
        .with_context(|| format!("encountered malformed end address in proc maps line: {full_line}"))?;
    if end_address < loaded_address {
        return Err(Error::with_invalid_data(format!(
            "encountered inverted address range in proc maps line: {full_line}"
        )))
    }

    let (perm_str, line) = split_once(line, "permissions component")?;
    let perm = parse_perm(perm_str).ok_or_invalid_data(|| {
        format!("encountered malformed permissions in proc maps line: {full_line}")
    })?;

    let (offset_str, line) = split_once(line, "offset component")?;
    let offset = u64::from_str_radix(offset_str, 16)
        .map_err(Error::with_invalid_data)
        .with_context(|| format!("encountered malformed offset component in proc maps line: {full_line}"))?;

    let (_dev, line) = split_once(line, "device component")?;
    // Note that by design, a path may not be present and so we may not be able
    // to successfully split.
    let path_str = split_once(line, "inode component")
        .map(|(_inode, line)| line.trim())
        .unwrap_or("");
    let path_str = path_str.strip_suffix(" (deleted)").unwrap_or(path_str);
    let path = if path_str.is_empty() || path_str.starts_with('[') {
        None
    } else {
        Some(PathBuf::from(path_str))
    };

    let entry = MapsEntry {
        range: (loaded_address..end_address),
        perm,
        offset,
        path,
    };
    Ok(entry)
}


#[derive(Debug)]
struct MapsEntryIter<R> {
    reader: R,
    line: String,
}

impl<R> Iterator for MapsEntryIter<R>
where
    R: BufRead,
{
    type Item = Result<MapsEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let () = self.line.clear();
            match self.reader.read_line(&mut self.line) {
                Err(err) => return Some(Err(Error::from(err))),
                Ok(0) => break None,
                Ok(_) => {
                    let line_str = self.line.trim();
                    // There shouldn't be any empty lines, but we'd just ignore them. We
                    // need to trim anyway.
                    if !line_str.is_empty() {
                        let result = parse_maps_line(line_str);
                        break Some(result)
                    }
                }
            }
        }
    }
}


/// Parse a proc maps file from the provided reader.
fn parse_file<R>(reader: R) -> impl Iterator<Item = Result<MapsEntry>>
where
    R: Read,
{
    MapsEntryIter {
        reader: BufReader::new(reader),
        line: String::new(),
    }
}

/// Parse the maps file for the process with the given PID.
pub(crate) fn parse(pid: Pid) -> Result<impl Iterator<Item = Result<MapsEntry>>> {
    let path = format!("/proc/{pid}/maps");
    let file = File::open(&path).with_context(|| format!("failed to open {path}"))?;
    let iter = parse_file(file);
    Ok(iter)
}


#[cfg(test)]
mod tests {
    use super::*;

    use std::path::Path;

    use test_log::test;

    use crate::ErrorKind;


    /// Check that we can parse `/proc/self/maps`.
    #[allow(clippy::suspicious_map)]
    #[test]
    fn self_map_parsing() {
        let maps = parse(Pid::Slf).unwrap();
        assert_ne!(maps.map(|entry| entry.unwrap()).count(), 0);
    }

    #[test]
    fn map_line_parsing() {
        let lines = r#"
55f4a95c9000-55f4a95cb000 r--p 00000000 00:20 41445                      /usr/bin/cat
55f4a95cb000-55f4a95cf000 r-xp 00002000 00:20 41445                      /usr/bin/cat
55f4a95cf000-55f4a95d1000 r--p 00006000 00:20 41445                      /usr/bin/cat
55f4a95d1000-55f4a95d2000 r--p 00007000 00:20 41445                      /usr/bin/cat
55f4a95d2000-55f4a95d3000 rw-p 00008000 00:20 41445                      /usr/bin/cat
55f4aa379000-55f4aa39a000 rw-p 00000000 00:00 0                          [heap]
7f1273b05000-7f1273b06000 r--s 00000000 00:13 19                         /sys/fs/selinux/status
7f2321e00000-7f2321e37000 r--p 00000000 00:20 1808269                    /usr/lib64/libgnutls.so.30.34.1 (deleted)
7f2321e37000-7f2321f6f000 r-xp 00037000 00:20 1808269                    /usr/lib64/libgnutls.so.30.34.1 (deleted)
7fa7bb400000-7fa7bb428000 r--p 00000000 00:20 12023223                   /usr/lib64/libc.so.6
7fa7bb428000-7fa7bb59c000 r-xp 00028000 00:20 12023223                   /usr/lib64/libc.so.6
7fa7bb5fa000-7fa7bb602000 rw-p 00000000 00:00 0
7fa7bb75a000-7fa7bb75c000 r--p 00000000 00:20 12023220                   /usr/lib64/ld-linux-x86-64.so.2
7fa7bb75c000-7fa7bb783000 r-xp 00002000 00:20 12023220                   /usr/lib64/ld-linux-x86-64.so.2
7ffd03212000-7ffd03234000 rw-p 00000000 00:00 0                          [stack]
7ffd033ab000-7ffd033ad000 r-xp 00000000 00:00 0                          [vdso]
ffffffffff600000-ffffffffff601000 --xp 00000000 00:00 0                  [vsyscall]
"#;

        let entries = parse_file(lines.as_bytes());
        let () = entries.for_each(|entry| {
            let _entry = entry.unwrap();
        });

        // Parse the first (actual) line.
        let entry = parse_maps_line(lines.lines().nth(1).unwrap()).unwrap();
        assert_eq!(entry.range.start, 0x55f4a95c9000);
        assert_eq!(entry.range.end, 0x55f4a95cb000);
        assert_eq!(entry.perm, Perm::READ);
        assert_eq!(entry.path.as_deref(), Some(Path::new("/usr/bin/cat")));

        let entry = parse_maps_line(lines.lines().nth(2).unwrap()).unwrap();
        assert_eq!(entry.perm, Perm::READ | Perm::EXEC);
        assert_eq!(entry.offset, 0x2000);

        let entry = parse_maps_line(lines.lines().nth(6).unwrap()).unwrap();
        assert_eq!(entry.path, None);

        let entry = parse_maps_line(lines.lines().nth(7).unwrap()).unwrap();
        assert_eq!(entry.perm, Perm::READ | Perm::SHARED);

        let entry = parse_maps_line(lines.lines().nth(8).unwrap()).unwrap();
        assert_eq!(
            entry.path.as_deref(),
            Some(Path::new("/usr/lib64/libgnutls.so.30.34.1"))
        );

        let entry = parse_maps_line(lines.lines().nth(12).unwrap()).unwrap();
        assert_eq!(entry.path, None);
        assert_eq!(entry.perm, Perm::READ | Perm::WRITE);

        let mapping = RawMapping::from(entry);
        assert_eq!(mapping.base, 0x7fa7bb5fa000);
        assert_eq!(mapping.size, 0x8000);
    }

    /// Make sure that malformed lines are reported as such.
    #[test]
    fn malformed_line_parsing() {
        let err = parse_maps_line("55f4a95c9000 r--p 00000000 00:20 41445").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);

        let err = parse_maps_line("2000-1000 r--p 00000000 00:20 41445").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);

        let err = parse_maps_line("1000-2000 rzxp 00000000 00:20 41445").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }
}

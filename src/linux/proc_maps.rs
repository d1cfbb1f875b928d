use thiserror::Error;

/// Name suffix of the synthetic map the kernel places uretprobe trampolines
/// in. A callstack frame that resolves into this map marks the point where
/// unwinding hit a hijacked return address.
pub const UPROBES_MAP_NAME: &str = "[uprobes]";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MapsParseError {
    #[error("line {line}: expected {what}")]
    MissingField { line: usize, what: &'static str },

    #[error("line {line}: bad {what}: {value:?}")]
    BadField {
        line: usize,
        what: &'static str,
        value: String,
    },
}

#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct Region {
    pub start: u64,
    pub end: u64,
    pub is_read: bool,
    pub is_write: bool,
    pub is_executable: bool,
    pub is_shared: bool,
    pub file_offset: u64,
    pub major: u32,
    pub minor: u32,
    pub inode: u64,
    pub name: String,
}

impl Region {
    pub fn contains(&self, address: u64) -> bool {
        self.start <= address && address < self.end
    }

    pub fn is_uprobes(&self) -> bool {
        self.name.ends_with(UPROBES_MAP_NAME)
    }
}

fn get_until<'a>(p: &mut &'a str, delimiter: char) -> &'a str {
    let mut found = None;
    for (index, ch) in p.char_indices() {
        if ch == delimiter {
            found = Some(index);
            break;
        }
    }

    if let Some(index) = found {
        let (before, after) = p.split_at(index);
        *p = &after[delimiter.len_utf8()..];
        before
    } else {
        let before = *p;
        *p = "";
        before
    }
}

fn get_char(p: &mut &str) -> Option<char> {
    let ch = p.chars().next()?;
    *p = &p[ch.len_utf8()..];
    Some(ch)
}

fn skip_whitespace(p: &mut &str) {
    while let Some(ch) = p.chars().next() {
        if ch == ' ' {
            *p = &p[ch.len_utf8()..];
        } else {
            break;
        }
    }
}

fn hex_field(line: usize, what: &'static str, text: &str) -> Result<u64, MapsParseError> {
    u64::from_str_radix(text, 16).map_err(|_| MapsParseError::BadField {
        line,
        what,
        value: text.to_owned(),
    })
}

/// Parses the text of `/proc/<pid>/maps` into regions.
pub fn parse(maps: &str) -> Result<Vec<Region>, MapsParseError> {
    if maps.is_empty() {
        return Ok(Vec::new());
    }

    let mut output = Vec::new();
    for (index, mut line) in maps.trim().split('\n').enumerate() {
        let line_no = index + 1;
        let start = hex_field(line_no, "start address", get_until(&mut line, '-'))?;
        let end = hex_field(line_no, "end address", get_until(&mut line, ' '))?;
        let mut perm = || {
            get_char(&mut line).ok_or(MapsParseError::MissingField {
                line: line_no,
                what: "permissions",
            })
        };
        let is_read = perm()? == 'r';
        let is_write = perm()? == 'w';
        let is_executable = perm()? == 'x';
        let is_shared = perm()? == 's';
        get_char(&mut line);

        let file_offset = hex_field(line_no, "file offset", get_until(&mut line, ' '))?;
        let major = hex_field(line_no, "device major", get_until(&mut line, ':'))? as u32;
        let minor = hex_field(line_no, "device minor", get_until(&mut line, ' '))? as u32;
        let inode_text = get_until(&mut line, ' ');
        let inode = inode_text
            .parse()
            .map_err(|_| MapsParseError::BadField {
                line: line_no,
                what: "inode",
                value: inode_text.to_owned(),
            })?;
        skip_whitespace(&mut line);
        let name = line.to_owned();

        output.push(Region {
            start,
            end,
            is_read,
            is_write,
            is_executable,
            is_shared,
            file_offset,
            major,
            minor,
            inode,
            name,
        });
    }

    Ok(output)
}

/// A snapshot of the target's address space: the parse of `/proc/<pid>/maps`
/// at capture start plus any mmap-driven updates observed afterwards.
///
/// Regions are kept sorted and non-overlapping, so any pc is contained in at
/// most one region.
#[derive(Debug, Clone, Default)]
pub struct ProcessMaps {
    regions: Vec<Region>,
}

impl ProcessMaps {
    pub fn parse(maps: &str) -> Result<Self, MapsParseError> {
        let mut regions = parse(maps)?;
        regions.sort_by_key(|r| r.start);
        Ok(ProcessMaps { regions })
    }

    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    /// The region containing `address`, if any.
    pub fn lookup(&self, address: u64) -> Option<&Region> {
        let index = match self.regions.binary_search_by_key(&address, |r| r.start) {
            Ok(index) => index,
            Err(0) => return None,
            Err(index) => index - 1,
        };
        let region = &self.regions[index];
        region.contains(address).then_some(region)
    }

    /// Applies a new mapping, evicting any overlapping part of existing
    /// regions first.
    pub fn add(&mut self, region: Region) {
        self.remove_range(region.start, region.end);
        let index = self
            .regions
            .binary_search_by_key(&region.start, |r| r.start)
            .unwrap_err();
        self.regions.insert(index, region);
    }

    /// Removes the `[start, end)` span from the snapshot, splitting regions
    /// that partially overlap it.
    pub fn remove_range(&mut self, start: u64, end: u64) {
        let mut result = Vec::with_capacity(self.regions.len());
        for region in self.regions.drain(..) {
            if region.end <= start || region.start >= end {
                result.push(region);
                continue;
            }
            if region.start < start {
                let mut left = region.clone();
                left.end = start;
                result.push(left);
            }
            if region.end > end {
                let mut right = region.clone();
                right.file_offset += end - right.start;
                right.start = end;
                result.push(right);
            }
        }
        self.regions = result;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_until() {
        let mut p = "1234 5678";
        assert_eq!(get_until(&mut p, ' '), "1234");
        assert_eq!(p, "5678");

        assert_eq!(get_until(&mut p, ' '), "5678");
        assert_eq!(p, "");

        assert_eq!(get_until(&mut p, ' '), "");
    }

    #[test]
    fn test_parse() {
        let maps = r#"
00400000-0040c000 r-xp 00000000 08:02 1321238                            /usr/bin/cat
0060d000-0062e000 rw-p 00000000 00:00 0                                  [heap]
7ffff672c000-7ffff69db000 r--s 00001ac2 1f:33 1335289                    /usr/lib/locale/locale-archive
7ffff5600000-7ffff5800000 rw-p 00000000 00:00 0
"#;

        assert_eq!(
            parse(maps).unwrap(),
            vec![
                Region {
                    start: 0x00400000,
                    end: 0x0040c000,
                    is_read: true,
                    is_write: false,
                    is_executable: true,
                    is_shared: false,
                    file_offset: 0,
                    major: 0x08,
                    minor: 0x02,
                    inode: 1321238,
                    name: "/usr/bin/cat".to_owned()
                },
                Region {
                    start: 0x0060d000,
                    end: 0x0062e000,
                    is_read: true,
                    is_write: true,
                    is_executable: false,
                    is_shared: false,
                    file_offset: 0,
                    major: 0,
                    minor: 0,
                    inode: 0,
                    name: "[heap]".to_owned()
                },
                Region {
                    start: 0x7ffff672c000,
                    end: 0x7ffff69db000,
                    is_read: true,
                    is_write: false,
                    is_executable: false,
                    is_shared: true,
                    file_offset: 0x1ac2,
                    major: 0x1f,
                    minor: 0x33,
                    inode: 1335289,
                    name: "/usr/lib/locale/locale-archive".to_owned()
                },
                Region {
                    start: 0x7ffff5600000,
                    end: 0x7ffff5800000,
                    is_read: true,
                    is_write: true,
                    is_executable: false,
                    is_shared: false,
                    file_offset: 0,
                    major: 0,
                    minor: 0,
                    inode: 0,
                    name: "".to_owned()
                }
            ]
        );
    }

    #[test]
    fn test_empty_maps() {
        assert_eq!(parse("").unwrap(), vec![]);
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(matches!(
            parse("zzzz-0040c000 r-xp 00000000 08:02 0  /bin/x"),
            Err(MapsParseError::BadField { line: 1, .. })
        ));
        assert!(matches!(
            parse("00400000-0040c000"),
            Err(MapsParseError::MissingField { line: 1, .. })
        ));
    }

    fn region(start: u64, end: u64, name: &str) -> Region {
        Region {
            start,
            end,
            is_read: true,
            is_write: false,
            is_executable: true,
            is_shared: false,
            file_offset: 0,
            major: 0,
            minor: 0,
            inode: 0,
            name: name.to_owned(),
        }
    }

    #[test]
    fn lookup_finds_at_most_one_region() {
        let mut maps = ProcessMaps::default();
        maps.add(region(0x1000, 0x2000, "/bin/a"));
        maps.add(region(0x3000, 0x4000, "/bin/b"));

        assert_eq!(maps.lookup(0x1000).unwrap().name, "/bin/a");
        assert_eq!(maps.lookup(0x1fff).unwrap().name, "/bin/a");
        assert!(maps.lookup(0x2000).is_none());
        assert_eq!(maps.lookup(0x3500).unwrap().name, "/bin/b");
        assert!(maps.lookup(0x5000).is_none());
    }

    #[test]
    fn add_evicts_overlapping_regions() {
        let mut maps = ProcessMaps::default();
        maps.add(region(0x1000, 0x4000, "/bin/old"));
        maps.add(region(0x2000, 0x3000, "/bin/new"));

        assert_eq!(maps.lookup(0x1800).unwrap().name, "/bin/old");
        assert_eq!(maps.lookup(0x2800).unwrap().name, "/bin/new");
        let tail = maps.lookup(0x3800).unwrap();
        assert_eq!(tail.name, "/bin/old");
        assert_eq!(tail.file_offset, 0x2000);
    }

    #[test]
    fn uprobes_map_is_detected_by_suffix() {
        assert!(region(0x1000, 0x2000, "[uprobes]").is_uprobes());
        assert!(!region(0x1000, 0x2000, "[heap]").is_uprobes());
    }
}

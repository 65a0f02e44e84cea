use std::{
    fmt,
    io::{self, BufRead},
};

/// Which way a transcript entry travelled: `<-` is a stimulus coming out of
/// the system under test, `->` is a response travelling back into it.
/// Note that these are the *canonical* directions; the server may swap the
/// conventions for socket traffic once the SUT announces itself as a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::In => "<-",
            Self::Out => "->",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The three character type tag that follows the direction marker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tag {
    Cmd,
    Cli,
    Srv,
    Out,
    Err,
    Exc,
    Ret,
    Fil,
    Pyt,
}

impl Tag {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cmd => "CMD",
            Self::Cli => "CLI",
            Self::Srv => "SRV",
            Self::Out => "OUT",
            Self::Err => "ERR",
            Self::Exc => "EXC",
            Self::Ret => "RET",
            Self::Fil => "FIL",
            Self::Pyt => "PYT",
        }
    }

    pub fn parse(code: &str) -> Option<Self> {
        let tag = match code {
            "CMD" => Self::Cmd,
            "CLI" => Self::Cli,
            "SRV" => Self::Srv,
            "OUT" => Self::Out,
            "ERR" => Self::Err,
            "EXC" => Self::Exc,
            "RET" => Self::Ret,
            "FIL" => Self::Fil,
            "PYT" => Self::Pyt,
            _ => return None,
        };
        Some(tag)
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A new logical entry begins at any line carrying a direction marker
pub fn is_entry_start(line: &str) -> bool {
    line.starts_with("<-") || line.starts_with("->")
}

/// The raw 3 character type code of an entry, i.e. the characters between the
/// direction marker and the separating colon. Returned as written, whether or
/// not it names a tag this crate knows about
pub fn type_code(entry: &str) -> Option<&str> {
    if entry.len() >= 5 && entry.is_char_boundary(2) && entry.is_char_boundary(5) {
        Some(&entry[2..5])
    } else {
        None
    }
}

/// Splits an entry into its direction, tag and body. Returns None for bodies
/// that are missing the `:` separator or carry a tag this crate cannot name,
/// allowing callers to skip such entries
pub fn split_entry(entry: &str) -> Option<(Direction, Tag, &str)> {
    let direction = match entry.get(..2) {
        Some("<-") => Direction::In,
        Some("->") => Direction::Out,
        _ => return None,
    };
    let tag = Tag::parse(entry.get(2..5)?)?;
    match entry.get(5..6) {
        Some(":") => Some((direction, tag, &entry[6..])),
        _ => None,
    }
}

/// Reads a transcript into its logical entries. Bodies may span multiple
/// lines; a new entry starts only at a line beginning with a direction
/// marker. Line endings are preserved in the returned blocks
pub fn read_entries<R>(reader: R) -> io::Result<Vec<String>>
where
    R: BufRead,
{
    let mut entries = Vec::new();
    let mut current = String::new();

    for line in reader.lines() {
        let line = line?;
        if is_entry_start(&line) && !current.is_empty() {
            entries.push(current);
            current = String::new();
        }
        current.push_str(&line);
        current.push('\n');
    }
    if !current.is_empty() {
        entries.push(current);
    }

    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entries_group_multiline_bodies() {
        let transcript = "<-CMD:cat notes\n->OUT:line one\nline two\n->EXC:1\n";
        let entries = read_entries(transcript.as_bytes()).unwrap();

        assert_eq!(
            entries,
            vec![
                "<-CMD:cat notes\n".to_string(),
                "->OUT:line one\nline two\n".to_string(),
                "->EXC:1\n".to_string(),
            ]
        );
    }

    #[test]
    fn entries_preamble_is_kept_as_a_block() {
        let transcript = "junk header\n<-CLI:hello\n";
        let entries = read_entries(transcript.as_bytes()).unwrap();

        assert_eq!(entries.len(), 2);
        assert!(!is_entry_start(&entries[0]));
        assert!(is_entry_start(&entries[1]));
    }

    #[test]
    fn split_recognises_known_tags() {
        let (direction, tag, body) = split_entry("->OUT:a\nb\n").unwrap();
        assert_eq!(direction, Direction::Out);
        assert_eq!(tag, Tag::Out);
        assert_eq!(body, "a\nb\n");
    }

    #[test]
    fn split_rejects_unknown_tags() {
        assert!(split_entry("->XYZ:whatever").is_none());
        assert!(split_entry("--OUT:whatever").is_none());
        assert!(split_entry("->OUT").is_none());
        // the raw code is still visible for same-type comparisons
        assert_eq!(type_code("->XYZ:whatever"), Some("XYZ"));
    }
}

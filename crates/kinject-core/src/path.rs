//! Path matching helpers.
//!
//! Image and process paths are compared by suffix, ignoring case, the same
//! way the host reports them (`\Device\HarddiskVolume3\Windows\...`).
//!
//! Case is folded one character at a time to its simple uppercase form.
//! Characters whose uppercase form is longer than one character (`ß`) are
//! compared as they are.

/// Folds `c` to its single-character uppercase form.
fn upcase(c: char) -> char {
    let mut upper = c.to_uppercase();

    match (upper.next(), upper.next()) {
        (Some(upper), None) => upper,
        _ => c,
    }
}

/// Checks whether `path` ends with `suffix`, ignoring case.
///
/// An empty suffix never matches.
///
/// # Examples
///
/// ```
/// # use kinject_core::path::ends_with_ignore_case;
/// assert!(ends_with_ignore_case(r"C:\Windows\System32\NTDLL.dll", r"\system32\ntdll.dll"));
/// assert!(!ends_with_ignore_case(r"C:\Windows\SysWOW64\ntdll.dll", r"\system32\ntdll.dll"));
/// ```
pub fn ends_with_ignore_case(path: &str, suffix: &str) -> bool {
    if suffix.is_empty() {
        return false;
    }

    let mut path = path.chars().rev().map(upcase);
    suffix
        .chars()
        .rev()
        .map(upcase)
        .all(|expected| path.next() == Some(expected))
}

/// A string key ordered and compared without regard to case.
#[derive(Debug, Clone)]
pub struct CaseInsensitive(pub String);

impl CaseInsensitive {
    fn folded(&self) -> impl Iterator<Item = char> + '_ {
        self.0.chars().map(upcase)
    }
}

impl From<&str> for CaseInsensitive {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl PartialEq for CaseInsensitive {
    fn eq(&self, other: &Self) -> bool {
        self.folded().eq(other.folded())
    }
}

impl Eq for CaseInsensitive {}

impl PartialOrd for CaseInsensitive {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for CaseInsensitive {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.folded().cmp(other.folded())
    }
}

impl std::fmt::Display for CaseInsensitive {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

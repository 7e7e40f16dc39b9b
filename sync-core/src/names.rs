//! Cross-platform filename validation.

use std::collections::HashMap;

const ILLEGAL_CHARS: &[char] = &['<', '>', ':', '"', '\\', '|', '?', '*'];

const RESERVED_NAMES: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

const MAX_COMPONENT_BYTES: usize = 255;

/// What is wrong with a name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilenameProblemKind {
    /// Reserved device name (e.g. `CON`, `LPT1`).
    ReservedName,
    /// Character that is illegal on at least one platform.
    IllegalCharacter(char),
    /// Name ends with a dot or a space.
    TrailingDotOrSpace,
    /// Path component longer than 255 bytes.
    TooLong,
    /// Another path differs only in letter case.
    CaseCollision {
        /// The colliding path.
        other: String,
    },
}

/// A problem found with one path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilenameProblem {
    /// Relative path.
    pub path: String,
    /// Problem kind.
    pub kind: FilenameProblemKind,
}

impl std::fmt::Display for FilenameProblem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            FilenameProblemKind::ReservedName => write!(f, "{}: reserved name", self.path),
            FilenameProblemKind::IllegalCharacter(c) => {
                write!(f, "{}: illegal character {:?}", self.path, c)
            }
            FilenameProblemKind::TrailingDotOrSpace => {
                write!(f, "{}: ends with dot or space", self.path)
            }
            FilenameProblemKind::TooLong => write!(f, "{}: name too long", self.path),
            FilenameProblemKind::CaseCollision { other } => {
                write!(f, "{}: differs only in case from {}", self.path, other)
            }
        }
    }
}

/// Check every component of a `/`-separated relative path.
pub fn check_path(path: &str) -> Vec<FilenameProblem> {
    let mut problems = Vec::new();
    let mut push = |kind| {
        if !problems.iter().any(|p: &FilenameProblem| p.kind == kind) {
            problems.push(FilenameProblem {
                path: path.to_string(),
                kind,
            });
        }
    };

    for component in path.split('/').filter(|c| !c.is_empty()) {
        if let Some(c) = component
            .chars()
            .find(|c| ILLEGAL_CHARS.contains(c) || c.is_control())
        {
            push(FilenameProblemKind::IllegalCharacter(c));
        }
        if component.ends_with('.') || component.ends_with(' ') {
            push(FilenameProblemKind::TrailingDotOrSpace);
        }
        if component.len() > MAX_COMPONENT_BYTES {
            push(FilenameProblemKind::TooLong);
        }
        let stem = component.split('.').next().unwrap_or(component);
        if RESERVED_NAMES.iter().any(|r| r.eq_ignore_ascii_case(stem)) {
            push(FilenameProblemKind::ReservedName);
        }
    }
    problems
}

/// Find paths that collide when letter case is ignored.
///
/// Within each colliding group the lexicographically smallest path is kept
/// and every other path is reported against it.
pub fn find_case_collisions<'a, I>(paths: I) -> Vec<FilenameProblem>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut groups: HashMap<String, Vec<&'a str>> = HashMap::new();
    for path in paths {
        groups.entry(path.to_lowercase()).or_default().push(path);
    }

    let mut problems = Vec::new();
    for mut group in groups.into_values().filter(|g| g.len() > 1) {
        group.sort_unstable();
        group.dedup();
        let (keeper, rest) = match group.split_first() {
            Some(split) => split,
            None => continue,
        };
        for other in rest {
            problems.push(FilenameProblem {
                path: other.to_string(),
                kind: FilenameProblemKind::CaseCollision {
                    other: keeper.to_string(),
                },
            });
        }
    }
    problems.sort_by(|a, b| a.path.cmp(&b.path));
    problems
}

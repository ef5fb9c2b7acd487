use std::fmt;
use std::sync::Arc;

/// Source provenance for diagnostics: file and line of the construct that
/// produced an expression or bytecode. Cheap to clone; the file name is
/// shared.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceLoc {
    pub file: Option<Arc<str>>,
    pub line: u32,
}

impl SourceLoc {
    pub fn new(file: impl Into<Arc<str>>, line: u32) -> Self {
        Self {
            file: Some(file.into()),
            line,
        }
    }

    pub const fn unknown() -> Self {
        Self {
            file: None,
            line: 0,
        }
    }
}

impl fmt::Display for SourceLoc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.file {
            Some(file) => write!(f, "{file}:{line}", line = self.line),
            None => f.write_str("<unknown>"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn displays_file_and_line() {
        assert_eq!(SourceLoc::new("boot.asm", 12).to_string(), "boot.asm:12");
        assert_eq!(SourceLoc::unknown().to_string(), "<unknown>");
    }
}

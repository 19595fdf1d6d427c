use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;

// gcc/clang carry a column, nasm does not.
static TOOL_ERROR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[^:\s]+:\d+:(?:\d+:)? (?:fatal )?error: ").unwrap());
static TOOL_WARNING: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[^:\s]+:\d+:(?:\d+:)? warning: ").unwrap());
static LINKER_ERROR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"undefined reference to|multiple definition of|cannot find|undefined symbol")
        .unwrap()
});
static ANSI_ESCAPE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\x1b\[[0-9;]*m").unwrap());

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Diagnostics {
    pub errors: usize,
    pub warnings: usize,
}

impl Diagnostics {
    pub fn scan<S: AsRef<str>>(lines: &[S]) -> Self {
        let mut diagnostics = Self::default();

        for line in lines {
            let line = ANSI_ESCAPE.replace_all(line.as_ref(), "");
            if TOOL_ERROR.is_match(&line) || LINKER_ERROR.is_match(&line) {
                diagnostics.errors += 1;
            } else if TOOL_WARNING.is_match(&line) {
                diagnostics.warnings += 1;
            }
        }

        diagnostics
    }

    pub fn is_empty(&self) -> bool {
        self.errors == 0 && self.warnings == 0
    }
}

impl fmt::Display for Diagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let plural = |n: usize| if n == 1 { "" } else { "s" };
        write!(
            f,
            "{} error{}, {} warning{}",
            self.errors,
            plural(self.errors),
            self.warnings,
            plural(self.warnings)
        )
    }
}

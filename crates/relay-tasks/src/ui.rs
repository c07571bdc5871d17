//! Per-task console output
//!
//! Every task's lines are prefixed with a colorized `package#task:`
//! label. Colors are assigned per package, cycling through a fixed
//! palette, so one package's output stays visually grouped across
//! tasks.

use std::collections::HashMap;
use std::sync::Mutex;

use console::{Color, Style};

use crate::task::TaskId;

const PREFIX_COLORS: [Color; 5] = [
    Color::Cyan,
    Color::Magenta,
    Color::Green,
    Color::Yellow,
    Color::Blue,
];

/// Assigns one palette color per package.
#[derive(Default)]
pub struct ColorCache {
    assigned: Mutex<HashMap<String, usize>>,
}

impl ColorCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn style_for(&self, package: &str) -> Style {
        let mut assigned = self.assigned.lock().unwrap();
        let next = assigned.len() % PREFIX_COLORS.len();
        let index = *assigned.entry(package.to_string()).or_insert(next);
        Style::new().fg(PREFIX_COLORS[index])
    }
}

/// Prefixed writer for one task's console output.
#[derive(Debug, Clone)]
pub struct TaskUi {
    prefix: String,
    quiet: bool,
}

impl TaskUi {
    pub fn new(task_id: &TaskId, style: Style) -> Self {
        Self {
            prefix: style.apply_to(format!("{task_id}: ")).to_string(),
            quiet: false,
        }
    }

    /// A UI that swallows regular output, for `--quiet` style runs and
    /// tests.
    pub fn silent(task_id: &TaskId) -> Self {
        Self {
            prefix: format!("{task_id}: "),
            quiet: true,
        }
    }

    pub fn output(&self, line: &str) {
        if !self.quiet {
            println!("{}{}", self.prefix, line);
        }
    }

    pub fn warn(&self, message: &str) {
        if !self.quiet {
            eprintln!(
                "{}{} {}",
                self.prefix,
                console::style("warning:").yellow().bold(),
                message
            );
        }
    }

    pub fn error(&self, message: &str) {
        eprintln!(
            "{}{} {}",
            self.prefix,
            console::style("error:").red().bold(),
            message
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_color_is_stable_per_package() {
        let cache = ColorCache::new();
        let first = cache.style_for("app");
        let again = cache.style_for("app");
        assert_eq!(format!("{first:?}"), format!("{again:?}"));
    }

    #[test]
    fn test_colors_cycle() {
        let cache = ColorCache::new();
        for pkg in ["a", "b", "c", "d", "e"] {
            cache.style_for(pkg);
        }
        // Sixth package wraps to the first palette entry.
        let wrapped = cache.style_for("f");
        let first = ColorCache::new().style_for("a");
        assert_eq!(format!("{wrapped:?}"), format!("{first:?}"));
    }
}

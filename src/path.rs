//! Path helpers for user-facing display.

use std::path::{Path, PathBuf};

/// Format a filesystem path for user-facing output.
///
/// Replaces the home directory prefix with `~` (e.g. `/home/alex/agenttree` ->
/// `~/agenttree`). Paths outside home are returned unchanged.
pub fn format_path_for_display(path: &Path) -> String {
    if let Some(home) = dirs::home_dir()
        && let Ok(stripped) = path.strip_prefix(&home)
    {
        if stripped.as_os_str().is_empty() {
            return "~".to_string();
        }

        let mut display_path = PathBuf::from("~");
        display_path.push(stripped);
        return display_path.display().to_string();
    }

    path.display().to_string()
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::format_path_for_display;

    #[test]
    fn shortens_path_under_home() {
        let Some(home) = dirs::home_dir() else {
            return;
        };

        let path = home.join("agenttree").join("repo");
        let formatted = format_path_for_display(&path);

        assert!(formatted.starts_with('~'), "got {formatted}");
        assert!(formatted.contains("agenttree"));
        assert!(formatted.ends_with("repo"));
    }

    #[test]
    fn shows_home_as_tilde() {
        let Some(home) = dirs::home_dir() else {
            return;
        };
        assert_eq!(format_path_for_display(&home), "~");
    }

    #[test]
    fn leaves_non_home_paths_unchanged() {
        let path = PathBuf::from("/tmp/agenttree-non-home-path");
        let formatted = format_path_for_display(&path);
        assert_eq!(formatted, path.display().to_string());
    }
}

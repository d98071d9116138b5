//! Project directory authorization.
//!
//! Sessions may only be spawned inside directories that have been marked as
//! projects: an absolute path containing `.multiterm/project.json` with a
//! string `id` and a string `name`.

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Name of the per-project metadata directory.
pub const MARKER_DIR: &str = ".multiterm";

const MARKER_FILE: &str = "project.json";

/// Decides which directories sessions may be spawned in.
pub trait ProjectAuthority: Send + Sync {
    /// Resolve a project id to its directory.
    fn resolve(&self, project_id: &str) -> Option<PathBuf>;

    /// Whether a session may be spawned with this working directory.
    fn is_authorized(&self, cwd: &Path) -> bool;

    /// Every known project directory.
    fn project_dirs(&self) -> Vec<PathBuf>;
}

#[derive(Debug, Deserialize)]
struct Marker {
    id: String,
    #[allow(dead_code)]
    name: String,
}

fn read_marker(dir: &Path) -> Option<Marker> {
    let text = std::fs::read_to_string(marker_path(dir)).ok()?;
    serde_json::from_str(&text).ok()
}

pub fn marker_path(dir: &Path) -> PathBuf {
    dir.join(MARKER_DIR).join(MARKER_FILE)
}

/// Authorizes directories carrying a valid project marker. Ids resolve by
/// scanning the configured roots.
#[derive(Debug, Clone, Default)]
pub struct MarkerProjects {
    roots: Vec<PathBuf>,
}

impl MarkerProjects {
    pub fn new(roots: Vec<PathBuf>) -> Self {
        Self { roots }
    }
}

impl ProjectAuthority for MarkerProjects {
    fn resolve(&self, project_id: &str) -> Option<PathBuf> {
        self.roots
            .iter()
            .find(|root| read_marker(root).is_some_and(|m| m.id == project_id))
            .cloned()
    }

    fn is_authorized(&self, cwd: &Path) -> bool {
        cwd.is_absolute() && read_marker(cwd).is_some()
    }

    fn project_dirs(&self) -> Vec<PathBuf> {
        self.roots.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mark(dir: &Path, body: &str) {
        std::fs::create_dir_all(dir.join(MARKER_DIR)).unwrap();
        std::fs::write(marker_path(dir), body).unwrap();
    }

    #[test]
    fn marked_directory_is_authorized() {
        let dir = tempfile::tempdir().unwrap();
        mark(dir.path(), r#"{"id":"p1","name":"demo"}"#);
        assert!(MarkerProjects::default().is_authorized(dir.path()));
    }

    #[test]
    fn unmarked_directory_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!MarkerProjects::default().is_authorized(dir.path()));
    }

    #[test]
    fn marker_needs_string_id_and_name() {
        let dir = tempfile::tempdir().unwrap();
        mark(dir.path(), r#"{"id":42,"name":"demo"}"#);
        assert!(!MarkerProjects::default().is_authorized(dir.path()));
        mark(dir.path(), r#"{"id":"p1"}"#);
        assert!(!MarkerProjects::default().is_authorized(dir.path()));
        mark(dir.path(), "not json");
        assert!(!MarkerProjects::default().is_authorized(dir.path()));
    }

    #[test]
    fn relative_paths_are_rejected() {
        assert!(!MarkerProjects::default().is_authorized(Path::new("some/relative/dir")));
    }

    #[test]
    fn resolves_ids_across_roots() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        mark(a.path(), r#"{"id":"alpha","name":"A"}"#);
        mark(b.path(), r#"{"id":"beta","name":"B"}"#);
        let projects = MarkerProjects::new(vec![a.path().to_path_buf(), b.path().to_path_buf()]);

        assert_eq!(projects.resolve("beta").as_deref(), Some(b.path()));
        assert_eq!(projects.resolve("gamma"), None);
        assert_eq!(projects.project_dirs().len(), 2);
    }
}

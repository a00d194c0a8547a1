//! Registry storage locations.

use std::path::{Path, PathBuf};

use crate::model::ServerCollection;

/// Where each collection lives on disk.
///
/// - system:  `<user_data>/mcp/system/`
/// - user:    `<user_data>/mcp/servers/`
/// - project: `<project>/.deechat/mcp/` (absent without a workspace)
///
/// The legacy single-file store sits at `<user_data>/mcp-servers.json`.
#[derive(Debug, Clone)]
pub struct RegistryPaths {
    /// Directory holding system-collection configs
    pub system_dir: PathBuf,
    /// Directory holding user-collection configs
    pub user_dir: PathBuf,
    /// Directory holding project-collection configs, when a project is open
    pub project_dir: Option<PathBuf>,
    /// Pre-collection single-file store, migrated on startup
    pub legacy_file: PathBuf,
}

impl RegistryPaths {
    /// Derive all locations from the application data root and an optional
    /// project directory.
    pub fn new(user_data: impl Into<PathBuf>, project_root: Option<&Path>) -> Self {
        let user_data = user_data.into();
        Self {
            system_dir: user_data.join("mcp").join("system"),
            user_dir: user_data.join("mcp").join("servers"),
            project_dir: project_root.map(|p| p.join(".deechat").join("mcp")),
            legacy_file: user_data.join("mcp-servers.json"),
        }
    }

    /// Resolve against the platform data directory (`~/.local/share/deechat`
    /// on Linux), falling back to the current directory.
    pub fn discover(project_root: Option<&Path>) -> Self {
        let user_data = dirs::data_dir()
            .map(|d| d.join("deechat"))
            .unwrap_or_else(|| PathBuf::from(".deechat-data"));
        Self::new(user_data, project_root)
    }

    /// Directory for a collection; `None` for the project collection when
    /// no project is open.
    pub fn dir_for(&self, collection: ServerCollection) -> Option<&PathBuf> {
        match collection {
            ServerCollection::System => Some(&self.system_dir),
            ServerCollection::User => Some(&self.user_dir),
            ServerCollection::Project => self.project_dir.as_ref(),
        }
    }

    /// File path for a config id within a collection
    pub fn config_file(&self, collection: ServerCollection, id: &str) -> Option<PathBuf> {
        self.dir_for(collection).map(|d| d.join(format!("{id}.json")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_matches_contract() {
        let paths = RegistryPaths::new("/data/deechat", Some(Path::new("/work/proj")));
        assert_eq!(paths.system_dir, PathBuf::from("/data/deechat/mcp/system"));
        assert_eq!(paths.user_dir, PathBuf::from("/data/deechat/mcp/servers"));
        assert_eq!(
            paths.project_dir.as_deref(),
            Some(Path::new("/work/proj/.deechat/mcp"))
        );
        assert_eq!(
            paths.legacy_file,
            PathBuf::from("/data/deechat/mcp-servers.json")
        );
    }

    #[test]
    fn project_dir_absent_without_project() {
        let paths = RegistryPaths::new("/data/deechat", None);
        assert!(paths.dir_for(ServerCollection::Project).is_none());
        assert!(paths.config_file(ServerCollection::Project, "x").is_none());
    }
}

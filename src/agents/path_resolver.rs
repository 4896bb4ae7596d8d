// CLI binary path resolution for agent tools

use std::path::{Path, PathBuf};

pub struct CliPathResolver;

impl CliPathResolver {
    /// Resolve the Claude CLI, honouring a configured name or path first
    pub fn resolve_claude(configured: &Path) -> Option<PathBuf> {
        Self::resolve(
            configured,
            &[dirs::home_dir().map(|h| h.join(".claude/local/claude"))],
        )
    }

    pub fn resolve_docker(configured: &Path) -> Option<PathBuf> {
        Self::resolve(configured, &[])
    }

    pub fn resolve_git(configured: &Path) -> Option<PathBuf> {
        Self::resolve(configured, &[])
    }

    /// A configured path with a directory component must exist as given.
    /// A bare name is looked up in common install locations, then PATH.
    fn resolve(configured: &Path, extra_paths: &[Option<PathBuf>]) -> Option<PathBuf> {
        if configured.components().count() > 1 {
            return configured.exists().then(|| configured.to_path_buf());
        }

        let name = configured.to_string_lossy();
        let standard_paths = [
            dirs::home_dir().map(|h| h.join(format!(".npm-global/bin/{}", name))),
            Some(PathBuf::from(format!("/usr/local/bin/{}", name))),
            Some(PathBuf::from(format!("/opt/homebrew/bin/{}", name))),
        ];

        for path in extra_paths.iter().chain(standard_paths.iter()).flatten() {
            if path.is_file() {
                log::info!("[CliPathResolver] Found {} at: {:?}", name, path);
                return Some(path.clone());
            }
        }

        match which::which(configured) {
            Ok(path) => {
                log::info!("[CliPathResolver] Found {} via PATH at: {:?}", name, path);
                Some(path)
            }
            Err(_) => None,
        }
    }
}

// Utility functions

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

// =============================================================================
// Path Helpers
// =============================================================================

/// Get the .agent-jobs directory path for a project.
///
/// # Example
/// ```ignore
/// use crate::utils::agent_jobs_dir;
///
/// // Instead of: Path::new(&project_path).join(".agent-jobs")
/// let dir = agent_jobs_dir(project_path);
/// ```
#[inline]
pub fn agent_jobs_dir(project_path: &Path) -> PathBuf {
    project_path.join(".agent-jobs")
}

/// Get the .agent-jobs/config.toml path for a project.
#[inline]
pub fn project_config_path(project_path: &Path) -> PathBuf {
    agent_jobs_dir(project_path).join("config.toml")
}

/// Safely acquire a mutex lock, recovering from poisoning by returning the guard.
/// This is useful when you want to continue even if a previous thread panicked.
/// The mutex state may be inconsistent, so use with caution.
pub fn lock_mutex_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            log::warn!("Mutex was poisoned, recovering: {}", poisoned);
            poisoned.into_inner()
        }
    }
}

/// Truncate a string to approximately max_bytes, ensuring we don't cut in the middle of a UTF-8 character
pub fn truncate_string(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Truncate with a trailing ellipsis when anything was cut.
pub fn ellipsize(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        s.to_string()
    } else {
        format!("{}...", truncate_string(s, max_bytes))
    }
}

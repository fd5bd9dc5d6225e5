//! Cache mount detection (`spec.md` §4.6 phase 5): "mount or symlink a
//! deterministic set of cache directories keyed by detected project
//! files... host-durable across jobs on the same executor."

use cinch_core::runtime::BindMount;
use std::path::Path;

struct CacheRule {
    marker_file: &'static str,
    cache_name: &'static str,
    container_path: &'static str,
}

const RULES: &[CacheRule] = &[
    CacheRule { marker_file: "Cargo.toml", cache_name: "cargo", container_path: "/root/.cargo/registry" },
    CacheRule { marker_file: "go.mod", cache_name: "go-mod", container_path: "/go/pkg/mod" },
    CacheRule { marker_file: "package.json", cache_name: "npm", container_path: "/root/.npm" },
    CacheRule { marker_file: "pyproject.toml", cache_name: "pip", container_path: "/root/.cache/pip" },
    CacheRule { marker_file: "Gemfile", cache_name: "bundle", container_path: "/usr/local/bundle" },
];

/// Scans the checked-out worktree for known project marker files and
/// returns the bind mounts for the caches they enable, creating the
/// host-side cache directory on demand so the first job for a given
/// ecosystem doesn't fail with a missing-source-path error.
pub fn detect_caches(worktree: &Path, cache_root: &Path) -> std::io::Result<Vec<BindMount>> {
    let mut binds = Vec::new();
    for rule in RULES {
        if worktree.join(rule.marker_file).is_file() {
            let host_path = cache_root.join(rule.cache_name);
            std::fs::create_dir_all(&host_path)?;
            binds.push(BindMount {
                host_path: host_path.display().to_string(),
                container_path: rule.container_path.to_string(),
                read_only: false,
            });
        }
    }
    Ok(binds)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_cargo_project() {
        let dir = std::env::temp_dir().join(format!("cinch-cache-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("Cargo.toml"), "[package]").unwrap();

        let cache_root = dir.join("caches");
        let binds = detect_caches(&dir, &cache_root).unwrap();
        assert_eq!(binds.len(), 1);
        assert_eq!(binds[0].container_path, "/root/.cargo/registry");

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn no_markers_no_caches() {
        let dir = std::env::temp_dir().join(format!("cinch-cache-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let binds = detect_caches(&dir, &dir.join("caches")).unwrap();
        assert!(binds.is_empty());
        std::fs::remove_dir_all(&dir).ok();
    }
}

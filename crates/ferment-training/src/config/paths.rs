use super::JobConfig;
use std::path::{Component, Path, PathBuf};

/// Rewrite every relative path in `config` against `root`.
///
/// Resolution is purely lexical (no filesystem access) and idempotent: resolving an
/// already resolved config returns it unchanged. A missing `export.save_path`
/// becomes `<output_dir>/final`.
pub fn resolve_paths(config: &JobConfig, root: &Path) -> JobConfig {
    let root = absolute_root(root);
    let mut resolved = config.clone();

    if is_local_model_ref(&resolved.model.name) {
        resolved.model.name = absolutize(Path::new(&resolved.model.name), &root).display().to_string();
    }

    resolved.dataset.path = absolutize_non_empty(&resolved.dataset.path, &root);
    resolved.training.output_dir = absolutize_non_empty(&resolved.training.output_dir, &root);

    resolved.export.save_path = match &resolved.export.save_path {
        Some(path) => Some(absolutize(path, &root)),
        None if !resolved.training.output_dir.as_os_str().is_empty() => {
            Some(resolved.training.output_dir.join("final"))
        }
        None => None,
    };

    for path in resolved.export.paths.values_mut() {
        *path = absolutize(path, &root);
    }

    resolved
}

/// A model name refers to a local checkpoint when it is written as a path.
pub(crate) fn is_local_model_ref(name: &str) -> bool {
    name.starts_with("./")
        || name.starts_with("../")
        || name == "."
        || name == "~"
        || name.starts_with("~/")
        || Path::new(name).is_absolute()
}

fn absolute_root(root: &Path) -> PathBuf {
    if root.is_absolute() {
        return normalize(root);
    }
    match std::env::current_dir() {
        Ok(cwd) => normalize(&cwd.join(root)),
        Err(_) => normalize(root),
    }
}

fn absolutize_non_empty(path: &Path, root: &Path) -> PathBuf {
    if path.as_os_str().is_empty() {
        return PathBuf::new();
    }
    absolutize(path, root)
}

fn absolutize(path: &Path, root: &Path) -> PathBuf {
    let path = &expand_home(path);
    if path.is_absolute() {
        normalize(path)
    } else {
        normalize(&root.join(path))
    }
}

/// `~` and `~/...` expand against `$HOME`; anything else is returned as is.
fn expand_home(path: &Path) -> PathBuf {
    match (path.strip_prefix("~"), std::env::var_os("HOME")) {
        (Ok(rest), Some(home)) => PathBuf::from(home).join(rest),
        _ => path.to_path_buf(),
    }
}

/// Remove `.` components and fold `..` into their parent.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push(component);
                }
            }
            other => out.push(other),
        }
    }
    out
}

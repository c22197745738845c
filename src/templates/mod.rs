//! Embedded fallback template.

/// Home-directory tree used when no template directory is configured.
pub(crate) const DEFAULT_HOME_TREE: &str = include_str!("default_home.tree");

//! Paths that are never listed or transferred.

use std::path::Path;

use tracing::{debug, warn};

/// Ignore files consulted in order; the first non-empty one wins.
pub const IGNORE_FILES: [&str; 2] = [".fshignore", ".gitignore"];

/// Decides whether a path relative to the shared folder is hidden.
pub trait IgnoreFilter: Send + Sync {
    fn should_ignore(&self, relative_path: &str, is_dir: bool) -> bool;
}

/// Returns `true` for the ignore files themselves, which are never served.
pub fn is_ignore_file(relative_path: &str) -> bool {
    let base = relative_path
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(relative_path);
    IGNORE_FILES.contains(&base)
}

#[derive(Debug, Clone)]
struct Pattern {
    glob: String,
    negated: bool,
    dir_only: bool,
}

/// Gitignore-style pattern list.
///
/// Later patterns override earlier ones and `!` re-includes. A pattern
/// matches the full relative path, the file name, or any leading directory.
#[derive(Debug, Clone, Default)]
pub struct IgnoreList {
    patterns: Vec<Pattern>,
}

impl IgnoreList {
    pub fn parse(text: &str) -> Self {
        let patterns = text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .map(|l| {
                let (negated, rest) = match l.strip_prefix('!') {
                    Some(rest) => (true, rest),
                    None => (false, l),
                };
                let dir_only = rest.ends_with('/');
                let glob = rest.trim_matches('/').replace('\\', "/");
                Pattern {
                    glob,
                    negated,
                    dir_only,
                }
            })
            .filter(|p| !p.glob.is_empty())
            .collect();
        Self { patterns }
    }

    /// Loads `.fshignore`, falling back to `.gitignore`, from `root`.
    pub fn load(root: &Path) -> Self {
        for name in IGNORE_FILES {
            let path = root.join(name);
            match std::fs::read_to_string(&path) {
                Ok(text) => {
                    let list = Self::parse(&text);
                    if !list.is_empty() {
                        debug!(file = %path.display(), patterns = list.len(), "loaded ignore list");
                        return list;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(file = %path.display(), "cannot read ignore file: {e}"),
            }
        }
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

impl IgnoreFilter for IgnoreList {
    fn should_ignore(&self, relative_path: &str, is_dir: bool) -> bool {
        if is_ignore_file(relative_path) {
            return true;
        }

        let path = relative_path
            .replace('\\', "/")
            .trim_start_matches("./")
            .trim_matches('/')
            .to_string();
        let components: Vec<&str> = path.split('/').collect();
        let (base, parents) = match components.split_last() {
            Some((base, parents)) => (*base, parents),
            None => return false,
        };

        let mut ignored = false;
        for pattern in &self.patterns {
            let whole = (is_dir || !pattern.dir_only)
                && (wildcard_match(&pattern.glob, &path) || wildcard_match(&pattern.glob, base));
            let parent = parents
                .iter()
                .any(|dir| wildcard_match(&pattern.glob, dir));
            if whole || parent {
                ignored = !pattern.negated;
            }
        }
        ignored
    }
}

/// Shell-style match: `*` spans any run and `?` one character, neither
/// crossing `/`.
pub fn wildcard_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while ti < t.len() {
        if pi < p.len() && ((p[pi] == '?' && t[ti] != '/') || (p[pi] != '*' && p[pi] == t[ti])) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some((pi, ti));
            pi += 1;
        } else if let Some((sp, st)) = star {
            if t[st] == '/' {
                return false;
            }
            pi = sp + 1;
            ti = st + 1;
            star = Some((sp, st + 1));
        } else {
            return false;
        }
    }

    p[pi..].iter().all(|&c| c == '*')
}

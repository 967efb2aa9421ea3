//! Repo context for the planner and import-graph expansion of target files.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use anyhow::Result;

use crate::github::GithubClient;

/// A fetched file, path plus contents.
#[derive(Debug, Clone)]
pub struct FetchedFile {
    pub path: String,
    pub content: String,
}

/// Extensions considered source files for context and import scanning.
const SOURCE_EXTENSIONS: &[&str] = &["ts", "tsx", "js", "jsx", "mjs", "cjs"];

/// Files worth showing the planner when the issue names no targets.
const ANCHOR_FILES: &[&str] = &["README.md", "package.json", "tsconfig.json"];

fn is_source_file(path: &str) -> bool {
    if path.contains("node_modules/") || path.contains(".min.") {
        return false;
    }
    path.rsplit_once('.')
        .map(|(_, ext)| SOURCE_EXTENSIONS.contains(&ext))
        .unwrap_or(false)
}

/// Heuristic default targets for a first planning pass: repo anchors plus
/// entry-point-looking source files, capped.
pub fn default_targets(all_files: &[String], cap: usize) -> Vec<String> {
    let mut targets: Vec<String> = all_files
        .iter()
        .filter(|p| ANCHOR_FILES.contains(&p.as_str()))
        .cloned()
        .collect();

    let mut entries: Vec<&String> = all_files
        .iter()
        .filter(|p| is_source_file(p))
        .filter(|p| {
            let name = p.rsplit('/').next().unwrap_or(p);
            name.starts_with("index.") || name.starts_with("main.") || name.starts_with("app.")
        })
        .collect();
    entries.sort_by_key(|p| p.matches('/').count());

    for path in entries {
        if targets.len() >= cap {
            break;
        }
        targets.push(path.clone());
    }
    targets
}

/// Fetch the contents of `paths` at the branch head. Missing paths are
/// skipped (the coder may be creating them).
pub async fn fetch_files(
    github: &Arc<dyn GithubClient>,
    repo: &str,
    branch: &str,
    paths: &[String],
) -> Result<Vec<FetchedFile>> {
    let mut files = Vec::with_capacity(paths.len());
    for path in paths {
        if let Some(content) = github.get_file(repo, branch, path).await? {
            files.push(FetchedFile {
                path: path.clone(),
                content,
            });
        } else {
            tracing::debug!(repo, path, "target file absent at branch head");
        }
    }
    Ok(files)
}

/// Render fetched files as a planner/coder prompt section.
pub fn render_context(files: &[FetchedFile], max_chars_per_file: usize) -> String {
    let mut out = String::new();
    for file in files {
        let content = if file.content.len() > max_chars_per_file {
            let mut end = max_chars_per_file;
            while !file.content.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}\n... (truncated)", &file.content[..end])
        } else {
            file.content.clone()
        };
        out.push_str(&format!("=== {} ===\n{content}\n\n", file.path));
    }
    out
}

// ---------------------------------------------------------------------------
// Import graph
// ---------------------------------------------------------------------------

/// Pull module specifiers out of one source file's import/require lines.
fn extract_specifiers(content: &str) -> Vec<String> {
    let mut specs = Vec::new();
    for line in content.lines() {
        let trimmed = line.trim_start();
        let after = if trimmed.starts_with("import ") || trimmed.starts_with("export ") {
            trimmed.split_once(" from ").map(|(_, rest)| rest)
        } else if let Some(pos) = trimmed.find("require(") {
            Some(&trimmed[pos + "require(".len()..])
        } else if trimmed.starts_with("import(") {
            Some(&trimmed["import(".len()..])
        } else {
            None
        };

        let Some(after) = after else { continue };
        let after = after.trim_start();
        let Some(quote) = after.chars().next().filter(|c| *c == '\'' || *c == '"') else {
            continue;
        };
        if let Some(end) = after[1..].find(quote) {
            specs.push(after[1..=end].to_owned());
        }
    }
    specs
}

/// Resolve a relative import specifier against the importing file's
/// directory and the known file list.
fn resolve_specifier(from: &str, spec: &str, known: &HashSet<&str>) -> Option<String> {
    if !spec.starts_with('.') {
        // Bare specifier: a package, not a repo file.
        return None;
    }

    let dir = from.rsplit_once('/').map(|(d, _)| d).unwrap_or("");
    let mut segments: Vec<&str> = if dir.is_empty() {
        Vec::new()
    } else {
        dir.split('/').collect()
    };
    for part in spec.split('/') {
        match part {
            "." => {}
            ".." => {
                segments.pop()?;
            }
            other => segments.push(other),
        }
    }
    let base = segments.join("/");

    let candidates = [
        base.clone(),
        format!("{base}.ts"),
        format!("{base}.tsx"),
        format!("{base}.js"),
        format!("{base}.jsx"),
        format!("{base}/index.ts"),
        format!("{base}/index.js"),
    ];
    candidates
        .into_iter()
        .find(|c| known.contains(c.as_str()))
}

/// Expand `targets` along the repo import graph: the union of files the
/// targets import and files that import the targets, within `depth` hops,
/// adding at most `max_related` new files.
///
/// Builds the graph from a bounded scan of the repo's source files.
pub async fn expand_imports(
    github: &Arc<dyn GithubClient>,
    repo: &str,
    branch: &str,
    all_files: &[String],
    targets: &[String],
    depth: usize,
    max_related: usize,
) -> Result<Vec<String>> {
    const SCAN_CAP: usize = 200;

    let source_files: Vec<&String> = all_files.iter().filter(|p| is_source_file(p)).collect();
    if source_files.len() > SCAN_CAP {
        tracing::warn!(
            repo,
            total = source_files.len(),
            cap = SCAN_CAP,
            "import scan capped; related-file expansion may be incomplete"
        );
    }

    let known: HashSet<&str> = all_files.iter().map(String::as_str).collect();

    // path -> files it imports
    let mut imports: HashMap<String, Vec<String>> = HashMap::new();
    // path -> files that import it
    let mut importers: HashMap<String, Vec<String>> = HashMap::new();

    for path in source_files.iter().take(SCAN_CAP) {
        let Some(content) = github.get_file(repo, branch, path).await? else {
            continue;
        };
        for spec in extract_specifiers(&content) {
            if let Some(resolved) = resolve_specifier(path, &spec, &known) {
                imports
                    .entry((*path).clone())
                    .or_default()
                    .push(resolved.clone());
                importers.entry(resolved).or_default().push((*path).clone());
            }
        }
    }

    // BFS over the undirected neighborhood of the targets.
    let target_set: HashSet<&str> = targets.iter().map(String::as_str).collect();
    let mut related: Vec<String> = Vec::new();
    let mut seen: HashSet<String> = targets.iter().cloned().collect();
    let mut frontier: VecDeque<(String, usize)> =
        targets.iter().map(|t| (t.clone(), 0)).collect();

    while let Some((path, dist)) = frontier.pop_front() {
        if dist >= depth || related.len() >= max_related {
            continue;
        }
        let empty = Vec::new();
        let neighbors = imports
            .get(&path)
            .unwrap_or(&empty)
            .iter()
            .chain(importers.get(&path).unwrap_or(&empty).iter());
        for neighbor in neighbors {
            if related.len() >= max_related {
                break;
            }
            if seen.insert(neighbor.clone()) {
                if !target_set.contains(neighbor.as_str()) {
                    related.push(neighbor.clone());
                }
                frontier.push_back((neighbor.clone(), dist + 1));
            }
        }
    }

    Ok(related)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_file_detection() {
        assert!(is_source_file("src/app.ts"));
        assert!(is_source_file("lib/util.js"));
        assert!(!is_source_file("README.md"));
        assert!(!is_source_file("node_modules/x/index.js"));
        assert!(!is_source_file("dist/app.min.js"));
    }

    #[test]
    fn default_targets_prefer_anchors_and_entries() {
        let files: Vec<String> = [
            "README.md",
            "package.json",
            "src/index.ts",
            "src/deep/nested/helper.ts",
            "src/app.ts",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        let targets = default_targets(&files, 4);
        assert!(targets.contains(&"README.md".to_string()));
        assert!(targets.contains(&"package.json".to_string()));
        assert!(targets.contains(&"src/index.ts".to_string()));
        assert!(!targets.contains(&"src/deep/nested/helper.ts".to_string()));
    }

    #[test]
    fn extracts_import_specifiers() {
        let content = r#"
import { a } from './a';
import b from "../lib/b";
export { c } from './c';
const d = require('./d');
import 'side-effect';
import { pkg } from 'some-package';
"#;
        let specs = extract_specifiers(content);
        assert!(specs.contains(&"./a".to_string()));
        assert!(specs.contains(&"../lib/b".to_string()));
        assert!(specs.contains(&"./c".to_string()));
        assert!(specs.contains(&"./d".to_string()));
        assert!(specs.contains(&"some-package".to_string()));
    }

    #[test]
    fn resolves_relative_specifiers() {
        let known: HashSet<&str> = ["src/a.ts", "src/lib/b.ts", "src/c/index.ts"]
            .into_iter()
            .collect();

        assert_eq!(
            resolve_specifier("src/main.ts", "./a", &known),
            Some("src/a.ts".to_string())
        );
        assert_eq!(
            resolve_specifier("src/x/y.ts", "../lib/b", &known),
            Some("src/lib/b.ts".to_string())
        );
        assert_eq!(
            resolve_specifier("src/main.ts", "./c", &known),
            Some("src/c/index.ts".to_string())
        );
        assert_eq!(resolve_specifier("src/main.ts", "lodash", &known), None);
        assert_eq!(resolve_specifier("src/main.ts", "./missing", &known), None);
    }

    #[test]
    fn render_context_truncates_large_files() {
        let files = vec![FetchedFile {
            path: "big.ts".into(),
            content: "x".repeat(100),
        }];
        let rendered = render_context(&files, 10);
        assert!(rendered.contains("=== big.ts ==="));
        assert!(rendered.contains("truncated"));
    }
}

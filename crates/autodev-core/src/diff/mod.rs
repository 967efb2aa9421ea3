//! Unified diff validation.
//!
//! Two tiers: [`quick_validate`] runs structural checks on the diff text
//! alone; [`full`] additionally applies the diff in a scoped clone and runs
//! the project's typecheck.

pub mod full;

/// Result of a validation pass.
#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn valid(&self) -> bool {
        self.errors.is_empty()
    }

    fn error(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
    }

    fn warn(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }

    /// Errors joined for `last_error` storage.
    pub fn error_text(&self) -> String {
        self.errors.join("; ")
    }
}

/// Size statistics used by the consensus scorer and the diff line cap.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiffStats {
    pub files: usize,
    pub additions: usize,
    pub deletions: usize,
    pub total_lines: usize,
}

/// Count files and add/del lines in a unified diff.
pub fn diff_stats(diff: &str) -> DiffStats {
    let mut stats = DiffStats::default();
    for line in diff.lines() {
        stats.total_lines += 1;
        if line.starts_with("+++ ") {
            stats.files += 1;
        } else if line.starts_with('+') && !line.starts_with("+++") {
            stats.additions += 1;
        } else if line.starts_with('-') && !line.starts_with("---") {
            stats.deletions += 1;
        }
    }
    stats
}

/// Parsed `@@ -l,c +l,c @@` counts.
#[derive(Debug, Clone, Copy)]
struct HunkHeader {
    old_count: usize,
    new_count: usize,
}

fn parse_hunk_header(line: &str) -> Option<HunkHeader> {
    // @@ -12,3 +14,4 @@ optional section heading
    let rest = line.strip_prefix("@@ -")?;
    let (ranges, _) = rest.split_once(" @@")?;
    let (old_range, new_range) = ranges.split_once(" +")?;

    fn parse_range(range: &str) -> Option<usize> {
        match range.split_once(',') {
            Some((start, count)) => {
                start.parse::<usize>().ok()?;
                count.parse::<usize>().ok()
            }
            // Count omitted means a single line.
            None => {
                range.parse::<usize>().ok()?;
                Some(1)
            }
        }
    }

    Some(HunkHeader {
        old_count: parse_range(old_range)?,
        new_count: parse_range(new_range)?,
    })
}

/// Structural validation of a unified diff.
///
/// Fatal errors: corrupted diff markers (`++ b/` / `-- a/` / hunk headers
/// leaking into added lines), merge conflict markers in content, hunk header
/// counts that disagree with the observed lines, and text with no diff
/// structure at all. Suspicious-but-survivable patterns are reported as
/// warnings.
pub fn quick_validate(diff: &str) -> ValidationReport {
    let mut report = ValidationReport::default();

    if diff.trim().is_empty() {
        report.error("diff is empty");
        return report;
    }

    let mut saw_file_header = false;
    let mut saw_hunk = false;

    // Per-hunk accounting.
    let mut current: Option<HunkHeader> = None;
    let mut current_line_no = 0usize;
    let mut old_seen = 0usize;
    let mut new_seen = 0usize;

    let close_hunk = |report: &mut ValidationReport,
                          header: &Option<HunkHeader>,
                          header_line: usize,
                          old_seen: usize,
                          new_seen: usize| {
        if let Some(h) = header {
            if h.old_count != old_seen || h.new_count != new_seen {
                report.error(format!(
                    "hunk header at line {header_line} declares -{},+{} but the hunk \
                     contains -{old_seen},+{new_seen}",
                    h.old_count, h.new_count
                ));
            }
        }
    };

    for (idx, line) in diff.lines().enumerate() {
        let line_no = idx + 1;

        if line.starts_with("diff --git") || line.starts_with("index ") {
            continue;
        }

        if line.starts_with("Binary files ") {
            report.warn(format!("binary file content at line {line_no}"));
            continue;
        }

        // A file header is only a file header between hunks. Inside an
        // unfinished hunk, "+++ b/..." is an added line whose content is the
        // stray marker "++ b/..." -- the classic corruption case.
        let hunk_unfinished = current
            .map(|h| old_seen < h.old_count || new_seen < h.new_count)
            .unwrap_or(false);

        if !hunk_unfinished && (line.starts_with("--- ") || line.starts_with("+++ ")) {
            if line.starts_with("--- ") {
                close_hunk(&mut report, &current, current_line_no, old_seen, new_seen);
                current = None;
            }
            saw_file_header = true;
            continue;
        }

        if line.starts_with("@@") {
            close_hunk(&mut report, &current, current_line_no, old_seen, new_seen);
            match parse_hunk_header(line) {
                Some(header) => {
                    current = Some(header);
                    current_line_no = line_no;
                    old_seen = 0;
                    new_seen = 0;
                    saw_hunk = true;
                }
                None => {
                    report.error(format!("unparseable hunk header at line {line_no}: {line:?}"));
                    current = None;
                }
            }
            continue;
        }

        let Some(_) = current else {
            // Content outside any hunk: tolerated for prologue text before
            // the first file header, suspicious afterwards.
            if saw_hunk && !line.trim().is_empty() {
                report.warn(format!("content outside any hunk at line {line_no}"));
            }
            continue;
        };

        // Inside a hunk.
        match line.as_bytes().first() {
            Some(b'+') => {
                new_seen += 1;
                let content = &line[1..];
                if content.starts_with("++ b/") || content.starts_with("++ a/") {
                    report.error(format!(
                        "corrupted diff marker inside added line {line_no}: {line:?}"
                    ));
                }
                if content.starts_with("@@ -") && content.contains(" @@") {
                    report.error(format!(
                        "hunk header inside added line {line_no}: {line:?}"
                    ));
                }
                check_conflict_marker(&mut report, content, line_no);
            }
            Some(b'-') => {
                old_seen += 1;
                let content = &line[1..];
                if content.starts_with("-- a/") || content.starts_with("-- b/") {
                    report.error(format!(
                        "corrupted diff marker inside removed line {line_no}: {line:?}"
                    ));
                }
            }
            Some(b' ') => {
                old_seen += 1;
                new_seen += 1;
                check_conflict_marker(&mut report, &line[1..], line_no);
            }
            Some(b'\\') => {
                // "\ No newline at end of file" -- counts toward neither side.
            }
            None => {
                // Some generators emit empty lines for empty context lines.
                old_seen += 1;
                new_seen += 1;
                report.warn(format!(
                    "bare empty line inside hunk at line {line_no} (expected a leading space)"
                ));
            }
            _ => {
                report.error(format!(
                    "unexpected line prefix inside hunk at line {line_no}: {line:?}"
                ));
            }
        }
    }

    close_hunk(&mut report, &current, current_line_no, old_seen, new_seen);

    if !saw_file_header || !saw_hunk {
        report.error("no unified diff structure found (missing file headers or hunks)");
    }

    report
}

fn check_conflict_marker(report: &mut ValidationReport, content: &str, line_no: usize) {
    if content.starts_with("<<<<<<<")
        || content.starts_with(">>>>>>>")
        || content == "======="
    {
        report.error(format!(
            "merge conflict marker in content at line {line_no}: {content:?}"
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GOOD_DIFF: &str = "\
--- a/src/app.ts
+++ b/src/app.ts
@@ -1,2 +1,3 @@
 import { x } from './x';
+import { y } from './y';
 export const app = x;
";

    #[test]
    fn well_formed_diff_passes() {
        let report = quick_validate(GOOD_DIFF);
        assert!(report.valid(), "errors: {:?}", report.errors);
        assert!(report.warnings.is_empty(), "warnings: {:?}", report.warnings);
    }

    #[test]
    fn empty_diff_is_rejected() {
        assert!(!quick_validate("").valid());
        assert!(!quick_validate("   \n  ").valid());
    }

    #[test]
    fn prose_is_rejected() {
        let report = quick_validate("I changed the file as requested.");
        assert!(!report.valid());
    }

    #[test]
    fn corrupted_add_marker_is_rejected() {
        let diff = "\
--- a/f
+++ b/f
@@ -1,1 +1,2 @@
 keep
+++ b/f
";
        let report = quick_validate(diff);
        assert!(
            !report.valid(),
            "literal '++ b/' in added content must be fatal"
        );
    }

    #[test]
    fn corrupted_remove_marker_is_rejected() {
        let diff = "\
--- a/f
+++ b/f
@@ -1,2 +1,1 @@
 keep
--- a/f
";
        // "--- a/f" inside the hunk starts a new file section with a
        // dangling hunk; the count mismatch catches it.
        let report = quick_validate(diff);
        assert!(!report.valid());
    }

    #[test]
    fn hunk_header_inside_added_line_is_rejected() {
        let diff = "\
--- a/f
+++ b/f
@@ -1,1 +1,2 @@
 keep
+@@ -4,2 +4,3 @@
";
        let report = quick_validate(diff);
        assert!(!report.valid());
    }

    #[test]
    fn conflict_markers_are_rejected() {
        let diff = "\
--- a/f
+++ b/f
@@ -1,1 +1,4 @@
 keep
+<<<<<<< HEAD
+theirs
+>>>>>>> branch
";
        let report = quick_validate(diff);
        assert!(!report.valid());
        assert!(report.errors.iter().any(|e| e.contains("conflict")));
    }

    #[test]
    fn hunk_count_mismatch_is_rejected() {
        let diff = "\
--- a/f
+++ b/f
@@ -1,2 +1,3 @@
 keep
+added
";
        // Header claims 2 old lines but only 1 appears.
        let report = quick_validate(diff);
        assert!(!report.valid());
        assert!(report.errors.iter().any(|e| e.contains("hunk header")));
    }

    #[test]
    fn omitted_count_defaults_to_one() {
        let diff = "\
--- a/f
+++ b/f
@@ -1 +1,2 @@
 keep
+added
";
        let report = quick_validate(diff);
        assert!(report.valid(), "errors: {:?}", report.errors);
    }

    #[test]
    fn no_newline_marker_is_tolerated() {
        let diff = "\
--- a/f
+++ b/f
@@ -1,1 +1,1 @@
-old
+new
\\ No newline at end of file
";
        let report = quick_validate(diff);
        assert!(report.valid(), "errors: {:?}", report.errors);
    }

    #[test]
    fn binary_content_warns_but_passes_structure() {
        let diff = "\
--- a/img.png
+++ b/img.png
Binary files differ
--- a/f
+++ b/f
@@ -1,1 +1,1 @@
-old
+new
";
        let report = quick_validate(diff);
        assert!(report.valid(), "errors: {:?}", report.errors);
        assert!(!report.warnings.is_empty());
    }

    #[test]
    fn stats_count_files_and_lines() {
        let stats = diff_stats(GOOD_DIFF);
        assert_eq!(stats.files, 1);
        assert_eq!(stats.additions, 1);
        assert_eq!(stats.deletions, 0);
        assert_eq!(stats.total_lines, 6);
    }

    #[test]
    fn multi_file_diff_passes() {
        let diff = "\
--- a/f
+++ b/f
@@ -1,1 +1,2 @@
 keep
+added
--- a/g
+++ b/g
@@ -5,2 +5,1 @@
 keep
-dropped
";
        let report = quick_validate(diff);
        assert!(report.valid(), "errors: {:?}", report.errors);
        assert_eq!(diff_stats(diff).files, 2);
    }
}

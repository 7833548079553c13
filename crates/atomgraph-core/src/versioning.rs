use crate::{ChangeType, FileAnalysis};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;

pub fn content_hash(content: &str) -> String {
    hash_str(content)
}

/// Hash of the source with comments and blank/indentation whitespace removed,
/// so formatting-only edits hash the same.
pub fn normalized_hash(content: &str) -> String {
    hash_str(&strip_comments_c_like(content))
}

fn hash_str(s: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(s.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn strip_whitespace(s: &str) -> String {
    s.lines()
        .map(|l| l.trim())
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

fn strip_comments_c_like(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut it = s.chars().peekable();
    let mut in_block = false;
    let mut in_str: Option<char> = None;
    let mut escaped = false;
    while let Some(c) = it.next() {
        if in_block {
            if c == '*' && it.peek() == Some(&'/') {
                in_block = false;
                it.next();
            }
            continue;
        }
        if let Some(q) = in_str {
            out.push(c);
            if c == q && !escaped {
                in_str = None;
            }
            escaped = c == '\\' && !escaped;
            continue;
        }
        match c {
            '"' | '\'' | '`' => {
                in_str = Some(c);
                out.push(c);
            }
            '/' if it.peek() == Some(&'/') => {
                for ch in it.by_ref() {
                    if ch == '\n' {
                        out.push('\n');
                        break;
                    }
                }
            }
            '/' if it.peek() == Some(&'*') => {
                in_block = true;
                it.next();
            }
            _ => out.push(c),
        }
    }
    strip_whitespace(&out)
}

/// Classifies how much changed between two analyses of the same file.
pub fn classify_change(previous: Option<&FileAnalysis>, current: &FileAnalysis) -> ChangeType {
    let Some(previous) = previous else {
        return ChangeType::Semantic;
    };
    if previous.content_hash == current.content_hash {
        return ChangeType::None;
    }
    if previous.normalized_hash == current.normalized_hash {
        return ChangeType::Cosmetic;
    }

    let old_exports: BTreeSet<&str> = previous.exports.iter().map(|e| e.name.as_str()).collect();
    let new_exports: BTreeSet<&str> = current.exports.iter().map(|e| e.name.as_str()).collect();
    if !old_exports.is_subset(&new_exports) {
        return ChangeType::Critical;
    }

    let old_atoms: BTreeSet<&str> = previous.atoms.iter().map(|a| a.name.as_str()).collect();
    let new_atoms: BTreeSet<&str> = current.atoms.iter().map(|a| a.name.as_str()).collect();
    let old_imports: BTreeSet<&str> = previous.imports.iter().map(|i| i.source.as_str()).collect();
    let new_imports: BTreeSet<&str> = current.imports.iter().map(|i| i.source.as_str()).collect();
    if old_atoms != new_atoms || old_imports != new_imports || old_exports != new_exports {
        return ChangeType::Semantic;
    }

    ChangeType::Static
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Atom, AtomKind, ExportRecord, ExtractionResult, ImportRecord};

    fn analysis(content: &str, atoms: &[&str], exports: &[&str], imports: &[&str]) -> FileAnalysis {
        let extraction = ExtractionResult {
            atoms: atoms
                .iter()
                .map(|n| Atom::new("a.js", *n, AtomKind::Function))
                .collect(),
            exports: exports.iter().map(|e| ExportRecord::named(*e)).collect(),
            imports: imports
                .iter()
                .map(|s| ImportRecord {
                    source: s.to_string(),
                    specifiers: vec![],
                })
                .collect(),
            ..Default::default()
        };
        FileAnalysis::from_extraction("a.js", content, extraction)
    }

    #[test]
    fn comment_only_edit_is_cosmetic() {
        let a = analysis("function f() {\n  return 1;\n}\n", &["f"], &[], &[]);
        let b = analysis(
            "// explain f\nfunction f() {\n    return 1; /* one */\n}\n\n",
            &["f"],
            &[],
            &[],
        );
        assert_eq!(classify_change(Some(&a), &b), ChangeType::Cosmetic);
    }

    #[test]
    fn comment_markers_inside_strings_are_kept() {
        assert_ne!(
            normalized_hash("let u = \"a//b\";"),
            normalized_hash("let u = \"a")
        );
    }

    #[test]
    fn identical_content_is_none() {
        let a = analysis("x", &["f"], &[], &[]);
        let b = analysis("x", &["f"], &[], &[]);
        assert_eq!(classify_change(Some(&a), &b), ChangeType::None);
    }

    #[test]
    fn removed_export_is_critical() {
        let a = analysis("v1", &["f", "g"], &["f", "g"], &[]);
        let b = analysis("v2", &["f"], &["f"], &[]);
        assert_eq!(classify_change(Some(&a), &b), ChangeType::Critical);
    }

    #[test]
    fn new_atom_is_semantic_and_body_edit_is_static() {
        let a = analysis("v1", &["f"], &["f"], &["b.js"]);
        let b = analysis("v2", &["f", "h"], &["f"], &["b.js"]);
        assert_eq!(classify_change(Some(&a), &b), ChangeType::Semantic);
        let c = analysis("v3", &["f"], &["f"], &["b.js"]);
        assert_eq!(classify_change(Some(&a), &c), ChangeType::Static);
    }

    #[test]
    fn first_sight_is_semantic() {
        let a = analysis("v1", &["f"], &[], &[]);
        assert_eq!(classify_change(None, &a), ChangeType::Semantic);
    }
}

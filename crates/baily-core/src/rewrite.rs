//! Import analysis for served modules.
//!
//! Scans transformed JavaScript for static `import` / `export ... from` /
//! side-effect / dynamic `import()` specifiers and rewrites each through a
//! caller-supplied resolver, collecting the final request URLs as the
//! module's dependency list. Also detects the HMR runtime calls
//! (`import.meta.hot.accept` and friends) that populate the module graph.
//!
//! Detection is line-scanning, not AST-based. A false positive inside a
//! comment or string means the server attempts HMR where it would have
//! reloaded; the client falls back to a reload anyway.

use std::collections::HashSet;

/// Where a specifier appeared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportKind {
    /// `import x from '...'` or `import '...'`
    Static,
    /// `export ... from '...'`
    Reexport,
    /// `import('...')`
    Dynamic,
}

/// One specifier found by [`scan_imports`].
#[derive(Debug, Clone, PartialEq)]
pub struct ScannedImport {
    pub specifier: String,
    pub kind: ImportKind,
}

/// How the resolver wants one specifier handled.
#[derive(Debug, Clone, PartialEq)]
pub enum Rewrite {
    /// Replace the specifier with this URL.
    Url(String),
    /// Pre-bundled CommonJS: route the import through a default-export
    /// interop binding.
    Interop { url: String },
    /// Leave the statement untouched (externals, virtual ids).
    Keep,
}

/// HMR registrations detected in a module.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HotAccepts {
    pub is_self_accepting: bool,
    /// Raw specifiers passed to `accept('...')` / `accept([...])`.
    pub accepted_deps: Vec<String>,
    /// Export names passed to `acceptExports`, `None` when absent.
    pub accepted_exports: Option<Vec<String>>,
}

/// Result of one [`rewrite_module`] pass.
#[derive(Debug, Clone)]
pub struct RewrittenModule {
    pub code: String,
    /// Final request URLs of every rewritten, non-external import.
    pub deps: Vec<String>,
    pub hot: HotAccepts,
}

/// Whether a specifier is bare (a node_modules package).
#[must_use]
pub fn is_bare_specifier(specifier: &str) -> bool {
    !specifier.starts_with('.')
        && !specifier.starts_with('/')
        && !specifier.starts_with('\0')
        && !specifier.starts_with("node:")
        && !specifier.starts_with("data:")
        && !specifier.starts_with("http:")
        && !specifier.starts_with("https:")
}

/// Package name of a bare specifier (`react/jsx-runtime` → `react`,
/// scoped packages keep both segments).
#[must_use]
pub fn package_name_of(specifier: &str) -> String {
    if specifier.starts_with('@') {
        let mut parts = specifier.splitn(3, '/');
        match (parts.next(), parts.next()) {
            (Some(scope), Some(name)) => format!("{scope}/{name}"),
            _ => specifier.to_string(),
        }
    } else {
        specifier
            .split('/')
            .next()
            .unwrap_or(specifier)
            .to_string()
    }
}

/// Collect every import specifier in source order, deduplicated.
#[must_use]
pub fn scan_imports(code: &str) -> Vec<ScannedImport> {
    let mut found = Vec::new();
    let mut seen = HashSet::new();

    for line in code.lines() {
        let trimmed = line.trim();
        if is_comment_line(trimmed) {
            continue;
        }

        if is_import_line(trimmed) || is_reexport_line(trimmed) {
            let kind = if trimmed.starts_with("export") {
                ImportKind::Reexport
            } else {
                ImportKind::Static
            };
            if let Some((_, specifier, _, _)) = split_from_clause(line) {
                if seen.insert(specifier.clone()) {
                    found.push(ScannedImport { specifier, kind });
                }
            } else if let Some((_, specifier, _, _)) = split_bare_import(line) {
                if seen.insert(specifier.clone()) {
                    found.push(ScannedImport {
                        specifier,
                        kind: ImportKind::Static,
                    });
                }
            }
        }

        let mut remaining = trimmed;
        while let Some(idx) = remaining.find("import(") {
            let after = &remaining[idx + 7..];
            if let Some((specifier, _, rest)) = leading_string_literal(after) {
                if seen.insert(specifier.to_string()) {
                    found.push(ScannedImport {
                        specifier: specifier.to_string(),
                        kind: ImportKind::Dynamic,
                    });
                }
                remaining = rest;
            } else {
                remaining = after;
            }
        }
    }

    found
}

/// Rewrite every import through `resolve`, returning the new code, the
/// dependency URL list, and the module's HMR registrations.
pub fn rewrite_module(
    code: &str,
    mut resolve: impl FnMut(&str, ImportKind) -> Rewrite,
) -> RewrittenModule {
    let mut out = String::with_capacity(code.len());
    let mut deps = Vec::new();
    let mut dep_seen = HashSet::new();
    let mut interop_count = 0usize;

    for line in code.lines() {
        let trimmed = line.trim();

        if !is_comment_line(trimmed) && (is_import_line(trimmed) || is_reexport_line(trimmed)) {
            let kind = if trimmed.starts_with("export") {
                ImportKind::Reexport
            } else {
                ImportKind::Static
            };
            if let Some((before, specifier, after, quote)) = split_from_clause(line) {
                match resolve(&specifier, kind) {
                    Rewrite::Url(url) => {
                        if dep_seen.insert(url.clone()) {
                            deps.push(url.clone());
                        }
                        out.push_str(&format!("{before}{quote}{url}{quote}{after}"));
                    }
                    Rewrite::Interop { url } => {
                        if dep_seen.insert(url.clone()) {
                            deps.push(url.clone());
                        }
                        out.push_str(&interop_statement(line, &url, interop_count));
                        interop_count += 1;
                    }
                    Rewrite::Keep => out.push_str(line),
                }
                out.push('\n');
                continue;
            } else if let Some((before, specifier, after, quote)) = split_bare_import(line) {
                match resolve(&specifier, ImportKind::Static) {
                    Rewrite::Url(url) | Rewrite::Interop { url } => {
                        if dep_seen.insert(url.clone()) {
                            deps.push(url.clone());
                        }
                        out.push_str(&format!("{before}{quote}{url}{quote}{after}"));
                    }
                    Rewrite::Keep => out.push_str(line),
                }
                out.push('\n');
                continue;
            }
        }

        if !is_comment_line(trimmed) && trimmed.contains("import(") {
            out.push_str(&rewrite_dynamic_imports(
                line,
                &mut resolve,
                &mut deps,
                &mut dep_seen,
            ));
            out.push('\n');
            continue;
        }

        out.push_str(line);
        out.push('\n');
    }

    if !code.ends_with('\n') && out.ends_with('\n') {
        out.pop();
    }

    RewrittenModule {
        hot: detect_hot_accepts(code),
        code: out,
        deps,
    }
}

/// Rewrite every `import('...')` call in one line.
fn rewrite_dynamic_imports(
    line: &str,
    resolve: &mut impl FnMut(&str, ImportKind) -> Rewrite,
    deps: &mut Vec<String>,
    dep_seen: &mut HashSet<String>,
) -> String {
    let mut result = String::with_capacity(line.len());
    let mut remaining = line;

    while let Some(idx) = remaining.find("import(") {
        result.push_str(&remaining[..idx]);
        let after = &remaining[idx + 7..];
        if let Some((specifier, quote, rest)) = leading_string_literal(after) {
            match resolve(specifier, ImportKind::Dynamic) {
                Rewrite::Url(url) | Rewrite::Interop { url } => {
                    if dep_seen.insert(url.clone()) {
                        deps.push(url.clone());
                    }
                    result.push_str("import(");
                    result.push(quote);
                    result.push_str(&url);
                    result.push(quote);
                }
                Rewrite::Keep => {
                    result.push_str("import(");
                    result.push(quote);
                    result.push_str(specifier);
                    result.push(quote);
                }
            }
            remaining = rest;
        } else {
            result.push_str("import(");
            remaining = after;
        }
    }

    result.push_str(remaining);
    result
}

/// Expand a CommonJS default-interop import.
///
/// `import React, { useState } from 'react'` becomes an import of the
/// wrapped module followed by const bindings off its default export.
fn interop_statement(line: &str, url: &str, n: usize) -> String {
    let binding = format!("__baily_cjs_{n}");
    let trimmed = line.trim_start();
    let indent = &line[..line.len() - trimmed.len()];

    // Clause between `import` and ` from` (e.g. `React, { useState }`).
    let clause = trimmed
        .strip_prefix("import")
        .and_then(|rest| rest.find(" from ").map(|i| rest[..i].trim().to_string()))
        .unwrap_or_default();

    let mut stmt = format!("{indent}import {binding} from \"{url}\";");

    if clause.is_empty() {
        return stmt;
    }

    let mut rest = clause.as_str();

    // Default binding comes first when present.
    if !rest.starts_with('{') && !rest.starts_with('*') {
        let default_name = rest.split(',').next().unwrap_or(rest).trim();
        if !default_name.is_empty() {
            stmt.push_str(&format!(
                " const {default_name} = {binding}.default ?? {binding};"
            ));
        }
        rest = rest
            .find(',')
            .map(|i| rest[i + 1..].trim())
            .unwrap_or("");
    }

    // Namespace import observes the wrapped module itself.
    if let Some(ns) = rest.strip_prefix("* as ") {
        stmt.push_str(&format!(" const {} = {binding};", ns.trim()));
        return stmt;
    }

    // Named bindings destructure off the wrapped exports.
    if rest.starts_with('{') {
        let inner = rest.trim_start_matches('{').trim_end_matches('}').trim();
        if !inner.is_empty() {
            let names = inner.replace(" as ", ": ");
            stmt.push_str(&format!(" const {{ {names} }} = {binding};"));
        }
    }

    stmt
}

/// Detect `import.meta.hot` registrations.
#[must_use]
pub fn detect_hot_accepts(code: &str) -> HotAccepts {
    let mut hot = HotAccepts::default();

    for line in code.lines() {
        let trimmed = line.trim();
        if is_comment_line(trimmed) {
            continue;
        }

        for pattern in &[".hot.accept(", ".hot?.accept("] {
            let mut rest = trimmed;
            while let Some(idx) = rest.find(pattern) {
                let after = rest[idx + pattern.len()..].trim_start();
                if after.starts_with('\'') || after.starts_with('"') {
                    if let Some((dep, _, _)) = leading_string_literal(after) {
                        hot.accepted_deps.push(dep.to_string());
                    }
                } else if after.starts_with('[') {
                    hot.accepted_deps
                        .extend(string_array_literals(&after[1..]));
                } else {
                    // accept(), accept(cb), accept(mod => ...)
                    hot.is_self_accepting = true;
                }
                rest = &rest[idx + pattern.len()..];
            }
        }

        for pattern in &[".hot.acceptExports(", ".hot?.acceptExports("] {
            if let Some(idx) = trimmed.find(pattern) {
                let after = trimmed[idx + pattern.len()..].trim_start();
                let names = if after.starts_with('[') {
                    string_array_literals(&after[1..])
                } else if after.starts_with('\'') || after.starts_with('"') {
                    leading_string_literal(after)
                        .map(|(s, _, _)| vec![s.to_string()])
                        .unwrap_or_default()
                } else {
                    Vec::new()
                };
                let entry = hot.accepted_exports.get_or_insert_with(Vec::new);
                entry.extend(names);
            }
        }
    }

    hot
}

/// Collect the string literals of an array prefix: `'./a', "./b"]...`.
fn string_array_literals(mut rest: &str) -> Vec<String> {
    let mut out = Vec::new();
    loop {
        rest = rest.trim_start().trim_start_matches(',').trim_start();
        if rest.starts_with(']') || rest.is_empty() {
            return out;
        }
        match leading_string_literal(rest) {
            Some((literal, _, remainder)) => {
                out.push(literal.to_string());
                rest = remainder;
            }
            None => return out,
        }
    }
}

fn is_comment_line(trimmed: &str) -> bool {
    trimmed.starts_with("//") || trimmed.starts_with('*') || trimmed.starts_with("/*")
}

fn is_import_line(trimmed: &str) -> bool {
    trimmed.starts_with("import ")
        && (trimmed.contains(" from ") || trimmed.contains('\'') || trimmed.contains('"'))
}

fn is_reexport_line(trimmed: &str) -> bool {
    trimmed.starts_with("export ") && trimmed.contains(" from ")
}

/// The one string-scanning primitive everything above builds on: the
/// quoted literal at the start of `s` (leading whitespace ignored).
/// Yields the literal, its quote character, and whatever follows the
/// closing quote. Escapes inside specifiers are not a thing in this
/// grammar, so the first matching quote closes the literal.
fn leading_string_literal(s: &str) -> Option<(&str, char, &str)> {
    let s = s.trim_start();
    let quote = s.chars().next().filter(|c| matches!(c, '\'' | '"'))?;
    let body = &s[1..];
    let close = body.find(quote)?;
    Some((&body[..close], quote, &body[close + 1..]))
}

/// Split an import/export line around its `from '...'` literal into
/// (text before the literal, specifier, text after, quote).
fn split_from_clause(line: &str) -> Option<(String, String, String, char)> {
    let from_idx = line.find(" from ")?;
    let (specifier, quote, rest) = leading_string_literal(&line[from_idx + 6..])?;
    Some((
        format!("{} from ", &line[..from_idx]),
        specifier.to_string(),
        rest.to_string(),
        quote,
    ))
}

/// Same split for a side-effect `import '...'` line, keeping the
/// original indentation in the "before" piece.
fn split_bare_import(line: &str) -> Option<(String, String, String, char)> {
    let body = line.trim_start().strip_prefix("import ")?;
    let (specifier, quote, rest) = leading_string_literal(body)?;
    let indent = &line[..line.len() - line.trim_start().len()];
    Some((
        format!("{indent}import "),
        specifier.to_string(),
        rest.to_string(),
        quote,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_imports_all_forms() {
        let code = r#"import React from 'react';
import { useState } from "react";
import './side-effect.css';
export { helper } from './util.js';
const lazy = import('./lazy.js');
// import ignored from 'comment';
"#;
        let imports = scan_imports(code);
        let specs: Vec<&str> = imports
            .iter()
            .map(|s| s.specifier.as_str())
            .collect();
        assert_eq!(
            specs,
            vec!["react", "./side-effect.css", "./util.js", "./lazy.js"]
        );
    }

    #[test]
    fn test_bare_specifier_detection() {
        assert!(is_bare_specifier("react"));
        assert!(is_bare_specifier("@scope/pkg"));
        assert!(!is_bare_specifier("./local"));
        assert!(!is_bare_specifier("../up"));
        assert!(!is_bare_specifier("/abs"));
        assert!(!is_bare_specifier("node:path"));
        assert!(!is_bare_specifier("\0virtual:x"));
    }

    #[test]
    fn test_package_name_of() {
        assert_eq!(package_name_of("react"), "react");
        assert_eq!(package_name_of("react/jsx-runtime"), "react");
        assert_eq!(package_name_of("@scope/pkg/sub"), "@scope/pkg");
    }

    #[test]
    fn test_rewrite_static_and_dynamic() {
        let code = "import a from './a.js';\nconst b = import('./b.js');";
        let result = rewrite_module(code, |spec, _| {
            Rewrite::Url(format!("/src{}", spec.trim_start_matches('.')))
        });
        assert!(result.code.contains("from '/src/a.js'"));
        assert!(result.code.contains("import('/src/b.js')"));
        assert_eq!(result.deps, vec!["/src/a.js", "/src/b.js"]);
    }

    #[test]
    fn test_rewrite_keep_leaves_line_untouched() {
        let code = "import fs from 'node:fs';";
        let result = rewrite_module(code, |_, _| Rewrite::Keep);
        assert_eq!(result.code, code);
        assert!(result.deps.is_empty());
    }

    #[test]
    fn test_rewrite_reexport() {
        let code = "export { x } from './x.js';";
        let result = rewrite_module(code, |_, _| Rewrite::Url("/src/x.js".to_string()));
        assert_eq!(result.code, "export { x } from '/src/x.js';");
    }

    #[test]
    fn test_interop_default_import() {
        let code = "import React from 'react';";
        let result = rewrite_module(code, |_, _| Rewrite::Interop {
            url: "/@fs/cache/react.js?v=abcd1234".to_string(),
        });
        assert!(result
            .code
            .contains("import __baily_cjs_0 from \"/@fs/cache/react.js?v=abcd1234\";"));
        assert!(result
            .code
            .contains("const React = __baily_cjs_0.default ?? __baily_cjs_0;"));
    }

    #[test]
    fn test_interop_named_and_namespace() {
        let named = rewrite_module("import { useState, useEffect as ue } from 'react';", |_, _| {
            Rewrite::Interop {
                url: "/d/react.js".to_string(),
            }
        });
        assert!(named
            .code
            .contains("const { useState, useEffect: ue } = __baily_cjs_0;"));

        let ns = rewrite_module("import * as React from 'react';", |_, _| Rewrite::Interop {
            url: "/d/react.js".to_string(),
        });
        assert!(ns.code.contains("const React = __baily_cjs_0;"));
    }

    #[test]
    fn test_interop_mixed_default_and_named() {
        let result = rewrite_module("import React, { useState } from 'react';", |_, _| {
            Rewrite::Interop {
                url: "/d/react.js".to_string(),
            }
        });
        assert!(result
            .code
            .contains("const React = __baily_cjs_0.default ?? __baily_cjs_0;"));
        assert!(result.code.contains("const { useState } = __baily_cjs_0;"));
    }

    #[test]
    fn test_detect_self_accept() {
        assert!(detect_hot_accepts("import.meta.hot.accept();").is_self_accepting);
        assert!(detect_hot_accepts("import.meta.hot.accept(mod => {});").is_self_accepting);
        assert!(
            detect_hot_accepts("if (import.meta.hot) { import.meta.hot.accept(); }")
                .is_self_accepting
        );
        assert!(!detect_hot_accepts("const x = 1;").is_self_accepting);
        // Comments never register.
        assert!(!detect_hot_accepts("// import.meta.hot.accept();").is_self_accepting);
    }

    #[test]
    fn test_detect_dep_accepts() {
        let hot = detect_hot_accepts("import.meta.hot.accept('./child.js', cb);");
        assert!(!hot.is_self_accepting);
        assert_eq!(hot.accepted_deps, vec!["./child.js"]);

        let hot = detect_hot_accepts("import.meta.hot.accept(['./a.js', \"./b.js\"], cb);");
        assert_eq!(hot.accepted_deps, vec!["./a.js", "./b.js"]);
    }

    #[test]
    fn test_detect_accept_exports() {
        let hot = detect_hot_accepts("import.meta.hot.acceptExports(['render'], cb);");
        assert_eq!(hot.accepted_exports, Some(vec!["render".to_string()]));
        assert!(!hot.is_self_accepting);
    }

    #[test]
    fn test_leading_string_literal() {
        assert_eq!(
            leading_string_literal("  './a.js', cb)"),
            Some(("./a.js", '\'', ", cb)"))
        );
        assert_eq!(leading_string_literal("\"x\"rest"), Some(("x", '"', "rest")));
        assert_eq!(leading_string_literal("cb)"), None);
        assert_eq!(leading_string_literal("'unterminated"), None);
    }

    #[test]
    fn test_split_bare_import_keeps_indent() {
        let (before, specifier, after, quote) = split_bare_import("  import './side.css';").unwrap();
        assert_eq!(before, "  import ");
        assert_eq!(specifier, "./side.css");
        assert_eq!(after, ";");
        assert_eq!(quote, '\'');
    }

    #[test]
    fn test_dep_list_deduplicated() {
        let code = "import a from './a.js';\nimport { x } from './a.js';";
        let result = rewrite_module(code, |_, _| Rewrite::Url("/src/a.js".to_string()));
        assert_eq!(result.deps, vec!["/src/a.js"]);
    }
}

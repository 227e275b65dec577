//! Canonicalization of module specifiers, URL query suffixes and
//! file-system paths.
//!
//! Every other component works on the canonical forms produced here:
//! forward-slash paths, query-stripped URLs, and the reserved prefixes
//! that encode file-system access (`/@fs/`) and virtual ids (`/@id/`).

use std::path::{Path, PathBuf};

/// Reserved prefix that encodes an absolute file-system path in a URL.
pub const FS_PREFIX: &str = "/@fs/";

/// Reserved prefix for module ids that are not plain file paths.
pub const VALID_ID_PREFIX: &str = "/@id/";

/// URL the embedded client runtime is served at.
pub const CLIENT_PATH: &str = "/@client";

/// Virtual module ids start with a null byte on the server side.
pub const NULL_BYTE: char = '\0';

/// Wire-safe replacement for the leading null byte of a virtual id.
pub const NULL_BYTE_PLACEHOLDER: &str = "__x00__";

/// Convert a host-OS path to forward-slash form.
#[must_use]
pub fn normalize_path(path: &str) -> String {
    if cfg!(windows) {
        path.replace('\\', "/")
    } else {
        path.to_string()
    }
}

/// Strip the query and hash from a URL, returning the bare path.
#[must_use]
pub fn clean_url(url: &str) -> &str {
    let end = url
        .find(['?', '#'])
        .unwrap_or(url.len());
    &url[..end]
}

/// The query string of a URL (without the leading `?`), if any.
#[must_use]
pub fn query_of(url: &str) -> Option<&str> {
    let path_end = url.find('#').unwrap_or(url.len());
    let before_hash = &url[..path_end];
    before_hash.find('?').map(|i| &before_hash[i + 1..])
}

/// Insert `q` before any existing search string and after the path,
/// preserving the hash.
#[must_use]
pub fn inject_query(url: &str, q: &str) -> String {
    let (without_hash, hash) = match url.find('#') {
        Some(i) => (&url[..i], &url[i..]),
        None => (url, ""),
    };
    match without_hash.find('?') {
        Some(i) => format!(
            "{}?{}&{}{}",
            &without_hash[..i],
            q,
            &without_hash[i + 1..],
            hash
        ),
        None => format!("{without_hash}?{q}{hash}"),
    }
}

/// Remove a `t=<millis>` cache-busting parameter, keeping the rest of the
/// query intact.
#[must_use]
pub fn remove_timestamp_query(url: &str) -> String {
    let Some(query) = query_of(url) else {
        return url.to_string();
    };
    let kept: Vec<&str> = query
        .split('&')
        .filter(|pair| {
            let key = pair.split('=').next().unwrap_or("");
            key != "t"
        })
        .collect();
    let path = clean_url(url);
    let hash_start = url.find('#');
    let hash = hash_start.map(|i| &url[i..]).unwrap_or("");
    if kept.is_empty() {
        format!("{path}{hash}")
    } else {
        format!("{path}?{}{hash}", kept.join("&"))
    }
}

/// Strip the configured public base from a URL, if present.
#[must_use]
pub fn strip_base<'a>(url: &'a str, base: &str) -> &'a str {
    if base == "/" {
        return url;
    }
    let trimmed = base.trim_end_matches('/');
    match url.strip_prefix(trimmed) {
        Some(rest) if rest.is_empty() => "/",
        Some(rest) if rest.starts_with('/') || rest.starts_with('?') => rest,
        _ => url,
    }
}

/// Encode an absolute file-system path as an `/@fs/` URL.
#[must_use]
pub fn fs_path_to_url(path: &Path) -> String {
    let normalized = normalize_path(&path.display().to_string());
    if normalized.starts_with('/') {
        format!("{}{normalized}", FS_PREFIX.trim_end_matches('/'))
    } else {
        // Windows drive paths carry no leading slash of their own.
        format!("{FS_PREFIX}{normalized}")
    }
}

/// Decode an `/@fs/` URL back into the encoded absolute path.
#[must_use]
pub fn fs_url_to_path(url: &str) -> Option<PathBuf> {
    let rest = clean_url(url).strip_prefix(FS_PREFIX.trim_end_matches('/'))?;
    if rest.is_empty() {
        return None;
    }
    Some(PathBuf::from(rest))
}

/// Whether an id marks a virtual module (leading null byte).
#[must_use]
pub fn is_virtual_id(id: &str) -> bool {
    id.starts_with(NULL_BYTE)
}

/// Replace the null byte of a virtual id with its wire-safe sentinel.
#[must_use]
pub fn wrap_virtual_id(id: &str) -> String {
    match id.strip_prefix(NULL_BYTE) {
        Some(rest) => format!("{VALID_ID_PREFIX}{NULL_BYTE_PLACEHOLDER}{rest}"),
        None => format!("{VALID_ID_PREFIX}{id}"),
    }
}

/// Recover a server-side id from a `/@id/` URL.
#[must_use]
pub fn unwrap_virtual_url(url: &str) -> Option<String> {
    let rest = clean_url(url).strip_prefix(VALID_ID_PREFIX)?;
    Some(match rest.strip_prefix(NULL_BYTE_PLACEHOLDER) {
        Some(inner) => format!("{NULL_BYTE}{inner}"),
        None => rest.to_string(),
    })
}

/// Check whether `path` sits inside one of the allow-listed workspace
/// roots. Symlinks are resolved first so a link cannot escape the list.
#[must_use]
pub fn is_file_serving_allowed(path: &Path, allow: &[PathBuf]) -> bool {
    let resolved = dunce::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    allow.iter().any(|root| {
        let root = dunce::canonicalize(root).unwrap_or_else(|_| root.clone());
        resolved.starts_with(&root)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_url() {
        assert_eq!(clean_url("/src/a.js"), "/src/a.js");
        assert_eq!(clean_url("/src/a.js?t=123"), "/src/a.js");
        assert_eq!(clean_url("/src/a.js?t=123#frag"), "/src/a.js");
        assert_eq!(clean_url("/src/a.js#frag"), "/src/a.js");
    }

    #[test]
    fn test_query_of() {
        assert_eq!(query_of("/a.js"), None);
        assert_eq!(query_of("/a.js?import"), Some("import"));
        assert_eq!(query_of("/a.js?t=1&v=2#x"), Some("t=1&v=2"));
    }

    #[test]
    fn test_inject_query_no_existing() {
        assert_eq!(inject_query("/src/a.js", "t=42"), "/src/a.js?t=42");
    }

    #[test]
    fn test_inject_query_existing_search() {
        assert_eq!(
            inject_query("/src/a.js?import", "t=42"),
            "/src/a.js?t=42&import"
        );
    }

    #[test]
    fn test_inject_query_preserves_hash() {
        assert_eq!(
            inject_query("/src/a.js#frag", "t=42"),
            "/src/a.js?t=42#frag"
        );
        assert_eq!(
            inject_query("/src/a.js?v=abc#frag", "t=42"),
            "/src/a.js?t=42&v=abc#frag"
        );
    }

    #[test]
    fn test_remove_timestamp_query() {
        assert_eq!(remove_timestamp_query("/a.js?t=123"), "/a.js");
        assert_eq!(remove_timestamp_query("/a.js?t=123&v=abc"), "/a.js?v=abc");
        assert_eq!(remove_timestamp_query("/a.js?v=abc"), "/a.js?v=abc");
        assert_eq!(remove_timestamp_query("/a.js"), "/a.js");
    }

    #[test]
    fn test_strip_base() {
        assert_eq!(strip_base("/app/src/a.js", "/app/"), "/src/a.js");
        assert_eq!(strip_base("/app", "/app/"), "/");
        assert_eq!(strip_base("/src/a.js", "/"), "/src/a.js");
        // A URL outside the base is returned untouched; the middleware
        // redirects it.
        assert_eq!(strip_base("/other/a.js", "/app/"), "/other/a.js");
    }

    #[test]
    fn test_fs_url_round_trip() {
        let url = fs_path_to_url(Path::new("/home/user/project/src/a.js"));
        assert_eq!(url, "/@fs/home/user/project/src/a.js");
        assert_eq!(
            fs_url_to_path(&url),
            Some(PathBuf::from("/home/user/project/src/a.js"))
        );
    }

    #[test]
    fn test_fs_url_to_path_strips_query() {
        assert_eq!(
            fs_url_to_path("/@fs/cache/react.js?v=abcd1234"),
            Some(PathBuf::from("/cache/react.js"))
        );
    }

    #[test]
    fn test_virtual_id_wire_encoding() {
        let id = "\0virtual:env";
        assert!(is_virtual_id(id));
        let wrapped = wrap_virtual_id(id);
        assert_eq!(wrapped, "/@id/__x00__virtual:env");
        assert_eq!(unwrap_virtual_url(&wrapped).as_deref(), Some(id));
    }

    #[test]
    fn test_unwrap_plain_id_url() {
        assert_eq!(
            unwrap_virtual_url("/@id/some-plugin-id").as_deref(),
            Some("some-plugin-id")
        );
        assert_eq!(unwrap_virtual_url("/src/a.js"), None);
    }

    #[test]
    fn test_file_serving_allow_list() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let inside = root.join("src/a.js");
        std::fs::create_dir_all(inside.parent().unwrap()).unwrap();
        std::fs::write(&inside, "export {}").unwrap();

        assert!(is_file_serving_allowed(&inside, &[root.clone()]));
        assert!(!is_file_serving_allowed(Path::new("/etc/passwd"), &[root]));
    }
}

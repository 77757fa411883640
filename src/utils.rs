use std::path::{Component, Path};

/// Joins a base URL with additional path segments, normalising slashes
/// between the base and the joined segments.
pub fn join_url(base: &str, segments: &[&str]) -> String {
    let joined = segments.join("/");
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        joined.trim_start_matches('/')
    )
}

/// Lexically cleans a path: collapses `//` and `/./`, resolves `..` where
/// possible, and strips any trailing slash. The path is not touched on disk.
pub fn clean_path(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    let mut absolute = false;

    for component in Path::new(path).components() {
        match component {
            Component::RootDir => absolute = true,
            Component::CurDir => {}
            Component::ParentDir => {
                if parts.pop().is_none() && !absolute {
                    parts.push("..");
                }
            }
            Component::Normal(name) => match name.to_str() {
                Some(s) => parts.push(s),
                None => continue,
            },
            Component::Prefix(_) => {}
        }
    }

    let body = parts.join("/");
    match (absolute, body.is_empty()) {
        (true, true) => "/".to_string(),
        (true, false) => format!("/{body}"),
        (false, true) => ".".to_string(),
        (false, false) => body,
    }
}

/// Reports whether two paths refer to the same location after cleaning.
pub fn cleaned_path_equal(a: &str, b: &str) -> bool {
    clean_path(a) == clean_path(b)
}

/// Splits a cleaned path into its parent folder and final component.
/// A path with no parent yields an empty folder.
pub fn split_folder_file(path: &str) -> (String, String) {
    let cleaned = clean_path(path);
    let p = Path::new(&cleaned);

    let file = p
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default()
        .to_string();
    let folder = p
        .parent()
        .and_then(|n| n.to_str())
        .unwrap_or_default()
        .to_string();

    (folder, file)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_url_trims_slashes() {
        assert_eq!(
            join_url("http://plex:32400/", &["library", "sections"]),
            "http://plex:32400/library/sections"
        );
        assert_eq!(join_url("http://emby:8096", &[]), "http://emby:8096/");
    }

    #[test]
    fn test_clean_path() {
        assert_eq!(clean_path("/Movies//Alien (1979)/"), "/Movies/Alien (1979)");
        assert_eq!(clean_path("/a/./b/../c"), "/a/c");
        assert_eq!(clean_path("/.."), "/");
        assert_eq!(clean_path(""), ".");
    }

    #[test]
    fn test_cleaned_path_equal() {
        assert!(cleaned_path_equal("/Movies/", "/Movies"));
        assert!(!cleaned_path_equal("/Movies", "/TV"));
    }

    #[test]
    fn test_split_folder_file() {
        let (folder, file) = split_folder_file("/TV/Westworld/S01E01.mkv");
        assert_eq!(folder, "/TV/Westworld");
        assert_eq!(file, "S01E01.mkv");
    }
}

#![forbid(unsafe_code)]

// Boundary validation for untrusted request fields.

/// A room name is rejected if it is empty, overly long, or carries a path
/// traversal pattern. Room names end up in URLs and relay file paths, so
/// anything resembling a path component is refused outright.
pub fn is_valid_room_name(name: &str) -> bool {
    if name.is_empty() || name.len() > 128 {
        return false;
    }
    if name.contains("..") {
        return false;
    }
    !name.chars().any(|c| {
        matches!(c, '/' | '\\' | '?' | '*' | '|' | ':' | '"' | '<' | '>')
            || c.is_control()
    })
}

/// File names announced over the file-transfer relay must not contain
/// characters that are unsafe on common filesystems.
pub fn is_valid_file_name(name: &str) -> bool {
    !name.is_empty()
        && !name
            .chars()
            .any(|c| matches!(c, '\\' | '/' | '?' | '*' | '|' | ':' | '"' | '<' | '>'))
}

/// Shared video URLs must be plain http(s) with a sane host part.
pub fn is_valid_http_url(input: &str) -> bool {
    let rest = if let Some(r) = input.strip_prefix("https://") {
        r
    } else if let Some(r) = input.strip_prefix("http://") {
        r
    } else {
        return false;
    };

    let host = rest.split(['/', '?', '#']).next().unwrap_or("");
    let host = host.split(':').next().unwrap_or("");

    !host.is_empty()
        && host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn room_names() {
        assert!(is_valid_room_name("daily-standup"));
        assert!(is_valid_room_name("Room_42"));
        assert!(!is_valid_room_name(""));
        assert!(!is_valid_room_name("../etc/passwd"));
        assert!(!is_valid_room_name("a/b"));
        assert!(!is_valid_room_name("x\\y"));
        assert!(!is_valid_room_name("room?"));
    }

    #[test]
    fn file_names() {
        assert!(is_valid_file_name("notes.pdf"));
        assert!(!is_valid_file_name("bad|name"));
        assert!(!is_valid_file_name("dir/file"));
        assert!(!is_valid_file_name(""));
    }

    #[test]
    fn http_urls() {
        assert!(is_valid_http_url("https://example.com/video.mp4"));
        assert!(is_valid_http_url("http://10.0.0.1:8080/stream"));
        assert!(!is_valid_http_url("ftp://example.com/x"));
        assert!(!is_valid_http_url("https://"));
        assert!(!is_valid_http_url("javascript:alert(1)"));
    }
}

use std::path::Path;

/// Generate a session ID: "s_" followed by 16 hex chars.
pub fn generate_session_id() -> String {
    let bytes: [u8; 8] = rand_bytes();
    format!(
        "s_{}",
        bytes
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect::<String>()
    )
}

/// Simple random bytes using the uuid crate (already a dependency;
/// uuid v4 is CSPRNG-backed).
fn rand_bytes() -> [u8; 8] {
    let id = uuid::Uuid::new_v4();
    let b = id.as_bytes();
    [b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]
}

/// Sanitize a project name into a docker container name suffix:
/// lowercased, spaces become '-', anything outside [a-z0-9_-] dropped,
/// empty results become "project".
pub fn sanitize_container_name(name: &str) -> String {
    let cleaned: String = name
        .to_lowercase()
        .chars()
        .map(|c| if c == ' ' { '-' } else { c })
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '_' || *c == '-')
        .collect();
    if cleaned.is_empty() {
        "project".to_string()
    } else {
        cleaned
    }
}

/// Derive a project name from its root directory.
pub fn project_name(project_root: &Path) -> String {
    project_root
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "project".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_id_format() {
        let id = generate_session_id();
        assert!(id.starts_with("s_"));
        assert_eq!(id.len(), 18); // "s_" + 16 hex chars
        assert!(id[2..].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_session_ids_are_unique() {
        let a = generate_session_id();
        let b = generate_session_id();
        assert_ne!(a, b);
    }

    #[test]
    fn test_sanitize_container_name() {
        assert_eq!(sanitize_container_name("My Project"), "my-project");
        assert_eq!(sanitize_container_name("api_v2"), "api_v2");
        assert_eq!(sanitize_container_name("Ünïcodé!"), "ncod");
        assert_eq!(sanitize_container_name("!!!"), "project");
        assert_eq!(sanitize_container_name(""), "project");
    }

    #[test]
    fn test_project_name_from_root() {
        assert_eq!(project_name(Path::new("/tmp/demo-app")), "demo-app");
        assert_eq!(project_name(Path::new("/")), "project");
    }
}

use std::path::{Component, Path};

use crate::{DESTINATION_PREFIX, TransferError};

/// Derives the receiver-side file name for a declared source name.
///
/// Only the last path component of the declared name is kept, prefixed
/// with [`DESTINATION_PREFIX`]. Rejects:
/// - Empty names
/// - Absolute paths (Unix `/` or Windows `C:\`)
/// - Parent directory traversal (`..`)
/// - Backslashes and drive separators, which name other locations on Windows
/// - Names with no file component (`.`, `./`)
pub fn destination_file_name(declared: &str) -> Result<String, TransferError> {
    if declared.is_empty() {
        return Err(TransferError::InvalidPath("empty file name".into()));
    }

    if declared.contains('\\') || declared.contains(':') {
        return Err(TransferError::InvalidPath(format!(
            "platform-specific separators not allowed: {declared}"
        )));
    }

    let path = Path::new(declared);
    let mut base = None;
    for component in path.components() {
        match component {
            Component::ParentDir => {
                return Err(TransferError::InvalidPath(format!(
                    "parent directory traversal not allowed: {declared}"
                )));
            }
            Component::Prefix(_) | Component::RootDir => {
                return Err(TransferError::InvalidPath(format!(
                    "absolute path not allowed: {declared}"
                )));
            }
            Component::CurDir => {}
            Component::Normal(name) => base = Some(name),
        }
    }

    let base = base
        .and_then(|name| name.to_str())
        .ok_or_else(|| TransferError::InvalidPath(format!("no file name in: {declared}")))?;
    Ok(format!("{DESTINATION_PREFIX}{base}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefixes_simple_name() {
        assert_eq!(
            destination_file_name("test_data.txt").unwrap(),
            "received_test_data.txt"
        );
    }

    #[test]
    fn keeps_only_base_name() {
        assert_eq!(
            destination_file_name("sub/dir/file.txt").unwrap(),
            "received_file.txt"
        );
        assert_eq!(
            destination_file_name("./game.exe").unwrap(),
            "received_game.exe"
        );
    }

    #[test]
    fn accepts_dotfile() {
        assert_eq!(destination_file_name(".env").unwrap(), "received_.env");
    }

    #[test]
    fn rejects_empty_name() {
        assert!(destination_file_name("").is_err());
    }

    #[test]
    fn rejects_parent_dir_traversal() {
        assert!(destination_file_name("../../../etc/passwd").is_err());
        assert!(destination_file_name("..").is_err());
    }

    #[test]
    fn rejects_absolute_unix_path() {
        assert!(destination_file_name("/tmp/malicious").is_err());
    }

    #[test]
    fn rejects_windows_paths_everywhere() {
        assert!(destination_file_name("C:\\Windows\\evil").is_err());
        assert!(destination_file_name("dir\\file.txt").is_err());
    }

    #[test]
    fn rejects_name_without_file_component() {
        assert!(destination_file_name(".").is_err());
        assert!(destination_file_name("./").is_err());
    }
}

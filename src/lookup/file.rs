//! File lookup.
//!
//! Reads a file on the control node and returns its contents with trailing
//! whitespace removed.
//!
//! ```yaml
//! key: "{{ lookup('file', 'files/deploy.pub') }}"
//! raw: "{{ lookup('file', '/etc/motd', 'rstrip=false') }}"
//! ```

use super::{Lookup, LookupContext, LookupError, LookupResult};
use std::fs;
use std::path::PathBuf;

/// Reads local files.
#[derive(Debug, Clone, Default)]
pub struct FileLookup;

impl FileLookup {
    /// Create a new FileLookup instance
    pub fn new() -> Self {
        Self
    }

    fn resolve_path(&self, path: &str, context: &LookupContext) -> PathBuf {
        let path = PathBuf::from(path);
        match &context.base_dir {
            Some(base) if path.is_relative() => base.join(path),
            _ => path,
        }
    }
}

impl Lookup for FileLookup {
    fn name(&self) -> &'static str {
        "file"
    }

    fn description(&self) -> &'static str {
        "Reads file contents from the control node"
    }

    fn lookup(&self, args: &[&str], context: &LookupContext) -> LookupResult<Vec<String>> {
        let options = self.parse_options(args);
        let rstrip = options
            .get("rstrip")
            .map(|v| !matches!(v.to_ascii_lowercase().as_str(), "false" | "no" | "0"))
            .unwrap_or(true);

        let paths: Vec<&str> = args.iter().copied().filter(|a| !a.contains('=')).collect();
        if paths.is_empty() {
            return Err(LookupError::MissingArgument("file path required".to_string()));
        }

        let mut results = Vec::with_capacity(paths.len());
        for arg in paths {
            if arg.contains('\0') {
                return Err(LookupError::InvalidArguments(
                    "Path contains null byte".to_string(),
                ));
            }
            let path = self.resolve_path(arg, context);
            let content = fs::read_to_string(&path).map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    LookupError::FileNotFound(path.clone())
                } else {
                    LookupError::Unreadable {
                        path: path.clone(),
                        source: e,
                    }
                }
            })?;
            results.push(if rstrip {
                content.trim_end().to_string()
            } else {
                content
            });
        }

        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::{tempdir, NamedTempFile};

    #[test]
    fn test_file_lookup_strips_trailing_newline() {
        let mut temp = NamedTempFile::new().unwrap();
        writeln!(temp, "ssh-ed25519 AAAA deploy").unwrap();

        let values = FileLookup::new()
            .lookup(&[temp.path().to_str().unwrap()], &LookupContext::default())
            .unwrap();
        assert_eq!(values, vec!["ssh-ed25519 AAAA deploy".to_string()]);
    }

    #[test]
    fn test_file_lookup_keeps_whitespace_on_request() {
        let mut temp = NamedTempFile::new().unwrap();
        write!(temp, "line\n\n").unwrap();

        let values = FileLookup::new()
            .lookup(
                &[temp.path().to_str().unwrap(), "rstrip=false"],
                &LookupContext::default(),
            )
            .unwrap();
        assert_eq!(values[0], "line\n\n");
    }

    #[test]
    fn test_file_lookup_relative_to_base_dir() {
        let dir = tempdir().unwrap();
        std::fs::create_dir(dir.path().join("files")).unwrap();
        std::fs::write(dir.path().join("files/motd"), "welcome\n").unwrap();

        let context = LookupContext::new().with_base_dir(dir.path());
        let values = FileLookup::new().lookup(&["files/motd"], &context).unwrap();
        assert_eq!(values[0], "welcome");
    }

    #[test]
    fn test_file_lookup_missing_file() {
        let result = FileLookup::new().lookup(
            &["/nonexistent/path/to/file.txt"],
            &LookupContext::default(),
        );
        assert!(matches!(result, Err(LookupError::FileNotFound(_))));
    }

    #[test]
    fn test_file_lookup_no_args() {
        let result = FileLookup::new().lookup(&[], &LookupContext::default());
        assert!(matches!(result, Err(LookupError::MissingArgument(_))));
    }
}

//! Lookup-only templates for agent arguments, environment and text files.
//!
//! A template action has the form `{{ .ListenPort }}` or
//! `{{ .TextFiles.Name }}` (delimiters are configurable per agent). There is
//! no logic: an action is a dotted path looked up in [`TemplateParams`], and a
//! path that does not resolve is an error.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use thiserror::Error;

/// Default left delimiter.
pub const DEFAULT_LEFT_DELIM: &str = "{{";
/// Default right delimiter.
pub const DEFAULT_RIGHT_DELIM: &str = "}}";

/// Errors produced while rendering templates.
#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("template {name}: map has no entry for key {key:?}")]
    MissingKey { name: String, key: String },
    #[error("template {name}: unclosed action")]
    Unclosed { name: String },
    #[error("template {name}: unsupported action {action:?}")]
    Unsupported { name: String, action: String },
    #[error("invalid text file name {0:?}")]
    InvalidTextFileName(String),
    #[error("failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Values visible to templates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TemplateParams {
    /// Port the agent should listen on; absent for non-listening agent types.
    pub listen_port: Option<u16>,
    /// Text file name to its rendered path; absent while text files themselves render.
    pub text_files: Option<BTreeMap<String, PathBuf>>,
}

impl TemplateParams {
    fn lookup(&self, path: &[&str]) -> Option<String> {
        match path {
            ["ListenPort"] => self.listen_port.map(|port| port.to_string()),
            ["TextFiles", name] => self
                .text_files
                .as_ref()?
                .get(*name)
                .map(|path| path.display().to_string()),
            _ => None,
        }
    }
}

/// Renders templates with a fixed pair of delimiters.
#[derive(Debug, Clone)]
pub struct TemplateRenderer {
    left: String,
    right: String,
}

impl Default for TemplateRenderer {
    fn default() -> Self {
        Self::new(DEFAULT_LEFT_DELIM, DEFAULT_RIGHT_DELIM)
    }
}

impl TemplateRenderer {
    /// Creates a renderer; empty delimiters fall back to the defaults.
    pub fn new(left: &str, right: &str) -> Self {
        let left = if left.is_empty() { DEFAULT_LEFT_DELIM } else { left };
        let right = if right.is_empty() { DEFAULT_RIGHT_DELIM } else { right };
        Self {
            left: left.to_string(),
            right: right.to_string(),
        }
    }

    /// Renders one template. `name` only appears in error messages.
    pub fn render(
        &self,
        name: &str,
        text: &str,
        params: &TemplateParams,
    ) -> Result<String, TemplateError> {
        let mut out = String::with_capacity(text.len());
        let mut rest = text;
        while let Some(start) = rest.find(&self.left) {
            out.push_str(&rest[..start]);
            let after = &rest[start + self.left.len()..];
            let Some(end) = after.find(&self.right) else {
                return Err(TemplateError::Unclosed {
                    name: name.to_string(),
                });
            };
            out.push_str(&self.action(name, &after[..end], params)?);
            rest = &after[end + self.right.len()..];
        }
        out.push_str(rest);
        Ok(out)
    }

    fn action(
        &self,
        name: &str,
        action: &str,
        params: &TemplateParams,
    ) -> Result<String, TemplateError> {
        let action = action.trim();
        if !field_path_re().is_some_and(|re| re.is_match(action)) {
            return Err(TemplateError::Unsupported {
                name: name.to_string(),
                action: action.to_string(),
            });
        }
        let path: Vec<&str> = action[1..].split('.').collect();
        params.lookup(&path).ok_or_else(|| TemplateError::MissingKey {
            name: name.to_string(),
            key: missing_key(&path, params),
        })
    }

    /// Renders every text file into `dir` and returns name to path.
    ///
    /// `dir` is emptied and recreated first so files from earlier runs do not
    /// linger. Only `ListenPort` is visible to text file templates.
    pub fn render_files(
        &self,
        dir: &Path,
        text_files: &BTreeMap<String, String>,
        params: &TemplateParams,
    ) -> Result<BTreeMap<String, PathBuf>, TemplateError> {
        for name in text_files.keys() {
            if !text_file_name_re().is_some_and(|re| re.is_match(name)) {
                return Err(TemplateError::InvalidTextFileName(name.clone()));
            }
        }

        let io_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source| TemplateError::Io { path, source }
        };
        match fs::remove_dir_all(dir) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(io_err(dir)(err)),
        }
        fs::create_dir_all(dir).map_err(io_err(dir))?;

        let file_params = TemplateParams {
            listen_port: params.listen_port,
            text_files: None,
        };
        let mut rendered = BTreeMap::new();
        for (name, text) in text_files {
            let content = self.render(name, text, &file_params)?;
            let path = dir.join(name);
            write_private(&path, content.as_bytes()).map_err(io_err(&path))?;
            rendered.insert(name.clone(), path);
        }
        Ok(rendered)
    }
}

// Reports the first path segment that cannot be resolved, mirroring how a
// nested map lookup fails.
fn missing_key(path: &[&str], params: &TemplateParams) -> String {
    match path {
        ["TextFiles", name, ..] if params.text_files.is_some() => name.to_string(),
        [first, ..] => first.to_string(),
        [] => String::new(),
    }
}

// A pattern that fails to compile rejects every action and file name.
fn field_path_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\.[A-Za-z_][A-Za-z0-9_]*)+$").ok())
        .as_ref()
}

// `_` as a first character is kept for possible extensions.
fn text_file_name_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z][A-Za-z0-9_]*$").ok())
        .as_ref()
}

#[cfg(unix)]
fn write_private(path: &Path, content: &[u8]) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o640)
        .open(path)?;
    file.write_all(content)
}

#[cfg(not(unix))]
fn write_private(path: &Path, content: &[u8]) -> std::io::Result<()> {
    fs::write(path, content)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(port: u16) -> TemplateParams {
        TemplateParams {
            listen_port: Some(port),
            text_files: None,
        }
    }

    #[test]
    fn renders_listen_port_with_and_without_spaces() {
        let renderer = TemplateRenderer::default();
        let out = renderer
            .render("args", "--web.listen-address=:{{ .ListenPort }}/{{.ListenPort}}", &params(42000))
            .unwrap();
        assert_eq!(out, "--web.listen-address=:42000/42000");
    }

    #[test]
    fn plain_text_is_untouched() {
        let renderer = TemplateRenderer::default();
        let out = renderer.render("env", "HTTP_AUTH=pmm:secret", &params(1)).unwrap();
        assert_eq!(out, "HTTP_AUTH=pmm:secret");
    }

    #[test]
    fn custom_delimiters() {
        let renderer = TemplateRenderer::new("[[", "]]");
        let out = renderer
            .render("args", "{{ not a template }} [[ .ListenPort ]]", &params(9000))
            .unwrap();
        assert_eq!(out, "{{ not a template }} 9000");
    }

    #[test]
    fn missing_key_errors() {
        let renderer = TemplateRenderer::default();
        let err = renderer.render("args", "-foo=:{{ .bar }}", &params(1)).unwrap_err();
        assert_eq!(err.to_string(), r#"template args: map has no entry for key "bar""#);

        let err = renderer
            .render("args", "{{ .TextFiles.baz }}", &params(1))
            .unwrap_err();
        assert!(err.to_string().contains(r#"no entry for key "TextFiles""#));

        let with_files = TemplateParams {
            listen_port: Some(1),
            text_files: Some(BTreeMap::from([("bar".to_string(), PathBuf::from("/x"))])),
        };
        let err = renderer
            .render("args", "{{ .TextFiles.baz }}", &with_files)
            .unwrap_err();
        assert!(err.to_string().contains(r#"no entry for key "baz""#));

        let no_port = TemplateParams::default();
        let err = renderer.render("args", "{{ .ListenPort }}", &no_port).unwrap_err();
        assert!(matches!(err, TemplateError::MissingKey { ref key, .. } if key == "ListenPort"));
    }

    #[test]
    fn malformed_actions() {
        let renderer = TemplateRenderer::default();
        let err = renderer.render("args", "{{ .ListenPort", &params(1)).unwrap_err();
        assert!(matches!(err, TemplateError::Unclosed { .. }));
        let err = renderer.render("args", "{{ if .ListenPort }}", &params(1)).unwrap_err();
        assert!(matches!(err, TemplateError::Unsupported { .. }));
    }

    #[test]
    fn renders_text_files_into_fresh_directory() {
        let temp = tempfile::tempdir().unwrap();
        let dir = temp.path().join("mysqld_exporter-ID");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("Stale"), "old").unwrap();

        let renderer = TemplateRenderer::default();
        let files = BTreeMap::from([
            ("Cert".to_string(), "-----BEGIN CERTIFICATE-----\n...".to_string()),
            ("Config".to_string(), "test={{ .ListenPort }}".to_string()),
        ]);
        let rendered = renderer.render_files(&dir, &files, &params(12345)).unwrap();

        assert_eq!(rendered["Cert"], dir.join("Cert"));
        assert_eq!(std::fs::read_to_string(dir.join("Config")).unwrap(), "test=12345");
        assert!(!dir.join("Stale").exists());
    }

    #[test]
    fn text_files_cannot_reference_each_other() {
        let temp = tempfile::tempdir().unwrap();
        let renderer = TemplateRenderer::default();
        let files = BTreeMap::from([
            ("A".to_string(), "a".to_string()),
            ("B".to_string(), "{{ .TextFiles.A }}".to_string()),
        ]);
        let err = renderer
            .render_files(temp.path(), &files, &params(1))
            .unwrap_err();
        assert!(matches!(err, TemplateError::MissingKey { .. }));
    }

    #[test]
    fn rejects_insecure_file_names() {
        let temp = tempfile::tempdir().unwrap();
        let renderer = TemplateRenderer::default();
        let files = BTreeMap::from([("../bar".to_string(), "hax0r".to_string())]);
        let err = renderer
            .render_files(temp.path(), &files, &params(1))
            .unwrap_err();
        assert_eq!(err.to_string(), r#"invalid text file name "../bar""#);
    }

    #[test]
    fn validation_patterns_compile() {
        assert!(field_path_re().is_some());
        assert!(text_file_name_re().is_some());
    }
}

//! Message templates, one pretty-printed JSON file per template.
//!
//! A template named `promo` lives in `<root>/promo.json`. The name inside
//! the file is the same string, without the extension.

use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::types::*;

const EXTENSION: &str = "json";

/// A saved subject, HTML body and attachment list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Template {
    pub name: String,
    pub subject: String,
    pub body: String,
    #[serde(default)]
    pub attachments: Vec<String>,
}

impl Template {
    pub fn new(
        name: impl Into<String>,
        subject: impl Into<String>,
        body: impl Into<String>,
        attachments: Vec<String>,
    ) -> Self {
        Self {
            name: normalise_name(&name.into()).to_string(),
            subject: subject.into(),
            body: body.into(),
            attachments,
        }
    }

    /// Attachment entries as paths.
    pub fn attachment_paths(&self) -> Vec<PathBuf> {
        self.attachments.iter().map(PathBuf::from).collect()
    }

    fn to_json(&self) -> SmtpResult<String> {
        let mut buf = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
        self.serialize(&mut ser)
            .map_err(|e| SmtpError::io(format!("JSON serialise: {}", e)))?;
        String::from_utf8(buf).map_err(|e| SmtpError::io(format!("JSON serialise: {}", e)))
    }
}

/// Strip a trailing `.json` so `promo` and `promo.json` name the same file.
fn normalise_name(name: &str) -> &str {
    let name = name.trim();
    name.strip_suffix(".json").unwrap_or(name)
}

fn check_name(name: &str) -> SmtpResult<&str> {
    let name = normalise_name(name);
    if name.is_empty()
        || name.starts_with('.')
        || name.contains(['/', '\\'])
        || name.chars().any(char::is_control)
    {
        return Err(SmtpError::invalid(format!("Invalid template name: {:?}", name)));
    }
    Ok(name)
}

// ─── TemplateStore ──────────────────────────────────────────────────

/// Directory of template files.
#[derive(Debug, Clone)]
pub struct TemplateStore {
    root: PathBuf,
}

impl TemplateStore {
    /// Open the store at `root`, creating the directory if needed.
    pub fn open(root: impl Into<PathBuf>) -> SmtpResult<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .map_err(|e| SmtpError::io(format!("Cannot create {}: {}", root.display(), e)))?;
        debug!("[templates] store at {}", root.display());
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, name: &str) -> SmtpResult<PathBuf> {
        let name = check_name(name)?;
        Ok(self.root.join(format!("{}.{}", name, EXTENSION)))
    }

    /// Write `template`, replacing any template with the same name.
    pub fn save(&self, template: &Template) -> SmtpResult<PathBuf> {
        let path = self.path_for(&template.name)?;
        let stored = Template {
            name: normalise_name(&template.name).to_string(),
            ..template.clone()
        };
        std::fs::write(&path, stored.to_json()?)
            .map_err(|e| SmtpError::io(format!("Cannot write {}: {}", path.display(), e)))?;
        info!("[templates] saved {:?}", stored.name);
        Ok(path)
    }

    /// Every readable template, sorted by name. Unreadable or malformed
    /// files are skipped with a warning.
    pub fn list(&self) -> SmtpResult<Vec<Template>> {
        let entries = std::fs::read_dir(&self.root)
            .map_err(|e| SmtpError::io(format!("Cannot list {}: {}", self.root.display(), e)))?;

        let mut templates = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) || !path.is_file() {
                continue;
            }
            match read_template(&path) {
                Ok(t) => templates.push(t),
                Err(e) => warn!("[templates] skipping {}: {}", path.display(), e),
            }
        }
        templates.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(templates)
    }

    /// Remove the template file. Returns whether one existed.
    pub fn delete(&self, name: &str) -> SmtpResult<bool> {
        let path = self.path_for(name)?;
        match std::fs::remove_file(&path) {
            Ok(()) => {
                info!("[templates] deleted {:?}", normalise_name(name));
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(SmtpError::io(format!("Cannot delete {}: {}", path.display(), e))),
        }
    }

    /// The stored template whose `name` field matches `name`, if any.
    ///
    /// Matching goes by the name inside each file, not by file name, so a
    /// file saved as `promo.json` with `"name": "promo.json"` is found as
    /// `promo`.
    pub fn load_by_name(&self, name: &str) -> SmtpResult<Option<Template>> {
        let wanted = check_name(name)?;
        Ok(self.list()?.into_iter().find(|t| t.name == wanted))
    }
}

/// Parse one template file. The stored name is normalised like
/// [`Template::new`]; an empty name falls back to the file stem.
fn read_template(path: &Path) -> SmtpResult<Template> {
    let text = std::fs::read_to_string(path)?;
    let mut template: Template = serde_json::from_str(&text)
        .map_err(|e| SmtpError::io(format!("JSON deserialise: {}", e)))?;
    template.name = normalise_name(&template.name).to_string();
    if template.name.is_empty() {
        if let Some(stem) = path.file_stem() {
            template.name = stem.to_string_lossy().into_owned();
        }
    }
    Ok(template)
}

// ─── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, TemplateStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = TemplateStore::open(dir.path().join("templates")).unwrap();
        (dir, store)
    }

    #[test]
    fn open_is_idempotent() {
        let (dir, store) = store();
        assert!(store.root().is_dir());
        TemplateStore::open(dir.path().join("templates")).unwrap();
    }

    #[test]
    fn save_then_load_round_trip() {
        let (_dir, store) = store();
        let t = Template::new("promo", "Hi", "<b>hi</b>", vec!["/tmp/a.png".into()]);
        store.save(&t).unwrap();
        assert_eq!(store.load_by_name("promo").unwrap(), Some(t.clone()));
        assert_eq!(store.load_by_name("promo.json").unwrap(), Some(t));
    }

    #[test]
    fn file_is_pretty_with_four_spaces_and_raw_unicode() {
        let (_dir, store) = store();
        let path = store
            .save(&Template::new("grüße", "Grüße", "<p>ü</p>", vec![]))
            .unwrap();
        assert!(path.ends_with("grüße.json"));
        let text = std::fs::read_to_string(path).unwrap();
        assert!(text.contains("\n    \"name\": \"grüße\""));
        assert!(text.contains("Grüße"));
    }

    #[test]
    fn save_replaces_existing() {
        let (_dir, store) = store();
        store.save(&Template::new("a", "one", "b", vec![])).unwrap();
        store.save(&Template::new("a", "two", "b", vec![])).unwrap();
        let list = store.list().unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].subject, "two");
    }

    #[test]
    fn list_sorted_and_skips_malformed() {
        let (_dir, store) = store();
        store.save(&Template::new("zeta", "z", "z", vec![])).unwrap();
        store.save(&Template::new("alpha", "a", "a", vec![])).unwrap();
        std::fs::write(store.root().join("broken.json"), "{not json").unwrap();
        std::fs::write(store.root().join("notes.txt"), "ignored").unwrap();
        let names: Vec<String> = store.list().unwrap().into_iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
    }

    #[test]
    fn delete_reports_existence() {
        let (_dir, store) = store();
        store.save(&Template::new("gone", "s", "b", vec![])).unwrap();
        assert!(store.delete("gone").unwrap());
        assert!(!store.delete("gone").unwrap());
        assert_eq!(store.load_by_name("gone").unwrap(), None);
    }

    #[test]
    fn missing_template_is_none() {
        let (_dir, store) = store();
        assert_eq!(store.load_by_name("nope").unwrap(), None);
    }

    #[test]
    fn path_like_names_rejected() {
        let (_dir, store) = store();
        for bad in ["", "../escape", "a/b", ".hidden"] {
            let err = store.save(&Template::new(bad, "s", "b", vec![])).unwrap_err();
            assert_eq!(err.kind, SmtpErrorKind::InvalidInput, "{bad:?}");
        }
    }

    #[test]
    fn lookup_uses_stored_name_field() {
        let (_dir, store) = store();
        std::fs::write(
            store.root().join("promo.json"),
            r#"{"name": "promo.json", "subject": "Hi", "body": "b", "attachments": []}"#,
        )
        .unwrap();
        std::fs::write(
            store.root().join("renamed.json"),
            r#"{"name": "launch", "subject": "Go", "body": "b"}"#,
        )
        .unwrap();

        let promo = store.load_by_name("promo").unwrap().unwrap();
        assert_eq!(promo.name, "promo");
        assert_eq!(promo.subject, "Hi");
        assert_eq!(store.load_by_name("launch").unwrap().unwrap().subject, "Go");
        assert_eq!(store.load_by_name("renamed").unwrap(), None);

        let names: Vec<String> = store.list().unwrap().into_iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["launch", "promo"]);
    }

    #[test]
    fn missing_attachments_field_defaults_empty() {
        let (_dir, store) = store();
        std::fs::write(
            store.root().join("old.json"),
            r#"{"name": "old", "subject": "s", "body": "b"}"#,
        )
        .unwrap();
        let t = store.load_by_name("old").unwrap().unwrap();
        assert!(t.attachments.is_empty());
    }
}

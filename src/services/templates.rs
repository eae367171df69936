//! Notification templates.
//!
//! A small set of built-in HTML templates for system notifications (import
//! finished, campaign finished). A directory of `*.html` files can override
//! any of them by file stem. Placeholders are `{{ key }}`.

use std::collections::HashMap;
use std::path::Path;

pub const IMPORT_STATUS: &str = "import-status";
pub const CAMPAIGN_STATUS: &str = "campaign-status";

const BUILTIN: &[(&str, &str)] = &[
    (
        IMPORT_STATUS,
        "<p>Import <strong>{{ name }}</strong> finished: {{ imported }} imported, \
         {{ skipped }} skipped.</p>",
    ),
    (
        CAMPAIGN_STATUS,
        "<p>Campaign <strong>{{ name }}</strong> is {{ status }}: {{ sent }} sent.</p>",
    ),
];

#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    #[error("reading templates from {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("unknown template `{0}`")]
    Unknown(String),

    #[error("template `{name}` has an unterminated placeholder")]
    Unterminated { name: String },
}

#[derive(Debug, Clone)]
pub struct NotifTemplates {
    templates: HashMap<String, String>,
}

impl NotifTemplates {
    /// Built-in templates, overridden by `*.html` files in `dir`.
    pub fn load(dir: Option<&Path>) -> Result<Self, TemplateError> {
        let mut templates: HashMap<String, String> = BUILTIN
            .iter()
            .map(|(name, body)| (name.to_string(), body.to_string()))
            .collect();

        if let Some(dir) = dir {
            let io_err = |source| TemplateError::Io {
                path: dir.display().to_string(),
                source,
            };
            for entry in std::fs::read_dir(dir).map_err(io_err)? {
                let path = entry.map_err(io_err)?.path();
                if path.extension().and_then(|e| e.to_str()) != Some("html") {
                    continue;
                }
                let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                    continue;
                };
                let body = std::fs::read_to_string(&path).map_err(io_err)?;
                tracing::debug!(template = %stem, "Loaded template override");
                templates.insert(stem.to_string(), body);
            }
        }

        let loaded = Self { templates };
        for name in loaded.templates.keys() {
            loaded.check(name)?;
        }
        Ok(loaded)
    }

    fn check(&self, name: &str) -> Result<(), TemplateError> {
        let body = self.body(name)?;
        let opens = body.matches("{{").count();
        let closes = body.matches("}}").count();
        if opens != closes {
            return Err(TemplateError::Unterminated {
                name: name.to_string(),
            });
        }
        Ok(())
    }

    fn body(&self, name: &str) -> Result<&str, TemplateError> {
        self.templates
            .get(name)
            .map(String::as_str)
            .ok_or_else(|| TemplateError::Unknown(name.to_string()))
    }

    /// Substitute `{{ key }}` placeholders. Unknown keys render empty.
    pub fn render(&self, name: &str, vars: &[(&str, &str)]) -> Result<String, TemplateError> {
        let mut rest = self.body(name)?;
        let mut out = String::with_capacity(rest.len());

        while let Some(start) = rest.find("{{") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let end = after.find("}}").ok_or_else(|| TemplateError::Unterminated {
                name: name.to_string(),
            })?;
            let key = after[..end].trim();
            if let Some((_, value)) = vars.iter().find(|(k, _)| *k == key) {
                out.push_str(value);
            }
            rest = &after[end + 2..];
        }
        out.push_str(rest);
        Ok(out)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.templates.contains_key(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_builtin() {
        let templates = NotifTemplates::load(None).unwrap();
        let html = templates
            .render(
                IMPORT_STATUS,
                &[("name", "spring.csv"), ("imported", "10"), ("skipped", "2")],
            )
            .unwrap();
        assert_eq!(
            html,
            "<p>Import <strong>spring.csv</strong> finished: 10 imported, 2 skipped.</p>"
        );
    }

    #[test]
    fn test_directory_overrides_builtin() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("import-status.html"), "done: {{name}}").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let templates = NotifTemplates::load(Some(dir.path())).unwrap();
        assert_eq!(
            templates.render(IMPORT_STATUS, &[("name", "x")]).unwrap(),
            "done: x"
        );
        assert!(templates.contains(CAMPAIGN_STATUS));
        assert!(!templates.contains("notes"));
    }

    #[test]
    fn test_rejects_unterminated_override() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("broken.html"), "hello {{ name").unwrap();
        assert!(matches!(
            NotifTemplates::load(Some(dir.path())),
            Err(TemplateError::Unterminated { .. })
        ));
    }

    #[test]
    fn test_unknown_template() {
        let templates = NotifTemplates::load(None).unwrap();
        assert!(matches!(
            templates.render("nope", &[]),
            Err(TemplateError::Unknown(_))
        ));
    }
}

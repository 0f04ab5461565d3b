//! Manifest-backed store of persisted integrations
//!
//! ```text
//! <apps_dir>/
//!   manifest.json        {"apps": [{app_id, class_name, description, module}, ...]}
//!   notion.py            module source, one class per file
//!   com_discord_<hash8>.py   <slug>_<sha256(app_id) prefix>
//! ```
//!
//! Discovery reads the manifest only; module files are never imported to
//! find out what they contain.

use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use super::generator::GeneratedApp;
use super::IntegrationError;

pub const MANIFEST_FILE: &str = "manifest.json";

/// One persisted integration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppEntry {
    pub app_id: String,
    pub class_name: String,
    pub description: String,
    /// Module file name, relative to the apps directory
    pub module: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub apps: Vec<AppEntry>,
}

/// Reads and writes the apps directory
#[derive(Debug, Clone)]
pub struct IntegrationStore {
    dir: PathBuf,
}

impl IntegrationStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.dir.join(MANIFEST_FILE)
    }

    /// Load the manifest (an absent manifest is an empty one)
    pub fn load_manifest(&self) -> Result<Manifest, IntegrationError> {
        let path = self.manifest_path();
        if !path.exists() {
            debug!(path = %path.display(), "No manifest, no apps");
            return Ok(Manifest::default());
        }
        let text = std::fs::read_to_string(&path).map_err(|e| IntegrationError::io(&path, e))?;
        Ok(serde_json::from_str(&text)?)
    }

    /// All registered apps in manifest order
    pub fn list(&self) -> Result<Vec<AppEntry>, IntegrationError> {
        Ok(self.load_manifest()?.apps)
    }

    /// Look an app up by its `app_id`
    pub fn find(&self, app_id: &str) -> Result<AppEntry, IntegrationError> {
        self.list()?
            .into_iter()
            .find(|entry| entry.app_id == app_id)
            .ok_or_else(|| IntegrationError::NotFound(app_id.to_string()))
    }

    /// Source text of an app's module
    pub fn read_source(&self, entry: &AppEntry) -> Result<String, IntegrationError> {
        let path = self.module_path(&entry.module)?;
        std::fs::read_to_string(&path).map_err(|e| IntegrationError::io(&path, e))
    }

    /// Persist a generated app, replacing any entry with the same `app_id`
    pub fn save_app(&self, app: &GeneratedApp) -> Result<AppEntry, IntegrationError> {
        app.validate()?;
        std::fs::create_dir_all(&self.dir).map_err(|e| IntegrationError::io(&self.dir, e))?;

        let entry = AppEntry {
            app_id: app.app_id.clone(),
            class_name: app.class_name.clone(),
            description: app.description.clone(),
            module: format!("{}.py", module_stem(&app.app_id)),
        };
        let module_path = self.module_path(&entry.module)?;
        std::fs::write(&module_path, &app.source).map_err(|e| IntegrationError::io(&module_path, e))?;

        let mut manifest = self.load_manifest()?;
        match manifest.apps.iter_mut().find(|e| e.app_id == entry.app_id) {
            Some(existing) => *existing = entry.clone(),
            None => manifest.apps.push(entry.clone()),
        }
        self.write_manifest(&manifest)?;

        info!(app_id = %entry.app_id, class = %entry.class_name, module = %entry.module, "App saved");
        Ok(entry)
    }

    fn write_manifest(&self, manifest: &Manifest) -> Result<(), IntegrationError> {
        let path = self.manifest_path();
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(manifest)?;
        std::fs::write(&tmp, json).map_err(|e| IntegrationError::io(&tmp, e))?;
        std::fs::rename(&tmp, &path).map_err(|e| IntegrationError::io(&path, e))
    }

    /// Resolve a module name, refusing anything that escapes the apps dir
    fn module_path(&self, module: &str) -> Result<PathBuf, IntegrationError> {
        let relative = Path::new(module);
        let plain = !module.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !plain {
            return Err(IntegrationError::InvalidApp(format!(
                "module path `{}` must be relative to the apps directory",
                module
            )));
        }
        Ok(self.dir.join(relative))
    }
}

/// File stem for an app id: `<slug>_<first 8 hex chars of sha256(app_id)>`
///
/// The slug alone is lossy (`com.discord` and `com_discord` share one), the
/// digest keeps distinct ids in distinct files.
pub fn module_stem(app_id: &str) -> String {
    let slug: String = app_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect();
    let digest = Sha256::digest(app_id.as_bytes());
    format!("{}_{}", slug, &hex::encode(digest)[..8])
}

/// One line per app, as shown to the model
pub fn render_listing(apps: &[AppEntry]) -> String {
    if apps.is_empty() {
        return "No apps available.".to_string();
    }
    apps.iter()
        .map(|app| format!("{} ({}): {}", app.app_id, app.class_name, app.description))
        .collect::<Vec<_>>()
        .join("\n")
}

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde::Deserialize;

/// Supported reference image extensions, in resolution order.
const IMAGE_EXTS: [&str; 4] = ["png", "jpg", "jpeg", "webp"];

/// Sub-spaces scanned in addition to the images root.
const SUB_SPACES: [&str; 2] = ["contacts", "system"];

#[derive(Debug, Default, Deserialize)]
struct AliasFile {
    #[serde(default)]
    aliases: HashMap<String, String>,
}

/// Read-only resolver from a logical reference name to on-disk image paths.
/// Aliases map human-language display names (e.g. a contact's name) onto
/// reference names; numbered `_v2, _v3, …` siblings are device variants.
pub struct AssetStore {
    images_dir: PathBuf,
    aliases: HashMap<String, String>,
    cache: RwLock<HashMap<String, Option<PathBuf>>>,
}

impl AssetStore {
    /// Open the asset store for one handler module directory. A missing
    /// images directory or alias file yields an empty store, not an error.
    pub fn open(module_dir: &Path) -> Self {
        let images_dir = module_dir.join("images");
        let alias_path = images_dir.join("aliases.yaml");
        let aliases = std::fs::read_to_string(&alias_path)
            .ok()
            .and_then(|text| serde_yaml::from_str::<AliasFile>(&text).ok())
            .map(|f| f.aliases)
            .unwrap_or_default();

        if !aliases.is_empty() {
            tracing::debug!(
                dir = %images_dir.display(),
                aliases = aliases.len(),
                "asset aliases loaded"
            );
        }

        Self {
            images_dir,
            aliases,
            cache: RwLock::new(HashMap::new()),
        }
    }

    fn resolve_alias<'a>(&'a self, name: &'a str) -> &'a str {
        self.aliases.get(name).map(String::as_str).unwrap_or(name)
    }

    fn exact_match(&self, dir: &Path, stem: &str) -> Option<PathBuf> {
        for ext in IMAGE_EXTS {
            let candidate = dir.join(format!("{stem}.{ext}"));
            if candidate.is_file() {
                return Some(candidate);
            }
        }
        // Allow names that already carry an extension or a sub-path.
        let direct = dir.join(stem);
        direct.is_file().then_some(direct)
    }

    fn fuzzy_match(&self, dir: &Path, needle: &str) -> Option<PathBuf> {
        let needle = needle.to_lowercase();
        let entries = std::fs::read_dir(dir).ok()?;
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let ext_ok = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| IMAGE_EXTS.contains(&e.to_lowercase().as_str()))
                .unwrap_or(false);
            if !ext_ok {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                if stem.to_lowercase().contains(&needle) {
                    return Some(path);
                }
            }
        }
        None
    }

    fn locate(&self, name: &str) -> Option<PathBuf> {
        let actual = self.resolve_alias(name);
        if !self.images_dir.exists() {
            return None;
        }

        self.exact_match(&self.images_dir, actual)
            .or_else(|| self.exact_match(&self.images_dir.join("contacts"), actual))
            .or_else(|| self.fuzzy_match(&self.images_dir, actual))
            .or_else(|| self.fuzzy_match(&self.images_dir.join("contacts"), actual))
    }

    /// Resolve a logical name to its main image path. Missing references
    /// return `None`, never an error. Idempotent within a run.
    pub fn image_path(&self, name: &str) -> Option<PathBuf> {
        if let Some(cached) = self.cache.read().expect("asset cache lock").get(name) {
            return cached.clone();
        }
        let found = self.locate(name);
        self.cache
            .write()
            .expect("asset cache lock")
            .insert(name.to_string(), found.clone());
        found
    }

    /// Main path followed by any `_v2, _v3, …` variants, in order.
    pub fn image_variants(&self, name: &str) -> Vec<PathBuf> {
        let mut variants = Vec::new();
        if let Some(primary) = self.image_path(name) {
            variants.push(primary);
        }

        let actual = self.resolve_alias(name);
        for i in 2..10 {
            let stem = format!("{actual}_v{i}");
            match self.exact_match(&self.images_dir, &stem) {
                Some(path) => variants.push(path),
                None => break,
            }
        }
        variants
    }

    /// All reference names, including the `system/` and `contacts/`
    /// sub-spaces (prefixed with their sub-space).
    pub fn list_images(&self) -> Vec<String> {
        let mut names = Vec::new();
        collect_stems(&self.images_dir, None, &mut names);
        for sub in SUB_SPACES {
            collect_stems(&self.images_dir.join(sub), Some(sub), &mut names);
        }
        names.sort();
        names
    }

    /// Contact reference names plus alias display names mapped into
    /// `contacts/`.
    pub fn list_contacts(&self) -> Vec<String> {
        let mut contacts = Vec::new();
        collect_stems(&self.images_dir.join("contacts"), None, &mut contacts);
        for (alias, target) in &self.aliases {
            if target.starts_with("contacts/") {
                contacts.push(alias.clone());
            }
        }
        contacts.sort();
        contacts.dedup();
        contacts
    }
}

fn collect_stems(dir: &Path, prefix: Option<&str>, out: &mut Vec<String>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let ext_ok = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| IMAGE_EXTS.contains(&e.to_lowercase().as_str()))
            .unwrap_or(false);
        if !ext_ok {
            continue;
        }
        if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
            match prefix {
                Some(p) => out.push(format!("{p}/{stem}")),
                None => out.push(stem.to_string()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture_store() -> (tempfile::TempDir, AssetStore) {
        let dir = tempfile::tempdir().unwrap();
        let images = dir.path().join("images");
        std::fs::create_dir_all(images.join("contacts")).unwrap();
        std::fs::create_dir_all(images.join("system")).unwrap();

        for name in [
            "wechat_chat_send.png",
            "wechat_chat_send_v2.png",
            "wechat_chat_send_v3.png",
            "wechat_home_button.png",
        ] {
            std::fs::write(images.join(name), b"png").unwrap();
        }
        std::fs::write(images.join("contacts/zhangsan.png"), b"png").unwrap();
        std::fs::write(images.join("system/wechat_home_page.png"), b"png").unwrap();
        std::fs::write(
            images.join("aliases.yaml"),
            "aliases:\n  张三: contacts/zhangsan\n",
        )
        .unwrap();

        let store = AssetStore::open(dir.path());
        (dir, store)
    }

    #[test]
    fn exact_then_variants() {
        let (_dir, store) = fixture_store();
        let variants = store.image_variants("wechat_chat_send");
        assert_eq!(variants.len(), 3);
        assert!(variants[0].ends_with("wechat_chat_send.png"));
        assert!(variants[1].ends_with("wechat_chat_send_v2.png"));
        assert!(variants[2].ends_with("wechat_chat_send_v3.png"));
    }

    #[test]
    fn alias_resolves_into_contacts() {
        let (_dir, store) = fixture_store();
        let path = store.image_path("张三").unwrap();
        assert!(path.ends_with("contacts/zhangsan.png"));
    }

    #[test]
    fn missing_reference_is_none_not_error() {
        let (_dir, store) = fixture_store();
        assert!(store.image_path("nonexistent_button").is_none());
        assert!(store.image_variants("nonexistent_button").is_empty());
    }

    #[test]
    fn resolution_is_idempotent() {
        let (_dir, store) = fixture_store();
        let first = store.image_path("wechat_home_button");
        let second = store.image_path("wechat_home_button");
        assert_eq!(first, second);
    }

    #[test]
    fn fuzzy_match_on_stem() {
        let (_dir, store) = fixture_store();
        let path = store.image_path("HOME_BUTTON").unwrap();
        assert!(path.ends_with("wechat_home_button.png"));
    }

    #[test]
    fn listing_includes_sub_spaces() {
        let (_dir, store) = fixture_store();
        let names = store.list_images();
        assert!(names.contains(&"wechat_home_button".to_string()));
        assert!(names.contains(&"system/wechat_home_page".to_string()));
        assert!(names.contains(&"contacts/zhangsan".to_string()));
        let contacts = store.list_contacts();
        assert!(contacts.contains(&"zhangsan".to_string()));
        assert!(contacts.contains(&"张三".to_string()));
    }
}

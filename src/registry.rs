use std::path::{Path, PathBuf};

use regex::Regex;
use serde::Deserialize;

use crate::errors::AgentResult;

/// Routing floor: below this score the `system` module takes the task.
pub const ROUTE_SCORE_FLOOR: f32 = 0.3;

/// Module metadata loaded from `manifest.yaml`.
#[derive(Debug, Clone, Deserialize)]
pub struct ModuleInfo {
    pub name: String,
    #[serde(default, alias = "package")]
    pub package_id: Option<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub description: String,
}

/// Optional per-module task template, loaded from `tasks.yaml`.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskTemplate {
    pub name: String,
    #[serde(default)]
    pub patterns: Vec<String>,
    #[serde(default)]
    pub variables: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct TaskFile {
    #[serde(default)]
    tasks: Vec<TaskTemplate>,
}

/// One discovered handler module directory.
#[derive(Debug, Clone)]
pub struct ModuleRecord {
    /// Directory name; doubles as the routing id (`wechat`, `system`, …).
    pub id: String,
    pub info: ModuleInfo,
    pub dir: PathBuf,
    pub templates: Vec<TaskTemplate>,
}

/// Discovery and scored routing over the on-disk module layout. Immutable
/// after startup.
pub struct ModuleRegistry {
    modules: Vec<ModuleRecord>,
}

impl ModuleRegistry {
    /// Scan `apps_dir` for sub-directories holding a `manifest.yaml`.
    /// An unreadable module logs and is skipped; an absent root yields an
    /// empty registry.
    pub fn discover(apps_dir: &Path) -> AgentResult<Self> {
        let mut modules = Vec::new();
        let entries = match std::fs::read_dir(apps_dir) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(dir = %apps_dir.display(), error = %e, "apps directory not readable");
                return Ok(Self { modules });
            }
        };

        let mut dirs: Vec<PathBuf> = entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .collect();
        dirs.sort();

        for dir in dirs {
            let manifest = dir.join("manifest.yaml");
            if !manifest.is_file() {
                continue;
            }
            let id = match dir.file_name().and_then(|n| n.to_str()) {
                Some(name) if !name.starts_with('_') => name.to_string(),
                _ => continue,
            };
            match load_module(&id, &dir, &manifest) {
                Ok(record) => {
                    tracing::info!(module = %record.id, name = %record.info.name, "module registered");
                    modules.push(record);
                }
                Err(e) => {
                    tracing::warn!(module = %id, error = %e, "failed to load module");
                }
            }
        }

        tracing::info!(count = modules.len(), "module discovery complete");
        Ok(Self { modules })
    }

    pub fn get(&self, id: &str) -> Option<&ModuleRecord> {
        self.modules.iter().find(|m| m.id == id)
    }

    pub fn list(&self) -> &[ModuleRecord] {
        &self.modules
    }

    /// Score every module against the utterance; fall back to `system`
    /// (or the first module) below the floor.
    pub fn route(&self, utterance: &str) -> Option<(&ModuleRecord, f32)> {
        let mut best: Option<(&ModuleRecord, f32)> = None;
        for module in &self.modules {
            let score = match_score(module, utterance);
            if best.map(|(_, s)| score > s).unwrap_or(true) {
                best = Some((module, score));
            }
        }

        match best {
            Some((module, score)) if score >= ROUTE_SCORE_FLOOR => Some((module, score)),
            _ => {
                let fallback = self.get("system").or_else(|| self.modules.first())?;
                Some((fallback, best.map(|(_, s)| s).unwrap_or(0.0)))
            }
        }
    }
}

fn load_module(id: &str, dir: &Path, manifest: &Path) -> AgentResult<ModuleRecord> {
    let info: ModuleInfo = serde_yaml::from_str(&std::fs::read_to_string(manifest)?)?;
    let templates = match std::fs::read_to_string(dir.join("tasks.yaml")) {
        Ok(text) => serde_yaml::from_str::<TaskFile>(&text)?.tasks,
        Err(_) => Vec::new(),
    };
    Ok(ModuleRecord {
        id: id.to_string(),
        info,
        dir: dir.to_path_buf(),
        templates,
    })
}

/// Scored match of one module against an utterance:
/// task-pattern hit 0.5, keyword hits 0.1 each (+0.2 extra for an exact
/// match) capped at 0.4, package id literally present 0.1.
pub fn match_score(module: &ModuleRecord, utterance: &str) -> f32 {
    let mut score = 0.0f32;
    let utterance_lower = utterance.to_lowercase();

    'templates: for template in &module.templates {
        for pattern in &template.patterns {
            match Regex::new(&format!("(?i){pattern}")) {
                Ok(re) => {
                    if re.is_match(utterance) {
                        score += 0.5;
                        break 'templates;
                    }
                }
                Err(_) => {
                    if utterance.contains(pattern.as_str()) {
                        score += 0.5;
                        break 'templates;
                    }
                }
            }
        }
    }

    let mut keyword_hits = 0u32;
    for keyword in &module.info.keywords {
        let keyword_lower = keyword.to_lowercase();
        if keyword_lower.is_empty() {
            continue;
        }
        if utterance_lower.contains(&keyword_lower) {
            keyword_hits += 1;
            if keyword_lower == utterance_lower {
                keyword_hits += 2;
            }
        }
    }
    if keyword_hits > 0 {
        score += (keyword_hits as f32 * 0.1).min(0.4);
    }

    if let Some(package) = &module.info.package_id {
        if !package.is_empty() && utterance_lower.contains(&package.to_lowercase()) {
            score += 0.1;
        }
    }

    score.min(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture_registry() -> (tempfile::TempDir, ModuleRegistry) {
        let root = tempfile::tempdir().unwrap();
        let wechat = root.path().join("wechat");
        std::fs::create_dir_all(&wechat).unwrap();
        std::fs::write(
            wechat.join("manifest.yaml"),
            "name: 微信\npackage: com.tencent.mm\nkeywords: [微信, 消息, 朋友圈, wechat]\ndescription: messaging\n",
        )
        .unwrap();
        std::fs::write(
            wechat.join("tasks.yaml"),
            "tasks:\n  - name: send_message\n    patterns: [\"发消息\", \"发微信\"]\n    variables: [contact, message]\n",
        )
        .unwrap();

        let system = root.path().join("system");
        std::fs::create_dir_all(&system).unwrap();
        std::fs::write(
            system.join("manifest.yaml"),
            "name: 系统\nkeywords: [设置, 电话]\ndescription: system fallback\n",
        )
        .unwrap();

        let registry = ModuleRegistry::discover(root.path()).unwrap();
        (root, registry)
    }

    #[test]
    fn discovery_finds_manifest_modules() {
        let (_root, registry) = fixture_registry();
        assert_eq!(registry.list().len(), 2);
        assert!(registry.get("wechat").is_some());
        assert!(registry.get("system").is_some());
    }

    #[test]
    fn pattern_and_keyword_route_to_wechat() {
        let (_root, registry) = fixture_registry();
        let (module, score) = registry.route("给张三发微信说你好").unwrap();
        assert_eq!(module.id, "wechat");
        assert!(score >= 0.5, "score={score}");
    }

    #[test]
    fn low_score_falls_back_to_system() {
        let (_root, registry) = fixture_registry();
        let (module, score) = registry.route("随便做点什么").unwrap();
        assert_eq!(module.id, "system");
        assert!(score < ROUTE_SCORE_FLOOR);
    }

    #[test]
    fn keyword_score_caps_at_point_four() {
        let (_root, registry) = fixture_registry();
        let module = registry.get("wechat").unwrap();
        // No template pattern matches, many keywords do.
        let score = match_score(module, "微信 消息 朋友圈 wechat 微信 消息");
        assert!(score <= 0.5, "score={score}");
    }

    #[test]
    fn package_id_adds_tenth() {
        let (_root, registry) = fixture_registry();
        let module = registry.get("wechat").unwrap();
        let without = match_score(module, "做点什么");
        let with = match_score(module, "打开 com.tencent.mm 做点什么");
        assert!((with - without - 0.1).abs() < 1e-6);
    }
}

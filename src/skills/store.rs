use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::errors::{DeskPilotError, DeskPilotResult};

/// A persisted skill: one markdown file, first non-empty line is the title,
/// the rest is the body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Skill {
    pub id: String,
    pub title: String,
    pub body: String,
    #[serde(skip)]
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillSummary {
    pub id: String,
    pub title: String,
}

/// Directory-backed catalog of skills. The cache and the backing files are
/// owned exclusively by this store; all access goes through the inner lock
/// since refreshes can race reads and writes from multiple callers.
pub struct SkillStore {
    dir: PathBuf,
    skills: Mutex<BTreeMap<String, Skill>>,
}

impl SkillStore {
    pub fn new(dir: impl Into<PathBuf>) -> DeskPilotResult<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        let store = Self {
            dir,
            skills: Mutex::new(BTreeMap::new()),
        };
        store.refresh()?;
        Ok(store)
    }

    /// Rescans the directory and rebuilds the cache wholesale.
    pub fn refresh(&self) -> DeskPilotResult<()> {
        let mut paths: Vec<PathBuf> = std::fs::read_dir(&self.dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().map_or(false, |ext| ext == "md"))
            .collect();
        paths.sort();

        let mut skills = BTreeMap::new();
        for path in paths {
            match load_skill(&path) {
                Some(skill) => {
                    skills.insert(skill.id.clone(), skill);
                }
                None => tracing::warn!(path = %path.display(), "skipping unreadable skill file"),
            }
        }

        let count = skills.len();
        *self.skills.lock().expect("skill store lock poisoned") = skills;
        tracing::debug!(count, dir = %self.dir.display(), "skill catalog refreshed");
        Ok(())
    }

    pub fn list(&self) -> Vec<SkillSummary> {
        self.skills
            .lock()
            .expect("skill store lock poisoned")
            .values()
            .map(|s| SkillSummary {
                id: s.id.clone(),
                title: s.title.clone(),
            })
            .collect()
    }

    pub fn get(&self, skill_id: &str) -> DeskPilotResult<Skill> {
        self.skills
            .lock()
            .expect("skill store lock poisoned")
            .get(skill_id)
            .cloned()
            .ok_or_else(|| DeskPilotError::NotFound(format!("skill '{skill_id}'")))
    }

    /// Case-insensitive, trim-normalized title lookup.
    pub fn get_by_title(&self, title: &str) -> Option<Skill> {
        let normalized = title.trim().to_lowercase();
        self.skills
            .lock()
            .expect("skill store lock poisoned")
            .values()
            .find(|s| s.title.trim().to_lowercase() == normalized)
            .cloned()
    }

    /// Creates or updates a skill. An explicit id overwrites its file;
    /// otherwise a unique slug is derived from the title.
    pub fn upsert(
        &self,
        title: &str,
        body: &str,
        skill_id: Option<&str>,
    ) -> DeskPilotResult<Skill> {
        let title = title.trim();
        let body = body.trim_matches('\n');
        if title.is_empty() {
            return Err(DeskPilotError::Skills("title is required".into()));
        }

        let mut skills = self.skills.lock().expect("skill store lock poisoned");
        let (id, path) = match skill_id {
            Some(id) => (id.to_string(), self.dir.join(format!("{id}.md"))),
            None => {
                let path = unique_path(&self.dir, &slugify(title));
                let id = path
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "skill".to_string());
                (id, path)
            }
        };

        std::fs::write(&path, compose_file(title, body))?;

        let skill = Skill {
            id: id.clone(),
            title: title.to_string(),
            body: body.trim().to_string(),
            path,
        };
        skills.insert(id, skill.clone());
        Ok(skill)
    }

    /// Removes both the cache entry and the backing file.
    pub fn delete(&self, skill_id: &str) -> DeskPilotResult<()> {
        let mut skills = self.skills.lock().expect("skill store lock poisoned");
        let skill = skills
            .remove(skill_id)
            .ok_or_else(|| DeskPilotError::NotFound(format!("skill '{skill_id}'")))?;
        if skill.path.exists() {
            std::fs::remove_file(&skill.path)?;
        }
        Ok(())
    }
}

fn load_skill(path: &Path) -> Option<Skill> {
    let data = std::fs::read_to_string(path).ok()?;
    let stem = path.file_stem()?.to_string_lossy().into_owned();
    let (title, body) = parse_markdown(&data, &stem);
    Some(Skill {
        id: stem,
        title,
        body,
        path: path.to_path_buf(),
    })
}

/// First non-empty line, markdown leader stripped, is the title; the rest is
/// the body. The title falls back to the file stem so it is never empty.
fn parse_markdown(text: &str, fallback_title: &str) -> (String, String) {
    let lines: Vec<&str> = text.lines().collect();
    for (idx, raw) in lines.iter().enumerate() {
        let stripped = raw.trim();
        if !stripped.is_empty() {
            let title = stripped.trim_start_matches(['#', ' ']).trim();
            let title = if title.is_empty() { fallback_title } else { title };
            let body = lines[idx + 1..].join("\n").trim().to_string();
            return (title.to_string(), body);
        }
    }
    (fallback_title.to_string(), text.trim().to_string())
}

fn unique_path(dir: &Path, slug: &str) -> PathBuf {
    let base = if slug.is_empty() { "skill" } else { slug };
    let mut path = dir.join(format!("{base}.md"));
    let mut counter = 1;
    while path.exists() {
        path = dir.join(format!("{base}-{counter}.md"));
        counter += 1;
    }
    path
}

fn compose_file(title: &str, body: &str) -> String {
    if body.is_empty() {
        format!("# {title}\n")
    } else {
        format!("# {title}\n\n{}\n", body.trim_end())
    }
}

/// Keep unicode letters/digits (e.g. Chinese) so filenames remain identifiable.
fn slugify(text: &str) -> String {
    let mut slug = String::new();
    let mut last_dash = false;
    for ch in text.trim().to_lowercase().chars() {
        if ch.is_alphanumeric() || ch == '_' {
            slug.push(ch);
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
    }
    let slug = slug.trim_matches(['-', '_']).to_string();
    if slug.is_empty() {
        "skill".to_string()
    } else {
        slug
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, SkillStore) {
        let dir = TempDir::new().expect("tempdir");
        let store = SkillStore::new(dir.path()).expect("store");
        (dir, store)
    }

    #[test]
    fn upsert_round_trips_title_and_body() {
        let (_dir, store) = store();
        let skill = store
            .upsert("Open Settings", "1. Click the gear icon\n2. Wait", None)
            .unwrap();
        let loaded = store.get(&skill.id).unwrap();
        assert_eq!(loaded.title, "Open Settings");
        assert_eq!(loaded.body, "1. Click the gear icon\n2. Wait");
    }

    #[test]
    fn slug_collisions_get_numeric_suffixes() {
        let (_dir, store) = store();
        let a = store.upsert("Export Report", "a", None).unwrap();
        let b = store.upsert("Export Report", "b", None).unwrap();
        assert_eq!(a.id, "export-report");
        assert_eq!(b.id, "export-report-1");
    }

    #[test]
    fn explicit_id_overwrites() {
        let (_dir, store) = store();
        let skill = store.upsert("Old Title", "old", None).unwrap();
        let updated = store
            .upsert("New Title", "new", Some(&skill.id))
            .unwrap();
        assert_eq!(updated.id, skill.id);
        assert_eq!(store.get(&skill.id).unwrap().title, "New Title");
        assert_eq!(store.list().len(), 1);
    }

    #[test]
    fn refresh_is_idempotent() {
        let (_dir, store) = store();
        store.upsert("A", "body a", None).unwrap();
        store.upsert("B", "", None).unwrap();
        store.refresh().unwrap();
        let first = store.list();
        store.refresh().unwrap();
        let second = store.list();
        assert_eq!(first.len(), 2);
        assert_eq!(
            first.iter().map(|s| (&s.id, &s.title)).collect::<Vec<_>>(),
            second.iter().map(|s| (&s.id, &s.title)).collect::<Vec<_>>()
        );
    }

    #[test]
    fn delete_removes_file_and_cache_entry() {
        let (_dir, store) = store();
        let skill = store.upsert("Trash Me", "", None).unwrap();
        let path = skill.path.clone();
        store.delete(&skill.id).unwrap();
        assert!(!path.exists());
        assert!(matches!(
            store.get(&skill.id),
            Err(DeskPilotError::NotFound(_))
        ));
        assert!(matches!(
            store.delete(&skill.id),
            Err(DeskPilotError::NotFound(_))
        ));
    }

    #[test]
    fn title_falls_back_to_file_stem() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("bare.md"), "\n\n").unwrap();
        let store = SkillStore::new(dir.path()).unwrap();
        let skill = store.get("bare").unwrap();
        assert_eq!(skill.title, "bare");
    }

    #[test]
    fn title_lookup_is_case_insensitive() {
        let (_dir, store) = store();
        store.upsert("Send Email", "steps", None).unwrap();
        assert!(store.get_by_title("  send email ").is_some());
        assert!(store.get_by_title("no such skill").is_none());
    }
}

use std::sync::{Arc, Mutex};

use regex::RegexBuilder;
use serde::{Deserialize, Serialize};

use crate::skills::store::{Skill, SkillStore};

/// Outcome of one in-band skill request, attached to the current turn only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillOutput {
    pub title: String,
    pub body: String,
    pub available: bool,
}

/// Handles skill catalog caching and lookups for the conversation engine.
pub struct SkillInjector {
    store: Option<Arc<SkillStore>>,
    catalog: Mutex<Option<String>>,
    request_re: regex::Regex,
}

impl SkillInjector {
    pub fn new(store: Option<Arc<SkillStore>>) -> Self {
        let request_re = RegexBuilder::new(r"<skill>(.*?)</skill>")
            .case_insensitive(true)
            .dot_matches_new_line(true)
            .build()
            .expect("valid skill pattern");
        Self {
            store,
            catalog: Mutex::new(None),
            request_re,
        }
    }

    /// Title-only catalog listing, cached until `reset_cache`.
    pub fn catalog_section(&self) -> String {
        let mut cached = self.catalog.lock().expect("catalog lock poisoned");
        if let Some(section) = cached.as_ref() {
            return section.clone();
        }
        let section = match &self.store {
            Some(store) => {
                let summaries = store.list();
                if summaries.is_empty() {
                    "(no skills available)".to_string()
                } else {
                    summaries
                        .iter()
                        .map(|s| format!("- {}", s.title))
                        .collect::<Vec<_>>()
                        .join("\n")
                }
            }
            None => "(no skills available)".to_string(),
        };
        *cached = Some(section.clone());
        section
    }

    /// All in-band skill references, case-insensitive, across multiline bodies.
    pub fn extract_requests(&self, response: &str) -> Vec<String> {
        if response.is_empty() {
            return Vec::new();
        }
        self.request_re
            .captures_iter(response)
            .filter_map(|cap| {
                let reference = cap[1].trim();
                if reference.is_empty() {
                    None
                } else {
                    Some(reference.to_string())
                }
            })
            .collect()
    }

    /// Resolves one reference: id first, then case-insensitive title. A miss is
    /// never an error; the loop continues with a polite notice.
    pub fn build_skill_reply(&self, reference: &str) -> (String, bool) {
        match self.lookup(reference) {
            Some(skill) => (format_skill_message(&skill), true),
            None => (
                format!("Skill \"{reference}\" is not available. Continue the task without it."),
                false,
            ),
        }
    }

    fn lookup(&self, reference: &str) -> Option<Skill> {
        let store = self.store.as_ref()?;
        let reference = reference.trim();
        if reference.is_empty() {
            return None;
        }
        store
            .get(reference)
            .ok()
            .or_else(|| store.get_by_title(reference))
    }

    /// Clears cached catalog data. Call when the agent resets.
    pub fn reset_cache(&self) {
        *self.catalog.lock().expect("catalog lock poisoned") = None;
    }
}

fn format_skill_message(skill: &Skill) -> String {
    let body = skill.body.trim();
    let body = if body.is_empty() {
        "(this skill has no detailed steps yet)"
    } else {
        body
    };
    format!(
        "Here is the stored skill \"{}\". Treat the following steps as a reliable example:\n{body}",
        skill.title
    )
}

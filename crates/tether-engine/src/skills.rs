use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::{Captures, Regex};
use tracing::{info, warn};

const SKILL_FILE: &str = "SKILL.md";

/// Relative resource paths a skill body may point at, after `python ` or a backtick.
static RESOURCE_PATH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(python\s+|`)((?:scripts|examples|templates|reference)/[^\s`\)]+)")
        .expect("resource path pattern is valid")
});

/// A skill loaded from a `SKILL.md` file.
#[derive(Clone, Debug)]
pub struct Skill {
    pub name: String,
    pub description: String,
    /// Body after the frontmatter, with resource paths made absolute.
    pub content: String,
    pub path: PathBuf,
}

/// Discovers and holds the skills under one directory tree.
#[derive(Debug, Default)]
pub struct SkillLoader {
    skills: Vec<Skill>,
    by_name: HashMap<String, usize>,
}

impl SkillLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Walk `dir` recursively and load every `SKILL.md`.
    ///
    /// A missing directory yields an empty loader. When two skills share a
    /// name the first one found wins.
    pub fn discover(dir: &Path) -> Self {
        let mut loader = Self::new();
        if !dir.is_dir() {
            warn!(dir = %dir.display(), "skills directory does not exist");
            return loader;
        }

        let mut files = Vec::new();
        find_skill_files(dir, &mut files);

        for path in files {
            let Some(skill) = load_skill(&path) else {
                continue;
            };
            loader.insert(skill);
        }

        info!(count = loader.count(), dir = %dir.display(), "skills discovered");
        loader
    }

    fn insert(&mut self, skill: Skill) {
        if self.by_name.contains_key(&skill.name) {
            warn!(
                skill = %skill.name,
                path = %skill.path.display(),
                "duplicate skill name, keeping first occurrence"
            );
            return;
        }
        self.by_name.insert(skill.name.clone(), self.skills.len());
        self.skills.push(skill);
    }

    pub fn get(&self, name: &str) -> Option<&Skill> {
        self.by_name.get(name).map(|&i| &self.skills[i])
    }

    /// Skill names in discovery order.
    pub fn names(&self) -> Vec<&str> {
        self.skills.iter().map(|s| s.name.as_str()).collect()
    }

    pub fn count(&self) -> usize {
        self.skills.len()
    }

    pub fn is_empty(&self) -> bool {
        self.skills.is_empty()
    }

    /// Section listing the available skills, for the system prompt.
    /// Empty when there are no skills.
    pub fn metadata_prompt(&self) -> String {
        if self.skills.is_empty() {
            return String::new();
        }

        let mut parts = vec![
            "## Available Skills\n".to_string(),
            "You have access to specialized skills. Each skill provides expert guidance for specific tasks.\n".to_string(),
            "Load a skill's full content using get_skill tool when needed.\n".to_string(),
        ];
        for skill in &self.skills {
            parts.push(format!("- `{}`: {}", skill.name, skill.description));
        }
        parts.join("\n")
    }
}

fn find_skill_files(dir: &Path, out: &mut Vec<PathBuf>) {
    let entries = match std::fs::read_dir(dir) {
        Ok(e) => e,
        Err(e) => {
            warn!(dir = %dir.display(), error = %e, "cannot read skills directory");
            return;
        }
    };

    // Sorted so discovery order (and duplicate resolution) is stable.
    let mut paths: Vec<PathBuf> = entries.flatten().map(|e| e.path()).collect();
    paths.sort();

    for path in paths {
        if path.is_dir() {
            find_skill_files(&path, out);
        } else if path.file_name().is_some_and(|n| n == SKILL_FILE) {
            out.push(path);
        }
    }
}

fn load_skill(path: &Path) -> Option<Skill> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw.replace("\r\n", "\n"),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to read skill");
            return None;
        }
    };

    let Some((frontmatter, body)) = split_frontmatter(&raw) else {
        warn!(path = %path.display(), "skill is missing valid frontmatter");
        return None;
    };

    let (name, description) = parse_frontmatter(frontmatter);
    let (Some(name), Some(description)) = (name, description) else {
        warn!(path = %path.display(), "skill frontmatter needs both name and description");
        return None;
    };

    let skill_dir = path.parent().unwrap_or(Path::new("."));
    Some(Skill {
        name,
        description,
        content: resolve_resource_paths(body, skill_dir),
        path: path.to_path_buf(),
    })
}

/// Split `---\n<frontmatter>\n---\n<body>`.
fn split_frontmatter(raw: &str) -> Option<(&str, &str)> {
    let after_start = raw.strip_prefix("---\n")?;
    let end = after_start.find("\n---")?;
    let rest = &after_start[end + 4..];
    let body = match rest.strip_prefix('\n') {
        Some(body) => body,
        None if rest.is_empty() => rest,
        // `---` followed by something else is not a closing fence
        None => return None,
    };
    Some((&after_start[..end], body))
}

fn parse_frontmatter(yaml: &str) -> (Option<String>, Option<String>) {
    let mut name = None;
    let mut description = None;
    for line in yaml.lines() {
        let line = line.trim();
        if let Some(value) = line.strip_prefix("name:") {
            name = non_empty(unquote(value));
        } else if let Some(value) = line.strip_prefix("description:") {
            description = non_empty(unquote(value));
        }
    }
    (name, description)
}

fn unquote(value: &str) -> String {
    let v = value.trim();
    let v = v
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .or_else(|| v.strip_prefix('\'').and_then(|s| s.strip_suffix('\'')))
        .unwrap_or(v);
    v.to_string()
}

fn non_empty(s: String) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

/// Rewrite relative resource references to absolute paths when the file exists.
fn resolve_resource_paths(content: &str, skill_dir: &Path) -> String {
    RESOURCE_PATH
        .replace_all(content, |caps: &Captures<'_>| {
            let prefix = &caps[1];
            let rel = &caps[2];
            let abs = skill_dir.join(rel);
            if abs.exists() {
                let abs = abs.canonicalize().unwrap_or(abs);
                format!("{prefix}{}", abs.display())
            } else {
                caps[0].to_string()
            }
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_skill(root: &Path, dir: &str, body: &str) -> PathBuf {
        let dir = root.join(dir);
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(SKILL_FILE);
        fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn discovers_nested_skills() {
        let tmp = tempfile::tempdir().unwrap();
        write_skill(
            tmp.path(),
            "pdf",
            "---\nname: pdf\ndescription: \"Work with PDF files\"\n---\nUse pdftotext.",
        );
        write_skill(
            tmp.path(),
            "office/xlsx",
            "---\nname: xlsx\ndescription: Spreadsheets\n---\nUse openpyxl.",
        );

        let loader = SkillLoader::discover(tmp.path());
        assert_eq!(loader.count(), 2);
        assert_eq!(loader.names(), vec!["xlsx", "pdf"]);

        let pdf = loader.get("pdf").unwrap();
        assert_eq!(pdf.description, "Work with PDF files");
        assert_eq!(pdf.content, "Use pdftotext.");
    }

    #[test]
    fn missing_directory_is_empty() {
        let loader = SkillLoader::discover(Path::new("/nonexistent/skills"));
        assert!(loader.is_empty());
        assert_eq!(loader.metadata_prompt(), "");
    }

    #[test]
    fn skips_files_without_frontmatter_or_fields() {
        let tmp = tempfile::tempdir().unwrap();
        write_skill(tmp.path(), "a", "Just text, no frontmatter.");
        write_skill(tmp.path(), "b", "---\nname: b\n---\nNo description.");
        write_skill(tmp.path(), "c", "---\nname: c\ndescription: never closed\n");
        write_skill(tmp.path(), "d", "---\nname: d\ndescription: ok\n---\nbody");

        let loader = SkillLoader::discover(tmp.path());
        assert_eq!(loader.names(), vec!["d"]);
    }

    #[test]
    fn only_skill_md_files_count() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(
            tmp.path().join("README.md"),
            "---\nname: readme\ndescription: no\n---\n",
        )
        .unwrap();
        let loader = SkillLoader::discover(tmp.path());
        assert!(loader.is_empty());
    }

    #[test]
    fn first_duplicate_wins() {
        let tmp = tempfile::tempdir().unwrap();
        write_skill(tmp.path(), "a", "---\nname: dup\ndescription: first\n---\none");
        write_skill(tmp.path(), "b", "---\nname: dup\ndescription: second\n---\ntwo");

        let loader = SkillLoader::discover(tmp.path());
        assert_eq!(loader.count(), 1);
        assert_eq!(loader.get("dup").unwrap().description, "first");
    }

    #[test]
    fn rewrites_existing_resource_paths() {
        let tmp = tempfile::tempdir().unwrap();
        let skill_dir = tmp.path().join("pdf");
        fs::create_dir_all(skill_dir.join("scripts")).unwrap();
        fs::write(skill_dir.join("scripts/extract.py"), "print()").unwrap();
        write_skill(
            tmp.path(),
            "pdf",
            "---\nname: pdf\ndescription: d\n---\nRun python scripts/extract.py or `scripts/missing.py`.",
        );

        let loader = SkillLoader::discover(tmp.path());
        let content = &loader.get("pdf").unwrap().content;
        let abs = skill_dir.join("scripts/extract.py").canonicalize().unwrap();
        assert!(
            content.contains(&format!("python {}", abs.display())),
            "got: {content}"
        );
        assert!(content.contains("`scripts/missing.py`"));
    }

    #[test]
    fn metadata_prompt_lists_skills() {
        let tmp = tempfile::tempdir().unwrap();
        write_skill(tmp.path(), "pdf", "---\nname: pdf\ndescription: PDF tools\n---\nbody");

        let prompt = SkillLoader::discover(tmp.path()).metadata_prompt();
        assert!(prompt.starts_with("## Available Skills"));
        assert!(prompt.contains("get_skill"));
        assert!(prompt.contains("- `pdf`: PDF tools"));
    }

    #[test]
    fn crlf_files_parse() {
        let tmp = tempfile::tempdir().unwrap();
        write_skill(tmp.path(), "w", "---\r\nname: win\r\ndescription: d\r\n---\r\nbody\r\n");
        let loader = SkillLoader::discover(tmp.path());
        assert_eq!(loader.get("win").unwrap().content, "body\n");
    }
}

//! Flat configuration-file model for the target daemon.
//!
//! Mirrors the accessor shape of `istgt_core.c`'s `istgt_get_val`/
//! `istgt_get_nval`/`istgt_get_nmval` family: a document is an ordered list of
//! named sections, each carrying an ordered list of `key -> values` items. A
//! key may repeat within a section (e.g. multiple `Portal` lines); callers
//! pick an occurrence with `idx`.
//!
//! The on-disk format is a line-oriented `SectionType "tag"` block followed
//! by `{ ... }`-delimited `key val1 val2 ...` lines, e.g.:
//!
//! ```text
//! Global {
//!   NodeBase iqn.2007-09.jp.ne.peach.istgt
//!   MaxSessions 32
//! }
//!
//! PortalGroup "pg1" {
//!   Portal DA1 0.0.0.0:3260
//! }
//! ```

use crate::error::{IscsiError, ScsiResult};
use std::fmt;
use std::path::Path;

/// The kind of a configuration section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SectionType {
    Global,
    PortalGroup,
    InitiatorGroup,
    LogicalUnit,
    AuthGroup,
    UnitControl,
}

impl fmt::Display for SectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SectionType::Global => "Global",
            SectionType::PortalGroup => "PortalGroup",
            SectionType::InitiatorGroup => "InitiatorGroup",
            SectionType::LogicalUnit => "LogicalUnit",
            SectionType::AuthGroup => "AuthGroup",
            SectionType::UnitControl => "UnitControl",
        };
        f.write_str(s)
    }
}

impl SectionType {
    fn parse(name: &str) -> ScsiResult<Self> {
        match name {
            "Global" => Ok(SectionType::Global),
            "PortalGroup" => Ok(SectionType::PortalGroup),
            "InitiatorGroup" => Ok(SectionType::InitiatorGroup),
            "LogicalUnit" => Ok(SectionType::LogicalUnit),
            "AuthGroup" => Ok(SectionType::AuthGroup),
            "UnitControl" => Ok(SectionType::UnitControl),
            other => Err(IscsiError::Config(format!("unknown section type {other:?}"))),
        }
    }
}

/// A single `key val1 val2 ...` line within a section.
#[derive(Debug, Clone)]
pub struct ConfigItem {
    pub key: String,
    pub values: Vec<String>,
}

/// One `SectionType "tag" { ... }` block.
#[derive(Debug, Clone)]
pub struct ConfigSection {
    pub section_type: SectionType,
    pub tag: String,
    pub items: Vec<ConfigItem>,
}

impl ConfigSection {
    /// The `idx`-th (0-based) occurrence of `key`, as its raw value list.
    fn nth_item(&self, key: &str, idx: usize) -> Option<&ConfigItem> {
        self.items.iter().filter(|i| i.key == key).nth(idx)
    }

    /// `get_value`: the first value of the `idx`-th occurrence of `key`.
    pub fn get_value(&self, key: &str, idx: usize) -> Option<&str> {
        self.nth_item(key, idx)?.values.first().map(String::as_str)
    }

    /// `get_value_m`: the `sub_idx`-th value of the `idx`-th occurrence of `key`.
    pub fn get_value_m(&self, key: &str, idx: usize, sub_idx: usize) -> Option<&str> {
        self.nth_item(key, idx)?.values.get(sub_idx).map(String::as_str)
    }

    /// Every occurrence of `key`, each as its full value list.
    pub fn all_values(&self, key: &str) -> Vec<&[String]> {
        self.items
            .iter()
            .filter(|i| i.key == key)
            .map(|i| i.values.as_slice())
            .collect()
    }

    pub fn get_int(&self, key: &str, idx: usize, default: i64) -> ScsiResult<i64> {
        match self.get_value(key, idx) {
            Some(v) => v
                .parse()
                .map_err(|_| IscsiError::Config(format!("{key} is not an integer: {v:?}"))),
            None => Ok(default),
        }
    }

    pub fn get_bool(&self, key: &str, idx: usize, default: bool) -> ScsiResult<bool> {
        match self.get_value(key, idx) {
            Some("Yes") | Some("yes") => Ok(true),
            Some("No") | Some("no") => Ok(false),
            Some(v) => Err(IscsiError::Config(format!("{key} is not Yes/No: {v:?}"))),
            None => Ok(default),
        }
    }
}

/// A parsed configuration file: an ordered list of sections.
#[derive(Debug, Clone, Default)]
pub struct ConfigDocument {
    pub sections: Vec<ConfigSection>,
}

impl ConfigDocument {
    pub fn parse(text: &str) -> ScsiResult<Self> {
        let mut sections = Vec::new();
        let mut lines = text.lines().peekable();

        while let Some(raw) = lines.next() {
            let line = strip_comment(raw).trim();
            if line.is_empty() {
                continue;
            }

            let (header, opened_here) = if let Some(stripped) = line.strip_suffix('{') {
                (stripped.trim().to_string(), true)
            } else {
                (line.to_string(), false)
            };

            let mut parts = header.splitn(2, char::is_whitespace);
            let type_name = parts.next().unwrap_or_default();
            let section_type = SectionType::parse(type_name)?;
            let tag = parts
                .next()
                .map(|s| s.trim().trim_matches('"').to_string())
                .unwrap_or_default();

            if !opened_here {
                // Section header and `{` may be on separate lines.
                let brace_line = lines
                    .next()
                    .ok_or_else(|| IscsiError::Config(format!("{type_name} section missing {{")))?;
                if strip_comment(brace_line).trim() != "{" {
                    return Err(IscsiError::Config(format!(
                        "expected '{{' after {type_name} section header"
                    )));
                }
            }

            let mut items = Vec::new();
            loop {
                let body_line = lines
                    .next()
                    .ok_or_else(|| IscsiError::Config(format!("{type_name} section missing }}")))?;
                let body = strip_comment(body_line).trim();
                if body.is_empty() {
                    continue;
                }
                if body == "}" {
                    break;
                }
                let mut tokens = body.split_whitespace();
                let key = tokens
                    .next()
                    .ok_or_else(|| IscsiError::Config("empty config item".into()))?
                    .to_string();
                let values = tokens.map(str::to_string).collect();
                items.push(ConfigItem { key, values });
            }

            sections.push(ConfigSection {
                section_type,
                tag,
                items,
            });
        }

        Ok(ConfigDocument { sections })
    }

    pub fn load(path: &Path) -> ScsiResult<Self> {
        let text = std::fs::read_to_string(path).map_err(IscsiError::Io)?;
        Self::parse(&text)
    }

    /// All sections of a given type, in file order.
    pub fn sections_of(&self, section_type: SectionType) -> impl Iterator<Item = &ConfigSection> {
        self.sections
            .iter()
            .filter(move |s| s.section_type == section_type)
    }

    /// The single `Global` section, if present.
    pub fn global(&self) -> Option<&ConfigSection> {
        self.sections_of(SectionType::Global).next()
    }
}

fn strip_comment(line: &str) -> &str {
    match line.find('#') {
        Some(idx) => &line[..idx],
        None => line,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_global_section() {
        let doc = ConfigDocument::parse(
            "Global {\n  NodeBase iqn.2007-09.jp.ne.peach.istgt\n  MaxSessions 32\n}\n",
        )
        .unwrap();
        let global = doc.global().unwrap();
        assert_eq!(global.get_value("NodeBase", 0), Some("iqn.2007-09.jp.ne.peach.istgt"));
        assert_eq!(global.get_int("MaxSessions", 0, 0).unwrap(), 32);
    }

    #[test]
    fn parses_multiple_portal_lines() {
        let doc = ConfigDocument::parse(
            "PortalGroup \"pg1\" {\n  Portal DA1 0.0.0.0:3260\n  Portal DA2 0.0.0.0:3261\n}\n",
        )
        .unwrap();
        let pg = doc.sections_of(SectionType::PortalGroup).next().unwrap();
        assert_eq!(pg.tag, "pg1");
        assert_eq!(pg.get_value_m("Portal", 1, 1), Some("0.0.0.0:3261"));
        assert_eq!(pg.all_values("Portal").len(), 2);
    }

    #[test]
    fn ignores_comments_and_blank_lines() {
        let doc = ConfigDocument::parse(
            "# comment\nGlobal {\n  # another comment\n  Timeout 60\n\n}\n",
        )
        .unwrap();
        assert_eq!(doc.global().unwrap().get_int("Timeout", 0, 0).unwrap(), 60);
    }

    #[test]
    fn rejects_unknown_section_type() {
        let err = ConfigDocument::parse("Bogus {\n}\n").unwrap_err();
        assert!(matches!(err, IscsiError::Config(_)));
    }

    #[test]
    fn defaults_apply_when_key_absent() {
        let doc = ConfigDocument::parse("Global {\n}\n").unwrap();
        let global = doc.global().unwrap();
        assert_eq!(global.get_int("MaxOutstandingR2T", 0, 16).unwrap(), 16);
        assert!(global.get_bool("InitialR2T", 0, true).unwrap());
    }
}

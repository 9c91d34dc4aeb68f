use std::fs;
use std::path::Path;

use anyhow::{Context, Result};

use crate::errors::PalmgrError;
use crate::storage::write_atomic;

const DIRECTIVE_PREFIX: &str = "OptionSettings=";

/// Known-good document written when the server has never produced one.
pub const DEFAULT_SETTINGS: &str = "[/Script/Pal.PalGameWorldSettings]\nOptionSettings=(Difficulty=None,DayTimeSpeedRate=1.000000,NightTimeSpeedRate=1.000000,ExpRate=1.000000,ServerPlayerMaxNum=32,ServerName=\"Default Palworld Server\",ServerDescription=\"\",AdminPassword=\"\",ServerPassword=\"\",PublicPort=8211,PublicIP=\"\",RCONEnabled=False,RCONPort=25575,bShowPlayerList=True)\n";

/// A `PalWorldSettings.ini` held as raw lines. Exactly one line carries the
/// `OptionSettings=(...)` directive; everything else passes through verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettingsDocument {
    lines: Vec<String>,
    trailing_newline: bool,
}

impl SettingsDocument {
    pub fn parse(content: &str) -> Self {
        Self {
            lines: content.lines().map(str::to_string).collect(),
            trailing_newline: content.ends_with('\n'),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(PalmgrError::NotFound(format!(
                "settings file {}",
                path.display()
            ))
            .into());
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read settings file {}", path.display()))?;
        Ok(Self::parse(&content))
    }

    pub fn render(&self) -> String {
        let mut output = self.lines.join("\n");
        if self.trailing_newline {
            output.push('\n');
        }
        output
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        write_atomic(path, self.render().as_bytes())
            .with_context(|| format!("failed to write settings file {}", path.display()))
    }

    /// Applies `updates` to the directive line and returns the new document.
    ///
    /// Matched keys get the new value, unmatched entries keep their text
    /// (modulo idempotent quote normalization), and leftover updates are
    /// appended in their given order. Everything outside the parentheses is
    /// preserved byte for byte.
    pub fn merge(&self, updates: &[(String, String)]) -> Result<Self, PalmgrError> {
        for (key, value) in updates {
            if !value_is_writable(value) {
                return Err(PalmgrError::MalformedDocument(format!(
                    "value for {key} contains an embedded quote that cannot be written back"
                )));
            }
        }

        let line_index = self
            .lines
            .iter()
            .position(|line| line.trim_start().starts_with(DIRECTIVE_PREFIX))
            .ok_or_else(|| {
                PalmgrError::MalformedDocument("missing OptionSettings directive".to_string())
            })?;
        let line = &self.lines[line_index];

        let open = line.find('(').ok_or_else(|| {
            PalmgrError::MalformedDocument("OptionSettings has no opening parenthesis".to_string())
        })?;
        let close = line.rfind(')').ok_or_else(|| {
            PalmgrError::MalformedDocument("OptionSettings has no closing parenthesis".to_string())
        })?;
        if close < open {
            return Err(PalmgrError::MalformedDocument(
                "OptionSettings parentheses are inverted".to_string(),
            ));
        }

        let prefix = &line[..open + 1];
        let suffix = &line[close..];
        let inner = &line[open + 1..close];

        let mut remaining: Vec<Option<&(String, String)>> = updates.iter().map(Some).collect();
        let mut entries: Vec<String> = Vec::new();

        for token in split_quote_aware(inner) {
            let (raw_key, raw_value) = match token.find('=') {
                Some(eq) => (&token[..eq], &token[eq + 1..]),
                None => {
                    // No key=value shape; pass through untouched.
                    entries.push(token);
                    continue;
                }
            };

            let matched = remaining.iter_mut().find(|slot| {
                slot.map(|(key, _)| key == raw_key.trim()).unwrap_or(false)
            });
            match matched {
                Some(slot) => {
                    let (key, value) = slot.take().map(|pair| pair.clone()).unwrap_or_default();
                    entries.push(format!("{key}={}", quote_value_if_needed(&value)));
                }
                None => {
                    entries.push(format!("{raw_key}={}", quote_value_if_needed(raw_value)));
                }
            }
        }

        for slot in remaining.into_iter().flatten() {
            let (key, value) = slot;
            entries.push(format!("{key}={}", quote_value_if_needed(value)));
        }

        let mut merged = self.clone();
        merged.lines[line_index] = format!("{prefix}{}{suffix}", entries.join(","));
        Ok(merged)
    }

    /// Directive entries as an ordered key/value list, values unquoted.
    pub fn entries(&self) -> Result<Vec<(String, String)>, PalmgrError> {
        let line = self
            .lines
            .iter()
            .find(|line| line.trim_start().starts_with(DIRECTIVE_PREFIX))
            .ok_or_else(|| {
                PalmgrError::MalformedDocument("missing OptionSettings directive".to_string())
            })?;

        let open = line.find('(');
        let close = line.rfind(')');
        let (Some(open), Some(close)) = (open, close) else {
            return Err(PalmgrError::MalformedDocument(
                "OptionSettings has no parenthesized body".to_string(),
            ));
        };
        if close < open {
            return Err(PalmgrError::MalformedDocument(
                "OptionSettings parentheses are inverted".to_string(),
            ));
        }

        let mut pairs = Vec::new();
        for token in split_quote_aware(&line[open + 1..close]) {
            if let Some(eq) = token.find('=') {
                let key = token[..eq].trim().to_string();
                let value = unquote(token[eq + 1..].trim());
                pairs.push((key, value));
            }
        }
        Ok(pairs)
    }
}

/// Splits the directive body on commas, ignoring commas inside double quotes.
fn split_quote_aware(inner: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;

    for ch in inner.chars() {
        match ch {
            '"' => {
                in_quotes = !in_quotes;
                current.push(ch);
            }
            ',' if !in_quotes => {
                tokens.push(std::mem::take(&mut current));
            }
            _ => current.push(ch),
        }
    }
    if !current.is_empty() || !tokens.is_empty() {
        tokens.push(current);
    }
    tokens.retain(|token| !token.trim().is_empty());
    tokens
}

/// Idempotent quoting: already-quoted values pass through, values containing
/// a delimiter character get wrapped, everything else stays bare.
fn quote_value_if_needed(value: &str) -> String {
    if value.len() >= 2 && value.starts_with('"') && value.ends_with('"') {
        return value.to_string();
    }
    if value.contains(' ') || value.contains(',') || value.contains('(') || value.contains(')') {
        return format!("\"{value}\"");
    }
    value.to_string()
}

/// The format has no quote escaping, so a quote character anywhere other
/// than a full surrounding pair cannot be represented.
fn value_is_writable(value: &str) -> bool {
    if value.len() >= 2 && value.starts_with('"') && value.ends_with('"') {
        return !value[1..value.len() - 1].contains('"');
    }
    !value.contains('"')
}

fn unquote(value: &str) -> String {
    if value.len() >= 2 && value.starts_with('"') && value.ends_with('"') {
        value[1..value.len() - 1].to_string()
    } else {
        value.to_string()
    }
}

pub fn update(path: &Path, updates: &[(String, String)]) -> Result<()> {
    let document = SettingsDocument::load(path)?;
    let merged = document.merge(updates)?;
    merged.save(path)
}

#[cfg(test)]
mod tests {
    use super::{quote_value_if_needed, split_quote_aware, SettingsDocument};
    use crate::errors::PalmgrError;

    const FIXTURE: &str = "[/Script/Pal.PalGameWorldSettings]\nOptionSettings=(Difficulty=None,ServerName=\"My Server\",RCONEnabled=False,RCONPort=25575)\n";

    fn pairs(raw: &[(&str, &str)]) -> Vec<(String, String)> {
        raw.iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect()
    }

    #[test]
    fn merge_replaces_matched_keys_in_place() {
        let document = SettingsDocument::parse(FIXTURE);
        let merged = document
            .merge(&pairs(&[("RCONEnabled", "True")]))
            .expect("merge should succeed");

        assert_eq!(
            merged.render(),
            "[/Script/Pal.PalGameWorldSettings]\nOptionSettings=(Difficulty=None,ServerName=\"My Server\",RCONEnabled=True,RCONPort=25575)\n"
        );
    }

    #[test]
    fn merge_appends_unknown_keys_in_update_order() {
        let document = SettingsDocument::parse(FIXTURE);
        let merged = document
            .merge(&pairs(&[("bZZLast", "1"), ("bAANew", "2")]))
            .expect("merge should succeed");

        let rendered = merged.render();
        assert!(
            rendered.contains("RCONPort=25575,bZZLast=1,bAANew=2)"),
            "appended entries should keep update order, got {rendered}"
        );
    }

    #[test]
    fn merge_quotes_values_with_delimiters() {
        let document = SettingsDocument::parse(FIXTURE);
        let merged = document
            .merge(&pairs(&[("ServerName", "A, B Server")]))
            .expect("merge should succeed");

        assert!(
            merged.render().contains("ServerName=\"A, B Server\""),
            "comma values must be quoted, got {}",
            merged.render()
        );
    }

    #[test]
    fn merge_keeps_already_quoted_values_verbatim() {
        let document = SettingsDocument::parse(FIXTURE);
        let merged = document
            .merge(&pairs(&[("AdminPassword", "\"admin\"")]))
            .expect("merge should succeed");

        assert!(merged.render().contains("AdminPassword=\"admin\""));
        assert!(
            !merged.render().contains("\"\"admin\"\""),
            "quoting must be idempotent"
        );
    }

    #[test]
    fn merge_is_idempotent() {
        let document = SettingsDocument::parse(FIXTURE);
        let updates = pairs(&[("ServerName", "Renamed World"), ("RCONEnabled", "True")]);

        let once = document.merge(&updates).expect("first merge should succeed");
        let twice = once.merge(&updates).expect("second merge should succeed");

        assert_eq!(once.render(), twice.render());
    }

    #[test]
    fn merge_leaves_untouched_entries_byte_identical() {
        let document = SettingsDocument::parse(FIXTURE);
        let merged = document
            .merge(&pairs(&[("RCONPort", "27100")]))
            .expect("merge should succeed");

        assert!(merged.render().contains("ServerName=\"My Server\""));
        assert!(merged.render().contains("Difficulty=None"));
    }

    #[test]
    fn merge_preserves_text_outside_the_parentheses() {
        let document = SettingsDocument::parse(FIXTURE);
        let merged = document
            .merge(&pairs(&[("Difficulty", "Hard")]))
            .expect("merge should succeed");

        let rendered = merged.render();
        assert!(rendered.starts_with("[/Script/Pal.PalGameWorldSettings]\nOptionSettings=("));
        assert!(rendered.ends_with(")\n"));
    }

    #[test]
    fn merge_keeps_trailing_text_after_the_closing_parenthesis() {
        let document = SettingsDocument::parse("OptionSettings=(A=1,B=\"x,y\"),\n");
        let merged = document
            .merge(&pairs(&[("A", "2")]))
            .expect("merge should succeed");

        assert_eq!(merged.render(), "OptionSettings=(A=2,B=\"x,y\"),\n");
    }

    #[test]
    fn merge_rejects_document_without_directive() {
        let document = SettingsDocument::parse("[/Script/Pal.PalGameWorldSettings]\n");
        let err = document
            .merge(&pairs(&[("RCONEnabled", "True")]))
            .expect_err("missing directive should be rejected");
        assert!(matches!(err, PalmgrError::MalformedDocument(_)));
    }

    #[test]
    fn merge_rejects_inverted_parentheses() {
        let document = SettingsDocument::parse("OptionSettings=)Difficulty=None(\n");
        let err = document
            .merge(&pairs(&[("Difficulty", "Hard")]))
            .expect_err("inverted span should be rejected");
        assert!(matches!(err, PalmgrError::MalformedDocument(_)));
    }

    #[test]
    fn merge_rejects_embedded_quotes() {
        let document = SettingsDocument::parse(FIXTURE);
        let err = document
            .merge(&pairs(&[("ServerName", "bad\"name")]))
            .expect_err("embedded quote should be rejected");
        assert!(matches!(err, PalmgrError::MalformedDocument(_)));
    }

    #[test]
    fn split_ignores_commas_inside_quotes() {
        let tokens = split_quote_aware("A=1,B=\"x, y\",C=3");
        assert_eq!(tokens, vec!["A=1", "B=\"x, y\"", "C=3"]);
    }

    #[test]
    fn split_of_empty_body_yields_nothing() {
        assert!(split_quote_aware("").is_empty());
    }

    #[test]
    fn quoting_rule_covers_the_three_cases() {
        assert_eq!(quote_value_if_needed("\"kept\""), "\"kept\"");
        assert_eq!(quote_value_if_needed("a b"), "\"a b\"");
        assert_eq!(quote_value_if_needed("x,y"), "\"x,y\"");
        assert_eq!(quote_value_if_needed("(x)"), "\"(x)\"");
        assert_eq!(quote_value_if_needed("bare"), "bare");
    }

    #[test]
    fn entries_unquote_values_and_keep_order() {
        let document = SettingsDocument::parse(FIXTURE);
        let entries = document.entries().expect("entries should parse");

        assert_eq!(
            entries,
            vec![
                ("Difficulty".to_string(), "None".to_string()),
                ("ServerName".to_string(), "My Server".to_string()),
                ("RCONEnabled".to_string(), "False".to_string()),
                ("RCONPort".to_string(), "25575".to_string()),
            ]
        );
    }
}

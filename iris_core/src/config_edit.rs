//! # In-place Configuration Edits
//!
//! The admin CLI (`team add`, `team remove`, settings tweaks) edits the
//! YAML config file in place. The contract is strict: an edit alters only
//! the affected keys — every unrelated line, comment and blank survives
//! byte-for-byte. A full serialize round-trip cannot honour that, so the
//! edits here are line surgery on the raw text. Each public function
//! re-parses the result through [`IrisConfig::from_yaml`] before returning
//! it; a result that no longer validates aborts the edit and the original
//! text is left untouched by the caller.

use crate::config::{IrisConfig, TeamConfig};
use crate::error::{OrchestratorError, Result};

const TEAM_INDENT: &str = "  ";
const FIELD_INDENT: &str = "    ";

/// Set (or insert) one scalar key inside the top-level `settings:` block.
pub fn set_settings_key(text: &str, key: &str, value: &str) -> Result<String> {
    let edited = set_key_in_block(text, "settings", key, value)?;
    IrisConfig::from_yaml(&edited)?;
    Ok(edited)
}

/// Set (or insert) one scalar key inside a team's block.
pub fn set_team_key(text: &str, team: &str, key: &str, value: &str) -> Result<String> {
    validate_team_name(team)?;
    let lines: Vec<&str> = text.lines().collect();
    let teams = block_range(&lines, 0, "teams")
        .ok_or_else(|| OrchestratorError::Configuration("no 'teams' section".to_string()))?;
    let block = block_range(&lines[teams.clone()], TEAM_INDENT.len(), team)
        .map(|r| (teams.start + r.start)..(teams.start + r.end))
        .ok_or_else(|| OrchestratorError::UnknownTeam(team.to_string()))?;
    let edited = splice_key(&lines, block, FIELD_INDENT, key, value, text);
    IrisConfig::from_yaml(&edited)?;
    Ok(edited)
}

/// Append a new team block at the end of the `teams:` section.
pub fn add_team(text: &str, name: &str, team: &TeamConfig) -> Result<String> {
    validate_team_name(name)?;
    let lines: Vec<&str> = text.lines().collect();

    if let Some(teams) = block_range(&lines, 0, "teams")
        && block_range(&lines[teams.clone()], TEAM_INDENT.len(), name).is_some()
    {
        return Err(OrchestratorError::Configuration(format!(
            "team '{}' already exists",
            name
        )));
    }

    let mut block = vec![format!("{}{}:", TEAM_INDENT, name)];
    block.push(format!(
        "{}path: {}",
        FIELD_INDENT,
        yaml_scalar(&team.path.display().to_string())
    ));
    block.push(format!(
        "{}description: {}",
        FIELD_INDENT,
        yaml_scalar(&team.description)
    ));
    if let Some(ms) = team.idle_timeout {
        block.push(format!("{}idleTimeout: {}", FIELD_INDENT, ms));
    }
    if let Some(ms) = team.session_init_timeout {
        block.push(format!("{}sessionInitTimeout: {}", FIELD_INDENT, ms));
    }
    if let Some(skip) = team.skip_permissions {
        block.push(format!("{}skipPermissions: {}", FIELD_INDENT, skip));
    }
    if let Some(color) = &team.color {
        block.push(format!("{}color: \"{}\"", FIELD_INDENT, color));
    }
    if let Some(command) = &team.command {
        let items: Vec<String> = command.iter().map(|c| yaml_scalar(c)).collect();
        block.push(format!("{}command: [{}]", FIELD_INDENT, items.join(", ")));
    }

    let mut out: Vec<String> = Vec::with_capacity(lines.len() + block.len() + 1);
    match block_range(&lines, 0, "teams") {
        Some(teams) => {
            for (i, line) in lines.iter().enumerate() {
                if i == teams.end {
                    out.extend(block.drain(..));
                }
                out.push((*line).to_string());
            }
            if !block.is_empty() {
                out.extend(block);
            }
        }
        None => {
            out.extend(lines.iter().map(|l| (*l).to_string()));
            out.push("teams:".to_string());
            out.extend(block);
        }
    }

    let edited = join_lines(&out, text);
    IrisConfig::from_yaml(&edited)?;
    Ok(edited)
}

/// Remove a team block, leaving every other line untouched.
pub fn remove_team(text: &str, name: &str) -> Result<String> {
    validate_team_name(name)?;
    let lines: Vec<&str> = text.lines().collect();
    let teams = block_range(&lines, 0, "teams")
        .ok_or_else(|| OrchestratorError::Configuration("no 'teams' section".to_string()))?;
    let block = block_range(&lines[teams.clone()], TEAM_INDENT.len(), name)
        .map(|r| (teams.start + r.start)..(teams.start + r.end))
        .ok_or_else(|| OrchestratorError::UnknownTeam(name.to_string()))?;

    let out: Vec<String> = lines
        .iter()
        .enumerate()
        .filter(|(i, _)| !block.contains(i))
        .map(|(_, l)| (*l).to_string())
        .collect();

    let edited = join_lines(&out, text);
    IrisConfig::from_yaml(&edited)?;
    Ok(edited)
}

fn validate_team_name(name: &str) -> Result<()> {
    let ok = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if ok {
        Ok(())
    } else {
        Err(OrchestratorError::Configuration(format!(
            "team name '{}' must match [A-Za-z0-9_-]+",
            name
        )))
    }
}

fn indent_of(line: &str) -> usize {
    line.len() - line.trim_start().len()
}

fn is_blank_or_comment(line: &str) -> bool {
    let trimmed = line.trim_start();
    trimmed.is_empty() || trimmed.starts_with('#')
}

/// Range of lines making up the mapping entry `key:` at the given indent.
///
/// The range starts at the `key:` line itself and extends until the next
/// non-blank, non-comment line whose indent is not deeper than the key.
/// Trailing blank/comment lines at shallower indent stay outside the
/// range, so removing a block never eats a sibling's leading comment.
fn block_range(lines: &[&str], indent: usize, key: &str) -> Option<std::ops::Range<usize>> {
    let header = format!("{}:", key);
    let start = lines.iter().position(|line| {
        indent_of(line) == indent && {
            let trimmed = line.trim_start();
            trimmed == header || trimmed.starts_with(&format!("{} ", header))
        }
    })?;

    let mut end = start + 1;
    let mut last_content = start + 1;
    while end < lines.len() {
        let line = lines[end];
        if is_blank_or_comment(line) {
            end += 1;
            continue;
        }
        if indent_of(line) <= indent {
            break;
        }
        end += 1;
        last_content = end;
    }
    Some(start..last_content)
}

/// Replace or insert `key: value` inside the line range of a block.
fn splice_key(
    lines: &[&str],
    block: std::ops::Range<usize>,
    field_indent: &str,
    key: &str,
    value: &str,
    original: &str,
) -> String {
    let prefix = format!("{}{}:", field_indent, key);
    let mut out: Vec<String> = Vec::with_capacity(lines.len() + 1);
    let mut replaced = false;

    for (i, line) in lines.iter().enumerate() {
        if block.contains(&i) && !replaced && line.starts_with(&prefix) {
            let rest = &line[prefix.len()..];
            let comment = inline_comment(rest);
            let mut rebuilt = format!("{} {}", prefix, value);
            if let Some(comment) = comment {
                rebuilt.push_str("  ");
                rebuilt.push_str(comment);
            }
            out.push(rebuilt);
            replaced = true;
        } else {
            out.push((*line).to_string());
        }
        if i + 1 == block.end && !replaced {
            out.push(format!("{} {}", prefix, value));
            replaced = true;
        }
    }

    join_lines(&out, original)
}

fn set_key_in_block(text: &str, section: &str, key: &str, value: &str) -> Result<String> {
    let lines: Vec<&str> = text.lines().collect();
    let block = block_range(&lines, 0, section).ok_or_else(|| {
        OrchestratorError::Configuration(format!("no '{}' section", section))
    })?;
    Ok(splice_key(&lines, block, TEAM_INDENT, key, value, text))
}

/// An inline `# comment` in the remainder of a line, if present.
fn inline_comment(rest: &str) -> Option<&str> {
    let mut in_quote: Option<char> = None;
    let bytes = rest.char_indices().collect::<Vec<_>>();
    for (idx, c) in bytes {
        match (in_quote, c) {
            (Some(q), c) if c == q => in_quote = None,
            (None, '"') | (None, '\'') => in_quote = Some(c),
            (None, '#') => {
                if idx == 0 || rest[..idx].ends_with(' ') {
                    return Some(rest[idx..].trim_end());
                }
            }
            _ => {}
        }
    }
    None
}

/// Quote a scalar unless it is plain-safe.
fn yaml_scalar(s: &str) -> String {
    let plain = !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || "/_-.".contains(c));
    if plain {
        s.to_string()
    } else {
        format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
    }
}

/// Rejoin lines, keeping the original trailing-newline convention.
fn join_lines(lines: &[String], original: &str) -> String {
    let mut out = lines.join("\n");
    if original.ends_with('\n') {
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    const SAMPLE: &str = r##"# Fleet configuration
settings:
  idleTimeout: 300000  # five minutes
  maxProcesses: 10
  healthCheckInterval: 30000
  sessionInitTimeout: 15000

# The fleet
teams:
  # The primary workspace
  alpha:
    path: /srv/alpha
    description: Alpha workspace
  beta:
    path: /srv/beta
    description: "Beta workspace"
    color: "#00ff99"
"##;

    fn team(path: &str, description: &str) -> TeamConfig {
        TeamConfig {
            path: PathBuf::from(path),
            description: description.to_string(),
            idle_timeout: None,
            session_init_timeout: None,
            skip_permissions: None,
            color: None,
            command: None,
        }
    }

    #[test]
    fn set_settings_key_touches_one_line() {
        let edited = set_settings_key(SAMPLE, "idleTimeout", "60000").unwrap();
        assert!(edited.contains("idleTimeout: 60000  # five minutes"));
        // Everything else is untouched.
        let diff: Vec<(&str, &str)> = SAMPLE
            .lines()
            .zip(edited.lines())
            .filter(|(a, b)| a != b)
            .collect();
        assert_eq!(diff.len(), 1);
        assert!(diff[0].0.contains("idleTimeout: 300000"));
    }

    #[test]
    fn add_then_remove_round_trips() {
        let added = add_team(SAMPLE, "gamma", &team("/srv/gamma", "Gamma workspace")).unwrap();
        assert!(added.contains("  gamma:"));
        assert!(added.contains("    path: /srv/gamma"));
        let removed = remove_team(&added, "gamma").unwrap();
        assert_eq!(removed, SAMPLE);
    }

    #[test]
    fn remove_preserves_comments_and_siblings() {
        let removed = remove_team(SAMPLE, "alpha").unwrap();
        assert!(removed.contains("# The primary workspace"));
        assert!(removed.contains("# The fleet"));
        assert!(removed.contains("  beta:"));
        assert!(!removed.contains("alpha:"));
        IrisConfig::from_yaml(&removed).unwrap();
    }

    #[test]
    fn add_duplicate_team_is_rejected() {
        let err = add_team(SAMPLE, "alpha", &team("/srv/x", "dup")).unwrap_err();
        assert!(matches!(err, OrchestratorError::Configuration(_)));
    }

    #[test]
    fn set_team_key_inserts_missing_key() {
        let edited = set_team_key(SAMPLE, "alpha", "idleTimeout", "1000").unwrap();
        assert!(edited.contains("    idleTimeout: 1000"));
        let config = IrisConfig::from_yaml(&edited).unwrap();
        assert_eq!(config.teams["alpha"].idle_timeout, Some(1000));
    }

    #[test]
    fn quoted_description_survives_add() {
        let added = add_team(
            SAMPLE,
            "gamma",
            &team("/srv/g", "has: punctuation, and \"quotes\""),
        )
        .unwrap();
        let config = IrisConfig::from_yaml(&added).unwrap();
        assert_eq!(
            config.teams["gamma"].description,
            "has: punctuation, and \"quotes\""
        );
    }

    #[test]
    fn invalid_team_name_is_rejected() {
        assert!(add_team(SAMPLE, "bad name", &team("/x", "d")).is_err());
        assert!(remove_team(SAMPLE, "a/b").is_err());
    }
}

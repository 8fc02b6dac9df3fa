//! Line-oriented codec for migration files.
//!
//! A migration file is a sequence of named fields in fixed order:
//!
//! ```text
//! Description: create the users table
//! Created: 2026-08-02T09:30:00Z
//! Depends: root
//! Apply:
//!   CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT NOT NULL);
//! Revert:
//!   DROP TABLE users;
//! ```
//!
//! `Description`, `Created` and `Depends` are single-line; `Apply` and
//! `Revert` carry a body of SQL on the following lines, each indented two
//! spaces, terminated by the next field or end of file. `Revert` may be
//! absent. Duplicate fields, unknown fields, fields out of order and
//! unindented content are all rejected.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};

use crate::migration::{valid_id, Migration};

/// Accepted fields, in the order they must appear. All but `Revert` are
/// required.
const FIELDS: [&str; 5] = ["Description", "Created", "Depends", "Apply", "Revert"];

const INDENT: &str = "  ";

/// The field contents of one parsed migration file. The id is not part of
/// the format; it comes from the filename stem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedMigration {
    pub description: String,
    pub created: DateTime<Utc>,
    pub depends: BTreeSet<String>,
    pub apply: String,
    pub revert: Option<String>,
}

/// A syntax error in a migration file, with the 1-based line it occurred on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatError {
    pub line: usize,
    pub detail: String,
}

impl FormatError {
    fn new(line: usize, detail: impl Into<String>) -> Self {
        Self {
            line,
            detail: detail.into(),
        }
    }
}

impl fmt::Display for FormatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}: {}", self.line, self.detail)
    }
}

impl std::error::Error for FormatError {}

/// Which multi-line body, if any, the parser is currently inside.
#[derive(Clone, Copy, PartialEq)]
enum Body {
    None,
    Apply,
    Revert,
}

/// Split a field header line into `(name, rest)`.
///
/// A header starts at column 0 with an alphabetic field name followed
/// immediately by a colon. Anything else is not a header.
fn split_field(line: &str) -> Option<(&str, &str)> {
    let colon = line.find(':')?;
    let name = &line[..colon];
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphabetic()) {
        return None;
    }
    Some((name, &line[colon + 1..]))
}

/// Parse the text of one migration file.
pub fn parse(input: &str) -> Result<ParsedMigration, FormatError> {
    let mut description = None;
    let mut created = None;
    let mut depends = None;
    let mut apply: Option<Vec<String>> = None;
    let mut revert: Option<Vec<String>> = None;

    // Index into FIELDS of the next field allowed to appear. Advancing only
    // on a match makes every idx < next_field a duplicate.
    let mut next_field = 0;
    let mut body = Body::None;

    let mut last_line = 0;
    for (lineno, line) in input.lines().enumerate() {
        let n = lineno + 1;
        last_line = n;

        if let Some((name, rest)) = split_field(line) {
            body = Body::None;
            let idx = match FIELDS.iter().position(|f| *f == name) {
                Some(idx) => idx,
                None => return Err(FormatError::new(n, format!("unknown field `{}`", name))),
            };
            if idx < next_field {
                return Err(FormatError::new(n, format!("duplicate field `{}`", name)));
            }
            if idx > next_field {
                return Err(FormatError::new(
                    n,
                    format!("missing field `{}`", FIELDS[next_field]),
                ));
            }
            next_field = idx + 1;

            match name {
                "Description" => description = Some(rest.trim().to_string()),
                "Created" => {
                    let stamp = DateTime::parse_from_rfc3339(rest.trim()).map_err(|e| {
                        FormatError::new(n, format!("invalid timestamp `{}`: {}", rest.trim(), e))
                    })?;
                    created = Some(stamp.with_timezone(&Utc));
                }
                "Depends" => {
                    let mut deps = BTreeSet::new();
                    for dep in rest.split_whitespace() {
                        if !valid_id(dep) {
                            return Err(FormatError::new(
                                n,
                                format!("invalid dependency id `{}`", dep),
                            ));
                        }
                        deps.insert(dep.to_string());
                    }
                    depends = Some(deps);
                }
                "Apply" => {
                    reject_inline_sql(n, name, rest)?;
                    apply = Some(Vec::new());
                    body = Body::Apply;
                }
                "Revert" => {
                    reject_inline_sql(n, name, rest)?;
                    revert = Some(Vec::new());
                    body = Body::Revert;
                }
                _ => unreachable!("field list covers all names"),
            }
            continue;
        }

        let lines = match body {
            Body::Apply => apply.as_mut(),
            Body::Revert => revert.as_mut(),
            Body::None => None,
        };

        if line.trim().is_empty() {
            if let Some(lines) = lines {
                lines.push(String::new());
            }
            continue;
        }

        match lines {
            Some(lines) => match line.strip_prefix(INDENT) {
                Some(stripped) => lines.push(stripped.to_string()),
                None => {
                    return Err(FormatError::new(
                        n,
                        "SQL body lines must be indented two spaces",
                    ))
                }
            },
            None => {
                let expected = FIELDS.get(next_field).copied().unwrap_or("end of file");
                return Err(FormatError::new(
                    n,
                    format!("unexpected content; expected `{}`", expected),
                ));
            }
        }
    }

    let missing = |field: &str| FormatError::new(last_line, format!("missing field `{}`", field));
    Ok(ParsedMigration {
        description: description.ok_or_else(|| missing("Description"))?,
        created: created.ok_or_else(|| missing("Created"))?,
        depends: depends.ok_or_else(|| missing("Depends"))?,
        apply: join_body(apply.ok_or_else(|| missing("Apply"))?),
        revert: revert.map(join_body),
    })
}

fn reject_inline_sql(line: usize, name: &str, rest: &str) -> Result<(), FormatError> {
    if rest.trim().is_empty() {
        Ok(())
    } else {
        Err(FormatError::new(
            line,
            format!("`{}` takes its SQL on the following lines", name),
        ))
    }
}

fn join_body(lines: Vec<String>) -> String {
    let mut text = lines.join("\n");
    text.truncate(text.trim_end().len());
    text
}

/// Render a migration back to the file format. Inverse of [`parse`] up to
/// trailing blank lines in the SQL bodies.
pub fn render(migration: &Migration) -> String {
    let mut out = String::new();
    out.push_str("Description:");
    if !migration.description.is_empty() {
        out.push(' ');
        out.push_str(&migration.description);
    }
    out.push('\n');
    if let Some(created) = migration.created {
        out.push_str("Created: ");
        out.push_str(&created.to_rfc3339_opts(SecondsFormat::Secs, true));
        out.push('\n');
    }
    out.push_str("Depends:");
    for dep in &migration.depends {
        out.push(' ');
        out.push_str(dep);
    }
    out.push('\n');
    render_body(&mut out, "Apply", &migration.apply);
    if let Some(revert) = &migration.revert {
        render_body(&mut out, "Revert", revert);
    }
    out
}

fn render_body(out: &mut String, field: &str, sql: &str) {
    out.push_str(field);
    out.push_str(":\n");
    for line in sql.lines() {
        if line.is_empty() {
            out.push('\n');
        } else {
            out.push_str(INDENT);
            out.push_str(line);
            out.push('\n');
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    const GOOD: &str = "Description: create users\n\
                        Created: 2026-01-01T00:00:00Z\n\
                        Depends: root\n\
                        Apply:\n\
                        \x20 CREATE TABLE users (id INTEGER PRIMARY KEY);\n\
                        Revert:\n\
                        \x20 DROP TABLE users;\n";

    #[test]
    fn test_parse_complete_file() {
        let parsed = parse(GOOD).unwrap();
        assert_eq!(parsed.description, "create users");
        assert_eq!(parsed.depends, BTreeSet::from(["root".to_string()]));
        assert_eq!(parsed.apply, "CREATE TABLE users (id INTEGER PRIMARY KEY);");
        assert_eq!(parsed.revert.as_deref(), Some("DROP TABLE users;"));
    }

    #[test]
    fn test_revert_is_optional() {
        let text = "Description: one way\n\
                    Created: 2026-01-01T00:00:00Z\n\
                    Depends:\n\
                    Apply:\n\
                    \x20 DROP TABLE legacy;\n";
        let parsed = parse(text).unwrap();
        assert!(parsed.depends.is_empty());
        assert_eq!(parsed.revert, None);
    }

    #[test]
    fn test_multiline_body_keeps_extra_indent() {
        let text = "Description:\n\
                    Created: 2026-01-01T00:00:00Z\n\
                    Depends:\n\
                    Apply:\n\
                    \x20 CREATE TABLE t (\n\
                    \x20   id INTEGER\n\
                    \x20 );\n";
        let parsed = parse(text).unwrap();
        assert_eq!(parsed.apply, "CREATE TABLE t (\n  id INTEGER\n);");
    }

    #[test]
    fn test_blank_lines_inside_body_survive() {
        let text = "Description:\n\
                    Created: 2026-01-01T00:00:00Z\n\
                    Depends:\n\
                    Apply:\n\
                    \x20 CREATE TABLE a (x);\n\
                    \n\
                    \x20 CREATE TABLE b (y);\n";
        let parsed = parse(text).unwrap();
        assert_eq!(parsed.apply, "CREATE TABLE a (x);\n\nCREATE TABLE b (y);");
    }

    #[test]
    fn test_duplicate_field_rejected() {
        let text = "Description: one\nDescription: two\n";
        let err = parse(text).unwrap_err();
        assert_eq!(err.line, 2);
        assert!(err.detail.contains("duplicate field `Description`"));
    }

    #[test]
    fn test_unknown_field_rejected() {
        let text = "Description: x\nAuthor: somebody\n";
        let err = parse(text).unwrap_err();
        assert!(err.detail.contains("unknown field `Author`"));
    }

    #[test]
    fn test_field_order_enforced() {
        let text = "Created: 2026-01-01T00:00:00Z\nDescription: x\n";
        let err = parse(text).unwrap_err();
        assert_eq!(err.line, 1);
        assert!(err.detail.contains("missing field `Description`"));
    }

    #[test]
    fn test_missing_apply_rejected() {
        let text = "Description: x\nCreated: 2026-01-01T00:00:00Z\nDepends:\n";
        let err = parse(text).unwrap_err();
        assert!(err.detail.contains("missing field `Apply`"));
    }

    #[test]
    fn test_bad_timestamp_rejected() {
        let text = "Description: x\nCreated: yesterday\n";
        let err = parse(text).unwrap_err();
        assert_eq!(err.line, 2);
        assert!(err.detail.contains("invalid timestamp"));
    }

    #[test]
    fn test_bad_dependency_id_rejected() {
        let text = "Description: x\n\
                    Created: 2026-01-01T00:00:00Z\n\
                    Depends: ok ../bad\n";
        let err = parse(text).unwrap_err();
        assert!(err.detail.contains("invalid dependency id `../bad`"));
    }

    #[test]
    fn test_unindented_body_line_rejected() {
        let text = "Description:\n\
                    Created: 2026-01-01T00:00:00Z\n\
                    Depends:\n\
                    Apply:\n\
                    CREATE TABLE t (x);\n";
        let err = parse(text).unwrap_err();
        assert_eq!(err.line, 5);
        assert!(err.detail.contains("indented"));
    }

    #[test]
    fn test_inline_sql_on_header_rejected() {
        let text = "Description:\n\
                    Created: 2026-01-01T00:00:00Z\n\
                    Depends:\n\
                    Apply: CREATE TABLE t (x);\n";
        let err = parse(text).unwrap_err();
        assert!(err.detail.contains("following lines"));
    }

    #[test]
    fn test_garbage_between_fields_rejected() {
        let text = "Description: x\nwhat is this\n";
        let err = parse(text).unwrap_err();
        assert_eq!(err.line, 2);
        assert!(err.detail.contains("expected `Created`"));
    }

    #[test]
    fn test_empty_file_reports_first_field() {
        let err = parse("").unwrap_err();
        assert!(err.detail.contains("missing field `Description`"));
    }

    #[test]
    fn test_render_parse_round_trip() {
        let parsed = parse(GOOD).unwrap();
        let migration = Migration {
            id: "users".to_string(),
            depends: parsed.depends.clone(),
            apply: parsed.apply.clone(),
            revert: parsed.revert.clone(),
            description: parsed.description.clone(),
            created: Some(parsed.created),
        };
        let rendered = render(&migration);
        assert_eq!(parse(&rendered).unwrap(), parsed);
    }

    #[test]
    fn test_render_empty_bodies() {
        let migration = Migration {
            id: "empty".to_string(),
            depends: BTreeSet::new(),
            apply: String::new(),
            revert: Some(String::new()),
            description: String::new(),
            created: Some(
                DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
                    .unwrap()
                    .into(),
            ),
        };
        let rendered = render(&migration);
        let parsed = parse(&rendered).unwrap();
        assert_eq!(parsed.apply, "");
        assert_eq!(parsed.revert.as_deref(), Some(""));
    }
}

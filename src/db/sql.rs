//! Command-shape helpers: statement classification, placeholder counting and
//! identifier handling for generated statements.

use crate::error::{DbError, DbResult};
use crate::models::StatementKind;
use sqlparser::ast::{Expr, SelectItem, SetExpr, Statement, TableFactor};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;

/// Leading keywords of statements that produce a result set.
const QUERY_KEYWORDS: &[&str] = &[
    "SELECT", "WITH", "VALUES", "PRAGMA", "EXPLAIN", "SHOW", "DESCRIBE", "DESC",
];

/// Classify a command as query or update by its shape.
///
/// The text is parsed with sqlparser; if it cannot be parsed (vendor syntax,
/// unusual dialect) the first keyword decides.
pub fn classify(sql: &str) -> StatementKind {
    match Parser::parse_sql(&GenericDialect {}, sql) {
        Ok(statements) => match statements.first() {
            Some(stmt) => classify_statement(stmt),
            None => StatementKind::Update,
        },
        Err(_) => classify_by_keyword(sql),
    }
}

fn classify_statement(stmt: &Statement) -> StatementKind {
    match stmt {
        Statement::Query(_)
        | Statement::Explain { .. }
        | Statement::ExplainTable { .. }
        | Statement::Pragma { .. }
        | Statement::ShowTables { .. }
        | Statement::ShowColumns { .. }
        | Statement::ShowDatabases { .. }
        | Statement::ShowVariable { .. }
        | Statement::ShowVariables { .. } => StatementKind::Query,
        _ => StatementKind::Update,
    }
}

fn classify_by_keyword(sql: &str) -> StatementKind {
    let keyword = leading_keyword(sql).to_ascii_uppercase();
    if QUERY_KEYWORDS.contains(&keyword.as_str()) {
        StatementKind::Query
    } else {
        StatementKind::Update
    }
}

/// First word of the command, skipping whitespace, comments and opening parentheses.
fn leading_keyword(sql: &str) -> &str {
    let bytes = sql.as_bytes();
    let len = bytes.len();
    let mut i = 0;
    while i < len {
        match bytes[i] {
            b'-' if i + 1 < len && bytes[i + 1] == b'-' => i = skip_line_comment(bytes, i),
            b'/' if i + 1 < len && bytes[i + 1] == b'*' => i = skip_block_comment(bytes, i),
            b'(' => {}
            b if b.is_ascii_whitespace() => {}
            _ => break,
        }
        i += 1;
    }
    let start = i.min(len);
    let end = sql[start..]
        .find(|c: char| !c.is_ascii_alphanumeric() && c != '_')
        .map(|offset| start + offset)
        .unwrap_or(len);
    &sql[start..end]
}

/// Count positional `?` placeholders outside literals, quoted identifiers and comments.
pub fn count_placeholders(sql: &str) -> usize {
    let bytes = sql.as_bytes();
    let len = bytes.len();
    let mut count = 0;
    let mut i = 0;

    while i < len {
        match bytes[i] {
            b'\'' => i = skip_quoted(bytes, i, b'\''),
            b'"' => i = skip_quoted(bytes, i, b'"'),
            b'`' => i = skip_quoted(bytes, i, b'`'),
            b'[' => i = skip_quoted(bytes, i, b']'),
            b'-' if i + 1 < len && bytes[i + 1] == b'-' => i = skip_line_comment(bytes, i),
            b'/' if i + 1 < len && bytes[i + 1] == b'*' => i = skip_block_comment(bytes, i),
            b'?' => count += 1,
            _ => {}
        }
        i += 1;
    }

    count
}

/// Fail with `DbError::Binding` unless the parameter count matches the placeholders.
pub fn check_binding(sql: &str, param_count: usize) -> DbResult<()> {
    let expected = count_placeholders(sql);
    if expected != param_count {
        return Err(DbError::binding(format!(
            "statement has {} placeholder(s) but {} parameter(s) were supplied",
            expected, param_count
        )));
    }
    Ok(())
}

/// Index of the closing quote, or the last index when unterminated.
fn skip_quoted(bytes: &[u8], i: usize, close: u8) -> usize {
    let len = bytes.len();
    let mut j = i + 1;
    while j < len {
        if bytes[j] == close {
            // Doubled quote is an escape
            if close != b']' && j + 1 < len && bytes[j + 1] == close {
                j += 2;
                continue;
            }
            return j;
        }
        j += 1;
    }
    len
}

fn skip_line_comment(bytes: &[u8], i: usize) -> usize {
    let mut j = i + 2;
    while j < bytes.len() && bytes[j] != b'\n' {
        j += 1;
    }
    j
}

fn skip_block_comment(bytes: &[u8], i: usize) -> usize {
    let len = bytes.len();
    let mut j = i + 2;
    while j + 1 < len {
        if bytes[j] == b'*' && bytes[j + 1] == b'/' {
            return j + 1;
        }
        j += 1;
    }
    len
}

/// Validate a table or column name for interpolation into generated SQL.
///
/// Accepts `[A-Za-z_][A-Za-z0-9_]*`, optionally schema-qualified with one dot.
pub fn validate_identifier(name: &str) -> DbResult<()> {
    let valid = !name.is_empty()
        && name.split('.').count() <= 2
        && name.split('.').all(|part| {
            let mut chars = part.chars();
            matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        });
    if valid {
        Ok(())
    } else {
        Err(DbError::usage(format!("invalid SQL identifier '{}'", name)))
    }
}

/// Build `INSERT INTO table (c1, c2, ...) VALUES (?, ?, ...)`.
pub fn insert_statement(table: &str, columns: &[&str]) -> DbResult<String> {
    validate_identifier(table)?;
    for column in columns {
        validate_identifier(column)?;
    }
    if columns.is_empty() {
        return Ok(format!("INSERT INTO {} DEFAULT VALUES", table));
    }
    let placeholders = vec!["?"; columns.len()].join(", ");
    Ok(format!(
        "INSERT INTO {} ({}) VALUES ({})",
        table,
        columns.join(", "),
        placeholders
    ))
}

/// One result column of a single-table select, as written in the projection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProjectedColumn {
    /// `*` or `t.*`: every column of the source table, in table order.
    All,
    /// A plain column reference, aliased or not.
    Column(String),
    Computed,
}

/// A plain `SELECT ... FROM table` without joins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SingleTableSelect {
    pub table: String,
    pub projection: Vec<ProjectedColumn>,
}

/// Source table and projection of a single-table select, or `None` for any
/// other command shape.
pub fn single_table_select(sql: &str) -> Option<SingleTableSelect> {
    let statements = Parser::parse_sql(&GenericDialect {}, sql).ok()?;
    let [Statement::Query(query)] = statements.as_slice() else {
        return None;
    };
    let SetExpr::Select(select) = query.body.as_ref() else {
        return None;
    };
    let [from] = select.from.as_slice() else {
        return None;
    };
    if !from.joins.is_empty() {
        return None;
    }
    let TableFactor::Table { name, .. } = &from.relation else {
        return None;
    };
    let table = match name.0.as_slice() {
        [part] => part.as_ident()?.value.clone(),
        _ => return None,
    };

    let projection = select
        .projection
        .iter()
        .map(|item| match item {
            SelectItem::Wildcard(_) | SelectItem::QualifiedWildcard(..) => ProjectedColumn::All,
            SelectItem::UnnamedExpr(expr) | SelectItem::ExprWithAlias { expr, .. } => match expr {
                Expr::Identifier(ident) => ProjectedColumn::Column(ident.value.clone()),
                Expr::CompoundIdentifier(idents) if idents.len() == 2 => idents
                    .last()
                    .map(|ident| ProjectedColumn::Column(ident.value.clone()))
                    .unwrap_or(ProjectedColumn::Computed),
                _ => ProjectedColumn::Computed,
            },
        })
        .collect();

    Some(SingleTableSelect { table, projection })
}

/// Split a declared column type such as `DECIMAL(15, 2)` into its name,
/// precision and scale. Types without arguments have precision and scale 0.
pub fn parse_declared_type(declared: &str) -> Option<(String, u32, u32)> {
    let declared = declared.trim();
    if declared.is_empty() {
        return None;
    }
    let Some(open) = declared.find('(') else {
        return Some((declared.to_ascii_uppercase(), 0, 0));
    };
    let name = declared[..open].trim().to_ascii_uppercase();
    let args = declared[open + 1..].trim_end().strip_suffix(')')?;
    let mut parts = args.split(',').map(|part| part.trim().parse::<u32>());
    let precision = parts.next()?.ok()?;
    let scale = match parts.next() {
        Some(scale) => scale.ok()?,
        None => 0,
    };
    Some((name, precision, scale))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_classify_select_is_query() {
        assert_eq!(classify("select * from tsttbl"), StatementKind::Query);
        assert_eq!(
            classify("  WITH t AS (SELECT 1) SELECT * FROM t"),
            StatementKind::Query
        );
        assert_eq!(classify("VALUES (1), (2)"), StatementKind::Query);
    }

    #[test]
    fn test_classify_writes_are_updates() {
        assert_eq!(
            classify("insert into tsttbl (foo) values (?)"),
            StatementKind::Update
        );
        assert_eq!(
            classify("update tsttbl set foo=? where id=?"),
            StatementKind::Update
        );
        assert_eq!(classify("delete from tsttbl"), StatementKind::Update);
        assert_eq!(
            classify("create table t (id integer primary key)"),
            StatementKind::Update
        );
    }

    #[test]
    fn test_classify_pragma_is_query() {
        assert_eq!(classify("PRAGMA table_info(tsttbl)"), StatementKind::Query);
    }

    #[test]
    fn test_classify_falls_back_to_keyword() {
        // Not valid in the generic dialect, but clearly a query
        assert_eq!(
            classify("/* hint */ (SELECT foo FROM t FETCH FIRST ROWS ONLY OPTIMIZE x)"),
            StatementKind::Query
        );
        assert_eq!(classify("CALL MYLIB.PGM()"), StatementKind::Update);
    }

    #[test]
    fn test_count_placeholders() {
        assert_eq!(count_placeholders("select * from t"), 0);
        assert_eq!(count_placeholders("update t set a=? where b=?"), 2);
        assert_eq!(
            count_placeholders("select '?' as q, \"a?\" from t where x = ? -- ?\n"),
            1
        );
        assert_eq!(count_placeholders("select /* ? */ ? from t"), 1);
        assert_eq!(count_placeholders("select 'it''s ?' from t where a=?"), 1);
    }

    #[test]
    fn test_check_binding_mismatch() {
        let err = check_binding("select * from t where a=?", 2).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Binding);
        assert!(check_binding("select * from t where a=?", 1).is_ok());
    }

    #[test]
    fn test_validate_identifier() {
        assert!(validate_identifier("tsttbl").is_ok());
        assert!(validate_identifier("mylib.tsttbl").is_ok());
        assert!(validate_identifier("_x1").is_ok());
        assert!(validate_identifier("").is_err());
        assert!(validate_identifier("1abc").is_err());
        assert!(validate_identifier("t; drop table x").is_err());
        assert!(validate_identifier("a.b.c").is_err());
    }

    #[test]
    fn test_insert_statement() {
        let sql = insert_statement("tsttbl", &["bar", "foo"]).unwrap();
        assert_eq!(sql, "INSERT INTO tsttbl (bar, foo) VALUES (?, ?)");
        assert_eq!(count_placeholders(&sql), 2);
    }

    #[test]
    fn test_single_table_select() {
        let select = single_table_select("select ID, NAME MYNAME, t.START, ID + 1 from testtbl t").unwrap();
        assert_eq!(select.table, "testtbl");
        assert_eq!(
            select.projection,
            vec![
                ProjectedColumn::Column("ID".to_string()),
                ProjectedColumn::Column("NAME".to_string()),
                ProjectedColumn::Column("START".to_string()),
                ProjectedColumn::Computed,
            ]
        );

        let select = single_table_select("select * from testtbl where ID = ?").unwrap();
        assert_eq!(select.projection, vec![ProjectedColumn::All]);
    }

    #[test]
    fn test_single_table_select_rejects_other_shapes() {
        assert!(single_table_select("select * from a join b on a.id = b.id").is_none());
        assert!(single_table_select("select * from a, b").is_none());
        assert!(single_table_select("select 1 union select 2").is_none());
        assert!(single_table_select("delete from testtbl").is_none());
        assert!(single_table_select("select * from lib.testtbl").is_none());
    }

    #[test]
    fn test_parse_declared_type() {
        assert_eq!(
            parse_declared_type("VARCHAR(300)"),
            Some(("VARCHAR".to_string(), 300, 0))
        );
        assert_eq!(
            parse_declared_type("decimal(15, 2)"),
            Some(("DECIMAL".to_string(), 15, 2))
        );
        assert_eq!(
            parse_declared_type("INTEGER"),
            Some(("INTEGER".to_string(), 0, 0))
        );
        assert_eq!(parse_declared_type(""), None);
        assert_eq!(parse_declared_type("CHAR(x)"), None);
    }
}

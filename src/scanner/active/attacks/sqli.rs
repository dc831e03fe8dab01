//! SQL Injection testing

use async_trait::async_trait;
use regex::Regex;

use super::limited;
use crate::error::ScanPluginError;
use crate::scanner::active::{ActiveScanPlugin, AttackContext};
use crate::scanner::alerts::{Alert, Confidence, Risk};

pub const SQL_INJECTION_PLUGIN_ID: u32 = 40018;

/// SQL error patterns
const SQL_ERROR_PATTERNS: &[(&str, &str)] = &[
    (r"SQL syntax.*MySQL", "MySQL"),
    (r"Warning.*mysql_", "MySQL"),
    (r"valid MySQL result", "MySQL"),
    (r"MySqlClient\.", "MySQL"),
    (r"PostgreSQL.*ERROR", "PostgreSQL"),
    (r"Warning.*\Wpg_", "PostgreSQL"),
    (r"valid PostgreSQL result", "PostgreSQL"),
    (r"Npgsql\.", "PostgreSQL"),
    (r"Driver.*SQL[\-\_\ ]*Server", "MSSQL"),
    (r"OLE DB.*SQL Server", "MSSQL"),
    (r"\bSQL Server\b.*Driver", "MSSQL"),
    (r"Warning.*mssql_", "MSSQL"),
    (r"(?s)Exception.*\bSystem\.Data\.SqlClient\.", "MSSQL"),
    (r"Unclosed quotation mark after", "MSSQL"),
    (r"CLI Driver.*DB2", "DB2"),
    (r"DB2 SQL error", "DB2"),
    (r"ORA-\d{5}", "Oracle"),
    (r"Oracle.*Driver", "Oracle"),
    (r"Warning.*\Woci_", "Oracle"),
    (r"SQLite/JDBCDriver", "SQLite"),
    (r"SQLite\.Exception", "SQLite"),
    (r"System\.Data\.SQLite\.SQLiteException", "SQLite"),
    (r"Warning.*sqlite_", "SQLite"),
    (r"\[SQLITE_ERROR\]", "SQLite"),
    (r"(?i)quoted string not properly terminated", "Generic"),
    (r"(?i)unterminated quoted string", "Generic"),
];

/// Error-provoking payloads, cheapest first
const SQLI_PAYLOADS: &[&str] = &[
    "'",
    "\"",
    "')",
    "' OR '1'='1",
    "1' OR 1=1 --",
    "\" OR \"1\"=\"1",
    "' UNION SELECT NULL--",
    "' UNION SELECT NULL,NULL--",
    "1; SELECT 1--",
    "1' AND '1'='1",
    "' AND 1=CONVERT(int,(SELECT TOP 1 table_name FROM information_schema.tables))--",
];

/// Error-based SQL injection: a payload makes a database error appear
/// that the original response did not contain
#[derive(Debug)]
pub struct SqlInjectionPlugin {
    patterns: Vec<(Regex, &'static str)>,
}

impl SqlInjectionPlugin {
    pub fn new() -> Self {
        let patterns = SQL_ERROR_PATTERNS
            .iter()
            .filter_map(|(pattern, db)| Regex::new(pattern).ok().map(|r| (r, *db)))
            .collect();
        Self { patterns }
    }

    /// First database error in `body` that `baseline` does not have
    fn new_error<'a>(&'a self, body: &str, baseline: &str) -> Option<(&'a Regex, &'static str)> {
        self.patterns
            .iter()
            .find(|(re, _)| re.is_match(body) && !re.is_match(baseline))
            .map(|(re, db)| (re, *db))
    }
}

impl Default for SqlInjectionPlugin {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ActiveScanPlugin for SqlInjectionPlugin {
    fn id(&self) -> u32 {
        SQL_INJECTION_PLUGIN_ID
    }

    fn name(&self) -> &str {
        "SQL Injection"
    }

    fn priority(&self) -> i32 {
        20
    }

    async fn scan(&self, ctx: &AttackContext) -> Result<(), ScanPluginError> {
        let baseline = ctx.base().response_body.text();

        for payload in limited(SQLI_PAYLOADS, ctx.strength()) {
            if ctx.is_stopped() {
                break;
            }
            let value = format!("{}{}", ctx.point().original, payload);
            let response = ctx.attack(&value).await?;
            let body = response.response_body.text();

            if let Some((pattern, db)) = self.new_error(&body, &baseline) {
                let evidence = pattern.find(&body).map(|m| m.as_str().to_string()).unwrap_or_default();
                ctx.raise(
                    Alert::new(self.id(), self.name(), Risk::High, Confidence::Medium)
                        .with_attack(&value)
                        .with_evidence(&evidence)
                        .with_description(&format!(
                            "SQL injection may be possible through '{}'. Database type: {}",
                            ctx.point().name,
                            db
                        ))
                        .with_solution(
                            "Use parameterized queries or prepared statements. Never concatenate user input into SQL queries.",
                        )
                        .with_tag("database", db)
                        .with_cwe(89)
                        .with_wasc(19),
                );
                return Ok(());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_must_be_new() {
        let plugin = SqlInjectionPlugin::new();
        let error = "You have an error in your SQL syntax; check the manual for your MySQL server";

        let (_, db) = plugin.new_error(error, "<html>fine</html>").unwrap();
        assert_eq!(db, "MySQL");
        // Already on the page before the attack
        assert!(plugin.new_error(error, error).is_none());
    }

    #[test]
    fn test_all_patterns_compile() {
        assert_eq!(SqlInjectionPlugin::new().patterns.len(), SQL_ERROR_PATTERNS.len());
    }

    #[test]
    fn test_oracle_error_code() {
        let plugin = SqlInjectionPlugin::new();
        let (_, db) = plugin.new_error("ORA-01756: quoted string", "").unwrap();
        assert_eq!(db, "Oracle");
    }
}

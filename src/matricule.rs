use crate::config::MatriculeConfig;
use chrono::Datelike;
use rusqlite::Connection;

pub fn current_year() -> i32 {
    chrono::Local::now().year()
}

fn stem(cfg: &MatriculeConfig, year: i32) -> String {
    if cfg.include_year {
        format!("{}{}{}{}", cfg.prefix, cfg.separator, year, cfg.separator)
    } else {
        format!("{}{}", cfg.prefix, cfg.separator)
    }
}

pub fn format_matricule(cfg: &MatriculeConfig, year: i32, seq: u32) -> String {
    format!("{}{:0width$}", stem(cfg, year), seq, width = cfg.padding)
}

/// Sequence number of a matricule issued under the same prefix and year.
pub fn parse_sequence(cfg: &MatriculeConfig, year: i32, matricule: &str) -> Option<u32> {
    let rest = matricule.trim().strip_prefix(&stem(cfg, year))?;
    if rest.is_empty() || !rest.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    rest.parse().ok()
}

pub fn next_sequence<'a, I>(cfg: &MatriculeConfig, year: i32, existing: I) -> u32
where
    I: IntoIterator<Item = &'a str>,
{
    existing
        .into_iter()
        .filter_map(|m| parse_sequence(cfg, year, m))
        .max()
        .map(|n| n.saturating_add(1))
        .unwrap_or(1)
}

pub fn next_matricule(conn: &Connection, cfg: &MatriculeConfig, year: i32) -> anyhow::Result<String> {
    let mut stmt = conn.prepare("SELECT matricule FROM students WHERE matricule IS NOT NULL")?;
    let existing = stmt
        .query_map([], |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    let seq = next_sequence(cfg, year, existing.iter().map(String::as_str));
    Ok(format_matricule(cfg, year, seq))
}

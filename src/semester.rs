use crate::config::SemesterMatching;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeriodKind {
    Semestre,
    Trimestre,
}

impl PeriodKind {
    fn word(self) -> &'static str {
        match self {
            PeriodKind::Semestre => "semestre",
            PeriodKind::Trimestre => "trimestre",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Period {
    pub index: u32,
    pub kind: PeriodKind,
}

impl Period {
    pub fn canonical(self) -> String {
        format!("{}_{}", ordinal(self.index), self.kind.word())
    }
}

pub fn ordinal(index: u32) -> String {
    if index == 1 {
        "1er".to_string()
    } else {
        format!("{}eme", index)
    }
}

fn ordinal_word(word: &str) -> Option<u32> {
    match word {
        "premier" | "premiere" | "première" => Some(1),
        "second" | "seconde" | "deuxieme" | "deuxième" => Some(2),
        "troisieme" | "troisième" => Some(3),
        _ => None,
    }
}

/// Strips an ordinal suffix such as `er`, `eme`, `ème`, `e` from a leading number.
fn leading_ordinal(token: &str) -> Option<u32> {
    let digits: String = token.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return ordinal_word(token);
    }
    let rest = &token[digits.len()..];
    if !matches!(rest, "" | "er" | "ere" | "re" | "eme" | "ème" | "e" | "nd" | "nde") {
        return None;
    }
    digits.parse().ok().filter(|n: &u32| *n > 0)
}

fn trailing_number(token: &str, word: &str) -> Option<u32> {
    let rest = token.strip_prefix(word)?;
    if rest.is_empty() || !rest.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    rest.parse().ok().filter(|n: &u32| *n > 0)
}

pub fn parse_period(tag: &str) -> Option<Period> {
    let lowered = tag.trim().to_lowercase();
    if lowered.is_empty() {
        return None;
    }
    let tokens: Vec<&str> = lowered
        .split(|c: char| c == '_' || c == '-' || c.is_whitespace())
        .filter(|t| !t.is_empty())
        .collect();

    match tokens.as_slice() {
        [single] => {
            if let Some(n) = single.parse::<u32>().ok().filter(|n| *n > 0) {
                return Some(Period {
                    index: n,
                    kind: PeriodKind::Semestre,
                });
            }
            for kind in [PeriodKind::Semestre, PeriodKind::Trimestre] {
                if let Some(n) = trailing_number(single, kind.word()) {
                    return Some(Period { index: n, kind });
                }
            }
            if let Some(n) = trailing_number(single, "s") {
                return Some(Period {
                    index: n,
                    kind: PeriodKind::Semestre,
                });
            }
            if let Some(n) = trailing_number(single, "t") {
                return Some(Period {
                    index: n,
                    kind: PeriodKind::Trimestre,
                });
            }
            None
        }
        [a, b] => {
            for kind in [PeriodKind::Semestre, PeriodKind::Trimestre] {
                if *b == kind.word() {
                    return leading_ordinal(a).map(|index| Period { index, kind });
                }
                if *a == kind.word() {
                    return b
                        .parse::<u32>()
                        .ok()
                        .filter(|n| *n > 0)
                        .map(|index| Period { index, kind });
                }
            }
            None
        }
        _ => None,
    }
}

/// Canonical tag for a semester spelling. Unrecognised tags come back trimmed.
pub fn canonical_semester(tag: &str) -> String {
    match parse_period(tag) {
        Some(p) => p.canonical(),
        None => tag.trim().to_string(),
    }
}

pub fn semester_index(tag: &str) -> Option<u32> {
    parse_period(tag).map(|p| p.index)
}

pub fn matches_semester(tag: Option<&str>, target: u32, matching: SemesterMatching) -> bool {
    let tag = tag.map(str::trim).filter(|t| !t.is_empty());
    match tag {
        None => matching == SemesterMatching::Permissive,
        Some(t) => semester_index(t) == Some(target),
    }
}

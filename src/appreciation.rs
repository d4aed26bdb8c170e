use serde::Serialize;

pub const NOT_AVAILABLE: &str = "N/A";

/// Bands printed on official bulletins. Ordered from the highest threshold down.
pub const BANDS: [(f64, &str); 6] = [
    (80.0, "Excellent"),
    (70.0, "Très Bien"),
    (60.0, "Bien"),
    (50.0, "Assez Bien"),
    (40.0, "Passable"),
    (30.0, "Insuffisant"),
];

pub const LOWEST_BAND: &str = "Médiocre";

pub fn appreciation(grade: f64, max_scale: f64) -> &'static str {
    if !grade.is_finite() || !max_scale.is_finite() || max_scale <= 0.0 {
        return NOT_AVAILABLE;
    }
    let percent = 100.0 * grade / max_scale;
    BANDS
        .iter()
        .find(|(min, _)| percent >= *min)
        .map(|(_, label)| *label)
        .unwrap_or(LOWEST_BAND)
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LegendEntry {
    pub min_percent: f64,
    pub label: &'static str,
}

/// Legend rows for the class bulletin footer, lowest band last with a 0% floor.
pub fn legend() -> Vec<LegendEntry> {
    let mut out: Vec<LegendEntry> = BANDS
        .iter()
        .map(|(min, label)| LegendEntry {
            min_percent: *min,
            label,
        })
        .collect();
    out.push(LegendEntry {
        min_percent: 0.0,
        label: LOWEST_BAND,
    });
    out
}

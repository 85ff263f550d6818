// Human-readable safety card for a ChemicalRecord

use crate::core::types::ChemicalRecord;
use std::fmt::Write;

const UNKNOWN: &str = "unknown";
pub const NO_RECORD_PLACEHOLDER: &str = "Chemical information unavailable";

fn scalar(value: Option<&str>) -> &str {
    match value {
        Some(v) if !v.trim().is_empty() => v,
        _ => UNKNOWN,
    }
}

fn bullet_list(out: &mut String, items: Option<&[String]>, what: &str) {
    match items {
        Some(items) if !items.is_empty() => {
            for item in items {
                let _ = writeln!(out, "- {}", item);
            }
        }
        _ => {
            let _ = writeln!(out, "No {} provided", what);
        }
    }
}

/// Render a record as a safety information card.
///
/// Absent scalars print as `unknown`; absent or empty lists print a
/// "No ... provided" line.
pub fn format_record(record: &ChemicalRecord) -> String {
    let name = record.name.as_ref();
    let zh = scalar(name.and_then(|n| n.zh.as_deref()));
    let en = scalar(name.and_then(|n| n.en.as_deref()));

    let mut out = String::new();
    let _ = writeln!(out, "Chemical Safety Card");
    let _ = writeln!(out, "========================");
    let _ = writeln!(out);
    let _ = writeln!(out, "[Basic information]");
    let _ = writeln!(out, "Name: {} / {}", zh, en);
    let _ = writeln!(out, "Formula: {}", scalar(record.formula.as_deref()));
    let _ = writeln!(out, "CAS: {}", scalar(record.cas_number.as_deref()));
    let _ = writeln!(out);
    let _ = writeln!(out, "[Hazards]");
    let _ = writeln!(out, "Hazard class: {}", scalar(record.hazard_class.as_deref()));
    let _ = writeln!(out);
    let _ = writeln!(out, "Main hazards:");
    bullet_list(&mut out, record.main_hazards.as_deref(), "main hazard information");
    let _ = writeln!(out);
    let _ = writeln!(out, "[Protection]");
    let _ = writeln!(out, "Safety measures:");
    bullet_list(&mut out, record.safety_measures.as_deref(), "safety measures");
    let _ = writeln!(out);
    let _ = writeln!(out, "[Emergency response]");
    let _ = writeln!(out, "First aid:");
    bullet_list(&mut out, record.first_aid.as_deref(), "first aid measures");
    let _ = writeln!(out);
    let _ = writeln!(out, "[Storage]");
    let _ = writeln!(out, "Storage notes:");
    bullet_list(&mut out, record.storage.as_deref(), "storage notes");
    out
}

pub fn format_record_or_placeholder(record: Option<&ChemicalRecord>) -> String {
    record
        .map(format_record)
        .unwrap_or_else(|| NO_RECORD_PLACEHOLDER.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::ChemicalName;

    #[test]
    fn test_empty_record_renders_unknowns() {
        let card = format_record(&ChemicalRecord::default());
        assert!(card.contains("Name: unknown / unknown"));
        assert!(card.contains("Formula: unknown"));
        assert!(card.contains("CAS: unknown"));
        assert!(card.contains("Hazard class: unknown"));
        assert!(card.contains("No main hazard information provided"));
        assert!(card.contains("No storage notes provided"));
    }

    #[test]
    fn test_full_record() {
        let record = ChemicalRecord {
            name: Some(ChemicalName {
                zh: Some("乙醇".to_string()),
                en: Some("Ethanol".to_string()),
            }),
            formula: Some("C2H5OH".to_string()),
            first_aid: Some(vec!["Move to fresh air".to_string(), "Rinse eyes".to_string()]),
            main_hazards: Some(vec![]),
            ..Default::default()
        };
        let card = format_record(&record);
        assert!(card.contains("Name: 乙醇 / Ethanol"));
        assert!(card.contains("Formula: C2H5OH"));
        assert!(card.contains("- Move to fresh air\n- Rinse eyes\n"));
        assert!(card.contains("No main hazard information provided"));
    }

    #[test]
    fn test_placeholder_when_absent() {
        assert_eq!(format_record_or_placeholder(None), NO_RECORD_PLACEHOLDER);
        assert!(format_record_or_placeholder(Some(&ChemicalRecord::default()))
            .starts_with("Chemical Safety Card"));
    }
}

// Recover a ChemicalRecord from free-form model output

use crate::core::types::ChemicalRecord;
use tracing::{debug, warn};

const FENCE: &str = "```";

/// Content of the first fenced block, or the input when there is no fence.
///
/// The opening fence may carry a language tag (```` ```json ````). Without a
/// closing fence everything after the opening one is kept.
fn strip_code_fence(content: &str) -> &str {
    let Some(open) = content.find(FENCE) else {
        return content;
    };

    let after_fence = &content[open + FENCE.len()..];
    let tag_len = after_fence
        .find(|c: char| !c.is_ascii_alphanumeric())
        .unwrap_or(after_fence.len());
    let body = &after_fence[tag_len..];

    match body.find(FENCE) {
        Some(close) => body[..close].trim(),
        None => body.trim(),
    }
}

/// First brace-balanced substring starting at the first `{`.
///
/// Braces inside string literals are counted like any other, so a string
/// value containing `{` or `}` can end the scan early or late.
fn first_balanced_object(content: &str) -> Option<&str> {
    let start = content.find('{')?;
    let mut depth = 0usize;
    for (offset, c) in content[start..].char_indices() {
        match c {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&content[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

fn parse_record(candidate: &str) -> Result<ChemicalRecord, serde_json::Error> {
    serde_json::from_str(candidate)
}

/// Extract a [`ChemicalRecord`] from raw model text.
///
/// Tries, in order: the (fence-stripped) content as-is, the content with a
/// missing trailing `}` appended, and the first balanced `{...}` span. Returns
/// `None` when all of them fail; never panics.
pub fn extract_chemical_record(raw: &str) -> Option<ChemicalRecord> {
    let content = strip_code_fence(raw.trim());

    let first_error = match parse_record(content) {
        Ok(record) => return Some(record),
        Err(e) => e,
    };
    debug!("Direct record parse failed: {}", first_error);

    let repaired = if content.starts_with('{') && !content.ends_with('}') {
        let repaired = format!("{}}}", content);
        if let Ok(record) = parse_record(&repaired) {
            debug!("Record recovered by closing truncated object");
            return Some(record);
        }
        repaired
    } else {
        content.to_string()
    };

    match first_balanced_object(&repaired) {
        Some(candidate) => match parse_record(candidate) {
            Ok(record) => {
                debug!("Record recovered from embedded object at brace scan");
                Some(record)
            }
            Err(e) => {
                warn!("Embedded object is not a chemical record ({}): {}", e, candidate);
                None
            }
        },
        None => {
            warn!("No JSON object found in model output: {}", raw);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::ChemicalName;

    fn formula(record: Option<ChemicalRecord>) -> Option<String> {
        record.and_then(|r| r.formula)
    }

    #[test]
    fn test_fenced_json() {
        let raw = "```json\n{\"formula\":\"H2SO4\",\"cas\":\"7664-93-9\"}\n```";
        let record = extract_chemical_record(raw).unwrap();
        assert_eq!(record.formula.as_deref(), Some("H2SO4"));
        assert_eq!(record.cas_number.as_deref(), Some("7664-93-9"));
    }

    #[test]
    fn test_fence_without_tag_or_close() {
        let raw = "Result:\n```\n{\"formula\":\"KOH\"}";
        assert_eq!(formula(extract_chemical_record(raw)), Some("KOH".to_string()));
    }

    #[test]
    fn test_prose_wrapped_json() {
        let raw = "Here is the data: {\"formula\":\"HCl\"} hope this helps";
        assert_eq!(formula(extract_chemical_record(raw)), Some("HCl".to_string()));
    }

    #[test]
    fn test_truncated_json() {
        let raw = "{\"formula\":\"NaOH\"";
        assert_eq!(formula(extract_chemical_record(raw)), Some("NaOH".to_string()));
    }

    #[test]
    fn test_no_brace_is_absent() {
        assert!(extract_chemical_record("I cannot help with that.").is_none());
        assert!(extract_chemical_record("").is_none());
    }

    #[test]
    fn test_unbalanced_prose_is_absent() {
        assert!(extract_chemical_record("see {\"formula\": \"HCl\" and more").is_none());
    }

    #[test]
    fn test_first_object_wins() {
        let raw = "Example: {\"formula\":\"X\"} Actual: {\"formula\":\"CH3OH\"}";
        assert_eq!(formula(extract_chemical_record(raw)), Some("X".to_string()));
    }

    #[test]
    fn test_camel_case_aliases_accepted() {
        let raw = r#"{"name":{"en":"Acetone"},"casNumber":"67-64-1","hazardClass":"3","firstAid":["Rinse"]}"#;
        let record = extract_chemical_record(raw).unwrap();
        assert_eq!(record.name.unwrap().en.as_deref(), Some("Acetone"));
        assert_eq!(record.cas_number.as_deref(), Some("67-64-1"));
        assert_eq!(record.hazard_class.as_deref(), Some("3"));
        assert_eq!(record.first_aid, Some(vec!["Rinse".to_string()]));
    }

    #[test]
    fn test_serialized_record_round_trips() {
        let record = ChemicalRecord {
            name: Some(ChemicalName {
                zh: Some("硫酸".to_string()),
                en: Some("Sulfuric acid".to_string()),
            }),
            formula: Some("H2SO4".to_string()),
            cas_number: Some("7664-93-9".to_string()),
            hazard_class: Some("8".to_string()),
            main_hazards: Some(vec!["Causes severe burns".to_string()]),
            safety_measures: Some(vec!["Wear gloves".to_string(), "Use a fume hood".to_string()]),
            first_aid: Some(vec!["Rinse with water".to_string()]),
            storage: Some(vec!["Keep away from bases".to_string()]),
        };
        let json = serde_json::to_string(&record).unwrap();

        assert_eq!(extract_chemical_record(&json), Some(record.clone()));
        assert_eq!(
            extract_chemical_record(&format!("```json\n{}\n```", json)),
            Some(record.clone())
        );
        // Drop the final brace
        assert_eq!(
            extract_chemical_record(&json[..json.len() - 1]),
            Some(record)
        );
    }

    #[test]
    fn test_idempotent_on_own_output() {
        let once = extract_chemical_record("text {\"formula\":\"NH3\",\"storage\":[\"cool\"]} end").unwrap();
        let twice = extract_chemical_record(&serde_json::to_string(&once).unwrap()).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_same_raw_text_gives_same_result() {
        let inputs = [
            "Here is the data: {\"formula\":\"HCl\"} hope this helps",
            "{\"formula\":\"NaOH\",\"first_aid\":[\"Rinse\"]",
            "```json\n{\"cas\":\"7664-93-9\"}\n```",
            "no structured data here",
        ];
        for raw in inputs {
            assert_eq!(extract_chemical_record(raw), extract_chemical_record(raw), "{}", raw);
        }
        assert!(extract_chemical_record(inputs[0]).is_some());
        assert!(extract_chemical_record(inputs[1]).is_some());
    }

    #[test]
    fn test_non_object_json_is_absent() {
        assert!(extract_chemical_record("[1, 2, 3]").is_none());
        assert!(extract_chemical_record("\"just a string\"").is_none());
    }

    #[test]
    fn test_strip_code_fence() {
        assert_eq!(strip_code_fence("```json\n{}\n```"), "{}");
        assert_eq!(strip_code_fence("no fence"), "no fence");
        assert_eq!(strip_code_fence("a ```{\"x\":1}``` b"), "{\"x\":1}");
    }
}

// Instruction templates keyed by detected class name

use crate::core::errors::TemplateError;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use tracing::{debug, info};

pub const DEFAULT_TEMPLATE_KEY: &str = "default";
const SLOT: &str = "{}";

fn check_template(class_name: &str, template: &str) -> Result<(), TemplateError> {
    let slots = template.matches(SLOT).count();
    if slots != 1 {
        return Err(TemplateError::InvalidSlotCount {
            class_name: class_name.to_string(),
            slots,
        });
    }
    Ok(())
}

/// Maps class names to instruction templates.
///
/// Lookup order: exact key, then the longest key contained in the class name
/// (case-insensitive), then `default`. Templates may be registered while the
/// builder is shared between tasks.
pub struct InstructionBuilder {
    templates: RwLock<BTreeMap<String, String>>,
}

impl InstructionBuilder {
    pub fn new(templates: BTreeMap<String, String>) -> Result<Self, TemplateError> {
        if !templates.contains_key(DEFAULT_TEMPLATE_KEY) {
            return Err(TemplateError::MissingDefault);
        }
        for (class_name, template) in &templates {
            check_template(class_name, template)?;
        }

        debug!("Instruction builder ready with {} templates", templates.len());
        Ok(Self {
            templates: RwLock::new(templates),
        })
    }

    /// Add or replace the template for `class_name`
    pub fn register(&self, class_name: &str, template: &str) -> Result<(), TemplateError> {
        check_template(class_name, template)?;
        let replaced = self
            .templates
            .write()
            .insert(class_name.to_string(), template.to_string())
            .is_some();
        info!(
            "{} instruction template for '{}'",
            if replaced { "Replaced" } else { "Registered" },
            class_name
        );
        Ok(())
    }

    /// Template key that `class_name` resolves to
    pub fn resolve_key(&self, class_name: &str) -> String {
        let templates = self.templates.read();
        if templates.contains_key(class_name) {
            return class_name.to_string();
        }

        let lowered = class_name.to_lowercase();
        templates
            .keys()
            .filter(|key| key.as_str() != DEFAULT_TEMPLATE_KEY && !key.is_empty())
            .filter(|key| lowered.contains(&key.to_lowercase()))
            // Longest key wins; BTreeMap order breaks ties
            .fold(None::<&String>, |best, key| match best {
                Some(b) if b.len() >= key.len() => Some(b),
                _ => Some(key),
            })
            .cloned()
            .unwrap_or_else(|| DEFAULT_TEMPLATE_KEY.to_string())
    }

    /// Instruction for `class_name` with `text` substituted verbatim
    pub fn build(&self, class_name: &str, text: &str) -> String {
        let key = self.resolve_key(class_name);
        let templates = self.templates.read();
        // `default` cannot be removed, so the lookup always succeeds
        let template = templates
            .get(&key)
            .or_else(|| templates.get(DEFAULT_TEMPLATE_KEY))
            .map(String::as_str)
            .unwrap_or(SLOT);
        debug!("Class '{}' uses template '{}'", class_name, key);
        template.replacen(SLOT, text, 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::default_instruction_templates;
    use std::sync::Arc;

    fn builder() -> InstructionBuilder {
        InstructionBuilder::new(default_instruction_templates()).unwrap()
    }

    #[test]
    fn test_exact_match_wins() {
        assert_eq!(builder().resolve_key("liquid"), "liquid");
    }

    #[test]
    fn test_case_insensitive_substring() {
        let b = builder();
        assert_eq!(b.resolve_key("Chemical_Bottle"), "chemical");
        assert_eq!(b.resolve_key("small-LIQUID-flask"), "liquid");
        assert_eq!(b.resolve_key("box"), "default");
    }

    #[test]
    fn test_longest_substring_wins() {
        let b = builder();
        b.register("hazardous_chemical", "HC: {}").unwrap();
        assert_eq!(b.resolve_key("hazardous_chemical_drum"), "hazardous_chemical");
    }

    #[test]
    fn test_text_substituted_verbatim() {
        let mut templates = BTreeMap::new();
        templates.insert("default".to_string(), "Analyze: {}".to_string());
        let b = InstructionBuilder::new(templates).unwrap();
        let text = "H2SO4 {} 98% 硫酸";
        assert_eq!(b.build("bottle", text), "Analyze: H2SO4 {} 98% 硫酸");
        assert_eq!(b.build("bottle", ""), "Analyze: ");
    }

    #[test]
    fn test_missing_default_rejected() {
        let mut templates = BTreeMap::new();
        templates.insert("chemical".to_string(), "{}".to_string());
        assert!(matches!(
            InstructionBuilder::new(templates),
            Err(TemplateError::MissingDefault)
        ));
    }

    #[test]
    fn test_register_rejects_bad_slot_count() {
        let b = builder();
        assert!(matches!(
            b.register("acid", "no slot"),
            Err(TemplateError::InvalidSlotCount { slots: 0, .. })
        ));
        assert!(matches!(
            b.register("acid", "{} and {}"),
            Err(TemplateError::InvalidSlotCount { slots: 2, .. })
        ));
        assert_eq!(b.resolve_key("acid"), "default");
    }

    #[test]
    fn test_register_while_shared() {
        let b = Arc::new(builder());
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let b = Arc::clone(&b);
                std::thread::spawn(move || {
                    b.register(&format!("class{}", i), "T: {}").unwrap();
                    b.build("chemical_bottle", "x")
                })
            })
            .collect();
        for handle in handles {
            assert!(handle.join().unwrap().ends_with("x"));
        }
        assert_eq!(b.build("class3", "y"), "T: y");
    }
}

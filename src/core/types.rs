// Data model shared by the pipeline stages

use serde::{Deserialize, Serialize};

/// Axis-aligned box in image pixel coordinates (x1, y1, x2, y2)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl Rect {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn width(&self) -> f32 {
        (self.x2 - self.x1).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.y2 - self.y1).max(0.0)
    }

    /// Integer coordinates, truncated the same way the crops are cut
    pub fn to_int(&self) -> [i32; 4] {
        [
            self.x1 as i32,
            self.y1 as i32,
            self.x2 as i32,
            self.y2 as i32,
        ]
    }

    pub fn contains(&self, other: &Rect) -> bool {
        other.x1 >= self.x1 && other.y1 >= self.y1 && other.x2 <= self.x2 && other.y2 <= self.y2
    }

    /// Clamp to an image of the given size
    pub fn clamp_to(&self, width: u32, height: u32) -> Rect {
        let (w, h) = (width as f32, height as f32);
        Rect {
            x1: self.x1.clamp(0.0, w),
            y1: self.y1.clamp(0.0, h),
            x2: self.x2.clamp(0.0, w),
            y2: self.y2.clamp(0.0, h),
        }
    }
}

/// One candidate object found by the detector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub object_box: Rect,
    pub confidence: f32,
    pub class_id: i64,
}

/// Bilingual chemical name
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChemicalName {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zh: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub en: Option<String>,
}

/// Chemical safety record recovered from a model response.
///
/// Every field is optional: a key the model left out stays `None`, which is
/// distinct from an empty list. Defaults are only applied when rendering.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChemicalRecord {
    #[serde(
        default,
        rename = "chemical_name",
        alias = "name",
        skip_serializing_if = "Option::is_none"
    )]
    pub name: Option<ChemicalName>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub formula: Option<String>,

    #[serde(
        default,
        rename = "cas",
        alias = "casNumber",
        alias = "cas_number",
        skip_serializing_if = "Option::is_none"
    )]
    pub cas_number: Option<String>,

    #[serde(default, alias = "hazardClass", skip_serializing_if = "Option::is_none")]
    pub hazard_class: Option<String>,

    #[serde(default, alias = "mainHazards", skip_serializing_if = "Option::is_none")]
    pub main_hazards: Option<Vec<String>>,

    #[serde(default, alias = "safetyMeasures", skip_serializing_if = "Option::is_none")]
    pub safety_measures: Option<Vec<String>>,

    #[serde(default, alias = "firstAid", skip_serializing_if = "Option::is_none")]
    pub first_aid: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<Vec<String>>,
}

/// Result for a single retained detection
#[derive(Debug, Clone, Serialize)]
pub struct PipelineResult {
    pub class_name: String,
    pub confidence: f32,
    pub object_box: [i32; 4],
    pub label_box: [i32; 4],
    pub text: String,
    pub instruction: String,
    pub analysis: String,
    pub chemical_record: Option<ChemicalRecord>,
}

/// Stages a single run moves through, used for logging
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Detecting,
    Cropping,
    ExtractingText,
    BuildingInstruction,
    QueryingModel,
    ExtractingStructured,
    Aggregating,
    Done,
    Fatal,
}

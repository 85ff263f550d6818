use crate::core::types::Rect;

/// Fraction of the object's height, from the top, that holds the label
pub const LABEL_HEIGHT_FRACTION: f32 = 0.3;

/// Derive the label region of a detected bottle.
///
/// The label is assumed to sit in the top 30% of the object box. Degenerate
/// boxes pass through unchanged and simply produce an empty crop later.
pub fn derive_label_region(object_box: &Rect) -> Rect {
    let Rect { x1, y1, x2, y2 } = *object_box;
    Rect {
        x1,
        y1,
        x2,
        y2: (y1 + LABEL_HEIGHT_FRACTION * (y2 - y1)).min(y2),
    }
}

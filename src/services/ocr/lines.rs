// Text line segmentation by horizontal ink projection

use image::GrayImage;

/// Vertical padding added around each detected line band
const LINE_PADDING: u32 = 2;

/// Rows where more than this share of pixels is ink mean the crop has a dark
/// background; projection splitting is meaningless there
const DARK_BACKGROUND_RATIO: f32 = 0.9;

/// Split a grayscale crop into text line bands (top, bottom exclusive).
///
/// A row is an ink row when it holds at least one pixel per 200 columns darker
/// than `ink_threshold`. Consecutive ink rows form a band; bands thinner than
/// `min_line_height` are dropped as noise. Bands come back top to bottom. A
/// crop without usable bands yields a single band covering the whole crop.
pub fn split_text_lines(gray: &GrayImage, ink_threshold: u8, min_line_height: u32) -> Vec<(u32, u32)> {
    let (width, height) = gray.dimensions();
    if width == 0 || height == 0 {
        return Vec::new();
    }

    let min_ink_pixels = (width / 200).max(1);
    let ink_rows: Vec<bool> = (0..height)
        .map(|y| {
            let ink = (0..width)
                .filter(|&x| gray.get_pixel(x, y)[0] < ink_threshold)
                .count() as u32;
            ink >= min_ink_pixels
        })
        .collect();

    let ink_row_count = ink_rows.iter().filter(|&&r| r).count();
    if ink_row_count as f32 > height as f32 * DARK_BACKGROUND_RATIO {
        return vec![(0, height)];
    }

    let mut bands = Vec::new();
    let mut start: Option<u32> = None;
    for (y, &is_ink) in ink_rows.iter().enumerate() {
        let y = y as u32;
        match (is_ink, start) {
            (true, None) => start = Some(y),
            (false, Some(s)) => {
                bands.push((s, y));
                start = None;
            }
            _ => {}
        }
    }
    if let Some(s) = start {
        bands.push((s, height));
    }

    let bands: Vec<(u32, u32)> = bands
        .into_iter()
        .filter(|(top, bottom)| bottom - top >= min_line_height)
        .map(|(top, bottom)| {
            (
                top.saturating_sub(LINE_PADDING),
                (bottom + LINE_PADDING).min(height),
            )
        })
        .collect();

    if bands.is_empty() {
        vec![(0, height)]
    } else {
        bands
    }
}

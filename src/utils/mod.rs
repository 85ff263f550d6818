pub mod image_ops;

pub use image_ops::{crop_region, load_image_from_memory_async};

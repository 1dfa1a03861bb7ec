pub mod f32;
pub mod filters;
pub mod io;
pub mod label;
pub mod resize;
pub mod traits;

pub use self::f32::ImageF32;
pub use self::filters::{gaussian_blur, gaussian_taps, normalize99, percentile};
pub use self::label::LabelImage;
pub use self::resize::{crop, pad_to_multiple, resize_bilinear, resize_nearest};
pub use self::traits::{ImageView, ImageViewMut};

pub mod convert;
pub mod crop;
pub mod exif;
pub mod jpeg;
pub mod scale;
pub mod scratch;
pub mod stats;
pub mod transform;

pub use convert::{DestinationLayout, YcbcrLayout};
pub use crop::CropAxis;
pub use transform::ActiveConfig;

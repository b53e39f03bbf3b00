pub mod nrrd;
pub mod points;
pub mod scene_io;
pub mod transform_file;
pub mod volume;

pub use nrrd::*;
pub use points::*;
pub use scene_io::*;
pub use transform_file::*;
pub use volume::*;

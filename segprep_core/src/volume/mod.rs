//! Volume and label value types shared by every pipeline stage.

pub mod affine;
pub mod header;
pub mod labels;

pub use affine::{from_matvec, io_orientation, voxel_to_world, AxisCode};
pub use header::Header;
pub use labels::{labels_from_continuous, LabelMap, Labels};

/// Continuous intensity volume.
pub type Volume = ndarray::Array3<f64>;

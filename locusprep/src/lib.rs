//! Batch preparation of microscopy recordings: ND2 to MAT conversion and
//! phase-contrast segmentation, both driven by plain text path lists.

pub mod convert;
pub mod path_list;
pub mod segment;
pub mod utils;

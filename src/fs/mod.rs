pub mod copy;
pub mod fingerprint;

pub use copy::{copy_tree, is_cross_device, CopyOptions, CopyStats};
pub use fingerprint::fingerprint;

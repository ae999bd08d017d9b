mod types;

pub use types::{BlockDevice, BlockRange};

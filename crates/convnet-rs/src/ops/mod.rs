pub mod conv;

pub use conv::{depthwise_conv2d_same, rotate180};

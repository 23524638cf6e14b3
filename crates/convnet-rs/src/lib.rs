pub mod dispatch;
pub mod io;
pub mod network;
pub mod nn;
pub mod ops;
pub mod tensor;

pub use dispatch::Dispatcher;
pub use network::NetworkState;
pub use nn::{Activation, DepthwiseConv2d, Layer};
pub use tensor::Blob;

pub mod depthwise_conv;

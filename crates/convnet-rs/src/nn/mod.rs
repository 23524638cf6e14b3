//! Layer lifecycle contract and tag-dispatched model loading.

pub mod activations;
pub mod layers;

pub use activations::Activation;
pub use layers::depthwise_conv::DepthwiseConv2d;

use std::io::{Read, Write};

use anyhow::{bail, Result};
use rand::RngCore;

use crate::io;
use crate::network::NetworkState;
use crate::tensor::Blob;

/// Uniform shape of a layer, composed by the network driver.
///
/// `prepare` runs exactly once before any `forward`/`backward`; after that
/// the two may alternate in any order the driver chooses. `params`/`grads`
/// are parallel sequences of (weight, gradient) pairs for the optimizer,
/// recomputed on every call rather than retained.
pub trait Layer: std::fmt::Debug {
    /// Stable identifier used by the save format and loader dispatch.
    fn layer_type(&self) -> &'static str;

    /// Slot id assigned by the network on registration.
    fn set_id(&mut self, id: usize);

    fn id(&self) -> usize;

    /// Allocates parameters (unless already loaded) and sizes the caches to
    /// the network batch. Fresh parameters draw from `rng`, so the caller
    /// owns reproducibility.
    fn prepare(&mut self, net: &NetworkState, rng: &mut dyn RngCore) -> Result<()>;

    /// Reads activation slot `id - 1`, writes slot `id`.
    fn forward(&mut self, net: &mut NetworkState) -> Result<()>;

    /// Consumes error slot `id`, refreshes gradients, and (for `id > 1`)
    /// produces error slot `id - 1`.
    fn backward(&mut self, net: &mut NetworkState) -> Result<()>;

    /// Fresh zeroed activation blob for the network to register as slot `id`.
    fn create_out_blob(&self, batch: usize) -> Blob;

    /// Fresh zeroed error blob matching the output shape.
    fn create_diff_blob(&self, batch: usize) -> Blob;

    /// Weight tensors, in the fixed export order.
    fn params(&self) -> Vec<&Blob>;

    /// Gradient tensors, parallel to `params`.
    fn grads(&self) -> Vec<&Blob>;

    /// Serializes the type tag and all persistent fields in fixed order.
    fn save_model(&self, w: &mut dyn Write) -> Result<()>;
}

/// Reads the next layer from `r`, dispatching on the leading type tag.
///
/// Layer variants are enumerated here so the save format stays the only
/// coupling between driver and layer implementations.
pub fn load_layer(r: &mut dyn Read) -> Result<Box<dyn Layer>> {
    let tag = io::read_string(r)?;
    match tag.as_str() {
        DepthwiseConv2d::TYPE => Ok(Box::new(DepthwiseConv2d::from_reader(r)?)),
        other => bail!("unknown layer type tag '{}'", other),
    }
}

//! Network-side collaborators a layer consumes during one training step.
//!
//! The network owns one activation blob and one error (diff) blob per slot,
//! keyed by layer id; slot 0 holds the input batch. A layer reads its
//! predecessor's slot and writes its own, so the accessors hand out split
//! borrows over adjacent slots.

use std::sync::Arc;

use anyhow::{ensure, Result};

use crate::dispatch::Dispatcher;
use crate::nn::Layer;
use crate::tensor::Blob;

pub struct NetworkState {
    batch: usize,
    activations: Vec<Blob>,
    diffs: Vec<Blob>,
    dispatcher: Arc<Dispatcher>,
}

impl NetworkState {
    pub fn new(batch: usize, dispatcher: Dispatcher) -> Self {
        NetworkState {
            batch,
            activations: Vec::new(),
            diffs: Vec::new(),
            dispatcher: Arc::new(dispatcher),
        }
    }

    pub fn batch(&self) -> usize {
        self.batch
    }

    /// Shared handle to the worker pool.
    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        Arc::clone(&self.dispatcher)
    }

    pub fn num_slots(&self) -> usize {
        self.activations.len()
    }

    /// Installs the input batch as the next slot (slot 0 for a fresh state).
    pub fn push_input(&mut self, input: Blob) -> Result<usize> {
        ensure!(
            input.numbers() == self.batch,
            "input batch size {} does not match network batch {}",
            input.numbers(),
            self.batch
        );
        let id = self.activations.len();
        self.diffs.push(input.zeros_like());
        self.activations.push(input);
        Ok(id)
    }

    /// Assigns the next slot id to `layer` and registers the blobs it asks
    /// for as its activation and error slots.
    pub fn register_layer(&mut self, layer: &mut dyn Layer) -> usize {
        let id = self.activations.len();
        layer.set_id(id);
        self.activations.push(layer.create_out_blob(self.batch));
        self.diffs.push(layer.create_diff_blob(self.batch));
        id
    }

    pub fn activation(&self, id: usize) -> &Blob {
        &self.activations[id]
    }

    pub fn activation_mut(&mut self, id: usize) -> &mut Blob {
        &mut self.activations[id]
    }

    pub fn diff(&self, id: usize) -> &Blob {
        &self.diffs[id]
    }

    pub fn diff_mut(&mut self, id: usize) -> &mut Blob {
        &mut self.diffs[id]
    }

    /// Predecessor activation (read) and own activation (write) for slot `id`.
    pub fn forward_pair(&mut self, id: usize) -> (&Blob, &mut Blob) {
        assert!(id >= 1 && id < self.activations.len(), "bad slot id {}", id);
        let (lo, hi) = self.activations.split_at_mut(id);
        (&lo[id - 1], &mut hi[0])
    }

    /// Own error (read) and predecessor error (write) for slot `id`.
    pub fn backward_pair(&mut self, id: usize) -> (&Blob, &mut Blob) {
        assert!(id >= 1 && id < self.diffs.len(), "bad slot id {}", id);
        let (lo, hi) = self.diffs.split_at_mut(id);
        (&hi[0], &mut lo[id - 1])
    }
}

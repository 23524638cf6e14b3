//! Depthwise-separable 2D convolution layer.
//!
//! Each input channel is expanded into `out_channels / in_channels` output
//! channels; every output channel owns its own spatial kernel but reads a
//! single input channel. The constructor rejects channel pairs that break
//! that constraint.

use std::io::{Read, Write};

use anyhow::{anyhow, bail, ensure, Result};
use rand::RngCore;

use crate::io;
use crate::network::NetworkState;
use crate::nn::{Activation, Layer};
use crate::ops;
use crate::tensor::Blob;

#[derive(Debug)]
pub struct DepthwiseConv2d {
    width: usize,
    height: usize,
    in_channels: usize,
    out_channels: usize,
    kernel_size: usize,
    stride: usize,
    activation: Option<Activation>,
    rotate_kernel: bool,
    id: usize,
    kernel: Option<Blob>,
    bias: Option<Blob>,
    kernel_grad: Option<Blob>,
    bias_grad: Option<Blob>,
    z: Option<Blob>,
}

impl DepthwiseConv2d {
    pub const TYPE: &'static str = "DepthwiseConv2d";

    const BIAS_INIT: f32 = 0.1;

    pub fn new(
        width: usize,
        height: usize,
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        stride: usize,
    ) -> Result<Self> {
        ensure!(
            in_channels > 0 && out_channels > 0,
            "channel counts must be positive, got in={} out={}",
            in_channels,
            out_channels
        );
        ensure!(
            out_channels % in_channels == 0,
            "depthwise convolution requires out_channels ({}) to be a multiple of in_channels ({})",
            out_channels,
            in_channels
        );
        ensure!(kernel_size > 0, "kernel size must be positive");
        ensure!(stride > 0, "stride must be positive");
        Ok(DepthwiseConv2d {
            width,
            height,
            in_channels,
            out_channels,
            kernel_size,
            stride,
            activation: None,
            rotate_kernel: false,
            id: 0,
            kernel: None,
            bias: None,
            kernel_grad: None,
            bias_grad: None,
            z: None,
        })
    }

    pub fn with_activation(mut self, activation: Activation) -> Self {
        self.activation = Some(activation);
        self
    }

    /// Selects the 180-degree-flipped kernel when propagating error to the
    /// predecessor. Off by default; the plain kernel matches the historical
    /// behavior, the flipped one is what a finite-difference check validates.
    pub fn rotate_kernel_in_backprop(mut self, rotate: bool) -> Self {
        self.rotate_kernel = rotate;
        self
    }

    pub fn activation(&self) -> Option<Activation> {
        self.activation
    }

    pub fn kernel(&self) -> Option<&Blob> {
        self.kernel.as_ref()
    }

    pub fn kernel_mut(&mut self) -> Option<&mut Blob> {
        self.kernel.as_mut()
    }

    pub fn bias(&self) -> Option<&Blob> {
        self.bias.as_ref()
    }

    pub fn bias_mut(&mut self) -> Option<&mut Blob> {
        self.bias.as_mut()
    }

    pub fn kernel_grad(&self) -> Option<&Blob> {
        self.kernel_grad.as_ref()
    }

    pub fn bias_grad(&self) -> Option<&Blob> {
        self.bias_grad.as_ref()
    }

    /// Pre-activation cache written by the latest `forward`.
    pub fn pre_activation(&self) -> Option<&Blob> {
        self.z.as_ref()
    }

    /// Reconstructs a layer whose type tag has already been consumed.
    ///
    /// The result is equivalent to a prepared layer except for the caches,
    /// which `prepare` sizes once the batch is known; fresh parameter
    /// initialization is skipped.
    pub fn from_reader(r: &mut dyn Read) -> Result<Self> {
        let width = io::read_u32(r)? as usize;
        let height = io::read_u32(r)? as usize;
        let in_channels = io::read_u32(r)? as usize;
        let out_channels = io::read_u32(r)? as usize;
        let kernel_size = io::read_u32(r)? as usize;
        let stride = io::read_u32(r)? as usize;
        let mut layer = Self::new(width, height, in_channels, out_channels, kernel_size, stride)?;

        let kernel = io::read_blob(r)?;
        ensure!(
            kernel.dims() == [1, out_channels, kernel_size, kernel_size],
            "kernel dims {:?} do not match geometry",
            kernel.dims()
        );
        let bias = io::read_blob(r)?;
        ensure!(
            bias.dims() == [1, out_channels, 1, 1],
            "bias dims {:?} do not match geometry",
            bias.dims()
        );
        layer.kernel = Some(kernel);
        layer.bias = Some(bias);

        if io::read_u8(r)? != 0 {
            let tag = io::read_string(r)?;
            let activation = Activation::from_tag(&tag)
                .ok_or_else(|| anyhow!("unknown activation tag '{}'", tag))?;
            layer.activation = Some(activation);
        }
        Ok(layer)
    }
}

impl Layer for DepthwiseConv2d {
    fn layer_type(&self) -> &'static str {
        Self::TYPE
    }

    fn set_id(&mut self, id: usize) {
        self.id = id;
    }

    fn id(&self) -> usize {
        self.id
    }

    fn prepare(&mut self, net: &NetworkState, mut rng: &mut dyn RngCore) -> Result<()> {
        if self.kernel.is_none() && self.bias.is_none() {
            let mut kernel = Blob::new(1, self.out_channels, self.kernel_size, self.kernel_size);
            kernel.fill_gaussian(1.0, &mut rng);
            let mut bias = Blob::new(1, self.out_channels, 1, 1);
            bias.fill(Self::BIAS_INIT);
            self.kernel = Some(kernel);
            self.bias = Some(bias);
        }
        ensure!(
            self.kernel.is_some() && self.bias.is_some(),
            "{} slot {}: kernel and bias must exist together",
            Self::TYPE,
            self.id
        );
        self.z = Some(Blob::new(
            net.batch(),
            self.out_channels,
            self.height,
            self.width,
        ));
        self.kernel_grad = self.kernel.as_ref().map(Blob::zeros_like);
        self.bias_grad = self.bias.as_ref().map(Blob::zeros_like);
        Ok(())
    }

    fn forward(&mut self, net: &mut NetworkState) -> Result<()> {
        let (Some(kernel), Some(bias), Some(z)) =
            (self.kernel.as_ref(), self.bias.as_ref(), self.z.as_mut())
        else {
            bail!("{} slot {} invoked before prepare()", Self::TYPE, self.id);
        };
        let dispatcher = net.dispatcher();
        let activation = self.activation;
        let (input, output) = net.forward_pair(self.id);
        ensure!(
            input.channels() == self.in_channels
                && input.height() == self.height
                && input.width() == self.width,
            "input slot dims {:?} do not match layer geometry",
            input.dims()
        );
        ensure!(
            output.dims() == z.dims(),
            "output slot dims {:?} do not match pre-activation cache {:?}",
            output.dims(),
            z.dims()
        );

        z.fill(0.0);
        ops::depthwise_conv2d_same(&dispatcher, input, kernel, Some(bias), z)?;

        let row_len = z.sample_len();
        match activation {
            Some(act) => {
                let z_data = z.data();
                dispatcher.batch_rows(output.data_mut(), row_len, |n, row| {
                    let pre = &z_data[n * row_len..(n + 1) * row_len];
                    for (out, &x) in row.iter_mut().zip(pre) {
                        *out = act.active(x);
                    }
                    Ok(())
                })?;
            }
            // No nonlinearity attached: the output is the pre-activation.
            None => output.data_mut().copy_from_slice(z.data()),
        }
        Ok(())
    }

    fn backward(&mut self, net: &mut NetworkState) -> Result<()> {
        let (Some(kernel), Some(z), Some(kernel_grad), Some(bias_grad)) = (
            self.kernel.as_ref(),
            self.z.as_ref(),
            self.kernel_grad.as_mut(),
            self.bias_grad.as_mut(),
        ) else {
            bail!("{} slot {} invoked before prepare()", Self::TYPE, self.id);
        };
        let dispatcher = net.dispatcher();
        let batch = net.batch();
        let id = self.id;

        // Phase 1: chain the incoming error through the nonlinearity,
        // turning dLoss/dOutput into dLoss/dZ in place.
        if let Some(act) = self.activation {
            let z_data = z.data();
            let row_len = z.sample_len();
            let diff = net.diff_mut(id);
            ensure!(
                diff.dims() == z.dims(),
                "error slot dims {:?} do not match pre-activation cache {:?}",
                diff.dims(),
                z.dims()
            );
            dispatcher.batch_rows(diff.data_mut(), row_len, |n, row| {
                let pre = &z_data[n * row_len..(n + 1) * row_len];
                for (d, &x) in row.iter_mut().zip(pre) {
                    *d *= act.diff_active(x);
                }
                Ok(())
            })?;
        }

        // Phase 2: kernel and bias gradients, averaged over the batch.
        // Every sample folds into a private partial buffer; the partials are
        // merged after the barrier so the shared gradient is never written
        // concurrently.
        {
            let input = net.activation(id - 1);
            let diff = net.diff(id);
            ensure!(
                input.channels() == self.in_channels
                    && input.height() == self.height
                    && input.width() == self.width,
                "input slot dims {:?} do not match layer geometry",
                input.dims()
            );
            ensure!(
                diff.dims() == z.dims(),
                "error slot dims {:?} do not match pre-activation cache {:?}",
                diff.dims(),
                z.dims()
            );
            let group = self.out_channels / self.in_channels;
            let oc = self.out_channels;
            let k = self.kernel_size;
            let (height, width) = (self.height, self.width);
            let plane = height * width;
            let half = (k / 2) as isize;
            let input_data = input.data();
            let diff_data = diff.data();
            let in_row_len = input.sample_len();
            let diff_row_len = diff.sample_len();
            let kg_len = kernel_grad.len();

            let totals = dispatcher.batch_sum(
                batch,
                || vec![0.0f32; kg_len],
                |acc, n| {
                    let in_row = &input_data[n * in_row_len..(n + 1) * in_row_len];
                    let diff_row = &diff_data[n * diff_row_len..(n + 1) * diff_row_len];
                    for c in 0..oc {
                        let sc = c / group;
                        let in_plane = &in_row[sc * plane..(sc + 1) * plane];
                        let diff_plane = &diff_row[c * plane..(c + 1) * plane];
                        let acc_plane = &mut acc[c * k * k..(c + 1) * k * k];
                        for oy in 0..height {
                            let start_y = oy as isize - half;
                            for ox in 0..width {
                                let d = diff_plane[oy * width + ox];
                                let start_x = ox as isize - half;
                                for kh in 0..k {
                                    let iy = start_y + kh as isize;
                                    if iy < 0 || iy >= height as isize {
                                        continue;
                                    }
                                    let row_base = iy as usize * width;
                                    for kw in 0..k {
                                        let ix = start_x + kw as isize;
                                        if ix < 0 || ix >= width as isize {
                                            continue;
                                        }
                                        acc_plane[kh * k + kw] +=
                                            in_plane[row_base + ix as usize] * d;
                                    }
                                }
                            }
                        }
                    }
                    Ok(())
                },
                |mut a, b| {
                    for (x, y) in a.iter_mut().zip(b) {
                        *x += y;
                    }
                    a
                },
            )?;
            let scale = 1.0 / batch as f32;
            for (g, total) in kernel_grad.data_mut().iter_mut().zip(totals) {
                *g = total * scale;
            }

            bias_grad.fill(0.0);
            let bg = bias_grad.data_mut();
            for n in 0..batch {
                let diff_row = &diff_data[n * diff_row_len..(n + 1) * diff_row_len];
                for c in 0..oc {
                    let mut sum = 0.0;
                    for &d in &diff_row[c * plane..(c + 1) * plane] {
                        sum += d;
                    }
                    bg[c] += sum;
                }
            }
            for v in bg.iter_mut() {
                *v *= scale;
            }
        }

        // Phase 3: propagate the error to the predecessor, except for the
        // first real layer which has no one to propagate to.
        if id > 1 {
            let flipped;
            let backprop_kernel = if self.rotate_kernel {
                flipped = ops::rotate180(kernel);
                &flipped
            } else {
                kernel
            };
            let (diff, prev_diff) = net.backward_pair(id);
            prev_diff.fill(0.0);
            ops::depthwise_conv2d_same(&dispatcher, diff, backprop_kernel, None, prev_diff)?;
        }
        Ok(())
    }

    fn create_out_blob(&self, batch: usize) -> Blob {
        Blob::new(batch, self.out_channels, self.height, self.width)
    }

    fn create_diff_blob(&self, batch: usize) -> Blob {
        Blob::new(batch, self.out_channels, self.height, self.width)
    }

    fn params(&self) -> Vec<&Blob> {
        self.kernel.iter().chain(self.bias.iter()).collect()
    }

    fn grads(&self) -> Vec<&Blob> {
        self.kernel_grad.iter().chain(self.bias_grad.iter()).collect()
    }

    fn save_model(&self, w: &mut dyn Write) -> Result<()> {
        let (Some(kernel), Some(bias)) = (self.kernel.as_ref(), self.bias.as_ref()) else {
            bail!("{} slot {} has no parameters to save", Self::TYPE, self.id);
        };
        io::write_string(w, Self::TYPE)?;
        io::write_u32(w, self.width as u32)?;
        io::write_u32(w, self.height as u32)?;
        io::write_u32(w, self.in_channels as u32)?;
        io::write_u32(w, self.out_channels as u32)?;
        io::write_u32(w, self.kernel_size as u32)?;
        io::write_u32(w, self.stride as u32)?;
        io::write_blob(w, kernel)?;
        io::write_blob(w, bias)?;
        match self.activation {
            Some(act) => {
                io::write_u8(w, 1)?;
                io::write_string(w, act.tag())?;
            }
            None => io::write_u8(w, 0)?,
        }
        Ok(())
    }
}

//! Depthwise same-padded convolution over blob batches.

use anyhow::{ensure, Result};

use crate::dispatch::Dispatcher;
use crate::tensor::Blob;

/// Depthwise convolution with "same" padding: the output keeps the input's
/// spatial extent, the kernel window is centered on each output position
/// (`in_start = out - kernel_size / 2`), and taps falling outside the input
/// contribute zero.
///
/// Channel mapping depends on which side carries the group expansion:
/// - `dst` has `g`x the channels of `src`: dst channel `c` reads src channel
///   `c / g` and dst cells are overwritten (plus `bias[c]` when given);
/// - `src` has `g`x the channels of `dst`: src channel `c` accumulates into
///   dst channel `c / g` (dst must be pre-zeroed by the caller).
///
/// The kernel always carries one `(k, k)` slice per channel of the
/// many-channel side. Work is split one unit per batch sample.
pub fn depthwise_conv2d_same(
    dispatcher: &Dispatcher,
    src: &Blob,
    kernel: &Blob,
    bias: Option<&Blob>,
    dst: &mut Blob,
) -> Result<()> {
    ensure!(
        src.numbers() == dst.numbers(),
        "batch mismatch: src {} vs dst {}",
        src.numbers(),
        dst.numbers()
    );
    ensure!(
        src.height() == dst.height() && src.width() == dst.width(),
        "same-padded convolution requires matching spatial extents"
    );
    let k = kernel.height();
    ensure!(
        kernel.width() == k,
        "kernel must be square, got {}x{}",
        kernel.height(),
        kernel.width()
    );

    let src_c = src.channels();
    let dst_c = dst.channels();
    if dst_c >= src_c {
        ensure!(
            src_c > 0 && dst_c % src_c == 0,
            "dst channels ({}) must be a multiple of src channels ({})",
            dst_c,
            src_c
        );
        ensure!(
            kernel.channels() == dst_c,
            "kernel channels ({}) must match dst channels ({})",
            kernel.channels(),
            dst_c
        );
        expand(dispatcher, src, kernel, bias, dst)
    } else {
        ensure!(
            dst_c > 0 && src_c % dst_c == 0,
            "src channels ({}) must be a multiple of dst channels ({})",
            src_c,
            dst_c
        );
        ensure!(
            kernel.channels() == src_c,
            "kernel channels ({}) must match src channels ({})",
            kernel.channels(),
            src_c
        );
        ensure!(bias.is_none(), "bias is not applied on the reduction path");
        reduce(dispatcher, src, kernel, dst)
    }
}

/// Accumulates one centered window at `(oy, ox)` of `src_plane`.
#[inline]
fn window_sum(
    src_plane: &[f32],
    height: usize,
    width: usize,
    kernel_plane: &[f32],
    k: usize,
    oy: usize,
    ox: usize,
) -> f32 {
    let half = (k / 2) as isize;
    let start_y = oy as isize - half;
    let start_x = ox as isize - half;
    let mut sum = 0.0;
    for kh in 0..k {
        let iy = start_y + kh as isize;
        if iy < 0 || iy >= height as isize {
            continue;
        }
        let row = iy as usize * width;
        for kw in 0..k {
            let ix = start_x + kw as isize;
            if ix < 0 || ix >= width as isize {
                continue;
            }
            sum += src_plane[row + ix as usize] * kernel_plane[kh * k + kw];
        }
    }
    sum
}

fn expand(
    dispatcher: &Dispatcher,
    src: &Blob,
    kernel: &Blob,
    bias: Option<&Blob>,
    dst: &mut Blob,
) -> Result<()> {
    let group = dst.channels() / src.channels();
    let (height, width) = (dst.height(), dst.width());
    let (src_c, dst_c) = (src.channels(), dst.channels());
    let k = kernel.height();
    let plane = height * width;
    let src_row_len = src.sample_len();
    let dst_row_len = dst.sample_len();
    let src_data = src.data();
    let kernel_data = kernel.data();
    let bias_data = bias.map(|b| b.data());

    dispatcher.batch_rows(dst.data_mut(), dst_row_len, |n, row| {
        let src_row = &src_data[n * src_row_len..(n + 1) * src_row_len];
        for c in 0..dst_c {
            let sc = c / group;
            debug_assert!(sc < src_c);
            let src_plane = &src_row[sc * plane..(sc + 1) * plane];
            let kernel_plane = &kernel_data[c * k * k..(c + 1) * k * k];
            let b = bias_data.map(|d| d[c]).unwrap_or(0.0);
            let out_plane = &mut row[c * plane..(c + 1) * plane];
            for oy in 0..height {
                for ox in 0..width {
                    out_plane[oy * width + ox] =
                        window_sum(src_plane, height, width, kernel_plane, k, oy, ox) + b;
                }
            }
        }
        Ok(())
    })
}

fn reduce(dispatcher: &Dispatcher, src: &Blob, kernel: &Blob, dst: &mut Blob) -> Result<()> {
    let group = src.channels() / dst.channels();
    let (height, width) = (dst.height(), dst.width());
    let dst_c = dst.channels();
    let k = kernel.height();
    let plane = height * width;
    let src_row_len = src.sample_len();
    let dst_row_len = dst.sample_len();
    let src_data = src.data();
    let kernel_data = kernel.data();

    dispatcher.batch_rows(dst.data_mut(), dst_row_len, |n, row| {
        let src_row = &src_data[n * src_row_len..(n + 1) * src_row_len];
        for dc in 0..dst_c {
            let out_plane = &mut row[dc * plane..(dc + 1) * plane];
            for c in dc * group..(dc + 1) * group {
                let src_plane = &src_row[c * plane..(c + 1) * plane];
                let kernel_plane = &kernel_data[c * k * k..(c + 1) * k * k];
                for oy in 0..height {
                    for ox in 0..width {
                        out_plane[oy * width + ox] +=
                            window_sum(src_plane, height, width, kernel_plane, k, oy, ox);
                    }
                }
            }
        }
        Ok(())
    })
}

/// Returns the kernel with every `(k, k)` slice flipped 180 degrees.
pub fn rotate180(kernel: &Blob) -> Blob {
    let mut flipped = kernel.zeros_like();
    let [numbers, channels, height, width] = kernel.dims();
    for n in 0..numbers {
        for c in 0..channels {
            for h in 0..height {
                for w in 0..width {
                    let value = kernel.get(n, c, h, w);
                    flipped.set(n, c, height - 1 - h, width - 1 - w, value);
                }
            }
        }
    }
    flipped
}

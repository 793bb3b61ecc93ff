//! Reshaping helpers and the unfold (im2col) transform shared by convolutions

use crate::error::{Error, Result};
use ndarray::{Array2, Array3, Array4, ArrayD, ArrayView4, Axis, Ix2, Ix3, Ix4, IxDyn};

/// Reshape into `dims`, copying only if the array is not in standard layout
pub fn reshape(a: &ArrayD<f32>, dims: &[usize]) -> Result<ArrayD<f32>> {
    Ok(a.as_standard_layout().into_owned().into_shape_with_order(IxDyn(dims))?)
}

/// View `[batch, ..middle, last]` as `[batch, prod(middle), last]`
pub fn as_batch_rows(a: &ArrayD<f32>) -> Result<Array3<f32>> {
    let shape = a.shape();
    if shape.len() < 2 {
        return Err(Error::Shape(format!("expected at least 2 dims, got {shape:?}")));
    }
    let batch = shape[0];
    let last = shape[shape.len() - 1];
    let middle: usize = shape[1..shape.len() - 1].iter().product();
    Ok(reshape(a, &[batch, middle, last])?.into_dimensionality::<Ix3>()?)
}

/// View `[rows.., last]` as a matrix `[prod(rows), last]`
pub fn as_matrix(a: &ArrayD<f32>) -> Result<Array2<f32>> {
    let last = *a.shape().last().ok_or_else(|| Error::Shape("empty shape".into()))?;
    let rows = if last == 0 { 0 } else { a.len() / last };
    Ok(reshape(a, &[rows, last])?.into_dimensionality::<Ix2>()?)
}

/// View `[batch, channels, ..spatial]` as `[batch, channels, prod(spatial)]`
pub fn as_channels(a: &ArrayD<f32>) -> Result<Array3<f32>> {
    let shape = a.shape();
    if shape.len() < 2 {
        return Err(Error::Shape(format!("expected [batch, channels, ..], got {shape:?}")));
    }
    let spatial: usize = shape[2..].iter().product();
    Ok(reshape(a, &[shape[0], shape[1], spatial])?.into_dimensionality::<Ix3>()?)
}

/// Geometry of a 2-D sliding window (1-D convolutions use a height of one)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub kernel: (usize, usize),
    pub stride: (usize, usize),
    pub padding: (usize, usize),
}

impl Window {
    /// Output spatial size for an input of `(height, width)`
    pub fn output_size(&self, height: usize, width: usize) -> Result<(usize, usize)> {
        let (kh, kw) = self.kernel;
        let (sh, sw) = self.stride;
        let (ph, pw) = self.padding;
        if sh == 0 || sw == 0 {
            return Err(Error::Shape("stride must be positive".into()));
        }
        if height + 2 * ph < kh || width + 2 * pw < kw {
            return Err(Error::Shape(format!(
                "kernel {kh}x{kw} larger than padded input {}x{}",
                height + 2 * ph,
                width + 2 * pw
            )));
        }
        Ok(((height + 2 * ph - kh) / sh + 1, (width + 2 * pw - kw) / sw + 1))
    }

    /// Lift a 1-D or 2-D convolution input to `[batch, channels, height, width]`
    pub fn as_image(&self, input: &ArrayD<f32>) -> Result<Array4<f32>> {
        let shape = input.shape();
        let image = match shape.len() {
            3 => reshape(input, &[shape[0], shape[1], 1, shape[2]])?,
            4 => input.as_standard_layout().into_owned(),
            _ => {
                return Err(Error::Shape(format!(
                    "convolution expects [batch, channels, ..spatial], got {shape:?}"
                )))
            }
        };
        Ok(image.into_dimensionality::<Ix4>()?)
    }
}

/// Unfold `[batch, channels, height, width]` into `[batch, channels*kh*kw, out_h*out_w]`
pub fn unfold(input: ArrayView4<'_, f32>, window: &Window) -> Result<Array3<f32>> {
    let (batch, channels, height, width) = input.dim();
    let (out_h, out_w) = window.output_size(height, width)?;
    let (kh, kw) = window.kernel;
    let (sh, sw) = window.stride;
    let (ph, pw) = window.padding;

    let mut cols = Array3::<f32>::zeros((batch, channels * kh * kw, out_h * out_w));
    for b in 0..batch {
        for c in 0..channels {
            for i in 0..kh {
                for j in 0..kw {
                    let row = (c * kh + i) * kw + j;
                    for oy in 0..out_h {
                        let y = (oy * sh + i) as isize - ph as isize;
                        if y < 0 || y >= height as isize {
                            continue;
                        }
                        for ox in 0..out_w {
                            let x = (ox * sw + j) as isize - pw as isize;
                            if x < 0 || x >= width as isize {
                                continue;
                            }
                            cols[[b, row, oy * out_w + ox]] = input[[b, c, y as usize, x as usize]];
                        }
                    }
                }
            }
        }
    }
    Ok(cols)
}

/// Inverse of [`unfold`]: scatter-add columns back into image positions
pub fn fold(
    cols: &Array3<f32>,
    window: &Window,
    channels: usize,
    height: usize,
    width: usize,
) -> Result<Array4<f32>> {
    let batch = cols.len_of(Axis(0));
    let (out_h, out_w) = window.output_size(height, width)?;
    let (kh, kw) = window.kernel;
    let (sh, sw) = window.stride;
    let (ph, pw) = window.padding;

    let mut image = Array4::<f32>::zeros((batch, channels, height, width));
    for b in 0..batch {
        for c in 0..channels {
            for i in 0..kh {
                for j in 0..kw {
                    let row = (c * kh + i) * kw + j;
                    for oy in 0..out_h {
                        let y = (oy * sh + i) as isize - ph as isize;
                        if y < 0 || y >= height as isize {
                            continue;
                        }
                        for ox in 0..out_w {
                            let x = (ox * sw + j) as isize - pw as isize;
                            if x < 0 || x >= width as isize {
                                continue;
                            }
                            image[[b, c, y as usize, x as usize]] +=
                                cols[[b, row, oy * out_w + ox]];
                        }
                    }
                }
            }
        }
    }
    Ok(image)
}

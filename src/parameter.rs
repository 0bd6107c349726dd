use std::fmt;

use ndarray::{ArrayD, ArrayViewMutD, IxDyn};

use crate::error::{Error, Result};

/// A trainable leaf array together with its accumulated gradient.
///
/// The gradient is always `f32`, whatever `A` is. Mutable access goes
/// through views, so `data` and `grad` keep one shape.
pub struct Parameter<A = f32> {
    data: ArrayD<A>,
    grad: ArrayD<f32>,
    requires_grad: bool,
}

// Constructors for Parameter
impl<A> Parameter<A> {
    pub fn new(data: ArrayD<A>) -> Self {
        Self::with_requires_grad(data, true)
    }

    pub fn with_requires_grad(data: ArrayD<A>, requires_grad: bool) -> Self {
        let grad = ArrayD::zeros(data.raw_dim());
        Self {
            data,
            grad,
            requires_grad,
        }
    }

    pub fn from_shape_vec(shape: &[usize], values: Vec<A>) -> Result<Self> {
        let data = ArrayD::from_shape_vec(IxDyn(shape), values)?;
        Ok(Self::new(data))
    }
}

impl<A> Parameter<A> {
    pub fn data(&self) -> &ArrayD<A> {
        &self.data
    }

    pub fn data_mut(&mut self) -> ArrayViewMutD<'_, A> {
        self.data.view_mut()
    }

    pub fn grad(&self) -> &ArrayD<f32> {
        &self.grad
    }

    pub fn grad_mut(&mut self) -> ArrayViewMutD<'_, f32> {
        self.grad.view_mut()
    }

    pub fn shape(&self) -> &[usize] {
        self.data.shape()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn requires_grad(&self) -> bool {
        self.requires_grad
    }

    // additive: contributions pile up until zero_grad. frozen parameters
    // ignore the delta but still reject a wrong shape
    pub fn accumulate_grad(&mut self, delta: &ArrayD<f32>) -> Result<()> {
        if delta.shape() != self.grad.shape() {
            return Err(Error::shape_mismatch(self.grad.shape(), delta.shape()));
        }
        if !self.requires_grad {
            return Ok(());
        }
        self.grad.scaled_add(1.0, delta);
        Ok(())
    }

    pub fn zero_grad(&mut self) {
        self.grad.fill(0.0);
    }
}

impl<A> fmt::Display for Parameter<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Parameter(shape={:?}, requires_grad={})",
            self.shape(),
            self.requires_grad
        )
    }
}

// never dump the contents, they can be arbitrarily large
impl<A> fmt::Debug for Parameter<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

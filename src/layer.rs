use log::debug;
use ndarray::{Array2, ArrayD, Axis, Ix2, IxDyn};

use crate::cache::{ActivationCache, MicroBatchId};
use crate::error::{Error, Result};
use crate::module::{Mode, Module, ModuleBase};
use crate::parameter::Parameter;

/// Construction options for [`Linear`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinearConfig {
    pub in_features: usize,
    pub out_features: usize,
    /// Learn an additive bias of shape `[1, out_features]`.
    pub bias: bool,
    /// Weights are drawn uniformly from `[-init_scale / 2, init_scale / 2)`.
    pub init_scale: f32,
}

impl Default for LinearConfig {
    fn default() -> Self {
        Self {
            in_features: 1,
            out_features: 1,
            bias: true,
            init_scale: 0.1,
        }
    }
}

/// Fully connected layer: `y = x . weight + bias`.
///
/// `weight` has shape `[in_features, out_features]`, inputs are `[batch, in_features]`.
pub struct Linear {
    base: ModuleBase,
    cache: ActivationCache<Array2<f32>>,
    in_features: usize,
    out_features: usize,
}

// registration order in from_arrays
const WEIGHT: usize = 0;

impl Linear {
    pub fn new(in_features: usize, out_features: usize) -> Result<Self> {
        Self::from_config(LinearConfig {
            in_features,
            out_features,
            ..LinearConfig::default()
        })
    }

    pub fn from_config(config: LinearConfig) -> Result<Self> {
        let scale = config.init_scale;
        let weight = ArrayD::from_shape_fn(IxDyn(&[config.in_features, config.out_features]), |_| {
            (rand::random::<f32>() - 0.5) * scale
        });
        let bias = config
            .bias
            .then(|| ArrayD::zeros(IxDyn(&[1, config.out_features])));
        Self::from_arrays(weight, bias)
    }

    /// Builds the layer around existing weights, e.g. restored or hand-picked ones.
    pub fn from_arrays(weight: ArrayD<f32>, bias: Option<ArrayD<f32>>) -> Result<Self> {
        if weight.ndim() != 2 {
            return Err(Error::InvalidArgument(format!(
                "linear weight must be rank 2, got shape {:?}",
                weight.shape()
            )));
        }
        let (in_features, out_features) = (weight.shape()[0], weight.shape()[1]);

        let mut base = ModuleBase::new();
        base.register_parameter("weight", Parameter::new(weight))?;
        if let Some(bias) = bias {
            if bias.shape() != [1, out_features] {
                return Err(Error::shape_mismatch(&[1, out_features], bias.shape()));
            }
            base.register_parameter("bias", Parameter::new(bias))?;
        }

        Ok(Self {
            base,
            cache: ActivationCache::new("Linear"),
            in_features,
            out_features,
        })
    }

    pub fn in_features(&self) -> usize {
        self.in_features
    }

    pub fn out_features(&self) -> usize {
        self.out_features
    }

    pub fn weight(&self) -> &Parameter {
        self.base.parameter_at(WEIGHT)
    }

    pub fn bias(&self) -> Option<&Parameter> {
        self.base.parameter("bias")
    }
}

impl Module for Linear {
    fn base(&self) -> &ModuleBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut ModuleBase {
        &mut self.base
    }

    fn forward(&mut self, inputs: &ArrayD<f32>, mubatch_id: MicroBatchId) -> Result<ArrayD<f32>> {
        let x = inputs.view().into_dimensionality::<Ix2>()?;
        if x.ncols() != self.in_features {
            return Err(Error::shape_mismatch(&[x.nrows(), self.in_features], x.shape()));
        }

        let mut y = x.dot(&self.weight().data().view().into_dimensionality::<Ix2>()?);
        if let Some(bias) = self.bias() {
            y += &bias.data().view().into_dimensionality::<Ix2>()?;
        }

        self.cache.insert(mubatch_id, x.to_owned());
        Ok(y.into_dyn())
    }

    fn backward(&mut self, dout: &ArrayD<f32>, mubatch_id: MicroBatchId) -> Result<ArrayD<f32>> {
        // validate before taking the entry so a rejected call can be retried
        let batch = self.cache.require(mubatch_id)?.nrows();
        let dout = dout.view().into_dimensionality::<Ix2>()?;
        if dout.shape() != [batch, self.out_features] {
            return Err(Error::shape_mismatch(&[batch, self.out_features], dout.shape()));
        }
        let x = self.cache.take(mubatch_id)?;

        // dx = dout . W^T
        let dx = {
            let w = self.weight().data().view().into_dimensionality::<Ix2>()?;
            dout.dot(&w.t())
        };

        // dW += x^T . dout
        let dw = x.t().dot(&dout);
        self.base.parameter_at_mut(WEIGHT).accumulate_grad(&dw.into_dyn())?;

        // db += sum over the batch
        if let Some(bias) = self.base.parameter_mut("bias") {
            let db = dout.sum_axis(Axis(0)).insert_axis(Axis(0));
            bias.accumulate_grad(&db.into_dyn())?;
        }

        Ok(dx.into_dyn())
    }

    fn pending(&self) -> usize {
        self.cache.len()
    }

    fn discard(&mut self, mubatch_id: MicroBatchId) {
        self.cache.discard(mubatch_id);
    }
}

/// Element-wise `max(x, 0)`.
pub struct ReLU {
    base: ModuleBase,
    cache: ActivationCache<ArrayD<f32>>,
}

impl ReLU {
    pub fn new() -> Self {
        Self {
            base: ModuleBase::new(),
            cache: ActivationCache::new("ReLU"),
        }
    }
}

impl Default for ReLU {
    fn default() -> Self {
        Self::new()
    }
}

impl Module for ReLU {
    fn base(&self) -> &ModuleBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut ModuleBase {
        &mut self.base
    }

    fn forward(&mut self, inputs: &ArrayD<f32>, mubatch_id: MicroBatchId) -> Result<ArrayD<f32>> {
        let positive_mask = inputs.mapv(|x| if x > 0.0 { 1.0 } else { 0.0 });
        self.cache.insert(mubatch_id, positive_mask);
        Ok(inputs.mapv(|x| x.max(0.0)))
    }

    fn backward(&mut self, dout: &ArrayD<f32>, mubatch_id: MicroBatchId) -> Result<ArrayD<f32>> {
        let mask = self.cache.require(mubatch_id)?;
        if dout.shape() != mask.shape() {
            return Err(Error::shape_mismatch(mask.shape(), dout.shape()));
        }
        let mask = self.cache.take(mubatch_id)?;
        Ok(dout * &mask)
    }

    fn pending(&self) -> usize {
        self.cache.len()
    }

    fn discard(&mut self, mubatch_id: MicroBatchId) {
        self.cache.discard(mubatch_id);
    }
}

/// Inverted dropout.
///
/// In training mode every element is zeroed with probability `p` and the
/// survivors are scaled by `1 / (1 - p)`. In evaluation mode the layer is the
/// identity.
pub struct Dropout {
    base: ModuleBase,
    // None when the forward pass ran as the identity
    cache: ActivationCache<Option<ArrayD<f32>>>,
    p: f32,
}

impl Dropout {
    pub fn new(p: f32) -> Result<Self> {
        if !(0.0..1.0).contains(&p) {
            return Err(Error::InvalidArgument(format!(
                "dropout probability must be in [0, 1), got {p}"
            )));
        }
        Ok(Self {
            base: ModuleBase::new(),
            cache: ActivationCache::new("Dropout"),
            p,
        })
    }

    pub fn p(&self) -> f32 {
        self.p
    }
}

impl Module for Dropout {
    fn base(&self) -> &ModuleBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut ModuleBase {
        &mut self.base
    }

    fn forward(&mut self, inputs: &ArrayD<f32>, mubatch_id: MicroBatchId) -> Result<ArrayD<f32>> {
        if !self.is_training() || self.p == 0.0 {
            self.cache.insert(mubatch_id, None);
            return Ok(inputs.clone());
        }

        let p = self.p;
        let scale = 1.0 / (1.0 - p);
        let mask = inputs.mapv(|_| if rand::random::<f32>() >= p { scale } else { 0.0 });
        let out = inputs * &mask;
        self.cache.insert(mubatch_id, Some(mask));
        Ok(out)
    }

    fn backward(&mut self, dout: &ArrayD<f32>, mubatch_id: MicroBatchId) -> Result<ArrayD<f32>> {
        if let Some(mask) = self.cache.require(mubatch_id)? {
            if dout.shape() != mask.shape() {
                return Err(Error::shape_mismatch(mask.shape(), dout.shape()));
            }
        }
        match self.cache.take(mubatch_id)? {
            None => Ok(dout.clone()),
            Some(mask) => Ok(dout * &mask),
        }
    }

    fn pending(&self) -> usize {
        self.cache.len()
    }

    fn discard(&mut self, mubatch_id: MicroBatchId) {
        self.cache.discard(mubatch_id);
    }
}

/// Chains child modules, feeding each output into the next.
///
/// The parameters belong to the children and are exposed as `"{index}.{name}"`;
/// the container's own `base()` holds none, so look them up with
/// [`Sequential::parameter`] or `named_parameters()`. Mode changes reach every child.
pub struct Sequential {
    base: ModuleBase,
    layers: Vec<Box<dyn Module>>,
}

impl Sequential {
    pub fn new(layers: Vec<Box<dyn Module>>) -> Self {
        Self {
            base: ModuleBase::new(),
            layers,
        }
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn layers(&self) -> &[Box<dyn Module>] {
        &self.layers
    }

    /// Resolves a qualified name such as `"0.weight"`.
    pub fn parameter(&self, name: &str) -> Option<&Parameter> {
        let (index, rest) = name.split_once('.')?;
        let layer = self.layers.get(index.parse::<usize>().ok()?)?;
        layer
            .named_parameters()
            .into_iter()
            .find(|(n, _)| n == rest)
            .map(|(_, p)| p)
    }
}

impl Module for Sequential {
    fn base(&self) -> &ModuleBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut ModuleBase {
        &mut self.base
    }

    fn forward(&mut self, inputs: &ArrayD<f32>, mubatch_id: MicroBatchId) -> Result<ArrayD<f32>> {
        let mut current = inputs.clone();
        for i in 0..self.layers.len() {
            match self.layers[i].forward(&current, mubatch_id) {
                Ok(out) => current = out,
                Err(err) => {
                    // the children that already ran would otherwise hold their entries forever
                    for layer in &mut self.layers[..i] {
                        layer.discard(mubatch_id);
                    }
                    return Err(err);
                }
            }
        }
        Ok(current)
    }

    fn backward(&mut self, dout: &ArrayD<f32>, mubatch_id: MicroBatchId) -> Result<ArrayD<f32>> {
        let mut grad = dout.clone();
        for layer in self.layers.iter_mut().rev() {
            grad = layer.backward(&grad, mubatch_id)?;
        }
        Ok(grad)
    }

    fn pending(&self) -> usize {
        self.layers.iter().map(|layer| layer.pending()).sum()
    }

    fn discard(&mut self, mubatch_id: MicroBatchId) {
        for layer in &mut self.layers {
            layer.discard(mubatch_id);
        }
    }

    fn set_mode(&mut self, mode: Mode) {
        debug!("Sequential: switching {} layers to {:?}", self.layers.len(), mode);
        self.base.set_mode(mode);
        for layer in &mut self.layers {
            layer.set_mode(mode);
        }
    }

    fn parameters(&self) -> Vec<&Parameter> {
        self.layers
            .iter()
            .flat_map(|layer| layer.parameters())
            .collect()
    }

    fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        self.layers
            .iter_mut()
            .flat_map(|layer| layer.parameters_mut())
            .collect()
    }

    fn named_parameters(&self) -> Vec<(String, &Parameter)> {
        self.layers
            .iter()
            .enumerate()
            .flat_map(|(i, layer)| {
                layer
                    .named_parameters()
                    .into_iter()
                    .map(move |(name, p)| (format!("{i}.{name}"), p))
            })
            .collect()
    }
}

use indexmap::IndexMap;
use log::debug;
use ndarray::ArrayD;

use crate::cache::MicroBatchId;
use crate::error::{Error, Result};
use crate::parameter::Parameter;

/// Whether a module runs with training-time behavior (e.g. dropout) or not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    #[default]
    Training,
    Evaluation,
}

/// Bookkeeping every module shares: its named parameters and its mode.
///
/// Parameters are registered while the owning layer is being built and keep
/// their registration order for the module's whole life.
#[derive(Debug)]
pub struct ModuleBase<A = f32> {
    params: IndexMap<String, Parameter<A>>,
    mode: Mode,
}

impl<A> Default for ModuleBase<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A> ModuleBase<A> {
    pub fn new() -> Self {
        Self {
            params: IndexMap::new(),
            mode: Mode::Training,
        }
    }

    pub fn register_parameter(&mut self, name: impl Into<String>, param: Parameter<A>) -> Result<()> {
        let name = name.into();
        if self.params.contains_key(&name) {
            return Err(Error::DuplicateParameter(name));
        }
        self.params.insert(name, param);
        Ok(())
    }

    pub fn parameter(&self, name: &str) -> Option<&Parameter<A>> {
        self.params.get(name)
    }

    pub fn parameter_mut(&mut self, name: &str) -> Option<&mut Parameter<A>> {
        self.params.get_mut(name)
    }

    pub fn require(&self, name: &str) -> Result<&Parameter<A>> {
        self.params
            .get(name)
            .ok_or_else(|| Error::UnknownParameter(name.to_string()))
    }

    pub fn require_mut(&mut self, name: &str) -> Result<&mut Parameter<A>> {
        self.params
            .get_mut(name)
            .ok_or_else(|| Error::UnknownParameter(name.to_string()))
    }

    // panics if fewer than `index + 1` parameters were registered
    pub fn parameter_at(&self, index: usize) -> &Parameter<A> {
        &self.params[index]
    }

    pub fn parameter_at_mut(&mut self, index: usize) -> &mut Parameter<A> {
        &mut self.params[index]
    }

    pub fn parameters(&self) -> Vec<&Parameter<A>> {
        self.params.values().collect()
    }

    pub fn parameters_mut(&mut self) -> Vec<&mut Parameter<A>> {
        self.params.values_mut().collect()
    }

    pub fn named_parameters(&self) -> Vec<(String, &Parameter<A>)> {
        self.params.iter().map(|(name, p)| (name.clone(), p)).collect()
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: Mode) {
        self.mode = mode;
    }

    pub fn is_training(&self) -> bool {
        self.mode == Mode::Training
    }
}

/// A stateful computation with a forward pass, a backward pass and owned parameters.
///
/// Implementors embed a [`ModuleBase`] and override `forward` and `backward`.
/// `forward` must store whatever `backward` needs under `mubatch_id`, and
/// `backward` must consume that entry, *add* each parameter's gradient into
/// its buffer and return the gradient with respect to the input. Without an
/// override both fail with [`Error::ContractViolation`].
pub trait Module<A = f32> {
    fn base(&self) -> &ModuleBase<A>;

    fn base_mut(&mut self) -> &mut ModuleBase<A>;

    fn name(&self) -> &'static str {
        let full = std::any::type_name::<Self>();
        let path = full.split('<').next().unwrap_or(full);
        path.rsplit("::").next().unwrap_or(path)
    }

    fn forward(&mut self, _inputs: &ArrayD<A>, _mubatch_id: MicroBatchId) -> Result<ArrayD<A>> {
        Err(Error::ContractViolation {
            module: self.name().to_string(),
            op: "forward",
        })
    }

    fn backward(&mut self, _dout: &ArrayD<f32>, _mubatch_id: MicroBatchId) -> Result<ArrayD<f32>> {
        Err(Error::ContractViolation {
            module: self.name().to_string(),
            op: "backward",
        })
    }

    fn call(&mut self, inputs: &ArrayD<A>, mubatch_id: MicroBatchId) -> Result<ArrayD<A>> {
        self.forward(inputs, mubatch_id)
    }

    // number of micro-batches waiting for their backward
    fn pending(&self) -> usize {
        0
    }

    /// Forgets the cached state of a micro-batch whose step was abandoned.
    fn discard(&mut self, _mubatch_id: MicroBatchId) {}

    fn set_mode(&mut self, mode: Mode) {
        debug!("{}: switching to {:?}", self.name(), mode);
        self.base_mut().set_mode(mode);
    }

    fn train(&mut self) {
        self.set_mode(Mode::Training);
    }

    fn eval(&mut self) {
        self.set_mode(Mode::Evaluation);
    }

    fn mode(&self) -> Mode {
        self.base().mode()
    }

    fn is_training(&self) -> bool {
        self.mode() == Mode::Training
    }

    fn parameters(&self) -> Vec<&Parameter<A>> {
        self.base().parameters()
    }

    fn parameters_mut(&mut self) -> Vec<&mut Parameter<A>> {
        self.base_mut().parameters_mut()
    }

    fn named_parameters(&self) -> Vec<(String, &Parameter<A>)> {
        self.base().named_parameters()
    }

    fn num_parameters(&self) -> usize {
        self.parameters().iter().map(|p| p.len()).sum()
    }

    fn zero_grad(&mut self) {
        for p in self.parameters_mut() {
            p.zero_grad();
        }
    }
}

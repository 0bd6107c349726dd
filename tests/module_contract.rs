// Integration tests for the Module/Parameter contract.
//
// A module defined outside the crate (Scale) checks that downstream code can
// implement the trait with nothing but the public API.

use minmlp::{
    ActivationCache, Error, Linear, MicroBatchId, Mode, Module, ModuleBase, Parameter, Result,
    DEFAULT_MUBATCH,
};
use ndarray::{array, arr0, ArrayD, IxDyn};
use rstest::rstest;

/// `y = alpha * x` with a learnable scalar `alpha`.
struct Scale {
    base: ModuleBase,
    cache: ActivationCache<ArrayD<f32>>,
}

impl Scale {
    fn new(alpha: f32) -> Result<Self> {
        let mut base = ModuleBase::new();
        base.register_parameter("alpha", Parameter::new(arr0(alpha).into_dyn()))?;
        Ok(Self {
            base,
            cache: ActivationCache::new("Scale"),
        })
    }

    fn alpha(&self) -> f32 {
        self.base.require("alpha").unwrap().data()[[]]
    }
}

impl Module for Scale {
    fn base(&self) -> &ModuleBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut ModuleBase {
        &mut self.base
    }

    fn forward(&mut self, inputs: &ArrayD<f32>, mubatch_id: MicroBatchId) -> Result<ArrayD<f32>> {
        self.cache.insert(mubatch_id, inputs.clone());
        Ok(inputs * self.alpha())
    }

    fn backward(&mut self, dout: &ArrayD<f32>, mubatch_id: MicroBatchId) -> Result<ArrayD<f32>> {
        let x = self.cache.take(mubatch_id)?;
        let dalpha = (dout * &x).sum();
        self.base
            .require_mut("alpha")?
            .accumulate_grad(&arr0(dalpha).into_dyn())?;
        Ok(dout * self.alpha())
    }
}

/// Owns a single 2x3 parameter of ones and no computation.
struct Holder {
    base: ModuleBase,
}

impl Module for Holder {
    fn base(&self) -> &ModuleBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut ModuleBase {
        &mut self.base
    }
}

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn zero_grad_scenario() {
    init_logger();
    let param = Parameter::new(ArrayD::<f32>::ones(IxDyn(&[2, 3])));
    assert_eq!(param.grad(), &ArrayD::<f32>::zeros(IxDyn(&[2, 3])));

    let mut base = ModuleBase::new();
    base.register_parameter("p", param).unwrap();
    let mut holder = Holder { base };

    // simulate a backward pass
    for p in holder.parameters_mut() {
        p.grad_mut().mapv_inplace(|g| g + 1.0);
    }
    assert!(holder.parameters()[0].grad().iter().all(|&g| g == 1.0));

    holder.zero_grad();
    let p = holder.parameters()[0];
    assert!(p.grad().iter().all(|&g| g == 0.0));
    assert!(p.data().iter().all(|&x| x == 1.0));
    assert!(matches!(
        holder.forward(&ArrayD::zeros(IxDyn(&[1])), DEFAULT_MUBATCH),
        Err(Error::ContractViolation { .. })
    ));
}

#[test]
fn zero_grad_leaves_data_bit_identical() {
    let mut layer = Linear::new(5, 3).unwrap();
    let before: Vec<u32> = layer
        .parameters()
        .iter()
        .flat_map(|p| p.data().iter().map(|x| x.to_bits()).collect::<Vec<_>>())
        .collect();

    layer.forward(&ArrayD::ones(IxDyn(&[4, 5])), 0).unwrap();
    layer.backward(&ArrayD::ones(IxDyn(&[4, 3])), 0).unwrap();
    assert!(layer.parameters().iter().any(|p| p.grad().iter().any(|&g| g != 0.0)));

    layer.zero_grad();
    let after: Vec<u32> = layer
        .parameters()
        .iter()
        .flat_map(|p| p.data().iter().map(|x| x.to_bits()).collect::<Vec<_>>())
        .collect();
    assert_eq!(before, after);
    assert!(layer.parameters().iter().all(|p| p.grad().iter().all(|&g| g == 0.0)));
}

#[rstest]
#[case(0)]
#[case(3)]
#[case(41)]
fn call_matches_forward(#[case] mubatch_id: MicroBatchId) {
    let weight = array![[1.0f32, -1.0], [0.5, 2.0]].into_dyn();
    let mut a = Linear::from_arrays(weight.clone(), None).unwrap();
    let mut b = Linear::from_arrays(weight, None).unwrap();
    let x = array![[3.0f32, 4.0], [-1.0, 0.25]].into_dyn();

    assert_eq!(a.call(&x, mubatch_id).unwrap(), b.forward(&x, mubatch_id).unwrap());

    let mut scale = Scale::new(1.5).unwrap();
    let via_call = scale.call(&x, mubatch_id).unwrap();
    let via_forward = scale.forward(&x, mubatch_id).unwrap();
    assert_eq!(via_call, via_forward);
}

#[test]
fn interleaved_micro_batches_keep_separate_state() {
    init_logger();
    let x0 = array![[1.0f32, 2.0]].into_dyn();
    let x1 = array![[-3.0f32, 5.0]].into_dyn();
    let d0 = array![[1.0f32, 1.0]].into_dyn();
    let d1 = array![[2.0f32, 2.0]].into_dyn();

    let mut interleaved = Scale::new(2.0).unwrap();
    interleaved.forward(&x0, 0).unwrap();
    interleaved.forward(&x1, 1).unwrap();
    let dx1 = interleaved.backward(&d1, 1).unwrap();
    let dx0 = interleaved.backward(&d0, 0).unwrap();
    assert_eq!(dx0, array![[2.0f32, 2.0]].into_dyn());
    assert_eq!(dx1, array![[4.0f32, 4.0]].into_dyn());

    let mut serial = Scale::new(2.0).unwrap();
    serial.forward(&x0, 0).unwrap();
    serial.backward(&d0, 0).unwrap();
    serial.forward(&x1, 0).unwrap();
    serial.backward(&d1, 0).unwrap();

    // dalpha = 1*(1+2) + 2*(-3+5) = 7
    assert_eq!(interleaved.parameters()[0].grad()[[]], 7.0);
    assert_eq!(serial.parameters()[0].grad()[[]], 7.0);
}

#[test]
fn backward_consumes_the_cache_entry() {
    let mut scale = Scale::new(1.0).unwrap();
    let x = ArrayD::ones(IxDyn(&[3]));
    scale.forward(&x, 5).unwrap();
    scale.backward(&x, 5).unwrap();

    match scale.backward(&x, 5) {
        Err(Error::MissingCache { module, mubatch_id }) => {
            assert_eq!(module, "Scale");
            assert_eq!(mubatch_id, 5);
        }
        other => panic!("expected missing cache, got {other:?}"),
    }
}

#[test]
fn repeated_backward_accumulates() {
    let mut scale = Scale::new(3.0).unwrap();
    let x = ArrayD::from_elem(IxDyn(&[2]), 2.0f32);
    let dout = ArrayD::ones(IxDyn(&[2]));
    for _ in 0..3 {
        scale.forward(&x, 0).unwrap();
        scale.backward(&dout, 0).unwrap();
    }
    assert_eq!(scale.parameters()[0].grad()[[]], 12.0);
}

#[test]
fn mode_has_two_states() {
    let mut scale = Scale::new(1.0).unwrap();
    assert_eq!(scale.mode(), Mode::Training);

    scale.train();
    scale.eval();
    assert_eq!(scale.mode(), Mode::Evaluation);

    scale.eval();
    scale.train();
    assert_eq!(scale.mode(), Mode::Training);
}

#[test]
fn parameters_are_stable_across_calls() {
    let layer = Linear::new(3, 2).unwrap();
    let first = layer.parameters();
    let second = layer.parameters();
    assert_eq!(first.len(), 2);
    assert_eq!(first.len(), second.len());
    assert!(first.iter().zip(&second).all(|(a, b)| std::ptr::eq(*a, *b)));

    let names: Vec<String> = layer.named_parameters().into_iter().map(|(n, _)| n).collect();
    assert_eq!(names, ["weight", "bias"]);
}

#[test]
fn boxed_modules_keep_their_names() {
    let modules: Vec<Box<dyn Module>> = vec![Box::new(Scale::new(1.0).unwrap()), Box::new(Linear::new(1, 1).unwrap())];
    let names: Vec<&str> = modules.iter().map(|m| m.name()).collect();
    assert_eq!(names, ["Scale", "Linear"]);
}

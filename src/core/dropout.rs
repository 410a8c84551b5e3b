use std::cell::RefCell;
use std::rc::Rc;

use log::{debug, warn};
use ndarray::prelude::*;

use super::error::{Error, Result};
use super::operations::{expect_arity, Operation};
use super::random::{Handle, RandomSource};
use super::{next_sequential_number, Origin, Real, Tensor, TensorBuilder};

fn validate_ratio(op: &'static str, ratio: f64) -> Result<()> {
    if !(0.0..1.0).contains(&ratio) {
        warn!("{} rejected dropout ratio {}", op, ratio);
        return Err(Error::invalid_argument(
            op,
            format!("dropout ratio has to be in [0, 1), got {}", ratio),
        ));
    }
    Ok(())
}

/// Everything backward needs to reproduce a forward call's mask.
#[derive(Clone, Debug)]
pub struct ReserveSpace {
    states_identifier: u64,
    shape: Vec<usize>,
    ratio: f64,
    keep: Vec<bool>,
}

impl ReserveSpace {
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn ratio(&self) -> f64 {
        self.ratio
    }

    pub fn kept_count(&self) -> usize {
        self.keep.iter().filter(|&&kept| kept).count()
    }

    // in f64: a ratio just under 1 rounds to 1 in f32 before the subtraction
    fn scale<F: Real>(&self) -> F {
        F::cast(1.0 / (1.0 - self.ratio))
    }

    pub fn mask<F: Real>(&self) -> Result<ArrayD<F>> {
        let scale = self.scale::<F>();
        let values = self
            .keep
            .iter()
            .map(|&kept| if kept { scale } else { F::zero() })
            .collect::<Vec<_>>();
        Array::from_shape_vec(IxDyn(&self.shape), values)
            .map_err(|e| Error::invalid_state("dropout mask", e.to_string()))
    }

    pub fn apply<F: Real>(&self, x: &ArrayD<F>) -> Result<ArrayD<F>> {
        if x.shape() != self.shape.as_slice() {
            return Err(Error::invalid_state(
                "dropout",
                format!(
                    "reserve space was recorded for shape {:?}, got {:?}",
                    self.shape,
                    x.shape()
                ),
            ));
        }
        let scale = self.scale::<F>();
        let mut masked = x.clone();
        for (value, &kept) in masked.iter_mut().zip(self.keep.iter()) {
            *value = if kept { *value * scale } else { F::zero() };
        }
        Ok(masked)
    }
}

pub struct DropoutStates<H: Handle> {
    identifier: u64,
    seed: u64,
    handle_identifier: u64,
    generator: H::Source,
}

impl<H: Handle> DropoutStates<H> {
    pub fn new(handle: &H, seed: u64) -> Self {
        let identifier = next_sequential_number();
        debug!(
            "dropout states {} seeded with {} on handle {}",
            identifier,
            seed,
            handle.identifier()
        );
        Self {
            identifier,
            seed,
            handle_identifier: handle.identifier(),
            generator: handle.generator(seed),
        }
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    fn expect_handle(&self, op: &'static str, handle: &H) -> Result<()> {
        if handle.identifier() != self.handle_identifier {
            warn!(
                "{} called with handle {} on states created with handle {}",
                op,
                handle.identifier(),
                self.handle_identifier
            );
            return Err(Error::invalid_state(
                op,
                format!(
                    "states belong to handle {}, not {}",
                    self.handle_identifier,
                    handle.identifier()
                ),
            ));
        }
        Ok(())
    }

    pub fn forward<F: Real>(
        &mut self,
        handle: &H,
        x: &ArrayD<F>,
        ratio: f64,
    ) -> Result<(ReserveSpace, ArrayD<F>)> {
        self.expect_handle("dropout forward", handle)?;
        validate_ratio("dropout forward", ratio)?;
        let mut keep = vec![true; x.len()];
        if ratio > 0.0 {
            self.generator.fill(&mut keep, ratio)?;
        }
        let reserve = ReserveSpace {
            states_identifier: self.identifier,
            shape: x.shape().to_vec(),
            ratio,
            keep,
        };
        let y = reserve.apply(x)?;
        debug!(
            "dropout states {} kept {} of {} at ratio {}",
            self.identifier,
            reserve.kept_count(),
            x.len(),
            ratio
        );
        Ok((reserve, y))
    }

    pub fn backward<F: Real>(
        &self,
        handle: &H,
        out_gradient: &ArrayD<F>,
        ratio: f64,
        reserve: &ReserveSpace,
    ) -> Result<ArrayD<F>> {
        self.expect_handle("dropout backward", handle)?;
        validate_ratio("dropout backward", ratio)?;
        if reserve.states_identifier != self.identifier {
            return Err(Error::invalid_state(
                "dropout backward",
                format!(
                    "reserve space came from states {}, not {}",
                    reserve.states_identifier, self.identifier
                ),
            ));
        }
        if reserve.ratio != ratio {
            return Err(Error::invalid_state(
                "dropout backward",
                format!(
                    "reserve space was recorded at ratio {}, got {}",
                    reserve.ratio, ratio
                ),
            ));
        }
        reserve.apply(out_gradient)
    }
}

pub struct Dropout<H: Handle> {
    handle: Rc<H>,
    states: Rc<RefCell<DropoutStates<H>>>,
    ratio: f64,
}

impl<H: Handle> Dropout<H> {
    pub fn new(handle: Rc<H>, states: Rc<RefCell<DropoutStates<H>>>, ratio: f64) -> Result<Self> {
        validate_ratio("dropout", ratio)?;
        Ok(Self {
            handle,
            states,
            ratio,
        })
    }

    pub fn forward<F: Real>(&self, x: Rc<Tensor<F>>) -> Result<Rc<Tensor<F>>> {
        let (reserve, y) =
            self.states
                .borrow_mut()
                .forward(&*self.handle, &*x.borrow_array(), self.ratio)?;
        let origin = Origin {
            operation: Box::new(ReplayDropout::new(reserve)),
            parents: vec![x],
        };
        Ok(Rc::new(TensorBuilder::new(y).origin(origin).build()))
    }
}

pub struct ReplayDropout {
    reserve: ReserveSpace,
}

impl ReplayDropout {
    pub fn new(reserve: ReserveSpace) -> Self {
        Self { reserve }
    }
}

impl<F: Real> Operation<F> for ReplayDropout {
    fn forward(&self, inputs: Vec<Rc<Tensor<F>>>) -> Result<Rc<Tensor<F>>> {
        expect_arity("dropout replay", &inputs, 1)?;
        let array = self.reserve.apply(&*inputs[0].borrow_array())?;
        let origin = Origin {
            operation: Box::new(ReplayDropout {
                reserve: self.reserve.clone(),
            }),
            parents: vec![inputs[0].clone()],
        };
        Ok(Rc::new(TensorBuilder::new(array).origin(origin).build()))
    }

    fn backward(
        &self,
        out_gradient: &ArrayD<F>,
        _args: Vec<Rc<Tensor<F>>>,
        _arg_index: usize,
    ) -> Result<ArrayD<F>> {
        self.reserve.apply(out_gradient)
    }
}

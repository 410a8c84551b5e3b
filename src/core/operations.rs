use std::rc::Rc;

use log::debug;
use ndarray::prelude::*;

use super::error::{Error, Result};
use super::{Origin, Real, Tensor, TensorBuilder};

pub trait Operation<F> {
    fn forward(&self, inputs: Vec<Rc<Tensor<F>>>) -> Result<Rc<Tensor<F>>>;
    fn backward(
        &self,
        out_gradient: &ArrayD<F>,
        args: Vec<Rc<Tensor<F>>>,
        arg_index: usize,
    ) -> Result<ArrayD<F>>;
}

pub(super) fn expect_arity<F>(
    op: &'static str,
    inputs: &[Rc<Tensor<F>>],
    arity: usize,
) -> Result<()> {
    if inputs.len() != arity {
        return Err(Error::invalid_argument(
            op,
            format!("expected {} inputs, got {}", arity, inputs.len()),
        ));
    }
    Ok(())
}

fn expect_same_shape<F: Real>(op: &'static str, a: &ArrayD<F>, b: &ArrayD<F>) -> Result<()> {
    if a.shape() != b.shape() {
        return Err(Error::shape_mismatch(
            op,
            format!("lhs {:?}, rhs {:?}", a.shape(), b.shape()),
        ));
    }
    Ok(())
}

pub struct Addition {}

impl<F: Real> Operation<F> for Addition {
    fn forward(&self, inputs: Vec<Rc<Tensor<F>>>) -> Result<Rc<Tensor<F>>> {
        expect_arity("addition", &inputs, 2)?;
        let array = {
            let a = inputs[0].borrow_array();
            let b = inputs[1].borrow_array();
            expect_same_shape("addition", &a, &b)?;
            &*a + &*b
        };
        let origin = Origin {
            operation: Box::new(Addition {}),
            parents: vec![inputs[0].clone(), inputs[1].clone()],
        };
        Ok(Rc::new(TensorBuilder::new(array).origin(origin).build()))
    }

    fn backward(
        &self,
        out_gradient: &ArrayD<F>,
        _args: Vec<Rc<Tensor<F>>>,
        _arg_index: usize,
    ) -> Result<ArrayD<F>> {
        // Addition just passes the gradient through to both branches.
        Ok(out_gradient.clone())
    }
}

pub struct Multiplication {}

impl<F: Real> Operation<F> for Multiplication {
    fn forward(&self, inputs: Vec<Rc<Tensor<F>>>) -> Result<Rc<Tensor<F>>> {
        expect_arity("multiplication", &inputs, 2)?;
        let array = {
            let a = inputs[0].borrow_array();
            let b = inputs[1].borrow_array();
            expect_same_shape("multiplication", &a, &b)?;
            &*a * &*b
        };
        let origin = Origin {
            operation: Box::new(Multiplication {}),
            parents: vec![inputs[0].clone(), inputs[1].clone()],
        };
        Ok(Rc::new(TensorBuilder::new(array).origin(origin).build()))
    }

    fn backward(
        &self,
        out_gradient: &ArrayD<F>,
        args: Vec<Rc<Tensor<F>>>,
        arg_index: usize,
    ) -> Result<ArrayD<F>> {
        let other_arg_index = match arg_index {
            0 => 1,
            1 => 0,
            _ => {
                return Err(Error::invalid_argument(
                    "multiplication",
                    format!("binary operation has no argument {}", arg_index),
                ))
            }
        };
        // d/dx(xy) = y
        let gradient = out_gradient * &*args[other_arg_index].borrow_array();
        Ok(gradient)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ActivationMode {
    Sigmoid,
    RectifiedLinearUnit,
    HyperbolicTangent,
}

pub fn activation_forward<F: Real>(x: &ArrayD<F>, mode: ActivationMode) -> ArrayD<F> {
    match mode {
        ActivationMode::Sigmoid => x.mapv(|v| F::one() / (F::one() + (-v).exp())),
        ActivationMode::RectifiedLinearUnit => {
            x.mapv(|v| if v > F::zero() { v } else { F::zero() })
        }
        ActivationMode::HyperbolicTangent => x.mapv(|v| v.tanh()),
    }
}

/// Gradient of an activation with respect to its input, given the input `x`,
/// the forward output `y` and the out-gradient.
pub fn activation_backward<F: Real>(
    x: &ArrayD<F>,
    y: &ArrayD<F>,
    out_gradient: &ArrayD<F>,
    mode: ActivationMode,
) -> Result<ArrayD<F>> {
    expect_same_shape("activation backward", x, y)?;
    expect_same_shape("activation backward", x, out_gradient)?;
    let mut gradient = Array::zeros(x.raw_dim());
    match mode {
        // σ'(x) = σ(x)(1 − σ(x))
        ActivationMode::Sigmoid => {
            azip!((g in &mut gradient, &o in out_gradient, &s in y) *g = o * s * (F::one() - s))
        }
        ActivationMode::RectifiedLinearUnit => {
            azip!((g in &mut gradient, &o in out_gradient, &a in x) if a > F::zero() { *g = o })
        }
        // tanh'(x) = 1 − tanh²(x)
        ActivationMode::HyperbolicTangent => {
            azip!((g in &mut gradient, &o in out_gradient, &t in y) *g = o * (F::one() - t * t))
        }
    }
    Ok(gradient)
}

pub struct Activation {
    mode: ActivationMode,
}

impl Activation {
    pub fn new(mode: ActivationMode) -> Self {
        Self { mode }
    }
}

impl<F: Real> Operation<F> for Activation {
    fn forward(&self, inputs: Vec<Rc<Tensor<F>>>) -> Result<Rc<Tensor<F>>> {
        expect_arity("activation", &inputs, 1)?;
        debug!("{:?} forward on {}", self.mode, inputs[0].identifier());
        let array = activation_forward(&*inputs[0].borrow_array(), self.mode);
        let origin = Origin {
            operation: Box::new(Activation { mode: self.mode }),
            parents: vec![inputs[0].clone()],
        };
        Ok(Rc::new(TensorBuilder::new(array).origin(origin).build()))
    }

    fn backward(
        &self,
        out_gradient: &ArrayD<F>,
        args: Vec<Rc<Tensor<F>>>,
        _arg_index: usize,
    ) -> Result<ArrayD<F>> {
        let x = args[0].borrow_array();
        // XXX: recomputing the output rather than saving it from forward
        let y = activation_forward(&*x, self.mode);
        activation_backward(&*x, &y, out_gradient, self.mode)
    }
}

use std::cell::{Ref, RefCell, RefMut};
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::AddAssign;
use std::rc::Rc;
use std::sync::Mutex;

use approx::RelativeEq;
use lazy_static::lazy_static;
use log::debug;
use ndarray::prelude::*;
use ndarray::ScalarOperand;
use num_traits::Float;

use topological_sort::TopologicalSort;

pub mod dropout;
pub mod error;
pub mod gradient_check;
pub mod operations;
pub mod random;
pub mod selection;

use self::error::{Error, Result};
use self::operations::Operation;

lazy_static! {
    static ref COUNTER: Mutex<u64> = Mutex::new(0);
}

pub(crate) fn next_sequential_number() -> u64 {
    let mut num = COUNTER
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    *num += 1;
    *num
}

fn generate_sequential_tensor_id() -> String {
    format!("Tensor{}", next_sequential_number())
}

pub trait Real:
    Float + ScalarOperand + AddAssign + RelativeEq<Epsilon = Self> + fmt::Debug + fmt::Display
{
    fn cast(value: f64) -> Self;
    fn widen(self) -> f64;
}

impl Real for f32 {
    fn cast(value: f64) -> Self {
        value as f32
    }

    fn widen(self) -> f64 {
        self as f64
    }
}

impl Real for f64 {
    fn cast(value: f64) -> Self {
        value
    }

    fn widen(self) -> f64 {
        self
    }
}

pub struct Tensor<T = f32> {
    identifier: String,
    array: RefCell<ArrayD<T>>,
    requires_gradient: bool,
    gradient: RefCell<Option<ArrayD<T>>>,
    origin: Option<Origin<T>>,
}

impl<T: fmt::Debug> fmt::Debug for Tensor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("identifier", &self.identifier)
            .field("array", &self.array)
            .field("gradient", &self.gradient)
            .finish()
    }
}

impl<T> Hash for Tensor<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.identifier.hash(state);
    }
}

impl<T> PartialEq for Tensor<T> {
    fn eq(&self, other: &Self) -> bool {
        self.identifier == other.identifier
    }
}

impl<T> Eq for Tensor<T> {}

impl<T: Clone> Tensor<T> {
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn borrow_array(&self) -> Ref<ArrayD<T>> {
        self.array.borrow()
    }

    #[allow(dead_code)]
    pub fn borrow_array_mut(&self) -> RefMut<ArrayD<T>> {
        self.array.borrow_mut()
    }

    pub fn shape(&self) -> Vec<usize> {
        self.array.borrow().shape().to_vec()
    }

    pub fn gradient(&self) -> Option<ArrayD<T>> {
        self.gradient.borrow().clone()
    }

    #[allow(dead_code)]
    pub fn set_gradient(&self, gradient: ArrayD<T>) {
        *self.gradient.borrow_mut() = Some(gradient)
    }

    #[allow(dead_code)]
    pub fn unset_gradient(&self) {
        *self.gradient.borrow_mut() = None
    }
}

pub struct TensorBuilder<T = f32> {
    array: ArrayD<T>,
    identifier: Option<String>,
    requires_gradient: bool,
    gradient: Option<ArrayD<T>>,
    origin: Option<Origin<T>>,
}

impl<T> TensorBuilder<T> {
    pub fn new(array: ArrayD<T>) -> TensorBuilder<T> {
        TensorBuilder {
            array,
            identifier: None,
            requires_gradient: true,
            gradient: None,
            origin: None,
        }
    }

    pub fn identifier(mut self, identifier: &str) -> TensorBuilder<T> {
        self.identifier = Some(identifier.to_owned());
        self
    }

    #[allow(dead_code)]
    pub fn requires_gradient(mut self, requires: bool) -> TensorBuilder<T> {
        self.requires_gradient = requires;
        self
    }

    #[allow(dead_code)]
    pub fn gradient(mut self, gradient: ArrayD<T>) -> TensorBuilder<T> {
        self.gradient = Some(gradient);
        self
    }

    fn origin(mut self, origin: Origin<T>) -> TensorBuilder<T> {
        self.origin = Some(origin);
        self
    }

    pub fn build(self) -> Tensor<T> {
        Tensor {
            array: RefCell::new(self.array),
            identifier: match self.identifier {
                Some(identifier) => identifier,
                None => generate_sequential_tensor_id(),
            },
            requires_gradient: self.requires_gradient,
            gradient: RefCell::new(self.gradient),
            origin: self.origin,
        }
    }
}

pub struct Origin<T> {
    operation: Box<dyn Operation<T>>,
    parents: Vec<Rc<Tensor<T>>>,
}

fn register_parents<T>(sorter: &mut TopologicalSort<Rc<Tensor<T>>>, child: Rc<Tensor<T>>) {
    if let Some(origin) = &child.origin {
        for parent in &origin.parents {
            sorter.add_dependency(parent.clone(), child.clone());
            register_parents(sorter, parent.clone());
        }
    }
}

fn sorted_computation_graph<T>(end: Rc<Tensor<T>>) -> Vec<Rc<Tensor<T>>> {
    let mut sorter = TopologicalSort::new();
    register_parents(&mut sorter, end.clone());
    let mut sorted = sorter.collect::<Vec<_>>();
    if sorted.is_empty() {
        // a leaf has no edges for the sorter to see
        sorted.push(end);
    }
    // We actually want reverse-topological order
    sorted.reverse();
    sorted
}

pub fn backprop<F: Real>(culmination: Rc<Tensor<F>>) -> Result<()> {
    let out_gradient = Array::ones(culmination.borrow_array().raw_dim());
    backprop_with_gradient(culmination, out_gradient)
}

pub fn backprop_with_gradient<F: Real>(
    culmination: Rc<Tensor<F>>,
    out_gradient: ArrayD<F>,
) -> Result<()> {
    if out_gradient.shape() != culmination.borrow_array().shape() {
        return Err(Error::shape_mismatch(
            "backprop",
            format!(
                "out gradient {:?} does not match {} {:?}",
                out_gradient.shape(),
                culmination.identifier,
                culmination.borrow_array().shape()
            ),
        ));
    }
    let mut gradients = HashMap::<String, ArrayD<F>>::new();
    gradients.insert(culmination.identifier.clone(), out_gradient);
    for node in sorted_computation_graph(culmination) {
        let gradient = gradients.remove(&node.identifier).ok_or_else(|| {
            Error::invalid_state(
                "backprop",
                format!("no gradient reached {}", node.identifier),
            )
        })?;

        // If it has an origin, use the backward function to accumulate
        // gradients for the parents in our map
        if let Some(origin) = &node.origin {
            for (i, parent) in origin.parents.iter().enumerate() {
                let contribution = origin
                    .operation
                    .backward(&gradient, origin.parents.clone(), i)?;
                match gradients.get_mut(&parent.identifier) {
                    Some(accumulated) => {
                        *accumulated += &contribution;
                    }
                    None => {
                        gradients.insert(parent.identifier.clone(), contribution);
                    }
                }
            }
        }

        if node.requires_gradient {
            debug!("setting gradient of {}", node.identifier);
            *node.gradient.borrow_mut() = Some(gradient);
        }
    }
    Ok(())
}

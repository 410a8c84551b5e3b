use std::cell::RefCell;
use std::rc::Rc;

use log::info;
use ndarray::prelude::*;

use crate::core::dropout::{Dropout, DropoutStates};
use crate::core::error::Result;
use crate::core::gradient_check::{check_gradient, GradientCheckConfiguration};
use crate::core::operations::{
    activation_backward, activation_forward, Activation, ActivationMode, Operation,
};
use crate::core::random::CpuHandle;
use crate::core::selection::{select_batch, BatchedIndexSelect};
use crate::core::{backprop, backprop_with_gradient, Real, TensorBuilder};

pub struct DemonstrationConfiguration {
    pub seed: u64,
    pub ratio: f64,
    pub rows: usize,
    pub columns: usize,
}

impl Default for DemonstrationConfiguration {
    fn default() -> Self {
        Self {
            seed: 0,
            ratio: 0.5,
            rows: 3,
            columns: 4,
        }
    }
}

impl DemonstrationConfiguration {
    fn input<F: Real>(&self) -> ArrayD<F> {
        let columns = self.columns;
        Array::from_shape_fn((self.rows, self.columns), |(i, j)| {
            F::cast((i * columns + j) as f64)
        })
        .into_dyn()
    }

    /// Walks the diagonal, wrapping at the last column.
    fn indices(&self) -> Array1<i32> {
        let columns = self.columns.max(1);
        Array::from_iter((0..self.rows).map(|i| (i % columns) as i32))
    }
}

pub fn demonstrate_selection(
    configuration: &DemonstrationConfiguration,
) -> Result<(ArrayD<f32>, ArrayD<f32>)> {
    let x = Rc::new(
        TensorBuilder::new(configuration.input::<f32>())
            .identifier("x")
            .build(),
    );
    let t = Rc::new(
        TensorBuilder::new(configuration.indices().into_dyn())
            .identifier("t")
            .build(),
    );
    let y = select_batch(x.clone(), t.clone())?;
    info!("x = {}", x.borrow_array());
    info!("t = {}", t.borrow_array());
    info!("y = x[i, t[i]] = {}", y.borrow_array());

    backprop(y.clone())?;
    let gx = x.gradient().unwrap_or_else(|| Array::zeros(x.shape()));
    info!("∂y/∂x = {}", gx);
    info!("∂y/∂t is {:?}", t.gradient());
    let selected = y.borrow_array().clone();
    Ok((selected, gx))
}

#[derive(Debug, PartialEq)]
pub struct DropoutDemonstration {
    pub output: ArrayD<f32>,
    pub input_gradient: ArrayD<f32>,
    pub replayed_output: ArrayD<f32>,
    pub replayed_gradient: ArrayD<f32>,
    pub mask: ArrayD<f32>,
}

// Runs the same seed twice: once as a graph layer under backprop, once
// through the states' forward/backward pair with an explicit reserve space.
pub fn demonstrate_dropout(
    configuration: &DemonstrationConfiguration,
) -> Result<DropoutDemonstration> {
    let handle = Rc::new(CpuHandle::new());
    let states = Rc::new(RefCell::new(DropoutStates::new(
        &*handle,
        configuration.seed,
    )));
    let dropout = Dropout::new(handle.clone(), states, configuration.ratio)?;

    let x_data = configuration.input::<f32>().mapv(|v| v + 1.0);
    let x = Rc::new(TensorBuilder::new(x_data.clone()).identifier("x").build());
    let y = dropout.forward(x.clone())?;
    info!(
        "dropout at ratio {} with seed {}",
        configuration.ratio, configuration.seed
    );
    info!("x = {}", x_data);
    info!("y = {}", y.borrow_array());

    let gy = Array::<f32, _>::ones(y.shape());
    backprop_with_gradient(y.clone(), gy.clone())?;
    let input_gradient = x.gradient().unwrap_or_else(|| Array::zeros(x.shape()));
    info!("∂y/∂x = {}", input_gradient);

    let mut replay_states = DropoutStates::new(&*handle, configuration.seed);
    let (reserve, replayed_output) =
        replay_states.forward(&*handle, &x_data, configuration.ratio)?;
    info!(
        "states seeded with {} kept {} of {:?} at ratio {}",
        replay_states.seed(),
        reserve.kept_count(),
        reserve.shape(),
        reserve.ratio()
    );
    let mask = reserve.mask::<f32>()?;
    info!("mask = {}", mask);
    let replayed_gradient = replay_states.backward(&*handle, &gy, reserve.ratio(), &reserve)?;

    let output = y.borrow_array().clone();
    Ok(DropoutDemonstration {
        output,
        input_gradient,
        replayed_output,
        replayed_gradient,
        mask,
    })
}

pub fn demonstrate_activation(configuration: &DemonstrationConfiguration) -> Result<()> {
    let centered = configuration.input::<f32>();
    let offset = centered.len() as f32 / 2.0;
    let x_data = centered.mapv(|v| (v - offset) / 2.0);
    for mode in [
        ActivationMode::Sigmoid,
        ActivationMode::RectifiedLinearUnit,
        ActivationMode::HyperbolicTangent,
    ] {
        let x = Rc::new(TensorBuilder::new(x_data.clone()).build());
        let y = Activation::new(mode).forward(vec![x.clone()])?;
        backprop(y.clone())?;
        info!("{:?}: y = {}", mode, y.borrow_array());
        info!("{:?}: ∂y/∂x = {:?}", mode, x.gradient());
    }
    Ok(())
}

pub fn demonstrate_gradient_check(configuration: &DemonstrationConfiguration) -> Result<()> {
    let check_configuration = GradientCheckConfiguration::default();
    let x_data = configuration.input::<f64>().mapv(|v| v / 10.0 - 0.55);
    let gy_rows = Array::from_shape_fn(configuration.rows, |i| 1.0 + i as f64).into_dyn();

    let indices = Rc::new(TensorBuilder::new(configuration.indices().into_dyn()).build());
    let selection = BatchedIndexSelect::new(indices.clone());
    let x = Rc::new(TensorBuilder::new(x_data.clone()).build());
    let y = select_batch(x.clone(), indices)?;
    backprop_with_gradient(y, gy_rows.clone())?;
    let analytic = x.gradient().unwrap_or_else(|| Array::zeros(x.shape()));
    check_gradient(
        |x| selection.compute(x),
        &x_data,
        &gy_rows,
        &analytic,
        &check_configuration,
    )?;
    info!("batched index select: analytic gradient agrees");

    let gy = x_data.mapv(|v| v + 1.0);
    for mode in [
        ActivationMode::Sigmoid,
        ActivationMode::RectifiedLinearUnit,
        ActivationMode::HyperbolicTangent,
    ] {
        let y = activation_forward(&x_data, mode);
        let analytic = activation_backward(&x_data, &y, &gy, mode)?;
        check_gradient(
            |x| Ok(activation_forward(x, mode)),
            &x_data,
            &gy,
            &analytic,
            &check_configuration,
        )?;
        info!("{:?}: analytic gradient agrees", mode);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selection_demonstration() {
        let (y, gx) = demonstrate_selection(&DemonstrationConfiguration::default()).unwrap();
        // x is 0..12 in a 3×4 grid; t walks the diagonal
        assert_eq!(y, array![0.0, 5.0, 10.0].into_dyn());
        assert_eq!(
            gx,
            array![
                [1.0, 0.0, 0.0, 0.0],
                [0.0, 1.0, 0.0, 0.0],
                [0.0, 0.0, 1.0, 0.0]
            ]
            .into_dyn()
        );
    }

    #[test]
    fn test_dropout_demonstration_gradient_follows_output() {
        let configuration = DemonstrationConfiguration {
            seed: 42,
            ..Default::default()
        };
        let run = demonstrate_dropout(&configuration).unwrap();
        let x = configuration.input::<f32>().mapv(|v| v + 1.0);
        // inputs are nonzero, so zeros in y mark exactly the dropped entries
        for ((&y, &g), &x) in run.output.iter().zip(run.input_gradient.iter()).zip(x.iter()) {
            if y == 0.0 {
                assert_eq!(g, 0.0);
            } else {
                assert_eq!(g, 2.0);
                assert_eq!(y, x * 2.0);
            }
        }
        // an all-ones out-gradient comes back as the mask itself
        assert_eq!(run.input_gradient, run.mask);
    }

    #[test]
    fn test_dropout_demonstration_layer_agrees_with_states() {
        let configuration = DemonstrationConfiguration {
            seed: 100,
            ratio: 0.2,
            rows: 6,
            columns: 5,
        };
        let run = demonstrate_dropout(&configuration).unwrap();
        assert_eq!(run.output, run.replayed_output);
        assert_eq!(run.input_gradient, run.replayed_gradient);
        assert_eq!(run.mask.shape(), &[6, 5]);
    }

    #[test]
    fn test_dropout_demonstration_is_reproducible() {
        let configuration = DemonstrationConfiguration {
            seed: 7,
            ratio: 0.3,
            ..Default::default()
        };
        assert_eq!(
            demonstrate_dropout(&configuration).unwrap(),
            demonstrate_dropout(&configuration).unwrap()
        );
    }

    #[test]
    fn test_dropout_demonstration_rejects_bad_ratio() {
        let configuration = DemonstrationConfiguration {
            ratio: 1.0,
            ..Default::default()
        };
        assert!(demonstrate_dropout(&configuration).is_err());
    }

    #[test]
    fn test_activation_demonstration() {
        demonstrate_activation(&DemonstrationConfiguration::default()).unwrap();
    }

    #[test]
    fn test_gradient_check_demonstration() {
        demonstrate_gradient_check(&DemonstrationConfiguration::default()).unwrap();
    }

    #[test]
    fn test_indices_wrap() {
        let configuration = DemonstrationConfiguration {
            rows: 5,
            columns: 2,
            ..Default::default()
        };
        assert_eq!(configuration.indices(), array![0, 1, 0, 1, 0]);
    }
}

use log::debug;
use ndarray::prelude::*;

use super::error::{Error, Result};
use super::Real;

#[derive(Clone, Debug)]
pub struct GradientCheckConfiguration {
    pub ε: f64,
    pub absolute_tolerance: f64,
    pub relative_tolerance: f64,
}

impl Default for GradientCheckConfiguration {
    fn default() -> Self {
        Self {
            ε: 1e-3,
            absolute_tolerance: 1e-5,
            relative_tolerance: 1e-4,
        }
    }
}

/// Central-difference estimate of the gradient of `Σ function(x) · out_gradient`
/// with respect to `x`.
pub fn numerical_gradient<F: Real>(
    mut function: impl FnMut(&ArrayD<F>) -> Result<ArrayD<F>>,
    input: &ArrayD<F>,
    out_gradient: &ArrayD<F>,
    ε: f64,
) -> Result<ArrayD<F>> {
    let baseline = function(input)?;
    if baseline.shape() != out_gradient.shape() {
        return Err(Error::shape_mismatch(
            "numerical gradient",
            format!(
                "function output {:?} does not match out gradient {:?}",
                baseline.shape(),
                out_gradient.shape()
            ),
        ));
    }

    let step = F::cast(ε);
    let mut probe = input.clone();
    let mut gradient = Array::zeros(input.raw_dim());
    let positions = input
        .indexed_iter()
        .map(|(index, _)| index)
        .collect::<Vec<_>>();
    for index in positions {
        let original = probe[index.clone()];
        probe[index.clone()] = original + step;
        let raised = function(&probe)?;
        probe[index.clone()] = original - step;
        let lowered = function(&probe)?;
        probe[index.clone()] = original;

        // accumulate in f64 so that single-precision inputs don't lose the
        // difference to rounding
        let mut total = 0.0;
        for ((&up, &down), &g) in raised.iter().zip(lowered.iter()).zip(out_gradient.iter()) {
            total += (up - down).widen() * g.widen();
        }
        gradient[index] = F::cast(total / (2.0 * ε));
    }
    Ok(gradient)
}

fn close<F: Real>(a: F, b: F, absolute_tolerance: f64, relative_tolerance: f64) -> bool {
    a.relative_eq(
        &b,
        F::cast(absolute_tolerance),
        F::cast(relative_tolerance),
    )
}

pub fn ensure_allclose<F: Real>(
    analytic: &ArrayD<F>,
    numerical: &ArrayD<F>,
    absolute_tolerance: f64,
    relative_tolerance: f64,
) -> Result<()> {
    if analytic.shape() != numerical.shape() {
        return Err(Error::shape_mismatch(
            "gradient check",
            format!(
                "analytic {:?}, numerical {:?}",
                analytic.shape(),
                numerical.shape()
            ),
        ));
    }
    let mismatch = analytic
        .indexed_iter()
        .zip(numerical.iter())
        .find(|((_, &a), &n)| !close(a, n, absolute_tolerance, relative_tolerance));
    match mismatch {
        Some(((index, &a), &n)) => Err(Error::GradientMismatch {
            index: index.slice().to_vec(),
            analytic: a.widen(),
            numerical: n.widen(),
        }),
        None => Ok(()),
    }
}

pub fn check_gradient<F: Real>(
    function: impl FnMut(&ArrayD<F>) -> Result<ArrayD<F>>,
    input: &ArrayD<F>,
    out_gradient: &ArrayD<F>,
    analytic: &ArrayD<F>,
    configuration: &GradientCheckConfiguration,
) -> Result<()> {
    let numerical = numerical_gradient(function, input, out_gradient, configuration.ε)?;
    debug!(
        "checking {} gradient entries at ε = {}",
        numerical.len(),
        configuration.ε
    );
    ensure_allclose(
        analytic,
        &numerical,
        configuration.absolute_tolerance,
        configuration.relative_tolerance,
    )
}

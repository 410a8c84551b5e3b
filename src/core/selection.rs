use std::rc::Rc;

use log::debug;
use ndarray::prelude::*;

use super::error::{Error, Result};
use super::operations::{expect_arity, Operation};
use super::{Origin, Real, Tensor, TensorBuilder};

/// Picks one element per row: `y[i] = x[i, indices[i]]`.
///
/// The indices are held by the operation rather than passed as a parent, so
/// backprop never reaches them and their gradient stays `None`.
#[derive(Clone)]
pub struct BatchedIndexSelect {
    indices: Rc<Tensor<i32>>,
}

impl BatchedIndexSelect {
    pub fn new(indices: Rc<Tensor<i32>>) -> Self {
        Self { indices }
    }

    fn positions(&self, shape: &[usize]) -> Result<Vec<usize>> {
        let &[row_count, column_count] = shape else {
            return Err(Error::shape_mismatch(
                "batched index select",
                format!("expected a two-dimensional input, got shape {:?}", shape),
            ));
        };
        let indices = self.indices.borrow_array();
        if indices.ndim() != 1 {
            return Err(Error::shape_mismatch(
                "batched index select",
                format!(
                    "expected one-dimensional indices, got shape {:?}",
                    indices.shape()
                ),
            ));
        }
        if indices.len() != row_count {
            return Err(Error::shape_mismatch(
                "batched index select",
                format!(
                    "{} indices for an input of {} rows",
                    indices.len(),
                    row_count
                ),
            ));
        }
        let positions = indices
            .iter()
            .enumerate()
            .map(|(row, &index)| {
                usize::try_from(index)
                    .ok()
                    .filter(|&column| column < column_count)
                    .ok_or_else(|| {
                        Error::shape_mismatch(
                            "batched index select",
                            format!(
                                "index {} in row {} is outside [0, {})",
                                index, row, column_count
                            ),
                        )
                    })
            })
            .collect::<Result<Vec<_>>>();
        positions
    }

    pub fn compute<F: Real>(&self, x: &ArrayD<F>) -> Result<ArrayD<F>> {
        let positions = self.positions(x.shape())?;
        let selected = positions
            .iter()
            .enumerate()
            .map(|(row, &column)| x[[row, column]])
            .collect::<Array1<F>>();
        Ok(selected.into_dyn())
    }

    pub fn gradients<F: Real>(
        &self,
        out_gradient: &ArrayD<F>,
        input_shape: &[usize],
    ) -> Result<(ArrayD<F>, Option<ArrayD<F>>)> {
        let positions = self.positions(input_shape)?;
        if out_gradient.shape() != [positions.len()].as_slice() {
            return Err(Error::shape_mismatch(
                "batched index select backward",
                format!(
                    "out gradient {:?} for {} selected elements",
                    out_gradient.shape(),
                    positions.len()
                ),
            ));
        }
        // The gradients on the output get "un-plucked" back into place; every
        // other entry stays exactly zero.
        let mut gradient = Array2::zeros((input_shape[0], input_shape[1]));
        for (row, (&column, &component)) in positions.iter().zip(out_gradient.iter()).enumerate()
        {
            gradient[[row, column]] = component;
        }
        Ok((gradient.into_dyn(), None))
    }
}

impl<F: Real> Operation<F> for BatchedIndexSelect {
    fn forward(&self, inputs: Vec<Rc<Tensor<F>>>) -> Result<Rc<Tensor<F>>> {
        expect_arity("batched index select", &inputs, 1)?;
        let selected = self.compute(&*inputs[0].borrow_array())?;
        debug!(
            "selected {} elements from {} by {}",
            selected.len(),
            inputs[0].identifier(),
            self.indices.identifier()
        );
        let origin = Origin {
            operation: Box::new(self.clone()),
            parents: inputs.clone(),
        };
        Ok(Rc::new(TensorBuilder::new(selected).origin(origin).build()))
    }

    fn backward(
        &self,
        out_gradient: &ArrayD<F>,
        args: Vec<Rc<Tensor<F>>>,
        _arg_index: usize,
    ) -> Result<ArrayD<F>> {
        let input_shape = args[0].shape();
        let (gradient, _) = self.gradients(out_gradient, &input_shape)?;
        Ok(gradient)
    }
}

pub fn select_batch<F: Real>(
    x: Rc<Tensor<F>>,
    indices: Rc<Tensor<i32>>,
) -> Result<Rc<Tensor<F>>> {
    BatchedIndexSelect::new(indices).forward(vec![x])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::backprop_with_gradient;
    use crate::core::gradient_check::{check_gradient, GradientCheckConfiguration};
    use crate::core::operations::Multiplication;
    use ndarray_rand::rand_distr::Uniform;
    use ndarray_rand::RandomExt;

    fn index_tensor(indices: Array1<i32>) -> Rc<Tensor<i32>> {
        Rc::new(TensorBuilder::new(indices.into_dyn()).build())
    }

    fn random_case(rows: usize) -> (ArrayD<f32>, Array1<i32>, ArrayD<f32>) {
        let x = Array::random((rows, 5), Uniform::new(-1.0f32, 1.0)).into_dyn();
        let t = Array::random(rows, Uniform::new(0, 2));
        let gy = Array::random(rows, Uniform::new(-1.0f32, 1.0)).into_dyn();
        (x, t, gy)
    }

    fn check_forward(rows: usize) {
        let (x_data, t_data, _) = random_case(rows);
        let x = Rc::new(TensorBuilder::new(x_data.clone()).build());
        let y = select_batch(x, index_tensor(t_data.clone())).unwrap();

        assert_eq!(y.shape(), vec![rows]);
        for (i, &t) in t_data.iter().enumerate() {
            assert_eq!(y.borrow_array()[[i]], x_data[[i, t as usize]]);
        }
    }

    fn check_backward(rows: usize) {
        let (x_data, t_data, gy_data) = random_case(rows);
        let x = Rc::new(TensorBuilder::new(x_data.clone()).build());
        let t = index_tensor(t_data);
        let y = select_batch(x.clone(), t.clone()).unwrap();
        backprop_with_gradient(y.clone(), gy_data.clone()).unwrap();
        assert!(t.gradient().is_none());

        let selection = BatchedIndexSelect::new(t);
        let configuration = GradientCheckConfiguration {
            ε: 0.01,
            ..Default::default()
        };
        check_gradient(
            |x| selection.compute(x),
            &x_data,
            &gy_data,
            &x.gradient().unwrap(),
            &configuration,
        )
        .unwrap();
    }

    #[test]
    fn test_forward() {
        check_forward(10);
    }

    #[test]
    fn test_backward() {
        check_backward(10);
    }

    #[test]
    fn test_forward_zero_size() {
        check_forward(0);
    }

    #[test]
    fn test_backward_zero_size() {
        check_backward(0);
    }

    #[test]
    fn test_concrete_selection() {
        let x = Rc::new(
            TensorBuilder::new(
                array![[0.0f32, 1.0, 2.0, 3.0, 4.0], [5.0, 6.0, 7.0, 8.0, 9.0]].into_dyn(),
            )
            .build(),
        );
        let t = index_tensor(array![2, 4]);
        let y = select_batch(x.clone(), t.clone()).unwrap();
        assert_eq!(*y.borrow_array(), array![2.0, 9.0].into_dyn());

        backprop_with_gradient(y, array![1.0, 1.0].into_dyn()).unwrap();
        assert_eq!(
            x.gradient().unwrap(),
            array![[0.0, 0.0, 1.0, 0.0, 0.0], [0.0, 0.0, 0.0, 0.0, 1.0]].into_dyn()
        );
        assert!(t.gradient().is_none());
    }

    #[test]
    fn test_gradients_pair_leaves_indices_absent() {
        let selection = BatchedIndexSelect::new(index_tensor(array![1, 0, 1]));
        let (gx, gt) = selection
            .gradients(&array![0.5f64, -2.0, 3.0].into_dyn(), &[3, 2])
            .unwrap();
        assert_eq!(gx, array![[0.0, 0.5], [-2.0, 0.0], [0.0, 3.0]].into_dyn());
        assert!(gt.is_none());
    }

    #[test]
    fn test_repeated_use_accumulates() {
        // y = x[i, t[i]] * x[i, t[i]], so dy/dx lands as 2·x at the picked spots
        let x = Rc::new(TensorBuilder::new(array![[1.0f64, 2.0], [3.0, 4.0]].into_dyn()).build());
        let t = index_tensor(array![1, 0]);
        let picked = select_batch(x.clone(), t.clone()).unwrap();
        let squared = Multiplication {}
            .forward(vec![picked.clone(), picked])
            .unwrap();
        backprop_with_gradient(squared, array![1.0, 1.0].into_dyn()).unwrap();
        assert_eq!(
            x.gradient().unwrap(),
            array![[0.0, 4.0], [6.0, 0.0]].into_dyn()
        );
        assert!(t.gradient().is_none());
    }

    #[test]
    fn test_input_not_mutated() {
        let data = array![[1.0f32, 2.0], [3.0, 4.0]].into_dyn();
        let x = Rc::new(TensorBuilder::new(data.clone()).build());
        let y = select_batch(x.clone(), index_tensor(array![0, 1])).unwrap();
        y.borrow_array_mut()[[0]] = 100.0;
        assert_eq!(*x.borrow_array(), data);
    }

    #[test]
    fn test_index_length_mismatch() {
        let x = Rc::new(TensorBuilder::new(Array::<f32, _>::zeros((3, 5)).into_dyn()).build());
        let result = select_batch(x, index_tensor(array![0, 1]));
        assert!(matches!(result, Err(Error::ShapeMismatch { .. })));
    }

    #[test]
    fn test_index_out_of_range() {
        for bad in [5, -1] {
            let x =
                Rc::new(TensorBuilder::new(Array::<f32, _>::zeros((2, 5)).into_dyn()).build());
            let result = select_batch(x, index_tensor(array![0, bad]));
            assert!(matches!(result, Err(Error::ShapeMismatch { .. })));
        }
    }

    #[test]
    fn test_input_rank_mismatch() {
        let x = Rc::new(TensorBuilder::new(array![1.0f32, 2.0].into_dyn()).build());
        let result = select_batch(x, index_tensor(array![0, 1]));
        assert!(matches!(result, Err(Error::ShapeMismatch { .. })));

        let x = Rc::new(TensorBuilder::new(Array::<f32, _>::zeros((2, 2)).into_dyn()).build());
        let t = Rc::new(TensorBuilder::new(array![[0, 1]].into_dyn()).build());
        let result = select_batch(x, t);
        assert!(matches!(result, Err(Error::ShapeMismatch { .. })));
    }

    #[test]
    fn test_backward_out_gradient_mismatch() {
        let selection = BatchedIndexSelect::new(index_tensor(array![0, 1]));
        let result = selection.gradients(&array![1.0f32, 2.0, 3.0].into_dyn(), &[2, 2]);
        assert!(matches!(result, Err(Error::ShapeMismatch { .. })));
    }
}

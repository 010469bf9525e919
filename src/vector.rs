//! Vectors of degrees of freedom and element data.

use crate::{MemType, Scalar};
use nalgebra::{DVector, DVectorView, DVectorViewMut};

/// An owned buffer of scalars with a preferred memory residency.
///
/// All host-side access goes through [`Vector::view`] and
/// [`Vector::view_mut`]. Vectors tagged [`MemType::Device`] are materialized
/// on the device (in single precision) by the GPU backend when they
/// participate in an apply call; the host copy remains authoritative between
/// calls.
#[derive(Debug, Clone)]
pub struct Vector {
    values: DVector<Scalar>,
    mem: MemType,
}

impl Vector {
    /// Create a zero-initialized host vector of the given length.
    pub fn new(len: usize) -> Self {
        Self {
            values: DVector::zeros(len),
            mem: MemType::Host,
        }
    }

    /// Create a zero-initialized vector with the given residency preference.
    pub fn with_mem_type(len: usize, mem: MemType) -> Self {
        Self {
            values: DVector::zeros(len),
            mem,
        }
    }

    pub fn from_slice(values: &[Scalar]) -> Self {
        Self {
            values: DVector::from_column_slice(values),
            mem: MemType::Host,
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.len() == 0
    }

    pub fn mem_type(&self) -> MemType {
        self.mem
    }

    /// Fill every entry with the given value.
    pub fn set_value(&mut self, value: Scalar) {
        self.values.fill(value);
    }

    pub fn view(&self) -> DVectorView<'_, Scalar> {
        DVectorView::from(&self.values)
    }

    pub fn view_mut(&mut self) -> DVectorViewMut<'_, Scalar> {
        DVectorViewMut::from(&mut self.values)
    }

    pub fn as_slice(&self) -> &[Scalar] {
        self.values.as_slice()
    }

    pub fn as_mut_slice(&mut self) -> &mut [Scalar] {
        self.values.as_mut_slice()
    }

    /// Euclidean norm, mostly useful in tests and diagnostics.
    pub fn norm(&self) -> Scalar {
        self.values.norm()
    }
}

impl From<DVector<Scalar>> for Vector {
    fn from(values: DVector<Scalar>) -> Self {
        Self {
            values,
            mem: MemType::Host,
        }
    }
}

impl From<Vector> for DVector<Scalar> {
    fn from(vector: Vector) -> Self {
        vector.values
    }
}

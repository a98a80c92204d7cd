//! Host values accepted by the tensor constructors.

use crate::buffer::HostData;
use crate::dtype::Element;
use crate::{Result, Shape, TarnError};

/// Flat host data with an explicit shape.
#[derive(Debug, Clone, PartialEq)]
pub struct ArrayData {
    pub shape: Shape,
    pub data: HostData,
}

impl ArrayData {
    pub fn new<T: Element>(shape: impl Into<Shape>, values: Vec<T>) -> Result<Self> {
        let shape = shape.into();
        if shape.numel() != values.len() {
            return Err(TarnError::ShapeMismatch {
                expected: shape.dims().to_vec(),
                got: vec![values.len()],
            });
        }
        Ok(Self {
            shape,
            data: T::into_host(values),
        })
    }

    /// Rank-0 data holding one value.
    pub fn scalar<T: Element>(value: T) -> Self {
        Self {
            shape: Shape::scalar(),
            data: T::into_host(vec![value]),
        }
    }
}

/// Values that can become a leaf tensor.
pub trait IntoArray {
    fn into_array(self) -> Result<ArrayData>;
}

impl IntoArray for ArrayData {
    fn into_array(self) -> Result<ArrayData> {
        Ok(self)
    }
}

fn flatten_rows<T: Clone>(rows: &[Vec<T>]) -> Result<(usize, Vec<T>)> {
    let width = rows.first().map_or(0, Vec::len);
    let mut flat = Vec::with_capacity(rows.len() * width);
    for (i, row) in rows.iter().enumerate() {
        if row.len() != width {
            return Err(TarnError::RaggedArray(format!(
                "row {i} has {} elements, expected {width}",
                row.len()
            )));
        }
        flat.extend_from_slice(row);
    }
    Ok((width, flat))
}

macro_rules! impl_into_array {
    ($($t:ty),*) => {$(
        impl IntoArray for $t {
            fn into_array(self) -> Result<ArrayData> {
                Ok(ArrayData::scalar(self))
            }
        }

        impl IntoArray for Vec<$t> {
            fn into_array(self) -> Result<ArrayData> {
                ArrayData::new([self.len()], self)
            }
        }

        impl IntoArray for &[$t] {
            fn into_array(self) -> Result<ArrayData> {
                ArrayData::new([self.len()], self.to_vec())
            }
        }

        impl<const N: usize> IntoArray for [$t; N] {
            fn into_array(self) -> Result<ArrayData> {
                ArrayData::new([N], self.to_vec())
            }
        }

        impl<const R: usize, const C: usize> IntoArray for [[$t; C]; R] {
            fn into_array(self) -> Result<ArrayData> {
                ArrayData::new([R, C], self.iter().flatten().copied().collect())
            }
        }

        impl IntoArray for Vec<Vec<$t>> {
            fn into_array(self) -> Result<ArrayData> {
                let (width, flat) = flatten_rows(&self)?;
                ArrayData::new([self.len(), width], flat)
            }
        }

        impl IntoArray for Vec<Vec<Vec<$t>>> {
            fn into_array(self) -> Result<ArrayData> {
                let mut inner = None;
                let mut flat = Vec::new();
                for (i, plane) in self.iter().enumerate() {
                    let (width, rows) = flatten_rows(plane)?;
                    let dims = (plane.len(), width);
                    match inner {
                        None => inner = Some(dims),
                        Some(d) if d != dims => {
                            return Err(TarnError::RaggedArray(format!(
                                "plane {i} is {}x{}, expected {}x{}",
                                dims.0, dims.1, d.0, d.1
                            )))
                        }
                        Some(_) => {}
                    }
                    flat.extend(rows);
                }
                let (rows, cols) = inner.unwrap_or((0, 0));
                ArrayData::new([self.len(), rows, cols], flat)
            }
        }
    )*};
}

impl_into_array!(f32, f64, i32, i64);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DType;

    #[test]
    fn test_nested_shapes() {
        let a = vec![vec![1i64, 2, 3], vec![4, 5, 6]].into_array().unwrap();
        assert_eq!(a.shape.dims(), &[2, 3]);
        assert_eq!(a.data, HostData::I64(vec![1, 2, 3, 4, 5, 6]));

        let b = [[1.0f32, 2.0], [3.0, 4.0]].into_array().unwrap();
        assert_eq!(b.shape.dims(), &[2, 2]);
        assert_eq!(b.data.dtype(), DType::F32);

        let c = vec![vec![vec![1i32], vec![2]], vec![vec![3], vec![4]]].into_array().unwrap();
        assert_eq!(c.shape.dims(), &[2, 2, 1]);

        let s = 2.5f64.into_array().unwrap();
        assert!(s.shape.is_scalar());
    }

    #[test]
    fn test_ragged_rejected() {
        let err = vec![vec![1.0f64, 2.0], vec![3.0]].into_array().unwrap_err();
        assert!(matches!(err, TarnError::RaggedArray(_)));
        let err = vec![vec![vec![1i32, 2]], vec![vec![1], vec![2]]].into_array().unwrap_err();
        assert!(matches!(err, TarnError::RaggedArray(_)));
    }

    #[test]
    fn test_explicit_shape() {
        let a = ArrayData::new([2, 2], vec![1i32, 2, 3, 4]).unwrap();
        assert_eq!(a.shape.dims(), &[2, 2]);
        let err = ArrayData::new([3], vec![1i32, 2]).unwrap_err();
        assert_eq!(err, TarnError::ShapeMismatch { expected: vec![3], got: vec![2] });
    }
}

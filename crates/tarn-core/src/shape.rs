use smallvec::SmallVec;
use std::fmt;

/// Ordered tensor dimensions. Rank 0 is a scalar with one element.
///
/// Stored inline for up to four dimensions.
#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub struct Shape {
    dims: SmallVec<[usize; 4]>,
}

impl Shape {
    pub fn new(dims: &[usize]) -> Self {
        Self {
            dims: SmallVec::from_slice(dims),
        }
    }

    pub fn scalar() -> Self {
        Self {
            dims: SmallVec::new(),
        }
    }

    /// Number of dimensions (rank).
    pub fn ndim(&self) -> usize {
        self.dims.len()
    }

    /// Total number of elements.
    pub fn numel(&self) -> usize {
        self.dims.iter().product()
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn dim(&self, axis: usize) -> Option<usize> {
        self.dims.get(axis).copied()
    }

    pub fn is_scalar(&self) -> bool {
        self.dims.is_empty()
    }

    /// Whether every dimension is positive.
    pub fn is_valid(&self) -> bool {
        self.dims.iter().all(|&d| d > 0)
    }

    /// Row-major strides.
    pub fn contiguous_strides(&self) -> SmallVec<[usize; 4]> {
        let ndim = self.dims.len();
        let mut strides = SmallVec::from_elem(1usize, ndim);
        for i in (0..ndim.saturating_sub(1)).rev() {
            strides[i] = strides[i + 1] * self.dims[i + 1];
        }
        strides
    }

    /// Numpy-style broadcast of two shapes, aligned on trailing axes.
    pub fn broadcast_with(&self, other: &Shape) -> Option<Shape> {
        let max_ndim = self.ndim().max(other.ndim());
        let mut result = SmallVec::with_capacity(max_ndim);

        for i in 0..max_ndim {
            let a = self.from_back(i);
            let b = other.from_back(i);
            if a == b || b == 1 {
                result.push(a);
            } else if a == 1 {
                result.push(b);
            } else {
                return None;
            }
        }

        result.reverse();
        Some(Shape { dims: result })
    }

    /// Whether `self` broadcasts to `target` without changing `target`.
    pub fn broadcasts_to(&self, target: &Shape) -> bool {
        self.ndim() <= target.ndim() && self.broadcast_with(target).as_ref() == Some(target)
    }

    fn from_back(&self, i: usize) -> usize {
        if i < self.ndim() {
            self.dims[self.ndim() - 1 - i]
        } else {
            1
        }
    }

    /// Validate and compute a reshape target.
    /// At most one dimension can be -1 (inferred).
    pub fn resolve_reshape(&self, target: &[isize]) -> Option<Shape> {
        let numel = self.numel();
        let mut inferred_idx = None;
        let mut known_product: usize = 1;

        for (i, &d) in target.iter().enumerate() {
            if d == -1 {
                if inferred_idx.is_some() {
                    return None;
                }
                inferred_idx = Some(i);
            } else if d <= 0 {
                return None;
            } else {
                known_product = known_product.checked_mul(d as usize)?;
            }
        }

        let mut result: SmallVec<[usize; 4]> = target
            .iter()
            .map(|&d| if d == -1 { 0 } else { d as usize })
            .collect();

        if let Some(idx) = inferred_idx {
            if numel % known_product != 0 {
                return None;
            }
            result[idx] = numel / known_product;
        }

        let result_shape = Shape { dims: result };
        (result_shape.numel() == numel).then_some(result_shape)
    }

    /// Swap the last two dimensions.
    pub fn transpose(&self) -> Option<Shape> {
        if self.ndim() < 2 {
            return None;
        }
        let mut dims = self.dims.clone();
        let n = dims.len();
        dims.swap(n - 2, n - 1);
        Some(Shape { dims })
    }
}

/// Flat index into `src` for element `flat_idx` of the broadcast shape `out`.
pub(crate) fn broadcast_index(flat_idx: usize, out: &Shape, out_strides: &[usize], src: &Shape, src_strides: &[usize]) -> usize {
    let offset = out.ndim() - src.ndim();
    let mut remaining = flat_idx;
    let mut src_idx = 0;
    for (i, &stride) in out_strides.iter().enumerate() {
        let coord = remaining / stride;
        remaining %= stride;
        if i >= offset {
            let si = i - offset;
            if src.dims[si] > 1 {
                src_idx += coord * src_strides[si];
            }
        }
    }
    src_idx
}

impl fmt::Debug for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Shape({:?})", self.dims.as_slice())
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.dims.as_slice())
    }
}

impl From<&[usize]> for Shape {
    fn from(dims: &[usize]) -> Self {
        Shape::new(dims)
    }
}

impl From<Vec<usize>> for Shape {
    fn from(dims: Vec<usize>) -> Self {
        Shape {
            dims: SmallVec::from_vec(dims),
        }
    }
}

impl<const N: usize> From<[usize; N]> for Shape {
    fn from(dims: [usize; N]) -> Self {
        Shape::new(&dims)
    }
}

impl<const N: usize> From<&[usize; N]> for Shape {
    fn from(dims: &[usize; N]) -> Self {
        Shape::new(dims)
    }
}

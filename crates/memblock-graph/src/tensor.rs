//! Tensor descriptors, data types, and device memory types.

use smallvec::SmallVec;

/// A tensor shape. `-1` marks an unknown (dynamic) dimension.
///
/// Uses `SmallVec<[i64; 4]>` to keep rank-4 and smaller shapes inline.
pub type Shape = SmallVec<[i64; 4]>;

/// Element data type of a tensor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DataType {
    /// 1-byte boolean.
    Bool,
    /// Signed 8-bit integer.
    Int8,
    /// Unsigned 8-bit integer.
    Uint8,
    /// IEEE half precision.
    Float16,
    /// Brain floating point.
    BFloat16,
    /// Signed 32-bit integer.
    Int32,
    /// IEEE single precision.
    Float32,
    /// Signed 64-bit integer.
    Int64,
    /// IEEE double precision.
    Float64,
}

impl DataType {
    /// Width of one element in bytes.
    pub fn size_bytes(&self) -> u64 {
        match self {
            Self::Bool | Self::Int8 | Self::Uint8 => 1,
            Self::Float16 | Self::BFloat16 => 2,
            Self::Int32 | Self::Float32 => 4,
            Self::Int64 | Self::Float64 => 8,
        }
    }
}

/// Device memory pool a buffer is placed in.
///
/// Offsets are assigned independently per memory type; each type reports
/// its own total.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MemoryType {
    /// High-bandwidth device memory (the default pool).
    #[default]
    Hbm,
    /// Peer-to-peer DDR shared between devices.
    P2pDdr,
    /// Host-pinned memory.
    Host,
}

/// Shape, type and placement of one tensor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TensorDesc {
    /// Runtime shape; `-1` for unknown dimensions.
    pub shape: Shape,
    /// Element data type.
    pub dtype: DataType,
    /// Memory pool the tensor is placed in.
    pub memory_type: MemoryType,
    /// Upper-bound shape for no-tiling tensors.
    ///
    /// A no-tiling tensor keeps its dynamic shape at runtime and is sized
    /// by this bound; it also needs a separate shape descriptor buffer.
    pub no_tiling_max_shape: Option<Shape>,
}

impl TensorDesc {
    /// Create a descriptor in HBM.
    pub fn new(shape: &[i64], dtype: DataType) -> Self {
        Self {
            shape: shape.iter().copied().collect(),
            dtype,
            memory_type: MemoryType::Hbm,
            no_tiling_max_shape: None,
        }
    }

    /// Place the tensor in a different memory pool.
    pub fn with_memory_type(mut self, memory_type: MemoryType) -> Self {
        self.memory_type = memory_type;
        self
    }

    /// Mark the tensor as no-tiling with the given upper-bound shape.
    pub fn with_no_tiling(mut self, max_shape: &[i64]) -> Self {
        self.no_tiling_max_shape = Some(max_shape.iter().copied().collect());
        self
    }

    /// Whether the tensor uses no-tiling memory.
    pub fn is_no_tiling(&self) -> bool {
        self.no_tiling_max_shape.is_some()
    }

    /// Number of elements, or `None` if any dimension is unknown or negative.
    ///
    /// A rank-0 tensor is a scalar with one element.
    pub fn element_count(&self) -> Option<u64> {
        element_count(&self.shape)
    }

    /// Number of elements of the no-tiling bound, if set and fully known.
    pub fn max_element_count(&self) -> Option<u64> {
        self.no_tiling_max_shape.as_deref().and_then(element_count)
    }
}

fn element_count(shape: &[i64]) -> Option<u64> {
    shape.iter().try_fold(1u64, |acc, &dim| {
        if dim < 0 {
            None
        } else {
            acc.checked_mul(dim as u64)
        }
    })
}

/// Defines the possible data types for Tensor elements.
///
/// Floating-point data drives every differentiable computation; integer
/// data only appears as index input to embedding/one-hot lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    /// 32-bit floating-point type.
    F32,
    /// 64-bit integer type (index tensors).
    I64,
}

impl DType {
    /// Whether this dtype is an integer kind usable for index lookups.
    pub fn is_integer(&self) -> bool {
        matches!(self, DType::I64)
    }
}

impl std::fmt::Display for DType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DType::F32 => write!(f, "float32"),
            DType::I64 => write!(f, "int64"),
        }
    }
}

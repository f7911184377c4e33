pub mod banded;
pub mod cholesky;
pub mod vector_ops;

pub mod datatype;
pub mod row;
pub mod scalar;
pub mod sort;

pub use datatype::{DataType, TypeLayout};
pub use row::Row;
pub use scalar::ScalarValue;

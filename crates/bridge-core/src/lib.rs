pub mod fields;
pub mod model;
pub mod signatures;

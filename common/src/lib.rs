pub mod runtime;
pub mod shutdown;
pub mod socket;

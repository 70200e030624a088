//! Hardware Abstraction Layer, containing interfaces
//! for low level drivers.

pub mod serial;

#[cfg(test)]
#[doc(hidden)]
pub mod doubles;

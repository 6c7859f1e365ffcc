//! Compartment models and their multi-compartment aggregation.
//!
//! Forward models are pure functions of an acquisition scheme and a parameter
//! slice so the fitting code can stay generic over compartments.

pub mod compartment;
pub mod distributed;
pub mod kernel;
pub mod multi_compartment;

pub use compartment::Compartment;
pub use distributed::DistributedBundle;
pub use multi_compartment::{MultiCompartmentModel, ParameterLink};

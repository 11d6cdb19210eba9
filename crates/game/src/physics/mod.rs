pub mod aabb;
pub mod body;
pub mod collider;
pub mod constraint;
pub mod world;

pub use aabb::{Aabb, AabbTree};
pub use body::Body;
pub use collider::{Collider, ConvexPolygon, Manifold, ManifoldPoint};
pub use constraint::{Constraint, CustomConstraint};
pub use world::{CandidateContact, PhysicsWorld, SolverParams};

//! StripeIO Layout - where each byte of an object lives
//!
//! ```text
//!   object offset ──► parity group g ──► unit u (0..N data, N..N+K parity)
//!                                          │
//!                      HRW(object, g) ─────┘──► target t, offset g*U + off
//! ```
//!
//! A [`StripeLayout`] fixes the geometry (unit size U, N data and K parity
//! units). A [`PoolVersion`] is the set of targets an object is spread over;
//! each parity group picks its N+K targets by rendezvous hashing, so no two
//! units of one group share a target. The [`PoolMachine`] tracks which
//! targets are failed and the version of that view.

pub mod geometry;
pub mod pool;
pub mod resolver;

pub use geometry::{LayoutInstance, StripeLayout, UnitPos};
pub use pool::{FvUpdate, FvVersion, PoolEvent, PoolMachine, PoolVersion, TargetState};
pub use resolver::{LayoutResolver, ServiceInfo, StaticPools};

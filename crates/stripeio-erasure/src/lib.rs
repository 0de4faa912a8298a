//! StripeIO Erasure Coding - parity for one parity group at a time
//!
//! The client engine hands this crate the N data units of a parity group
//! and gets back K parity units, or hands it any N surviving units and gets
//! the missing ones back. Encoding is done by `reed-solomon-simd`, which
//! picks SSE/AVX/NEON paths at runtime.
//!
//! # Example
//!
//! ```
//! use stripeio_erasure::ParityCodec;
//!
//! let codec = ParityCodec::new(2, 1, 64).unwrap();
//! let d0 = vec![1u8; 64];
//! let d1 = vec![2u8; 64];
//! let parity = codec.encode(&[&d0, &d1]).unwrap();
//!
//! let mut units = vec![None, Some(d1.clone()), Some(parity[0].clone())];
//! codec.reconstruct(&mut units).unwrap();
//! assert_eq!(units[0].as_deref(), Some(&d0[..]));
//! ```

pub mod codec;

pub use codec::{ErasureError, ParityCodec, xor_into};

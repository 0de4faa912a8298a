//! Reed-Solomon parity codec for one parity group
//!
//! Units are indexed the way the layout indexes them: `0..N` are data
//! units, `N..N+K` are parity units. All units of a group have the same
//! size, the layout's unit size.

use reed_solomon_simd::{ReedSolomonDecoder, ReedSolomonEncoder};
use stripeio_common::Error as CommonError;
use thiserror::Error;

/// Errors from parity encoding or reconstruction
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ErasureError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("encoding failed: {0}")]
    EncodingFailed(String),

    #[error("decoding failed: {0}")]
    DecodingFailed(String),

    #[error("insufficient units: have {available}, need {required}")]
    InsufficientUnits { available: usize, required: usize },

    #[error("unit size mismatch: expected {expected}, got {actual}")]
    UnitSizeMismatch { expected: usize, actual: usize },
}

impl From<ErasureError> for CommonError {
    fn from(e: ErasureError) -> Self {
        CommonError::ErasureCoding(e.to_string())
    }
}

/// XOR `src` into `dst` byte by byte
pub fn xor_into(dst: &mut [u8], src: &[u8]) {
    debug_assert_eq!(dst.len(), src.len());
    for (d, s) in dst.iter_mut().zip(src) {
        *d ^= s;
    }
}

/// Systematic MDS codec over the units of one parity group
#[derive(Clone, Debug)]
pub struct ParityCodec {
    data_units: usize,
    parity_units: usize,
    unit_size: usize,
}

impl ParityCodec {
    /// Create a codec for N data and K parity units of `unit_size` bytes
    pub fn new(data_units: usize, parity_units: usize, unit_size: usize) -> Result<Self, ErasureError> {
        if data_units == 0 {
            return Err(ErasureError::InvalidConfig("data_units must be > 0".into()));
        }
        if data_units + parity_units > 32768 {
            return Err(ErasureError::InvalidConfig(format!(
                "{} units exceed the codec limit",
                data_units + parity_units
            )));
        }
        // the SIMD kernels work on 16-bit words
        if unit_size == 0 || unit_size % 2 != 0 {
            return Err(ErasureError::InvalidConfig(format!(
                "unit_size must be a positive even number, got {unit_size}"
            )));
        }
        Ok(Self {
            data_units,
            parity_units,
            unit_size,
        })
    }

    #[must_use]
    pub const fn data_units(&self) -> usize {
        self.data_units
    }

    #[must_use]
    pub const fn parity_units(&self) -> usize {
        self.parity_units
    }

    #[must_use]
    pub const fn unit_size(&self) -> usize {
        self.unit_size
    }

    fn check_unit(&self, unit: &[u8]) -> Result<(), ErasureError> {
        if unit.len() == self.unit_size {
            Ok(())
        } else {
            Err(ErasureError::UnitSizeMismatch {
                expected: self.unit_size,
                actual: unit.len(),
            })
        }
    }

    /// Compute the K parity units of a full set of N data units
    pub fn encode(&self, data: &[&[u8]]) -> Result<Vec<Vec<u8>>, ErasureError> {
        if data.len() != self.data_units {
            return Err(ErasureError::InvalidConfig(format!(
                "expected {} data units, got {}",
                self.data_units,
                data.len()
            )));
        }
        for unit in data {
            self.check_unit(unit)?;
        }
        if self.parity_units == 0 {
            return Ok(Vec::new());
        }

        let mut encoder = ReedSolomonEncoder::new(self.data_units, self.parity_units, self.unit_size)
            .map_err(|e| ErasureError::InvalidConfig(e.to_string()))?;
        for unit in data {
            encoder
                .add_original_shard(unit)
                .map_err(|e| ErasureError::EncodingFailed(e.to_string()))?;
        }
        let result = encoder
            .encode()
            .map_err(|e| ErasureError::EncodingFailed(e.to_string()))?;
        Ok(result.recovery_iter().map(<[u8]>::to_vec).collect())
    }

    /// Fold a data delta into existing parity
    ///
    /// `delta[i]` is `old_i XOR new_i` for every data unit (all zero for
    /// units the write leaves alone). Because the code is linear over XOR,
    /// encoding the delta and XOR-ing it into the old parity yields the
    /// parity of the new data without reading the untouched units.
    pub fn apply_delta(&self, parity: &mut [Vec<u8>], delta: &[&[u8]]) -> Result<(), ErasureError> {
        if parity.len() != self.parity_units {
            return Err(ErasureError::InvalidConfig(format!(
                "expected {} parity units, got {}",
                self.parity_units,
                parity.len()
            )));
        }
        for unit in parity.iter() {
            self.check_unit(unit)?;
        }
        let encoded = self.encode(delta)?;
        for (p, d) in parity.iter_mut().zip(&encoded) {
            xor_into(p, d);
        }
        Ok(())
    }

    /// Fill in every `None` entry of a full N+K unit vector
    ///
    /// Needs at least N units present. Missing data units are decoded,
    /// missing parity units are re-encoded from the completed data.
    pub fn reconstruct(&self, units: &mut [Option<Vec<u8>>]) -> Result<(), ErasureError> {
        let n = self.data_units;
        let k = self.parity_units;
        if units.len() != n + k {
            return Err(ErasureError::InvalidConfig(format!(
                "expected {} units, got {}",
                n + k,
                units.len()
            )));
        }
        let available = units.iter().filter(|u| u.is_some()).count();
        if available < n {
            return Err(ErasureError::InsufficientUnits {
                available,
                required: n,
            });
        }
        for unit in units.iter().flatten() {
            self.check_unit(unit)?;
        }

        let data_missing: Vec<usize> = (0..n).filter(|&i| units[i].is_none()).collect();
        if !data_missing.is_empty() {
            let mut decoder = ReedSolomonDecoder::new(n, k, self.unit_size)
                .map_err(|e| ErasureError::InvalidConfig(e.to_string()))?;
            for (i, unit) in units.iter().enumerate() {
                let Some(unit) = unit else { continue };
                let added = if i < n {
                    decoder.add_original_shard(i, unit)
                } else {
                    decoder.add_recovery_shard(i - n, unit)
                };
                added.map_err(|e| ErasureError::DecodingFailed(e.to_string()))?;
            }
            let result = decoder
                .decode()
                .map_err(|e| ErasureError::DecodingFailed(e.to_string()))?;
            for &i in &data_missing {
                let restored = result.restored_original(i).ok_or_else(|| {
                    ErasureError::DecodingFailed(format!("data unit {i} was not restored"))
                })?;
                units[i] = Some(restored.to_vec());
            }
        }

        if units[n..].iter().any(Option::is_none) {
            let data: Vec<&[u8]> = units[..n].iter().flatten().map(Vec::as_slice).collect();
            let parity = self.encode(&data)?;
            for (slot, p) in units[n..].iter_mut().zip(parity) {
                if slot.is_none() {
                    *slot = Some(p);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::RngCore;

    fn random_units(n: usize, size: usize) -> Vec<Vec<u8>> {
        let mut rng = rand::thread_rng();
        (0..n)
            .map(|_| {
                let mut v = vec![0u8; size];
                rng.fill_bytes(&mut v);
                v
            })
            .collect()
    }

    fn refs(units: &[Vec<u8>]) -> Vec<&[u8]> {
        units.iter().map(Vec::as_slice).collect()
    }

    #[test]
    fn test_codec_rejects_bad_geometry() {
        assert!(ParityCodec::new(0, 2, 4096).is_err());
        assert!(ParityCodec::new(4, 2, 4095).is_err());
        assert!(ParityCodec::new(4, 2, 0).is_err());
    }

    #[test]
    fn test_reconstruct_missing_data() {
        let codec = ParityCodec::new(4, 2, 4096).unwrap();
        let data = random_units(4, 4096);
        let parity = codec.encode(&refs(&data)).unwrap();
        assert_eq!(parity.len(), 2);

        let mut units: Vec<Option<Vec<u8>>> =
            data.iter().chain(&parity).cloned().map(Some).collect();
        units[1] = None;
        units[3] = None;
        codec.reconstruct(&mut units).unwrap();
        assert_eq!(units[1].as_ref(), Some(&data[1]));
        assert_eq!(units[3].as_ref(), Some(&data[3]));
    }

    #[test]
    fn test_reconstruct_missing_parity_only() {
        let codec = ParityCodec::new(3, 2, 512).unwrap();
        let data = random_units(3, 512);
        let parity = codec.encode(&refs(&data)).unwrap();

        let mut units: Vec<Option<Vec<u8>>> =
            data.iter().chain(&parity).cloned().map(Some).collect();
        units[4] = None;
        codec.reconstruct(&mut units).unwrap();
        assert_eq!(units[4].as_ref(), Some(&parity[1]));
    }

    #[test]
    fn test_reconstruct_too_many_missing() {
        let codec = ParityCodec::new(4, 2, 512).unwrap();
        let mut units: Vec<Option<Vec<u8>>> = vec![None, None, None, Some(vec![0; 512]), None, None];
        assert_eq!(
            codec.reconstruct(&mut units),
            Err(ErasureError::InsufficientUnits {
                available: 1,
                required: 4
            })
        );
    }

    #[test]
    fn test_apply_delta_matches_full_encode() {
        let codec = ParityCodec::new(4, 2, 1024).unwrap();
        let old = random_units(4, 1024);
        let mut parity = codec.encode(&refs(&old)).unwrap();

        // overwrite unit 2 only
        let mut new = old.clone();
        new[2] = random_units(1, 1024).remove(0);

        let zero = vec![0u8; 1024];
        let mut d2 = old[2].clone();
        xor_into(&mut d2, &new[2]);
        let delta: Vec<&[u8]> = vec![&zero, &zero, &d2, &zero];
        codec.apply_delta(&mut parity, &delta).unwrap();

        assert_eq!(parity, codec.encode(&refs(&new)).unwrap());
    }

    #[test]
    fn test_no_parity_layout() {
        let codec = ParityCodec::new(2, 0, 64).unwrap();
        let data = random_units(2, 64);
        assert!(codec.encode(&refs(&data)).unwrap().is_empty());
        let mut units: Vec<Option<Vec<u8>>> = vec![Some(data[0].clone()), None];
        assert!(codec.reconstruct(&mut units).is_err());
    }
}

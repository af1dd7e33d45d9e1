//! Random value sampling backed by a strong entropy source.

use rand::distributions::{Distribution, Uniform};
use rand::rngs::{OsRng, StdRng};
use rand::{RngCore, SeedableRng};

use crate::spec::{EffectiveSpec, DEFAULT_ALPHABET};

#[derive(Debug, thiserror::Error)]
#[error("entropy source failed: {0}")]
pub struct EntropyError(#[from] pub rand::Error);

/// Source of cryptographically strong random bytes.
pub trait Entropy: Send + Sync {
    fn fill(&self, dest: &mut [u8]) -> Result<(), EntropyError>;
}

/// Operating system CSPRNG.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsEntropy;

impl Entropy for OsEntropy {
    fn fill(&self, dest: &mut [u8]) -> Result<(), EntropyError> {
        OsRng.try_fill_bytes(dest)?;
        Ok(())
    }
}

/// Produce a fresh value for `spec`.
///
/// Binary specs read `length` bytes straight from `entropy`. Text specs pick
/// `length` characters from the alphabet; the indices come from a ChaCha
/// generator seeded by `entropy` through `Uniform`, which rejects out-of-zone
/// draws so every position is equally likely.
pub fn sample(spec: &EffectiveSpec, entropy: &dyn Entropy) -> Result<Vec<u8>, EntropyError> {
    let mut out = vec![0u8; spec.length];
    if spec.binary {
        entropy.fill(&mut out)?;
        return Ok(out);
    }

    let alphabet = if spec.alphabet.is_empty() { DEFAULT_ALPHABET.as_bytes() } else { spec.alphabet.as_bytes() };
    let mut seed = [0u8; 32];
    entropy.fill(&mut seed)?;
    let mut rng = StdRng::from_seed(seed);
    let index = Uniform::new(0, alphabet.len());
    for b in out.iter_mut() {
        *b = alphabet[index.sample(&mut rng)];
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Failing;
    impl Entropy for Failing {
        fn fill(&self, _dest: &mut [u8]) -> Result<(), EntropyError> {
            Err(EntropyError(rand::Error::new(std::io::Error::new(std::io::ErrorKind::Other, "exhausted"))))
        }
    }

    fn text(length: usize, alphabet: &str) -> EffectiveSpec {
        EffectiveSpec { length, alphabet: alphabet.to_string(), binary: false, ttl: None }
    }

    #[test]
    fn text_values_use_only_the_alphabet() {
        let v = sample(&text(64, "xyz"), &OsEntropy).unwrap();
        assert_eq!(v.len(), 64);
        assert!(v.iter().all(|b| b"xyz".contains(b)));
    }

    #[test]
    fn binary_values_have_exact_length() {
        let spec = EffectiveSpec { length: 16, alphabet: String::new(), binary: true, ttl: None };
        assert_eq!(sample(&spec, &OsEntropy).unwrap().len(), 16);
    }

    #[test]
    fn entropy_failure_is_reported() {
        assert!(sample(&text(8, "ab"), &Failing).is_err());
        let spec = EffectiveSpec { length: 8, alphabet: String::new(), binary: true, ttl: None };
        assert!(sample(&spec, &Failing).is_err());
    }

    #[test]
    fn empty_alphabet_falls_back_to_default() {
        let v = sample(&text(32, ""), &OsEntropy).unwrap();
        assert!(v.iter().all(|b| DEFAULT_ALPHABET.as_bytes().contains(b)));
    }

    #[test]
    fn text_sampling_is_uniform() {
        // chi-square against uniform over 10 symbols, 9 degrees of freedom.
        // 40.0 sits far beyond the 0.9999 quantile (~33.7).
        let alphabet = "0123456789";
        let draws = 200_000usize;
        let v = sample(&text(draws, alphabet), &OsEntropy).unwrap();
        let mut counts = [0usize; 10];
        for b in v {
            counts[(b - b'0') as usize] += 1;
        }
        let expected = draws as f64 / 10.0;
        let chi2: f64 = counts.iter().map(|&c| (c as f64 - expected).powi(2) / expected).sum();
        assert!(chi2 < 40.0, "chi2={} counts={:?}", chi2, counts);
    }
}

//! Elementwise vector arithmetic over ℤ_q.
//!
//! The triple shares live in (ℤ_q)^n where q is the plaintext modulus of
//! the lattice scheme. [`Modulus`] supplies the reductions (a conditional
//! subtraction after additions, a Barrett reduction after products) and
//! rejection-sampled uniform draws, so no bias sneaks in for a q that is
//! not a power of two.

use fhe_math::zq::Modulus;
use rand::{CryptoRng, RngCore};

/// Samples a uniform vector of `n` coordinates below the modulus.
pub fn sample_uniform_vec<R: RngCore + CryptoRng>(
    n: usize,
    q: &Modulus,
    rng: &mut R,
) -> Vec<u64> {
    q.random_vec(n, rng)
}

/// Elementwise a + b mod q.
pub fn add_vec(a: &[u64], b: &[u64], q: &Modulus) -> Vec<u64> {
    debug_assert_eq!(a.len(), b.len());
    let mut v = a.to_vec();
    q.add_vec(&mut v, b);
    v
}

/// Elementwise a − b mod q.
pub fn sub_vec(a: &[u64], b: &[u64], q: &Modulus) -> Vec<u64> {
    debug_assert_eq!(a.len(), b.len());
    let mut v = a.to_vec();
    q.sub_vec(&mut v, b);
    v
}

/// Elementwise a · b mod q.
pub fn mul_vec(a: &[u64], b: &[u64], q: &Modulus) -> Vec<u64> {
    debug_assert_eq!(a.len(), b.len());
    let mut v = a.to_vec();
    q.mul_vec(&mut v, b);
    v
}

/// Elementwise −a mod q.
pub fn neg_vec(a: &[u64], q: &Modulus) -> Vec<u64> {
    a.iter().map(|&x| q.neg(x)).collect()
}

#[cfg(test)]
mod tests {
    use rand::thread_rng;

    use super::*;

    const Q: u64 = 4_294_475_777;

    #[test]
    fn add_then_sub_is_identity() {
        let q = Modulus::new(Q).unwrap();
        let mut rng = thread_rng();
        let a = sample_uniform_vec(64, &q, &mut rng);
        let b = sample_uniform_vec(64, &q, &mut rng);
        assert_eq!(sub_vec(&add_vec(&a, &b, &q), &b, &q), a);
    }

    #[test]
    fn mul_matches_wide_arithmetic() {
        let q = Modulus::new(Q).unwrap();
        let mut rng = thread_rng();
        let a = sample_uniform_vec(64, &q, &mut rng);
        let b = sample_uniform_vec(64, &q, &mut rng);
        let v = mul_vec(&a, &b, &q);
        for i in 0..a.len() {
            let expected = ((a[i] as u128 * b[i] as u128) % Q as u128) as u64;
            assert_eq!(v[i], expected);
        }
    }

    #[test]
    fn neg_cancels() {
        let q = Modulus::new(Q).unwrap();
        let mut rng = thread_rng();
        let a = sample_uniform_vec(64, &q, &mut rng);
        let zero = add_vec(&a, &neg_vec(&a, &q), &q);
        assert!(zero.iter().all(|&x| x == 0));
    }

    #[test]
    fn samples_stay_below_modulus() {
        let q = Modulus::new(Q).unwrap();
        let v = sample_uniform_vec(4096, &q, &mut thread_rng());
        assert!(v.iter().all(|&x| x < Q));
    }
}

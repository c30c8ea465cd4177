//! Glue around the BFV library.
//!
//! The protocols treat ciphertexts and shares as opaque byte strings; the
//! few places where polynomial-level access is needed are concentrated
//! here. Vectors are encoded with the SIMD encoding throughout so that
//! homomorphic products act coordinate-wise on the triple shares.

use std::sync::Arc;

use fhe::bfv::{BfvParameters, Ciphertext, Encoding, Plaintext, SecretKey};
use fhe_math::rq::{traits::TryConvertFrom, Poly, Representation};
use fhe_traits::{
    DeserializeParametrized, FheDecoder, FheDecrypter, FheEncoder, FheEncrypter, Serialize,
};
use rand::{CryptoRng, RngCore};

use crate::ProtocolError;

/// SIMD-encodes a vector of plaintext-modulus residues.
pub fn encode_simd(values: &[u64], par: &Arc<BfvParameters>) -> Result<Plaintext, ProtocolError> {
    Ok(Plaintext::try_encode(values, Encoding::simd(), par)?)
}

/// Decrypts and SIMD-decodes a ciphertext.
pub fn decrypt_simd(ct: &Ciphertext, sk: &SecretKey) -> Result<Vec<u64>, ProtocolError> {
    let pt = sk.try_decrypt(ct)?;
    Ok(Vec::<u64>::try_decode(&pt, Encoding::simd())?)
}

/// The first polynomial of a fresh encryption of `values` under the zero
/// secret key, i.e. Δ·encode(values) plus fresh noise. Adding it to (or
/// subtracting it from) a ciphertext polynomial injects the plaintext
/// under any key, at the cost of a small noise term the decoder rounds
/// away.
pub fn masking_poly<R: RngCore + CryptoRng>(
    values: &[u64],
    par: &Arc<BfvParameters>,
    rng: &mut R,
) -> Result<Poly, ProtocolError> {
    let zero_key = SecretKey::new(vec![0; par.degree()], par);
    let pt = encode_simd(values, par)?;
    let mut ct = zero_key.try_encrypt(&pt, rng)?;
    Ok(ct.c.swap_remove(0))
}

/// The secret key as an NTT-form ring polynomial, for the collaborative
/// decryption shares.
pub fn secret_key_poly(
    sk: &SecretKey,
    par: &Arc<BfvParameters>,
) -> Result<Poly, ProtocolError> {
    let ctx = par.ctx_at_level(0)?;
    let mut s = Poly::try_convert_from(
        sk.coeffs.as_ref(),
        ctx,
        false,
        Representation::PowerBasis,
    )?;
    s.change_representation(Representation::Ntt);
    Ok(s)
}

/// A smudging noise polynomial drawn from the parameter set's Gaussian.
pub fn smudging_poly<R: RngCore + CryptoRng>(
    par: &Arc<BfvParameters>,
    representation: Representation,
    rng: &mut R,
) -> Result<Poly, ProtocolError> {
    let ctx = par.ctx_at_level(0)?;
    Ok(Poly::small(ctx, representation, par.variance(), rng)?)
}

/// Decodes the plaintext carried by a bare first ciphertext polynomial by
/// pairing it with a zero second polynomial; the decryption then reduces
/// to the library's scaling and decoding, independent of the key.
pub fn decode_first_poly(
    c0: Poly,
    sk: &SecretKey,
    par: &Arc<BfvParameters>,
) -> Result<Vec<u64>, ProtocolError> {
    let zero = Poly::zero(par.ctx_at_level(0)?, Representation::Ntt);
    let ct = Ciphertext::new(vec![c0, zero], par)?;
    decrypt_simd(&ct, sk)
}

/// Serializes a ciphertext in the canonical two-polynomial wire form.
///
/// A freshly encrypted ciphertext serializes its second polynomial as the
/// 32-byte seed that generated it; rebuilding the ciphertext from its
/// polynomials drops the seed so that every wire ciphertext of one
/// parameter set has the same byte length.
pub fn wire_ciphertext(
    ct: &Ciphertext,
    par: &Arc<BfvParameters>,
) -> Result<Vec<u8>, ProtocolError> {
    Ok(Ciphertext::new(ct.c.clone(), par)?.to_bytes())
}

/// The fixed wire length of a two-polynomial ciphertext, computed once per
/// run from a throwaway encryption.
pub fn ciphertext_wire_len<R: RngCore + CryptoRng>(
    sk: &SecretKey,
    par: &Arc<BfvParameters>,
    rng: &mut R,
) -> Result<usize, ProtocolError> {
    let pt = encode_simd(&vec![0u64; par.degree()], par)?;
    let ct = sk.try_encrypt(&pt, rng)?;
    Ok(wire_ciphertext(&ct, par)?.len())
}

/// Concatenates the serializations of a ciphertext pair. Both halves are
/// fresh seeded encryptions of the same form, so they serialize to the
/// same length and the receiver splits the buffer at its midpoint.
pub fn wire_pair(a: &Ciphertext, b: &Ciphertext) -> Vec<u8> {
    let mut data = a.to_bytes();
    data.extend(b.to_bytes());
    data
}

/// Deserializes a ciphertext received from a peer.
pub fn ciphertext_from_bytes(
    bytes: &[u8],
    par: &Arc<BfvParameters>,
) -> Result<Ciphertext, ProtocolError> {
    Ciphertext::from_bytes(bytes, par).map_err(|e| ProtocolError::Deserialize(e.to_string()))
}

/// Deserializes a ring polynomial received from a peer.
pub fn poly_from_bytes(bytes: &[u8], par: &Arc<BfvParameters>) -> Result<Poly, ProtocolError> {
    use fhe_traits::DeserializeWithContext;
    let ctx = par.ctx_at_level(0)?;
    Poly::from_bytes(bytes, ctx).map_err(|e| ProtocolError::Deserialize(e.to_string()))
}

#[cfg(test)]
mod tests {
    use fhe::bfv::BfvParametersBuilder;
    use rand::thread_rng;

    use super::*;
    use crate::math;
    use fhe_math::zq::Modulus;

    fn small_parameters() -> Arc<BfvParameters> {
        BfvParametersBuilder::new()
            .set_degree(16)
            .set_plaintext_modulus(1153)
            .set_moduli_sizes(&[62, 62, 62])
            .build_arc()
            .unwrap()
    }

    #[test]
    fn masking_poly_carries_the_plaintext() {
        let mut rng = thread_rng();
        let par = small_parameters();
        let q = Modulus::new(par.plaintext()).unwrap();
        let sk = SecretKey::random(&par, &mut rng);

        let values = math::sample_uniform_vec(par.degree(), &q, &mut rng);
        let mask = masking_poly(&values, &par, &mut rng).unwrap();

        // Add the mask onto an encryption of zero; decryption must yield
        // the mask values.
        let zero_pt = encode_simd(&vec![0u64; par.degree()], &par).unwrap();
        let mut ct = sk.try_encrypt(&zero_pt, &mut rng).unwrap();
        ct.c[0] += &mask;
        assert_eq!(decrypt_simd(&ct, &sk).unwrap(), values);
    }

    #[test]
    fn wire_ciphertexts_have_one_length() {
        let mut rng = thread_rng();
        let par = small_parameters();
        let q = Modulus::new(par.plaintext()).unwrap();
        let sk = SecretKey::random(&par, &mut rng);
        let wire_len = ciphertext_wire_len(&sk, &par, &mut rng).unwrap();

        for _ in 0..4 {
            let values = math::sample_uniform_vec(par.degree(), &q, &mut rng);
            let pt = encode_simd(&values, &par).unwrap();
            let ct = sk.try_encrypt(&pt, &mut rng).unwrap();
            let bytes = wire_ciphertext(&ct, &par).unwrap();
            assert_eq!(bytes.len(), wire_len);
            let back = ciphertext_from_bytes(&bytes, &par).unwrap();
            assert_eq!(decrypt_simd(&back, &sk).unwrap(), values);
        }
    }

    #[test]
    fn first_poly_decoding_matches_decryption() {
        let mut rng = thread_rng();
        let par = small_parameters();
        let q = Modulus::new(par.plaintext()).unwrap();
        let sk = SecretKey::random(&par, &mut rng);

        let values = math::sample_uniform_vec(par.degree(), &q, &mut rng);
        let pt = encode_simd(&values, &par).unwrap();
        let ct = sk.try_encrypt(&pt, &mut rng).unwrap();

        // Fold c1·s into c0 by hand, then decode c0 alone.
        let s = secret_key_poly(&sk, &par).unwrap();
        let c0 = &ct.c[0] + &(&ct.c[1] * &s);
        assert_eq!(decode_first_poly(c0, &sk, &par).unwrap(), values);
    }
}

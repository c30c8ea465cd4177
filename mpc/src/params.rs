//! BFV parameter preset shared by every party.

use std::sync::Arc;

use fhe::bfv::{BfvParameters, BfvParametersBuilder};

use crate::ProtocolError;

/// Ring degree; one protocol run yields this many triples per party.
pub const DEGREE: usize = 8192;

/// Plaintext modulus, a 32-bit NTT-friendly prime. This is also the
/// modulus q of the generated triples.
pub const PLAINTEXT_MODULUS: u64 = 4_294_475_777;

/// Ciphertext moduli bit sizes, summing to a ~218-bit Q.
pub const MODULI_SIZES: [usize; 4] = [55, 55, 54, 54];

/// The shipped parameter set: degree 2¹³ with a ~218-bit ciphertext
/// modulus and the triple modulus as plaintext modulus. The error
/// distribution stays at the library default (variance 10 ≈ 3.19²), which
/// is also used for smudging.
pub fn default_parameters() -> Result<Arc<BfvParameters>, ProtocolError> {
    Ok(BfvParametersBuilder::new()
        .set_degree(DEGREE)
        .set_plaintext_modulus(PLAINTEXT_MODULUS)
        .set_moduli_sizes(&MODULI_SIZES)
        .build_arc()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shipped_parameters_build() {
        let par = default_parameters().unwrap();
        assert_eq!(par.degree(), DEGREE);
        assert_eq!(par.plaintext(), PLAINTEXT_MODULUS);
        assert_eq!(par.moduli().len(), MODULI_SIZES.len());
    }
}

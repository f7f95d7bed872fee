/// Cosine similarity between two embedding vectors.
///
/// Returns `0.0` when the lengths differ, either vector is empty, or either
/// norm is zero.  Accumulates in `f64` so that `cosine_similarity(a, a)` is
/// exactly `1.0` for any non-zero `a` and the result is symmetric.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (&x, &y) in a.iter().zip(b.iter()) {
        let (x, y) = (f64::from(x), f64::from(y));
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    // sqrt of the product rather than product of the sqrts: sqrt(d * d) == d
    // exactly, which keeps self-similarity at 1.0.
    dot / (norm_a * norm_b).sqrt()
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::cosine_similarity;

    #[test]
    fn identical_vectors_score_one() {
        assert_eq!(cosine_similarity(&[0.3, -1.2, 4.5], &[0.3, -1.2, 4.5]), 1.0);
    }

    #[test]
    fn orthogonal_vectors_score_zero() {
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
    }

    #[test]
    fn opposite_vectors_score_minus_one() {
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[-1.0, -2.0]), -1.0);
    }

    #[test]
    fn magnitude_is_ignored() {
        let sim = cosine_similarity(&[1.0, 1.0], &[10.0, 10.0]);
        assert!((sim - 1.0).abs() < 1e-12);
    }

    #[test]
    fn degenerate_inputs_score_zero() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[], &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[0.0, 0.0]), 0.0);
    }

    #[test]
    fn known_value() {
        let sim = cosine_similarity(&[1.0, 0.0], &[0.6, 0.8]);
        assert!((sim - 0.6).abs() < 1e-6, "got {sim}");
    }

    fn finite_vec(len: usize) -> impl Strategy<Value = Vec<f32>> {
        prop::collection::vec(-1000.0f32..1000.0, len)
    }

    proptest! {
        #[test]
        fn property_self_similarity_is_one(a in (1usize..64).prop_flat_map(finite_vec)) {
            prop_assume!(a.iter().any(|x| *x != 0.0));
            prop_assert_eq!(cosine_similarity(&a, &a), 1.0);
        }

        #[test]
        fn property_similarity_is_symmetric(
            (a, b) in (1usize..64).prop_flat_map(|n| (finite_vec(n), finite_vec(n)))
        ) {
            prop_assert_eq!(cosine_similarity(&a, &b), cosine_similarity(&b, &a));
        }

        #[test]
        fn property_similarity_is_bounded(
            (a, b) in (1usize..64).prop_flat_map(|n| (finite_vec(n), finite_vec(n)))
        ) {
            let sim = cosine_similarity(&a, &b);
            prop_assert!((-1.0 - 1e-9..=1.0 + 1e-9).contains(&sim));
        }

        #[test]
        fn property_length_mismatch_is_zero(a in finite_vec(3), b in finite_vec(4)) {
            prop_assert_eq!(cosine_similarity(&a, &b), 0.0);
        }
    }
}

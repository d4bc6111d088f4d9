//! Distance kernels used by clustering, quantization and search.
//!
//! Everything in the store compares vectors by squared Euclidean distance.

/// Squared L2 distance between two equal-length slices.
///
/// Accumulates four independent lanes so the compiler can vectorize the
/// loop; the sqrt is skipped because callers only ever rank distances.
#[inline]
pub fn l2_distance_squared(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len(), "Vector dimensions must match");

    let mut lanes = [0.0f32; 4];
    let a_chunks = a.chunks_exact(4);
    let b_chunks = b.chunks_exact(4);
    let a_tail = a_chunks.remainder();
    let b_tail = b_chunks.remainder();

    for (x, y) in a_chunks.zip(b_chunks) {
        for lane in 0..4 {
            let d = x[lane] - y[lane];
            lanes[lane] += d * d;
        }
    }

    let mut sum = lanes[0] + lanes[1] + lanes[2] + lanes[3];
    for (x, y) in a_tail.iter().zip(b_tail) {
        let d = x - y;
        sum += d * d;
    }
    sum
}

/// Write `vector - centroid` into `out`.
#[inline]
pub fn residual_into(vector: &[f32], centroid: &[f32], out: &mut [f32]) {
    debug_assert_eq!(vector.len(), centroid.len());
    debug_assert_eq!(vector.len(), out.len());

    for ((o, v), c) in out.iter_mut().zip(vector).zip(centroid) {
        *o = v - c;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_l2_distance_squared_small() {
        assert_eq!(l2_distance_squared(&[1.0, 0.0], &[0.0, 1.0]), 2.0);
        // 3^2 + 3^2 + 3^2
        assert_eq!(l2_distance_squared(&[1.0, 2.0, 3.0], &[4.0, 5.0, 6.0]), 27.0);
    }

    #[test]
    fn test_l2_distance_squared_matches_naive() {
        let a: Vec<f32> = (0..103).map(|i| (i as f32 * 0.37).sin()).collect();
        let b: Vec<f32> = (0..103).map(|i| (i as f32 * 0.11).cos()).collect();

        let naive: f32 = a.iter().zip(&b).map(|(x, y)| (x - y) * (x - y)).sum();
        assert!((l2_distance_squared(&a, &b) - naive).abs() < 1e-3);
    }

    #[test]
    fn test_identical_vectors() {
        let v = vec![0.5f32; 384];
        assert_eq!(l2_distance_squared(&v, &v), 0.0);
    }

    #[test]
    fn test_residual() {
        let mut r = [9.0f32; 3];
        residual_into(&[3.0, 1.0, -2.0], &[1.0, 1.0, 1.0], &mut r);
        assert_eq!(r, [2.0, 0.0, -3.0]);
    }
}

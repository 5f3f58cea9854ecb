//! Unit-length normalization for embedding vectors.
//!
//! Every vector is rescaled to L2 norm 1 before it is stored or used as a
//! query, so the inner product of two vectors equals their cosine similarity.
//! The same functions run on the write path (`IndexStore::append`) and on the
//! read path (`FederatedQuery::search`).

/// Divisor used in place of a zero norm. A zero vector stays (effectively) zero.
pub const NORM_EPSILON: f32 = 1e-10;

/// Compute the L2 norm of a vector.
pub fn l2_norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Inner product of two vectors of equal length.
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// Rescale `v` in place to unit length.
pub fn normalize_in_place(v: &mut [f32]) {
    let mut norm = l2_norm(v);
    if norm == 0.0 || !norm.is_finite() {
        norm = NORM_EPSILON;
    }
    for x in v.iter_mut() {
        *x /= norm;
    }
}

/// Return a unit-length copy of `v`.
pub fn normalize(v: &[f32]) -> Vec<f32> {
    let mut out = v.to_vec();
    normalize_in_place(&mut out);
    out
}

/// Normalize every row of a batch independently.
pub fn normalize_rows(rows: &mut [Vec<f32>]) {
    for row in rows.iter_mut() {
        normalize_in_place(row);
    }
}

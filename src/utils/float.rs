use std::cmp::Ordering;

/// Total ordering for simulation clocks, NaN sorts last
pub fn total_cmp(a: &f64, b: &f64) -> Ordering {
    a.total_cmp(b)
}

/// `a / b`, or `0.0` for an empty denominator
pub fn ratio_or_zero(a: f64, b: f64) -> f64 {
    if b == 0.0 {
        0.0
    } else {
        a / b
    }
}

/// Mean of the values, `0.0` when there are none
pub fn mean<'a>(values: impl IntoIterator<Item = &'a f64>) -> f64 {
    let (sum, n) = values
        .into_iter()
        .fold((0.0, 0usize), |(sum, n), v| (sum + v, n + 1));
    ratio_or_zero(sum, n as f64)
}

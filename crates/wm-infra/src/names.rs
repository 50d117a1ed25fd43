use rand::Rng;
use rand::distr::Alphanumeric;

/// Generates `prefix` followed by `len` random lowercase alphanumerics.
pub fn generate(prefix: &str, len: usize) -> String {
    let suffix: String = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(|b| char::from(b).to_ascii_lowercase())
        .collect();
    format!("{prefix}{suffix}")
}

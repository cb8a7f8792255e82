//! # Utility Functions Module
//!
//! Helpers shared by the external-tool backends when building argument lists.

use std::path::Path;

/// Converts any iterable of string-like items to `Vec<String>`.
///
/// # Example
/// ```rust
/// use media_recompress::utils::to_string_vec;
///
/// let speed = 4;
/// let args = to_string_vec(["--speed", &speed.to_string(), "--jobs", "all"]);
/// assert_eq!(args[1], "4");
/// ```
pub fn to_string_vec<T, I>(items: I) -> Vec<String>
where
    T: ToString,
    I: IntoIterator<Item = T>,
{
    items.into_iter().map(|item| item.to_string()).collect()
}

/// Lossy path-to-argument conversion for external commands.
pub fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Builds a `Vec<String>` from mixed displayable items.
///
/// # Example
/// ```rust
/// use media_recompress::args;
///
/// let quantizer = 23;
/// let args = args!["--min", quantizer, "--max", quantizer];
/// assert_eq!(args, vec!["--min", "23", "--max", "23"]);
/// ```
#[macro_export]
macro_rules! args {
    [$($item:expr),* $(,)?] => {
        $crate::utils::to_string_vec([$($item.to_string()),*])
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_to_string_vec_mixed_types() {
        let quality = 85;
        let result = to_string_vec(["-quality", &quality.to_string(), "-optimize"]);
        assert_eq!(result, vec!["-quality", "85", "-optimize"]);
    }

    #[test]
    fn test_to_string_vec_empty() {
        let result: Vec<String> = to_string_vec(Vec::<&str>::new());
        assert!(result.is_empty());
    }

    #[test]
    fn test_args_macro_mixes_numbers_and_paths() {
        let speed = 4u8;
        let output = PathBuf::from("/tmp/out.avif");
        let result = args!["--speed", speed, "-o", path_arg(&output)];
        assert_eq!(result, vec!["--speed", "4", "-o", "/tmp/out.avif"]);
    }
}

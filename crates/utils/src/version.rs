use std::sync::LazyLock;

/// Defines the application version.
pub static VERSION: LazyLock<String> = LazyLock::new(|| {
    format_version(
        env!("IMAGE_VERSION"),
        option_env!("VERGEN_GIT_SHA"),
        option_env!("VERGEN_GIT_DIRTY") == Some("true"),
    )
});

fn format_version(image_version: &str, sha: Option<&str>, dirty: bool) -> String {
    let sha = sha.map(|s| s.get(..12).unwrap_or(s)).unwrap_or("unknown");
    format!(
        "{}-{}{}",
        image_version,
        sha,
        if dirty { "-dirty" } else { "" }
    )
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn test_format_version() {
        assert_eq!(
            format_version("1.2.0", Some("0123456789abcdef0123"), false),
            "1.2.0-0123456789ab"
        );
        assert_eq!(format_version("latest", None, true), "latest-unknown-dirty");
        assert_eq!(format_version("latest", Some("abc"), false), "latest-abc");
    }
}

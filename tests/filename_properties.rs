use oxide_wasabi::utils::{human_bytes, sanitize_filename, MAX_FILENAME_LEN};
use proptest::prelude::*;

fn is_safe(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, ' ' | '_' | '.' | '-')
}

proptest! {
    #[test]
    fn sanitized_names_are_short_and_safe(name in "\\PC{0,400}") {
        let out = sanitize_filename(&name);
        prop_assert!(out.len() <= MAX_FILENAME_LEN);
        prop_assert!(out.chars().all(is_safe));
    }

    #[test]
    fn long_names_keep_their_extension(stem in "[a-z]{250,300}", ext in "[a-z0-9]{1,8}") {
        let out = sanitize_filename(&format!("{stem}.{ext}"));
        prop_assert_eq!(out.len(), MAX_FILENAME_LEN);
        let suffix = format!(".{ext}");
        prop_assert!(out.ends_with(&suffix));
    }

    #[test]
    fn safe_short_names_are_unchanged(name in "[a-zA-Z0-9 _.-]{1,200}") {
        prop_assert_eq!(sanitize_filename(&name), name);
    }

    #[test]
    fn human_bytes_always_has_a_unit(size in any::<u64>()) {
        let text = human_bytes(size);
        let unit = text.rsplit(' ').next().unwrap_or_default();
        prop_assert!(["B", "KB", "MB", "GB", "TB"].contains(&unit));
    }
}

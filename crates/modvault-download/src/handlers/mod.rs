//! The provider handler set.
//!
//! One module per provider family. Ordering is decided by the factory, not
//! here; the only hard rule is that the direct-HTTP catch-all goes last.

pub mod anoncloud;
pub mod direct;
pub mod jsgated;
pub mod meshsite;
pub mod modindex;

use glob::Pattern;

/// Match a filename against the caller's target patterns (`*`, `?`).
///
/// `None` means "no restriction"; an empty list matches nothing.
pub(crate) fn matches_targets(filename: &str, targets: Option<&[String]>) -> bool {
    let Some(targets) = targets else {
        return true;
    };
    targets.iter().any(|t| {
        Pattern::new(t).is_ok_and(|p| p.matches(filename))
            || t.eq_ignore_ascii_case(filename)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_targets_matches_everything() {
        assert!(matches_targets("anything.zip", None));
    }

    #[test]
    fn test_glob_patterns() {
        let targets = vec!["*.zip".to_string(), "patch-?.7z".to_string()];
        assert!(matches_targets("mod.zip", Some(&targets)));
        assert!(matches_targets("patch-2.7z", Some(&targets)));
        assert!(!matches_targets("readme.txt", Some(&targets)));
        assert!(!matches_targets("patch-10.7z", Some(&targets)));
    }

    #[test]
    fn test_exact_name_case_insensitive() {
        let targets = vec!["Mod.ZIP".to_string()];
        assert!(matches_targets("mod.zip", Some(&targets)));
    }

    #[test]
    fn test_empty_target_list_matches_nothing() {
        let targets: Vec<String> = vec![];
        assert!(!matches_targets("mod.zip", Some(&targets)));
    }
}

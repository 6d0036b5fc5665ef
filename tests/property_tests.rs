//! Property-based tests for mirrorsync
//!
//! These tests verify invariants that must hold for all inputs:
//! - Validators never panic
//! - Nothing accepted can be mistaken for an option
//! - Configuration parsing never panics and keeps names unique
//!
//! Run with: cargo test --test property_tests

use proptest::prelude::*;

// ============================================================================
// SOURCE URL VALIDATION
// ============================================================================

mod source_url_tests {
    use super::*;
    use mirrorsync::transfer::validate_source_url;

    proptest! {
        /// Invariant: validation never panics on any string input
        #[test]
        fn never_panics(s in ".*") {
            let _ = validate_source_url(&s);
        }

        /// Invariant: accepted urls never start with '-' and carry no control characters
        #[test]
        fn accepted_is_not_an_option(s in "\\PC{0,80}") {
            if let Ok(url) = validate_source_url(&s) {
                prop_assert!(!url.starts_with('-'));
                prop_assert!(!url.chars().any(|c| c.is_control()));
            }
        }

        /// Invariant: allow-listed schemes with a host are accepted
        #[test]
        fn allowed_schemes_accepted(
            scheme in prop::sample::select(vec!["https", "http", "ssh", "git", "rsync"]),
            host in "[a-z][a-z0-9]{0,15}\\.org",
            path in "[a-z0-9/]{1,30}",
        ) {
            let url = format!("{}://{}/{}", scheme, host, path);
            prop_assert_eq!(validate_source_url(&url).ok(), Some(url.as_str()));
        }

        /// Invariant: leading dashes are always rejected
        #[test]
        fn dash_rejected(rest in "\\PC{0,40}") {
            let url = format!("-{}", rest);
            prop_assert!(validate_source_url(&url).is_err());
        }
    }
}

// ============================================================================
// COMMAND DERIVATION
// ============================================================================

mod command_tests {
    use super::*;
    use mirrorsync::transfer::{derive_command, CommandSpec, SyncMode};
    use mirrorsync::types::RepositoryConfig;

    proptest! {
        /// Invariant: argv containing a NUL byte is never spawnable
        #[test]
        fn nul_rejected(prefix in "[a-z]{0,10}", suffix in "[a-z]{0,10}") {
            let argv = vec!["rsync".to_string(), format!("{}\0{}", prefix, suffix)];
            prop_assert!(CommandSpec::from_argv(&argv).is_err());
        }

        /// Invariant: override argv is passed through verbatim
        #[test]
        fn override_verbatim(args in prop::collection::vec("[a-zA-Z0-9=/._-]{1,20}", 1..8)) {
            let repo = RepositoryConfig::new("r", "https://h/r.git", "/nonexistent/r")
                .with_command(args.clone());
            let plan = derive_command(&repo).unwrap();

            prop_assert_eq!(plan.mode, SyncMode::Override);
            prop_assert_eq!(&plan.command.program, &args[0]);
            prop_assert_eq!(&plan.command.args[..], &args[1..]);
        }

        /// Invariant: a missing target always derives a mirror clone of that url
        #[test]
        fn missing_target_clones(name in "[a-z]{1,12}") {
            let url = format!("https://example.com/{}.git", name);
            let target = format!("/nonexistent/mirrors/{}.git", name);
            let repo = RepositoryConfig::new(name.clone(), url.clone(), target.clone());

            let plan = derive_command(&repo).unwrap();
            prop_assert_eq!(plan.mode, SyncMode::Clone);
            prop_assert_eq!(
                plan.command.args,
                vec!["clone".to_string(), "--mirror".to_string(), "--".to_string(), url, target]
            );
        }
    }
}

// ============================================================================
// CONFIGURATION PARSING
// ============================================================================

mod config_tests {
    use super::*;
    use mirrorsync::config::MirrorConfig;
    use std::collections::HashSet;

    proptest! {
        /// Invariant: parsing never panics on arbitrary input
        #[test]
        fn never_panics(s in "\\PC*") {
            let _ = MirrorConfig::from_json(&s);
        }

        /// Invariant: validated documents have unique names and targets
        #[test]
        fn unique_after_validation(
            entries in prop::collection::vec(("[a-c]", "[x-z]"), 0..12),
            interval in 1u64..100_000,
        ) {
            let repos: Vec<_> = entries
                .iter()
                .map(|(name, target)| serde_json::json!({
                    "name": name,
                    "url": format!("https://h/{}.git", name),
                    "target": format!("/m/{}", target),
                }))
                .collect();
            let doc = serde_json::json!({ "interval_seconds": interval, "repos": repos });

            let config = MirrorConfig::from_json(&doc.to_string()).unwrap();
            prop_assert_eq!(config.interval_seconds, interval);

            let names: HashSet<_> = config.repos.iter().map(|r| &r.name).collect();
            let targets: HashSet<_> = config.repos.iter().map(|r| &r.target_path).collect();
            prop_assert_eq!(names.len(), config.repos.len());
            prop_assert_eq!(targets.len(), config.repos.len());
        }

        /// Invariant: an invalid entry drops only itself, never the document
        #[test]
        fn invalid_entries_are_contained(names in prop::collection::vec("\\PC{0,12}", 0..8)) {
            let repos: Vec<_> = names
                .iter()
                .enumerate()
                .map(|(i, name)| serde_json::json!({
                    "name": name,
                    "url": format!("https://h/{}.git", i),
                    "target": format!("/m/{}", i),
                }))
                .collect();
            let doc = serde_json::json!({ "bandwidth_limit_kbps": 300, "repos": repos });

            let config = MirrorConfig::from_json(&doc.to_string()).unwrap();
            prop_assert_eq!(config.bandwidth_limit_kbps, 300);
            prop_assert!(config.repos.iter().all(|r| names.contains(&r.name)));
        }
    }
}

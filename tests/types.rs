// ABOUTME: Integration tests for type-safe identifiers and validated types.
// ABOUTME: Tests parsing, validation, and type safety properties.

use conveyor::types::*;

mod workload_id_tests {
    use super::*;

    #[test]
    fn valid_ids() {
        assert!(WorkloadId::new("web").is_ok());
        assert!(WorkloadId::new("api-v2").is_ok());
        assert!(WorkloadId::new("a").is_ok());
        assert!(WorkloadId::new("worker-01").is_ok());
    }

    #[test]
    fn rejects_empty() {
        assert!(matches!(WorkloadId::new(""), Err(WorkloadIdError::Empty)));
    }

    #[test]
    fn rejects_too_long() {
        let long = "a".repeat(64);
        assert!(matches!(
            WorkloadId::new(&long),
            Err(WorkloadIdError::TooLong)
        ));
        assert!(WorkloadId::new(&"a".repeat(63)).is_ok());
    }

    #[test]
    fn rejects_leading_or_trailing_hyphen() {
        assert!(matches!(
            WorkloadId::new("-web"),
            Err(WorkloadIdError::StartsWithHyphen)
        ));
        assert!(matches!(
            WorkloadId::new("web-"),
            Err(WorkloadIdError::EndsWithHyphen)
        ));
    }

    #[test]
    fn rejects_uppercase_and_symbols() {
        assert!(matches!(
            WorkloadId::new("Web"),
            Err(WorkloadIdError::NotLowercase)
        ));
        assert!(matches!(
            WorkloadId::new("web_api"),
            Err(WorkloadIdError::InvalidChar('_'))
        ));
        assert!(matches!(
            WorkloadId::new("web/api"),
            Err(WorkloadIdError::InvalidChar('/'))
        ));
    }

    #[test]
    fn deserializes_with_validation() {
        let id: WorkloadId = serde_yaml::from_str("web").unwrap();
        assert_eq!(id.as_str(), "web");
        assert!(serde_yaml::from_str::<WorkloadId>("Not Valid").is_err());
    }
}

mod digest_tests {
    use super::*;

    #[test]
    fn parses_and_normalizes() {
        let digest = Digest::parse("SHA256:ABCDEF0123").unwrap_err();
        assert!(matches!(digest, ArtifactError::InvalidDigest(_)));

        let digest = Digest::parse("sha256:ABCDEF0123").unwrap();
        assert_eq!(digest.as_str(), "sha256:abcdef0123");
        assert_eq!(digest.hex(), "abcdef0123");
    }

    #[test]
    fn short_form_is_twelve_hex_chars() {
        let digest = Digest::parse(&format!("sha256:{}", "9f".repeat(32))).unwrap();
        assert_eq!(digest.short(), "9f9f9f9f9f9f");
        assert_eq!(Digest::parse("sha256:ab").unwrap().short(), "ab");
    }

    #[test]
    fn rejects_malformed() {
        assert!(Digest::parse("").is_err());
        assert!(Digest::parse("sha256").is_err());
        assert!(Digest::parse("sha256:").is_err());
        assert!(Digest::parse(":abcd").is_err());
        assert!(Digest::parse("sha256:xyz").is_err());
    }
}

mod artifact_ref_tests {
    use super::*;

    fn digest(hex: &str) -> Digest {
        Digest::parse(&format!("sha256:{hex}")).unwrap()
    }

    #[test]
    fn accessors_and_display() {
        let artifact = ArtifactRef::new("ghcr.io/org/web", "v1.2.3", digest("aa11")).unwrap();
        assert_eq!(artifact.repository(), "ghcr.io/org/web");
        assert_eq!(artifact.tag(), "v1.2.3");
        assert_eq!(artifact.digest(), &digest("aa11"));
        assert_eq!(artifact.to_string(), "ghcr.io/org/web:v1.2.3@sha256:aa11");
        assert_eq!(artifact.pinned(), "ghcr.io/org/web@sha256:aa11");
    }

    #[test]
    fn same_digest_is_same_artifact() {
        use std::collections::HashSet;

        let a = ArtifactRef::new("ghcr.io/org/web", "main", digest("aa11")).unwrap();
        let b = ArtifactRef::new("ghcr.io/org/web", "0123456", digest("aa11")).unwrap();
        let set: HashSet<_> = [a, b].into_iter().collect();
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn rejects_invalid_repository_and_tag() {
        assert!(matches!(
            ArtifactRef::new("", "v1", digest("aa")),
            Err(ArtifactError::EmptyRepository)
        ));
        assert!(matches!(
            ArtifactRef::new("org web", "v1", digest("aa")),
            Err(ArtifactError::InvalidRepositoryChar(' '))
        ));
        assert!(matches!(
            ArtifactRef::new("org/web", "", digest("aa")),
            Err(ArtifactError::EmptyTag)
        ));
        assert!(matches!(
            ArtifactRef::new("org/web", "feature/x", digest("aa")),
            Err(ArtifactError::InvalidTagChar('/'))
        ));
    }

    #[test]
    fn serde_round_trip_keeps_tag() {
        let artifact = ArtifactRef::new("registry.test/web", "abc1234", digest("ff00")).unwrap();
        let json = serde_json::to_string(&artifact).unwrap();
        let back: ArtifactRef = serde_json::from_str(&json).unwrap();
        assert_eq!(back.tag(), "abc1234");
        assert_eq!(back, artifact);
    }
}

mod revision_tests {
    use super::*;

    #[test]
    fn display_uses_branch_and_short_commit() {
        let revision = Revision::new("0123456789abcdef", "main");
        assert_eq!(revision.to_string(), "main@0123456");
    }
}

mod id_tests {
    use super::*;

    #[test]
    fn run_ids_compare_by_value() {
        let a = RunId::new("run-1");
        let b = RunId::new("run-1");
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "run-1");
        assert_eq!(b.into_inner(), "run-1");
    }

    #[test]
    fn generated_run_ids_are_uuids() {
        let id = RunId::generate();
        assert!(uuid::Uuid::parse_str(id.as_str()).is_ok());
    }

    #[test]
    fn replica_and_run_ids_are_distinct_types() {
        let replica = ReplicaId::new("web-1");
        let run = RunId::new("web-1");
        // Same underlying string, different types; only the strings compare.
        assert_eq!(replica.as_str(), run.as_str());
    }
}

//! Submission tag resolution
//!
//! Maps the raw `--submit` value to the classification attached to the
//! published job. Tags are only honored in project mode.

pub use rai_protocol::SubmissionTag;

/// Resolve a raw tag string.
///
/// Matching is exact and case-sensitive. Anything outside the milestone set
/// is accepted as a custom tag; the empty string means "no tag".
pub fn resolve(raw: &str) -> Option<SubmissionTag> {
    let tag = match raw {
        "" => return None,
        "m1" => SubmissionTag::M1,
        "m2" => SubmissionTag::M2,
        "m3" => SubmissionTag::M3,
        "m4" => SubmissionTag::M4,
        "final" => SubmissionTag::Final,
        custom => {
            tracing::info!(tag = custom, "custom submission tag");
            SubmissionTag::Custom(custom.to_string())
        }
    };
    Some(tag)
}

/// Resolve a tag only when the client runs in project mode.
pub fn resolve_for_mode(raw: Option<&str>, project_mode: bool) -> Option<SubmissionTag> {
    match raw {
        Some(raw) if project_mode => resolve(raw),
        Some(raw) if !raw.is_empty() => {
            tracing::debug!(tag = raw, "ignoring submission tag outside project mode");
            None
        }
        _ => None,
    }
}

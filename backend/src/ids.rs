//! Book references stored on deals and shelf copies are free text because
//! rows imported from the previous datastore wrote them in several shapes.
//! Everything that reads such a reference goes through [`normalize_loose_id`]
//! so the rest of the crate only ever sees a typed id.

use uuid::Uuid;

/// Accepts a canonical hyphenated uuid, a bare 32-character hex uuid, or the
/// wrapped `ObjectId("<uuid>")` form left behind by the import job. Anything
/// else is treated as an unresolvable reference.
pub fn normalize_loose_id(raw: &str) -> Option<Uuid> {
    let trimmed = raw.trim();
    let inner = strip_wrapper(trimmed).unwrap_or(trimmed);
    Uuid::parse_str(inner).ok()
}

fn strip_wrapper(value: &str) -> Option<&str> {
    let inner = value.strip_prefix("ObjectId(")?.strip_suffix(')')?;
    Some(inner.trim_matches(|c| c == '"' || c == '\''))
}

#[cfg(test)]
mod tests {
    use super::*;

    const CANONICAL: &str = "b2f6dfc4-5b2c-4f5a-9e6f-0d9c1a2b3c4d";

    #[test]
    fn accepts_hyphenated_form() {
        assert_eq!(
            normalize_loose_id(CANONICAL),
            Some(Uuid::parse_str(CANONICAL).unwrap())
        );
    }

    #[test]
    fn accepts_simple_form() {
        let simple = CANONICAL.replace('-', "");
        assert_eq!(
            normalize_loose_id(&simple),
            Some(Uuid::parse_str(CANONICAL).unwrap())
        );
    }

    #[test]
    fn accepts_wrapped_form() {
        let wrapped = format!("ObjectId(\"{CANONICAL}\")");
        assert_eq!(
            normalize_loose_id(&wrapped),
            Some(Uuid::parse_str(CANONICAL).unwrap())
        );
    }

    #[test]
    fn accepts_wrapped_simple_form() {
        let wrapped = format!("ObjectId('{}')", CANONICAL.replace('-', ""));
        assert_eq!(
            normalize_loose_id(&wrapped),
            Some(Uuid::parse_str(CANONICAL).unwrap())
        );
    }

    #[test]
    fn trims_surrounding_whitespace() {
        let padded = format!("  {CANONICAL} ");
        assert!(normalize_loose_id(&padded).is_some());
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(normalize_loose_id(""), None);
        assert_eq!(normalize_loose_id("not-an-id"), None);
        assert_eq!(normalize_loose_id("ObjectId()"), None);
        assert_eq!(normalize_loose_id("ObjectId(\"xyz\")"), None);
    }
}

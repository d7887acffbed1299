//! Static registry mapping tag keywords to their attribute rules.

use phf::phf_map;

use crate::ast::TagKind;

pub(crate) struct TagSpec {
    pub kind: TagKind,
    pub required: &'static [&'static str],
    /// Attributes that may contain `${}` expressions.
    pub expressions: &'static [&'static str],
    /// Attributes that must be literal text.
    pub plain: &'static [&'static str],
    /// The body is read verbatim up to the closing tag.
    pub raw_body: bool,
}

impl TagSpec {
    pub(crate) fn allows(&self, attribute: &str) -> bool {
        self.expressions.contains(&attribute) || self.plain.contains(&attribute)
    }

    pub(crate) fn allows_expression(&self, attribute: &str) -> bool {
        self.expressions.contains(&attribute)
    }
}

pub(crate) static TAGS: phf::Map<&'static str, TagSpec> = phf_map! {
    "def" => TagSpec {
        kind: TagKind::Def,
        required: &["name"],
        expressions: &["cache_key"],
        plain: &["name", "buffered", "filter", "cached", "cache_timeout", "cache_type", "cache_region", "cache_enabled"],
        raw_body: false,
    },
    "block" => TagSpec {
        kind: TagKind::Block,
        required: &[],
        expressions: &["cache_key"],
        plain: &["name", "args", "buffered", "filter", "cached", "cache_timeout", "cache_type", "cache_region", "cache_enabled"],
        raw_body: false,
    },
    "namespace" => TagSpec {
        kind: TagKind::Namespace,
        required: &[],
        expressions: &["file"],
        plain: &["name", "module", "import", "inheritable"],
        raw_body: false,
    },
    "include" => TagSpec {
        kind: TagKind::Include,
        required: &["file"],
        expressions: &["file"],
        plain: &["args"],
        raw_body: false,
    },
    "inherit" => TagSpec {
        kind: TagKind::Inherit,
        required: &["file"],
        expressions: &["file"],
        plain: &[],
        raw_body: false,
    },
    "page" => TagSpec {
        kind: TagKind::Page,
        required: &[],
        expressions: &["cache_key"],
        plain: &["args", "expression_filter", "enable_loop", "cached", "cache_timeout", "cache_type", "cache_region", "cache_enabled"],
        raw_body: false,
    },
    "call" => TagSpec {
        kind: TagKind::Call,
        required: &["expr"],
        expressions: &[],
        plain: &["expr", "args"],
        raw_body: false,
    },
    "text" => TagSpec {
        kind: TagKind::Text,
        required: &[],
        expressions: &[],
        plain: &["filter"],
        raw_body: true,
    },
    "doc" => TagSpec {
        kind: TagKind::Doc,
        required: &[],
        expressions: &[],
        plain: &[],
        raw_body: true,
    },
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[ntest::timeout(100)]
    fn test_registry_lookup() {
        let def = TAGS.get("def").unwrap();
        assert_eq!(def.kind, TagKind::Def);
        assert!(def.allows("cached"));
        assert!(def.allows_expression("cache_key"));
        assert!(!def.allows_expression("name"));
        assert!(TAGS.get("foo").is_none());
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_raw_body_tags() {
        assert!(TAGS.get("text").unwrap().raw_body);
        assert!(TAGS.get("doc").unwrap().raw_body);
        assert!(!TAGS.get("call").unwrap().raw_body);
    }
}

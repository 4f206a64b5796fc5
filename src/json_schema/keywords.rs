//! JSON Schema keyword classes and string formats.

/// How the converter treats a schema keyword.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Keyword {
    /// Translated into grammar rules.
    Supported,
    /// Carries no constraint.
    Annotation,
    /// A constraint the grammar cannot express exactly.
    Unsupported,
    /// Not a JSON Schema keyword at all.
    Unknown,
}

pub(super) fn classify(key: &str) -> Keyword {
    match key {
        "type" | "enum" | "const" | "properties" | "required" | "additionalProperties"
        | "minProperties" | "maxProperties" | "items" | "prefixItems" | "additionalItems"
        | "minItems" | "maxItems" | "minLength" | "maxLength" | "pattern" | "format"
        | "minimum" | "maximum" | "exclusiveMinimum" | "exclusiveMaximum" | "$ref" | "$defs"
        | "definitions" | "anyOf" | "oneOf" | "allOf" => Keyword::Supported,

        "title" | "description" | "default" | "examples" | "$schema" | "$id" | "$comment"
        | "$anchor" | "$vocabulary" | "$dynamicAnchor" | "readOnly" | "writeOnly"
        | "deprecated" | "contentEncoding" | "contentMediaType" => Keyword::Annotation,

        "multipleOf" | "uniqueItems" | "not" | "if" | "then" | "else" | "patternProperties"
        | "propertyNames" | "contains" | "minContains" | "maxContains" | "dependencies"
        | "dependentRequired" | "dependentSchemas" | "unevaluatedProperties"
        | "unevaluatedItems" | "$dynamicRef" | "$recursiveRef" | "$recursiveAnchor"
        | "contentSchema" => Keyword::Unsupported,

        // OpenAPI-style vendor extensions.
        key if key.starts_with("x-") => Keyword::Annotation,
        _ => Keyword::Unknown,
    }
}

/// Regex for a string `format`, or `None` when the format is not
/// constrained.
pub(super) fn format_regex(format: &str) -> Option<&'static str> {
    let pattern = match format {
        "date" => r"[0-9]{4}-(0[1-9]|1[0-2])-(0[1-9]|[12][0-9]|3[01])",
        "time" => {
            r"([01][0-9]|2[0-3]):[0-5][0-9]:([0-5][0-9]|60)(\.[0-9]+)?(Z|[+-]([01][0-9]|2[0-3]):[0-5][0-9])"
        }
        "date-time" => {
            r"[0-9]{4}-(0[1-9]|1[0-2])-(0[1-9]|[12][0-9]|3[01])T([01][0-9]|2[0-3]):[0-5][0-9]:([0-5][0-9]|60)(\.[0-9]+)?(Z|[+-]([01][0-9]|2[0-3]):[0-5][0-9])"
        }
        "email" => {
            r"[a-zA-Z0-9.!#$%&'*+/=?^_`{|}~-]+@[a-zA-Z0-9]([a-zA-Z0-9-]*[a-zA-Z0-9])?(\.[a-zA-Z0-9]([a-zA-Z0-9-]*[a-zA-Z0-9])?)*"
        }
        "uuid" => r"[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}",
        "ipv4" => r"((25[0-5]|2[0-4][0-9]|1[0-9][0-9]|[1-9]?[0-9])\.){3}(25[0-5]|2[0-4][0-9]|1[0-9][0-9]|[1-9]?[0-9])",
        "hostname" => {
            r"[a-zA-Z0-9]([a-zA-Z0-9-]*[a-zA-Z0-9])?(\.[a-zA-Z0-9]([a-zA-Z0-9-]*[a-zA-Z0-9])?)*"
        }
        _ => return None,
    };
    Some(pattern)
}

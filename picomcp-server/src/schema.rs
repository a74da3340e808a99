//! Argument checking against the subset of JSON Schema that tool input schemas use.
//!
//! Supported keywords: `required`, `properties`, `type` (a name or a list of names), `enum`,
//! `minimum`, `maximum`, and `additionalProperties: false`.  Anything else in the schema is
//! ignored.  Nested object properties are not descended into.
use itertools::Itertools;
use picomcp_jsonrpc::JsonValue;

/// Check `args` against `schema`, returning a message suitable for an Invalid Params error.
pub fn validate_arguments(schema: &JsonValue, args: &JsonValue) -> Result<(), String> {
    let Some(args) = args.as_object() else {
        return Err(format!("Arguments must be an object, got {}", args.type_name()));
    };

    let required = schema.get("required").map(JsonValue::as_array).unwrap_or_default();
    if let Some(missing) = required
        .iter()
        .map(JsonValue::as_str)
        .find(|name| !name.is_empty() && !args.contains_key(name))
    {
        return Err(format!("Missing required parameter: {missing}"));
    }

    let properties = schema.get("properties").and_then(JsonValue::as_object);
    let closed = matches!(schema.get("additionalProperties"), Some(JsonValue::Bool(false)));

    for (name, value) in args.iter() {
        match properties.and_then(|p| p.get(name)) {
            Some(property) => {
                check_property(property, value).map_err(|reason| format!("Invalid parameter '{name}': {reason}"))?
            }
            None if closed => return Err(format!("Unexpected parameter: {name}")),
            None => {}
        }
    }

    Ok(())
}

fn check_property(property: &JsonValue, value: &JsonValue) -> Result<(), String> {
    match property.get("type") {
        Some(JsonValue::String(expected)) if !matches_type(expected, value) => {
            return Err(format!("expected {expected}, got {}", value.type_name()));
        }
        Some(JsonValue::Array(options))
            if !options.is_empty() && !options.iter().any(|t| matches_type(t.as_str(), value)) =>
        {
            let expected = options.iter().map(JsonValue::as_str).join(" or ");
            return Err(format!("expected {expected}, got {}", value.type_name()));
        }
        _ => {}
    }

    if let Some(JsonValue::Array(allowed)) = property.get("enum") {
        if !allowed.contains(value) {
            let allowed = allowed.iter().map(JsonValue::to_compact_string).join(", ");
            return Err(format!("must be one of {allowed}"));
        }
    }

    if value.is_number() {
        let n = value.as_double();
        if let Some(JsonValue::Number(min)) = property.get("minimum") {
            if n < *min {
                return Err(format!("must be at least {}", JsonValue::Number(*min)));
            }
        }
        if let Some(JsonValue::Number(max)) = property.get("maximum") {
            if n > *max {
                return Err(format!("must be at most {}", JsonValue::Number(*max)));
            }
        }
    }

    Ok(())
}

fn matches_type(expected: &str, value: &JsonValue) -> bool {
    match expected {
        "integer" => value.is_integer(),
        // Unknown type names are not ours to enforce
        "null" | "boolean" | "number" | "string" | "array" | "object" => value.type_name() == expected,
        _ => true,
    }
}

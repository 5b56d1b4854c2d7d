use serde_json::Value;

/// Validate tool arguments against a JSON-schema-shaped descriptor:
/// required-field presence, scalar type matches, and enum membership.
/// Nested object schemas are checked one level at a time as the model
/// only ever sends concrete values.
pub fn validate_args(input_schema: &Value, args: &Value) -> Result<(), String> {
    let Some(args_obj) = args.as_object() else {
        return Err("arguments must be an object".into());
    };

    if let Some(required) = input_schema["required"].as_array() {
        for field in required {
            let Some(name) = field.as_str() else { continue };
            if !args_obj.contains_key(name) {
                return Err(format!("missing required field '{name}'"));
            }
        }
    }

    let Some(properties) = input_schema["properties"].as_object() else {
        return Ok(());
    };

    for (name, value) in args_obj {
        let Some(prop) = properties.get(name) else {
            // Unknown fields pass through; the backend decides what to ignore.
            continue;
        };

        if let Some(expected) = prop["type"].as_str() {
            if !type_matches(expected, value) {
                return Err(format!(
                    "field '{name}' expected {expected}, got {}",
                    type_name(value)
                ));
            }
        }

        if let Some(allowed) = prop["enum"].as_array() {
            if !allowed.contains(value) {
                let options: Vec<String> = allowed.iter().map(Value::to_string).collect();
                return Err(format!(
                    "field '{name}' must be one of [{}], got {value}",
                    options.join(", ")
                ));
            }
        }
    }

    Ok(())
}

fn type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        "null" => value.is_null(),
        _ => true,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "selector": {"type": "string"},
                "count": {"type": "integer"},
                "mode": {"type": "string", "enum": ["fast", "careful"]},
            },
            "required": ["selector"],
        })
    }

    #[test]
    fn accepts_valid_arguments() {
        assert!(validate_args(
            &schema(),
            &json!({"selector": "#a", "count": 2, "mode": "fast"})
        )
        .is_ok());
    }

    #[test]
    fn rejects_missing_required() {
        let err = validate_args(&schema(), &json!({"count": 2})).unwrap_err();
        assert!(err.contains("selector"));
    }

    #[test]
    fn rejects_type_mismatch() {
        let err = validate_args(&schema(), &json!({"selector": 42})).unwrap_err();
        assert!(err.contains("expected string"));

        let err = validate_args(&schema(), &json!({"selector": "#a", "count": 1.5})).unwrap_err();
        assert!(err.contains("expected integer"));
    }

    #[test]
    fn rejects_enum_violation() {
        let err =
            validate_args(&schema(), &json!({"selector": "#a", "mode": "reckless"})).unwrap_err();
        assert!(err.contains("must be one of"));
    }

    #[test]
    fn unknown_fields_pass_through() {
        assert!(validate_args(&schema(), &json!({"selector": "#a", "extra": true})).is_ok());
    }

    #[test]
    fn non_object_arguments_rejected() {
        assert!(validate_args(&schema(), &json!("just a string")).is_err());
    }
}
